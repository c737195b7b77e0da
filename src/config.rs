use std::env;
use std::fmt;
use std::str::FromStr;

use crate::consts::*;
use crate::storage::{Result, StorageError};

/// Settings for the S3 backend. Immutable once handed to [`crate::storage::S3::new`].
#[derive(Clone)]
pub struct S3Config {
    pub region: String,
    /// Named profile from the shared AWS config files. Falls back to the default
    /// credential chain when unset.
    pub profile: Option<String>,
    pub bucket: String,
    /// Canned ACL applied to stored objects, omitted from requests when empty.
    pub acl: String,
    /// Server side encryption mode, e.g. `AES256` or `aws:kms`.
    pub encryption: Option<String>,
    /// Endpoint override for S3 compatible stores.
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub part_size: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_owned(),
            profile: None,
            bucket: String::new(),
            acl: DEFAULT_ACL.to_owned(),
            encryption: None,
            endpoint: None,
            path_style: false,
            access_key: None,
            secret_key: None,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("bucket", &self.bucket)
            .field("acl", &self.acl)
            .field("encryption", &self.encryption)
            .field("endpoint", &self.endpoint)
            .field("path_style", &self.path_style)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl S3Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from `lookup`, which resolves an environment variable name.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let bucket = optional(S3_BUCKET_ENV)
            .ok_or_else(|| StorageError::Configuration(format!("{} not set", S3_BUCKET_ENV)))?;
        let region = optional(S3_REGION_ENV).unwrap_or_else(|| DEFAULT_REGION.to_owned());
        let acl = optional(S3_ACL_ENV).unwrap_or_else(|| DEFAULT_ACL.to_owned());
        let path_style = parse_value(S3_PATH_STYLE_ENV, optional(S3_PATH_STYLE_ENV), false)?;
        let part_size =
            parse_value(S3_PART_SIZE_ENV, optional(S3_PART_SIZE_ENV), DEFAULT_PART_SIZE)?;

        let config = Self {
            region,
            profile: optional(S3_PROFILE_ENV),
            bucket,
            acl,
            encryption: optional(S3_ENCRYPTION_ENV),
            endpoint: optional(S3_ENDPOINT_ENV),
            path_style,
            access_key: optional(S3_ACCESS_KEY_ENV),
            secret_key: optional(S3_SECRET_KEY_ENV),
            part_size,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(StorageError::Configuration("bucket name is empty".to_owned()));
        }
        if self.region.is_empty() {
            return Err(StorageError::Configuration("region is empty".to_owned()));
        }
        // S3 rejects every part but the last one below this size
        if self.part_size < MIN_PART_SIZE {
            return Err(StorageError::Configuration(format!(
                "part size must be at least {} bytes, got {}",
                MIN_PART_SIZE, self.part_size
            )));
        }
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(StorageError::Configuration(
                "access key and secret key must be set together".to_owned(),
            ));
        }

        Ok(())
    }

    /// The encryption mode to attach to uploads, if any. Empty modes count as unset.
    pub fn encryption_mode(&self) -> Option<&str> {
        self.encryption.as_deref().filter(|mode| !mode.is_empty())
    }
}

fn parse_value<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(value) => value.parse().map_err(|_| {
            StorageError::Configuration(format!("{} could not be parsed, got {}", name, value))
        }),
        None => Ok(default),
    }
}
