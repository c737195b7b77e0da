// s3 defaults
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_ACL: &str = "private";
// smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: usize = MIN_PART_SIZE;

// s3 environment variables
pub const S3_BUCKET_ENV: &str = "S3_BUCKET";
pub const S3_REGION_ENV: &str = "S3_REGION";
pub const S3_PROFILE_ENV: &str = "S3_PROFILE";
pub const S3_ACL_ENV: &str = "S3_ACL";
pub const S3_ENCRYPTION_ENV: &str = "S3_ENCRYPTION";
pub const S3_ENDPOINT_ENV: &str = "S3_ENDPOINT";
pub const S3_PATH_STYLE_ENV: &str = "S3_PATH_STYLE";
pub const S3_ACCESS_KEY_ENV: &str = "S3_ACCESS_KEY";
pub const S3_SECRET_KEY_ENV: &str = "S3_SECRET_KEY";
pub const S3_PART_SIZE_ENV: &str = "S3_PART_SIZE";
