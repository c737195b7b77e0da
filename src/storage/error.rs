use quick_error::quick_error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

quick_error! {
    #[derive(Debug)]
    pub enum StorageError {
        Configuration(message: String) {
            display("configuration error, {}", message)
        }
        NotFound(key: String) {
            display("object not found, {}", key)
        }
        Transfer(context: &'static str, err: BoxError) {
            display("{}, {}", context, err)
            source(&**err)
        }
        Cancelled(context: &'static str) {
            display("{}, operation cancelled", context)
        }
    }
}

impl StorageError {
    pub fn transfer<E>(context: &'static str, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StorageError::Transfer(context, err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
