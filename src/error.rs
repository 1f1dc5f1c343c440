use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KpackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No Payload folder was found in the archive")]
    PayloadNotFound,

    #[error("Invalid app bundle: {0}")]
    InvalidAppBundle(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: bad key or corrupted data")]
    DecryptionFailed,

    #[error("Invalid or corrupted ksign container")]
    InvalidContainer,

    #[error("Missing field in credential payload: {0}")]
    MissingField(&'static str),

    #[error("Invalid certificate password")]
    InvalidPassword,

    #[error("Mach-O manipulation error: {0}")]
    MachO(String),

    #[error("Signing error: {0}")]
    Sign(String),
}

pub type Result<T> = std::result::Result<T, KpackError>;
