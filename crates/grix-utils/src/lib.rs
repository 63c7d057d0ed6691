pub mod lockfile;
pub mod tempfile;

pub use error::UtilError;

pub type Result<T> = std::result::Result<T, UtilError>;

mod error {
    use std::path::PathBuf;

    /// Base error type for grix-utils operations.
    #[derive(Debug, thiserror::Error)]
    pub enum UtilError {
        #[error("unable to create lock file '{path}': already locked")]
        AlreadyLocked { path: PathBuf },

        #[error("unable to create lock file '{path}': {source}")]
        LockCreate {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },

        #[error("unable to commit lock file '{path}': {source}")]
        LockCommit {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}
