use thiserror::Error;

#[derive(Error, Debug)]
pub enum HyperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("task exceeded walltime limit ({0})")]
    TaskTimeout(uuid::Uuid),

    #[error("launcher error: {0}")]
    Launcher(String),

    #[error("interrupted")]
    Interrupted,

    #[error("timeout")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for HyperError {
    fn from(err: serde_json::Error) -> Self {
        HyperError::Protocol(err.to_string())
    }
}

impl HyperError {
    /// Process exit code for this error kind (0 success, 2 usage is owned by clap).
    pub fn exit_code(&self) -> i32 {
        match self {
            HyperError::Config(_) => 2,
            HyperError::Auth(_) => 3,
            HyperError::Launcher(_) => 4,
            HyperError::Database(_) => 5,
            HyperError::Interrupted => 6,
            HyperError::Timeout => 7,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, HyperError>;
