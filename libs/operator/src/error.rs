use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}: {1}")]
    ClusterError(String, #[source] Box<kube::Error>),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("{0}: {1}")]
    DatabaseError(String, #[source] Box<sqlx::Error>),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),
}

impl Error {
    pub fn cluster(context: impl Into<String>, source: kube::Error) -> Self {
        Error::ClusterError(context.into(), Box::new(source))
    }

    pub fn db(context: impl Into<String>, source: sqlx::Error) -> Self {
        Error::DatabaseError(context.into(), Box::new(source))
    }
}

impl From<portal_k8s_util::error::Error> for Error {
    fn from(err: portal_k8s_util::error::Error) -> Self {
        Error::DependencyUnavailable(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
