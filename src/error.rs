/// The crate's single error surface. Fallible public operations return
/// `Result<T, MemoryError>`; invariant violations that indicate a bug in this
/// crate (not in the caller) use `debug_assert!`/`unreachable!` instead, per
/// the propagation policy in the spec's error-handling section.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("session json error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("sql backend error: {0}")]
    Sql(#[from] rusqlite::Error),
}
