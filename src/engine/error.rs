#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An insert (explicit or upsert fallback) hit an existing `_id`.
    DuplicateKey { collection: String, id: String },
    MalformedQuery(String),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::DuplicateKey { collection, id } => {
                write!(f, "duplicate key in {collection}: _id {id}")
            }
            EngineError::MalformedQuery(msg) => write!(f, "malformed query: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

pub(crate) fn malformed(msg: impl Into<String>) -> EngineError {
    EngineError::MalformedQuery(msg.into())
}
