use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rule conflict: {0}")]
    RuleConflict(String),

    #[error("listener bind failed for rule {rule_id} on {addr}: {source}")]
    ListenerBind {
        rule_id: i64,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RelayError>;
