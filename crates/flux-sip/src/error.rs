use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Transaction timeout: {0}")]
    Timeout(String),

    #[error("Response has no destination")]
    NoDestination,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SipError {
    pub fn parse(msg: impl Into<String>) -> Self {
        SipError::Parse(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SipError>;
