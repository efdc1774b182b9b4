use crate::store::StoreError;
use flux_sip::SipError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Media relay error: {0}")]
    Relay(String),

    #[error("Device not registered: {0}")]
    NotRegistered(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
