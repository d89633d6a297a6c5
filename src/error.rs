use crate::{dialog::DialogId, transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(#[from] rsip::Error),

    #[error("transport error: {0}: {1}")]
    TransportError(String, SipAddr),

    #[error("transaction error: {0}: {1}")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0}: {1}")]
    DialogError(String, DialogId),

    #[error("call error: {0}")]
    CallError(String),

    #[error("invalid {0}")]
    Invalid(&'static str),

    #[error("too many calls")]
    TooManyCalls,

    #[error("service not started")]
    ServiceNotStarted,

    #[error("flow failed")]
    FlowFailed,

    #[error("invalid flow token")]
    InvalidFlowToken,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("error: {0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
