//! CTAP-HID engine error types

use crate::ctaphid::ErrorCode;

use thiserror::Error;

/// CTAP-HID engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// CTAP-HID engine errors
///
/// Protocol-level variants map one-to-one onto the CTAPHID error codes sent
/// back to the peer, see [`Error::error_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Packet could not be parsed as a CTAP-HID frame
    #[error("Invalid packet format")]
    InvalidPacket,

    /// Channel ID is not allocated
    #[error("Invalid channel ID")]
    InvalidChannel,

    /// Command is not valid on this channel
    #[error("Invalid command")]
    InvalidCommand,

    /// Command parameter out of range
    #[error("Invalid parameter")]
    InvalidParameter,

    /// Raw report or declared payload length is invalid
    #[error("Invalid length")]
    InvalidLength,

    /// Continuation packet out of sequence
    #[error("Invalid sequence number")]
    InvalidSequence,

    /// Message exceeds the maximum CTAP-HID message size
    #[error("Message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Message assembly did not complete in time
    #[error("Timeout waiting for message")]
    Timeout,

    /// Channel is busy with another transaction or locked by another channel
    #[error("Channel busy")]
    ChannelBusy,

    /// Command requires a channel lock
    #[error("Channel lock required")]
    LockRequired,

    /// No more channel IDs can be allocated
    #[error("Channel IDs exhausted")]
    ChannelExhausted,

    /// Pending request was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Outbound queue has been closed
    #[error("Outbound queue closed")]
    QueueClosed,

    /// Command processor failed
    #[error("Processor error: {0}")]
    Processor(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// CTAPHID error code reported to the peer for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidChannel => ErrorCode::InvalidChannel,
            Error::InvalidCommand => ErrorCode::InvalidCmd,
            Error::InvalidParameter => ErrorCode::InvalidPar,
            Error::InvalidPacket | Error::InvalidLength | Error::MessageTooLarge { .. } => {
                ErrorCode::InvalidLen
            }
            Error::InvalidSequence => ErrorCode::InvalidSeq,
            Error::Timeout => ErrorCode::MsgTimeout,
            Error::ChannelBusy => ErrorCode::ChannelBusy,
            Error::LockRequired => ErrorCode::LockRequired,
            Error::ChannelExhausted
            | Error::Cancelled
            | Error::QueueClosed
            | Error::Processor(_)
            | Error::Io(_) => ErrorCode::Other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidChannel.error_code(), ErrorCode::InvalidChannel);
        assert_eq!(Error::InvalidCommand.error_code(), ErrorCode::InvalidCmd);
        assert_eq!(Error::InvalidParameter.error_code(), ErrorCode::InvalidPar);
        assert_eq!(Error::InvalidSequence.error_code(), ErrorCode::InvalidSeq);
        assert_eq!(Error::Timeout.error_code(), ErrorCode::MsgTimeout);
        assert_eq!(
            Error::MessageTooLarge { size: 8000, max: 7609 }.error_code(),
            ErrorCode::InvalidLen
        );
        assert_eq!(
            Error::Processor("boom".to_string()).error_code(),
            ErrorCode::Other
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::MessageTooLarge { size: 8000, max: 7609 }.to_string(),
            "Message too large (8000 bytes, max 7609)"
        );
        let io = std::io::Error::other("pipe closed");
        assert_eq!(Error::from(io).to_string(), "I/O error: pipe closed");
    }
}
