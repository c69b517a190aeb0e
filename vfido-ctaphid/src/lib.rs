//! Virtual FIDO CTAP HID Transport
//!
//! This crate implements the device side of the CTAP HID protocol for a
//! virtual authenticator:
//! - Packet framing, fragmentation and reassembly of 64-byte HID reports
//! - Channel management (CID allocation, per-channel assembly, timeouts, lock)
//! - Correlation of in-flight requests with their responses, and cancellation
//! - Dispatch of built-in commands and of U2F/CTAP2 requests to processors
//! - A server driving a transport through a bounded outbound queue
//!
//! The crate never installs a `tracing` subscriber; the embedding application
//! decides where logs go.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#usb>

pub mod channel;
pub mod config;
pub mod ctaphid;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod pending;
pub mod server;

// Re-export commonly used types
pub use config::{CtapHidConfig, DeviceVersion};
pub use ctaphid::{Cmd, ErrorCode, InitResponse, Message, Packet};
pub use dispatcher::{CommandProcessor, Dispatcher, Processors, Reply};
pub use error::{Error, Result};
pub use manager::{ChannelManager, Routed};
pub use pending::{RequestKey, ResponseWaiter, WaitOutcome};
pub use server::{CtapHidServer, PacketSink};
