//! CTAP HID Channel Management
//!
//! Owns the channel table, allocates channel IDs, routes raw reports to the
//! channel they are addressed to, and tracks pending requests.
//!
//! The broadcast channel (0xFFFFFFFF) always exists and is used for INIT
//! commands to allocate new channels. Data channels are numbered from 1 and
//! never reused while the manager lives.

use crate::channel::Channel;
use crate::config::CtapHidConfig;
use crate::ctaphid::{
    BROADCAST_CID, CAPABILITY_CBOR, CAPABILITY_WINK, CTAPHID_PROTOCOL_VERSION, ErrorCode,
    INIT_NONCE_SIZE, InitResponse, Message, PACKET_SIZE, Packet,
};
use crate::error::{Error, Result};
use crate::pending::{PendingRequests, RequestKey, ResponseWaiter};

use spin::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Smallest report that still carries a channel ID and a command/sequence byte
const MIN_REPORT_SIZE: usize = 5;

/// Exclusive channel lock placed with CTAPHID_LOCK
#[derive(Debug, Clone, Copy)]
struct ChannelLock {
    cid: u32,
    until: Instant,
}

#[derive(Debug)]
struct Table {
    channels: HashMap<u32, Channel>,

    /// Channels with a message in progress, the only ones a sweep visits
    assembling: HashSet<u32>,

    /// Next CID to allocate; reaching `BROADCAST_CID` means IDs are exhausted
    next_cid: u32,

    lock: Option<ChannelLock>,
}

/// Outcome of routing one raw report
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Routed {
    /// Error packets to send back, in order
    pub errors: Vec<Packet>,

    /// Message completed by this report
    pub message: Option<Message>,
}

/// Channel manager for CTAP HID
///
/// Manages multiple concurrent channels, each with independent message
/// assembly, and the correlation of in-flight requests with their responses.
pub struct ChannelManager {
    table: Mutex<Table>,
    pending: PendingRequests,
    next_request_id: AtomicU64,
    config: CtapHidConfig,
    capabilities: u8,
}

impl ChannelManager {
    /// Create a channel manager with default configuration
    pub fn new() -> Self {
        Self::with_config(CtapHidConfig::default(), CAPABILITY_WINK | CAPABILITY_CBOR)
    }

    /// Create a channel manager
    ///
    /// `capabilities` is reported in every INIT response.
    pub fn with_config(config: CtapHidConfig, capabilities: u8) -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            BROADCAST_CID,
            Channel::new(BROADCAST_CID, config.assembly_timeout),
        );

        Self {
            table: Mutex::new(Table {
                channels,
                assembling: HashSet::new(),
                next_cid: 1,
                lock: None,
            }),
            pending: PendingRequests::new(),
            next_request_id: AtomicU64::new(1),
            config,
            capabilities,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &CtapHidConfig {
        &self.config
    }

    /// Capability flags reported in INIT responses
    pub fn capabilities(&self) -> u8 {
        self.capabilities
    }

    /// Allocate a new channel and build the INIT response for it
    pub fn allocate_channel(&self, nonce: [u8; INIT_NONCE_SIZE]) -> Result<InitResponse> {
        let mut table = self.table.lock();

        let cid = table.next_cid;
        if cid == BROADCAST_CID {
            return Err(Error::ChannelExhausted);
        }
        table.next_cid += 1;
        table
            .channels
            .insert(cid, Channel::new(cid, self.config.assembly_timeout));
        drop(table);

        debug!(cid = format_args!("{:#010x}", cid), "allocated channel");

        let version = self.config.device_version;
        Ok(InitResponse {
            nonce,
            cid,
            protocol_version: CTAPHID_PROTOCOL_VERSION,
            version_major: version.major,
            version_minor: version.minor,
            version_build: version.build,
            capabilities: self.capabilities,
        })
    }

    /// Route one raw report to its channel
    ///
    /// Never fails: malformed reports, unknown channels and framing errors are
    /// turned into ERROR packets addressed to the offending channel.
    pub fn route_message(&self, report: &[u8]) -> Routed {
        self.route_message_at(report, Instant::now())
    }

    pub(crate) fn route_message_at(&self, report: &[u8], now: Instant) -> Routed {
        let packet = match normalize_report(report) {
            Ok(packet) => packet,
            Err((cid, code)) => {
                warn!(
                    cid = format_args!("{:#010x}", cid),
                    len = report.len(),
                    "rejecting malformed report"
                );
                return Routed {
                    errors: vec![Packet::new_error(cid, code)],
                    message: None,
                };
            }
        };
        let cid = packet.cid();

        let mut table = self.table.lock();
        let table = &mut *table;
        let mut errors = sweep(table, now);

        let Some(channel) = table.channels.get_mut(&cid) else {
            warn!(cid = format_args!("{:#010x}", cid), "packet for unknown channel");
            errors.push(Packet::new_error(cid, ErrorCode::InvalidChannel));
            return Routed {
                errors,
                message: None,
            };
        };

        if let Some(holder) = table.lock.map(|lock| lock.cid).filter(|&holder| holder != cid) {
            trace!(
                cid = format_args!("{:#010x}", cid),
                holder = format_args!("{:#010x}", holder),
                "channel locked by another channel"
            );
            errors.push(Packet::new_error(cid, ErrorCode::ChannelBusy));
            return Routed {
                errors,
                message: None,
            };
        }

        let step = channel.handle_packet(&packet, now);
        if channel.is_assembling() {
            table.assembling.insert(cid);
        } else {
            table.assembling.remove(&cid);
        }

        if step.aborted.is_some() {
            errors.push(Packet::new_error(cid, ErrorCode::InvalidSeq));
        }

        match step.result {
            Ok(message) => {
                if let Some(message) = &message {
                    debug!(
                        cid = format_args!("{:#010x}", cid),
                        cmd = ?message.cmd,
                        len = message.data.len(),
                        "message complete"
                    );
                }
                Routed { errors, message }
            }
            Err(e) => {
                warn!(cid = format_args!("{:#010x}", cid), error = %e, "framing error");
                errors.push(Packet::new_error(cid, e.error_code()));
                Routed {
                    errors,
                    message: None,
                }
            }
        }
    }

    /// Discard assemblies that exceeded the timeout
    ///
    /// Returns one `MessageTimeout` error packet per discarded message.
    pub fn expire_stale(&self) -> Vec<Packet> {
        self.expire_stale_at(Instant::now())
    }

    pub(crate) fn expire_stale_at(&self, now: Instant) -> Vec<Packet> {
        sweep(&mut self.table.lock(), now)
    }

    /// Place, extend or release (`seconds == 0`) the exclusive channel lock
    pub fn set_lock(&self, cid: u32, seconds: u8) -> Result<()> {
        self.set_lock_at(cid, seconds, Instant::now())
    }

    pub(crate) fn set_lock_at(&self, cid: u32, seconds: u8, now: Instant) -> Result<()> {
        if seconds > self.config.max_lock_seconds {
            return Err(Error::InvalidParameter);
        }

        let mut table = self.table.lock();
        if table
            .lock
            .is_some_and(|lock| lock.cid != cid && lock.until > now)
        {
            return Err(Error::ChannelBusy);
        }

        table.lock = if seconds == 0 {
            None
        } else {
            Some(ChannelLock {
                cid,
                until: now + Duration::from_secs(u64::from(seconds)),
            })
        };
        Ok(())
    }

    /// Channel currently holding the exclusive lock
    pub fn lock_holder(&self) -> Option<u32> {
        let now = Instant::now();
        self.table
            .lock()
            .lock
            .filter(|lock| lock.until > now)
            .map(|lock| lock.cid)
    }

    /// Start a request on `cid`, returning the waiter for its response
    ///
    /// Only one request per channel may be in flight; a second one fails
    /// with [`Error::ChannelBusy`].
    pub fn begin_request(&self, cid: u32) -> Result<ResponseWaiter> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .register_exclusive(RequestKey::new(cid, request_id))
    }

    /// Register a waiter for an explicit correlation key
    pub fn wait_for_response(&self, key: RequestKey) -> Result<ResponseWaiter> {
        self.pending.register(key)
    }

    /// Whether the request for `key` is still awaiting its response
    pub fn is_pending(&self, key: RequestKey) -> bool {
        self.pending.contains(key)
    }

    /// Hand response packets to the waiter for `key`
    pub fn deliver_response(&self, key: RequestKey, packets: Vec<Packet>) -> bool {
        self.pending.deliver(key, packets)
    }

    /// Cancel the waiter for `key`
    pub fn cancel(&self, key: RequestKey) -> bool {
        self.pending.cancel(key)
    }

    /// Cancel every request in flight on `cid`
    pub fn cancel_channel(&self, cid: u32) -> usize {
        self.pending.cancel_channel(cid).len()
    }

    /// Cancel every request in flight
    pub fn cancel_all(&self) -> usize {
        self.pending.cancel_all()
    }

    /// Number of channels, including the broadcast channel
    pub fn active_channels(&self) -> usize {
        self.table.lock().channels.len()
    }

    /// Number of channels with a message in progress
    pub fn assembling_channels(&self) -> usize {
        self.table.lock().assembling.len()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate raw report size, zero padding short reports
///
/// On failure returns the channel to address the error to and its code.
fn normalize_report(report: &[u8]) -> std::result::Result<Packet, (u32, ErrorCode)> {
    let cid = match report.get(..4) {
        Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => BROADCAST_CID,
    };

    if report.is_empty() {
        return Err((BROADCAST_CID, ErrorCode::Other));
    }
    if report.len() < MIN_REPORT_SIZE || report.len() > PACKET_SIZE {
        return Err((cid, ErrorCode::InvalidLen));
    }

    let mut data = [0u8; PACKET_SIZE];
    data[..report.len()].copy_from_slice(report);
    Ok(Packet::from_bytes(data))
}

fn sweep(table: &mut Table, now: Instant) -> Vec<Packet> {
    if table.lock.is_some_and(|lock| lock.until <= now) {
        debug!("channel lock expired");
        table.lock = None;
    }

    let Table {
        channels,
        assembling,
        ..
    } = table;

    let mut errors = Vec::new();
    assembling.retain(|cid| {
        let Some(channel) = channels.get_mut(cid) else {
            return false;
        };
        match channel.expire(now) {
            Some(header) => {
                warn!(stale = %header, "message assembly timed out");
                errors.push(Packet::new_error(*cid, ErrorCode::MsgTimeout));
                false
            }
            None => true,
        }
    });
    errors
}
