//! CTAP HID Packet Codec
//!
//! Implements CTAP over 64-byte HID reports with message fragmentation and reassembly.
//!
//! Packet Format:
//! - Initialization packet: CID(4, LE) + CMD(1) + BCNT(2, BE) + DATA(57)
//! - Continuation packet: CID(4, LE) + SEQ(1) + DATA(59)
//!
//! The channel ID is serialized little-endian everywhere it appears, including
//! inside the INIT response payload, so clients can copy it back verbatim.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#usb-hid-framing>

use crate::error::{Error, Result};

use std::fmt;

/// HID packet size (fixed at 64 bytes)
pub const PACKET_SIZE: usize = 64;

/// Maximum CTAP-HID message size (57 + 128 * 59 = 7609 bytes)
pub const MAX_MESSAGE_SIZE: usize = INIT_PACKET_DATA_SIZE + MAX_CONT_PACKETS * CONT_PACKET_DATA_SIZE;

/// Broadcast channel ID (used for INIT and device-wide PING)
pub const BROADCAST_CID: u32 = 0xFFFFFFFF;

/// Initial packet payload size (64 - 4 CID - 1 CMD - 2 BCNT = 57 bytes)
pub const INIT_PACKET_DATA_SIZE: usize = 57;

/// Continuation packet payload size (64 - 4 CID - 1 SEQ = 59 bytes)
pub const CONT_PACKET_DATA_SIZE: usize = 59;

/// Sequence numbers run from 0 to 127
const MAX_CONT_PACKETS: usize = 128;

/// Length of the INIT nonce
pub const INIT_NONCE_SIZE: usize = 8;

/// Length of the INIT response payload
pub const INIT_RESPONSE_SIZE: usize = 17;

/// CTAPHID protocol version reported in INIT responses
pub const CTAPHID_PROTOCOL_VERSION: u8 = 2;

/// Device supports WINK
pub const CAPABILITY_WINK: u8 = 0x01;

/// Device supports CTAPHID_CBOR
pub const CAPABILITY_CBOR: u8 = 0x04;

/// Device does not support CTAPHID_MSG
pub const CAPABILITY_NMSG: u8 = 0x08;

/// CTAP HID commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// Transaction that echoes the data back
    Ping = 0x01,

    /// Encapsulated CTAP1/U2F message
    Msg = 0x03,

    /// Place an exclusive lock for one channel
    Lock = 0x04,

    /// Allocate a new CID
    Init = 0x06,

    /// Request authenticator to provide visual/audible identification
    Wink = 0x08,

    /// Encapsulated CTAP CBOR encoded message
    Cbor = 0x10,

    /// Cancel any outstanding requests on the given CID
    Cancel = 0x11,

    /// The request is still being processed
    Keepalive = 0x3B,

    /// Error response message
    Error = 0x3F,
}

impl Cmd {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x7F {
            // Mask off the TYPE bit
            0x01 => Some(Cmd::Ping),
            0x03 => Some(Cmd::Msg),
            0x04 => Some(Cmd::Lock),
            0x06 => Some(Cmd::Init),
            0x08 => Some(Cmd::Wink),
            0x10 => Some(Cmd::Cbor),
            0x11 => Some(Cmd::Cancel),
            0x3B => Some(Cmd::Keepalive),
            0x3F => Some(Cmd::Error),
            _ => None,
        }
    }

    /// Convert to u8 value with TYPE bit set (0x80 for initialization packet)
    pub fn to_u8_init(self) -> u8 {
        (self as u8) | 0x80
    }

    /// Convert to u8 value
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// CTAP HID error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Invalid command
    InvalidCmd = 0x01,

    /// Invalid parameter
    InvalidPar = 0x02,

    /// Invalid message length
    InvalidLen = 0x03,

    /// Invalid message sequencing
    InvalidSeq = 0x04,

    /// Message has timed out
    MsgTimeout = 0x05,

    /// Channel busy
    ChannelBusy = 0x06,

    /// Command requires channel lock
    LockRequired = 0x0A,

    /// CID invalid
    InvalidChannel = 0x0B,

    /// Other unspecified error
    Other = 0x7F,
}

impl ErrorCode {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ErrorCode::InvalidCmd),
            0x02 => Some(ErrorCode::InvalidPar),
            0x03 => Some(ErrorCode::InvalidLen),
            0x04 => Some(ErrorCode::InvalidSeq),
            0x05 => Some(ErrorCode::MsgTimeout),
            0x06 => Some(ErrorCode::ChannelBusy),
            0x0A => Some(ErrorCode::LockRequired),
            0x0B => Some(ErrorCode::InvalidChannel),
            0x7F => Some(ErrorCode::Other),
            _ => None,
        }
    }

    /// Convert to u8 value
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Header of an initialization packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Channel ID
    pub cid: u32,

    /// Command
    pub cmd: Cmd,

    /// Total payload length declared for the whole message
    pub payload_len: u16,
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cid == BROADCAST_CID {
            write!(f, "{:?} on broadcast channel ({} bytes)", self.cmd, self.payload_len)
        } else {
            write!(
                f,
                "{:?} on channel {:#010x} ({} bytes)",
                self.cmd, self.cid, self.payload_len
            )
        }
    }
}

/// Decoded continuation packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationHeader<'a> {
    /// Channel ID
    pub cid: u32,

    /// Sequence number (0..=127)
    pub seq: u8,

    /// Payload chunk (always 59 bytes, zero padded)
    pub chunk: &'a [u8],
}

/// A single 64-byte HID packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: [u8; PACKET_SIZE],
}

impl Packet {
    /// Create a new packet from raw data
    pub fn from_bytes(data: [u8; PACKET_SIZE]) -> Self {
        Self { data }
    }

    /// Create a new packet from a slice (must be exactly 64 bytes)
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() != PACKET_SIZE {
            return Err(Error::InvalidLength);
        }
        let mut packet_data = [0u8; PACKET_SIZE];
        packet_data.copy_from_slice(data);
        Ok(Self { data: packet_data })
    }

    /// Get raw packet data
    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.data
    }

    /// Get channel ID
    pub fn cid(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Check if this is an initialization packet
    pub fn is_init(&self) -> bool {
        (self.data[4] & 0x80) != 0
    }

    /// Get command (only valid for initialization packets)
    pub fn cmd(&self) -> Option<Cmd> {
        if !self.is_init() {
            return None;
        }
        Cmd::from_u8(self.data[4])
    }

    /// Get payload length (only valid for initialization packets)
    pub fn payload_len(&self) -> Option<u16> {
        if !self.is_init() {
            return None;
        }
        Some(u16::from_be_bytes([self.data[5], self.data[6]]))
    }

    /// Get sequence number (only valid for continuation packets)
    pub fn seq(&self) -> Option<u8> {
        if self.is_init() {
            return None;
        }
        Some(self.data[4])
    }

    /// Get payload data
    pub fn payload(&self) -> &[u8] {
        if self.is_init() {
            &self.data[7..]
        } else {
            &self.data[5..]
        }
    }

    /// Create an error packet
    pub fn new_error(cid: u32, error_code: ErrorCode) -> Self {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0..4].copy_from_slice(&cid.to_le_bytes());
        packet[4] = Cmd::Error.to_u8_init();
        packet[5..7].copy_from_slice(&1u16.to_be_bytes()); // Length = 1
        packet[7] = error_code.to_u8();

        Packet::from_bytes(packet)
    }

    /// Error code carried by an ERROR packet
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.cmd() != Some(Cmd::Error) {
            return None;
        }
        ErrorCode::from_u8(self.data[7])
    }
}

/// Split a message into its initialization and continuation packets.
///
/// Always produces at least one packet: an empty payload is encoded as a
/// single initialization packet declaring length 0.
pub fn encode(cid: u32, cmd: Cmd, payload: &[u8]) -> Result<Vec<Packet>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut packets = Vec::with_capacity(packet_count(payload.len()));
    let total_len = payload.len() as u16;

    let mut init_packet = [0u8; PACKET_SIZE];
    init_packet[0..4].copy_from_slice(&cid.to_le_bytes());
    init_packet[4] = cmd.to_u8_init();
    init_packet[5..7].copy_from_slice(&total_len.to_be_bytes());

    let init_data_len = std::cmp::min(payload.len(), INIT_PACKET_DATA_SIZE);
    init_packet[7..7 + init_data_len].copy_from_slice(&payload[..init_data_len]);
    packets.push(Packet::from_bytes(init_packet));

    for (seq, chunk) in payload[init_data_len..]
        .chunks(CONT_PACKET_DATA_SIZE)
        .enumerate()
    {
        let mut cont_packet = [0u8; PACKET_SIZE];
        cont_packet[0..4].copy_from_slice(&cid.to_le_bytes());
        // Bounded by MAX_MESSAGE_SIZE above
        cont_packet[4] = seq as u8;
        cont_packet[5..5 + chunk.len()].copy_from_slice(chunk);
        packets.push(Packet::from_bytes(cont_packet));
    }

    Ok(packets)
}

/// Number of packets needed to carry a payload of `len` bytes
pub fn packet_count(len: usize) -> usize {
    if len <= INIT_PACKET_DATA_SIZE {
        1
    } else {
        1 + (len - INIT_PACKET_DATA_SIZE).div_ceil(CONT_PACKET_DATA_SIZE)
    }
}

/// Parse the header of an initialization packet
pub fn decode_header(packet: &Packet) -> Result<MessageHeader> {
    if !packet.is_init() {
        return Err(Error::InvalidPacket);
    }
    let cmd = packet.cmd().ok_or(Error::InvalidCommand)?;
    let payload_len = packet.payload_len().ok_or(Error::InvalidPacket)?;

    Ok(MessageHeader {
        cid: packet.cid(),
        cmd,
        payload_len,
    })
}

/// Parse a continuation packet
pub fn decode_continuation(packet: &Packet) -> Result<ContinuationHeader<'_>> {
    let seq = packet.seq().ok_or(Error::InvalidPacket)?;

    Ok(ContinuationHeader {
        cid: packet.cid(),
        seq,
        chunk: packet.payload(),
    })
}

/// A complete CTAP message (reassembled from packets)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel ID
    pub cid: u32,

    /// Command
    pub cmd: Cmd,

    /// Payload data
    pub data: Vec<u8>,
}

impl Message {
    /// Create a new message
    pub fn new(cid: u32, cmd: Cmd, data: Vec<u8>) -> Self {
        Self { cid, cmd, data }
    }

    /// Fragment this message into HID packets
    pub fn to_packets(&self) -> Result<Vec<Packet>> {
        encode(self.cid, self.cmd, &self.data)
    }

    /// Reassemble a message from HID packets
    pub fn from_packets(packets: &[Packet]) -> Result<Self> {
        let init_packet = packets.first().ok_or(Error::InvalidPacket)?;
        let header = decode_header(init_packet)?;
        let total_len = header.payload_len as usize;

        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidLength);
        }

        let mut data = Vec::with_capacity(total_len);

        let init_data_len = std::cmp::min(total_len, INIT_PACKET_DATA_SIZE);
        data.extend_from_slice(&init_packet.payload()[..init_data_len]);

        let mut remaining = total_len - init_data_len;

        for (expected_seq, packet) in packets[1..].iter().enumerate() {
            if remaining == 0 {
                break;
            }

            let cont = decode_continuation(packet).map_err(|_| Error::InvalidSequence)?;
            if cont.cid != header.cid {
                return Err(Error::InvalidChannel);
            }
            if cont.seq as usize != expected_seq {
                return Err(Error::InvalidSequence);
            }

            let cont_data_len = std::cmp::min(remaining, CONT_PACKET_DATA_SIZE);
            data.extend_from_slice(&cont.chunk[..cont_data_len]);
            remaining -= cont_data_len;
        }

        if remaining != 0 {
            return Err(Error::InvalidLength);
        }

        Ok(Message {
            cid: header.cid,
            cmd: header.cmd,
            data,
        })
    }
}

/// Payload of a CTAPHID_INIT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResponse {
    /// Nonce echoed from the request
    pub nonce: [u8; INIT_NONCE_SIZE],

    /// Newly allocated channel ID
    pub cid: u32,

    /// CTAPHID protocol version
    pub protocol_version: u8,

    /// Major device version
    pub version_major: u8,

    /// Minor device version
    pub version_minor: u8,

    /// Build device version
    pub version_build: u8,

    /// Capability flags
    pub capabilities: u8,
}

impl InitResponse {
    /// Serialize to the 17-byte wire format
    pub fn to_bytes(&self) -> [u8; INIT_RESPONSE_SIZE] {
        let mut out = [0u8; INIT_RESPONSE_SIZE];
        out[0..8].copy_from_slice(&self.nonce);
        out[8..12].copy_from_slice(&self.cid.to_le_bytes());
        out[12] = self.protocol_version;
        out[13] = self.version_major;
        out[14] = self.version_minor;
        out[15] = self.version_build;
        out[16] = self.capabilities;
        out
    }

    /// Parse the 17-byte wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INIT_RESPONSE_SIZE {
            return Err(Error::InvalidLength);
        }
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        nonce.copy_from_slice(&data[0..8]);

        Ok(Self {
            nonce,
            cid: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            protocol_version: data[12],
            version_major: data[13],
            version_minor: data[14],
            version_build: data[15],
            capabilities: data[16],
        })
    }
}
