//! CTAP HID Command Dispatcher
//!
//! Routes completed messages either to the protocol-level commands handled by
//! the transport itself (INIT, PING, WINK, LOCK, CANCEL) or to the U2F and
//! CTAP2 command processors.
//!
//! Processor calls run on a worker thread so that the reader keeps consuming
//! reports while a request is in flight; this is what lets CTAPHID_CANCEL
//! reach a request that is waiting for user presence.

use crate::ctaphid::{
    BROADCAST_CID, CAPABILITY_CBOR, CAPABILITY_NMSG, CAPABILITY_WINK, Cmd, INIT_NONCE_SIZE,
    Message, Packet, encode,
};
use crate::error::{Error, Result};
use crate::manager::ChannelManager;
use crate::pending::{RequestKey, ResponseWaiter, WaitOutcome};

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

/// CTAP2 status returned for a CBOR request aborted by CTAPHID_CANCEL
pub const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2D;

/// Trait for processing encapsulated U2F or CTAP2 requests
///
/// Implement this trait to execute authenticator commands. The processor
/// receives the reassembled request payload and returns the response payload.
pub trait CommandProcessor: Send {
    /// Process one request
    fn process(&mut self, request: &[u8]) -> Result<Vec<u8>>;
}

impl<F> CommandProcessor for F
where
    F: FnMut(&[u8]) -> Result<Vec<u8>> + Send,
{
    fn process(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self(request)
    }
}

type SharedProcessor = Arc<Mutex<Box<dyn CommandProcessor>>>;

/// U2F and CTAP2 processors backing a dispatcher
#[derive(Clone, Default)]
pub struct Processors {
    u2f: Option<SharedProcessor>,
    ctap2: Option<SharedProcessor>,
}

impl Processors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the processor for CTAPHID_MSG (U2F) requests
    pub fn with_u2f(mut self, processor: impl CommandProcessor + 'static) -> Self {
        self.u2f = Some(Arc::new(Mutex::new(Box::new(processor))));
        self
    }

    /// Set the processor for CTAPHID_CBOR (CTAP2) requests
    pub fn with_ctap2(mut self, processor: impl CommandProcessor + 'static) -> Self {
        self.ctap2 = Some(Arc::new(Mutex::new(Box::new(processor))));
        self
    }

    /// Capability flags advertised in INIT responses
    pub fn capabilities(&self) -> u8 {
        let mut capabilities = CAPABILITY_WINK;
        if self.ctap2.is_some() {
            capabilities |= CAPABILITY_CBOR;
        }
        if self.u2f.is_none() {
            capabilities |= CAPABILITY_NMSG;
        }
        capabilities
    }

    fn for_cmd(&self, cmd: Cmd) -> Option<SharedProcessor> {
        match cmd {
            Cmd::Msg => self.u2f.clone(),
            Cmd::Cbor => self.ctap2.clone(),
            _ => None,
        }
    }
}

/// Response to a dispatched message
#[derive(Debug)]
pub enum Reply {
    /// Packets ready to send
    Packets(Vec<Packet>),

    /// Response still being produced by a processor
    Deferred(DeferredReply),
}

/// Response of a request handed to a processor
#[derive(Debug)]
pub struct DeferredReply {
    cid: u32,
    cmd: Cmd,
    waiter: ResponseWaiter,
}

impl DeferredReply {
    /// Channel the request arrived on
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Block until the processor finishes or the request is cancelled
    ///
    /// A cancelled CBOR request is answered with `CTAP2_ERR_KEEPALIVE_CANCEL`;
    /// a cancelled U2F request produces no packets.
    pub fn wait(self) -> Option<Vec<Packet>> {
        match self.waiter.wait() {
            WaitOutcome::Delivered(packets) => Some(packets),
            WaitOutcome::Cancelled if self.cmd == Cmd::Cbor => {
                debug!(cid = format_args!("{:#010x}", self.cid), "request cancelled");
                encode(self.cid, Cmd::Cbor, &[CTAP2_ERR_KEEPALIVE_CANCEL]).ok()
            }
            WaitOutcome::Cancelled => None,
        }
    }
}

/// CTAP HID command dispatcher
pub struct Dispatcher {
    manager: Arc<ChannelManager>,
    processors: Processors,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(manager: Arc<ChannelManager>, processors: Processors) -> Self {
        Self {
            manager,
            processors,
        }
    }

    /// Channel manager used for INIT, LOCK and request tracking
    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    /// Dispatch a complete message
    ///
    /// Returns `None` when the command has no response (CTAPHID_CANCEL).
    /// Errors never escape: they become ERROR packets on the message's channel.
    pub fn dispatch(&self, message: Message) -> Option<Reply> {
        let cid = message.cid;
        let cmd = message.cmd;
        match self.try_dispatch(message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    cid = format_args!("{:#010x}", cid),
                    cmd = ?cmd,
                    error = %e,
                    "command failed"
                );
                Some(Reply::Packets(vec![Packet::new_error(cid, e.error_code())]))
            }
        }
    }

    fn try_dispatch(&self, message: Message) -> Result<Option<Reply>> {
        if message.cid == BROADCAST_CID {
            self.dispatch_broadcast(message).map(Some)
        } else {
            self.dispatch_data(message)
        }
    }

    fn dispatch_broadcast(&self, message: Message) -> Result<Reply> {
        match message.cmd {
            Cmd::Init => {
                let nonce: [u8; INIT_NONCE_SIZE] = message
                    .data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidLength)?;
                let response = self.manager.allocate_channel(nonce)?;
                respond(BROADCAST_CID, Cmd::Init, &response.to_bytes())
            }
            Cmd::Ping => respond(BROADCAST_CID, Cmd::Ping, &message.data),
            _ => Err(Error::InvalidCommand),
        }
    }

    fn dispatch_data(&self, message: Message) -> Result<Option<Reply>> {
        let cid = message.cid;
        match message.cmd {
            Cmd::Ping => respond(cid, Cmd::Ping, &message.data).map(Some),
            Cmd::Wink => {
                info!(cid = format_args!("{:#010x}", cid), "wink");
                respond(cid, Cmd::Wink, &[]).map(Some)
            }
            Cmd::Lock => {
                let [seconds] = message.data[..] else {
                    return Err(Error::InvalidLength);
                };
                self.manager.set_lock(cid, seconds)?;
                info!(cid = format_args!("{:#010x}", cid), seconds, "channel lock");
                respond(cid, Cmd::Lock, &[]).map(Some)
            }
            Cmd::Cancel => {
                let cancelled = self.manager.cancel_channel(cid);
                debug!(cid = format_args!("{:#010x}", cid), cancelled, "cancel");
                Ok(None)
            }
            Cmd::Msg | Cmd::Cbor => self.spawn_request(message).map(|d| Some(Reply::Deferred(d))),
            Cmd::Init | Cmd::Keepalive | Cmd::Error => Err(Error::InvalidCommand),
        }
    }

    fn spawn_request(&self, message: Message) -> Result<DeferredReply> {
        let Message { cid, cmd, data } = message;
        let processor = self.processors.for_cmd(cmd).ok_or(Error::InvalidCommand)?;

        let waiter = self.manager.begin_request(cid)?;
        let key = waiter.key();
        let manager = Arc::clone(&self.manager);

        thread::Builder::new()
            .name(format!("ctaphid-{:08x}", cid))
            .spawn(move || {
                let Some(packets) = run_processor(&manager, key, &processor, cmd, &data) else {
                    return;
                };
                if !manager.deliver_response(key, packets) {
                    debug!(
                        cid = format_args!("{:#010x}", cid),
                        request_id = key.request_id,
                        "dropping response for cancelled request"
                    );
                }
            })?;

        Ok(DeferredReply { cid, cmd, waiter })
    }
}

fn respond(cid: u32, cmd: Cmd, data: &[u8]) -> Result<Reply> {
    encode(cid, cmd, data).map(Reply::Packets)
}

/// Run a request through its processor
///
/// Returns `None` without calling the processor if the request was cancelled
/// while waiting for the processor lock.
fn run_processor(
    manager: &ChannelManager,
    key: RequestKey,
    processor: &SharedProcessor,
    cmd: Cmd,
    request: &[u8],
) -> Option<Vec<Packet>> {
    let cid = key.cid;
    let result = match processor.lock() {
        Ok(_) if !manager.is_pending(key) => {
            debug!(
                cid = format_args!("{:#010x}", cid),
                request_id = key.request_id,
                "skipping cancelled request"
            );
            return None;
        }
        Ok(mut processor) => processor.process(request),
        Err(_) => Err(Error::Processor("processor lock poisoned".to_string())),
    };

    let packets = match result.and_then(|response| encode(cid, cmd, &response)) {
        Ok(packets) => packets,
        Err(e) => {
            warn!(
                cid = format_args!("{:#010x}", cid),
                cmd = ?cmd,
                error = %e,
                "processor failed"
            );
            vec![Packet::new_error(cid, e.error_code())]
        }
    };
    Some(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctaphid::{ErrorCode, InitResponse};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn echo(request: &[u8]) -> Result<Vec<u8>> {
        Ok(request.to_vec())
    }

    fn dispatcher(processors: Processors) -> Dispatcher {
        let manager = ChannelManager::with_config(Default::default(), processors.capabilities());
        Dispatcher::new(Arc::new(manager), processors)
    }

    fn packets(reply: Option<Reply>) -> Vec<Packet> {
        match reply {
            Some(Reply::Packets(packets)) => packets,
            Some(Reply::Deferred(deferred)) => deferred.wait().unwrap_or_default(),
            None => vec![],
        }
    }

    fn response(reply: Option<Reply>) -> Message {
        Message::from_packets(&packets(reply)).unwrap()
    }

    fn error_code(reply: Option<Reply>) -> Option<ErrorCode> {
        let packets = packets(reply);
        assert_eq!(packets.len(), 1);
        packets[0].error_code()
    }

    fn init(dispatcher: &Dispatcher) -> u32 {
        let reply = dispatcher.dispatch(Message::new(BROADCAST_CID, Cmd::Init, vec![0; 8]));
        InitResponse::from_bytes(&response(reply).data).unwrap().cid
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(Processors::new().capabilities(), CAPABILITY_WINK | CAPABILITY_NMSG);
        assert_eq!(
            Processors::new().with_ctap2(echo).with_u2f(echo).capabilities(),
            CAPABILITY_WINK | CAPABILITY_CBOR
        );
    }

    #[test]
    fn test_init_command() {
        let dispatcher = dispatcher(Processors::new().with_ctap2(echo));

        let nonce = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let reply = dispatcher.dispatch(Message::new(BROADCAST_CID, Cmd::Init, nonce.clone()));
        let message = response(reply);

        assert_eq!(message.cid, BROADCAST_CID);
        assert_eq!(message.cmd, Cmd::Init);
        assert_eq!(message.data.len(), 17);
        assert_eq!(&message.data[..8], &nonce[..]);

        let init = InitResponse::from_bytes(&message.data).unwrap();
        assert_eq!(init.cid, 1);
        assert_eq!(init.protocol_version, 2);
        assert_eq!(init.capabilities, CAPABILITY_WINK | CAPABILITY_CBOR | CAPABILITY_NMSG);
    }

    #[test]
    fn test_init_wrong_nonce_length() {
        let dispatcher = dispatcher(Processors::new());
        let reply = dispatcher.dispatch(Message::new(BROADCAST_CID, Cmd::Init, vec![1, 2, 3]));
        assert_eq!(error_code(reply), Some(ErrorCode::InvalidLen));
        assert_eq!(dispatcher.manager().active_channels(), 1);
    }

    #[test]
    fn test_broadcast_ping() {
        let dispatcher = dispatcher(Processors::new());
        let reply = dispatcher.dispatch(Message::new(BROADCAST_CID, Cmd::Ping, b"alive".to_vec()));
        assert_eq!(response(reply).data, b"alive");
    }

    #[test]
    fn test_invalid_broadcast_command() {
        let dispatcher = dispatcher(Processors::new().with_ctap2(echo));
        for cmd in [Cmd::Cbor, Cmd::Msg, Cmd::Wink, Cmd::Lock, Cmd::Keepalive] {
            let reply = dispatcher.dispatch(Message::new(BROADCAST_CID, cmd, vec![0]));
            assert_eq!(error_code(reply), Some(ErrorCode::InvalidCmd), "{:?}", cmd);
        }
    }

    #[test]
    fn test_data_ping_and_wink() {
        let dispatcher = dispatcher(Processors::new());
        let cid = init(&dispatcher);

        let ping = response(dispatcher.dispatch(Message::new(cid, Cmd::Ping, b"hello".to_vec())));
        assert_eq!(ping.cmd, Cmd::Ping);
        assert_eq!(ping.data, b"hello");

        let wink = response(dispatcher.dispatch(Message::new(cid, Cmd::Wink, vec![])));
        assert_eq!(wink.cmd, Cmd::Wink);
        assert!(wink.data.is_empty());
    }

    #[test]
    fn test_cbor_and_msg() {
        let dispatcher = dispatcher(
            Processors::new()
                .with_ctap2(|req: &[u8]| -> Result<Vec<u8>> {
                    let mut response = vec![0x00];
                    response.extend_from_slice(req);
                    Ok(response)
                })
                .with_u2f(|_: &[u8]| -> Result<Vec<u8>> { Ok(vec![0x90, 0x00]) }),
        );
        let cid = init(&dispatcher);

        let cbor = response(dispatcher.dispatch(Message::new(cid, Cmd::Cbor, vec![0x04])));
        assert_eq!(cbor.cmd, Cmd::Cbor);
        assert_eq!(cbor.data, vec![0x00, 0x04]);

        let msg = response(dispatcher.dispatch(Message::new(cid, Cmd::Msg, vec![0x00, 0x03])));
        assert_eq!(msg.cmd, Cmd::Msg);
        assert_eq!(msg.data, vec![0x90, 0x00]);
        assert_eq!(dispatcher.manager().pending_requests(), 0);
    }

    #[test]
    fn test_missing_processor() {
        let dispatcher = dispatcher(Processors::new());
        let cid = init(&dispatcher);

        let reply = dispatcher.dispatch(Message::new(cid, Cmd::Msg, vec![0x00]));
        assert_eq!(error_code(reply), Some(ErrorCode::InvalidCmd));
    }

    #[test]
    fn test_processor_error() {
        let dispatcher = dispatcher(
            Processors::new().with_ctap2(|_: &[u8]| -> Result<Vec<u8>> {
                Err(Error::Processor("boom".to_string()))
            }),
        );
        let cid = init(&dispatcher);

        let reply = dispatcher.dispatch(Message::new(cid, Cmd::Cbor, vec![0x01]));
        assert_eq!(error_code(reply), Some(ErrorCode::Other));
    }

    #[test]
    fn test_invalid_data_commands() {
        let dispatcher = dispatcher(Processors::new());
        let cid = init(&dispatcher);

        for cmd in [Cmd::Init, Cmd::Keepalive, Cmd::Error] {
            let reply = dispatcher.dispatch(Message::new(cid, cmd, vec![0; 8]));
            assert_eq!(error_code(reply), Some(ErrorCode::InvalidCmd), "{:?}", cmd);
        }
    }

    #[test]
    fn test_lock_command() {
        let dispatcher = dispatcher(Processors::new());
        let cid = init(&dispatcher);

        let reply = dispatcher.dispatch(Message::new(cid, Cmd::Lock, vec![]));
        assert_eq!(error_code(reply), Some(ErrorCode::InvalidLen));

        let reply = dispatcher.dispatch(Message::new(cid, Cmd::Lock, vec![11]));
        assert_eq!(error_code(reply), Some(ErrorCode::InvalidPar));

        let lock = response(dispatcher.dispatch(Message::new(cid, Cmd::Lock, vec![3])));
        assert_eq!(lock.cmd, Cmd::Lock);
        assert_eq!(dispatcher.manager().lock_holder(), Some(cid));

        dispatcher.dispatch(Message::new(cid, Cmd::Lock, vec![0]));
        assert_eq!(dispatcher.manager().lock_holder(), None);
    }

    #[test]
    fn test_cancel_in_flight_request() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let dispatcher = dispatcher(Processors::new().with_ctap2(move |_: &[u8]| -> Result<Vec<u8>> {
            started_tx.send(()).ok();
            release_rx.lock().unwrap().recv().ok();
            Ok(vec![0x00])
        }));
        let cid = init(&dispatcher);

        let Some(Reply::Deferred(deferred)) =
            dispatcher.dispatch(Message::new(cid, Cmd::Cbor, vec![0x01]))
        else {
            panic!("expected deferred reply");
        };
        started_rx.recv().unwrap();

        // A second request on the same channel is rejected while busy
        let busy = dispatcher.dispatch(Message::new(cid, Cmd::Cbor, vec![0x02]));
        assert_eq!(error_code(busy), Some(ErrorCode::ChannelBusy));

        assert!(dispatcher.dispatch(Message::new(cid, Cmd::Cancel, vec![])).is_none());
        release_tx.send(()).unwrap();

        let cancelled = Message::from_packets(&deferred.wait().unwrap()).unwrap();
        assert_eq!(cancelled.cmd, Cmd::Cbor);
        assert_eq!(cancelled.data, vec![CTAP2_ERR_KEEPALIVE_CANCEL]);
        assert_eq!(dispatcher.manager().pending_requests(), 0);
    }

    #[test]
    fn test_cancelled_request_never_reaches_processor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let processor = {
            let calls = Arc::clone(&calls);
            move |request: &[u8]| -> Result<Vec<u8>> {
                calls.fetch_add(1, Ordering::SeqCst);
                if request == [0x01] {
                    started_tx.send(()).ok();
                    release_rx.lock().unwrap().recv().ok();
                }
                Ok(vec![0x00])
            }
        };
        let dispatcher = dispatcher(Processors::new().with_ctap2(processor));
        let a = init(&dispatcher);
        let b = init(&dispatcher);

        let Some(Reply::Deferred(first)) = dispatcher.dispatch(Message::new(a, Cmd::Cbor, vec![0x01]))
        else {
            panic!("expected deferred reply");
        };
        started_rx.recv().unwrap();

        // Queued behind the busy processor, then cancelled
        let Some(Reply::Deferred(second)) =
            dispatcher.dispatch(Message::new(b, Cmd::Cbor, vec![0x02]))
        else {
            panic!("expected deferred reply");
        };
        assert!(dispatcher.dispatch(Message::new(b, Cmd::Cancel, vec![])).is_none());
        let cancelled = Message::from_packets(&second.wait().unwrap()).unwrap();
        assert_eq!(cancelled.data, vec![CTAP2_ERR_KEEPALIVE_CANCEL]);

        release_tx.send(()).unwrap();
        let done = Message::from_packets(&first.wait().unwrap()).unwrap();
        assert_eq!((done.cid, done.data), (a, vec![0x00]));

        thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_without_request() {
        let dispatcher = dispatcher(Processors::new());
        let cid = init(&dispatcher);
        assert!(dispatcher.dispatch(Message::new(cid, Cmd::Cancel, vec![])).is_none());
    }
}
