//! CTAP HID Server
//!
//! Ties the channel manager and the dispatcher to a transport. Raw reports
//! enter through [`CtapHidServer::handle_raw_report`]; responses leave through
//! a [`PacketSink`] driven by a dedicated writer thread.
//!
//! # Example
//!
//! ```no_run
//! use vfido_ctaphid::{CtapHidConfig, CtapHidServer, Packet, Processors};
//!
//! # fn example() -> vfido_ctaphid::Result<()> {
//! let processors = Processors::new().with_ctap2(|_request: &[u8]| -> vfido_ctaphid::Result<Vec<u8>> {
//!     // Process CTAP2 command and return response
//!     Ok(vec![0x00])
//! });
//!
//! let sink = |_packet: &Packet| -> vfido_ctaphid::Result<()> {
//!     // Write the packet to the HID device
//!     Ok(())
//! };
//!
//! let mut server = CtapHidServer::start(CtapHidConfig::default(), processors, sink)?;
//! let report = [0u8; 64];
//! server.handle_raw_report(&report)?;
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::config::CtapHidConfig;
use crate::ctaphid::Packet;
use crate::dispatcher::{DeferredReply, Dispatcher, Processors, Reply};
use crate::error::{Error, Result};
use crate::manager::ChannelManager;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Destination of outbound packets
pub trait PacketSink: Send {
    /// Write one packet to the transport
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;
}

impl<F> PacketSink for F
where
    F: FnMut(&Packet) -> Result<()> + Send,
{
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self(packet)
    }
}

/// CTAP HID server
///
/// Responses are queued on a bounded queue drained by a single writer. Each
/// queue item is a whole response, so packets of one response are never
/// interleaved with another. Responses produced by a processor are queued
/// only once they are complete, so a slow request never holds a queue slot.
pub struct CtapHidServer {
    dispatcher: Dispatcher,
    tx: Option<mpsc::Sender<Vec<Packet>>>,
    writer: Option<JoinHandle<()>>,
}

impl CtapHidServer {
    /// Start a server writing responses to `sink`
    ///
    /// Capabilities reported in INIT responses are derived from `processors`.
    pub fn start(
        config: CtapHidConfig,
        processors: Processors,
        sink: impl PacketSink + 'static,
    ) -> Result<Self> {
        let capacity = config.outbound_capacity.max(1);
        let manager = Arc::new(ChannelManager::with_config(
            config,
            processors.capabilities(),
        ));
        let dispatcher = Dispatcher::new(manager, processors);

        let (tx, rx) = mpsc::channel(capacity);
        let writer = thread::Builder::new()
            .name("ctaphid-writer".to_string())
            .spawn(move || write_loop(rx, sink))?;

        info!(
            capabilities = format_args!("{:#04x}", dispatcher.manager().capabilities()),
            capacity, "CTAP HID server started"
        );

        Ok(Self {
            dispatcher,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Channel manager backing this server
    pub fn manager(&self) -> &Arc<ChannelManager> {
        self.dispatcher.manager()
    }

    /// Handle one raw report read from the transport
    ///
    /// Blocks while the outbound queue is full. Fails only with
    /// [`Error::QueueClosed`] once the server is shut down.
    pub fn handle_raw_report(&self, report: &[u8]) -> Result<()> {
        trace!(len = report.len(), "raw report");

        let routed = self.dispatcher.manager().route_message(report);
        if !routed.errors.is_empty() {
            self.enqueue(routed.errors)?;
        }

        match routed.message.and_then(|message| self.dispatcher.dispatch(message)) {
            Some(Reply::Packets(packets)) => self.enqueue(packets),
            Some(Reply::Deferred(deferred)) => self.forward(deferred),
            None => Ok(()),
        }
    }

    /// Discard stale partial messages and report them with MsgTimeout
    ///
    /// Stale messages are also swept on every report; call this periodically
    /// when the transport may stay idle.
    pub fn poll_timeouts(&self) -> Result<()> {
        let expired = self.dispatcher.manager().expire_stale();
        if expired.is_empty() {
            return Ok(());
        }
        self.enqueue(expired)
    }

    fn sender(&self) -> Result<&mpsc::Sender<Vec<Packet>>> {
        self.tx.as_ref().ok_or(Error::QueueClosed)
    }

    fn enqueue(&self, packets: Vec<Packet>) -> Result<()> {
        self.sender()?
            .blocking_send(packets)
            .map_err(|_| Error::QueueClosed)
    }

    /// Queue a processor response once it completes
    fn forward(&self, deferred: DeferredReply) -> Result<()> {
        let tx = self.sender()?.clone();
        let cid = deferred.cid();

        thread::Builder::new()
            .name(format!("ctaphid-reply-{:08x}", cid))
            .spawn(move || {
                let Some(packets) = deferred.wait() else {
                    return;
                };
                if tx.blocking_send(packets).is_err() {
                    debug!(
                        cid = format_args!("{:#010x}", cid),
                        "outbound queue closed, dropping response"
                    );
                }
            })?;
        Ok(())
    }

    /// Stop the server
    ///
    /// Cancels pending requests, closes the outbound queue and waits for the
    /// writer to flush what was already queued, including the replies of
    /// cancelled requests.
    pub fn shutdown(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let cancelled = self.dispatcher.manager().cancel_all();
        drop(tx);

        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("writer thread panicked");
            }
        }

        info!(cancelled, "CTAP HID server stopped");
    }
}

impl Drop for CtapHidServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_loop(mut rx: mpsc::Receiver<Vec<Packet>>, mut sink: impl PacketSink) {
    while let Some(packets) = rx.blocking_recv() {
        for packet in &packets {
            if let Err(e) = sink.send_packet(packet) {
                warn!(
                    cid = format_args!("{:#010x}", packet.cid()),
                    error = %e,
                    "failed to send packet"
                );
                break;
            }
        }
    }
    debug!("writer stopped");
}
