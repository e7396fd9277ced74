//! Listener lifecycle: start, stop, and the reset that comes with stopping.
//!
//! [`Listener::start`] binds the socket on the calling thread (so a busy port
//! is reported to the caller) and then runs the receive loop on a named
//! `frame-recv` thread. [`Listener::stop`] clears the running flag, joins the
//! thread, and drops every in-flight frame buffer plus the delivery cursor.
//! Stopping is the only point at which reassembly state is reset.

use anyhow::Result;
use crossbeam_channel::Sender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::reassembler::FrameReassembler;
use crate::receiver::{FrameReceiver, ListenConfig, RawDatagram};
use crate::sink::FrameSink;

pub struct Listener {
    config: ListenConfig,
    reassembler: Arc<FrameReassembler>,
    sink: Arc<dyn FrameSink>,
    capture_tx: Option<Sender<RawDatagram>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Listener {
    pub fn new(
        config: ListenConfig,
        reassembler: Arc<FrameReassembler>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            config,
            reassembler,
            sink,
            capture_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            local_addr: None,
        }
    }

    /// Copy every received datagram to `tx` (used by the pcap recorder).
    pub fn with_capture(mut self, tx: Sender<RawDatagram>) -> Self {
        self.capture_tx = Some(tx);
        self
    }

    pub fn reassembler(&self) -> &Arc<FrameReassembler> {
        &self.reassembler
    }

    /// Bind and start receiving. Returns the bound address.
    /// Calling this while already listening is a no-op.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if let (true, Some(addr)) = (self.is_listening(), self.local_addr) {
            tracing::warn!("already listening on {}", addr);
            return Ok(addr);
        }

        self.running.store(true, Ordering::SeqCst);
        let receiver = FrameReceiver::bind(
            &self.config,
            self.reassembler.clone(),
            self.sink.clone(),
            self.running.clone(),
            self.capture_tx.clone(),
        );
        let mut receiver = match receiver {
            Ok(r) => r,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let addr = receiver.local_addr()?;

        let handle = std::thread::Builder::new()
            .name("frame-recv".into())
            .spawn(move || {
                if let Err(e) = receiver.run() {
                    tracing::error!("frame receiver exited: {:#}", e);
                }
            })?;

        self.handle = Some(handle);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Stop receiving and drop all reassembly state. Safe to call when stopped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("frame receiver thread panicked");
            }
        }
        self.local_addr = None;
        self.reassembler.reset();
    }

    pub fn is_listening(&self) -> bool {
        self.handle.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
