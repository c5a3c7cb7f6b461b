//! JSON datagram codec
//!
//! Each datagram carries exactly one JSON encoded [`Packet`]. Packets with
//! a header sequence are acknowledged with a `{"ack": <sequence>}` frame
//! addressed to the sender.

use rtls_core::Packet;
use rtls_task::{ProtocolAdapter, ProtocolEvent};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed packet from {from}: {source}")]
    Malformed {
        from: SocketAddr,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode ack for sequence {sequence}: {source}")]
    Encode {
        sequence: u32,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct Ack {
    ack: u32,
}

pub struct JsonProtocol {
    config: ProtocolConfig,
    subscribers: Vec<mpsc::UnboundedSender<ProtocolEvent>>,
    running: bool,
    paused: bool,
    pending: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl JsonProtocol {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            subscribers: Vec::new(),
            running: false,
            paused: false,
            pending: VecDeque::new(),
        }
    }

    /// Datagrams held back while paused
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn decode(&mut self, bytes: &[u8], from: SocketAddr) {
        let packet: Packet = match serde_json::from_slice(bytes) {
            Ok(packet) => packet,
            Err(source) => {
                self.emit(ProtocolEvent::Error(Arc::new(ProtocolError::Malformed {
                    from,
                    source,
                })));
                return;
            }
        };

        trace!(
            from = %from,
            anchor = %packet.header.anchor_id,
            kind = %packet.payload.name(),
            "Decoded packet"
        );

        let sequence = packet.header.sequence;
        self.emit(ProtocolEvent::Packet(packet));

        if let (true, Some(sequence)) = (self.config.ack_reports, sequence) {
            match serde_json::to_vec(&Ack { ack: sequence }) {
                Ok(frame) => self.emit(ProtocolEvent::Data { frame, to: from }),
                Err(source) => {
                    self.emit(ProtocolEvent::Error(Arc::new(ProtocolError::Encode {
                        sequence,
                        source,
                    })))
                }
            }
        }
    }

    fn emit(&mut self, event: ProtocolEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl ProtocolAdapter for JsonProtocol {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProtocolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn write(&mut self, bytes: &[u8], from: SocketAddr) {
        if !self.running {
            trace!(from = %from, "Protocol stopped, ignoring datagram");
            return;
        }
        if self.paused {
            if self.pending.len() >= self.config.max_paused_datagrams {
                self.pending.pop_front();
                warn!("Paused queue full, dropping oldest datagram");
            }
            self.pending.push_back((bytes.to_vec(), from));
            return;
        }
        self.decode(bytes, from);
    }

    fn run(&mut self) {
        self.running = true;
        debug!("JSON protocol running");
    }

    fn stop(&mut self) {
        self.running = false;
        self.paused = false;
        self.pending.clear();
        debug!("JSON protocol stopped");
    }

    fn pause(&mut self) {
        self.paused = true;
        debug!("JSON protocol paused");
    }

    fn resume(&mut self) {
        self.paused = false;
        let pending = std::mem::take(&mut self.pending);
        debug!(replayed = pending.len(), "JSON protocol resumed");
        for (bytes, from) in pending {
            self.decode(&bytes, from);
        }
    }

    fn handle_network_error(&mut self, err: &std::io::Error) {
        if !self.pending.is_empty() {
            debug!(
                dropped = self.pending.len(),
                error = %err,
                "Discarding paused datagrams after network fault"
            );
        }
        self.pending.clear();
    }
}
