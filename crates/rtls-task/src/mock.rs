//! Recording collaborators for coordinator tests

use crate::collaborator::{
    AnchorCluster, AnchorEvent, ProtocolAdapter, ProtocolEvent, TagCluster, TagRunOptions,
};
use rtls_core::{AnchorId, Packet, TofReport};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Write(Vec<u8>, SocketAddr),
    ProtocolRun,
    ProtocolStop,
    Pause,
    Resume,
    NetworkError(std::io::ErrorKind),
    IsPositioned(AnchorId),
    TagRun(TagRunOptions),
    Tof(AnchorId, TofReport),
}

/// Calls made on every mock, in order
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Protocol adapter that decodes each datagram as one JSON packet and
/// answers datagrams of `b"ping"` with a `b"pong"` frame
///
/// Datagrams written while paused are held and decoded on resume.
pub struct MockProtocol {
    pub subscriptions: Arc<AtomicUsize>,
    subscribers: Vec<mpsc::UnboundedSender<ProtocolEvent>>,
    paused: bool,
    pending: Vec<(Vec<u8>, SocketAddr)>,
    calls: CallLog,
}

impl MockProtocol {
    pub fn new(calls: CallLog) -> Self {
        Self {
            subscriptions: Arc::new(AtomicUsize::new(0)),
            subscribers: Vec::new(),
            paused: false,
            pending: Vec::new(),
            calls,
        }
    }

    fn decode(&mut self, bytes: &[u8], from: SocketAddr) {
        if bytes == b"ping" {
            self.emit(ProtocolEvent::Data {
                frame: b"pong".to_vec(),
                to: from,
            });
            return;
        }
        match serde_json::from_slice::<Packet>(bytes) {
            Ok(packet) => self.emit(ProtocolEvent::Packet(packet)),
            Err(e) => self.emit(ProtocolEvent::Error(Arc::new(e))),
        }
    }

    fn emit(&mut self, event: ProtocolEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl ProtocolAdapter for MockProtocol {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProtocolEvent> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn write(&mut self, bytes: &[u8], from: SocketAddr) {
        self.calls.push(Call::Write(bytes.to_vec(), from));
        if self.paused {
            self.pending.push((bytes.to_vec(), from));
            return;
        }
        self.decode(bytes, from);
    }

    fn run(&mut self) {
        self.calls.push(Call::ProtocolRun);
    }

    fn stop(&mut self) {
        self.calls.push(Call::ProtocolStop);
    }

    fn pause(&mut self) {
        self.calls.push(Call::Pause);
        self.paused = true;
    }

    fn resume(&mut self) {
        self.calls.push(Call::Resume);
        self.paused = false;
        for (bytes, from) in std::mem::take(&mut self.pending) {
            self.decode(&bytes, from);
        }
    }

    fn handle_network_error(&mut self, err: &std::io::Error) {
        self.calls.push(Call::NetworkError(err.kind()));
    }
}

pub struct MockAnchors {
    pub subscriptions: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AnchorEvent>>>,
    positioned: Mutex<HashSet<AnchorId>>,
    calls: CallLog,
}

impl MockAnchors {
    pub fn new(calls: CallLog) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            positioned: Mutex::new(HashSet::new()),
            calls,
        })
    }

    pub fn set_positioned(&self, anchor: &str) {
        self.positioned.lock().unwrap().insert(AnchorId::from(anchor));
    }

    pub fn emit(&self, event: AnchorEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl AnchorCluster for MockAnchors {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AnchorEvent> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn is_positioned(&self, anchor: &AnchorId) -> bool {
        self.calls.push(Call::IsPositioned(anchor.clone()));
        self.positioned.lock().unwrap().contains(anchor)
    }
}

pub struct MockTags {
    calls: CallLog,
}

impl MockTags {
    pub fn new(calls: CallLog) -> Self {
        Self { calls }
    }
}

impl TagCluster for MockTags {
    fn run(&mut self, options: &TagRunOptions) {
        self.calls.push(Call::TagRun(options.clone()));
    }

    fn process_tof_report(&mut self, anchor: &AnchorId, report: &TofReport) {
        self.calls.push(Call::Tof(anchor.clone(), report.clone()));
    }
}

/// JSON datagram carrying a ToF report relayed by `anchor`
pub fn tof_datagram(anchor: &str, tag: &str, sequence: u32) -> Vec<u8> {
    serde_json::to_vec(&tof_packet(anchor, tag, sequence)).unwrap()
}

pub fn tof_packet(anchor: &str, tag: &str, sequence: u32) -> Packet {
    Packet::new(
        rtls_core::PacketHeader::new(anchor),
        rtls_core::Payload::TofReport(TofReport {
            tag_id: tag.into(),
            sequence,
            tof_ps: 6_671,
        }),
    )
}

pub fn other_packet(anchor: &str, name: &str) -> Packet {
    Packet::new(
        rtls_core::PacketHeader::new(anchor),
        rtls_core::Payload::Other {
            name: name.to_string(),
            fields: serde_json::Map::new(),
        },
    )
}
