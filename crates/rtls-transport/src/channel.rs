//! Bound UDP socket with an event surface

use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest UDP payload over IPv4
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

/// Events surfaced by a [`NetworkChannel`]
#[derive(Debug)]
pub enum ChannelEvent {
    /// Socket is bound and accepting traffic
    Listening(SocketAddr),
    /// Datagram received from a peer
    Datagram { bytes: Vec<u8>, from: SocketAddr },
    /// Bind or I/O failure; the channel stops after reporting it
    Fault(io::Error),
}

/// UDP endpoint owned by a single consumer
///
/// The event receiver is created before the bind is attempted, so every
/// datagram accepted by the socket is delivered. Frames passed to
/// [`send`](Self::send) before the socket is bound are queued and flushed
/// in order once it is.
pub struct NetworkChannel {
    bind: SocketAddr,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkChannel {
    /// Open a channel on `bind`; binding happens in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(bind: SocketAddr, max_datagram_size: usize) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(serve(bind, max_datagram_size, event_tx, outbound_rx));
        debug!(bind = %bind, "Opening network channel");

        Self {
            bind,
            outbound,
            events,
            worker: Some(worker),
        }
    }

    /// Address the channel was asked to bind
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Queue a datagram for `to`
    pub fn send(&self, bytes: Vec<u8>, to: SocketAddr) {
        if self.outbound.send((bytes, to)).is_err() {
            trace!(to = %to, "Channel closed, dropping outbound datagram");
        }
    }

    /// Next event, or `None` once the channel has stopped and all events are drained
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close the socket; safe to call more than once
    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            debug!(bind = %self.bind, "Network channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_none()
    }
}

impl Drop for NetworkChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum Io {
    Received(io::Result<(usize, SocketAddr)>),
    Outbound(Option<(Vec<u8>, SocketAddr)>),
}

async fn serve(
    bind: SocketAddr,
    max_datagram_size: usize,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut outbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(bind = %bind, error = %e, "Failed to bind UDP socket");
            let _ = events.send(ChannelEvent::Fault(e));
            return;
        }
    };

    match socket.local_addr() {
        Ok(local) => {
            let _ = events.send(ChannelEvent::Listening(local));
        }
        Err(e) => {
            let _ = events.send(ChannelEvent::Fault(e));
            return;
        }
    }

    let mut buf = vec![0u8; max_datagram_size];
    let mut outbound_open = true;

    loop {
        let io = tokio::select! {
            received = socket.recv_from(&mut buf) => Io::Received(received),
            frame = outbound.recv(), if outbound_open => Io::Outbound(frame),
        };

        match io {
            Io::Received(Ok((len, from))) => {
                trace!(from = %from, len = len, "Datagram received");
                let datagram = ChannelEvent::Datagram {
                    bytes: buf[..len].to_vec(),
                    from,
                };
                if events.send(datagram).is_err() {
                    return;
                }
            }
            Io::Received(Err(e)) => {
                warn!(error = %e, "UDP receive failed");
                let _ = events.send(ChannelEvent::Fault(e));
                return;
            }
            Io::Outbound(Some((frame, to))) => {
                trace!(to = %to, len = frame.len(), "Sending datagram");
                if let Err(e) = socket.send_to(&frame, to).await {
                    warn!(to = %to, error = %e, "UDP send failed");
                    let _ = events.send(ChannelEvent::Fault(e));
                    return;
                }
            }
            Io::Outbound(None) => outbound_open = false,
        }
    }
}
