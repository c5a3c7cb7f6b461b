//! Task state machine
//!
//! [`Task`] holds all cross-component wiring: the network channel, the
//! protocol adapter and both clusters. Each input is handled to completion
//! by one method before the next is taken, so `state` and the channel
//! handle need no locking.
//!
//! Dispatch policy for decoded packets:
//! 1. every packet is emitted as [`TaskEvent::Packet`]
//! 2. ToF reports are forwarded to the tag cluster only when the relaying
//!    anchor is positioned, otherwise dropped
//! 3. every other kind is ignored after being emitted

use rtls_core::{AnchorPositions, Fault, Packet, Payload};
use rtls_transport::{ChannelEvent, NetworkChannel};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::collaborator::{
    AnchorCluster, AnchorEvent, ProtocolAdapter, ProtocolEvent, RunOptions, TagCluster,
};
use crate::config::TaskConfig;

/// Lifecycle state of the network side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Idle,
    Listening,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Listening => write!(f, "listening"),
        }
    }
}

/// Outward notification from the coordinator
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Channel is bound; traffic can flow
    Listening(SocketAddr),
    /// Fault re-emitted from the network, protocol or anchor side
    Error(Fault),
    /// Every decoded packet, before dispatch
    Packet(Packet),
    /// Anchor positions forwarded from the anchor cluster
    AnchorPosition(AnchorPositions),
}

/// One input for the state machine
pub(crate) enum Input {
    Channel(Option<ChannelEvent>),
    Protocol(Option<ProtocolEvent>),
    Anchor(Option<AnchorEvent>),
}

pub(crate) struct Task<P, A, T> {
    config: TaskConfig,
    state: watch::Sender<TaskState>,
    events: broadcast::Sender<TaskEvent>,
    channel: Option<NetworkChannel>,
    protocol: P,
    protocol_events: Option<mpsc::UnboundedReceiver<ProtocolEvent>>,
    anchors: Arc<A>,
    anchor_events: Option<mpsc::UnboundedReceiver<AnchorEvent>>,
    tags: T,
}

impl<P, A, T> Task<P, A, T>
where
    P: ProtocolAdapter,
    A: AnchorCluster,
    T: TagCluster,
{
    pub(crate) fn new(config: TaskConfig, protocol: P, anchors: Arc<A>, tags: T) -> Self {
        let (state, _) = watch::channel(TaskState::Idle);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            state,
            events,
            channel: None,
            protocol,
            protocol_events: None,
            anchors,
            anchor_events: None,
            tags,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<TaskEvent> {
        self.events.clone()
    }

    /// Open the channel and start the subsystems
    ///
    /// Returns the anchor cluster handle, or `None` when the network side
    /// is already up (listening, or bound but not yet confirmed).
    pub(crate) fn run(&mut self, options: &RunOptions) -> Option<Arc<A>> {
        if self.state() != TaskState::Idle || self.channel.is_some() {
            debug!(state = %self.state(), "Run ignored, network side already started");
            return None;
        }

        let bind = self.config.bind_addr();
        let max_datagram_size = self.config.max_datagram_size.max(1);
        self.channel = Some(NetworkChannel::open(bind, max_datagram_size));

        // Subscriptions outlive stop() so restarts never duplicate them
        if self.protocol_events.is_none() {
            self.protocol_events = Some(self.protocol.subscribe());
        }
        self.protocol.run();

        if self.anchor_events.is_none() {
            self.anchor_events = Some(self.anchors.subscribe());
        }

        self.tags.run(&options.tag_cluster);

        info!(bind = %bind, "Task started");
        Some(self.anchors.clone())
    }

    /// Tear down the network side; the clusters keep running
    pub(crate) fn stop(&mut self) {
        self.set_state(TaskState::Idle);
        self.close_channel();
        self.protocol.stop();
        info!("Task stopped");
    }

    pub(crate) fn pause(&mut self) {
        self.protocol.pause();
    }

    pub(crate) fn resume(&mut self) {
        self.protocol.resume();
    }

    /// Wait for the next channel, protocol or anchor input
    ///
    /// Cancel safe: every branch is a channel receive.
    pub(crate) async fn next_input(&mut self) -> Input {
        tokio::select! {
            event = next_channel_event(self.channel.as_mut()) => Input::Channel(event),
            event = next_event(self.protocol_events.as_mut()) => Input::Protocol(event),
            event = next_event(self.anchor_events.as_mut()) => Input::Anchor(event),
        }
    }

    pub(crate) fn handle_input(&mut self, input: Input) {
        match input {
            Input::Channel(Some(event)) => self.handle_channel_event(event),
            Input::Channel(None) => {
                // Worker gone without reporting a fault
                self.handle_network_error(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "network channel worker ended",
                ));
            }
            Input::Protocol(Some(event)) => self.handle_protocol_event(event),
            Input::Protocol(None) => {
                debug!("Protocol event stream closed");
                self.protocol_events = None;
            }
            Input::Anchor(Some(event)) => self.handle_anchor_event(event),
            Input::Anchor(None) => {
                debug!("Anchor event stream closed");
                self.anchor_events = None;
            }
        }
    }

    pub(crate) fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Listening(local) => {
                self.set_state(TaskState::Listening);
                info!(local = %local, "Listening");
                self.emit(TaskEvent::Listening(local));
            }
            ChannelEvent::Datagram { bytes, from } => {
                trace!(from = %from, len = bytes.len(), "Datagram to protocol");
                self.protocol.write(&bytes, from);
            }
            ChannelEvent::Fault(err) => self.handle_network_error(err),
        }
    }

    fn handle_network_error(&mut self, err: std::io::Error) {
        warn!(error = %err, "Network fault, stopping network side");
        self.set_state(TaskState::Idle);
        self.close_channel();
        self.protocol.handle_network_error(&err);
        self.emit(TaskEvent::Error(Fault::Network(Arc::new(err))));
    }

    pub(crate) fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Data { frame, to } => match &self.channel {
                Some(channel) => channel.send(frame, to),
                None => trace!(to = %to, "No channel, dropping outbound frame"),
            },
            ProtocolEvent::Packet(packet) => self.dispatch_packet(packet),
            ProtocolEvent::Error(err) => {
                warn!(error = %err, "Protocol fault");
                self.emit(TaskEvent::Error(Fault::Protocol(err)));
            }
        }
    }

    fn dispatch_packet(&mut self, packet: Packet) {
        self.emit(TaskEvent::Packet(packet.clone()));

        match &packet.payload {
            Payload::TofReport(report) => {
                let anchor = &packet.header.anchor_id;
                if self.anchors.is_positioned(anchor) {
                    self.tags.process_tof_report(anchor, report);
                } else {
                    debug!(
                        anchor = %anchor,
                        tag = %report.tag_id,
                        "Dropping ToF report from unpositioned anchor"
                    );
                }
            }
            Payload::Other { name, .. } => {
                trace!(kind = %name, "Packet kind not dispatched");
            }
        }
    }

    pub(crate) fn handle_anchor_event(&mut self, event: AnchorEvent) {
        match event {
            AnchorEvent::Position(positions) => {
                debug!(anchors = positions.len(), "Anchor positions updated");
                self.emit(TaskEvent::AnchorPosition(positions));
            }
            AnchorEvent::Error(err) => {
                warn!(error = %err, "Anchor cluster fault");
                self.emit(TaskEvent::Error(Fault::Anchor(err)));
            }
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }

    fn set_state(&self, state: TaskState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn emit(&self, event: TaskEvent) {
        // No observers is not an error
        let _ = self.events.send(event);
    }

    #[cfg(test)]
    pub(crate) fn has_channel(&self) -> bool {
        self.channel.is_some()
    }
}

async fn next_channel_event(channel: Option<&mut NetworkChannel>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_event<E>(rx: Option<&mut mpsc::UnboundedReceiver<E>>) -> Option<E> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{other_packet, tof_packet, Call, CallLog, MockAnchors, MockProtocol, MockTags};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    type TestTask = Task<MockProtocol, MockAnchors, MockTags>;

    fn loopback_config() -> TaskConfig {
        TaskConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            ..TaskConfig::with_port(0)
        }
    }

    fn new_task(calls: &CallLog) -> (TestTask, Arc<MockAnchors>) {
        let anchors = MockAnchors::new(calls.clone());
        let task = Task::new(
            loopback_config(),
            MockProtocol::new(calls.clone()),
            anchors.clone(),
            MockTags::new(calls.clone()),
        );
        (task, anchors)
    }

    /// Feed channel inputs until the channel reports it is bound
    async fn until_listening(task: &mut TestTask) -> SocketAddr {
        loop {
            let input = timeout(Duration::from_secs(5), task.next_input())
                .await
                .expect("no input before timeout");
            let listening = match &input {
                Input::Channel(Some(ChannelEvent::Listening(addr))) => Some(*addr),
                _ => None,
            };
            task.handle_input(input);
            if let Some(addr) = listening {
                return addr;
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => return events,
                Err(e) => panic!("unexpected receive error {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_run_wires_subsystems_and_reaches_listening() {
        let calls = CallLog::default();
        let (mut task, anchors) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        let handle = task.run(&RunOptions::default());
        assert!(Arc::ptr_eq(&handle.unwrap(), &anchors));
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(
            calls.calls(),
            vec![Call::ProtocolRun, Call::TagRun(Default::default())]
        );

        let addr = until_listening(&mut task).await;
        assert_eq!(task.state(), TaskState::Listening);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [TaskEvent::Listening(a)] if *a == addr
        ));
    }

    #[tokio::test]
    async fn test_second_run_is_ignored() {
        let calls = CallLog::default();
        let (mut task, anchors) = new_task(&calls);

        assert!(task.run(&RunOptions::default()).is_some());
        // Still binding
        assert!(task.run(&RunOptions::default()).is_none());
        until_listening(&mut task).await;
        assert!(task.run(&RunOptions::default()).is_none());

        assert_eq!(calls.count(|c| *c == Call::ProtocolRun), 1);
        assert_eq!(calls.count(|c| matches!(c, Call::TagRun(_))), 1);
        assert_eq!(anchors.subscriptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restart_keeps_single_subscription() {
        let calls = CallLog::default();
        let (mut task, anchors) = new_task(&calls);
        let protocol_subscriptions = task.protocol.subscriptions.clone();

        task.run(&RunOptions::default());
        until_listening(&mut task).await;

        task.stop();
        task.stop();
        assert_eq!(task.state(), TaskState::Idle);
        assert!(!task.has_channel());
        assert_eq!(calls.count(|c| *c == Call::ProtocolStop), 2);

        assert!(task.run(&RunOptions::default()).is_some());
        until_listening(&mut task).await;
        assert_eq!(task.state(), TaskState::Listening);
        assert_eq!(protocol_subscriptions.load(Ordering::SeqCst), 1);
        assert_eq!(anchors.subscriptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_without_run() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        task.stop();
        assert_eq!(task.state(), TaskState::Idle);
        assert_eq!(calls.calls(), vec![Call::ProtocolStop]);
    }

    #[test]
    fn test_pause_resume_forwarded_without_state_change() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        let mut state = task.watch_state();

        task.pause();
        task.resume();

        assert_eq!(calls.calls(), vec![Call::Pause, Call::Resume]);
        assert_eq!(task.state(), TaskState::Idle);
        assert!(!state.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_network_fault_stops_network_side() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        task.run(&RunOptions::default());
        until_listening(&mut task).await;
        drain(&mut events);

        task.handle_channel_event(ChannelEvent::Fault(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));

        assert_eq!(task.state(), TaskState::Idle);
        assert!(!task.has_channel());
        assert_eq!(
            calls.count(|c| *c == Call::NetworkError(std::io::ErrorKind::ConnectionReset)),
            1
        );
        let emitted = drain(&mut events);
        assert_eq!(emitted.len(), 1);
        assert!(matches!(&emitted[0], TaskEvent::Error(fault) if fault.is_network()));

        // Recovery is an explicit run
        assert!(task.run(&RunOptions::default()).is_some());
        until_listening(&mut task).await;
        assert_eq!(task.state(), TaskState::Listening);
    }

    #[tokio::test]
    async fn test_channel_worker_ending_is_a_network_fault() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        task.run(&RunOptions::default());
        until_listening(&mut task).await;
        drain(&mut events);

        // Abort the worker; its event stream ends without a fault
        task.channel.as_mut().unwrap().close();
        let input = timeout(Duration::from_secs(5), task.next_input())
            .await
            .expect("no input before timeout");
        assert!(matches!(input, Input::Channel(None)));
        task.handle_input(input);

        assert_eq!(task.state(), TaskState::Idle);
        assert!(!task.has_channel());
        assert_eq!(
            calls.count(|c| *c == Call::NetworkError(std::io::ErrorKind::BrokenPipe)),
            1
        );
        let emitted = drain(&mut events);
        assert!(matches!(
            emitted.as_slice(),
            [TaskEvent::Error(Fault::Network(e))] if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn test_other_kinds_are_emitted_but_not_dispatched() {
        let calls = CallLog::default();
        let (mut task, anchors) = new_task(&calls);
        anchors.set_positioned("a-01");
        let mut events = task.event_sender().subscribe();

        let packet = other_packet("a-01", "Anchor Status");
        task.handle_protocol_event(ProtocolEvent::Packet(packet.clone()));

        assert!(calls.calls().is_empty());
        assert!(matches!(
            drain(&mut events).as_slice(),
            [TaskEvent::Packet(p)] if *p == packet
        ));
    }

    #[test]
    fn test_tof_report_forwarded_only_from_positioned_anchor() {
        let calls = CallLog::default();
        let (mut task, anchors) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        let first = tof_packet("a-01", "t-01", 1);
        let second = tof_packet("a-01", "t-01", 2);

        task.handle_protocol_event(ProtocolEvent::Packet(first));
        anchors.set_positioned("a-01");
        task.handle_protocol_event(ProtocolEvent::Packet(second.clone()));

        let forwarded: Vec<Call> = calls
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Tof(..)))
            .collect();
        assert_eq!(
            forwarded,
            vec![Call::Tof(
                "a-01".into(),
                second.payload.as_tof_report().unwrap().clone()
            )]
        );
        assert_eq!(calls.count(|c| matches!(c, Call::IsPositioned(_))), 2);
        // Both packets are still surfaced
        assert_eq!(drain(&mut events).len(), 2);
    }

    #[test]
    fn test_protocol_fault_keeps_state() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        task.handle_protocol_event(ProtocolEvent::Error(Arc::new(std::io::Error::other(
            "bad crc",
        ))));

        assert_eq!(task.state(), TaskState::Idle);
        assert!(calls.calls().is_empty());
        let emitted = drain(&mut events);
        assert!(matches!(
            emitted.as_slice(),
            [TaskEvent::Error(Fault::Protocol(e))] if e.to_string() == "bad crc"
        ));
    }

    #[test]
    fn test_anchor_events_are_forwarded() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        let mut events = task.event_sender().subscribe();

        let mut positions = AnchorPositions::new();
        positions.insert("a-01".into(), rtls_core::Position::new(1.0, 2.0, 0.5));
        task.handle_anchor_event(AnchorEvent::Position(positions.clone()));
        task.handle_anchor_event(AnchorEvent::Error(Arc::new(std::io::Error::other(
            "solver diverged",
        ))));

        let emitted = drain(&mut events);
        assert_eq!(emitted.len(), 2);
        assert!(matches!(&emitted[0], TaskEvent::AnchorPosition(p) if *p == positions));
        assert!(matches!(&emitted[1], TaskEvent::Error(Fault::Anchor(_))));
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn test_outbound_frame_without_channel_is_dropped() {
        let calls = CallLog::default();
        let (mut task, _) = new_task(&calls);
        task.handle_protocol_event(ProtocolEvent::Data {
            frame: vec![9],
            to: "127.0.0.1:9".parse().unwrap(),
        });
        assert!(!task.has_channel());
    }
}
