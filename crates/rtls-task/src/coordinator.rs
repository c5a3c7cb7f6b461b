//! Task coordinator handle
//!
//! The state machine runs on a single tokio task (the driver). The handle
//! only sends commands and waits for their acknowledgement, so callers
//! never observe partially constructed wiring. Readiness for traffic is
//! signalled separately by [`TaskEvent::Listening`].

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::collaborator::{AnchorCluster, ClusterFactory, ProtocolAdapter, RunOptions, TagCluster};
use crate::config::TaskConfig;
use crate::task::{Task, TaskEvent, TaskState};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task coordinator has shut down")]
    Stopped,
}

/// Result of [`TaskCoordinator::run`]
pub enum RunOutcome<A> {
    /// Wiring is complete; the channel may still be binding
    Started(Arc<A>),
    /// Network side was already started, nothing was done
    AlreadyRunning,
}

impl<A> RunOutcome<A> {
    pub fn anchors(self) -> Option<Arc<A>> {
        match self {
            RunOutcome::Started(anchors) => Some(anchors),
            RunOutcome::AlreadyRunning => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, RunOutcome::Started(_))
    }
}

impl<A> std::fmt::Debug for RunOutcome<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Started(_) => write!(f, "Started"),
            RunOutcome::AlreadyRunning => write!(f, "AlreadyRunning"),
        }
    }
}

enum Command<A> {
    Run {
        options: RunOptions,
        reply: oneshot::Sender<RunOutcome<A>>,
    },
    Stop(oneshot::Sender<()>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Coordinator for one RTLS node
///
/// Dropping the handle shuts the driver down.
pub struct TaskCoordinator<A> {
    commands: mpsc::UnboundedSender<Command<A>>,
    events: broadcast::Sender<TaskEvent>,
    state: watch::Receiver<TaskState>,
    driver: JoinHandle<()>,
}

impl<A: AnchorCluster> TaskCoordinator<A> {
    /// Build a coordinator around already constructed collaborators
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<P, T>(config: TaskConfig, protocol: P, anchors: Arc<A>, tags: T) -> Self
    where
        P: ProtocolAdapter,
        T: TagCluster,
    {
        let task = Task::new(config, protocol, anchors, tags);
        let events = task.event_sender();
        let state = task.watch_state();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(task, command_rx));

        Self {
            commands,
            events,
            state,
            driver,
        }
    }

    /// Build the clusters through `factory`, then the coordinator
    pub fn from_factory<P, F>(
        config: TaskConfig,
        protocol: P,
        factory: &F,
        anchor_options: &F::AnchorOptions,
        tag_options: &F::TagOptions,
    ) -> Self
    where
        P: ProtocolAdapter,
        F: ClusterFactory<Anchors = A>,
    {
        let anchors = factory.anchor_cluster(anchor_options);
        let tags = factory.tag_cluster(tag_options, anchors.clone());
        Self::new(config, protocol, anchors, tags)
    }

    /// Open the network channel and start every subsystem
    ///
    /// Resolves once wiring is complete, with a handle to the anchor
    /// cluster. This does not wait for the bind: observe
    /// [`TaskEvent::Listening`] to know when traffic flows. Calling this
    /// while already started yields [`RunOutcome::AlreadyRunning`].
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome<A>, TaskError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Run { options, reply })?;
        rx.await.map_err(|_| TaskError::Stopped)
    }

    /// Close the network channel and stop the protocol adapter
    ///
    /// The anchor and tag clusters are left running.
    pub async fn stop(&self) -> Result<(), TaskError> {
        self.request(Command::Stop).await
    }

    pub async fn pause(&self) -> Result<(), TaskError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), TaskError> {
        self.request(Command::Resume).await
    }

    /// Stop the network side and end the driver
    pub async fn shutdown(self) -> Result<(), TaskError> {
        self.request(Command::Shutdown).await?;
        let _ = self.driver.await;
        Ok(())
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Subscribe to outward events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command<A>) -> Result<(), TaskError> {
        self.commands.send(command).map_err(|_| TaskError::Stopped)
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> Command<A>,
    ) -> Result<(), TaskError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| TaskError::Stopped)
    }
}

async fn drive<P, A, T>(mut task: Task<P, A, T>, mut commands: mpsc::UnboundedReceiver<Command<A>>)
where
    P: ProtocolAdapter,
    A: AnchorCluster,
    T: TagCluster,
{
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Run { options, reply }) => {
                    let outcome = match task.run(&options) {
                        Some(anchors) => RunOutcome::Started(anchors),
                        None => RunOutcome::AlreadyRunning,
                    };
                    let _ = reply.send(outcome);
                }
                Some(Command::Stop(reply)) => {
                    task.stop();
                    let _ = reply.send(());
                }
                Some(Command::Pause(reply)) => {
                    task.pause();
                    let _ = reply.send(());
                }
                Some(Command::Resume(reply)) => {
                    task.resume();
                    let _ = reply.send(());
                }
                Some(Command::Shutdown(reply)) => {
                    task.stop();
                    let _ = reply.send(());
                    break;
                }
                None => {
                    debug!("Coordinator handle dropped");
                    task.stop();
                    break;
                }
            },
            input = task.next_input() => task.handle_input(input),
        }
    }
    debug!("Task driver exited");
}
