//! Async handle on a consensus worker.
//!
//! [`RaftNode`] is what the rest of the process holds: it queues requests and
//! inbound messages for the worker thread, waits on the replies with a
//! deadline, and runs the dispatcher that carries outbound messages to peers.
//! Each peer gets its own sender task, so a dead peer backs off without
//! holding up the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use raft::prelude::{MessageType, SnapshotStatus};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::storage::LogStore;
use super::transport::{Envelope, Transport};
use super::types::{Peer, RaftStatus, RoleState, SnapshotMeta};
use super::worker::{Channels, Launch, Outbound, Request, Shared, Worker};
use crate::command::Command;
use crate::config::RaftConfig;
use crate::error::KvError;
use crate::fsm::{ApplyOutcome, StateMachine};

/// Upper bound for the retry delay of a sender talking to a dead peer.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// The worker and its outbound stream, until [`RaftNode::start`] takes them.
struct Launcher {
    worker: Box<dyn Launch>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

struct Inner<T> {
    local: Peer,
    config: RaftConfig,
    transport: T,
    shared: Arc<Shared>,
    requests: Sender<Request>,
    inbound: Sender<Envelope>,
    launch: Mutex<Option<Launcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A consensus node: one member of the replicated log.
///
/// Cheap to clone; all clones drive the same node.
pub struct RaftNode<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl<T: Transport> RaftNode<T> {
    /// Loads persisted state and builds a stopped node. Reads the whole log
    /// store, so call it off the async runtime for a durable store.
    pub fn new<S: LogStore>(
        local: Peer,
        config: RaftConfig,
        storage: S,
        fsm: Arc<dyn StateMachine>,
        transport: T,
    ) -> Result<Self, KvError> {
        let (requests, requests_rx) = unbounded();
        let (inbound, inbound_rx) = unbounded();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let channels = Channels {
            requests: requests_rx,
            inbound: inbound_rx,
            outbound: outbound_tx,
        };
        let worker = Worker::open(local.clone(), config.clone(), storage, fsm, channels)?;
        let shared = worker.shared();

        Ok(Self {
            inner: Arc::new(Inner {
                local,
                config,
                transport,
                shared,
                requests,
                inbound,
                launch: Mutex::new(Some(Launcher {
                    worker: Box::new(worker),
                    outbound,
                })),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.local.id
    }

    pub fn local(&self) -> &Peer {
        &self.inner.local
    }

    /// Makes this node the only voter of a new cluster if it has no state
    /// yet. Only valid before [`Self::start`]; writes to the log store.
    pub fn bootstrap(&self) -> Result<bool, KvError> {
        match lock(&self.inner.launch).as_mut() {
            Some(launcher) => launcher.worker.bootstrap(),
            None => Err(KvError::InvalidInput(
                "bootstrap must run before the node starts".into(),
            )),
        }
    }

    /// Spawns the worker thread and the outbound dispatcher. Later calls do
    /// nothing.
    pub fn start(&self) {
        let Some(launcher) = lock(&self.inner.launch).take() else {
            return;
        };
        let shared = &self.inner.shared;
        if let Err(err) = launcher.worker.spawn() {
            shared.halt(format!("failed to spawn consensus worker: {err}"));
            shared.stopped_tx.send_replace(true);
            return;
        }
        let dispatcher = Dispatcher {
            local: self.inner.local.clone(),
            transport: self.inner.transport.clone(),
            requests: self.inner.requests.clone(),
            floor: self.inner.config.heartbeat_interval,
        };
        self.track(tokio::spawn(dispatcher.run(launcher.outbound)));
    }

    /// Replicates `command` and waits until it is applied locally.
    ///
    /// Only the leader accepts commands. `Timeout` and `LeadershipLost` mean
    /// the outcome is unknown: the entry was appended and may still commit
    /// and apply later.
    pub async fn apply_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<ApplyOutcome, KvError> {
        let data = command
            .encode()
            .map_err(|e| KvError::InvalidInput(e.to_string()))?;
        let (done, rx) = oneshot::channel();
        self.request(Request::Propose { data, done })?;
        wait(rx, timeout).await
    }

    /// Adds `id` at `addr` to the voter configuration and waits until the
    /// change is applied. Re-adding an existing voter at the same address
    /// succeeds immediately.
    pub async fn add_voter(&self, id: &str, addr: &str, timeout: Duration) -> Result<(), KvError> {
        let (done, rx) = oneshot::channel();
        self.request(Request::AddVoter {
            peer: Peer::new(id, addr),
            done,
        })?;
        wait(rx, timeout).await.map(|_| ())
    }

    /// Snapshots the state machine at the last applied index and compacts
    /// the log behind it. Returns `None` when there was nothing new to cover.
    pub async fn snapshot(&self) -> Result<Option<SnapshotMeta>, KvError> {
        let (done, rx) = oneshot::channel();
        self.request(Request::Snapshot { done })?;
        rx.await.map_err(|_| KvError::Shutdown)?
    }

    pub fn status(&self) -> RaftStatus {
        self.inner.shared.status_tx.borrow().clone()
    }

    pub fn role(&self) -> RoleState {
        self.inner.shared.role_tx.borrow().clone()
    }

    pub fn role_changes(&self) -> watch::Receiver<RoleState> {
        self.inner.shared.role_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.is_shut_down()
    }

    /// Stops the worker and every task. Waiting proposals fail with
    /// `Shutdown`. Returns before the worker has let go of its storage; see
    /// [`Self::wait_stopped`].
    pub fn shutdown(&self) {
        let shared = &self.inner.shared;
        if !shared.shutdown_tx.send_replace(true) {
            info!(node = %self.inner.local.id, "shutting down consensus node");
        }
        if lock(&self.inner.launch).take().is_some() {
            shared.stopped_tx.send_replace(true);
        }
        let _ = self.inner.requests.send(Request::Shutdown);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }

    /// Resolves once the node halted on an unrecoverable error.
    pub async fn wait_fatal(&self) -> String {
        let mut rx = self.inner.shared.fatal_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "consensus node dropped".to_string();
            }
        }
    }

    /// Resolves once the worker thread has exited and closed its log store.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.shared.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Queues a message from a peer for the worker.
    pub fn step(&self, envelope: Envelope) -> Result<(), KvError> {
        if self.is_shut_down() {
            return Err(KvError::Shutdown);
        }
        self.inner
            .inbound
            .send(envelope)
            .map_err(|_| KvError::Shutdown)
    }

    /// Feeds messages arriving over a [`super::transport::LocalNetwork`] to
    /// the worker until the node shuts down.
    pub fn serve_local(&self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        let node = self.clone();
        let mut shutdown = self.inner.shared.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        if node.step(envelope).is_err() {
                            break;
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        });
        self.track(task);
    }

    fn request(&self, request: Request) -> Result<(), KvError> {
        if self.is_shut_down() {
            return Err(KvError::Shutdown);
        }
        self.inner
            .requests
            .send(request)
            .map_err(|_| KvError::Shutdown)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|t| !t.is_finished());
        if self.is_shut_down() {
            task.abort();
        } else {
            tasks.push(task);
        }
    }
}

async fn wait<R>(
    rx: oneshot::Receiver<Result<R, KvError>>,
    timeout: Duration,
) -> Result<R, KvError> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(KvError::Timeout),
        Ok(Err(_)) => Err(KvError::Shutdown),
        Ok(Ok(result)) => result,
    }
}

/// Fans outbound messages out to one sender task per peer.
struct Dispatcher<T> {
    local: Peer,
    transport: T,
    requests: Sender<Request>,
    /// First retry delay after a failed send.
    floor: Duration,
}

impl<T: Transport> Dispatcher<T> {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut senders: HashMap<u64, mpsc::UnboundedSender<Outbound>> = HashMap::new();
        while let Some(out) = outbound.recv().await {
            let to = out.to;
            let queue = senders.entry(to).or_insert_with(|| self.spawn_sender(to));
            if let Err(mpsc::error::SendError(out)) = queue.send(out) {
                // The sender task died with its peer's queue; start over.
                let queue = self.spawn_sender(to);
                let _ = queue.send(out);
                senders.insert(to, queue);
            }
        }
        debug!(node = %self.local.id, "outbound dispatcher stopped");
    }

    fn spawn_sender(&self, to: u64) -> mpsc::UnboundedSender<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(
            to,
            self.local.clone(),
            self.transport.clone(),
            self.requests.clone(),
            self.floor,
            rx,
        ));
        tx
    }
}

/// Sends one peer's messages in order. A failure is reported to raft-rs,
/// which stops streaming to the peer, and everything queued behind it is
/// dropped after the backoff; raft-rs resends what still matters.
async fn deliver<T: Transport>(
    to: u64,
    local: Peer,
    transport: T,
    requests: Sender<Request>,
    floor: Duration,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    let report_snapshot = |status| {
        let _ = requests.send(Request::SnapshotSent { to, status });
    };
    let mut backoff = floor;

    while let Some(out) = queue.recv().await {
        let snapshot = out.msg.msg_type() == MessageType::MsgSnapshot;
        if snapshot {
            info!(node = %local.id, peer = to, addr = %out.addr, "sending snapshot");
        }
        match transport.send(&out.addr, &local, out.msg).await {
            Ok(()) => {
                backoff = floor;
                if snapshot {
                    report_snapshot(SnapshotStatus::Finish);
                }
            }
            Err(err) => {
                debug!(node = %local.id, peer = to, addr = %out.addr, %err, ?backoff, "raft message not delivered, backing off");
                let _ = requests.send(Request::Unreachable(to));
                if snapshot {
                    report_snapshot(SnapshotStatus::Failure);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                while let Ok(dropped) = queue.try_recv() {
                    if dropped.msg.msg_type() == MessageType::MsgSnapshot {
                        report_snapshot(SnapshotStatus::Failure);
                    }
                }
            }
        }
    }
}
