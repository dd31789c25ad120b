//! The consensus worker: one OS thread that owns the raft-rs [`RawNode`], its
//! log store and the state machine.
//!
//! The async side never touches raft state. It sends [`Request`]s and inbound
//! [`Envelope`]s over crossbeam channels and reads the role and status the
//! worker publishes on watch channels. Outbound messages leave through a tokio
//! channel drained by the dispatcher in [`super::node`]. Every durable write
//! happens on this thread, so a slow disk stalls consensus but never a tokio
//! worker.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfChangeV2, ConfState, Config, Entry, EntryType, HardState,
    Message, MessageType, RawNode, Snapshot, SnapshotStatus,
};
use raft::{StateRole, Storage, INVALID_ID};
use slog::{o, Logger};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::storage::LogStore;
use super::transport::Envelope;
use super::types::{
    EntryKind, LogEntry, LogIndex, NodeId, Peer, RaftStatus, RoleState, SnapshotMeta,
    SnapshotPayload, Term, VoterConfiguration,
};
use crate::config::RaftConfig;
use crate::error::{ApplyError, KvError};
use crate::fsm::{ApplyOutcome, StateMachine};

pub(super) type Reply<R> = oneshot::Sender<Result<R, KvError>>;

/// Work handed to the worker by [`super::RaftNode`] and its dispatcher.
pub(super) enum Request {
    Propose {
        data: Vec<u8>,
        done: Reply<ApplyOutcome>,
    },
    AddVoter {
        peer: Peer,
        done: Reply<ApplyOutcome>,
    },
    Snapshot {
        done: Reply<Option<SnapshotMeta>>,
    },
    Unreachable(u64),
    SnapshotSent {
        to: u64,
        status: SnapshotStatus,
    },
    Shutdown,
}

/// A message on its way to the peer with raft id `to`.
pub(super) struct Outbound {
    pub to: u64,
    pub addr: String,
    pub msg: Message,
}

pub(super) struct Channels {
    pub requests: Receiver<Request>,
    pub inbound: Receiver<Envelope>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

/// State the worker publishes for the async side.
pub(super) struct Shared {
    pub id: NodeId,
    pub role_tx: watch::Sender<RoleState>,
    pub status_tx: watch::Sender<RaftStatus>,
    pub shutdown_tx: watch::Sender<bool>,
    pub fatal_tx: watch::Sender<Option<String>>,
    /// Set once the worker released its storage, or was never started.
    pub stopped_tx: watch::Sender<bool>,
}

impl Shared {
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn halt(&self, reason: String) {
        error!(node = %self.id, %reason, "halting consensus node");
        self.fatal_tx.send_replace(Some(reason));
        self.shutdown_tx.send_replace(true);
    }
}

/// A worker that has not been started yet, with its log store type erased.
pub(super) trait Launch: Send {
    /// Makes this node the only voter of a new cluster if its store is empty.
    fn bootstrap(&mut self) -> Result<bool, KvError>;

    fn spawn(self: Box<Self>) -> io::Result<()>;
}

/// Marks the node stopped when the worker thread ends, however it ends.
struct StopGuard(Arc<Shared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.halt("consensus worker panicked".to_string());
        }
        self.0.stopped_tx.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Command,
    ConfChange,
}

/// A caller waiting for the entry at some index to apply.
struct Waiter {
    term: Term,
    expect: Expect,
    done: Reply<ApplyOutcome>,
}

enum Event {
    Request(Request),
    Inbound(Envelope),
    Idle,
    Closed,
}

/// The raft-rs logger is silenced; this crate logs through `tracing`.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Maps wall-clock timings onto raft-rs ticks, one tick per heartbeat.
pub(super) fn raft_config(id: u64, config: &RaftConfig, applied: LogIndex) -> Config {
    let tick = config.heartbeat_interval.as_nanos().max(1);
    let ticks = |timeout: Duration| timeout.as_nanos().div_ceil(tick) as usize;
    let election_tick = ticks(config.election_timeout_min).max(2);
    Config {
        id,
        election_tick,
        heartbeat_tick: 1,
        min_election_tick: election_tick,
        max_election_tick: ticks(config.election_timeout_max).max(election_tick + 1),
        max_size_per_msg: config.max_size_per_msg,
        max_inflight_msgs: config.max_inflight_msgs,
        check_quorum: true,
        pre_vote: true,
        applied,
        ..Default::default()
    }
}

pub(super) struct Worker<S: LogStore> {
    local: Peer,
    raft_id: u64,
    config: RaftConfig,
    logger: Logger,
    raw: RawNode<S>,
    fsm: Arc<dyn StateMachine>,
    /// Names and addresses by raft id: voters, plus anyone who wrote to us.
    peers: BTreeMap<u64, Peer>,
    conf_state: ConfState,
    applied: LogIndex,
    snapshot_index: LogIndex,
    since_snapshot: u64,
    pending: BTreeMap<LogIndex, Waiter>,
    /// Answers held back until the status they imply is published.
    replies: Vec<(Reply<ApplyOutcome>, Result<ApplyOutcome, KvError>)>,
    /// Peers to report once the current ready is advanced; `true` when a
    /// snapshot was among the undeliverable messages.
    unreachable: Vec<(u64, bool)>,
    channels: Channels,
    shared: Arc<Shared>,
}

impl<S: LogStore> Worker<S> {
    /// Restores the state machine from the newest snapshot and builds the
    /// raft node on top of `storage`.
    pub fn open(
        local: Peer,
        config: RaftConfig,
        storage: S,
        fsm: Arc<dyn StateMachine>,
        channels: Channels,
    ) -> Result<Self, KvError> {
        let raft_id = local.raft_id();
        let mut peers = BTreeMap::from([(raft_id, local.clone())]);
        let mut applied = 0;
        if let Some(snapshot) = storage.latest_snapshot()? {
            let payload = decode_payload(&snapshot)?;
            fsm.restore(&mut payload.state.as_slice())?;
            peers.extend(payload.voters.into_iter().map(|p| (p.raft_id(), p)));
            applied = snapshot.get_metadata().index;
            info!(node = %local.id, index = applied, "restored state machine from snapshot");
        }
        let conf_state = storage.initial_state()?.conf_state;

        let logger = silent_logger();
        let raw = RawNode::new(&raft_config(raft_id, &config, applied), storage, &logger)?;
        let (role_tx, _) = watch::channel(RoleState {
            role: raw.raft.state.into(),
            term: raw.raft.term,
            leader: None,
        });
        let (status_tx, _) = watch::channel(RaftStatus {
            id: local.id.clone(),
            role: raw.raft.state.into(),
            term: raw.raft.term,
            leader: None,
            commit_index: raw.raft.raft_log.committed,
            last_applied: applied,
            last_log_index: raw.raft.raft_log.last_index(),
            snapshot_index: applied,
            voters: VoterConfiguration::default(),
        });
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);
        let (stopped_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: local.id.clone(),
            role_tx,
            status_tx,
            shutdown_tx,
            fatal_tx,
            stopped_tx,
        });

        let mut worker = Self {
            local,
            raft_id,
            config,
            logger,
            raw,
            fsm,
            peers,
            conf_state,
            applied,
            snapshot_index: applied,
            since_snapshot: 0,
            pending: BTreeMap::new(),
            replies: Vec::new(),
            unreachable: Vec::new(),
            channels,
            shared,
        };
        worker.publish();
        Ok(worker)
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Writes a one-voter configuration as committed entry 1, carrying this
    /// node's address like any other added voter.
    pub fn bootstrap(&mut self) -> Result<bool, KvError> {
        let store = self.raw.store().clone();
        if !store.is_pristine()? {
            return Ok(false);
        }

        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = self.raft_id;
        change.context = peer_context(&self.local)?.into();

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.term = 1;
        entry.index = 1;
        entry.data = change.encode_to_vec().into();

        let mut conf_state = ConfState::default();
        conf_state.voters = vec![self.raft_id];
        let mut hard_state = HardState::default();
        hard_state.term = 1;
        hard_state.commit = 1;

        store.append(&[entry])?;
        store.set_conf_state(&conf_state)?;
        store.set_hard_state(&hard_state)?;
        self.raw = RawNode::new(
            &raft_config(self.raft_id, &self.config, self.applied),
            store,
            &self.logger,
        )?;
        self.conf_state = conf_state;
        info!(node = %self.local.id, addr = %self.local.addr, "bootstrapped single-voter cluster");
        self.publish();
        Ok(true)
    }

    fn run(self) {
        let _stopped = StopGuard(Arc::clone(&self.shared));
        self.event_loop();
    }

    fn event_loop(mut self) {
        let tick = self.config.heartbeat_interval;
        let mut last_tick = Instant::now();
        info!(node = %self.local.id, "consensus worker started");

        loop {
            if self.shared.is_shut_down() {
                break;
            }
            let timeout = tick.saturating_sub(last_tick.elapsed());
            let event = crossbeam_channel::select! {
                recv(self.channels.requests) -> req => req.map_or(Event::Closed, Event::Request),
                recv(self.channels.inbound) -> env => env.map_or(Event::Closed, Event::Inbound),
                default(timeout) => Event::Idle,
            };
            match event {
                Event::Request(Request::Shutdown) | Event::Closed => break,
                Event::Request(request) => self.handle(request),
                Event::Inbound(envelope) => self.receive(envelope),
                Event::Idle => {}
            }

            if last_tick.elapsed() >= tick {
                self.raw.tick();
                last_tick = Instant::now();
            }
            if let Err(err) = self.process_ready() {
                self.shared.halt(format!("consensus worker failed: {err}"));
                break;
            }
            self.publish();
            self.flush_replies();
        }

        self.fail_pending(|| KvError::Shutdown);
        self.flush_replies();
        info!(node = %self.local.id, "consensus worker stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Propose { data, done } => self.propose(data, done),
            Request::AddVoter { peer, done } => self.add_voter(peer, done),
            Request::Snapshot { done } => {
                let _ = done.send(self.compact());
            }
            Request::Unreachable(to) => self.raw.report_unreachable(to),
            Request::SnapshotSent { to, status } => self.raw.report_snapshot(to, status),
            Request::Shutdown => {}
        }
    }

    fn receive(&mut self, Envelope { from, msg }: Envelope) {
        if msg.to != self.raft_id {
            debug!(node = %self.local.id, to = msg.to, "dropping message addressed to another node");
            return;
        }
        if from.raft_id() == msg.from {
            self.peers.entry(msg.from).or_insert(from);
        }
        if let Err(err) = self.raw.step(msg) {
            debug!(node = %self.local.id, %err, "raft message ignored");
        }
    }

    // ---- proposals ---------------------------------------------------------

    fn propose(&mut self, data: Vec<u8>, done: Reply<ApplyOutcome>) {
        if let Err(err) = self.ensure_leader() {
            let _ = done.send(Err(err));
            return;
        }
        match self.raw.propose(vec![], data) {
            Ok(()) => self.track(Expect::Command, done),
            Err(err) => {
                let _ = done.send(Err(self.proposal_error(err)));
            }
        }
    }

    fn add_voter(&mut self, peer: Peer, done: Reply<ApplyOutcome>) {
        match self.check_voter(&peer) {
            Err(err) => {
                let _ = done.send(Err(err));
                return;
            }
            Ok(true) => {
                let _ = done.send(Ok(ApplyOutcome {
                    index: self.applied,
                    previous: None,
                }));
                return;
            }
            Ok(false) => {}
        }

        let context = match peer_context(&peer) {
            Ok(context) => context,
            Err(err) => {
                let _ = done.send(Err(err));
                return;
            }
        };
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = peer.raft_id();
        change.context = context.into();

        match self.raw.propose_conf_change(vec![], change) {
            Ok(()) => {
                info!(node = %self.local.id, voter = %peer.id, addr = %peer.addr, "proposed voter");
                self.track(Expect::ConfChange, done);
            }
            Err(err) => {
                let _ = done.send(Err(self.proposal_error(err)));
            }
        }
    }

    /// `Ok(true)` when `peer` is already a voter at the same address.
    fn check_voter(&self, peer: &Peer) -> Result<bool, KvError> {
        self.ensure_leader()?;
        let id = peer.raft_id();
        let voting = self.conf_state.voters.contains(&id);
        match self.peers.get(&id) {
            Some(known) if known.id != peer.id => {
                return Err(KvError::ConfigChange(format!(
                    "{} collides with {} on raft id {id}",
                    peer.id, known.id
                )));
            }
            Some(known) if voting && known.addr != peer.addr => {
                return Err(KvError::ConfigChange(format!(
                    "{} is already a voter at {}",
                    peer.id, known.addr
                )));
            }
            Some(_) if voting => return Ok(true),
            _ => {}
        }
        if self.raw.raft.has_pending_conf() {
            return Err(KvError::ConfigChangePending);
        }
        Ok(false)
    }

    fn ensure_leader(&self) -> Result<(), KvError> {
        if self.raw.raft.state == StateRole::Leader {
            Ok(())
        } else {
            Err(KvError::NotLeader {
                leader: self.leader_name(),
            })
        }
    }

    fn proposal_error(&self, err: raft::Error) -> KvError {
        match err {
            raft::Error::ProposalDropped => KvError::NotLeader {
                leader: self.leader_name(),
            },
            other => KvError::Raft(other),
        }
    }

    /// Registers a waiter for the entry just appended by a proposal.
    fn track(&mut self, expect: Expect, done: Reply<ApplyOutcome>) {
        let index = self.raw.raft.raft_log.last_index();
        let waiter = Waiter {
            term: self.raw.raft.term,
            expect,
            done,
        };
        if let Some(stale) = self.pending.insert(index, waiter) {
            self.replies.push((stale.done, Err(KvError::LeadershipLost)));
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> KvError) {
        let waiters = std::mem::take(&mut self.pending);
        if !waiters.is_empty() {
            debug!(node = %self.local.id, count = waiters.len(), "failing pending proposals");
        }
        for (_, waiter) in waiters {
            self.replies.push((waiter.done, Err(err())));
        }
    }

    fn flush_replies(&mut self) {
        for (done, result) in self.replies.drain(..) {
            let _ = done.send(result);
        }
    }

    // ---- ready handling ----------------------------------------------------

    fn process_ready(&mut self) -> Result<(), KvError> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let store = self.raw.store().clone();
        let mut ready = self.raw.ready();

        self.send(ready.take_messages());
        if !ready.snapshot().is_empty() {
            self.install_snapshot(&store, ready.snapshot())?;
        }
        self.apply_entries(ready.take_committed_entries())?;
        if !ready.entries().is_empty() {
            store.append(ready.entries())?;
        }
        if let Some(hard_state) = ready.hs() {
            store.set_hard_state(hard_state)?;
        }
        self.send(ready.take_persisted_messages());

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            store.set_commit(commit)?;
        }
        self.send(light.take_messages());
        self.apply_entries(light.take_committed_entries())?;
        self.raw.advance_apply();

        for (to, snapshot) in std::mem::take(&mut self.unreachable) {
            self.raw.report_unreachable(to);
            if snapshot {
                self.raw.report_snapshot(to, SnapshotStatus::Failure);
            }
        }
        self.maybe_compact();
        Ok(())
    }

    fn send(&mut self, messages: Vec<Message>) {
        for msg in messages {
            let Some(peer) = self.peers.get(&msg.to) else {
                debug!(node = %self.local.id, to = msg.to, kind = ?msg.msg_type(), "no address for raft peer");
                let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
                self.unreachable.push((msg.to, snapshot));
                continue;
            };
            let outbound = Outbound {
                to: msg.to,
                addr: peer.addr.clone(),
                msg,
            };
            if self.channels.outbound.send(outbound).is_err() {
                debug!(node = %self.local.id, "dispatcher gone, dropping outbound message");
            }
        }
    }

    /// Replaces log and state machine with a snapshot from the leader.
    /// Waiters at or below its index can no longer learn their outcome.
    fn install_snapshot(&mut self, store: &S, snapshot: &Snapshot) -> Result<(), KvError> {
        let meta = snapshot.get_metadata();
        let payload = decode_payload(snapshot)?;
        store.apply_snapshot(snapshot)?;
        self.fsm.restore(&mut payload.state.as_slice())?;

        self.peers
            .extend(payload.voters.into_iter().map(|p| (p.raft_id(), p)));
        self.conf_state = meta.get_conf_state().clone();
        self.applied = meta.index;
        self.snapshot_index = meta.index;
        self.since_snapshot = 0;

        let rest = self.pending.split_off(&(meta.index + 1));
        for (_, waiter) in std::mem::replace(&mut self.pending, rest) {
            self.replies.push((waiter.done, Err(KvError::LeadershipLost)));
        }
        info!(node = %self.local.id, index = meta.index, term = meta.term, "installed snapshot from leader");
        Ok(())
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<(), KvError> {
        for entry in entries {
            if entry.index <= self.applied {
                continue;
            }
            let (kind, change) = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => (EntryKind::NoOp, Ok(())),
                EntryType::EntryNormal => (EntryKind::Command, Ok(())),
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    (EntryKind::Configuration, self.apply_conf_change(&entry)?)
                }
            };
            let entry = LogEntry {
                term: entry.term,
                index: entry.index,
                kind,
                payload: entry.data.to_vec(),
            };
            let outcome = self.fsm.apply(&entry)?;
            self.applied = entry.index;
            self.since_snapshot += 1;
            self.resolve(&entry, change.map(|()| outcome));
        }
        Ok(())
    }

    /// Applies a committed voter change. The outer error is fatal; the inner
    /// one means raft-rs refused the change and goes to its proposer.
    fn apply_conf_change(&mut self, entry: &Entry) -> Result<Result<(), KvError>, KvError> {
        let index = entry.index;
        let decode_error = |source| ApplyError::ConfChange { index, source };
        let (applied, added, context) = if entry.entry_type() == EntryType::EntryConfChange {
            let change = ConfChange::decode(&entry.data[..]).map_err(decode_error)?;
            let added = (change.change_type() == ConfChangeType::AddNode).then_some(change.node_id);
            (self.raw.apply_conf_change(&change), added, change.context.to_vec())
        } else {
            let change = ConfChangeV2::decode(&entry.data[..]).map_err(decode_error)?;
            let added = change
                .changes
                .iter()
                .find(|c| c.change_type() == ConfChangeType::AddNode)
                .map(|c| c.node_id);
            (self.raw.apply_conf_change(&change), added, change.context.to_vec())
        };

        let conf_state = match applied {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(node = %self.local.id, index, %err, "configuration change refused");
                return Ok(Err(KvError::ConfigChange(err.to_string())));
            }
        };
        self.raw.store().set_conf_state(&conf_state)?;
        self.conf_state = conf_state;

        if let Some(id) = added {
            match serde_json::from_slice::<Peer>(&context) {
                Ok(peer) if peer.raft_id() == id => {
                    info!(node = %self.local.id, voter = %peer.id, addr = %peer.addr, index, "voter added");
                    self.peers.insert(id, peer);
                }
                _ => warn!(node = %self.local.id, raft_id = id, index, "voter added without a usable address"),
            }
        }
        Ok(Ok(()))
    }

    fn resolve(&mut self, entry: &LogEntry, result: Result<ApplyOutcome, KvError>) {
        let Some(waiter) = self.pending.remove(&entry.index) else {
            return;
        };
        let result = if waiter.term != entry.term {
            Err(KvError::LeadershipLost)
        } else if waiter.expect == Expect::ConfChange && entry.kind == EntryKind::NoOp {
            // raft-rs turns a change proposed while another is in flight
            // into an empty entry.
            Err(KvError::ConfigChangePending)
        } else {
            result
        };
        self.replies.push((waiter.done, result));
    }

    // ---- snapshots ---------------------------------------------------------

    fn maybe_compact(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.since_snapshot < threshold {
            return;
        }
        if let Err(err) = self.compact() {
            warn!(node = %self.local.id, %err, "automatic snapshot failed");
            self.since_snapshot = 0;
        }
    }

    /// Snapshots the state machine at the applied index and drops the log
    /// behind it. `None` when the newest snapshot already covers it.
    fn compact(&mut self) -> Result<Option<SnapshotMeta>, KvError> {
        let index = self.applied;
        if index <= self.snapshot_index {
            return Ok(None);
        }
        let term = self.raw.raft.raft_log.term(index)?;
        let voters = self.voter_peers();
        let mut state = Vec::new();
        self.fsm.snapshot(&mut state)?;
        let payload = SnapshotPayload {
            voters: voters.clone(),
            state,
        };

        let mut snapshot = Snapshot::default();
        snapshot.data = serde_json::to_vec(&payload).map_err(ApplyError::from)?.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(self.conf_state.clone());
        self.raw.store().compact(snapshot)?;

        self.snapshot_index = index;
        self.since_snapshot = 0;
        info!(node = %self.local.id, index, term, "took snapshot and compacted log");
        Ok(Some(SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            configuration: voters.into_iter().collect(),
        }))
    }

    // ---- views -------------------------------------------------------------

    fn leader_name(&self) -> Option<NodeId> {
        match self.raw.raft.leader_id {
            INVALID_ID => None,
            id => self.peers.get(&id).map(|p| p.id.clone()),
        }
    }

    fn voter_peers(&self) -> Vec<Peer> {
        self.conf_state
            .voters
            .iter()
            .filter_map(|id| self.peers.get(id).cloned())
            .collect()
    }

    fn role_state(&self) -> RoleState {
        RoleState {
            role: self.raw.raft.state.into(),
            term: self.raw.raft.term,
            leader: self.leader_name(),
        }
    }

    fn status(&self) -> RaftStatus {
        let raft = &self.raw.raft;
        RaftStatus {
            id: self.local.id.clone(),
            role: raft.state.into(),
            term: raft.term,
            leader: self.leader_name(),
            commit_index: raft.raft_log.committed,
            last_applied: self.applied,
            last_log_index: raft.raft_log.last_index(),
            snapshot_index: self.snapshot_index,
            voters: self.voter_peers().into_iter().collect(),
        }
    }

    /// Publishes role and status; a leader that stepped down or moved to a
    /// new term fails its waiters.
    fn publish(&mut self) {
        let role = self.role_state();
        let previous = self.shared.role_tx.borrow().clone();
        if role != previous {
            if role.role != previous.role {
                info!(
                    node = %self.local.id,
                    role = %role.role,
                    term = role.term,
                    leader = ?role.leader,
                    "role changed"
                );
            }
            if previous.is_leader() && (!role.is_leader() || role.term != previous.term) {
                self.fail_pending(|| KvError::LeadershipLost);
            }
            self.shared.role_tx.send_replace(role);
        }

        let status = self.status();
        self.shared.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl<S: LogStore> Launch for Worker<S> {
    fn bootstrap(&mut self) -> Result<bool, KvError> {
        Worker::bootstrap(self)
    }

    fn spawn(self: Box<Self>) -> io::Result<()> {
        let worker = *self;
        thread::Builder::new()
            .name(format!("raft-worker-{}", worker.local.id))
            .spawn(move || worker.run())?;
        Ok(())
    }
}

fn peer_context(peer: &Peer) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(peer).map_err(|e| KvError::InvalidInput(e.to_string()))
}

fn decode_payload(snapshot: &Snapshot) -> Result<SnapshotPayload, KvError> {
    Ok(serde_json::from_slice(&snapshot.data).map_err(ApplyError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_become_ticks() {
        let config = RaftConfig::default();
        let cfg = raft_config(7, &config, 0);
        assert_eq!(cfg.heartbeat_tick, 1);
        assert_eq!(cfg.election_tick, 3);
        assert_eq!(cfg.min_election_tick, 3);
        assert_eq!(cfg.max_election_tick, 6);
        assert!(cfg.check_quorum && cfg.pre_vote);
        cfg.validate().unwrap();

        // A range narrower than one tick still leaves raft-rs room to
        // randomize.
        let tight = RaftConfig {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(110),
            heartbeat_interval: Duration::from_millis(100),
            ..RaftConfig::default()
        };
        let cfg = raft_config(7, &tight, 0);
        assert_eq!((cfg.election_tick, cfg.max_election_tick), (2, 3));
        cfg.validate().unwrap();
    }
}
