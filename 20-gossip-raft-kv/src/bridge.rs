//! Turns gossip membership into voter configuration.
//!
//! The bridge runs on its own task, fed by the directory's broadcast channel,
//! so gossip never waits on consensus. A node that joins while this node is
//! not the leader is remembered and added once this node becomes leader; on
//! every leadership acquisition the directory is rescanned as well, so a join
//! seen by no leader is not lost. Departures are logged only: voters are
//! never removed automatically.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::KvError;
use crate::membership::{ClusterNode, MembershipDirectory, MembershipEvent};
use crate::raft::transport::Transport;
use crate::raft::{RaftNode, RoleState};

/// How often pending joins are retried while this node leads.
const RETRY_PERIOD: Duration = Duration::from_secs(1);

/// What the bridge needs from the consensus engine.
pub trait VoterControl: Send + Sync + 'static {
    fn role(&self) -> RoleState;

    fn role_changes(&self) -> watch::Receiver<RoleState>;

    fn add_voter(
        &self,
        id: &str,
        addr: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), KvError>> + Send;
}

impl<T: Transport> VoterControl for RaftNode<T> {
    fn role(&self) -> RoleState {
        RaftNode::role(self)
    }

    fn role_changes(&self) -> watch::Receiver<RoleState> {
        RaftNode::role_changes(self)
    }

    async fn add_voter(&self, id: &str, addr: &str, timeout: Duration) -> Result<(), KvError> {
        RaftNode::add_voter(self, id, addr, timeout).await
    }
}

pub struct VoterBridge<C: VoterControl> {
    control: Arc<C>,
    directory: Arc<MembershipDirectory>,
    timeout: Duration,
    /// Joined nodes not yet confirmed as voters, keyed by id.
    pending: BTreeMap<String, ClusterNode>,
}

impl<C: VoterControl> VoterBridge<C> {
    pub fn new(control: Arc<C>, directory: Arc<MembershipDirectory>, timeout: Duration) -> Self {
        Self {
            control,
            directory,
            timeout,
            pending: BTreeMap::new(),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.directory.subscribe();
        let mut roles = self.control.role_changes();
        let mut retry = interval(RETRY_PERIOD);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.rescan();
        if self.control.role().is_leader() {
            self.flush().await;
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(MembershipEvent::Joined(node)) => self.on_join(node).await,
                    Ok(MembershipEvent::Left(node)) => {
                        info!(member = %node.id, "member left; voter configuration unchanged");
                        self.pending.remove(&node.id);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership events lagged, rescanning directory");
                        self.rescan();
                        if self.control.role().is_leader() {
                            self.flush().await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leading = roles.borrow_and_update().is_leader();
                    if leading {
                        self.rescan();
                        self.flush().await;
                    }
                }
                _ = retry.tick() => {
                    if !self.pending.is_empty() && self.control.role().is_leader() {
                        self.flush().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("voter bridge stopped");
    }

    async fn on_join(&mut self, node: ClusterNode) {
        if node.id == self.directory.local_id() {
            return;
        }
        self.pending.insert(node.id.clone(), node);
        if self.control.role().is_leader() {
            self.flush().await;
        } else {
            debug!(pending = self.pending.len(), "not leader, join deferred");
        }
    }

    /// Queues every alive member other than this node.
    fn rescan(&mut self) {
        let local = self.directory.local_id().to_string();
        for node in self.directory.alive_members() {
            if node.id != local {
                self.pending.insert(node.id.clone(), node);
            }
        }
    }

    /// Submits pending joins one at a time while this node leads.
    async fn flush(&mut self) {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for id in ids {
            let Some(node) = self.pending.get(&id).cloned() else {
                continue;
            };
            match self.control.add_voter(&node.id, &node.raft_addr, self.timeout).await {
                Ok(()) => {
                    debug!(voter = %node.id, addr = %node.raft_addr, "voter confirmed");
                    self.pending.remove(&id);
                }
                Err(KvError::NotLeader { .. }) => {
                    debug!(voter = %node.id, "lost leadership, join stays pending");
                    return;
                }
                Err(KvError::ConfigChangePending) => {
                    debug!(voter = %node.id, "configuration change in flight, join stays pending");
                    return;
                }
                Err(err @ KvError::ConfigChange(_)) => {
                    warn!(voter = %node.id, %err, "voter change rejected");
                    self.pending.remove(&id);
                }
                Err(err) => {
                    warn!(voter = %node.id, %err, "adding voter failed, will retry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Role;
    use std::sync::Mutex;

    struct FakeControl {
        role_tx: watch::Sender<RoleState>,
        added: Mutex<Vec<(String, String)>>,
        reject: Mutex<Vec<String>>,
        /// Ids answered once with "change in flight" before being accepted.
        busy_once: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn new(role: Role) -> Arc<Self> {
            let (role_tx, _) = watch::channel(state(role));
            Arc::new(Self {
                role_tx,
                added: Mutex::new(Vec::new()),
                reject: Mutex::new(Vec::new()),
                busy_once: Mutex::new(Vec::new()),
            })
        }

        fn set_role(&self, role: Role) {
            self.role_tx.send_replace(state(role));
        }

        fn added(&self) -> Vec<(String, String)> {
            self.added.lock().unwrap().clone()
        }
    }

    fn state(role: Role) -> RoleState {
        RoleState {
            role,
            term: 1,
            leader: (role == Role::Leader).then(|| "local".to_string()),
        }
    }

    impl VoterControl for FakeControl {
        fn role(&self) -> RoleState {
            self.role_tx.borrow().clone()
        }

        fn role_changes(&self) -> watch::Receiver<RoleState> {
            self.role_tx.subscribe()
        }

        async fn add_voter(&self, id: &str, addr: &str, _timeout: Duration) -> Result<(), KvError> {
            if !self.role().is_leader() {
                return Err(KvError::NotLeader { leader: None });
            }
            if self.reject.lock().unwrap().iter().any(|r| r == id) {
                return Err(KvError::ConfigChange(format!("{id} rejected")));
            }
            let mut busy = self.busy_once.lock().unwrap();
            if let Some(pos) = busy.iter().position(|b| b == id) {
                busy.remove(pos);
                return Err(KvError::ConfigChangePending);
            }
            drop(busy);
            self.added.lock().unwrap().push((id.to_string(), addr.to_string()));
            Ok(())
        }
    }

    fn node(id: &str) -> ClusterNode {
        ClusterNode::new(id, format!("{id}:2222"), format!("{id}:8222"), format!("{id}:7946"))
    }

    /// Polls for three seconds, long enough for one retry period.
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn start(control: Arc<FakeControl>) -> (Arc<MembershipDirectory>, watch::Sender<bool>) {
        let directory = Arc::new(MembershipDirectory::new(node("local")));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        VoterBridge::new(control, directory.clone(), Duration::from_secs(1)).spawn(shutdown_rx);
        (directory, shutdown_tx)
    }

    #[tokio::test]
    async fn leader_adds_joined_member() {
        let control = FakeControl::new(Role::Leader);
        let (directory, _shutdown) = start(control.clone());
        tokio::task::yield_now().await;

        directory.merge([node("n2")]);
        eventually(|| control.added() == vec![("n2".to_string(), "n2:8222".to_string())]).await;
    }

    #[tokio::test]
    async fn follower_defers_join_until_leadership() {
        let control = FakeControl::new(Role::Follower);
        let (directory, _shutdown) = start(control.clone());
        tokio::task::yield_now().await;

        directory.merge([node("n2")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control.added().is_empty());

        control.set_role(Role::Leader);
        eventually(|| control.added().iter().any(|(id, _)| id == "n2")).await;
    }

    #[tokio::test]
    async fn rejected_change_does_not_stop_the_bridge() {
        let control = FakeControl::new(Role::Leader);
        control.reject.lock().unwrap().push("bad".into());
        let (directory, _shutdown) = start(control.clone());
        tokio::task::yield_now().await;

        directory.merge([node("bad")]);
        directory.merge([node("good")]);
        eventually(|| control.added().iter().any(|(id, _)| id == "good")).await;
        assert!(!control.added().iter().any(|(id, _)| id == "bad"));
    }

    #[tokio::test]
    async fn busy_configuration_change_is_retried() {
        let control = FakeControl::new(Role::Leader);
        control.busy_once.lock().unwrap().push("n2".into());
        let (directory, _shutdown) = start(control.clone());
        tokio::task::yield_now().await;

        directory.merge([node("n2")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control.added().is_empty());
        assert!(control.busy_once.lock().unwrap().is_empty());

        eventually(|| control.added() == vec![("n2".to_string(), "n2:8222".to_string())]).await;
    }

    #[tokio::test]
    async fn departures_leave_configuration_alone() {
        let control = FakeControl::new(Role::Leader);
        let (directory, _shutdown) = start(control.clone());
        tokio::task::yield_now().await;

        directory.merge([node("n2")]);
        eventually(|| control.added().len() == 1).await;

        let mut dead = node("n2");
        dead.state = crate::membership::MemberState::Dead;
        dead.incarnation = 1;
        directory.merge([dead]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(control.added().len(), 1);
    }
}
