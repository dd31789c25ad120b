//! Write gateway: the only way client mutations enter the replicated log.
//!
//! Mutations are validated, rejected early on followers, and otherwise
//! replicated through the leader with a bounded wait. Reads go straight to
//! the local store and may be stale on a follower.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::bridge::VoterControl;
use crate::command::Command;
use crate::error::KvError;
use crate::fsm::ApplyOutcome;
use crate::raft::transport::Transport;
use crate::raft::{NodeId, RaftNode, RaftStatus, Role, Term};
use crate::store::KvStore;

/// What the gateway needs from the consensus engine.
pub trait Consensus: VoterControl {
    fn apply_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> impl Future<Output = Result<ApplyOutcome, KvError>> + Send;

    fn status(&self) -> RaftStatus;
}

impl<T: Transport> Consensus for RaftNode<T> {
    async fn apply_command(&self, command: Command, timeout: Duration) -> Result<ApplyOutcome, KvError> {
        RaftNode::apply_command(self, command, timeout).await
    }

    fn status(&self) -> RaftStatus {
        RaftNode::status(self)
    }
}

/// Body of `GET /Leader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderStatus {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
}

pub struct WriteGateway<C: Consensus> {
    consensus: Arc<C>,
    store: Arc<KvStore>,
    apply_timeout: Duration,
}

impl<C: Consensus> WriteGateway<C> {
    pub fn new(consensus: Arc<C>, store: Arc<KvStore>, apply_timeout: Duration) -> Self {
        Self {
            consensus,
            store,
            apply_timeout,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<ApplyOutcome, KvError> {
        validate("key", key)?;
        validate("value", value)?;
        self.ensure_leader()?;
        let command = Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        let outcome = self.consensus.apply_command(command, self.apply_timeout).await?;
        debug!(key, index = outcome.index, "set applied");
        Ok(outcome)
    }

    pub async fn delete(&self, key: &str) -> Result<ApplyOutcome, KvError> {
        validate("key", key)?;
        self.ensure_leader()?;
        let command = Command::Delete {
            key: key.to_string(),
        };
        let outcome = self.consensus.apply_command(command, self.apply_timeout).await?;
        debug!(key, index = outcome.index, "delete applied");
        Ok(outcome)
    }

    /// Local read; no consensus round.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Adds a voter by hand, bypassing gossip.
    pub async fn join(&self, id: &str, addr: &str) -> Result<(), KvError> {
        if id.is_empty() || addr.is_empty() {
            return Err(KvError::InvalidInput("follower id and address are required".into()));
        }
        self.ensure_leader()?;
        self.consensus.add_voter(id, addr, self.apply_timeout).await?;
        info!(follower = id, addr, "follower added through join request");
        Ok(())
    }

    pub fn leader_status(&self) -> LeaderStatus {
        let status = self.consensus.status();
        LeaderStatus {
            is_leader: status.role == Role::Leader,
            node_id: status.id,
            role: status.role,
            term: status.term,
            leader: status.leader,
        }
    }

    fn ensure_leader(&self) -> Result<(), KvError> {
        let role = self.consensus.role();
        if role.is_leader() {
            Ok(())
        } else {
            Err(KvError::NotLeader {
                leader: role.leader,
            })
        }
    }
}

fn validate(what: &str, text: &str) -> Result<(), KvError> {
    if text.is_empty() {
        return Err(KvError::InvalidInput(format!("{what} must not be empty")));
    }
    if text.contains('/') {
        return Err(KvError::InvalidInput(format!("{what} must not contain '/'")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::raft::types::VoterConfiguration;
    use crate::raft::RoleState;
    use std::sync::Mutex;
    use tokio::sync::watch;

    /// Consensus stand-in that applies commands straight to the store.
    pub(crate) struct FakeConsensus {
        pub role_tx: watch::Sender<RoleState>,
        pub store: Arc<KvStore>,
        pub fail_with: Mutex<Option<fn() -> KvError>>,
        pub voters: Mutex<Vec<(String, String)>>,
    }

    impl FakeConsensus {
        pub(crate) fn new(role: Role, store: Arc<KvStore>) -> Arc<Self> {
            let leader = match role {
                Role::Leader => Some("node1".to_string()),
                _ => Some("node2".to_string()),
            };
            let (role_tx, _) = watch::channel(RoleState {
                role,
                term: 4,
                leader,
            });
            Arc::new(Self {
                role_tx,
                store,
                fail_with: Mutex::new(None),
                voters: Mutex::new(Vec::new()),
            })
        }

        fn failure(&self) -> Option<KvError> {
            self.fail_with.lock().unwrap().map(|f| f())
        }
    }

    impl VoterControl for FakeConsensus {
        fn role(&self) -> RoleState {
            self.role_tx.borrow().clone()
        }

        fn role_changes(&self) -> watch::Receiver<RoleState> {
            self.role_tx.subscribe()
        }

        async fn add_voter(&self, id: &str, addr: &str, _timeout: Duration) -> Result<(), KvError> {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            self.voters.lock().unwrap().push((id.into(), addr.into()));
            Ok(())
        }
    }

    impl Consensus for FakeConsensus {
        async fn apply_command(&self, command: Command, _timeout: Duration) -> Result<ApplyOutcome, KvError> {
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let previous = match command {
                Command::Set { key, value } => self.store.set(key, value),
                Command::Delete { key } => self.store.delete(&key),
            };
            Ok(ApplyOutcome { index: 1, previous })
        }

        fn status(&self) -> RaftStatus {
            let role = self.role();
            RaftStatus {
                id: "node1".into(),
                role: role.role,
                term: role.term,
                leader: role.leader,
                commit_index: 0,
                last_applied: 0,
                last_log_index: 0,
                snapshot_index: 0,
                voters: VoterConfiguration::default(),
            }
        }
    }

    fn gateway(role: Role) -> (WriteGateway<FakeConsensus>, Arc<FakeConsensus>) {
        let store = Arc::new(KvStore::new());
        let consensus = FakeConsensus::new(role, store.clone());
        (
            WriteGateway::new(consensus.clone(), store, Duration::from_secs(1)),
            consensus,
        )
    }

    #[tokio::test]
    async fn leader_writes_reach_the_store() {
        let (gateway, _) = gateway(Role::Leader);
        gateway.set("a", "1").await.unwrap();
        assert_eq!(gateway.get("a").as_deref(), Some("1"));

        let outcome = gateway.delete("a").await.unwrap();
        assert_eq!(outcome.previous.as_deref(), Some("1"));
        assert_eq!(gateway.get("a"), None);
    }

    #[tokio::test]
    async fn follower_rejects_with_leader_hint() {
        let (gateway, _) = gateway(Role::Follower);
        match gateway.set("a", "1").await {
            Err(KvError::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("node2")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
        assert!(matches!(
            gateway.join("n3", "n3:8222").await,
            Err(KvError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_consensus() {
        let (gateway, _) = gateway(Role::Leader);
        assert!(matches!(gateway.set("", "v").await, Err(KvError::InvalidInput(_))));
        assert!(matches!(gateway.set("k", "").await, Err(KvError::InvalidInput(_))));
        assert!(matches!(gateway.set("a/b", "v").await, Err(KvError::InvalidInput(_))));
        assert!(matches!(gateway.delete("").await, Err(KvError::InvalidInput(_))));
        assert!(matches!(gateway.join("", "x").await, Err(KvError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn timeout_surfaces_unchanged() {
        let (gateway, consensus) = gateway(Role::Leader);
        *consensus.fail_with.lock().unwrap() = Some(|| KvError::Timeout);
        assert!(matches!(gateway.set("k", "v").await, Err(KvError::Timeout)));
    }

    #[test]
    fn leader_status_reflects_role() {
        let (gateway, _) = gateway(Role::Leader);
        let status = gateway.leader_status();
        assert!(status.is_leader);
        assert_eq!(status.term, 4);
        assert_eq!(status.leader.as_deref(), Some("node1"));
    }
}
