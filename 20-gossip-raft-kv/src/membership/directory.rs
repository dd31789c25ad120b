use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ClusterNode, MemberState, MembershipEvent};

const EVENT_CAPACITY: usize = 256;

/// Merged view of the cluster, keyed by node id.
///
/// Reports about a node are ordered by incarnation; on a tie the "more dead"
/// state wins, so a departure cannot be undone by a stale alive report. Only
/// the node itself raises its incarnation, which is how it refutes a stale
/// report of its own death.
#[derive(Debug)]
pub struct MembershipDirectory {
    local_id: String,
    members: RwLock<BTreeMap<String, ClusterNode>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipDirectory {
    pub fn new(local: ClusterNode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut members = BTreeMap::new();
        let local_id = local.id.clone();
        members.insert(local.id.clone(), local);
        Self {
            local_id,
            members: RwLock::new(members),
            events,
        }
    }

    /// Joins and departures of other nodes, in the order they were merged.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> Option<ClusterNode> {
        self.read().get(&self.local_id).cloned()
    }

    pub fn get(&self, id: &str) -> Option<ClusterNode> {
        self.read().get(id).cloned()
    }

    /// Every known member, including this node and dead ones.
    pub fn members(&self) -> Vec<ClusterNode> {
        self.read().values().cloned().collect()
    }

    pub fn alive_members(&self) -> Vec<ClusterNode> {
        self.read().values().filter(|n| n.is_alive()).cloned().collect()
    }

    /// Folds reports from a peer into the local view and publishes the
    /// resulting joins and departures.
    pub fn merge(&self, reports: impl IntoIterator<Item = ClusterNode>) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        {
            let mut members = self.write();
            for report in reports {
                if report.id == self.local_id {
                    Self::refute(&mut members, &self.local_id, &report);
                    continue;
                }
                match members.get(&report.id) {
                    Some(known) if !supersedes(&report, known) => continue,
                    Some(known) => {
                        let was_alive = known.is_alive();
                        if !was_alive && report.is_alive() {
                            events.push(MembershipEvent::Joined(report.clone()));
                        } else if was_alive && report.state == MemberState::Dead {
                            events.push(MembershipEvent::Left(report.clone()));
                        }
                    }
                    None => {
                        if report.is_alive() {
                            events.push(MembershipEvent::Joined(report.clone()));
                        }
                    }
                }
                members.insert(report.id.clone(), report);
            }
        }

        for event in &events {
            match event {
                MembershipEvent::Joined(node) => {
                    info!(member = %node.id, raft_addr = %node.raft_addr, "member joined")
                }
                MembershipEvent::Left(node) => info!(member = %node.id, "member left"),
            }
            // No subscribers is fine; the bridge rescans on start.
            let _ = self.events.send(event.clone());
        }
        events
    }

    /// Marks this node dead so the next exchanges spread the departure.
    pub fn leave(&self) -> Option<ClusterNode> {
        let mut members = self.write();
        let local = members.get_mut(&self.local_id)?;
        local.incarnation += 1;
        local.state = MemberState::Dead;
        info!(member = %local.id, incarnation = local.incarnation, "leaving cluster");
        Some(local.clone())
    }

    fn refute(members: &mut BTreeMap<String, ClusterNode>, local_id: &str, report: &ClusterNode) {
        let Some(local) = members.get_mut(local_id) else {
            return;
        };
        if local.state == MemberState::Dead {
            return;
        }
        if report.state != MemberState::Alive && report.incarnation >= local.incarnation {
            local.incarnation = report.incarnation + 1;
            debug!(member = %local.id, incarnation = local.incarnation, "refuting stale report about self");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ClusterNode>> {
        self.members.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ClusterNode>> {
        self.members.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Whether `report` should replace `known`.
fn supersedes(report: &ClusterNode, known: &ClusterNode) -> bool {
    match report.incarnation.cmp(&known.incarnation) {
        std::cmp::Ordering::Greater => report != known,
        std::cmp::Ordering::Equal => report.state > known.state,
        std::cmp::Ordering::Less => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, state: MemberState, incarnation: u64) -> ClusterNode {
        ClusterNode {
            state,
            incarnation,
            ..ClusterNode::new(id, format!("{id}:2222"), format!("{id}:8222"), format!("{id}:7946"))
        }
    }

    #[test]
    fn new_alive_member_emits_join() {
        let dir = MembershipDirectory::new(node("a", MemberState::Alive, 0));
        let mut rx = dir.subscribe();

        let events = dir.merge([node("b", MemberState::Alive, 0)]);
        assert_eq!(events, vec![MembershipEvent::Joined(node("b", MemberState::Alive, 0))]);
        assert_eq!(rx.try_recv().unwrap(), events[0]);

        // The same report again changes nothing.
        assert!(dir.merge([node("b", MemberState::Alive, 0)]).is_empty());
        assert_eq!(dir.alive_members().len(), 2);
    }

    #[test]
    fn dead_wins_ties_and_newer_incarnation_revives() {
        let dir = MembershipDirectory::new(node("a", MemberState::Alive, 0));
        dir.merge([node("b", MemberState::Alive, 3)]);

        let events = dir.merge([node("b", MemberState::Dead, 3)]);
        assert!(matches!(events.as_slice(), [MembershipEvent::Left(n)] if n.id == "b"));

        // A stale alive report cannot undo the departure.
        assert!(dir.merge([node("b", MemberState::Alive, 3)]).is_empty());
        assert!(dir.merge([node("b", MemberState::Alive, 2)]).is_empty());
        assert_eq!(dir.get("b").unwrap().state, MemberState::Dead);

        let events = dir.merge([node("b", MemberState::Alive, 4)]);
        assert!(matches!(events.as_slice(), [MembershipEvent::Joined(n)] if n.id == "b"));
    }

    #[test]
    fn local_node_refutes_reports_of_its_death() {
        let dir = MembershipDirectory::new(node("a", MemberState::Alive, 0));
        let events = dir.merge([node("a", MemberState::Suspect, 0)]);
        assert!(events.is_empty());

        let local = dir.local().unwrap();
        assert_eq!(local.state, MemberState::Alive);
        assert_eq!(local.incarnation, 1);
    }

    #[test]
    fn leave_marks_self_dead_with_new_incarnation() {
        let dir = MembershipDirectory::new(node("a", MemberState::Alive, 2));
        let local = dir.leave().unwrap();
        assert_eq!(local.state, MemberState::Dead);
        assert_eq!(local.incarnation, 3);
        assert!(dir.alive_members().is_empty());
    }
}
