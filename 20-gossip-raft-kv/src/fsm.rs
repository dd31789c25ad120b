//! The replicated state machine: committed log entries in, key-value state out.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::trace;

use crate::command::Command;
use crate::error::ApplyError;
use crate::raft::types::{EntryKind, LogEntry, LogIndex};
use crate::store::KvStore;

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub index: LogIndex,
    /// Value the key held before the command, if any.
    pub previous: Option<String>,
}

/// Contract between the consensus engine and the application state.
///
/// The engine calls `apply` once per committed index, in ascending order, from
/// a single thread. `snapshot` and `restore` are never called concurrently with
/// `apply`.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome, ApplyError>;

    fn snapshot(&self, out: &mut dyn Write) -> Result<(), ApplyError>;

    /// Replaces the whole state with the one read from `input`.
    fn restore(&self, input: &mut dyn Read) -> Result<(), ApplyError>;
}

/// Applies [`Command`]s to a shared [`KvStore`].
#[derive(Debug, Clone)]
pub struct KvFsm {
    store: Arc<KvStore>,
}

impl KvFsm {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

impl StateMachine for KvFsm {
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome, ApplyError> {
        // Configuration and no-op entries only matter to the engine.
        if entry.kind != EntryKind::Command {
            return Ok(ApplyOutcome {
                index: entry.index,
                previous: None,
            });
        }

        let command = Command::decode(&entry.payload).map_err(|source| ApplyError::Decode {
            index: entry.index,
            source,
        })?;
        trace!(index = entry.index, key = command.key(), "applying command");

        let previous = match command {
            Command::Set { key, value } => self.store.set(key, value),
            Command::Delete { key } => self.store.delete(&key),
        };
        Ok(ApplyOutcome {
            index: entry.index,
            previous,
        })
    }

    fn snapshot(&self, out: &mut dyn Write) -> Result<(), ApplyError> {
        serde_json::to_writer(&mut *out, &self.store.entries())?;
        out.flush()?;
        Ok(())
    }

    fn restore(&self, input: &mut dyn Read) -> Result<(), ApplyError> {
        let data: BTreeMap<String, String> = serde_json::from_reader(input)?;
        self.store.replace(data);
        Ok(())
    }
}
