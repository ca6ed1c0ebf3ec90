use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::automaton::Automaton;
use crate::command::Command;
use crate::error::Result;
use crate::snapshot::Snapshot;

/// The process-wide automaton shared by every connection.
///
/// One lock guards the whole store: a write applies its entire byte sequence under the write
/// lock, reads take the read lock and therefore see a coherent (current state, accept set) pair.
#[derive(Debug, Default)]
pub struct Engine {
    store: RwLock<Automaton>,
    generation: u64,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    /// Attach to a store handed over by a previous instance.
    pub fn restore(snapshot: Snapshot) -> Self {
        let generation = snapshot.generation + 1;
        info!(generation, current = snapshot.automaton.current(), "engine restored");
        Engine { store: RwLock::new(snapshot.automaton), generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // Every mutation is a plain byte store, so a poisoned store is still consistent.
    fn lock(&self) -> RwLockReadGuard<'_, Automaton> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mut(&self) -> RwLockWriteGuard<'_, Automaton> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn control(&self, command: &Command) -> Result<()> {
        debug!(?command, "control");
        self.lock_mut().apply(command)
    }

    pub fn control_all(&self, commands: &[Command]) -> Result<()> {
        debug!(count = commands.len(), "control batch");
        self.lock_mut().apply_all(commands)
    }

    /// Feed bytes through the automaton. Returns how many were consumed, which is all of them.
    pub fn write(&self, input: &[u8]) -> usize {
        self.lock_mut().feed(input);
        input.len()
    }

    pub fn status(&self) -> u8 {
        self.lock().status()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().is_accepting()
    }

    /// `n` copies of the current status byte.
    pub fn read(&self, n: usize) -> Vec<u8> {
        vec![self.status(); n]
    }

    /// A coherent copy of the store, as of the last completed write.
    pub fn checkpoint(&self) -> Snapshot {
        Snapshot { generation: self.generation(), automaton: self.lock().clone() }
    }
}
