//! Shared FIFO of pending commands.

use crate::command::Command;
use crate::error::DispatchError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Mutex-guarded command queue.
///
/// Many producers, one consumer. The consumer takes the whole backlog in a
/// single locked step and processes it after the lock is released.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command. Commands without request text are rejected.
    pub fn enqueue(&self, cmd: Command) -> Result<(), DispatchError> {
        if cmd.request.trim().is_empty() {
            return Err(DispatchError::EmptyRequest);
        }
        trace!(id = %cmd.id, request = %cmd.request, "command queued");
        self.lock().push_back(cmd);
        Ok(())
    }

    /// Take every queued command, oldest first, leaving the queue empty.
    pub fn drain(&self) -> Vec<Command> {
        let mut pending = self.lock();
        pending.drain(..).collect()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
