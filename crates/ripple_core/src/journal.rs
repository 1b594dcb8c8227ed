//! Change journal
//!
//! Writes to tracked states do not touch the committed snapshot. They are
//! recorded here, keyed by state, in chunks separated by markers:
//!
//! ```text
//!   sealed chunk 0   sealed chunk 1        live chunk
//!  [a=1, b=2]  <-  [a=3]            <-  [c=4]
//!                                ^ marker (sync_changes)
//! ```
//!
//! `update_snapshot` consumes everything before the newest marker through a
//! [`Changes`] view; writes made after the marker keep accumulating in the live
//! chunk and are picked up by the next cycle.

use rustc_hash::FxHashMap;
use std::any::Any;

use crate::state::StateId;

#[derive(Default)]
struct Chunk {
    changes: FxHashMap<StateId, Box<dyn Any>>,
}

impl Chunk {
    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Chunked staging area for state writes between update passes
pub struct Journal {
    /// Oldest first; the last chunk is the live one
    chunks: Vec<Chunk>,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            chunks: vec![Chunk::default()],
        }
    }

    fn live(&self) -> &Chunk {
        // the chain always holds the live chunk
        &self.chunks[self.chunks.len() - 1]
    }

    fn live_chunk_mut(&mut self) -> &mut Chunk {
        let last = self.chunks.len() - 1;
        &mut self.chunks[last]
    }

    /// Record a pending value in the live chunk, replacing an earlier value
    /// written to the same chunk
    pub fn add_change(&mut self, state: StateId, value: Box<dyn Any>) {
        self.live_chunk_mut().changes.insert(state, value);
    }

    /// Seal the live chunk. A new chunk is started only when the live one
    /// holds at least one change.
    pub fn set_marker(&mut self) {
        if !self.live().is_empty() {
            self.chunks.push(Chunk::default());
        }
    }

    /// View over every change recorded before the newest marker
    pub fn changes(&mut self) -> Changes<'_> {
        let sealed = self.chunks.len() - 1;
        Changes {
            chunks: &mut self.chunks[..sealed],
        }
    }

    /// Newest pending value of a state, including the live chunk
    pub fn latest(&self, state: StateId) -> Option<&dyn Any> {
        self.chunks
            .iter()
            .rev()
            .find_map(|chunk| chunk.changes.get(&state))
            .map(|value| value.as_ref())
    }

    /// Pending value of a state in the live chunk
    pub fn live_mut(&mut self, state: StateId) -> Option<&mut Box<dyn Any>> {
        self.live_chunk_mut().changes.get_mut(&state)
    }

    pub fn live_contains(&self, state: StateId) -> bool {
        self.live().changes.contains_key(&state)
    }

    /// Drop every entry recorded for a state (used when the state is disposed)
    pub fn forget(&mut self, state: StateId) {
        for chunk in &mut self.chunks {
            chunk.changes.remove(&state);
        }
    }

    /// Drop every sealed chunk; the live chunk survives
    pub fn clear(&mut self) {
        let live = self.chunks.pop().unwrap_or_default();
        self.chunks.clear();
        self.chunks.push(live);
    }

    /// Returns true when the live chunk holds a change
    pub fn has_live_changes(&self) -> bool {
        !self.live().is_empty()
    }

    /// Number of chunks in the chain, the live one included
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes recorded before the newest marker
pub struct Changes<'a> {
    chunks: &'a mut [Chunk],
}

impl Changes<'_> {
    /// Consume the newest pending value for a state. Older values of the same
    /// state are superseded and dropped.
    pub fn take(&mut self, state: StateId) -> Option<Box<dyn Any>> {
        let mut newest = None;
        for chunk in self.chunks.iter_mut().rev() {
            if let Some(value) = chunk.changes.remove(&state) {
                if newest.is_none() {
                    newest = Some(value);
                }
            }
        }
        newest
    }
}
