//! Programs under construction.
//!
//! A [`ProgramDraft`] accumulates frames until it is committed to the store
//! under a name that must not already be taken. Drafts live in a bounded
//! [`HandleRegistry`], so only [`AUTHORING_CAPACITY`] can be open at once.

use crate::error::Result;
use crate::program::{Frame, Program};
use crate::registry::HandleRegistry;
use crate::store::ProgramStore;
use crate::tracing::prelude::*;

/// Maximum number of drafts open at the same time.
pub const AUTHORING_CAPACITY: usize = 10;

/// Drafts keyed by the name they will be committed under.
pub type DraftPool = HandleRegistry<ProgramDraft>;

pub fn draft_pool() -> DraftPool {
    HandleRegistry::with_capacity(AUTHORING_CAPACITY)
}

#[derive(Debug, Clone, Default)]
pub struct ProgramDraft {
    frames: Vec<Frame>,
}

impl ProgramDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self, frame: impl Into<Frame>) {
        self.frames.push(frame.into());
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn to_program(&self) -> Program {
        Program::new(self.frames.clone())
    }
}

/// Open an empty draft named `name`.
pub fn open_draft(pool: &mut DraftPool, name: &str) -> Result<()> {
    pool.register(name, ProgramDraft::new())?;
    debug!(
        draft = name,
        open = pool.len(),
        capacity = pool.capacity(),
        "Draft opened"
    );
    Ok(())
}

/// Move the draft `name` into the store.
///
/// The draft stays open if the store already has a program by that name.
pub fn commit_draft(pool: &mut DraftPool, name: &str, store: &ProgramStore) -> Result<()> {
    let program = pool.get(name)?.to_program();
    store.insert_new(name, program)?;
    pool.remove(name)?;
    info!(program = name, "Draft committed");
    Ok(())
}
