//! Per-request pipeline state.
//!
//! The original expresses its pipelines as callback-driven completions;
//! here each request is an explicit state machine advanced by the pipeline
//! code. Errors are latched into a single slot: the pipeline keeps
//! draining its pending counter and reports the first error once, when the
//! request finishes. The dirty-public set rides on the request and is
//! drained on every exit path.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::dirty::DirtySet;
use crate::error::{Result, VeilError};

/// Pipeline stages a request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    PreRead,
    Splice,
    Encrypt,
    Submit,
    Done,
    Error,
}

/// One in-flight hidden or public operation.
pub struct IoRequest {
    label: &'static str,
    state: PipelineState,
    error: Option<VeilError>,
    pending: AtomicU32,
    pub dirty: DirtySet,
}

impl IoRequest {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: PipelineState::PreRead,
            error: None,
            pending: AtomicU32::new(1),
            dirty: DirtySet::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Move to the next stage; latched errors win over any transition.
    pub fn advance(&mut self, next: PipelineState) {
        if self.error.is_none() {
            trace!(request = self.label, ?next, "pipeline advance");
            self.state = next;
        }
    }

    /// Latch the first error; later ones are dropped.
    pub fn latch(&mut self, err: VeilError) {
        if self.error.is_none() {
            self.error = Some(err);
            self.state = PipelineState::Error;
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Track an outstanding sub-operation.
    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Complete a sub-operation; returns the count still outstanding.
    pub fn dec_pending(&self) -> u32 {
        self.pending.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Finish the request: drain the dirty set and surface the latched
    /// error exactly once.
    pub fn finish(mut self) -> Result<()> {
        self.dirty.clear();
        self.dec_pending();
        match self.error.take() {
            Some(err) => Err(err),
            None => {
                self.state = PipelineState::Done;
                Ok(())
            }
        }
    }
}
