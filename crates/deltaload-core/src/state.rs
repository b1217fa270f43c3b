//! Externally observable pipeline state.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one pipeline, sampled by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Consuming and applying normally.
    Normal,
    /// Transient upstream error, retrying with backoff.
    Degraded,
    /// Terminal. A stopped pipeline does not restart.
    Stopped,
}

/// Lock-free cell holding a [`PipelineState`], shared between a pipeline
/// and the watchdog.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> PipelineState {
        match self.0.load(Ordering::Acquire) {
            0 => PipelineState::Normal,
            1 => PipelineState::Degraded,
            _ => PipelineState::Stopped,
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(PipelineState::Normal)
    }
}
