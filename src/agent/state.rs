//! Per-turn mutable state
//!
//! Owned by exactly one turn and dropped when the turn reaches Done or
//! Failed. Never shared between turns.

use crate::models::{ToolCallRequest, ToolCallSignature, ToolObservation};
use std::collections::HashSet;
use uuid::Uuid;

/// Where the turn is in its Decide/Act/Synthesize cycle.
#[derive(Debug)]
pub(crate) enum TurnPhase {
    Decide,
    Act(ToolCallRequest),
    Synthesize { draft: Option<String> },
}

#[derive(Debug)]
pub(crate) struct AgentState {
    pub turn_id: Uuid,
    iteration: u32,
    max_iterations: u32,
    executed: HashSet<ToolCallSignature>,
    outputs: Vec<ToolObservation>,
    pending_feedback: Vec<String>,
    trace: Vec<String>,
}

impl AgentState {
    pub fn new(turn_id: Uuid, max_iterations: u32) -> Self {
        Self {
            turn_id,
            iteration: 0,
            max_iterations,
            executed: HashSet::new(),
            outputs: Vec::new(),
            pending_feedback: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Count one Decide→Act cycle. Saturates at the budget.
    pub fn advance(&mut self) {
        debug_assert!(self.iteration < self.max_iterations);
        self.iteration = (self.iteration + 1).min(self.max_iterations);
    }

    pub fn has_executed(&self, signature: &ToolCallSignature) -> bool {
        self.executed.contains(signature)
    }

    pub fn mark_executed(&mut self, signature: ToolCallSignature) {
        self.executed.insert(signature);
    }

    pub fn record_output(&mut self, observation: ToolObservation) {
        self.outputs.push(observation);
    }

    pub fn outputs(&self) -> &[ToolObservation] {
        &self.outputs
    }

    pub fn push_feedback(&mut self, note: String) {
        self.pending_feedback.push(note);
    }

    /// A redundancy notice supersedes whatever was pending.
    pub fn replace_feedback(&mut self, note: String) {
        self.pending_feedback.clear();
        self.pending_feedback.push(note);
    }

    /// Feedback is consumed by the next decision prompt.
    pub fn take_feedback(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_feedback)
    }

    pub fn trace(&mut self, entry: impl Into<String>) {
        self.trace.push(entry.into());
    }

    pub fn into_trace(self) -> Vec<String> {
        self.trace
    }
}
