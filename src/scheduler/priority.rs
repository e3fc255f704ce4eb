//! Due ordering - the order in which one poll processes its due set

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::TaskDescriptor;

/// A descriptor found due in this poll
#[derive(Debug, Clone)]
pub struct DueTask {
    pub task: TaskDescriptor,
    /// Slot being claimed: the descriptor's next run, or for per-machine
    /// descriptors the next run derived from this machine's own history
    pub due_slot: DateTime<Utc>,
}

impl DueTask {
    pub fn new(task: TaskDescriptor, due_slot: DateTime<Utc>) -> Self {
        Self { task, due_slot }
    }
}

impl PartialEq for DueTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DueTask {}

impl PartialOrd for DueTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueTask {
    /// `Less` means "process first"
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        other
            .task
            .priority
            .cmp(&self.task.priority)
            // Within same priority, oldest due slot first
            .then_with(|| self.due_slot.cmp(&other.due_slot))
            .then_with(|| self.task.id.cmp(&other.task.id))
    }
}

/// Sort a due set into processing order
pub fn order_due(mut due: Vec<DueTask>) -> Vec<DueTask> {
    due.sort();
    due
}
