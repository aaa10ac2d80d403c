use crate::types::{Task, TaskStatus};
use chrono::Utc;
use flotilla_core::{FlotillaError, FlotillaResult};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Outcome of a cancellation attempt.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The task was still queued and has been removed.
    Removed(Task),
    /// The task is executing on the given agent; cancellation must be
    /// requested cooperatively.
    InFlight(Uuid),
    /// Terminal or unknown task; nothing to do.
    Noop,
}

/// Priority task table.
///
/// Queued tasks are totally ordered by `(priority, seq)`: lower priority
/// value first, FIFO within a band. Terminal tasks stay in the table until
/// pruned so late callbacks and status queries resolve.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    /// `(priority, seq, id)` of tasks currently in `Queued` state.
    queued: BTreeSet<(i32, u64, Uuid)>,
    next_seq: u64,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task in `Queued` state, stamping its FIFO sequence.
    pub fn enqueue(&mut self, mut task: Task) -> Uuid {
        task.seq = self.next_seq;
        self.next_seq += 1;
        task.status = TaskStatus::Queued;
        let id = task.id;
        self.queued.insert((task.priority, task.seq, id));
        self.tasks.insert(id, task);
        id
    }

    /// Look up a task.
    pub fn get(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// Queued tasks in scheduling order (priority, then FIFO).
    pub fn queued_in_order(&self) -> impl Iterator<Item = &Task> {
        self.queued.iter().filter_map(|(_, _, id)| self.tasks.get(id))
    }

    /// Transition a queued task to `Assigned` on the given agent.
    pub fn mark_assigned(&mut self, task_id: Uuid, agent_id: Uuid) -> FlotillaResult<()> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?;
        if task.status != TaskStatus::Queued {
            return Err(FlotillaError::Task(format!(
                "cannot assign task {task_id} in state {}",
                task.status
            )));
        }
        self.queued.remove(&(task.priority, task.seq, task_id));
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(Utc::now());
        task.assigned_agent = Some(agent_id);
        Ok(())
    }

    /// Transition an assigned task to `Completed`, returning a clone of
    /// its final record.
    pub fn mark_completed(&mut self, task_id: Uuid) -> FlotillaResult<Task> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?;
        if task.status != TaskStatus::Assigned {
            return Err(FlotillaError::Task(format!(
                "cannot complete task {task_id} in state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Completed;
        Ok(task.clone())
    }

    /// Transition an assigned task to `Failed`, returning a clone of its
    /// final record.
    pub fn mark_failed(&mut self, task_id: Uuid, reason: &str) -> FlotillaResult<Task> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?;
        if task.status != TaskStatus::Assigned {
            return Err(FlotillaError::Task(format!(
                "cannot fail task {task_id} in state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        Ok(task.clone())
    }

    /// Reset a failed task to `Queued`.
    ///
    /// The original priority is preserved; the task takes a fresh FIFO
    /// sequence (back of its priority band).
    pub fn requeue(&mut self, task_id: Uuid) -> FlotillaResult<()> {
        let next_seq = self.next_seq;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?;
        if !matches!(task.status, TaskStatus::Failed { .. }) {
            return Err(FlotillaError::Task(format!(
                "cannot requeue task {task_id} in state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Queued;
        task.seq = next_seq;
        task.assigned_at = None;
        task.assigned_agent = None;
        self.next_seq += 1;
        self.queued.insert((task.priority, task.seq, task_id));
        Ok(())
    }

    /// Cancel a task.
    ///
    /// Queued tasks are removed outright. Assigned tasks are reported as
    /// in-flight so the caller can request cooperative cancellation.
    /// Terminal and unknown tasks are a no-op, so cancelling an already
    /// completed task is never an error.
    pub fn cancel(&mut self, task_id: Uuid) -> CancelOutcome {
        match self.tasks.get(&task_id) {
            Some(task) if task.status == TaskStatus::Queued => {
                self.queued.remove(&(task.priority, task.seq, task_id));
                // Presence was checked by the match arm.
                match self.tasks.remove(&task_id) {
                    Some(task) => CancelOutcome::Removed(task),
                    None => CancelOutcome::Noop,
                }
            }
            Some(task) if task.status == TaskStatus::Assigned => match task.assigned_agent {
                Some(agent_id) => CancelOutcome::InFlight(agent_id),
                None => CancelOutcome::Noop,
            },
            _ => CancelOutcome::Noop,
        }
    }

    /// Count of queued tasks requiring `capability`.
    pub fn queue_depth(&self, capability: &str) -> usize {
        self.queued_in_order()
            .filter(|t| t.required_capability == capability)
            .count()
    }

    /// Count of tasks in `Queued` state.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Count of tasks in `Assigned` state.
    pub fn assigned_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Assigned)
            .count()
    }

    /// Total tracked tasks, terminal included.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drop terminal task records, returning how many were removed.
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| !t.status.is_terminal());
        before - self.tasks.len()
    }
}
