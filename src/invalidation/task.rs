//! Background refresh tasks and their queue.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::RefreshConfig;

/// Breadth of data a refresh task repopulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshScope {
    Org,
    Project,
    Global,
}

impl RefreshScope {
    /// Narrowest scope implied by an optional org/project pair.
    pub fn from_ids(org_id: Option<&str>, project_id: Option<&str>) -> Self {
        match (org_id, project_id) {
            (_, Some(_)) => Self::Project,
            (Some(_), None) => Self::Org,
            (None, None) => Self::Global,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Org => "org",
            Self::Project => "project",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain order: all `High` before any `Normal` before any `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPriority {
    High,
    Normal,
    Low,
}

impl RefreshPriority {
    pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];
}

/// A pending repopulation of one (user, scope, org, project) tuple.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshTask {
    pub id: String,
    pub user_id: String,
    pub scope: RefreshScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub priority: RefreshPriority,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(skip)]
    pub(crate) not_before: Option<Instant>,
}

impl RefreshTask {
    pub fn new(
        user_id: &str,
        org_id: Option<&str>,
        project_id: Option<&str>,
        priority: RefreshPriority,
        max_retries: u32,
    ) -> Self {
        let scope = RefreshScope::from_ids(org_id, project_id);
        Self {
            id: Self::task_id(user_id, scope, org_id, project_id),
            user_id: user_id.to_string(),
            scope,
            org_id: org_id.map(str::to_string),
            project_id: project_id.map(str::to_string),
            priority,
            created_at: Utc::now(),
            retries: 0,
            max_retries,
            not_before: None,
        }
    }

    /// Identity of the tuple. Two tasks with the same id are the same work.
    pub fn task_id(
        user_id: &str,
        scope: RefreshScope,
        org_id: Option<&str>,
        project_id: Option<&str>,
    ) -> String {
        format!(
            "{}|{}|{}|{}",
            user_id,
            scope,
            org_id.unwrap_or("-"),
            project_id.unwrap_or("-")
        )
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

/// Snapshot of the refresh queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Tasks waiting to run.
    pub total_tasks: usize,
    pub high_priority: usize,
    pub normal_priority: usize,
    pub low_priority: usize,
    /// Tasks taken by the worker and not settled yet.
    pub in_progress: usize,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    Requeued,
    /// A newer task for the same tuple was queued meanwhile.
    Superseded,
    /// Retries exhausted.
    Dropped,
    /// The queue was cleared while the task was in flight.
    Discarded,
}

/// A task taken from the queue, tagged with the queue generation.
#[derive(Debug)]
pub(crate) struct Claimed {
    pub task: RefreshTask,
    generation: u64,
}

/// Pending tasks keyed by id, so re-enqueueing a tuple replaces it.
#[derive(Debug, Default)]
pub(crate) struct RefreshQueue {
    pending: HashMap<String, RefreshTask>,
    in_progress: usize,
    generation: u64,
}

impl RefreshQueue {
    /// Queue `task`, replacing any pending task for the same tuple.
    /// Returns `true` if a pending task was replaced.
    pub fn enqueue(&mut self, task: RefreshTask) -> bool {
        self.pending.insert(task.id.clone(), task).is_some()
    }

    /// Take up to the configured batch of eligible tasks, highest priority
    /// first and oldest first within a priority.
    pub fn take_batch(&mut self, config: &RefreshConfig, now: Instant) -> Vec<Claimed> {
        let mut batch = Vec::new();

        for priority in RefreshPriority::ALL {
            let limit = match priority {
                RefreshPriority::High => config.high_batch,
                RefreshPriority::Normal => config.normal_batch,
                RefreshPriority::Low => config.low_batch,
            };
            if limit == 0 {
                continue;
            }

            let mut eligible: Vec<(&String, DateTime<Utc>)> = self
                .pending
                .iter()
                .filter(|(_, task)| task.priority == priority && task.is_eligible(now))
                .map(|(id, task)| (id, task.created_at))
                .collect();
            eligible.sort_by_key(|(_, created_at)| *created_at);

            let ids: Vec<String> = eligible
                .into_iter()
                .take(limit)
                .map(|(id, _)| id.clone())
                .collect();

            for id in ids {
                if let Some(task) = self.pending.remove(&id) {
                    batch.push(Claimed {
                        task,
                        generation: self.generation,
                    });
                }
            }
        }

        self.in_progress += batch.len();
        batch
    }

    /// Settle a successful task.
    pub fn complete(&mut self, _claimed: Claimed) {
        self.in_progress = self.in_progress.saturating_sub(1);
    }

    /// Settle a failed task: requeue with backoff, or drop it.
    pub fn retry(
        &mut self,
        claimed: Claimed,
        config: &RefreshConfig,
    ) -> (RetryOutcome, RefreshTask) {
        self.in_progress = self.in_progress.saturating_sub(1);

        let Claimed {
            mut task,
            generation,
        } = claimed;
        task.retries += 1;

        if generation != self.generation {
            return (RetryOutcome::Discarded, task);
        }
        if task.retries > task.max_retries {
            return (RetryOutcome::Dropped, task);
        }
        if self.pending.contains_key(&task.id) {
            return (RetryOutcome::Superseded, task);
        }

        task.created_at = Utc::now();
        task.not_before = Some(Instant::now() + config.backoff_for(task.retries));
        self.pending.insert(task.id.clone(), task.clone());
        (RetryOutcome::Requeued, task)
    }

    /// Return a task that was taken but never attempted.
    pub fn release(&mut self, claimed: Claimed) {
        self.in_progress = self.in_progress.saturating_sub(1);
        if claimed.generation == self.generation && !self.pending.contains_key(&claimed.task.id) {
            self.pending.insert(claimed.task.id.clone(), claimed.task);
        }
    }

    /// Forget pending tasks. In-flight ones are discarded when they settle.
    pub fn clear(&mut self) -> usize {
        self.generation += 1;
        let cleared = self.pending.len();
        self.pending.clear();
        cleared
    }

    pub fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            total_tasks: self.pending.len(),
            in_progress: self.in_progress,
            ..Default::default()
        };
        for task in self.pending.values() {
            match task.priority {
                RefreshPriority::High => status.high_priority += 1,
                RefreshPriority::Normal => status.normal_priority += 1,
                RefreshPriority::Low => status.low_priority += 1,
            }
        }
        status
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&RefreshTask> {
        self.pending.get(id)
    }
}
