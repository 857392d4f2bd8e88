//! Invalidation service - turns authorization changes into precise cache
//! invalidations, queued background refreshes and subscriber events.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::event::{Subscribers, panic_message};
use super::task::{Claimed, RefreshQueue, RetryOutcome};
use super::{
    InvalidationEvent, InvalidationKind, QueueStatus, RefreshConfig, RefreshPriority,
    RefreshScope, RefreshTask, Subscription,
};
use crate::cache::keys::{self, PermissionScope};
use crate::cache::{CacheManager, InvalidationPattern};

/// Invalidations slower than this get a warning; they sit on the mutation
/// path.
const SLOW_INVALIDATION: Duration = Duration::from_millis(100);

/// Refill routine supplied by the authorization provider.
///
/// Implemented for any `Fn(RefreshTask) -> impl Future<Output = anyhow::Result<()>>`.
pub trait RefreshHandler: Send + Sync + 'static {
    fn refresh(&self, task: RefreshTask) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> RefreshHandler for F
where
    F: Fn(RefreshTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn refresh(&self, task: RefreshTask) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(task))
    }
}

/// Why a refresh attempt failed.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("refresh handler panicked: {0}")]
    Panicked(String),
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub taken: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Returned to the queue untouched because the service stopped.
    pub released: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.taken == 0
    }
}

/// Tasks a drain pass has taken and not settled.
#[derive(Debug, Default)]
struct Staged {
    waiting: VecDeque<Claimed>,
    running: Option<Claimed>,
}

/// State shared with the background worker.
struct Shared {
    cache: Arc<CacheManager>,
    config: RefreshConfig,
    queue: Mutex<RefreshQueue>,
    /// The worker's current batch, so `stop` can hand it back.
    staged: Mutex<Staged>,
    subscribers: Subscribers,
    refreshers: RwLock<HashMap<RefreshScope, Arc<dyn RefreshHandler>>>,
    stopped: AtomicBool,
    destroyed: AtomicBool,
}

/// Event-driven invalidation and background refresh over a
/// [`CacheManager`].
///
/// Every `invalidate_*` call is synchronous and never fails: it clears the
/// affected keys, queues one refresh task for the (user, scope) tuple,
/// notifies subscribers and returns. The worker started by
/// [`start`](Self::start) repopulates the cache later through the
/// registered [`RefreshHandler`]s.
pub struct InvalidationService {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationService {
    pub fn new(cache: Arc<CacheManager>, config: RefreshConfig) -> Self {
        info!(
            "Invalidation service initialized (refresh every {:?}, max retries {})",
            config.interval, config.max_retries
        );

        Self {
            shared: Arc::new(Shared {
                cache,
                config,
                queue: Mutex::new(RefreshQueue::default()),
                staged: Mutex::new(Staged::default()),
                subscribers: Subscribers::default(),
                refreshers: RwLock::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.shared.cache
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.shared.config
    }

    /// Register the refill routine for `scope`, replacing any previous one.
    pub fn register_refresher<H: RefreshHandler>(&self, scope: RefreshScope, handler: H) {
        self.shared
            .refreshers
            .write()
            .insert(scope, Arc::new(handler));
        debug!("Refresher registered for {} scope", scope);
    }

    /// Receive every event of `kind`.
    pub fn subscribe<F>(&self, kind: InvalidationKind, callback: F) -> Subscription
    where
        F: Fn(&InvalidationEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(kind, callback)
    }

    pub fn subscriber_count(&self, kind: InvalidationKind) -> usize {
        self.shared.subscribers.count(kind)
    }

    /// A user's role changed.
    ///
    /// Clears the user's auth entry, the role entry, the permissions of the
    /// implied scope (all of them for a global change) and the user's
    /// batched checks.
    pub fn invalidate_role_change(
        &self,
        user_id: &str,
        role_type: &str,
        org_id: Option<&str>,
        project_id: Option<&str>,
    ) {
        let scope = PermissionScope::from_ids(org_id, project_id);
        let patterns = [
            keys::user_auth_pattern(user_id),
            InvalidationPattern::subtree(keys::user_roles(user_id, role_type)),
            permission_pattern(user_id, &scope),
            keys::user_permission_batch_pattern(user_id),
        ];
        let event = InvalidationEvent::new(InvalidationKind::RoleChange, user_id, org_id, project_id)
            .with_role_type(role_type);

        self.apply(event, &patterns, RefreshPriority::High);
    }

    /// A user's permissions changed.
    pub fn invalidate_permission_change(
        &self,
        user_id: &str,
        org_id: Option<&str>,
        project_id: Option<&str>,
    ) {
        let scope = PermissionScope::from_ids(org_id, project_id);
        let patterns = [
            keys::user_auth_pattern(user_id),
            permission_pattern(user_id, &scope),
            keys::user_permission_batch_pattern(user_id),
        ];
        let event = InvalidationEvent::new(
            InvalidationKind::PermissionChange,
            user_id,
            org_id,
            project_id,
        );

        self.apply(event, &patterns, RefreshPriority::High);
    }

    /// A user joined or left an organization.
    pub fn invalidate_org_membership_change(&self, user_id: &str, org_id: &str) {
        let scope = PermissionScope::Org(org_id.to_string());
        let patterns = [
            keys::user_auth_pattern(user_id),
            InvalidationPattern::subtree(keys::user_org(user_id, org_id)),
            permission_pattern(user_id, &scope),
            keys::user_permission_batch_pattern(user_id),
        ];
        let event = InvalidationEvent::new(
            InvalidationKind::OrgMembershipChange,
            user_id,
            Some(org_id),
            None,
        );

        self.apply(event, &patterns, RefreshPriority::Normal);
    }

    /// A user joined or left a project.
    pub fn invalidate_project_membership_change(&self, user_id: &str, project_id: &str) {
        let scope = PermissionScope::Project(project_id.to_string());
        let patterns = [
            keys::user_auth_pattern(user_id),
            InvalidationPattern::subtree(keys::user_project(user_id, project_id)),
            permission_pattern(user_id, &scope),
            keys::user_permission_batch_pattern(user_id),
        ];
        let event = InvalidationEvent::new(
            InvalidationKind::ProjectMembershipChange,
            user_id,
            None,
            Some(project_id),
        );

        self.apply(event, &patterns, RefreshPriority::Normal);
    }

    fn apply(
        &self,
        event: InvalidationEvent,
        patterns: &[InvalidationPattern],
        priority: RefreshPriority,
    ) {
        let started = Instant::now();

        let mut removed = 0;
        for pattern in patterns {
            let cache = &self.shared.cache;
            match panic::catch_unwind(AssertUnwindSafe(|| cache.invalidate(pattern))) {
                Ok(count) => removed += count,
                Err(payload) => error!(
                    "Invalidation of '{}' failed: {}",
                    pattern,
                    panic_message(payload.as_ref())
                ),
            }
        }

        let task = RefreshTask::new(
            &event.user_id,
            event.org_id.as_deref(),
            event.project_id.as_deref(),
            priority,
            self.shared.config.max_retries,
        );
        self.shared.enqueue(task);

        let delivered = self.shared.subscribers.publish(&event);

        let elapsed = started.elapsed();
        debug!(
            "{} for user {}: {} entries removed, {} subscribers notified in {:?}",
            event.kind, event.user_id, removed, delivered, elapsed
        );
        if elapsed > SLOW_INVALIDATION {
            warn!(
                "Slow invalidation ({:?}) for {} of user {}",
                elapsed, event.kind, event.user_id
            );
        }
    }

    /// Queue a refresh without invalidating anything, e.g. to pre-warm a
    /// user after sign-in at low priority.
    pub fn schedule_refresh(
        &self,
        user_id: &str,
        org_id: Option<&str>,
        project_id: Option<&str>,
        priority: RefreshPriority,
    ) {
        let task = RefreshTask::new(
            user_id,
            org_id,
            project_id,
            priority,
            self.shared.config.max_retries,
        );
        self.shared.enqueue(task);
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.shared.queue.lock().status()
    }

    /// Drop every pending task. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let cleared = self.shared.queue.lock().clear();
        if cleared > 0 {
            info!("Cleared {} pending refresh tasks", cleared);
        }
        cleared
    }

    /// Run one drain pass now, independent of the worker timer.
    pub async fn process_queue(&self) -> DrainReport {
        let staged = Mutex::new(Staged::default());
        self.shared.drain(&staged).await
    }

    /// Start the background worker. Needs a tokio runtime; no-op if the
    /// worker is already running or the service was destroyed.
    pub fn start(&self) {
        if self.shared.destroyed.load(Ordering::Acquire) {
            warn!("Invalidation service destroyed, refusing to start");
            return;
        }

        let mut slot = self.worker.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.shared.config.interval;
        if period.is_zero() {
            warn!("Refresh interval is zero, refresh worker not started");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime, refresh worker not started");
            return;
        };

        self.shared.stopped.store(false, Ordering::Release);
        let shared = Arc::downgrade(&self.shared);

        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.stopped.load(Ordering::Acquire) {
                    break;
                }

                let report = shared.drain(&shared.staged).await;
                if !report.is_empty() {
                    debug!("Refresh tick: {:?}", report);
                }
            }
        }));

        info!("Refresh worker started (every {:?})", period);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the worker without awaiting it. Every task of its current
    /// batch, including a refresh cut off mid-flight, goes back to the
    /// queue untouched. Safe to call more than once.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);

        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            let released = self.shared.release_staged(&self.shared.staged);
            info!("Refresh worker stopped, {} taken tasks requeued", released);
        }
    }

    /// Stop the worker and release queue, subscribers and refreshers.
    /// The service cannot be restarted afterwards.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop();
        self.clear_queue();
        self.shared.subscribers.clear();
        self.shared.refreshers.write().clear();
        info!("Invalidation service destroyed");
    }
}

impl Drop for InvalidationService {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for InvalidationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationService")
            .field("queue", &self.queue_status())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Shared {
    fn enqueue(&self, task: RefreshTask) {
        if self.destroyed.load(Ordering::Acquire) {
            debug!("Service destroyed, not queueing {}", task.id);
            return;
        }

        let id = task.id.clone();
        let priority = task.priority;
        if self.queue.lock().enqueue(task) {
            debug!("Replaced pending refresh task {}", id);
        } else {
            debug!("Queued {:?} refresh task {}", priority, id);
        }
    }

    /// Take one batch and work through it. `staged` holds whatever has
    /// been taken and not settled; a stop hands it back to the queue.
    async fn drain(&self, staged: &Mutex<Staged>) -> DrainReport {
        let mut report = DrainReport::default();
        if self.stopped.load(Ordering::Acquire) {
            return report;
        }

        let batch = self.queue.lock().take_batch(&self.config, Instant::now());
        report.taken = batch.len();
        staged.lock().waiting.extend(batch);

        loop {
            let task = {
                let mut staged = staged.lock();
                if self.stopped.load(Ordering::Acquire) {
                    break;
                }
                let Some(claimed) = staged.waiting.pop_front() else {
                    break;
                };
                let task = claimed.task.clone();
                staged.running = Some(claimed);
                task
            };

            let result = self.run(&task).await;

            // Gone if `stop` already handed it back.
            let Some(claimed) = staged.lock().running.take() else {
                continue;
            };
            if self.settle(claimed, result) {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        report.released = self.release_staged(staged);
        report
    }

    /// Return every staged task to the queue as it was taken.
    fn release_staged(&self, staged: &Mutex<Staged>) -> usize {
        let claims: Vec<Claimed> = {
            let mut staged = staged.lock();
            let running = staged.running.take();
            running.into_iter().chain(staged.waiting.drain(..)).collect()
        };

        let released = claims.len();
        if released > 0 {
            let mut queue = self.queue.lock();
            for claimed in claims {
                queue.release(claimed);
            }
        }
        released
    }

    async fn run(&self, task: &RefreshTask) -> Result<(), RefreshError> {
        let handler = self.refreshers.read().get(&task.scope).cloned();
        let Some(handler) = handler else {
            debug!(
                "No refresher for {} scope, task {} has nothing to do",
                task.scope, task.id
            );
            return Ok(());
        };

        let attempt = AssertUnwindSafe(handler.refresh(task.clone())).catch_unwind();
        match tokio::time::timeout(self.config.refresh_timeout, attempt).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(RefreshError::Handler(e)),
            Ok(Err(payload)) => Err(RefreshError::Panicked(
                panic_message(payload.as_ref()).to_string(),
            )),
            Err(_) => Err(RefreshError::TimedOut(self.config.refresh_timeout)),
        }
    }

    /// Record the result of one attempt. Returns whether it succeeded.
    fn settle(&self, claimed: Claimed, result: Result<(), RefreshError>) -> bool {
        let error = match result {
            Ok(()) => {
                debug!("Refreshed {}", claimed.task.id);
                self.queue.lock().complete(claimed);
                return true;
            }
            Err(e) => e,
        };

        let (outcome, task) = self.queue.lock().retry(claimed, &self.config);
        match outcome {
            RetryOutcome::Requeued => {
                warn!(
                    "Refresh of {} failed (attempt {}/{}), retrying: {}",
                    task.id, task.retries, task.max_retries, error
                );
            }
            RetryOutcome::Superseded => {
                debug!("Refresh of {} failed but a newer task is queued: {}", task.id, error);
            }
            RetryOutcome::Dropped => {
                warn!(
                    "Dropping refresh task {} after {} failed attempts: {}",
                    task.id, task.retries, error
                );
            }
            RetryOutcome::Discarded => {
                debug!("Refresh of {} failed after queue clear: {}", task.id, error);
            }
        }
        false
    }
}

/// Permission keys implicated by a change in `scope`.
fn permission_pattern(user_id: &str, scope: &PermissionScope) -> InvalidationPattern {
    if scope.is_global() {
        keys::user_permissions_pattern(user_id)
    } else {
        keys::user_permission_scope_pattern(user_id, scope)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;

    use super::*;
    use crate::cache::CacheConfig;

    fn service() -> InvalidationService {
        let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
        InvalidationService::new(cache, RefreshConfig::default().retry_backoff(Duration::ZERO))
    }

    #[test]
    fn test_role_change_clears_scoped_keys() {
        let service = service();
        let cache = service.cache();
        cache.set("auth:user:7", &"admin", None);
        cache.set("roles:7:org", &["owner"], None);
        cache.set("perm:7:org:1", &["ledger.read"], None);
        cache.set("perm:7:org:2", &["ledger.read"], None);
        cache.set(&keys::permission_batch("7", &["a"]), &true, None);

        service.invalidate_role_change("7", "org", Some("1"), None);

        assert!(!cache.contains_key("auth:user:7"));
        assert!(!cache.contains_key("roles:7:org"));
        assert!(!cache.contains_key("perm:7:org:1"));
        assert!(cache.contains_key("perm:7:org:2"));
        assert!(!cache.contains_key(&keys::permission_batch("7", &["a"])));
    }

    #[test]
    fn test_global_permission_change_clears_all_user_permissions() {
        let service = service();
        let cache = service.cache();
        cache.set("perm:7:global", &1, None);
        cache.set("perm:7:project:3", &1, None);
        cache.set("perm:70:global", &1, None);

        service.invalidate_permission_change("7", None, None);

        assert!(!cache.contains_key("perm:7:global"));
        assert!(!cache.contains_key("perm:7:project:3"));
        assert!(cache.contains_key("perm:70:global"));
    }

    #[test]
    fn test_membership_changes_queue_normal_priority() {
        let service = service();
        let cache = service.cache();
        cache.set("org:7:1", &true, None);
        cache.set("project:7:9", &true, None);

        service.invalidate_org_membership_change("7", "1");
        service.invalidate_project_membership_change("7", "9");

        assert!(!cache.contains_key("org:7:1"));
        assert!(!cache.contains_key("project:7:9"));
        let status = service.queue_status();
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.normal_priority, 2);
        assert_eq!(status.high_priority, 0);
    }

    #[test]
    fn test_repeat_invalidation_keeps_one_task() {
        let service = service();
        service.invalidate_permission_change("7", None, None);
        service.invalidate_permission_change("7", None, None);
        service.invalidate_role_change("7", "global", None, None);

        assert_eq!(service.queue_status().total_tasks, 1);

        service.invalidate_permission_change("7", Some("1"), None);
        assert_eq!(service.queue_status().total_tasks, 2);
    }

    #[tokio::test]
    async fn test_process_queue_runs_refresher() {
        let service = service();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let cache = service.cache().clone();
        service.register_refresher(RefreshScope::Org, move |task: RefreshTask| {
            let counter = counter.clone();
            let cache = cache.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let org = task.org_id.unwrap_or_default();
                cache.set(&keys::user_org(&task.user_id, &org), &true, None);
                anyhow::Ok(())
            }
        });

        service.invalidate_org_membership_change("7", "1");
        let report = service.process_queue().await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.cache().contains_key("org:7:1"));
        assert_eq!(service.queue_status(), QueueStatus::default());
    }

    #[tokio::test]
    async fn test_failing_refresher_is_dropped_after_max_retries() {
        let service = service();
        service.register_refresher(RefreshScope::Global, |_task: RefreshTask| async {
            Err::<(), _>(anyhow!("directory offline"))
        });
        service.invalidate_permission_change("7", None, None);

        for _ in 0..3 {
            assert_eq!(service.process_queue().await.failed, 1);
            assert_eq!(service.queue_status().total_tasks, 1);
        }

        assert_eq!(service.process_queue().await.failed, 1);
        assert_eq!(service.queue_status(), QueueStatus::default());
        assert!(service.process_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_refresher_counts_as_failure() {
        let service = service();
        service.register_refresher(RefreshScope::Global, |task: RefreshTask| async move {
            if task.retries == 0 {
                panic!("refill bug");
            }
            anyhow::Ok(())
        });
        service.invalidate_permission_change("7", None, None);

        let report = service.process_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(service.queue_status().total_tasks, 1);
    }

    #[tokio::test]
    async fn test_slow_refresher_times_out() {
        let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
        let service = InvalidationService::new(
            cache,
            RefreshConfig::default()
                .retry_backoff(Duration::ZERO)
                .refresh_timeout(Duration::from_millis(20)),
        );
        service.register_refresher(RefreshScope::Global, |_task: RefreshTask| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::Ok(())
        });
        service.invalidate_permission_change("7", None, None);

        let report = service.process_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(service.queue_status().total_tasks, 1);
    }

    #[tokio::test]
    async fn test_missing_refresher_drains_task() {
        let service = service();
        service.schedule_refresh("7", None, None, RefreshPriority::Low);
        assert_eq!(service.queue_status().low_priority, 1);

        let report = service.process_queue().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(service.queue_status().total_tasks, 0);
    }

    #[tokio::test]
    async fn test_stop_and_destroy_are_idempotent() {
        let service = service();
        service.start();
        assert!(service.is_running());

        service.stop();
        service.stop();
        assert!(!service.is_running());

        service.invalidate_permission_change("7", None, None);
        assert!(service.process_queue().await.is_empty());
        assert_eq!(service.queue_status().total_tasks, 1);

        service.subscribe(InvalidationKind::RoleChange, |_| {});
        assert_eq!(service.subscriber_count(InvalidationKind::RoleChange), 1);

        service.destroy();
        service.destroy();
        assert_eq!(service.queue_status().total_tasks, 0);
        assert_eq!(service.subscriber_count(InvalidationKind::RoleChange), 0);

        service.start();
        assert!(!service.is_running());
    }

    /// Three high-priority tasks behind a refresher that never finishes in
    /// time, with the worker already holding the batch.
    async fn service_mid_batch() -> InvalidationService {
        let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
        let service = InvalidationService::new(
            cache,
            RefreshConfig::default().interval(Duration::from_millis(10)),
        );
        service.register_refresher(RefreshScope::Global, |_task: RefreshTask| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::Ok(())
        });
        for user in ["7", "8", "9"] {
            service.invalidate_permission_change(user, None, None);
        }

        service.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while service.queue_status().in_progress < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.queue_status().in_progress, 3);
        assert_eq!(service.queue_status().total_tasks, 0);
        service
    }

    #[tokio::test]
    async fn test_stop_mid_batch_requeues_taken_tasks() {
        let service = service_mid_batch().await;

        service.stop();

        let status = service.queue_status();
        assert_eq!(status.total_tasks, 3);
        assert_eq!(status.high_priority, 3);
        assert_eq!(status.in_progress, 0);

        let id = RefreshTask::task_id("7", RefreshScope::Global, None, None);
        assert_eq!(service.shared.queue.lock().get(&id).unwrap().retries, 0);
    }

    #[tokio::test]
    async fn test_destroy_mid_batch_leaves_nothing_behind() {
        let service = service_mid_batch().await;

        service.destroy();

        assert_eq!(service.queue_status(), QueueStatus::default());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_stop_during_manual_drain_keeps_counts() {
        let service = service();
        service.register_refresher(RefreshScope::Global, |_task: RefreshTask| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            anyhow::Ok(())
        });
        service.start();
        service.schedule_refresh("7", None, None, RefreshPriority::High);
        service.schedule_refresh("8", None, None, RefreshPriority::High);

        let stop_midway = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            service.stop();
            service.queue_status()
        };
        let (report, during) = tokio::join!(service.process_queue(), stop_midway);

        assert_eq!(during.in_progress, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.released, 1);
        let status = service.queue_status();
        assert_eq!(status.total_tasks, 1);
        assert_eq!(status.in_progress, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_does_not_start_worker() {
        let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
        let service =
            InvalidationService::new(cache, RefreshConfig::default().interval(Duration::ZERO));

        service.start();
        assert!(!service.is_running());
    }
}
