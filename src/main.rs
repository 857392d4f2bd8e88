//! authcache demo - exercises the cache against a simulated directory.
//!
//! Runs a repeated permission-lookup workload, fires role, permission and
//! membership changes on a schedule, and lets the refresh worker repopulate
//! what the changes invalidated.
//!
//! ## Architecture
//!
//! - `config` - Environment configuration
//! - `directory` - In-process stand-in for the authorization backend
//! - `authcache::cache` - The tiered cache
//! - `authcache::invalidation` - Change handling and background refresh

mod directory;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use authcache::cache::keys;
use authcache::cache::{CacheManager, PermissionScope};
use authcache::config::Config;
use authcache::invalidation::{
    InvalidationKind, InvalidationService, RefreshHandler, RefreshScope, RefreshTask,
};
use directory::Directory;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Simulated users in the directory.
const USERS: usize = 20;

/// Simulated backend round-trip.
const DIRECTORY_LATENCY: Duration = Duration::from_millis(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("authcache=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting authcache demo...");

    let config = Config::from_env();
    info!("Configuration loaded successfully");

    let cache = Arc::new(CacheManager::new(config.cache.clone()));
    cache.spawn_cleanup_task();

    let directory = Arc::new(Directory::seeded(USERS, DIRECTORY_LATENCY));
    info!("Directory seeded with {} users", USERS);

    let service = InvalidationService::new(cache.clone(), config.refresh.clone());
    for scope in [RefreshScope::Global, RefreshScope::Org, RefreshScope::Project] {
        service.register_refresher(scope, refresher(cache.clone(), directory.clone()));
    }

    let audit = service.subscribe(InvalidationKind::RoleChange, |event| {
        info!("Audit: {} for user {} (org {:?})", event.kind, event.user_id, event.org_id);
    });

    service.start();

    let shutdown = async {
        match config.demo_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(shutdown);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut workload = tokio::time::interval(Duration::from_millis(20));
    workload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut round: u64 = 0;
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Ctrl-C received, shutting down...");
                break;
            }
            _ = &mut shutdown => {
                info!("Demo duration elapsed, shutting down...");
                break;
            }
            _ = workload.tick() => {
                round += 1;
                run_round(round, &cache, &directory, &service).await;
            }
            _ = report.tick() => log_status(&cache, &service, &directory),
        }
    }

    audit.unsubscribe();
    service.destroy();
    cache.close();

    log_status(&cache, &service, &directory);
    info!("Final stats: {}", serde_json::to_string(&cache.stats())?);

    Ok(())
}

/// Refill routine: reloads auth, permissions and membership for the task's
/// tuple from the directory.
fn refresher(cache: Arc<CacheManager>, directory: Arc<Directory>) -> impl RefreshHandler {
    move |task: RefreshTask| {
        let cache = cache.clone();
        let directory = directory.clone();
        async move {
            let scope =
                PermissionScope::from_ids(task.org_id.as_deref(), task.project_id.as_deref());

            let role = directory.role(&task.user_id).await?;
            cache.set(&keys::user_auth(&task.user_id), &role, None);

            let permissions = directory.permissions(&task.user_id, &scope).await?;
            cache.set(
                &keys::user_permissions(&task.user_id, &scope),
                &permissions,
                None,
            );

            debug!("Refilled {} for user {}", scope, task.user_id);
            anyhow::Ok(())
        }
    }
}

/// One workload step: a cached lookup, plus a change every so often.
async fn run_round(
    round: u64,
    cache: &CacheManager,
    directory: &Directory,
    service: &InvalidationService,
) {
    let user_id = ((round % USERS as u64) + 1).to_string();
    let org = PermissionScope::Org("1".to_string());

    match permissions_for(cache, directory, &user_id, &org).await {
        Ok(permissions) => debug!("User {} holds {:?}", user_id, permissions),
        Err(e) => warn!("Permission lookup for user {} failed: {}", user_id, e),
    }

    if round % 50 == 0 {
        let target = ((round / 50) % USERS as u64 + 1).to_string();
        directory.grant(&target, org.clone(), "reports.read");
        service.invalidate_permission_change(&target, Some("1"), None);
    }
    if round % 120 == 0 {
        let target = ((round / 120) % USERS as u64 + 1).to_string();
        directory.set_role(&target, "admin");
        service.invalidate_role_change(&target, "org", Some("1"), None);
    }
}

/// Cache-aside permission lookup. Only the caller that claims the warm-up
/// writes the fetched value back.
async fn permissions_for(
    cache: &CacheManager,
    directory: &Directory,
    user_id: &str,
    scope: &PermissionScope,
) -> anyhow::Result<Vec<String>> {
    let key = keys::user_permissions(user_id, scope);
    if let Some(cached) = cache.get::<Vec<String>>(&key) {
        return Ok(cached);
    }

    let claimed = cache.warm_permission_cache(user_id, scope);
    let fetched = directory.permissions(user_id, scope).await;

    if claimed {
        if let Ok(permissions) = &fetched {
            cache.set(&key, permissions, None);
        }
        cache.finish_warming(&key);
    }
    fetched
}

fn log_status(cache: &CacheManager, service: &InvalidationService, directory: &Directory) {
    let stats = cache.stats();
    info!(
        "Cache: {} requests, {:.1}% hits, {} entries ({} bytes), avg {:?}, {} expired",
        stats.total_requests,
        stats.hit_rate * 100.0,
        stats.entry_count,
        stats.memory_usage,
        stats.avg_response_time,
        stats.expired_evictions
    );

    let queue = service.queue_status();
    info!(
        "Refresh queue: {} pending ({} high, {} normal, {} low), {} in progress; {} directory lookups",
        queue.total_tasks,
        queue.high_priority,
        queue.normal_priority,
        queue.low_priority,
        queue.in_progress,
        directory.lookups()
    );
}
