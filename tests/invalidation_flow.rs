//! End-to-end invalidation, refresh and subscription behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use authcache::cache::{keys, CacheConfig, CacheManager, PermissionScope};
use authcache::invalidation::{
    InvalidationEvent, InvalidationKind, InvalidationService, RefreshConfig, RefreshPriority,
    RefreshScope, RefreshTask,
};

fn setup() -> (Arc<CacheManager>, InvalidationService) {
    let cache = Arc::new(CacheManager::new(CacheConfig::in_memory().no_cleanup()));
    let service = InvalidationService::new(
        cache.clone(),
        RefreshConfig::default()
            .interval(Duration::from_millis(20))
            .retry_backoff(Duration::ZERO),
    );
    (cache, service)
}

fn populate_user(cache: &CacheManager, user_id: &str) {
    cache.set(&keys::user_auth(user_id), &"member", None);
    cache.set(&keys::user_roles(user_id, "org"), &["viewer"], None);
    cache.set(
        &keys::user_permissions(user_id, &PermissionScope::Org("1".to_string())),
        &["ledger.read"],
        None,
    );
    cache.set(&keys::user_org(user_id, "1"), &true, None);
    cache.set(&keys::permission_batch(user_id, &["ledger.read"]), &true, None);
}

#[test]
fn role_change_leaves_other_users_untouched() {
    let (cache, service) = setup();
    populate_user(&cache, "4");
    populate_user(&cache, "42");
    let before = cache.len();

    service.invalidate_role_change("4", "org", Some("1"), None);

    assert!(!cache.contains_key(&keys::user_auth("4")));
    assert!(!cache.contains_key(&keys::user_roles("4", "org")));
    assert!(cache.contains_key(&keys::user_org("4", "1")));
    for key in [
        keys::user_auth("42"),
        keys::user_roles("42", "org"),
        keys::user_permissions("42", &PermissionScope::Org("1".to_string())),
        keys::user_org("42", "1"),
        keys::permission_batch("42", &["ledger.read"]),
    ] {
        assert!(cache.contains_key(&key), "{key} was removed");
    }
    assert_eq!(cache.len(), before - 4);
}

#[test]
fn subscriber_gets_exactly_one_event_per_call() {
    let (_cache, service) = setup();
    let events: Arc<Mutex<Vec<InvalidationEvent>>> = Arc::default();

    let sink = events.clone();
    let subscription = service.subscribe(InvalidationKind::ProjectMembershipChange, move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    service.invalidate_project_membership_change("7", "3");
    service.invalidate_permission_change("7", None, Some("3"));

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "7");
        assert_eq!(events[0].project_id.as_deref(), Some("3"));
    }

    subscription.unsubscribe();
    service.invalidate_project_membership_change("7", "3");
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[test]
fn role_change_subscription_sees_each_call_until_unsubscribed() {
    let (_cache, service) = setup();
    let events: Arc<Mutex<Vec<InvalidationEvent>>> = Arc::default();

    let sink = events.clone();
    let subscription = service.subscribe(InvalidationKind::RoleChange, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    assert_eq!(service.subscriber_count(InvalidationKind::RoleChange), 1);

    service.invalidate_role_change("7", "org", Some("1"), None);
    service.invalidate_role_change("8", "project", Some("1"), Some("3"));
    service.invalidate_org_membership_change("7", "1");

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == InvalidationKind::RoleChange));
        assert_eq!(events[0].user_id, "7");
        assert_eq!(events[0].role_type.as_deref(), Some("org"));
        assert_eq!(events[1].user_id, "8");
        assert_eq!(events[1].project_id.as_deref(), Some("3"));
    }

    subscription.unsubscribe();
    assert_eq!(service.subscriber_count(InvalidationKind::RoleChange), 0);
    service.invalidate_role_change("7", "org", Some("1"), None);
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[test]
fn panicking_subscriber_does_not_block_invalidation() {
    let (cache, service) = setup();
    populate_user(&cache, "7");
    let delivered = Arc::new(AtomicUsize::new(0));

    service.subscribe(InvalidationKind::PermissionChange, |_| panic!("audit sink down"));
    let counter = delivered.clone();
    service.subscribe(InvalidationKind::PermissionChange, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.invalidate_permission_change("7", Some("1"), None);

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert!(!cache.contains_key(&keys::user_auth("7")));
    assert_eq!(service.queue_status().high_priority, 1);
}

#[test]
fn repeated_changes_before_a_tick_leave_one_task() {
    let (_cache, service) = setup();

    service.invalidate_permission_change("7", Some("1"), None);
    service.invalidate_permission_change("7", Some("1"), None);

    let status = service.queue_status();
    assert_eq!(status.total_tasks, 1);
    assert_eq!(status.high_priority, 1);
}

#[test]
fn invalidation_is_fast_with_a_large_queue() {
    let (cache, service) = setup();
    for i in 0..200 {
        let user = i.to_string();
        populate_user(&cache, &user);
        service.schedule_refresh(&user, Some("1"), None, RefreshPriority::Low);
    }

    let started = Instant::now();
    service.invalidate_role_change("7", "org", Some("1"), None);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn drain_follows_priority_order() {
    let (_cache, service) = setup();
    let order: Arc<Mutex<Vec<String>>> = Arc::default();

    let log = order.clone();
    service.register_refresher(RefreshScope::Global, move |task: RefreshTask| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(task.user_id);
            anyhow::Ok(())
        }
    });

    service.schedule_refresh("low", None, None, RefreshPriority::Low);
    service.schedule_refresh("normal", None, None, RefreshPriority::Normal);
    service.schedule_refresh("high", None, None, RefreshPriority::High);

    let report = service.process_queue().await;

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(*order.lock().unwrap(), ["high", "normal", "low"]);
}

#[tokio::test]
async fn worker_repopulates_invalidated_keys() {
    let (cache, service) = setup();
    populate_user(&cache, "7");

    let refill = cache.clone();
    service.register_refresher(RefreshScope::Org, move |task: RefreshTask| {
        let cache = refill.clone();
        async move {
            let scope =
                PermissionScope::from_ids(task.org_id.as_deref(), task.project_id.as_deref());
            cache.set(&keys::user_auth(&task.user_id), &"admin", None);
            cache.set(
                &keys::user_permissions(&task.user_id, &scope),
                &["ledger.read", "ledger.write"],
                None,
            );
            anyhow::Ok(())
        }
    });
    service.start();

    service.invalidate_role_change("7", "org", Some("1"), None);
    assert!(!cache.contains_key(&keys::user_auth("7")));

    let deadline = Instant::now() + Duration::from_secs(2);
    while service.queue_status() != Default::default() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        cache.get::<String>(&keys::user_auth("7")).as_deref(),
        Some("admin")
    );
    service.destroy();
    assert!(!service.is_running());
}
