//! Invalidation events and their subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error};

/// What kind of authorization state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    RoleChange,
    PermissionChange,
    OrgMembershipChange,
    ProjectMembershipChange,
}

impl InvalidationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoleChange => "role_change",
            Self::PermissionChange => "permission_change",
            Self::OrgMembershipChange => "org_membership_change",
            Self::ProjectMembershipChange => "project_membership_change",
        }
    }
}

impl fmt::Display for InvalidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published once per invalidation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidationEvent {
    pub kind: InvalidationKind,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Set for role changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    pub(crate) fn new(
        kind: InvalidationKind,
        user_id: &str,
        org_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.to_string(),
            org_id: org_id.map(str::to_string),
            project_id: project_id.map(str::to_string),
            role_type: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn with_role_type(mut self, role_type: &str) -> Self {
        self.role_type = Some(role_type.to_string());
        self
    }
}

type Callback = Arc<dyn Fn(&InvalidationEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<InvalidationKind, Vec<(u64, Callback)>>,
}

/// Subscriber registry shared between the service and its
/// [`Subscription`] handles.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    registry: Arc<RwLock<Registry>>,
}

impl Subscribers {
    pub fn subscribe<F>(&self, kind: InvalidationKind, callback: F) -> Subscription
    where
        F: Fn(&InvalidationEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));

        debug!("Subscriber {} registered for {}", id, kind);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking callback is logged and skipped. Returns the
    /// number of callbacks that completed.
    pub fn publish(&self, event: &InvalidationEvent) -> usize {
        let callbacks: Vec<(u64, Callback)> = self
            .registry
            .read()
            .by_kind
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => error!(
                    "Subscriber {} panicked handling {} for user {}: {}",
                    id,
                    event.kind,
                    event.user_id,
                    panic_message(payload.as_ref())
                ),
            }
        }
        delivered
    }

    pub fn count(&self, kind: InvalidationKind) -> usize {
        self.registry
            .read()
            .by_kind
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.registry.write().by_kind.clear();
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping it keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving events.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<RwLock<Registry>>,
    kind: InvalidationKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> InvalidationKind {
        self.kind
    }

    /// Remove the callback. No event published afterwards reaches it.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let mut registry = registry.write();
        if let Some(callbacks) = registry.by_kind.get_mut(&self.kind) {
            callbacks.retain(|(id, _)| *id != self.id);
        }
        debug!("Subscriber {} removed from {}", self.id, self.kind);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
