//! In-process authorization directory used as the demo's source of truth.
//!
//! Stands in for the database or identity provider that a real deployment
//! would query on a cache miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::bail;
use parking_lot::RwLock;

use authcache::cache::PermissionScope;

#[derive(Debug, Clone, Default)]
struct UserRecord {
    role: String,
    permissions: HashMap<PermissionScope, Vec<String>>,
}

/// Users, their role and scoped permission grants.
#[derive(Debug)]
pub struct Directory {
    users: RwLock<HashMap<String, UserRecord>>,
    latency: Duration,
    lookups: AtomicU64,
}

impl Directory {
    /// Create `count` users (`1..=count`) with grants in org `1`.
    pub fn seeded(count: usize, latency: Duration) -> Self {
        let users = (1..=count)
            .map(|i| {
                let mut record = UserRecord {
                    role: "member".to_string(),
                    ..Default::default()
                };
                record
                    .permissions
                    .insert(PermissionScope::Global, vec!["profile.read".to_string()]);
                record.permissions.insert(
                    PermissionScope::Org("1".to_string()),
                    vec!["ledger.read".to_string()],
                );
                (i.to_string(), record)
            })
            .collect();

        Self {
            users: RwLock::new(users),
            latency,
            lookups: AtomicU64::new(0),
        }
    }

    /// Backend lookups served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub async fn role(&self, user_id: &str) -> anyhow::Result<String> {
        self.simulate_roundtrip().await?;
        match self.users.read().get(user_id) {
            Some(record) => Ok(record.role.clone()),
            None => bail!("unknown user {}", user_id),
        }
    }

    pub async fn permissions(
        &self,
        user_id: &str,
        scope: &PermissionScope,
    ) -> anyhow::Result<Vec<String>> {
        self.simulate_roundtrip().await?;
        let users = self.users.read();
        let Some(record) = users.get(user_id) else {
            bail!("unknown user {}", user_id);
        };
        Ok(record.permissions.get(scope).cloned().unwrap_or_default())
    }

    pub fn set_role(&self, user_id: &str, role: &str) {
        if let Some(record) = self.users.write().get_mut(user_id) {
            record.role = role.to_string();
        }
    }

    pub fn grant(&self, user_id: &str, scope: PermissionScope, permission: &str) {
        if let Some(record) = self.users.write().get_mut(user_id) {
            let granted = record.permissions.entry(scope).or_default();
            if !granted.iter().any(|p| p == permission) {
                granted.push(permission.to_string());
            }
        }
    }

    async fn simulate_roundtrip(&self) -> anyhow::Result<()> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(())
    }
}
