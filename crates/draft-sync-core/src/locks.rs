//! Field Lock Manager: time-bounded exclusive claims on one field of one
//! document.
//!
//! Mutual exclusion comes from the store's set-if-absent. A lock that expires
//! is not announced; absence is authoritative and the next `acquire_lock` by
//! anyone is simply granted.

use crate::clock::Timestamp;
use crate::draft::{DraftError, DraftSync, Result};
use crate::durable::DurableStore;
use crate::events::LockAction;
use crate::keys;
use crate::snapshot_store::{decode, encode};
use crate::store::{KvStore, SetIfAbsent, StoreError};
use crate::transport::BroadcastTransport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Attempts before giving up when the holder keeps vanishing between reads.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// The stored holder record of a field lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLock {
    pub document_id: String,
    pub field: String,
    pub user_id: String,
    pub device_id: String,
    pub acquired_at: Timestamp,
}

impl FieldLock {
    pub fn is_held_by(&self, user_id: &str, device_id: &str) -> bool {
        self.user_id == user_id && self.device_id == device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockOutcome {
    Granted { lock: FieldLock },
    /// Someone else holds the field; shown as "being edited by ..."
    Denied { holder: FieldLock },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    /// Try to take the lock on `field`. Re-acquiring a lock the same device
    /// already holds extends it.
    pub async fn acquire_lock(
        &self,
        document_id: &str,
        field: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<LockOutcome> {
        validate_lock_args(document_id, field, user_id, device_id)?;
        let key = keys::lock_key(document_id, field);
        let ttl = self.config.lock_ttl;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let lock = FieldLock {
                document_id: document_id.to_string(),
                field: field.to_string(),
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                acquired_at: self.clock.now_ms(),
            };
            let raw = encode(&lock)?;

            if self.kv.set_if_absent_with_ttl(&key, &raw, ttl).await? == SetIfAbsent::Created {
                info!("Lock on {}/{} granted to {}/{}", document_id, field, user_id, device_id);
                self.dispatcher
                    .field_lock_changed(
                        document_id,
                        field,
                        LockAction::Lock,
                        user_id,
                        device_id,
                        lock.acquired_at,
                    )
                    .await;
                return Ok(LockOutcome::Granted { lock });
            }

            // Expired between the two calls: try again
            let Some(existing) = self.kv.get(&key).await? else {
                continue;
            };
            let holder: FieldLock = decode(&existing)?;

            if !holder.is_held_by(user_id, device_id) {
                debug!(
                    "Lock on {}/{} denied to {}/{} (held by {}/{})",
                    document_id, field, user_id, device_id, holder.user_id, holder.device_id
                );
                return Ok(LockOutcome::Denied { holder });
            }

            if self
                .kv
                .compare_and_swap(&key, Some(&existing), &existing, ttl)
                .await?
            {
                debug!("Lock on {}/{} refreshed by {}/{}", document_id, field, user_id, device_id);
                return Ok(LockOutcome::Granted { lock: holder });
            }
        }

        Err(DraftError::StorageUnavailable(StoreError::Other(format!(
            "lock {} kept changing during acquire",
            key
        ))))
    }

    /// Release a lock held by exactly `(user_id, device_id)`.
    pub async fn release_lock(
        &self,
        document_id: &str,
        field: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<ReleaseOutcome> {
        validate_lock_args(document_id, field, user_id, device_id)?;
        let key = keys::lock_key(document_id, field);

        let Some(existing) = self.kv.get(&key).await? else {
            debug!("Release of {}/{} by {}/{}: not locked", document_id, field, user_id, device_id);
            return Ok(ReleaseOutcome::NotHolder);
        };
        let holder: FieldLock = decode(&existing)?;
        if !holder.is_held_by(user_id, device_id) {
            debug!(
                "Release of {}/{} by {}/{} refused (held by {}/{})",
                document_id, field, user_id, device_id, holder.user_id, holder.device_id
            );
            return Ok(ReleaseOutcome::NotHolder);
        }

        // Re-acquired by someone else after expiry in between
        if !self.kv.delete_if_equals(&key, &existing).await? {
            return Ok(ReleaseOutcome::NotHolder);
        }

        info!("Lock on {}/{} released by {}/{}", document_id, field, user_id, device_id);
        self.dispatcher
            .field_lock_changed(
                document_id,
                field,
                LockAction::Unlock,
                user_id,
                device_id,
                self.clock.now_ms(),
            )
            .await;
        Ok(ReleaseOutcome::Released)
    }

    /// Live locks on a document, ordered by field.
    pub async fn field_locks(&self, document_id: &str) -> Result<Vec<FieldLock>> {
        keys::validate_id("documentId", document_id)?;

        let mut locks = Vec::new();
        for key in self.kv.keys_by_prefix(&keys::lock_prefix(document_id)).await? {
            if let Some(raw) = self.kv.get(&key).await? {
                locks.push(decode::<FieldLock>(&raw)?);
            }
        }
        Ok(locks)
    }

    /// Release every lock a device holds on a document. Returns how many.
    pub async fn release_device_locks(
        &self,
        document_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<usize> {
        let mut released = 0;
        for lock in self.field_locks(document_id).await? {
            if lock.is_held_by(user_id, device_id)
                && self
                    .release_lock(document_id, &lock.field, user_id, device_id)
                    .await?
                    == ReleaseOutcome::Released
            {
                released += 1;
            }
        }
        Ok(released)
    }
}

fn validate_lock_args(document_id: &str, field: &str, user_id: &str, device_id: &str) -> Result<()> {
    keys::validate_id("documentId", document_id)?;
    keys::validate_field(field)?;
    keys::validate_id("userId", user_id)?;
    keys::validate_id("deviceId", device_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::test_support::Fixture;
    use crate::events::{Audience, DraftEvent};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_acquire_grants_exactly_one() {
        let fx = Fixture::new();

        let (a, b) = futures::join!(
            fx.sync.acquire_lock("doc", "synopsis", "alice", "laptop"),
            fx.sync.acquire_lock("doc", "synopsis", "bob", "tablet"),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let granted: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                LockOutcome::Granted { lock } => Some(lock.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(granted.len(), 1);

        let denied_holder = outcomes
            .iter()
            .find_map(|o| match o {
                LockOutcome::Denied { holder } => Some(holder.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(denied_holder, granted[0]);
    }

    #[tokio::test]
    async fn test_many_concurrent_acquirers() {
        let fx = Fixture::new();
        let devices: Vec<String> = (0..8).map(|i| format!("device-{i}")).collect();

        let outcomes = futures::future::join_all(
            devices
                .iter()
                .map(|d| fx.sync.acquire_lock("doc", "title", "alice", d)),
        )
        .await;

        let granted = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(LockOutcome::Granted { .. })))
            .count();
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let fx = Fixture::new();
        fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap();

        // Same user, other device
        assert_eq!(
            fx.sync.release_lock("doc", "title", "alice", "phone").await.unwrap(),
            ReleaseOutcome::NotHolder
        );
        assert_eq!(
            fx.sync.release_lock("doc", "title", "bob", "laptop").await.unwrap(),
            ReleaseOutcome::NotHolder
        );
        assert_eq!(fx.sync.field_locks("doc").await.unwrap().len(), 1);

        assert_eq!(
            fx.sync.release_lock("doc", "title", "alice", "laptop").await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(fx.sync.field_locks("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_unlocked_field() {
        let fx = Fixture::new();
        assert_eq!(
            fx.sync.release_lock("doc", "title", "alice", "laptop").await.unwrap(),
            ReleaseOutcome::NotHolder
        );
        assert!(fx.take_deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lock_goes_to_next_actor() {
        let fx = Fixture::new();
        fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap();
        assert!(matches!(
            fx.sync.acquire_lock("doc", "title", "bob", "tablet").await.unwrap(),
            LockOutcome::Denied { .. }
        ));

        fx.clock.advance(fx.sync.config().lock_ttl);

        match fx.sync.acquire_lock("doc", "title", "bob", "tablet").await.unwrap() {
            LockOutcome::Granted { lock } => assert_eq!(lock.user_id, "bob"),
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_holder_refreshes() {
        let fx = Fixture::new();
        let first = match fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap() {
            LockOutcome::Granted { lock } => lock,
            other => panic!("expected grant, got {:?}", other),
        };
        fx.take_deliveries();

        fx.clock.advance(Duration::from_secs(240));
        let again = fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap();
        assert_eq!(again, LockOutcome::Granted { lock: first });

        // Refresh extended the TTL past the original deadline
        fx.clock.advance(Duration::from_secs(120));
        assert_eq!(fx.sync.field_locks("doc").await.unwrap().len(), 1);

        // A refresh is not a new grant
        assert!(fx.take_deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_lock_events() {
        let fx = Fixture::new();
        fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap();
        fx.sync.release_lock("doc", "title", "alice", "laptop").await.unwrap();

        let deliveries = fx.take_deliveries();
        let actions: Vec<_> = deliveries
            .iter()
            .map(|d| {
                assert_eq!(d.audience, Audience::DocumentRoom("doc".into()));
                match &d.event {
                    DraftEvent::FieldLock { action, .. } => *action,
                    other => panic!("unexpected event {:?}", other),
                }
            })
            .collect();
        assert_eq!(actions, vec![LockAction::Lock, LockAction::Unlock]);
    }

    #[tokio::test]
    async fn test_locks_are_per_field() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap(),
            LockOutcome::Granted { .. }
        ));
        assert!(matches!(
            fx.sync.acquire_lock("doc", "synopsis", "bob", "tablet").await.unwrap(),
            LockOutcome::Granted { .. }
        ));

        let fields: Vec<_> = fx
            .sync
            .field_locks("doc")
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.field)
            .collect();
        assert_eq!(fields, vec!["synopsis", "title"]);
    }

    #[tokio::test]
    async fn test_release_device_locks() {
        let fx = Fixture::new();
        fx.sync.acquire_lock("doc", "title", "alice", "laptop").await.unwrap();
        fx.sync.acquire_lock("doc", "synopsis", "alice", "laptop").await.unwrap();
        fx.sync.acquire_lock("doc", "genre", "alice", "phone").await.unwrap();

        assert_eq!(
            fx.sync.release_device_locks("doc", "alice", "laptop").await.unwrap(),
            2
        );
        let remaining = fx.sync.field_locks("doc").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "phone");
    }

    #[tokio::test]
    async fn test_lock_with_store_down() {
        let fx = Fixture::new();
        fx.sync.kv().set_available(false);
        assert!(matches!(
            fx.sync.acquire_lock("doc", "title", "alice", "laptop").await,
            Err(DraftError::StorageUnavailable(_))
        ));
    }
}
