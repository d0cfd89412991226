use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::identity::{Identity, IdentityStore};
use crate::metrics::{AuthLabels, AuthOutcome, MetricsRegistry};

/// Why a public-key attempt was refused.  Logged server-side only; the peer
/// just sees a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejected {
    #[error("login {0:?} is not the service login")]
    UnknownLogin(String),
    #[error("no key registered for this fingerprint")]
    UnknownKey,
    #[error("stored key type or blob does not match the offered key")]
    KeyMismatch,
    #[error("identity store lookup timed out")]
    StoreTimeout,
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AuthRejected {
    fn outcome(&self) -> AuthOutcome {
        match self {
            Self::UnknownLogin(_) => AuthOutcome::UnknownLogin,
            Self::UnknownKey => AuthOutcome::UnknownKey,
            Self::KeyMismatch => AuthOutcome::KeyMismatch,
            Self::StoreTimeout | Self::StoreUnavailable(_) => AuthOutcome::StoreError,
        }
    }
}

/// Resolves an offered public key to a platform identity.
#[derive(Clone)]
pub struct KeyResolver {
    store: Arc<dyn IdentityStore>,
    service_login: String,
    lookup_timeout: Duration,
    touch_timeout: Duration,
    metrics: Option<MetricsRegistry>,
}

impl KeyResolver {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        service_login: impl Into<String>,
        lookup_timeout: Duration,
        touch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            service_login: service_login.into(),
            lookup_timeout,
            touch_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether `login` may authenticate with the given key.
    ///
    /// Only the service login is eligible; anything else is refused before
    /// the store is consulted.  The lookup is bounded by the lookup timeout
    /// and a timeout counts as a rejection.  On success the key's usage
    /// timestamp is updated in the background.
    #[instrument(skip(self, key_blob), fields(%login, %fingerprint, %key_type))]
    pub async fn resolve(
        &self,
        login: &str,
        fingerprint: &str,
        key_type: &str,
        key_blob: &str,
    ) -> Result<Identity, AuthRejected> {
        let result = self.decide(login, fingerprint, key_type, key_blob).await;
        match &result {
            Ok(identity) => {
                debug!(identity = %identity, "public key accepted");
                self.record(AuthOutcome::Accepted);
                self.spawn_touch(fingerprint);
            }
            Err(reason) => {
                warn!(reason = %reason, "public key rejected");
                self.record(reason.outcome());
            }
        }
        result
    }

    async fn decide(
        &self,
        login: &str,
        fingerprint: &str,
        key_type: &str,
        key_blob: &str,
    ) -> Result<Identity, AuthRejected> {
        if login != self.service_login {
            return Err(AuthRejected::UnknownLogin(login.to_string()));
        }

        let lookup = self.store.find_key_by_fingerprint(fingerprint);
        let stored = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Err(_) => return Err(AuthRejected::StoreTimeout),
            Ok(Err(e)) => return Err(AuthRejected::StoreUnavailable(format!("{e:#}"))),
            Ok(Ok(None)) => return Err(AuthRejected::UnknownKey),
            Ok(Ok(Some(stored))) => stored,
        };

        if stored.key_type != key_type || stored.key_blob.trim() != key_blob.trim() {
            return Err(AuthRejected::KeyMismatch);
        }

        Ok(stored.owner)
    }

    /// Fire-and-forget usage update.  Never awaited by the auth path.
    fn spawn_touch(&self, fingerprint: &str) {
        let store = Arc::clone(&self.store);
        let fingerprint = fingerprint.to_string();
        let deadline = self.touch_timeout;
        tokio::spawn(async move {
            let touch = store.touch_key_usage(&fingerprint, Utc::now());
            match tokio::time::timeout(deadline, touch).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%fingerprint, error = %e, "failed to record key usage")
                }
                Err(_) => warn!(%fingerprint, "timed out recording key usage"),
            }
        });
    }

    fn record(&self, outcome: AuthOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics
                .metrics
                .auth_attempts
                .get_or_create(&AuthLabels { outcome })
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use chrono::DateTime;

    use super::*;
    use crate::identity::testing::*;
    use crate::identity::{fingerprint_of_blob, AuthorizedKey, MemoryIdentityStore, StoredKey};

    /// Wraps a store and counts calls; optionally stalls or fails.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryIdentityStore,
        lookups: AtomicUsize,
        touches: AtomicUsize,
        lookup_delay: Option<Duration>,
        touch_delay: Option<Duration>,
        fail_touch: bool,
        fail_lookup: bool,
    }

    #[async_trait::async_trait]
    impl IdentityStore for CountingStore {
        async fn find_key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredKey>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.lookup_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_lookup {
                anyhow::bail!("connection refused");
            }
            self.inner.find_key_by_fingerprint(fingerprint).await
        }

        async fn touch_key_usage(&self, fingerprint: &str, at: DateTime<Utc>) -> Result<()> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.touch_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_touch {
                anyhow::bail!("database is read-only");
            }
            self.inner.touch_key_usage(fingerprint, at).await
        }

        async fn list_keys(&self) -> Result<Vec<AuthorizedKey>> {
            self.inner.list_keys().await
        }
    }

    fn seeded(store: CountingStore) -> Arc<CountingStore> {
        store
            .inner
            .insert(key_for(identity("42", "alice"), ED25519_BLOB))
            .unwrap();
        Arc::new(store)
    }

    fn resolver(store: Arc<CountingStore>) -> KeyResolver {
        KeyResolver::new(
            store,
            "git",
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
    }

    fn alice_fp() -> String {
        fingerprint_of_blob(ED25519_BLOB).unwrap()
    }

    #[tokio::test]
    async fn known_key_resolves_to_owner() {
        let store = seeded(CountingStore::default());
        let identity = resolver(store.clone())
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await
            .unwrap();
        assert_eq!(identity, crate::identity::testing::identity("42", "alice"));

        // The usage update runs in the background.
        for _ in 0..50 {
            if store.inner.get(&alice_fp()).unwrap().last_used_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.inner.get(&alice_fp()).unwrap().last_used_at.is_some());
        assert_eq!(store.touches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_logins_never_hit_the_store() {
        let store = seeded(CountingStore::default());
        let resolver = resolver(store.clone());
        for login in ["root", "alice", "Git", "git ", ""] {
            let err = resolver
                .resolve(login, &alice_fp(), "ssh-ed25519", ED25519_BLOB)
                .await
                .unwrap_err();
            assert_eq!(err, AuthRejected::UnknownLogin(login.to_string()));
        }
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_rejected_without_touch() {
        let store = seeded(CountingStore::default());
        let resolver = resolver(store.clone());
        for fp in ["SHA256:unknown", "", "SHA256:"] {
            let err = resolver
                .resolve("git", fp, "ssh-ed25519", OTHER_BLOB)
                .await
                .unwrap_err();
            assert_eq!(err, AuthRejected::UnknownKey);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(store.touches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_blob_or_type_is_rejected() {
        let store = seeded(CountingStore::default());
        let resolver = resolver(store.clone());

        let err = resolver
            .resolve("git", &alice_fp(), "ssh-ed25519", OTHER_BLOB)
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejected::KeyMismatch);

        let err = resolver
            .resolve("git", &alice_fp(), "ssh-rsa", ED25519_BLOB)
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejected::KeyMismatch);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.touches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_store_times_out_as_rejection() {
        let store = seeded(CountingStore {
            lookup_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let started = tokio::time::Instant::now();
        let err = resolver(store)
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await
            .unwrap_err();
        assert_eq!(err, AuthRejected::StoreTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn store_error_is_rejection() {
        let store = seeded(CountingStore {
            fail_lookup: true,
            ..Default::default()
        });
        let err = resolver(store)
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthRejected::StoreUnavailable(msg) if msg.contains("refused")));
    }

    #[tokio::test]
    async fn failing_or_slow_touch_does_not_block_auth() {
        let store = seeded(CountingStore {
            fail_touch: true,
            ..Default::default()
        });
        assert!(resolver(store)
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await
            .is_ok());

        let store = seeded(CountingStore {
            touch_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let started = tokio::time::Instant::now();
        assert!(resolver(store)
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await
            .is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let metrics = MetricsRegistry::new();
        let store = seeded(CountingStore::default());
        let resolver = resolver(store).with_metrics(metrics.clone());
        let _ = resolver
            .resolve("git", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await;
        let _ = resolver
            .resolve("nobody", &alice_fp(), "ssh-ed25519", ED25519_BLOB)
            .await;
        let attempts = &metrics.metrics.auth_attempts;
        assert_eq!(
            attempts
                .get_or_create(&AuthLabels {
                    outcome: AuthOutcome::Accepted
                })
                .get(),
            1
        );
        assert_eq!(
            attempts
                .get_or_create(&AuthLabels {
                    outcome: AuthOutcome::UnknownLogin
                })
                .get(),
            1
        );
    }
}
