//! Shared provider sessions
//!
//! Logging in to vCenter is slow and sessions are long-lived, so one session is
//! kept per (server, datacenter, username) and shared by every reconcile that
//! targets it. The cache is created once in `main` and handed to the
//! controller context; there is no global instance.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::provider::{ProviderClient, ProviderConnector};
use crate::Result;

/// Username and password for a provider endpoint
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Password; never logged
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where a session connects to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// vCenter server address
    pub server: String,
    /// Datacenter the session operates in
    pub datacenter: String,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(server: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            datacenter: datacenter.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    endpoint: Endpoint,
    username: String,
}

type SessionSlot = Arc<OnceCell<Arc<dyn ProviderClient>>>;

/// Process-wide cache of authenticated provider sessions
///
/// `get_or_create` is single-flight per key: concurrent callers for the same
/// endpoint wait on one login instead of each opening a session.
pub struct SessionCache {
    connector: Arc<dyn ProviderConnector>,
    sessions: DashMap<SessionKey, SessionSlot>,
}

impl SessionCache {
    /// Create an empty cache that opens sessions through `connector`
    pub fn new(connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            connector,
            sessions: DashMap::new(),
        }
    }

    /// Return the cached session for an endpoint, logging in if needed
    ///
    /// A cached session that is no longer active is dropped and replaced.
    pub async fn get_or_create(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ProviderClient>> {
        let key = SessionKey {
            endpoint: endpoint.clone(),
            username: credentials.username.clone(),
        };

        loop {
            // Clone the slot out so the map shard isn't locked across awaits
            let slot = self.sessions.entry(key.clone()).or_default().clone();

            if let Some(session) = slot.get() {
                match session.is_active().await {
                    Ok(true) => {
                        debug!(server = %endpoint.server, datacenter = %endpoint.datacenter, "reusing provider session");
                        return Ok(session.clone());
                    }
                    Ok(false) => {
                        info!(server = %endpoint.server, "provider session expired, logging in again");
                    }
                    Err(e) => {
                        warn!(server = %endpoint.server, error = %e, "provider session check failed, logging in again");
                    }
                }
                // Only evict the slot we looked at; another caller may already
                // have replaced it
                self.sessions
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                continue;
            }

            let session = slot
                .get_or_try_init(|| async {
                    info!(
                        server = %endpoint.server,
                        datacenter = %endpoint.datacenter,
                        username = %credentials.username,
                        "opening provider session"
                    );
                    self.connector.connect(endpoint, credentials).await
                })
                .await?;
            return Ok(session.clone());
        }
    }

    /// Number of sessions currently cached
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are cached
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Log out of every cached session and empty the cache
    pub async fn shutdown(&self) {
        let slots: Vec<SessionSlot> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();

        for slot in slots {
            if let Some(session) = slot.get() {
                if let Err(e) = session.logout().await {
                    warn!(error = %e, "provider logout failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProviderClient, MockProviderConnector};
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn active_session() -> Arc<dyn ProviderClient> {
        let mut client = MockProviderClient::new();
        client.expect_is_active().returning(|| Ok(true));
        client.expect_logout().returning(|| Ok(()));
        Arc::new(client)
    }

    fn counting_connector(calls: Arc<AtomicU32>) -> MockProviderConnector {
        let mut connector = MockProviderConnector::new();
        connector.expect_connect().returning(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(active_session())
        });
        connector
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("vcenter.example.com", "dc0")
    }

    /// Story: Many reconciles against one vCenter share one login
    #[tokio::test]
    async fn story_concurrent_callers_share_one_session() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = Arc::new(SessionCache::new(Arc::new(counting_connector(
            calls.clone(),
        ))));
        let creds = Credentials::new("admin", "secret");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let creds = creds.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_create(&endpoint(), &creds).await.is_ok()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    /// Story: Different datacenters or users get their own sessions
    #[tokio::test]
    async fn story_sessions_are_keyed_by_endpoint_and_user() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SessionCache::new(Arc::new(counting_connector(calls.clone())));

        let admin = Credentials::new("admin", "secret");
        let other = Credentials::new("other", "secret");
        cache.get_or_create(&endpoint(), &admin).await.unwrap();
        cache.get_or_create(&endpoint(), &other).await.unwrap();
        cache
            .get_or_create(&Endpoint::new("vcenter.example.com", "dc1"), &admin)
            .await
            .unwrap();
        cache.get_or_create(&endpoint(), &admin).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 3);
    }

    /// Story: A failed login isn't cached; the next reconcile tries again
    #[tokio::test]
    async fn story_failed_login_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut connector = MockProviderConnector::new();
        connector.expect_connect().returning(move |_, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::provider("login", "connection refused"))
            } else {
                Ok(active_session())
            }
        });
        let cache = SessionCache::new(Arc::new(connector));
        let creds = Credentials::new("admin", "secret");

        assert!(cache.get_or_create(&endpoint(), &creds).await.is_err());
        assert!(cache.get_or_create(&endpoint(), &creds).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Story: An expired session is replaced by a fresh login
    #[tokio::test]
    async fn story_expired_session_is_replaced() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut connector = MockProviderConnector::new();
        connector.expect_connect().returning(move |_, _| {
            let first = c.fetch_add(1, Ordering::SeqCst) == 0;
            let mut client = MockProviderClient::new();
            client.expect_is_active().returning(move || Ok(!first));
            Ok(Arc::new(client) as Arc<dyn ProviderClient>)
        });
        let cache = SessionCache::new(Arc::new(connector));
        let creds = Credentials::new("admin", "secret");

        cache.get_or_create(&endpoint(), &creds).await.unwrap();
        cache.get_or_create(&endpoint(), &creds).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_logs_out_and_clears() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SessionCache::new(Arc::new(counting_connector(calls)));
        cache
            .get_or_create(&endpoint(), &Credentials::new("admin", "secret"))
            .await
            .unwrap();

        cache.shutdown().await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("admin", "hunter2");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("admin"));
        assert!(!dbg.contains("hunter2"));
    }
}
