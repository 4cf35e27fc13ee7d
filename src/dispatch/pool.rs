use super::proto::{NodeResponse, RequestEnvelope};
use super::transport::{NodeConnector, NodeTransport, TransportError};
use crate::core::{MetaError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A pooled client for one node address.
///
/// Shared through `Arc`; the pool treats a client whose only owner is the
/// pool itself as having no in-flight calls.
pub struct NodeClient {
    transport: Arc<dyn NodeTransport>,
    in_flight: AtomicUsize,
}

impl NodeClient {
    fn new(transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            transport,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        self.transport.addr()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn call(&self, request: &RequestEnvelope) -> std::result::Result<NodeResponse, TransportError> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.transport.call(request).await
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PooledClient {
    client: Arc<NodeClient>,
    last_used: Instant,
}

impl PooledClient {
    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        match idle_timeout {
            Some(timeout) => self.last_used.elapsed() > timeout,
            None => false,
        }
    }

    fn is_busy(&self) -> bool {
        Arc::strong_count(&self.client) > 1 || self.client.in_flight() > 0
    }
}

#[derive(Default)]
struct PoolState {
    clients: HashMap<String, PooledClient>,
    closed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub clients: usize,
    pub busy_clients: usize,
    pub closed: bool,
}

/// Node clients keyed by address.
pub struct NodeClientPool {
    connector: Arc<dyn NodeConnector>,
    max_clients: usize,
    idle_timeout: Option<Duration>,
    state: Mutex<PoolState>,
}

impl NodeClientPool {
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        max_clients: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            max_clients,
            idle_timeout,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the client for `addr`, creating one if needed.
    ///
    /// A full pool gives up its least recently used idle client. Fails with
    /// `ClientUnavailable` when the pool is closed, the address is blank, the
    /// connector refuses it, or every slot is held by a busy client.
    pub fn get(&self, addr: &str) -> Result<Arc<NodeClient>> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(MetaError::ClientUnavailable("<empty address>".to_string()));
        }

        let mut state = self.state.lock()?;
        if state.closed {
            return Err(MetaError::ClientUnavailable(format!("{} (pool closed)", addr)));
        }

        if let Some(pooled) = state.clients.get_mut(addr) {
            pooled.last_used = Instant::now();
            return Ok(Arc::clone(&pooled.client));
        }

        self.evict_idle(&mut state);
        if state.clients.len() >= self.max_clients && !Self::evict_least_recent(&mut state) {
            error!(addr, max_clients = self.max_clients, "node client pool exhausted");
            return Err(MetaError::ClientUnavailable(format!(
                "{} (pool exhausted, {} clients)",
                addr, self.max_clients
            )));
        }

        let transport = self.connector.connect(addr).map_err(|err| {
            error!(addr, error = %err, "failed to create node client");
            MetaError::ClientUnavailable(format!("{} ({})", addr, err))
        })?;
        let client = Arc::new(NodeClient::new(transport));
        state.clients.insert(
            addr.to_string(),
            PooledClient {
                client: Arc::clone(&client),
                last_used: Instant::now(),
            },
        );
        debug!(addr, "node client created");
        Ok(client)
    }

    fn evict_idle(&self, state: &mut PoolState) {
        let before = state.clients.len();
        state
            .clients
            .retain(|_, pooled| pooled.is_busy() || !pooled.is_idle_too_long(self.idle_timeout));
        let removed = before - state.clients.len();
        if removed > 0 {
            debug!(removed, "evicted idle node clients");
        }
    }

    /// Drops the least recently used client with no call in flight.
    fn evict_least_recent(state: &mut PoolState) -> bool {
        let victim = state
            .clients
            .iter()
            .filter(|(_, pooled)| !pooled.is_busy())
            .min_by_key(|(_, pooled)| pooled.last_used)
            .map(|(addr, _)| addr.clone());
        match victim {
            Some(addr) => {
                state.clients.remove(&addr);
                debug!(addr = %addr, "evicted least recently used node client");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.state.lock()?;
        Ok(PoolStats {
            clients: state.clients.len(),
            busy_clients: state.clients.values().filter(|p| p.is_busy()).count(),
            closed: state.closed,
        })
    }

    /// Drops every pooled client and refuses further checkouts. Calls already
    /// holding a client finish on their own handle.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.closed = true;
        state.clients.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport(String);

    #[async_trait]
    impl NodeTransport for NullTransport {
        fn addr(&self) -> &str {
            &self.0
        }

        async fn call(
            &self,
            _request: &RequestEnvelope,
        ) -> std::result::Result<NodeResponse, TransportError> {
            Ok(NodeResponse::ok())
        }
    }

    struct NullConnector;

    impl NodeConnector for NullConnector {
        fn connect(&self, addr: &str) -> std::result::Result<Arc<dyn NodeTransport>, TransportError> {
            Ok(Arc::new(NullTransport(addr.to_string())))
        }
    }

    #[test]
    fn test_same_address_shares_client() {
        let pool = NodeClientPool::new(Arc::new(NullConnector), 4, None);
        let a = pool.get("10.0.0.1:9000").unwrap();
        let b = pool.get("10.0.0.1:9000").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().unwrap().clients, 1);
        assert_eq!(pool.stats().unwrap().busy_clients, 1);
    }

    #[test]
    fn test_exhausted_pool_reports_client_unavailable() {
        let pool = NodeClientPool::new(Arc::new(NullConnector), 1, None);
        let _held = pool.get("a:1").unwrap();
        let err = pool.get("b:1").err().unwrap();
        assert!(matches!(err, MetaError::ClientUnavailable(_)));
    }

    #[test]
    fn test_idle_clients_make_room() {
        let pool = NodeClientPool::new(Arc::new(NullConnector), 1, Some(Duration::ZERO));
        drop(pool.get("a:1").unwrap());
        std::thread::sleep(Duration::from_millis(2));
        let b = pool.get("b:1").unwrap();
        assert_eq!(b.addr(), "b:1");
        assert_eq!(pool.stats().unwrap().clients, 1);
    }

    #[test]
    fn test_full_pool_replaces_least_recent_idle_client() {
        let pool = NodeClientPool::new(Arc::new(NullConnector), 2, None);
        drop(pool.get("a:1").unwrap());
        std::thread::sleep(Duration::from_millis(2));
        drop(pool.get("b:1").unwrap());
        std::thread::sleep(Duration::from_millis(2));
        drop(pool.get("a:1").unwrap());

        let c = pool.get("c:1").unwrap();
        assert_eq!(c.addr(), "c:1");
        let state = pool.state.lock().unwrap();
        assert_eq!(state.clients.len(), 2);
        assert!(state.clients.contains_key("a:1"));
        assert!(!state.clients.contains_key("b:1"));
    }

    #[test]
    fn test_closed_pool_refuses_checkout() {
        let pool = NodeClientPool::new(Arc::new(NullConnector), 4, None);
        pool.get("a:1").unwrap();
        pool.close().unwrap();
        assert!(matches!(pool.get("a:1"), Err(MetaError::ClientUnavailable(_))));
        assert!(pool.stats().unwrap().closed);
        assert!(matches!(pool.get("  "), Err(MetaError::ClientUnavailable(_))));
    }
}
