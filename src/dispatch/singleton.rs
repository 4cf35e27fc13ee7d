use super::ReplicaDispatcher;
use super::client::ZoneRpcClient;
use super::transport::{NodeConnector, TcpConnector};
use crate::config::MasterConfig;
use crate::core::{MetaError, Result};
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info};

/// Lazily built, shared `ZoneRpcClient`.
///
/// The first `get` builds the client from the supplied configuration;
/// concurrent first callers serialize on `init_lock` and only one of them
/// builds. Later calls take the fast path and may pass `None`. `close` tears
/// the client down and resets the holder, so the next `get` needs a
/// configuration again and returns a fresh client.
pub struct DispatcherHolder {
    connector: ConnectorSource,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    client: RwLock<Option<Arc<ZoneRpcClient>>>,
}

enum ConnectorSource {
    Fixed(Arc<dyn NodeConnector>),
    /// TCP with the connect timeout of the configuration the client is
    /// built from.
    Tcp,
}

impl DispatcherHolder {
    /// A holder whose clients all use `connector`.
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self::with_source(ConnectorSource::Fixed(connector))
    }

    /// A holder whose clients connect over TCP using `rpc.connect_timeout`
    /// from the configuration given on first use.
    pub fn tcp() -> Self {
        Self::with_source(ConnectorSource::Tcp)
    }

    fn with_source(connector: ConnectorSource) -> Self {
        Self {
            connector,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            client: RwLock::new(None),
        }
    }

    pub fn get(&self, config: Option<&MasterConfig>) -> Result<Arc<ZoneRpcClient>> {
        if self.initialized.load(Ordering::Acquire) {
            if let Some(client) = self.client.read()?.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let _init = self.init_lock.lock()?;
        if self.initialized.load(Ordering::Acquire) {
            if let Some(client) = self.client.read()?.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let config = config.ok_or_else(|| {
            error!("config must be provided the first time the zone rpc client is created");
            MetaError::Config("dispatcher requested before it was configured".to_string())
        })?;
        let connector: Arc<dyn NodeConnector> = match &self.connector {
            ConnectorSource::Fixed(connector) => Arc::clone(connector),
            ConnectorSource::Tcp => Arc::new(tcp_connector(config)),
        };
        let client = Arc::new(ZoneRpcClient::new(config, connector)?);
        *self.client.write()? = Some(Arc::clone(&client));
        self.initialized.store(true, Ordering::Release);
        info!(cluster_id = %config.cluster.cluster_id, "zone rpc client started");
        Ok(client)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Closes the current client, if any, and resets the holder.
    pub async fn close(&self) -> Result<()> {
        let client = {
            let _init = self.init_lock.lock()?;
            self.initialized.store(false, Ordering::Release);
            self.client.write()?.take()
        };
        if let Some(client) = client {
            client.close().await;
        }
        Ok(())
    }
}

fn tcp_connector(config: &MasterConfig) -> TcpConnector {
    TcpConnector::new(config.rpc.connect_timeout)
}

lazy_static! {
    static ref GLOBAL_DISPATCHER: DispatcherHolder = DispatcherHolder::tcp();
}

/// Process-wide dispatcher holder using the TCP transport.
///
/// Prefer handing an explicit `Arc<dyn ReplicaDispatcher>` to `Master`; this
/// exists for call sites without access to the composition root.
pub fn global_dispatcher() -> &'static DispatcherHolder {
    &GLOBAL_DISPATCHER
}
