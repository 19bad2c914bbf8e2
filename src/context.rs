use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
#[cfg(test)] use mockall::automock;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::auth::{AllowAllAuthPolicy, AuthMethod, AuthPolicy};
use crate::config::IceConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{ErrorHandler, IoErrorHandler, LoggingErrorHandler, LoggingIoErrorHandler, OpenError, RegistryError};
use crate::registry::{AcceptorRegistration, OriginatorRegistration, ProtocolRegistry};
use crate::transport::{Connector, DefaultConnector, NetworkId};


/// A connection that is shared between several users, see [IceContext::open_connection]
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Observes connections being opened and closed
#[cfg_attr(test, automock)]
pub trait ConnectionWatch: Send + Sync {
    fn connection_opened(&self, connection_number: u64, connection_string: &str);
    fn connection_closed(&self, connection_number: u64, connection_string: &str);
}

/// Everything that is shared between the connections of an application: configuration, the
///  protocol registry, auth policy, error handlers, and connection watches.
pub struct IceContext {
    config: IceConfig,
    registry: RwLock<ProtocolRegistry>,
    auth_policy: RwLock<Arc<dyn AuthPolicy>>,
    error_handler: RwLock<Arc<dyn ErrorHandler>>,
    io_error_handler: RwLock<Arc<dyn IoErrorHandler>>,
    watches: RwLock<Vec<Arc<dyn ConnectionWatch>>>,
    connector: Arc<dyn Connector>,
    /// connections opened through this context, for sharing
    connections: Mutex<Vec<Weak<Mutex<Connection>>>>,
    next_connection_number: AtomicU64,
}

impl IceContext {
    pub fn new(config: IceConfig) -> anyhow::Result<Arc<IceContext>> {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(config: IceConfig, connector: Arc<dyn Connector>) -> anyhow::Result<Arc<IceContext>> {
        config.validate()?;

        Ok(Arc::new(IceContext {
            config,
            registry: Default::default(),
            auth_policy: RwLock::new(Arc::new(AllowAllAuthPolicy)),
            error_handler: RwLock::new(Arc::new(LoggingErrorHandler)),
            io_error_handler: RwLock::new(Arc::new(LoggingIoErrorHandler)),
            watches: Default::default(),
            connector,
            connections: Default::default(),
            next_connection_number: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub(crate) fn next_connection_number(&self) -> u64 {
        self.next_connection_number.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn registry(&self) -> RwLockReadGuard<'_, ProtocolRegistry> {
        self.registry.read().await
    }

    /// Registers a protocol for setting it up on connections, returning this side's opcode
    pub async fn register_for_protocol_setup(&self, registration: OriginatorRegistration) -> Result<u8, RegistryError> {
        self.registry.write().await
            .register_originator(registration)
    }

    /// Registers a protocol for accepting its setup by a peer, returning this side's opcode
    pub async fn register_for_protocol_reply(&self, registration: AcceptorRegistration) -> Result<u8, RegistryError> {
        self.registry.write().await
            .register_acceptor(registration)
    }

    pub async fn add_connection_auth_method(&self, method: Arc<dyn AuthMethod>) -> Result<(), RegistryError> {
        self.registry.write().await
            .add_connection_auth_method(method)
    }

    pub async fn auth_policy(&self) -> Arc<dyn AuthPolicy> {
        self.auth_policy.read().await.clone()
    }

    /// returns the previous policy
    pub async fn set_auth_policy(&self, policy: Arc<dyn AuthPolicy>) -> Arc<dyn AuthPolicy> {
        std::mem::replace(&mut *self.auth_policy.write().await, policy)
    }

    pub async fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        self.error_handler.read().await.clone()
    }

    /// Installs an error handler, or the default logging handler for `None`. Returns the
    ///  previous handler.
    pub async fn set_error_handler(&self, handler: Option<Arc<dyn ErrorHandler>>) -> Arc<dyn ErrorHandler> {
        let handler = handler.unwrap_or_else(|| Arc::new(LoggingErrorHandler));
        std::mem::replace(&mut *self.error_handler.write().await, handler)
    }

    pub async fn io_error_handler(&self) -> Arc<dyn IoErrorHandler> {
        self.io_error_handler.read().await.clone()
    }

    /// see [IceContext::set_error_handler]
    pub async fn set_io_error_handler(&self, handler: Option<Arc<dyn IoErrorHandler>>) -> Arc<dyn IoErrorHandler> {
        let handler = handler.unwrap_or_else(|| Arc::new(LoggingIoErrorHandler));
        std::mem::replace(&mut *self.io_error_handler.write().await, handler)
    }

    pub async fn add_connection_watch(&self, watch: Arc<dyn ConnectionWatch>) {
        self.watches.write().await.push(watch);
    }

    pub async fn remove_connection_watch(&self, watch: &Arc<dyn ConnectionWatch>) {
        self.watches.write().await
            .retain(|w| !Arc::ptr_eq(w, watch));
    }

    pub(crate) async fn notify_connection_opened(&self, connection_number: u64, connection_string: &str) {
        for watch in self.watches.read().await.iter() {
            watch.connection_opened(connection_number, connection_string);
        }
    }

    pub(crate) async fn notify_connection_closed(&self, connection_number: u64, connection_string: &str) {
        for watch in self.watches.read().await.iter() {
            watch.connection_closed(connection_number, connection_string);
        }
    }

    /// Opens a connection to the first reachable of a comma separated list of network ids, and
    ///  performs connection setup on it.
    ///
    /// If a connection to one of the network ids was opened before and is still usable, it is
    ///  shared instead of opening a new one. `major_opcode_check` excludes connections on which
    ///  that protocol is already active, for callers that need their own instance of it.
    #[tracing::instrument(skip(self))]
    pub async fn open_connection(self: &Arc<Self>, network_ids: &str, must_authenticate: bool, major_opcode_check: Option<u8>) -> Result<SharedConnection, OpenError> {
        let ids = NetworkId::parse_list(network_ids)
            .map_err(|e| {
                warn!("invalid network id list {:?}: {}", network_ids, e);
                OpenError::CannotConnect(network_ids.to_string())
            })?;
        if ids.is_empty() {
            return Err(OpenError::NoNetworkIds);
        }

        if let Some(shared) = self.find_shared_connection(&ids, major_opcode_check).await {
            return Ok(shared);
        }

        let mut transport = None;
        for id in &ids {
            match self.connector.connect(id).await {
                Ok(t) => {
                    transport = Some(t);
                    break;
                }
                Err(e) => debug!("could not connect to {}: {}", id, e),
            }
        }
        let transport = transport
            .ok_or_else(|| OpenError::CannotConnect(network_ids.to_string()))?;

        let connection = Connection::originate(self, transport, must_authenticate).await?;
        let connection_number = connection.connection_number();
        let connection_string = connection.connection_string().to_string();
        info!("opened connection #{} to {}", connection_number, connection_string);

        let shared = Arc::new(Mutex::new(connection));
        {
            let mut connections = self.connections.lock().await;
            connections.retain(|c| c.strong_count() > 0);
            connections.push(Arc::downgrade(&shared));
        }

        self.notify_connection_opened(connection_number, &connection_string).await;
        Ok(shared)
    }

    async fn find_shared_connection(&self, ids: &[NetworkId], major_opcode_check: Option<u8>) -> Option<SharedConnection> {
        let candidates = self.connections.lock().await
            .iter()
            .filter_map(|c| c.upgrade())
            .collect::<Vec<_>>();

        for id in ids {
            let id = id.to_string();
            for candidate in &candidates {
                // a connection that is busy dispatching is not a candidate
                let Ok(mut conn) = candidate.try_lock() else { continue };

                if conn.connection_string() != id
                    || conn.status() != ConnectionStatus::Accepted
                    || !conn.is_io_ok()
                    || conn.is_closed()
                    || conn.want_to_close()
                    || conn.free_asap()
                {
                    continue;
                }
                if let Some(opcode) = major_opcode_check {
                    if conn.is_protocol_active(opcode) {
                        continue;
                    }
                }

                conn.add_open_reference();
                debug!("sharing connection #{} to {}", conn.connection_number(), id);
                return Some(candidate.clone());
            }
        }
        None
    }
}
