#[cfg(unix)] use std::path::PathBuf;
use std::sync::Arc;
use anyhow::bail;
use tokio::net::TcpListener;
#[cfg(unix)] use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::auth::HostBasedAuth;
use crate::connection::Connection;
use crate::context::IceContext;
use crate::error::AcceptError;
use crate::transport::{NetworkId, StreamTransport, Transport};


/// listen address used when the caller does not specify one
pub const DEFAULT_LISTEN_ADDRESS: &str = "tcp/127.0.0.1:0";

enum Endpoint {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local(UnixListener, PathBuf),
}

/// A listen endpoint producing ICE connections. A local socket's file is removed when the
///  listener is dropped.
pub struct Listener {
    context: Arc<IceContext>,
    endpoint: Endpoint,
    network_id: NetworkId,
    host_based_auth: Option<Arc<dyn HostBasedAuth>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Endpoint::Local(_, path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("could not remove socket file {}: {}", path.display(), e);
            }
        }
    }
}

impl Listener {
    async fn bind(context: &Arc<IceContext>, network_id: &NetworkId) -> anyhow::Result<Listener> {
        let (endpoint, bound_id) = match network_id {
            NetworkId::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local_addr = listener.local_addr()?;
                (Endpoint::Tcp(listener), NetworkId::Tcp(local_addr.to_string()))
            }
            #[cfg(unix)]
            NetworkId::Local(path) => {
                let listener = UnixListener::bind(path)?;
                (Endpoint::Local(listener, path.clone()), network_id.clone())
            }
            #[cfg(not(unix))]
            NetworkId::Local(_) => bail!("local transport is not supported on this platform"),
        };
        info!("listening for ICE connections on {}", bound_id);

        Ok(Listener {
            context: context.clone(),
            endpoint,
            network_id: bound_id,
            host_based_auth: None,
        })
    }

    /// the network id peers connect to, with the actual port for ephemeral TCP addresses
    pub fn network_id(&self) -> String {
        self.network_id.to_string()
    }

    /// Installs the fallback for peers without a usable auth method. It applies to connections
    ///  accepted afterwards.
    pub fn set_host_based_auth(&mut self, host_based_auth: Option<Arc<dyn HostBasedAuth>>) {
        self.host_based_auth = host_based_auth;
    }

    /// Waits for the next transport connection and wraps it in a `Pending` ICE connection that
    ///  has announced its byte order. The caller drives connection setup by dispatching on it.
    pub async fn accept(&self) -> Result<Connection, AcceptError> {
        let transport = self.accept_transport().await
            .map_err(|e| {
                warn!("accepting on {} failed: {}", self.network_id, e);
                AcceptError::AcceptFailure(e)
            })?;
        Connection::accept(&self.context, transport, self.host_based_auth.clone()).await
    }

    async fn accept_transport(&self) -> anyhow::Result<Box<dyn Transport>> {
        match &self.endpoint {
            Endpoint::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(StreamTransport::from_tcp(stream)?))
            }
            #[cfg(unix)]
            Endpoint::Local(listener, path) => {
                let (stream, _) = listener.accept().await?;
                let network_id = NetworkId::Local(path.clone()).to_string();
                Ok(Box::new(StreamTransport::new(stream, network_id, "localhost")))
            }
        }
    }
}

/// Opens listen endpoints for a comma separated list of network ids, or for
///  [DEFAULT_LISTEN_ADDRESS]. Returns the listeners together with the list of their network ids
///  for advertising them to peers.
#[tracing::instrument(skip(context))]
pub async fn listen_for_connections(context: &Arc<IceContext>, network_ids: Option<&str>) -> anyhow::Result<(Vec<Listener>, String)> {
    let ids = NetworkId::parse_list(network_ids.unwrap_or(DEFAULT_LISTEN_ADDRESS))?;
    if ids.is_empty() {
        bail!("no network ids to listen on");
    }

    let mut listeners = Vec::new();
    for id in &ids {
        match Listener::bind(context, id).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => warn!("cannot listen on {}: {}", id, e),
        }
    }
    if listeners.is_empty() {
        bail!("cannot listen on any of {:?}", network_ids);
    }

    let advertised = compose_network_id_list(&listeners);
    Ok((listeners, advertised))
}

/// the comma separated network ids of a set of listeners
pub fn compose_network_id_list(listeners: &[Listener]) -> String {
    listeners.iter()
        .map(|l| l.network_id())
        .collect::<Vec<_>>()
        .join(",")
}
