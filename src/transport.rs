use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};


/// A byte stream connection to the peer, as seen by the ICE engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// the network id of the connection's other end, e.g. `tcp/host:port`
    fn network_id(&self) -> String;

    /// the peer's host name as passed to host based authentication
    fn peer_host_name(&self) -> String;

    async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;
    async fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Adapts any tokio byte stream (TCP, Unix domain socket, in-memory duplex) as a [Transport]
pub struct StreamTransport<S> {
    stream: S,
    network_id: String,
    peer_host_name: String,
}

impl <S> StreamTransport<S> {
    pub fn new(stream: S, network_id: impl Into<String>, peer_host_name: impl Into<String>) -> StreamTransport<S> {
        StreamTransport {
            stream,
            network_id: network_id.into(),
            peer_host_name: peer_host_name.into(),
        }
    }
}

impl StreamTransport<TcpStream> {
    /// for accepted connections, identified by the peer's address
    pub fn from_tcp(stream: TcpStream) -> anyhow::Result<StreamTransport<TcpStream>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(StreamTransport::new(stream, NetworkId::Tcp(peer.to_string()).to_string(), peer.ip().to_string()))
    }
}

#[async_trait]
impl <S: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport for StreamTransport<S> {
    fn network_id(&self) -> String {
        self.network_id.clone()
    }

    fn peer_host_name(&self) -> String {
        self.peer_host_name.clone()
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        trace!(network_id=self.network_id, "writing {} bytes", buf.len());
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        debug!(network_id=self.network_id, "closing transport");
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A network id as exchanged between ICE peers: `tcp/host:port` or `local/path`. A list of
///  network ids is comma separated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetworkId {
    Tcp(String),
    Local(PathBuf),
}
impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkId::Tcp(addr) => write!(f, "tcp/{}", addr),
            NetworkId::Local(path) => write!(f, "local/{}", path.display()),
        }
    }
}
impl FromStr for NetworkId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, address) = s.trim()
            .split_once('/')
            .ok_or_else(|| anyhow!("network id {} has no transport prefix", s))?;
        if address.is_empty() {
            bail!("network id {} has no address", s);
        }
        match kind {
            "tcp" => Ok(NetworkId::Tcp(address.to_string())),
            "local" | "unix" => Ok(NetworkId::Local(PathBuf::from(address))),
            _ => bail!("unsupported transport {} in network id {}", kind, s),
        }
    }
}

impl NetworkId {
    pub fn parse_list(list: &str) -> anyhow::Result<Vec<NetworkId>> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(NetworkId::from_str)
            .collect()
    }
}

/// Opens transport connections to network ids
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, network_id: &NetworkId) -> anyhow::Result<Box<dyn Transport>>;
}

pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, network_id: &NetworkId) -> anyhow::Result<Box<dyn Transport>> {
        debug!("connecting to {}", network_id);
        match network_id {
            NetworkId::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let peer_host_name = stream.peer_addr()?.ip().to_string();
                // keep the id as given, it identifies the connection for sharing
                Ok(Box::new(StreamTransport::new(stream, network_id.to_string(), peer_host_name)))
            }
            #[cfg(unix)]
            NetworkId::Local(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(StreamTransport::new(stream, network_id.to_string(), "localhost")))
            }
            #[cfg(not(unix))]
            NetworkId::Local(_) => bail!("local transport is not supported on this platform"),
        }
    }
}
