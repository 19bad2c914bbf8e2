//! Helpers for unit tests: in-memory transports, scripted auth methods and protocol handlers,
//!  and shortcuts for getting connections into a given state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::HostBasedAuth;
use crate::connection::{Connection, ConnectionStatus, ProcessMessagesStatus};
use crate::context::IceContext;
use crate::error::OpenError;
use crate::protocol::header::Header;
use crate::protocol::ByteOrder;
use crate::transport::{Connector, NetworkId, StreamTransport, Transport};


pub const BUFFER_SIZE: usize = 64 * 1024;

/// host based auth that lets everybody in
pub struct AcceptAllHosts;
impl HostBasedAuth for AcceptAllHosts {
    fn accept_host(&self, _host_name: &str) -> bool {
        true
    }
}

/// dispatches a single message, failing the test if nothing arrives
pub async fn pump(connection: &mut Connection) -> ProcessMessagesStatus {
    tokio::time::timeout(Duration::from_secs(5), connection.process_messages(None))
        .await
        .expect("no message within timeout")
}

/// The other end of a connection's transport, for sending and inspecting raw bytes
pub struct RawPeer {
    stream: DuplexStream,
}
impl RawPeer {
    pub fn new(_order: ByteOrder) -> (RawPeer, Box<dyn Transport>) {
        let (a, b) = tokio::io::duplex(BUFFER_SIZE);
        (RawPeer { stream: a }, Box::new(StreamTransport::new(b, "local/raw-peer", "localhost")))
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
    }

    pub async fn read_message(&mut self, order: ByteOrder) -> (Header, Vec<u8>) {
        let mut raw = [0u8; Header::SIZE];
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut raw))
            .await
            .unwrap()
            .unwrap();
        let header = Header::deser(&raw, order);
        let mut body = vec![0u8; header.body_len()];
        self.stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }
}

/// an accepted connection without host based auth
pub async fn accept_with(ctx: &Arc<IceContext>, transport: Box<dyn Transport>) -> Connection {
    Connection::accept(ctx, transport, None).await.unwrap()
}

/// drives the acceptor's side of connection setup until it is decided
async fn drive_acceptor(connection: &mut Connection) {
    while connection.status() == ConnectionStatus::Pending {
        if pump(connection).await != ProcessMessagesStatus::Success {
            break;
        }
    }
}

/// Connection setup between two contexts over an in-memory transport, returning the
///  originator's outcome and the acceptor after it decided.
pub async fn originate_against(originator_ctx: &Arc<IceContext>, acceptor_ctx: &Arc<IceContext>, must_authenticate: bool, host_based_auth: Option<Arc<dyn HostBasedAuth>>) -> (Result<Connection, OpenError>, Connection) {
    let (a, b) = tokio::io::duplex(BUFFER_SIZE);
    let originator_transport = Box::new(StreamTransport::new(a, "local/acceptor", "localhost"));
    let acceptor_transport = Box::new(StreamTransport::new(b, "local/originator", "localhost"));

    let mut acceptor = Connection::accept(acceptor_ctx, acceptor_transport, host_based_auth).await.unwrap();
    let (originator, _) = tokio::join!(
        Connection::originate(originator_ctx, originator_transport, must_authenticate),
        drive_acceptor(&mut acceptor),
    );
    (originator, acceptor)
}

/// two connections that completed connection setup
pub async fn accepted_pair(originator_ctx: &Arc<IceContext>, acceptor_ctx: &Arc<IceContext>) -> (Connection, Connection) {
    let (originator, acceptor) = originate_against(originator_ctx, acceptor_ctx, false, Some(Arc::new(AcceptAllHosts))).await;
    let originator = originator.unwrap();
    assert_eq!(acceptor.status(), ConnectionStatus::Accepted);
    (originator, acceptor)
}

/// A connector with in-memory 'servers' that are registered per network id
#[derive(Default)]
pub struct TestConnector {
    servers: Mutex<FxHashMap<String, oneshot::Sender<DuplexStream>>>,
    connect_count: AtomicUsize,
}
impl TestConnector {
    /// Accepts a single connection to `network_id`, returning the accepted connection once its
    ///  setup is decided
    pub fn serve(&self, network_id: &str, ctx: Arc<IceContext>) -> JoinHandle<Connection> {
        let (send, recv) = oneshot::channel::<DuplexStream>();
        self.servers.lock().unwrap().insert(network_id.to_string(), send);

        tokio::spawn(async move {
            let stream = recv.await.unwrap();
            let transport = Box::new(StreamTransport::new(stream, "local/test-client", "localhost"));
            let mut connection = Connection::accept(&ctx, transport, Some(Arc::new(AcceptAllHosts))).await.unwrap();
            drive_acceptor(&mut connection).await;
            connection
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, network_id: &NetworkId) -> anyhow::Result<Box<dyn Transport>> {
        let id = network_id.to_string();
        let server = self.servers.lock().unwrap().remove(&id)
            .ok_or_else(|| anyhow::anyhow!("nothing listening on {}", id))?;

        let (a, b) = tokio::io::duplex(BUFFER_SIZE);
        server.send(b).map_err(|_| anyhow::anyhow!("server for {} is gone", id))?;
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StreamTransport::new(a, id, "localhost")))
    }
}

pub mod auth {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::auth::{AcceptorAuthStatus, AuthMethod, AuthState, OriginatorAuthStatus};

    /// accepts right away, and replies to challenges with empty data
    pub struct ImmediateAuthMethod {
        name: String,
    }
    impl ImmediateAuthMethod {
        pub fn new(name: &str) -> ImmediateAuthMethod {
            ImmediateAuthMethod { name: name.to_string() }
        }
    }
    impl AuthMethod for ImmediateAuthMethod {
        fn name(&self) -> &str {
            &self.name
        }

        fn originator_step(&self, _state: &mut AuthState, _network_id: &str, _challenge: &[u8]) -> OriginatorAuthStatus {
            OriginatorAuthStatus::HaveReply(Vec::new())
        }

        fn acceptor_step(&self, _state: &mut AuthState, _network_id: &str, _reply: Option<&[u8]>) -> AcceptorAuthStatus {
            AcceptorAuthStatus::Accepted
        }
    }

    /// Plays a scripted sequence of acceptor results (accepting once the script is exhausted),
    ///  and counts clean-ups
    pub struct CountingAuthMethod {
        name: String,
        script: Mutex<VecDeque<AcceptorAuthStatus>>,
        reject_as_originator: bool,
        clean_up_count: AtomicUsize,
    }
    impl CountingAuthMethod {
        pub fn new(name: &str, script: Vec<AcceptorAuthStatus>) -> CountingAuthMethod {
            CountingAuthMethod {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                reject_as_originator: false,
                clean_up_count: AtomicUsize::new(0),
            }
        }

        /// an originator that rejects every challenge with reason 'not me'
        pub fn rejecting_originator(name: &str) -> CountingAuthMethod {
            CountingAuthMethod {
                reject_as_originator: true,
                ..Self::new(name, vec![])
            }
        }

        pub fn clean_up_count(&self) -> usize {
            self.clean_up_count.load(Ordering::SeqCst)
        }
    }
    impl AuthMethod for CountingAuthMethod {
        fn name(&self) -> &str {
            &self.name
        }

        fn originator_step(&self, state: &mut AuthState, _network_id: &str, challenge: &[u8]) -> OriginatorAuthStatus {
            if self.reject_as_originator {
                return OriginatorAuthStatus::Rejected("not me".to_string());
            }
            *state = Some(Box::new(challenge.to_vec()));
            OriginatorAuthStatus::HaveReply(challenge.to_vec())
        }

        fn acceptor_step(&self, state: &mut AuthState, _network_id: &str, _reply: Option<&[u8]>) -> AcceptorAuthStatus {
            *state = Some(Box::new(()));
            self.script.lock().unwrap()
                .pop_front()
                .unwrap_or(AcceptorAuthStatus::Accepted)
        }

        fn clean_up(&self, state: &mut AuthState) {
            *state = None;
            self.clean_up_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub mod protocol {
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;

    use crate::config::IceConfig;
    use crate::connection::{Connection, ProcessMessagesStatus};
    use crate::context::IceContext;
    use crate::protocol::Version;
    use crate::registry::{AcceptorRegistration, ClientData, IncomingMessage, NoActivation, OriginatorRegistration, ProtocolHandler, ProtocolVersion};
    use crate::reply_wait::{Reply, ReplyWait};
    use crate::test_util::{accepted_pair, pump, AcceptAllHosts};

    /// Records the messages it gets, and answers a pending reply wait with the message's minor
    ///  opcode
    #[derive(Default)]
    pub struct RecordingHandler {
        messages: Mutex<Vec<IncomingMessage>>,
    }
    impl RecordingHandler {
        pub fn messages(&self) -> Vec<IncomingMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProtocolHandler for RecordingHandler {
        async fn process_message(&self, _connection: &mut Connection, message: IncomingMessage, _client_data: &ClientData, reply_wait: Option<&mut ReplyWait>) {
            if let Some(wait) = reply_wait {
                wait.set_reply(Reply::Protocol(Box::new(message.minor_opcode)));
            }
            self.messages.lock().unwrap().push(message);
        }
    }

    fn versions(versions: &[Version]) -> Vec<ProtocolVersion> {
        versions.iter()
            .map(|&version| ProtocolVersion {
                version,
                handler: Arc::new(RecordingHandler::default()),
            })
            .collect()
    }

    pub fn originator_registration(name: &str, protocol_versions: &[Version]) -> OriginatorRegistration {
        OriginatorRegistration {
            name: name.to_string(),
            vendor: "test-vendor".to_string(),
            release: "1.0".to_string(),
            versions: versions(protocol_versions),
            auth_methods: vec![],
        }
    }

    /// without auth methods, admitting every host
    pub fn acceptor_registration(name: &str, protocol_versions: &[Version]) -> AcceptorRegistration {
        AcceptorRegistration {
            name: name.to_string(),
            vendor: "test-vendor".to_string(),
            release: "1.0".to_string(),
            versions: versions(protocol_versions),
            auth_methods: vec![],
            host_based_auth: Some(Arc::new(AcceptAllHosts)),
            activation: Arc::new(NoActivation),
        }
    }

    /// Two connections with protocol "TEST" active, which has opcode 1 on both sides
    pub async fn active_protocol_pair() -> (Connection, Connection, u8) {
        let (originator, acceptor, opcodes) = active_protocols(&["TEST"]).await;
        (originator, acceptor, opcodes[0])
    }

    /// Two connections with the given protocols active. Both sides register them in the same
    ///  order, so each protocol has the same opcode on both sides.
    pub async fn active_protocols(names: &[&str]) -> (Connection, Connection, Vec<u8>) {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let mut opcodes = Vec::new();
        for name in names {
            let opcode = originator_ctx.register_for_protocol_setup(originator_registration(name, &[Version::new(1, 0)])).await.unwrap();
            let his_opcode = acceptor_ctx.register_for_protocol_reply(acceptor_registration(name, &[Version::new(1, 0)])).await.unwrap();
            assert_eq!(opcode, his_opcode);
            opcodes.push(opcode);
        }

        let (mut originator, mut acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;
        for (n, &opcode) in opcodes.iter().enumerate() {
            let drive_acceptor = async {
                while acceptor.proto_ref_count() <= n as u32 {
                    assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
                }
            };
            let (reply, _) = tokio::join!(
                originator.protocol_setup(opcode, None, false),
                drive_acceptor,
            );
            reply.unwrap();
        }
        (originator, acceptor, opcodes)
    }
}
