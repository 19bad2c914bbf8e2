//! The per-session state of an ICE connection, and everything that operates on it: the
//!  message dispatcher, the core protocol handlers including authentication, originator side
//!  negotiation, and shutdown negotiation.
//!
//! A [Connection] is driven by calling [Connection::process_messages], once per incoming
//!  message. It is never dispatched into concurrently, which is enforced by `&mut self`;
//!  connections that are shared between several users live behind a mutex (see
//!  [crate::context::SharedConnection]).

mod core_handler;
mod dispatcher;
mod opcode_table;
mod setup;
mod shutdown;

pub use dispatcher::ProcessMessagesStatus;
pub use opcode_table::ProtocolBinding;
pub use shutdown::CloseStatus;

use std::collections::{TryReserveError, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use anyhow::bail;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::auth::{AuthMethod, AuthSession, HostBasedAuth};
use crate::config::IceConfig;
use crate::connection::opcode_table::OpcodeTable;
use crate::context::IceContext;
use crate::error::AcceptError;
use crate::protocol::codec::MessageWriter;
use crate::protocol::core_messages::CoreMessage;
use crate::protocol::{ByteOrder, Version};
use crate::registry::AcceptorRegistration;
use crate::reply_wait::ReplyWaitQueue;
use crate::transport::Transport;


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// connection setup is in progress
    Pending,
    Accepted,
    Rejected,
    /// the transport failed, or a fatal protocol error occurred
    IoError,
}

/// The originator's side of an authentication: the methods offered to the peer, which
///  `AuthRequired` refers to by index, and the session once the peer picked one.
struct OriginatorAuth {
    offered: Vec<Arc<dyn AuthMethod>>,
    session: Option<AuthSession>,
}
impl OriginatorAuth {
    fn new(offered: Vec<Arc<dyn AuthMethod>>) -> OriginatorAuth {
        OriginatorAuth {
            offered,
            session: None,
        }
    }
}

/// This side sent `ConnectionSetup` and waits for the peer's decision
struct ConnectToYou {
    auth: OriginatorAuth,
}

/// The peer sent `ConnectionSetup`, and authentication is in progress
struct ConnectToMe {
    his_version_index: usize,
    my_version_index: usize,
    his_vendor: String,
    his_release: String,
    must_authenticate: bool,
    auth: AuthSession,
}

/// This side sent `ProtocolSetup` and waits for the peer's decision
struct ProtoSetupToYou {
    my_opcode: u8,
    auth: OriginatorAuth,
}

/// The peer sent `ProtocolSetup`, and authentication is in progress
struct ProtoSetupToMe {
    his_opcode: u8,
    my_opcode: u8,
    registration: Arc<AcceptorRegistration>,
    his_version_index: usize,
    my_version_index: usize,
    his_vendor: String,
    his_release: String,
    must_authenticate: bool,
    auth: AuthSession,
}

/// Tracks the nesting depth of dispatch calls for as long as it is alive. Dropping a dispatch
///  future mid-await (`select!`, `timeout`) drops the scope too, so the level stays accurate.
struct DispatchScope {
    level: Arc<AtomicU32>,
}
impl DispatchScope {
    fn enter(level: &Arc<AtomicU32>) -> DispatchScope {
        level.fetch_add(1, Ordering::AcqRel);
        DispatchScope {
            level: level.clone(),
        }
    }
}
impl Drop for DispatchScope {
    fn drop(&mut self) {
        self.level.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Connection {
    context: Arc<IceContext>,
    transport: Box<dyn Transport>,
    connection_number: u64,
    connection_string: String,
    peer_host_name: String,
    /// created by a listener, as opposed to being opened by this side
    from_listener: bool,
    host_based_auth: Option<Arc<dyn HostBasedAuth>>,

    status: ConnectionStatus,
    io_ok: bool,
    freed: bool,
    closed_notified: bool,

    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    scratch: Vec<u8>,

    waiting_for_byte_order: bool,
    byte_order: ByteOrder,
    peer_byte_order: ByteOrder,
    send_sequence: u32,
    receive_sequence: u32,

    ice_version: Option<Version>,
    vendor: Option<String>,
    release: Option<String>,

    opcodes: OpcodeTable,
    connect_to_you: Option<ConnectToYou>,
    connect_to_me: Option<ConnectToMe>,
    protosetup_to_you: Option<ProtoSetupToYou>,
    protosetup_to_me: Option<ProtoSetupToMe>,

    open_ref_count: u32,
    proto_ref_count: u32,
    dispatch_level: Arc<AtomicU32>,
    want_to_close: bool,
    skip_want_to_close: bool,
    free_asap: bool,

    reply_waits: ReplyWaitQueue,
    ping_waits: VecDeque<oneshot::Sender<()>>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ICE#{}{{{} {:?}}}", self.connection_number, self.connection_string, self.status)
    }
}

fn allocate_buffers(config: &IceConfig) -> Result<(Vec<u8>, Vec<u8>), TryReserveError> {
    let mut in_buf = Vec::new();
    in_buf.try_reserve(config.input_buffer_size)?;
    let mut out_buf = Vec::new();
    out_buf.try_reserve(config.output_buffer_size)?;
    Ok((in_buf, out_buf))
}

impl Connection {
    fn new(context: &Arc<IceContext>, transport: Box<dyn Transport>, buffers: (Vec<u8>, Vec<u8>), from_listener: bool) -> Connection {
        let byte_order = context.config().byte_order;
        let connection_string = transport.network_id();
        let peer_host_name = transport.peer_host_name();

        Connection {
            context: context.clone(),
            transport,
            connection_number: context.next_connection_number(),
            connection_string,
            peer_host_name,
            from_listener,
            host_based_auth: None,
            status: ConnectionStatus::Pending,
            io_ok: true,
            freed: false,
            closed_notified: false,
            in_buf: buffers.0,
            out_buf: buffers.1,
            scratch: Vec::new(),
            waiting_for_byte_order: true,
            byte_order,
            peer_byte_order: byte_order,
            send_sequence: 0,
            receive_sequence: 0,
            ice_version: None,
            vendor: None,
            release: None,
            opcodes: Default::default(),
            connect_to_you: None,
            connect_to_me: None,
            protosetup_to_you: None,
            protosetup_to_me: None,
            open_ref_count: 1,
            proto_ref_count: 0,
            dispatch_level: Default::default(),
            want_to_close: false,
            skip_want_to_close: false,
            free_asap: false,
            reply_waits: Default::default(),
            ping_waits: Default::default(),
        }
    }

    /// Wraps a transport connection that was accepted from a listener. The returned connection
    ///  is `Pending` and has announced this side's byte order; the caller drives connection
    ///  setup by calling [Connection::process_messages] until its status changes.
    #[tracing::instrument(skip_all, fields(network_id=transport.network_id()))]
    pub async fn accept(context: &Arc<IceContext>, mut transport: Box<dyn Transport>, host_based_auth: Option<Arc<dyn HostBasedAuth>>) -> Result<Connection, AcceptError> {
        let buffers = match allocate_buffers(context.config()) {
            Ok(buffers) => buffers,
            Err(e) => {
                warn!("could not allocate buffers for accepted connection: {}", e);
                if let Err(e) = transport.close().await {
                    debug!("error closing transport: {}", e);
                }
                return Err(AcceptError::AcceptBadMalloc);
            }
        };

        let mut connection = Connection::new(context, transport, buffers, true);
        connection.host_based_auth = host_based_auth;

        connection.send_core(CoreMessage::ByteOrder(connection.byte_order)).await;
        connection.flush_output().await;
        if !connection.io_ok {
            connection.free_connection().await;
            return Err(AcceptError::AcceptFailure(anyhow::anyhow!("could not send byte order to {}", connection.connection_string)));
        }

        debug!("accepted connection #{} from {}", connection.connection_number, connection.connection_string);
        context.notify_connection_opened(connection.connection_number, &connection.connection_string).await;
        Ok(connection)
    }

    pub fn context(&self) -> &Arc<IceContext> {
        &self.context
    }

    pub fn connection_number(&self) -> u64 {
        self.connection_number
    }

    /// the network id of the peer
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn peer_host_name(&self) -> &str {
        &self.peer_host_name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_io_ok(&self) -> bool {
        self.io_ok
    }

    /// true once the connection was torn down
    pub fn is_closed(&self) -> bool {
        self.freed
    }

    pub fn want_to_close(&self) -> bool {
        self.want_to_close
    }

    pub fn free_asap(&self) -> bool {
        self.free_asap
    }

    /// The peer's vendor string, available once connection setup succeeded
    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn release(&self) -> Option<&str> {
        self.release.as_deref()
    }

    /// the negotiated version of the core protocol
    pub fn ice_version(&self) -> Option<Version> {
        self.ice_version
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn peer_byte_order(&self) -> ByteOrder {
        self.peer_byte_order
    }

    /// whether the peer's byte order differs from this side's
    pub fn is_swapping(&self) -> bool {
        self.peer_byte_order != self.byte_order
    }

    pub fn last_sent_sequence(&self) -> u32 {
        self.send_sequence
    }

    pub fn last_received_sequence(&self) -> u32 {
        self.receive_sequence
    }

    pub fn open_ref_count(&self) -> u32 {
        self.open_ref_count
    }

    pub fn proto_ref_count(&self) -> u32 {
        self.proto_ref_count
    }

    pub fn dispatch_level(&self) -> u32 {
        self.dispatch_level.load(Ordering::Acquire)
    }

    pub fn add_open_reference(&mut self) {
        self.open_ref_count += 1;
    }

    /// whether the protocol with this side's opcode `my_opcode` is active on this connection
    pub fn is_protocol_active(&self, my_opcode: u8) -> bool {
        self.opcodes.find_mine(my_opcode).is_some()
    }

    /// A buffer for sub-protocol handlers to use while processing a message, holding at least
    ///  `size` bytes. Its content is not preserved between uses.
    pub fn scratch_buffer(&mut self, size: usize) -> &mut Vec<u8> {
        self.scratch.clear();
        self.scratch.resize(size, 0);
        &mut self.scratch
    }

    /// A writer for a sub-protocol message. Messages are tagged with this side's opcode for
    ///  the protocol, the peer maps it to its own numbering.
    pub fn message_writer(&self, my_opcode: u8, minor_opcode: u8) -> MessageWriter {
        MessageWriter::new(my_opcode, minor_opcode, self.byte_order)
    }

    /// Queues a message for sending, returning its sequence number. The message is written to
    ///  the transport when the output buffer is full, or when the connection is flushed.
    pub async fn send_message(&mut self, writer: MessageWriter) -> anyhow::Result<u32> {
        if !self.io_ok {
            bail!("connection #{} to {} is not usable", self.connection_number, self.connection_string);
        }
        self.write_message(&writer.finish()).await;
        if !self.io_ok {
            bail!("I/O error sending to {}", self.connection_string);
        }
        Ok(self.send_sequence)
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.flush_output().await;
        if !self.io_ok {
            bail!("I/O error flushing connection to {}", self.connection_string);
        }
        Ok(())
    }

    /// Sends a `Ping` to the peer. The returned receiver completes when the matching
    ///  `PingReply` is dispatched; pings are answered in the order they were sent.
    pub async fn ping(&mut self) -> anyhow::Result<oneshot::Receiver<()>> {
        let (send, recv) = oneshot::channel();
        self.send_core(CoreMessage::Ping).await;
        self.flush_output().await;
        if !self.io_ok {
            bail!("I/O error sending ping to {}", self.connection_string);
        }
        self.ping_waits.push_back(send);
        Ok(recv)
    }

    pub(crate) async fn send_core(&mut self, message: CoreMessage) {
        trace!(connection=self.connection_number, minor=?message.minor_opcode(), "sending core message");
        let encoded = message.encode(self.byte_order);
        self.write_message(&encoded).await;
    }

    /// Every message counts towards the send sequence, even if the connection is broken and
    ///  the message is dropped.
    async fn write_message(&mut self, message: &[u8]) {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        if !self.io_ok {
            return;
        }

        let capacity = self.context.config().output_buffer_size;
        if self.out_buf.len() + message.len() > capacity {
            self.flush_output().await;
        }
        if message.len() > capacity {
            if let Err(e) = self.transport.write_all(message).await {
                self.io_failure(e).await;
            }
        }
        else {
            self.out_buf.extend_from_slice(message);
        }
    }

    pub(crate) async fn flush_output(&mut self) {
        if !self.io_ok || self.out_buf.is_empty() {
            return;
        }
        let mut out = std::mem::take(&mut self.out_buf);
        let result = self.transport.write_all(&out).await;
        out.clear();
        self.out_buf = out;

        if let Err(e) = result {
            self.io_failure(e).await;
        }
    }

    /// Puts the connection into the sticky fault state. The I/O error handler is not called
    ///  while connection setup is still in progress, the pending setup reports the failure.
    async fn io_failure(&mut self, e: anyhow::Error) {
        if !self.io_ok {
            return;
        }
        self.io_ok = false;
        warn!(connection=self.connection_number, "I/O error on connection to {}: {}", self.connection_string, e);

        if self.status == ConnectionStatus::Pending {
            return;
        }
        let handler = self.context.io_error_handler().await;
        handler.handle_io_error(self);
    }

    /// after a fatal protocol error, the connection is as unusable as after an I/O error
    fn mark_fatal(&mut self) {
        self.io_ok = false;
        self.status = ConnectionStatus::IoError;
    }

    async fn notify_closed(&mut self) {
        if self.closed_notified {
            return;
        }
        self.closed_notified = true;
        self.context.notify_connection_closed(self.connection_number, &self.connection_string).await;
    }

    /// Releases everything the connection holds and closes the transport. Negotiations in
    ///  progress are abandoned, which cleans up their auth state.
    async fn free_connection(&mut self) {
        if self.freed {
            return;
        }
        debug!(connection=self.connection_number, "freeing connection to {}", self.connection_string);

        self.freed = true;
        self.io_ok = false;
        self.connect_to_you = None;
        self.connect_to_me = None;
        self.protosetup_to_you = None;
        self.protosetup_to_me = None;
        self.opcodes.clear();
        self.proto_ref_count = 0;
        self.open_ref_count = 0;
        self.ping_waits.clear();
        self.reply_waits.clear();
        self.out_buf.clear();

        if let Err(e) = self.transport.close().await {
            debug!("error closing transport to {}: {}", self.connection_string, e);
        }
    }
}
