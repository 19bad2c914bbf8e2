use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{usable_methods, Role};
use crate::connection::opcode_table::ProtocolBinding;
use crate::connection::{allocate_buffers, Connection, ConnectToYou, OriginatorAuth, ProcessMessagesStatus, ProtoSetupToYou};
use crate::context::IceContext;
use crate::error::{OpenError, ProtocolSetupError};
use crate::protocol::core_messages::{ConnectionSetup, CoreMessage, ProtocolSetup};
use crate::protocol::{MinorOpcode, CORE_MAJOR_OPCODE, ICE_PROTOCOL_NAME, ICE_VERSIONS};
use crate::registry::ClientData;
use crate::reply_wait::{ProtocolSetupReply, Reply, ReplyWait};
use crate::transport::Transport;


impl Connection {
    /// Performs connection setup on a freshly opened transport: announce the byte order, send
    ///  `ConnectionSetup`, and dispatch until the peer accepts or rejects the connection.
    pub(crate) async fn originate(context: &Arc<IceContext>, mut transport: Box<dyn Transport>, must_authenticate: bool) -> Result<Connection, OpenError> {
        let buffers = match allocate_buffers(context.config()) {
            Ok(buffers) => buffers,
            Err(e) => {
                warn!("could not allocate buffers for connection to {}: {}", transport.network_id(), e);
                if let Err(e) = transport.close().await {
                    debug!("error closing transport: {}", e);
                }
                return Err(OpenError::BadAlloc);
            }
        };
        let mut connection = Connection::new(context, transport, buffers, false);

        let policy = context.auth_policy().await;
        let offered = {
            let registry = context.registry().await;
            usable_methods(registry.connection_auth_methods(), policy.as_ref(), Role::Originator, ICE_PROTOCOL_NAME, &connection.connection_string)
        };
        let (vendor, release) = {
            let config = context.config();
            (config.vendor.clone(), config.release.clone())
        };

        connection.send_core(CoreMessage::ByteOrder(connection.byte_order)).await;
        connection.send_core(CoreMessage::ConnectionSetup(ConnectionSetup {
            must_authenticate: must_authenticate.into(),
            vendor,
            release,
            auth_names: offered.iter().map(|m| m.name().to_string()).collect(),
            versions: ICE_VERSIONS.to_vec(),
        })).await;
        connection.connect_to_you = Some(ConnectToYou {
            auth: OriginatorAuth::new(offered),
        });

        let mut wait = ReplyWait::new(connection.send_sequence, CORE_MAJOR_OPCODE, MinorOpcode::ConnectionSetup.into());
        let reply = loop {
            match connection.process_messages(Some(&mut wait)).await {
                ProcessMessagesStatus::Success => {
                    if let Some(reply) = wait.take_reply() {
                        break reply;
                    }
                }
                ProcessMessagesStatus::IoError | ProcessMessagesStatus::ConnectionClosed => {
                    info!("I/O error during connection setup with {}", connection.connection_string);
                    connection.free_connection().await;
                    return Err(OpenError::IoError);
                }
            }
        };

        match reply {
            Reply::ConnectionReply { .. } => {
                debug!("connection #{} to {} is set up", connection.connection_number, connection.connection_string);
                Ok(connection)
            }
            Reply::ConnectionError(msg) => {
                info!("connection to {} was rejected: {}", connection.connection_string, msg);
                connection.free_connection().await;
                Err(OpenError::Rejected(msg))
            }
            other => {
                warn!("unexpected reply to connection setup: {:?}", other);
                connection.free_connection().await;
                Err(OpenError::IoError)
            }
        }
    }

    /// Activates the protocol this side registered for originating under `my_opcode` on this
    ///  connection, dispatching incoming messages until the peer answers.
    ///
    /// On success, messages for the protocol are routed to the handler of the negotiated
    ///  version, which receives `client_data` with each message.
    #[tracing::instrument(skip(self, client_data), fields(connection=self.connection_number))]
    pub async fn protocol_setup(&mut self, my_opcode: u8, client_data: ClientData, must_authenticate: bool) -> Result<ProtocolSetupReply, ProtocolSetupError> {
        let registration = self.context.registry().await
            .originator(my_opcode)
            .ok_or(ProtocolSetupError::UnknownOpcode(my_opcode))?;
        if self.opcodes.find_mine(my_opcode).is_some() {
            return Err(ProtocolSetupError::AlreadyActive(my_opcode));
        }
        if self.protosetup_to_you.is_some() {
            return Err(ProtocolSetupError::SetupInProgress);
        }
        if !self.io_ok || self.freed {
            return Err(ProtocolSetupError::IoError);
        }

        let policy = self.context.auth_policy().await;
        let offered = usable_methods(&registration.auth_methods, policy.as_ref(), Role::Originator, &registration.name, &self.connection_string);

        self.send_core(CoreMessage::ProtocolSetup(ProtocolSetup {
            protocol_opcode: my_opcode,
            must_authenticate: must_authenticate.into(),
            protocol_name: registration.name.clone(),
            vendor: registration.vendor.clone(),
            release: registration.release.clone(),
            auth_names: offered.iter().map(|m| m.name().to_string()).collect(),
            versions: registration.versions.iter().map(|v| v.version).collect(),
        })).await;
        self.protosetup_to_you = Some(ProtoSetupToYou {
            my_opcode,
            auth: OriginatorAuth::new(offered),
        });

        let mut wait = ReplyWait::new(self.send_sequence, CORE_MAJOR_OPCODE, MinorOpcode::ProtocolSetup.into());
        let reply = loop {
            match self.process_messages(Some(&mut wait)).await {
                ProcessMessagesStatus::Success => {
                    if let Some(reply) = wait.take_reply() {
                        break reply;
                    }
                }
                ProcessMessagesStatus::IoError | ProcessMessagesStatus::ConnectionClosed => {
                    self.reply_waits.remove(wait.id());
                    self.protosetup_to_you = None;
                    return Err(ProtocolSetupError::IoError);
                }
            }
        };

        match reply {
            Reply::ProtocolReply { major_opcode: his_opcode, version_index, vendor, release } => {
                let Some(version) = registration.versions.get(version_index) else {
                    return Err(ProtocolSetupError::Failure("Got a bad version index in the Protocol Reply".to_string()));
                };
                if self.opcodes.get(his_opcode).is_some() {
                    return Err(ProtocolSetupError::Failure(format!("Peer's opcode {} is already in use", his_opcode)));
                }

                self.opcodes.add(his_opcode, ProtocolBinding {
                    my_opcode,
                    protocol_name: registration.name.clone(),
                    role: Role::Originator,
                    handler: version.handler.clone(),
                    client_data,
                });
                self.proto_ref_count += 1;
                info!("protocol {} {:?} is active with opcode {} (peer: {})", registration.name, version.version, my_opcode, his_opcode);

                Ok(ProtocolSetupReply {
                    version: version.version,
                    vendor,
                    release,
                })
            }
            Reply::ProtocolError(msg) => {
                info!("protocol setup for {} failed: {}", registration.name, msg);
                Err(ProtocolSetupError::Failure(msg))
            }
            other => {
                warn!("unexpected reply to protocol setup: {:?}", other);
                Err(ProtocolSetupError::Failure(format!("unexpected reply {:?}", other)))
            }
        }
    }
}
