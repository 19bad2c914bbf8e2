use std::any::Any;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::auth::{AuthMethod, HostBasedAuth};
use crate::connection::Connection;
use crate::error::RegistryError;
use crate::protocol::codec::MessageReader;
use crate::protocol::{ByteOrder, Version, ICE_PROTOCOL_NAME, MAX_LIST_LEN};
use crate::reply_wait::ReplyWait;


/// Opaque per-connection data of an active sub-protocol, created by its setup callback and
///  handed to every invocation of its message handler.
pub type ClientData = Option<Arc<dyn Any + Send + Sync>>;

/// A sub-protocol message, read completely from the transport before it is handed to the
///  protocol's handler.
#[derive(Clone)]
pub struct IncomingMessage {
    /// this side's opcode for the protocol, regardless of the opcode the peer used
    pub major_opcode: u8,
    pub minor_opcode: u8,
    pub data: [u8; 2],
    pub body: Bytes,
    pub byte_order: ByteOrder,
}
impl Debug for IncomingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{{}:{} +{}}}", self.major_opcode, self.minor_opcode, self.body.len())
    }
}

impl IncomingMessage {
    /// a reader for the body in the sender's byte order
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(&self.body, self.byte_order)
    }
}

/// Processes the messages of one version of a sub-protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// `reply_wait` is the oldest outstanding reply wait for this protocol on this connection,
    ///  if any. The handler marks it ready by storing a reply in it.
    ///
    /// The handler may pump further messages by calling [Connection::process_messages]
    ///  recursively.
    async fn process_message(&self, connection: &mut Connection, message: IncomingMessage, client_data: &ClientData, reply_wait: Option<&mut ReplyWait>);
}

/// The acceptor side's hooks for a sub-protocol being set up by the peer.
#[async_trait]
pub trait ProtocolActivation: Send + Sync {
    /// Called when the peer's setup was accepted, before the reply is sent. Returning an error
    ///  turns the acceptance into a `SetupFailed` error with the returned reason.
    fn setup(&self, _connection: &Connection, _version: Version, _vendor: &str, _release: &str) -> Result<ClientData, String> {
        Ok(None)
    }

    /// Called after the `ProtocolReply` was queued, so this is the place to send the first
    ///  protocol messages.
    async fn activate(&self, _connection: &mut Connection, _my_opcode: u8, _client_data: &ClientData) {
    }
}

/// Activation hooks for protocols that need neither
pub struct NoActivation;
impl ProtocolActivation for NoActivation {}

#[derive(Clone)]
pub struct ProtocolVersion {
    pub version: Version,
    pub handler: Arc<dyn ProtocolHandler>,
}
impl Debug for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.version)
    }
}

/// Registration for initiating setup of a protocol on connections
pub struct OriginatorRegistration {
    pub name: String,
    pub vendor: String,
    pub release: String,
    /// in order of preference
    pub versions: Vec<ProtocolVersion>,
    /// in order of preference
    pub auth_methods: Vec<Arc<dyn AuthMethod>>,
}

/// Registration for accepting setup of a protocol initiated by the peer
pub struct AcceptorRegistration {
    pub name: String,
    pub vendor: String,
    pub release: String,
    pub versions: Vec<ProtocolVersion>,
    pub auth_methods: Vec<Arc<dyn AuthMethod>>,
    pub host_based_auth: Option<Arc<dyn HostBasedAuth>>,
    pub activation: Arc<dyn ProtocolActivation>,
}

pub struct RegisteredProtocol {
    pub name: String,
    pub originator: Option<Arc<OriginatorRegistration>>,
    pub acceptor: Option<Arc<AcceptorRegistration>>,
}

/// Maps protocol names to major opcodes and holds what each side registered for them.
///  Opcodes are assigned in registration order starting at 1, and registering the second role
///  of an already known protocol reuses its opcode.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: Vec<RegisteredProtocol>,
    by_name: FxHashMap<String, u8>,
    connection_auth_methods: Vec<Arc<dyn AuthMethod>>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        Default::default()
    }

    fn opcode_for_registration(&mut self, name: &str) -> Result<u8, RegistryError> {
        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(e) => {
                if self.protocols.len() >= u8::MAX as usize {
                    return Err(RegistryError::TooManyProtocols);
                }
                self.protocols.push(RegisteredProtocol {
                    name: name.to_string(),
                    originator: None,
                    acceptor: None,
                });
                let opcode = self.protocols.len() as u8;
                e.insert(opcode);
                Ok(opcode)
            }
        }
    }

    fn check_list_lengths(name: &str, versions: &[ProtocolVersion], auth_methods: &[Arc<dyn AuthMethod>]) -> Result<(), RegistryError> {
        if versions.is_empty() {
            return Err(RegistryError::NoVersions(name.to_string()));
        }
        if versions.len() > MAX_LIST_LEN {
            return Err(RegistryError::TooManyVersions(name.to_string()));
        }
        if auth_methods.len() > MAX_LIST_LEN {
            return Err(RegistryError::TooManyAuthMethods(name.to_string()));
        }
        Ok(())
    }

    fn entry_mut(&mut self, opcode: u8) -> &mut RegisteredProtocol {
        &mut self.protocols[opcode as usize - 1]
    }

    pub fn register_originator(&mut self, registration: OriginatorRegistration) -> Result<u8, RegistryError> {
        Self::check_list_lengths(&registration.name, &registration.versions, &registration.auth_methods)?;
        if self.get(registration.name.as_str()).and_then(|p| p.originator.as_ref()).is_some() {
            return Err(RegistryError::AlreadyRegistered(registration.name));
        }

        let opcode = self.opcode_for_registration(&registration.name)?;
        debug!("registered protocol {} for originating setup with opcode {}", registration.name, opcode);
        self.entry_mut(opcode).originator = Some(Arc::new(registration));
        Ok(opcode)
    }

    pub fn register_acceptor(&mut self, registration: AcceptorRegistration) -> Result<u8, RegistryError> {
        Self::check_list_lengths(&registration.name, &registration.versions, &registration.auth_methods)?;
        if self.get(registration.name.as_str()).and_then(|p| p.acceptor.as_ref()).is_some() {
            return Err(RegistryError::AlreadyRegistered(registration.name));
        }

        let opcode = self.opcode_for_registration(&registration.name)?;
        debug!("registered protocol {} for accepting setup with opcode {}", registration.name, opcode);
        self.entry_mut(opcode).acceptor = Some(Arc::new(registration));
        Ok(opcode)
    }

    pub fn opcode_for(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn get<'a>(&self, key: impl Into<ProtocolKey<'a>>) -> Option<&RegisteredProtocol> {
        let opcode = match key.into() {
            ProtocolKey::Opcode(opcode) => opcode,
            ProtocolKey::Name(name) => self.opcode_for(name)?,
        };
        if opcode == 0 {
            return None;
        }
        self.protocols.get(opcode as usize - 1)
    }

    pub fn originator(&self, opcode: u8) -> Option<Arc<OriginatorRegistration>> {
        self.get(opcode)?.originator.clone()
    }

    /// The acceptor registration for a protocol name, together with this side's opcode for it
    pub fn acceptor(&self, name: &str) -> Option<(u8, Arc<AcceptorRegistration>)> {
        let opcode = self.opcode_for(name)?;
        let acceptor = self.get(opcode)?.acceptor.clone()?;
        Some((opcode, acceptor))
    }

    /// Auth methods for core connection setup, in order of preference. They apply to both roles.
    pub fn add_connection_auth_method(&mut self, method: Arc<dyn AuthMethod>) -> Result<(), RegistryError> {
        if self.connection_auth_methods.len() >= MAX_LIST_LEN {
            return Err(RegistryError::TooManyAuthMethods(ICE_PROTOCOL_NAME.to_string()));
        }
        self.connection_auth_methods.push(method);
        Ok(())
    }

    pub fn connection_auth_methods(&self) -> &[Arc<dyn AuthMethod>] {
        &self.connection_auth_methods
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

pub enum ProtocolKey<'a> {
    Opcode(u8),
    Name(&'a str),
}
impl From<u8> for ProtocolKey<'_> {
    fn from(value: u8) -> Self {
        ProtocolKey::Opcode(value)
    }
}
impl <'a> From<&'a str> for ProtocolKey<'a> {
    fn from(value: &'a str) -> Self {
        ProtocolKey::Name(value)
    }
}
