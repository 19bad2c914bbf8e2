use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error as ThisError;
use tracing::{error, warn};

use crate::connection::Connection;
use crate::protocol::codec::MessageReader;
use crate::protocol::{ByteOrder, MinorOpcode};


#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Severity {
    CanContinue = 0,
    FatalToProtocol = 1,
    FatalToConnection = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ErrorClass {
    BadMajor = 0,
    NoAuthentication = 1,
    NoVersion = 2,
    SetupFailed = 3,
    AuthenticationRejected = 4,
    AuthenticationFailed = 5,
    ProtocolDuplicate = 6,
    MajorOpcodeDuplicate = 7,
    UnknownProtocol = 8,
    BadMinor = 0x8000,
    BadState = 0x8001,
    BadLength = 0x8002,
    BadValue = 0x8003,
}

#[derive(Debug, ThisError)]
pub enum DecodeError {
    #[error("message is shorter than its fixed part: {needed} more bytes needed")]
    Truncated { needed: usize },
    #[error("string extends beyond the end of the message")]
    StringOverrun,
    #[error("message declares {declared} words but its content fills {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, ThisError)]
pub enum OpenError {
    #[error("no network id to connect to")]
    NoNetworkIds,
    #[error("cannot connect to any of {0}")]
    CannotConnect(String),
    #[error("could not allocate connection buffers")]
    BadAlloc,
    #[error("I/O error during connection setup")]
    IoError,
    #[error("connection rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, ThisError)]
pub enum ProtocolSetupError {
    #[error("no protocol is registered for opcode {0}")]
    UnknownOpcode(u8),
    #[error("protocol with opcode {0} is already active on this connection")]
    AlreadyActive(u8),
    #[error("another protocol setup is in progress on this connection")]
    SetupInProgress,
    #[error("I/O error during protocol setup")]
    IoError,
    #[error("{0}")]
    Failure(String),
}

#[derive(Debug, ThisError)]
pub enum AcceptError {
    #[error("accept failed: {0}")]
    AcceptFailure(anyhow::Error),
    #[error("could not allocate connection buffers")]
    AcceptBadMalloc,
}

#[derive(Debug, ThisError)]
pub enum RegistryError {
    #[error("protocol {0} is already registered for this role")]
    AlreadyRegistered(String),
    #[error("all major opcodes are in use")]
    TooManyProtocols,
    #[error("protocol {0} has no versions")]
    NoVersions(String),
    #[error("protocol {0} has more versions than fit a setup message")]
    TooManyVersions(String),
    #[error("{0} has more auth methods than fit a setup message")]
    TooManyAuthMethods(String),
}

/// An `Error` message as received from the peer, with the byte order needed to interpret
///  its class-specific values.
#[derive(Clone)]
pub struct ErrorReport {
    pub offending_minor_opcode: u8,
    pub offending_sequence: u32,
    pub error_class: u16,
    pub severity: Severity,
    pub values: Bytes,
    pub byte_order: ByteOrder,
}
impl Debug for ErrorReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.class() {
            Some(class) => write!(f, "ERR{{{:?}/{:?} for minor {}@{}}}", class, self.severity, self.offending_minor_opcode, self.offending_sequence),
            None => write!(f, "ERR{{0x{:04x}/{:?} for minor {}@{}}}", self.error_class, self.severity, self.offending_minor_opcode, self.offending_sequence),
        }
    }
}

impl ErrorReport {
    pub fn class(&self) -> Option<ErrorClass> {
        ErrorClass::try_from(self.error_class).ok()
    }

    /// The reason string for those error classes that carry one
    pub fn reason(&self) -> Option<String> {
        match self.class()? {
            ErrorClass::SetupFailed |
            ErrorClass::AuthenticationRejected |
            ErrorClass::AuthenticationFailed |
            ErrorClass::ProtocolDuplicate |
            ErrorClass::UnknownProtocol => {
                MessageReader::new(&self.values, self.byte_order)
                    .get_string()
                    .ok()
            }
            _ => None,
        }
    }

    /// The opcode byte carried by `BadMajor` and `MajorOpcodeDuplicate`
    pub fn offending_opcode(&self) -> Option<u8> {
        match self.class()? {
            ErrorClass::BadMajor | ErrorClass::MajorOpcodeDuplicate => self.values.first().copied(),
            _ => None,
        }
    }

    /// Translates an error that answers a pending connection setup into the message reported
    ///  to whoever is waiting for the setup. Classes that can not be a negotiation outcome
    ///  return `None` and go to the error handler instead.
    pub fn connection_error_text(&self) -> Option<String> {
        match self.class()? {
            ErrorClass::NoVersion => Some("None of the ICE versions specified are supported".to_string()),
            ErrorClass::NoAuthentication => Some("None of the authentication protocols specified are supported".to_string()),
            ErrorClass::SetupFailed => Some(format!("Connection Setup Failed, reason : {}", self.reason().unwrap_or_default())),
            ErrorClass::AuthenticationRejected => Some(format!("Authentication Rejected, reason : {}", self.reason().unwrap_or_default())),
            ErrorClass::AuthenticationFailed => Some(format!("Authentication Failed, reason : {}", self.reason().unwrap_or_default())),
            _ => None,
        }
    }

    /// see [ErrorReport::connection_error_text]
    pub fn protocol_error_text(&self) -> Option<String> {
        match self.class()? {
            ErrorClass::NoVersion => Some("None of the protocol versions specified are supported".to_string()),
            ErrorClass::NoAuthentication => Some("None of the authentication protocols specified are supported".to_string()),
            ErrorClass::SetupFailed => Some(format!("Protocol Setup Failed, reason : {}", self.reason().unwrap_or_default())),
            ErrorClass::AuthenticationRejected => Some(format!("Authentication Rejected, reason : {}", self.reason().unwrap_or_default())),
            ErrorClass::AuthenticationFailed => Some(format!("Authentication Failed, reason : {}", self.reason().unwrap_or_default())),
            ErrorClass::ProtocolDuplicate => Some(format!("Protocol was already registered : {}", self.reason().unwrap_or_default())),
            ErrorClass::MajorOpcodeDuplicate => Some(format!("The major opcode was already used : {}", self.offending_opcode().unwrap_or_default())),
            ErrorClass::UnknownProtocol => Some(format!("Unknown Protocol : {}", self.reason().unwrap_or_default())),
            _ => None,
        }
    }
}

/// Receives `Error` messages from the peer that do not resolve a pending negotiation. There is
///  one handler per [crate::context::IceContext], the last one installed wins.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, connection: &Connection, report: &ErrorReport);
}

/// Notified once per connection when its transport fails. The connection is unusable
///  afterwards except for closing it.
pub trait IoErrorHandler: Send + Sync {
    fn handle_io_error(&self, connection: &Connection);
}

pub struct LoggingErrorHandler;
impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, connection: &Connection, report: &ErrorReport) {
        let minor = MinorOpcode::try_from(report.offending_minor_opcode).ok();
        match report.severity {
            Severity::CanContinue => warn!(connection=connection.connection_string(), ?minor, "peer reported {:?}", report),
            _ => error!(connection=connection.connection_string(), ?minor, "peer reported {:?}", report),
        }
    }
}

pub struct LoggingIoErrorHandler;
impl IoErrorHandler for LoggingIoErrorHandler {
    fn handle_io_error(&self, connection: &Connection) {
        error!(connection=connection.connection_string(), "I/O error on connection #{}", connection.connection_number());
    }
}
