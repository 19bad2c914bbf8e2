use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::auth::{select_auth_method, select_version, usable_methods, AcceptorAuthStatus, AuthSession, HostBasedAuth, OriginatorAuthStatus, Role};
use crate::connection::opcode_table::ProtocolBinding;
use crate::connection::{Connection, ConnectionStatus, ConnectToMe, OriginatorAuth, ProtoSetupToMe};
use crate::error::{DecodeError, ErrorClass, ErrorReport, Severity};
use crate::protocol::codec::MessageWriter;
use crate::protocol::core_messages::{AuthRequired, ConnectionReply, ConnectionSetup, CoreMessage, ErrorMessage, ProtocolReply, ProtocolSetup};
use crate::protocol::header::Header;
use crate::protocol::{MinorOpcode, CORE_MAJOR_OPCODE, ICE_PROTOCOL_NAME, ICE_VERSIONS};
use crate::registry::AcceptorRegistration;
use crate::reply_wait::{Reply, ReplyWait};


const HOST_BASED_AUTH_FAILED: &str = "None of the authentication protocols specified are supported and host-based authentication failed";

/// Which of this side's originated negotiations a message refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SetupKind {
    Connection,
    Protocol,
}
impl SetupKind {
    fn error_reply(self, text: String) -> Reply {
        match self {
            SetupKind::Connection => Reply::ConnectionError(text),
            SetupKind::Protocol => Reply::ProtocolError(text),
        }
    }
}

fn set_reply(wait: Option<&mut ReplyWait>, reply: Reply) {
    match wait {
        Some(wait) => wait.set_reply(reply),
        None => debug!(?reply, "no reply wait for reply"),
    }
}

/// Negotiation errors are fatal to the connection during connection setup, and to the protocol
///  being set up otherwise.
fn negotiation_severity(offending_minor_opcode: MinorOpcode) -> Severity {
    if offending_minor_opcode == MinorOpcode::ConnectionSetup {
        Severity::FatalToConnection
    }
    else {
        Severity::FatalToProtocol
    }
}

/// Gives host based authentication a chance to accept a peer whose authentication failed, as
///  long as the peer did not insist on authentication
fn with_host_fallback(status: AcceptorAuthStatus, must_authenticate: bool, host_based_auth: Option<&Arc<dyn HostBasedAuth>>, host_name: &str) -> AcceptorAuthStatus {
    match (&status, host_based_auth) {
        (AcceptorAuthStatus::Rejected(_) | AcceptorAuthStatus::Failed(_), Some(hba)) if !must_authenticate => {
            if hba.accept_host(host_name) {
                debug!("host based authentication accepted {} after failed authentication", host_name);
                AcceptorAuthStatus::Accepted
            }
            else {
                status
            }
        }
        _ => status,
    }
}

impl Connection {
    pub(crate) async fn send_error(&mut self, offending_minor_opcode: u8, class: ErrorClass, severity: Severity, values: Bytes) {
        debug!(connection=self.connection_number, ?class, ?severity, offending_minor_opcode, seq=self.receive_sequence, "sending error");
        self.send_core(CoreMessage::Error(ErrorMessage {
            error_class: class.into(),
            offending_minor_opcode,
            severity: severity.into(),
            offending_sequence: self.receive_sequence,
            values,
        })).await;
        self.flush_output().await;
    }

    fn error_values(&self, f: impl FnOnce(&mut MessageWriter)) -> Bytes {
        let mut writer = MessageWriter::new(0, 0, self.byte_order);
        f(&mut writer);
        writer.finish().slice(Header::SIZE..)
    }

    pub(crate) async fn send_bad_value(&mut self, offending_minor_opcode: u8, offset: u32, value: &[u8]) {
        let values = self.error_values(|w| {
            w.put_u32(offset);
            w.put_u32(value.len() as u32);
            w.put_slice(value);
        });
        self.send_error(offending_minor_opcode, ErrorClass::BadValue, Severity::CanContinue, values).await;
    }

    pub(crate) async fn send_bad_major(&mut self, major_opcode: u8, offending_minor_opcode: u8, severity: Severity) {
        let values = self.error_values(|w| w.put_u8(major_opcode));
        self.send_error(offending_minor_opcode, ErrorClass::BadMajor, severity, values).await;
    }

    async fn send_bad_state(&mut self, offending_minor_opcode: MinorOpcode) {
        debug!(connection=self.connection_number, "unexpected {:?} in current state", offending_minor_opcode);
        self.send_error(offending_minor_opcode.into(), ErrorClass::BadState, Severity::CanContinue, Bytes::new()).await;
    }

    async fn send_major_opcode_duplicate(&mut self, his_opcode: u8, offending_minor_opcode: MinorOpcode) {
        debug!(connection=self.connection_number, "peer's opcode {} is already bound", his_opcode);
        let values = self.error_values(|w| w.put_u8(his_opcode));
        self.send_error(offending_minor_opcode.into(), ErrorClass::MajorOpcodeDuplicate, Severity::FatalToProtocol, values).await;
    }

    async fn send_negotiation_error(&mut self, offending_minor_opcode: MinorOpcode, class: ErrorClass, reason: Option<&str>) {
        let values = match reason {
            Some(reason) => self.error_values(|w| w.put_string(reason)),
            None => Bytes::new(),
        };
        self.send_error(offending_minor_opcode.into(), class, negotiation_severity(offending_minor_opcode), values).await;
    }

    /// the severity of a malformed message depends on what it could have been part of
    fn length_error_severity(&self, minor_opcode: MinorOpcode) -> Severity {
        match minor_opcode {
            MinorOpcode::Error => {
                if self.connect_to_you.is_some() || self.status != ConnectionStatus::Accepted {
                    Severity::FatalToConnection
                }
                else {
                    Severity::FatalToProtocol
                }
            }
            MinorOpcode::AuthRequired | MinorOpcode::AuthNextPhase => {
                if self.connect_to_you.is_some() { Severity::FatalToConnection } else { Severity::FatalToProtocol }
            }
            MinorOpcode::AuthReply => {
                if self.connect_to_me.is_some() { Severity::FatalToConnection } else { Severity::FatalToProtocol }
            }
            MinorOpcode::ProtocolSetup | MinorOpcode::ProtocolReply => Severity::FatalToProtocol,
            _ => Severity::FatalToConnection,
        }
    }

    /// A malformed message that was fatal to the protocol being set up ends that setup
    fn abort_protocol_setup(&mut self, minor_opcode: MinorOpcode, wait: Option<&mut ReplyWait>) {
        match minor_opcode {
            MinorOpcode::AuthRequired | MinorOpcode::AuthNextPhase | MinorOpcode::ProtocolReply => {
                if self.protosetup_to_you.take().is_some() {
                    set_reply(wait, Reply::ProtocolError(format!("Protocol Setup Failed, reason : malformed {:?} message", minor_opcode)));
                }
            }
            MinorOpcode::AuthReply => {
                self.protosetup_to_me = None;
            }
            _ => {}
        }
    }

    fn originator_auth(&mut self) -> Option<(SetupKind, &mut OriginatorAuth)> {
        if let Some(setup) = self.connect_to_you.as_mut() {
            return Some((SetupKind::Connection, &mut setup.auth));
        }
        self.protosetup_to_you.as_mut()
            .map(|setup| (SetupKind::Protocol, &mut setup.auth))
    }

    /// drops the negotiation, which cleans up its auth state
    fn abandon(&mut self, kind: SetupKind) {
        match kind {
            SetupKind::Connection => self.connect_to_you = None,
            SetupKind::Protocol => self.protosetup_to_you = None,
        }
    }

    pub(crate) async fn process_core_message(&mut self, header: &Header, body: &[u8], wait: Option<&mut ReplyWait>) {
        let Ok(minor_opcode) = MinorOpcode::try_from(header.minor_opcode) else {
            debug!(connection=self.connection_number, "unknown core minor opcode {}", header.minor_opcode);
            self.send_error(header.minor_opcode, ErrorClass::BadMinor, Severity::CanContinue, Bytes::new()).await;
            return;
        };

        let message = match CoreMessage::decode(minor_opcode, header, body, self.peer_byte_order) {
            Ok(message) => message,
            Err(e) => {
                let severity = match e {
                    DecodeError::StringOverrun => Severity::FatalToConnection,
                    _ => self.length_error_severity(minor_opcode),
                };
                warn!(connection=self.connection_number, "malformed {:?} message: {}", minor_opcode, e);
                self.send_error(minor_opcode.into(), ErrorClass::BadLength, severity, Bytes::new()).await;
                match severity {
                    Severity::FatalToConnection => self.mark_fatal(),
                    Severity::FatalToProtocol => self.abort_protocol_setup(minor_opcode, wait),
                    Severity::CanContinue => {}
                }
                return;
            }
        };
        trace!(connection=self.connection_number, seq=self.receive_sequence, ?message, "received core message");

        match message {
            CoreMessage::Error(msg) => self.process_error(msg, wait).await,
            CoreMessage::ByteOrder(_) => {
                // only valid as the very first message
                self.send_error(minor_opcode.into(), ErrorClass::BadMinor, Severity::CanContinue, Bytes::new()).await;
            }
            CoreMessage::ConnectionSetup(msg) => self.process_connection_setup(msg).await,
            CoreMessage::AuthRequired(msg) => self.process_auth_required(msg, wait).await,
            CoreMessage::AuthReply(data) => self.process_auth_reply(&data).await,
            CoreMessage::AuthNextPhase(data) => self.process_auth_next_phase(&data, wait).await,
            CoreMessage::ConnectionReply(msg) => self.process_connection_reply(msg, wait).await,
            CoreMessage::ProtocolSetup(msg) => self.process_protocol_setup(msg).await,
            CoreMessage::ProtocolReply(msg) => self.process_protocol_reply(msg, wait).await,
            CoreMessage::Ping => self.send_core(CoreMessage::PingReply).await,
            CoreMessage::PingReply => self.process_ping_reply().await,
            CoreMessage::WantToClose => self.process_want_to_close().await,
            CoreMessage::NoClose => self.process_no_close().await,
        }
    }

    /// An error either answers a negotiation this side is waiting for, or goes to the error
    ///  handler.
    async fn process_error(&mut self, msg: ErrorMessage, wait: Option<&mut ReplyWait>) {
        let Ok(severity) = Severity::try_from(msg.severity) else {
            self.send_bad_value(MinorOpcode::Error.into(), 9, &[msg.severity]).await;
            return;
        };
        let report = ErrorReport {
            offending_minor_opcode: msg.offending_minor_opcode,
            offending_sequence: msg.offending_sequence,
            error_class: msg.error_class,
            severity,
            values: msg.values,
            byte_order: self.peer_byte_order,
        };
        debug!(connection=self.connection_number, ?report, "received error");

        let offending_minor_opcode = MinorOpcode::try_from(report.offending_minor_opcode).ok();
        let pending = match wait {
            Some(wait) if wait.sequence_of_request == report.offending_sequence => {
                let connection_setup = self.connect_to_you.as_ref()
                    .map(|s| if s.auth.session.is_some() { MinorOpcode::AuthReply } else { MinorOpcode::ConnectionSetup });
                let protocol_setup = self.protosetup_to_you.as_ref()
                    .map(|s| if s.auth.session.is_some() { MinorOpcode::AuthReply } else { MinorOpcode::ProtocolSetup });

                let resolution = if connection_setup.is_some() {
                    (connection_setup == offending_minor_opcode)
                        .then(|| report.connection_error_text())
                        .flatten()
                        .map(|text| (SetupKind::Connection, text))
                }
                else if protocol_setup.is_some() {
                    (protocol_setup == offending_minor_opcode)
                        .then(|| report.protocol_error_text())
                        .flatten()
                        .map(|text| (SetupKind::Protocol, text))
                }
                else {
                    None
                };
                resolution.map(|r| (wait, r))
            }
            _ => None,
        };

        match pending {
            Some((wait, (kind, text))) => {
                info!(connection=self.connection_number, "{:?} setup failed: {}", kind, text);
                wait.set_reply(kind.error_reply(text));
                self.abandon(kind);
            }
            None => {
                let handler = self.context.error_handler().await;
                handler.handle_error(self, &report);
                if severity == Severity::FatalToConnection {
                    warn!(connection=self.connection_number, "peer reported a fatal error, giving up on the connection");
                    self.mark_fatal();
                }
            }
        }
    }

    async fn process_connection_setup(&mut self, msg: ConnectionSetup) {
        if !self.from_listener || self.status != ConnectionStatus::Pending || self.connect_to_me.is_some() {
            self.send_bad_state(MinorOpcode::ConnectionSetup).await;
            return;
        }

        let must_authenticate = match msg.must_authenticate {
            0 => false,
            1 => true,
            other => {
                self.send_bad_value(MinorOpcode::ConnectionSetup.into(), 8, &[other]).await;
                self.status = ConnectionStatus::Rejected;
                return;
            }
        };

        let Some((his_version_index, my_version_index)) = select_version(&msg.versions, &ICE_VERSIONS) else {
            debug!(connection=self.connection_number, "no common ICE version in {:?}", msg.versions);
            self.send_negotiation_error(MinorOpcode::ConnectionSetup, ErrorClass::NoVersion, None).await;
            self.status = ConnectionStatus::Rejected;
            return;
        };

        let policy = self.context.auth_policy().await;
        let usable = {
            let registry = self.context.registry().await;
            usable_methods(registry.connection_auth_methods(), policy.as_ref(), Role::Acceptor, ICE_PROTOCOL_NAME, &self.connection_string)
        };

        let connect_to_me = match select_auth_method(&usable, &msg.auth_names) {
            None => {
                match self.host_based_auth.clone() {
                    Some(hba) if !must_authenticate => {
                        if !hba.accept_host(&self.peer_host_name) {
                            self.send_negotiation_error(MinorOpcode::ConnectionSetup, ErrorClass::AuthenticationRejected, Some(HOST_BASED_AUTH_FAILED)).await;
                            self.status = ConnectionStatus::Rejected;
                            return;
                        }
                    }
                    _ => {
                        debug!(connection=self.connection_number, "no usable auth method in {:?}", msg.auth_names);
                        self.send_negotiation_error(MinorOpcode::ConnectionSetup, ErrorClass::NoAuthentication, None).await;
                        self.status = ConnectionStatus::Rejected;
                        return;
                    }
                }
                None
            }
            Some((my_auth_index, his_auth_index)) => {
                let mut session = AuthSession::new(usable[my_auth_index].clone());
                match session.acceptor_step(&self.connection_string, None) {
                    AcceptorAuthStatus::Continue(data) => {
                        self.send_core(CoreMessage::AuthRequired(AuthRequired {
                            auth_index: his_auth_index as u8,
                            data: data.into(),
                        })).await;
                        Some(ConnectToMe {
                            his_version_index,
                            my_version_index,
                            his_vendor: msg.vendor.clone(),
                            his_release: msg.release.clone(),
                            must_authenticate,
                            auth: session,
                        })
                    }
                    AcceptorAuthStatus::Accepted => None,
                    AcceptorAuthStatus::Rejected(reason) => {
                        self.send_negotiation_error(MinorOpcode::ConnectionSetup, ErrorClass::AuthenticationRejected, Some(&reason)).await;
                        self.status = ConnectionStatus::Rejected;
                        return;
                    }
                    AcceptorAuthStatus::Failed(reason) => {
                        self.send_negotiation_error(MinorOpcode::ConnectionSetup, ErrorClass::AuthenticationFailed, Some(&reason)).await;
                        self.status = ConnectionStatus::Rejected;
                        return;
                    }
                }
            }
        };

        match connect_to_me {
            Some(connect_to_me) => self.connect_to_me = Some(connect_to_me),
            None => self.accept_connection(his_version_index, my_version_index, msg.vendor, msg.release).await,
        }
    }

    async fn accept_connection(&mut self, his_version_index: usize, my_version_index: usize, his_vendor: String, his_release: String) {
        let (vendor, release) = {
            let config = self.context.config();
            (config.vendor.clone(), config.release.clone())
        };
        self.send_core(CoreMessage::ConnectionReply(ConnectionReply {
            version_index: his_version_index as u8,
            vendor,
            release,
        })).await;

        info!(connection=self.connection_number, "accepted connection from {} ({} {})", self.connection_string, his_vendor, his_release);
        self.ice_version = Some(ICE_VERSIONS[my_version_index]);
        self.vendor = Some(his_vendor);
        self.release = Some(his_release);
        self.status = ConnectionStatus::Accepted;
    }

    async fn process_auth_required(&mut self, msg: AuthRequired, wait: Option<&mut ReplyWait>) {
        let network_id = self.connection_string.clone();
        let Some((kind, auth)) = self.originator_auth() else {
            self.send_bad_state(MinorOpcode::AuthRequired).await;
            return;
        };

        let step = auth.offered.get(msg.auth_index as usize)
            .cloned()
            .map(|method| {
                let session = auth.session.insert(AuthSession::new(method));
                session.originator_step(&network_id, &msg.data)
            });

        match step {
            Some(status) => self.continue_originator_auth(kind, status, MinorOpcode::AuthRequired, wait).await,
            None => {
                warn!(connection=self.connection_number, "peer requested auth method #{}, which was not offered", msg.auth_index);
                self.send_bad_value(MinorOpcode::AuthRequired.into(), 2, &[msg.auth_index]).await;
                set_reply(wait, kind.error_reply("Received bad authIndex in the AuthRequired message".to_string()));
                self.abandon(kind);
            }
        }
    }

    async fn process_auth_next_phase(&mut self, data: &[u8], wait: Option<&mut ReplyWait>) {
        let network_id = self.connection_string.clone();
        let step = self.originator_auth()
            .and_then(|(kind, auth)| {
                auth.session.as_mut()
                    .map(|session| (kind, session.originator_step(&network_id, data)))
            });

        match step {
            Some((kind, status)) => self.continue_originator_auth(kind, status, MinorOpcode::AuthNextPhase, wait).await,
            None => self.send_bad_state(MinorOpcode::AuthNextPhase).await,
        }
    }

    async fn continue_originator_auth(&mut self, kind: SetupKind, status: OriginatorAuthStatus, offending_minor_opcode: MinorOpcode, wait: Option<&mut ReplyWait>) {
        match status {
            OriginatorAuthStatus::HaveReply(data) => {
                self.send_core(CoreMessage::AuthReply(data.into())).await;
                // the peer's answer now refers to the AuthReply
                if let Some(wait) = wait {
                    wait.sequence_of_request = self.send_sequence;
                    wait.minor_opcode_of_request = MinorOpcode::AuthReply.into();
                }
            }
            OriginatorAuthStatus::Rejected(reason) => {
                self.send_negotiation_error(offending_minor_opcode, ErrorClass::AuthenticationRejected, Some(&reason)).await;
                set_reply(wait, kind.error_reply(format!("Authentication Rejected, reason : {}", reason)));
                self.abandon(kind);
            }
            OriginatorAuthStatus::Failed(reason) => {
                self.send_negotiation_error(offending_minor_opcode, ErrorClass::AuthenticationFailed, Some(&reason)).await;
                set_reply(wait, kind.error_reply(format!("Authentication Failed, reason : {}", reason)));
                self.abandon(kind);
            }
        }
    }

    async fn process_auth_reply(&mut self, data: &[u8]) {
        let network_id = self.connection_string.clone();

        if let Some(setup) = self.connect_to_me.as_mut() {
            let status = setup.auth.acceptor_step(&network_id, Some(data));
            let status = with_host_fallback(status, setup.must_authenticate, self.host_based_auth.as_ref(), &self.peer_host_name);

            match status {
                AcceptorAuthStatus::Continue(data) => {
                    self.send_core(CoreMessage::AuthNextPhase(data.into())).await;
                }
                AcceptorAuthStatus::Accepted => {
                    if let Some(setup) = self.connect_to_me.take() {
                        self.accept_connection(setup.his_version_index, setup.my_version_index, setup.his_vendor, setup.his_release).await;
                    }
                }
                AcceptorAuthStatus::Rejected(reason) => {
                    self.connect_to_me = None;
                    self.status = ConnectionStatus::Rejected;
                    self.send_negotiation_error(MinorOpcode::AuthReply, ErrorClass::AuthenticationRejected, Some(&reason)).await;
                }
                AcceptorAuthStatus::Failed(reason) => {
                    self.connect_to_me = None;
                    self.status = ConnectionStatus::Rejected;
                    self.send_negotiation_error(MinorOpcode::AuthReply, ErrorClass::AuthenticationFailed, Some(&reason)).await;
                }
            }
        }
        else if let Some(setup) = self.protosetup_to_me.as_mut() {
            let status = setup.auth.acceptor_step(&network_id, Some(data));
            let status = with_host_fallback(status, setup.must_authenticate, setup.registration.host_based_auth.as_ref(), &self.peer_host_name);

            match status {
                AcceptorAuthStatus::Continue(data) => {
                    self.send_core(CoreMessage::AuthNextPhase(data.into())).await;
                }
                AcceptorAuthStatus::Accepted => {
                    if let Some(setup) = self.protosetup_to_me.take() {
                        self.accept_protocol(setup.his_opcode, setup.my_opcode, setup.registration, setup.his_version_index, setup.my_version_index, setup.his_vendor, setup.his_release, MinorOpcode::AuthReply).await;
                    }
                }
                AcceptorAuthStatus::Rejected(reason) => {
                    self.protosetup_to_me = None;
                    self.send_negotiation_error(MinorOpcode::AuthReply, ErrorClass::AuthenticationRejected, Some(&reason)).await;
                }
                AcceptorAuthStatus::Failed(reason) => {
                    self.protosetup_to_me = None;
                    self.send_negotiation_error(MinorOpcode::AuthReply, ErrorClass::AuthenticationFailed, Some(&reason)).await;
                }
            }
        }
        else {
            self.send_bad_state(MinorOpcode::AuthReply).await;
        }
    }

    async fn process_connection_reply(&mut self, msg: ConnectionReply, wait: Option<&mut ReplyWait>) {
        // dropping the negotiation cleans up its auth state
        if self.connect_to_you.take().is_none() {
            self.send_bad_state(MinorOpcode::ConnectionReply).await;
            return;
        }

        let version_index = msg.version_index as usize;
        if version_index >= ICE_VERSIONS.len() {
            self.send_bad_value(MinorOpcode::ConnectionReply.into(), 2, &[msg.version_index]).await;
            set_reply(wait, Reply::ConnectionError("Received bad version index in Connection Reply".to_string()));
            return;
        }

        self.ice_version = Some(ICE_VERSIONS[version_index]);
        self.vendor = Some(msg.vendor.clone());
        self.release = Some(msg.release.clone());
        self.status = ConnectionStatus::Accepted;
        set_reply(wait, Reply::ConnectionReply {
            version_index,
            vendor: msg.vendor,
            release: msg.release,
        });
    }

    async fn process_protocol_setup(&mut self, msg: ProtocolSetup) {
        if self.want_to_close {
            // a new obligation appeared, it is up to the peer to offer closing again later
            debug!(connection=self.connection_number, "peer sets up a protocol, withdrawing WantToClose");
            self.want_to_close = false;
        }

        let must_authenticate = match msg.must_authenticate {
            0 => false,
            1 => true,
            other => {
                self.send_bad_value(MinorOpcode::ProtocolSetup.into(), 3, &[other]).await;
                return;
            }
        };

        if msg.protocol_opcode == CORE_MAJOR_OPCODE {
            self.send_bad_value(MinorOpcode::ProtocolSetup.into(), 2, &[msg.protocol_opcode]).await;
            return;
        }
        if self.opcodes.get(msg.protocol_opcode).is_some() {
            self.send_major_opcode_duplicate(msg.protocol_opcode, MinorOpcode::ProtocolSetup).await;
            return;
        }
        if self.opcodes.find_by_name(&msg.protocol_name).is_some() {
            self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::ProtocolDuplicate, Some(&msg.protocol_name)).await;
            return;
        }

        let acceptor = self.context.registry().await
            .acceptor(&msg.protocol_name);
        let Some((my_opcode, registration)) = acceptor else {
            debug!(connection=self.connection_number, "peer requested unknown protocol {}", msg.protocol_name);
            self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::UnknownProtocol, Some(&msg.protocol_name)).await;
            return;
        };

        let my_versions = registration.versions.iter()
            .map(|v| v.version)
            .collect::<Vec<_>>();
        let Some((his_version_index, my_version_index)) = select_version(&msg.versions, &my_versions) else {
            self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::NoVersion, None).await;
            return;
        };

        let policy = self.context.auth_policy().await;
        let usable = usable_methods(&registration.auth_methods, policy.as_ref(), Role::Acceptor, &registration.name, &self.connection_string);

        match select_auth_method(&usable, &msg.auth_names) {
            None => {
                match registration.host_based_auth.as_ref() {
                    Some(hba) if !must_authenticate => {
                        if !hba.accept_host(&self.peer_host_name) {
                            self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::AuthenticationRejected, Some(HOST_BASED_AUTH_FAILED)).await;
                            return;
                        }
                    }
                    _ => {
                        self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::NoAuthentication, None).await;
                        return;
                    }
                }
            }
            Some((my_auth_index, his_auth_index)) => {
                let mut session = AuthSession::new(usable[my_auth_index].clone());
                match session.acceptor_step(&self.connection_string, None) {
                    AcceptorAuthStatus::Continue(data) => {
                        if let Some(replaced) = &self.protosetup_to_me {
                            warn!(connection=self.connection_number, "protocol setup for {} replaces a setup in progress", msg.protocol_name);
                            debug!(connection=self.connection_number, "abandoning setup of protocol {} (peer opcode {}) during {} authentication",
                                replaced.registration.name, replaced.his_opcode, replaced.auth.method_name());
                        }
                        self.send_core(CoreMessage::AuthRequired(AuthRequired {
                            auth_index: his_auth_index as u8,
                            data: data.into(),
                        })).await;
                        self.protosetup_to_me = Some(ProtoSetupToMe {
                            his_opcode: msg.protocol_opcode,
                            my_opcode,
                            registration,
                            his_version_index,
                            my_version_index,
                            his_vendor: msg.vendor,
                            his_release: msg.release,
                            must_authenticate,
                            auth: session,
                        });
                        return;
                    }
                    AcceptorAuthStatus::Accepted => {}
                    AcceptorAuthStatus::Rejected(reason) => {
                        self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::AuthenticationRejected, Some(&reason)).await;
                        return;
                    }
                    AcceptorAuthStatus::Failed(reason) => {
                        self.send_negotiation_error(MinorOpcode::ProtocolSetup, ErrorClass::AuthenticationFailed, Some(&reason)).await;
                        return;
                    }
                }
            }
        }

        self.accept_protocol(msg.protocol_opcode, my_opcode, registration, his_version_index, my_version_index, msg.vendor, msg.release, MinorOpcode::ProtocolSetup).await;
    }

    /// Setup runs before the reply is sent, activation after it was queued
    #[allow(clippy::too_many_arguments)]
    async fn accept_protocol(&mut self, his_opcode: u8, my_opcode: u8, registration: Arc<AcceptorRegistration>, his_version_index: usize, my_version_index: usize, his_vendor: String, his_release: String, offending_minor_opcode: MinorOpcode) {
        let version = registration.versions[my_version_index].clone();

        // another setup may have bound the opcode while this one was authenticating
        if self.opcodes.get(his_opcode).is_some() {
            self.send_major_opcode_duplicate(his_opcode, offending_minor_opcode).await;
            return;
        }

        let client_data = match registration.activation.setup(self, version.version, &his_vendor, &his_release) {
            Ok(client_data) => client_data,
            Err(reason) => {
                info!(connection=self.connection_number, "setup of protocol {} failed: {}", registration.name, reason);
                self.send_negotiation_error(offending_minor_opcode, ErrorClass::SetupFailed, Some(&reason)).await;
                return;
            }
        };

        self.send_core(CoreMessage::ProtocolReply(ProtocolReply {
            version_index: his_version_index as u8,
            protocol_opcode: my_opcode,
            vendor: registration.vendor.clone(),
            release: registration.release.clone(),
        })).await;

        self.opcodes.add(his_opcode, ProtocolBinding {
            my_opcode,
            protocol_name: registration.name.clone(),
            role: Role::Acceptor,
            handler: version.handler.clone(),
            client_data: client_data.clone(),
        });
        self.proto_ref_count += 1;
        info!(connection=self.connection_number, "protocol {} {:?} is active with opcode {} (peer: {})", registration.name, version.version, my_opcode, his_opcode);

        registration.activation.activate(self, my_opcode, &client_data).await;
    }

    async fn process_protocol_reply(&mut self, msg: ProtocolReply, wait: Option<&mut ReplyWait>) {
        let Some(setup) = self.protosetup_to_you.take() else {
            self.send_bad_state(MinorOpcode::ProtocolReply).await;
            return;
        };

        let version_count = self.context.registry().await
            .originator(setup.my_opcode)
            .map(|r| r.versions.len())
            .unwrap_or(0);
        let version_index = msg.version_index as usize;
        if version_index >= version_count {
            self.send_bad_value(MinorOpcode::ProtocolReply.into(), 2, &[msg.version_index]).await;
            set_reply(wait, Reply::ProtocolError("Received bad version index in Protocol Reply".to_string()));
            return;
        }
        if msg.protocol_opcode == CORE_MAJOR_OPCODE || self.opcodes.get(msg.protocol_opcode).is_some() {
            self.send_bad_value(MinorOpcode::ProtocolReply.into(), 3, &[msg.protocol_opcode]).await;
            set_reply(wait, Reply::ProtocolError("Received bad protocol opcode in Protocol Reply".to_string()));
            return;
        }

        set_reply(wait, Reply::ProtocolReply {
            major_opcode: msg.protocol_opcode,
            version_index,
            vendor: msg.vendor,
            release: msg.release,
        });
    }

    async fn process_ping_reply(&mut self) {
        match self.ping_waits.pop_front() {
            Some(ping_wait) => {
                if ping_wait.send(()).is_err() {
                    debug!(connection=self.connection_number, "nobody is waiting for the ping reply any more");
                }
            }
            None => self.send_bad_state(MinorOpcode::PingReply).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::magic_cookie::MagicCookieAuth;
    use crate::auth::{AuthMethod, MockHostBasedAuth};
    use crate::config::IceConfig;
    use crate::connection::ProcessMessagesStatus;
    use crate::context::IceContext;
    use crate::error::OpenError;
    use crate::protocol::codec::MessageReader;
    use crate::protocol::{ByteOrder, Version};
    use crate::test_util::auth::{CountingAuthMethod, ImmediateAuthMethod};
    use crate::test_util::protocol::acceptor_registration;
    use crate::test_util::{accept_with, originate_against, pump, AcceptAllHosts, RawPeer};
    use rstest::rstest;

    /// a raw peer that completed connection setup with an acceptor admitting every host
    async fn accepted_raw_peer(ctx: &Arc<IceContext>) -> (RawPeer, Connection) {
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = Connection::accept(ctx, transport, Some(Arc::new(AcceptAllHosts))).await.unwrap();
        let _ = peer.read_message(order).await;

        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        peer.send(&CoreMessage::ConnectionSetup(ConnectionSetup {
            must_authenticate: 0,
            vendor: "v".to_string(),
            release: "r".to_string(),
            auth_names: vec![],
            versions: vec![Version::new(1, 0)],
        }).encode(order)).await;
        pump(&mut acceptor).await;
        pump(&mut acceptor).await;
        assert_eq!(acceptor.status(), ConnectionStatus::Accepted);

        let (header, _) = peer.read_message(order).await;
        assert_eq!(header.minor_opcode, u8::from(MinorOpcode::ConnectionReply));
        (peer, acceptor)
    }

    fn protocol_setup_message(protocol_opcode: u8, name: &str, auth_names: &[&str]) -> CoreMessage {
        CoreMessage::ProtocolSetup(ProtocolSetup {
            protocol_opcode,
            must_authenticate: 0,
            protocol_name: name.to_string(),
            vendor: "v".to_string(),
            release: "r".to_string(),
            auth_names: auth_names.iter().map(|n| n.to_string()).collect(),
            versions: vec![Version::new(1, 0)],
        })
    }

    async fn ctx_with_auth(methods: Vec<Arc<dyn AuthMethod>>) -> Arc<IceContext> {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        for m in methods {
            ctx.add_connection_auth_method(m).await.unwrap();
        }
        ctx
    }

    #[tokio::test]
    async fn test_auth_accepted_in_one_round_trip() {
        let originator_ctx = ctx_with_auth(vec![Arc::new(ImmediateAuthMethod::new("MIT-MAGIC-COOKIE-1")) as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![
            Arc::new(ImmediateAuthMethod::new("MIT-MAGIC-COOKIE-1")) as Arc<dyn AuthMethod>,
            Arc::new(ImmediateAuthMethod::new("XDM-AUTHORIZATION-1")),
        ]).await;

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, true, None).await;
        let originator = originator.unwrap();
        assert_eq!(originator.status(), ConnectionStatus::Accepted);
        assert_eq!(acceptor.status(), ConnectionStatus::Accepted);
        // ByteOrder and ConnectionReply, no AuthRequired
        assert_eq!(originator.last_received_sequence(), 2);
        assert_eq!(acceptor.last_received_sequence(), 2);
    }

    #[rstest]
    #[case::matching(b"cookie".to_vec(), None)]
    #[case::wrong_cookie(b"guess".to_vec(), Some("Authentication Rejected, reason : Invalid Magic Cookie"))]
    #[tokio::test]
    async fn test_magic_cookie(#[case] cookie: Vec<u8>, #[case] expected_error: Option<&str>) {
        let originator_ctx = ctx_with_auth(vec![Arc::new(MagicCookieAuth::new(cookie)) as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![Arc::new(MagicCookieAuth::new(b"cookie".to_vec())) as Arc<dyn AuthMethod>]).await;

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, true, None).await;
        match expected_error {
            None => {
                let originator = originator.unwrap();
                assert_eq!(originator.status(), ConnectionStatus::Accepted);
                // ByteOrder, AuthRequired, ConnectionReply
                assert_eq!(originator.last_received_sequence(), 3);
                assert_eq!(acceptor.status(), ConnectionStatus::Accepted);
            }
            Some(expected) => {
                assert!(matches!(originator, Err(OpenError::Rejected(msg)) if msg == expected));
                assert_eq!(acceptor.status(), ConnectionStatus::Rejected);
            }
        }
    }

    #[tokio::test]
    async fn test_no_common_auth() {
        let originator_ctx = ctx_with_auth(vec![Arc::new(ImmediateAuthMethod::new("A")) as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![Arc::new(ImmediateAuthMethod::new("B")) as Arc<dyn AuthMethod>]).await;

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, false, None).await;
        assert!(matches!(originator, Err(OpenError::Rejected(msg)) if msg == "None of the authentication protocols specified are supported"));
        assert_eq!(acceptor.status(), ConnectionStatus::Rejected);
    }

    #[rstest]
    #[case::accepted(true, false, None)]
    #[case::rejected(false, false, Some("Authentication Rejected, reason : None of the authentication protocols specified are supported and host-based authentication failed"))]
    #[case::must_authenticate(true, true, Some("None of the authentication protocols specified are supported"))]
    #[tokio::test]
    async fn test_host_based_fallback(#[case] accept_host: bool, #[case] must_authenticate: bool, #[case] expected_error: Option<&str>) {
        let originator_ctx = ctx_with_auth(vec![]).await;
        let acceptor_ctx = ctx_with_auth(vec![]).await;

        let mut hba = MockHostBasedAuth::new();
        hba.expect_accept_host()
            .times(if must_authenticate { 0 } else { 1 })
            .return_const(accept_host);

        let (originator, _) = originate_against(&originator_ctx, &acceptor_ctx, must_authenticate, Some(Arc::new(hba))).await;
        match expected_error {
            None => assert_eq!(originator.unwrap().status(), ConnectionStatus::Accepted),
            Some(expected) => assert!(matches!(originator, Err(OpenError::Rejected(msg)) if msg == expected)),
        }
    }

    #[tokio::test]
    async fn test_host_fallback_after_failed_auth() {
        let originator_ctx = ctx_with_auth(vec![Arc::new(MagicCookieAuth::new(b"wrong".to_vec())) as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![Arc::new(MagicCookieAuth::new(b"right".to_vec())) as Arc<dyn AuthMethod>]).await;

        let mut hba = MockHostBasedAuth::new();
        hba.expect_accept_host()
            .times(1)
            .return_const(true);

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, false, Some(Arc::new(hba))).await;
        assert_eq!(originator.unwrap().status(), ConnectionStatus::Accepted);
        assert_eq!(acceptor.status(), ConnectionStatus::Accepted);
    }

    #[rstest]
    #[case::accepted(vec![AcceptorAuthStatus::Continue(vec![1]), AcceptorAuthStatus::Continue(vec![2]), AcceptorAuthStatus::Accepted], true)]
    #[case::rejected_after_challenge(vec![AcceptorAuthStatus::Continue(vec![1]), AcceptorAuthStatus::Rejected("no".to_string())], false)]
    #[case::failed_after_phases(vec![AcceptorAuthStatus::Continue(vec![1]), AcceptorAuthStatus::Continue(vec![2]), AcceptorAuthStatus::Failed("broken".to_string())], false)]
    #[case::rejected_immediately(vec![AcceptorAuthStatus::Rejected("no".to_string())], false)]
    #[tokio::test]
    async fn test_auth_cleanup_exactly_once(#[case] script: Vec<AcceptorAuthStatus>, #[case] expect_accepted: bool) {
        let originator_method = Arc::new(CountingAuthMethod::new("X", vec![]));
        let acceptor_method = Arc::new(CountingAuthMethod::new("X", script));
        let originator_ctx = ctx_with_auth(vec![originator_method.clone() as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![acceptor_method.clone() as Arc<dyn AuthMethod>]).await;

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, true, None).await;
        assert_eq!(originator.is_ok(), expect_accepted);
        assert_eq!(acceptor.status() == ConnectionStatus::Accepted, expect_accepted);

        assert_eq!(acceptor_method.clean_up_count(), 1);
        // the originator only gets involved once there is a challenge
        assert!(originator_method.clean_up_count() <= 1);
        drop(acceptor);
        assert_eq!(acceptor_method.clean_up_count(), 1);
    }

    #[tokio::test]
    async fn test_originator_auth_rejected() {
        let originator_method = Arc::new(CountingAuthMethod::rejecting_originator("X"));
        let acceptor_method = Arc::new(CountingAuthMethod::new("X", vec![AcceptorAuthStatus::Continue(vec![])]));
        let originator_ctx = ctx_with_auth(vec![originator_method.clone() as Arc<dyn AuthMethod>]).await;
        let acceptor_ctx = ctx_with_auth(vec![acceptor_method.clone() as Arc<dyn AuthMethod>]).await;

        let (originator, acceptor) = originate_against(&originator_ctx, &acceptor_ctx, true, None).await;
        assert!(matches!(originator, Err(OpenError::Rejected(msg)) if msg == "Authentication Rejected, reason : not me"));
        assert_eq!(originator_method.clean_up_count(), 1);

        // the acceptor gets the error, and then sees the originator close the transport
        assert_eq!(acceptor.status(), ConnectionStatus::IoError);
        assert_eq!(acceptor_method.clean_up_count(), 0);
        drop(acceptor);
        assert_eq!(acceptor_method.clean_up_count(), 1);
    }

    #[tokio::test]
    async fn test_no_version() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = accept_with(&ctx, transport).await;
        let _ = peer.read_message(order).await;

        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        peer.send(&CoreMessage::ConnectionSetup(ConnectionSetup {
            must_authenticate: 0,
            vendor: "v".to_string(),
            release: "r".to_string(),
            auth_names: vec![],
            versions: vec![Version::new(2, 0), Version::new(0, 9)],
        }).encode(order)).await;

        pump(&mut acceptor).await;
        pump(&mut acceptor).await;
        assert_eq!(acceptor.status(), ConnectionStatus::Rejected);

        let (header, body) = peer.read_message(order).await;
        assert_eq!(header.data_u16(order), u16::from(ErrorClass::NoVersion));
        let mut r = MessageReader::new(&body, order);
        assert_eq!(r.get_u8().unwrap(), u8::from(MinorOpcode::ConnectionSetup));
        assert_eq!(r.get_u8().unwrap(), u8::from(Severity::FatalToConnection));
        r.skip(2).unwrap();
        assert_eq!(r.get_u32().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_must_authenticate() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::MsbFirst;
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = accept_with(&ctx, transport).await;
        let my_order = acceptor.byte_order();
        let _ = peer.read_message(my_order).await;

        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        peer.send(&CoreMessage::ConnectionSetup(ConnectionSetup {
            must_authenticate: 5,
            vendor: "v".to_string(),
            release: "r".to_string(),
            auth_names: vec![],
            versions: vec![Version::new(1, 0)],
        }).encode(order)).await;
        pump(&mut acceptor).await;
        pump(&mut acceptor).await;
        assert_eq!(acceptor.status(), ConnectionStatus::Rejected);

        let (header, body) = peer.read_message(my_order).await;
        assert_eq!(header.data_u16(my_order), u16::from(ErrorClass::BadValue));
        let mut r = MessageReader::new(&body, my_order);
        r.skip(8).unwrap();
        assert_eq!(r.get_u32().unwrap(), 8);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_u8().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unexpected_replies_are_bad_state() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = accept_with(&ctx, transport).await;
        let _ = peer.read_message(order).await;
        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        pump(&mut acceptor).await;

        for msg in [CoreMessage::PingReply, CoreMessage::NoClose, CoreMessage::AuthNextPhase(Bytes::new()), CoreMessage::AuthReply(Bytes::new())] {
            let minor = msg.minor_opcode();
            peer.send(&msg.encode(order)).await;
            assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);

            let (header, body) = peer.read_message(order).await;
            assert_eq!(header.data_u16(order), u16::from(ErrorClass::BadState));
            assert_eq!(body[0], u8::from(minor));
            assert_eq!(body[1], u8::from(Severity::CanContinue));
        }
    }

    #[tokio::test]
    async fn test_invalid_error_severity() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = accept_with(&ctx, transport).await;
        let _ = peer.read_message(order).await;
        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        pump(&mut acceptor).await;

        peer.send(&CoreMessage::Error(ErrorMessage {
            error_class: ErrorClass::BadState.into(),
            offending_minor_opcode: MinorOpcode::Ping.into(),
            severity: 9,
            offending_sequence: 1,
            values: Bytes::new(),
        }).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);

        let (header, body) = peer.read_message(order).await;
        assert_eq!(header.data_u16(order), u16::from(ErrorClass::BadValue));
        let mut r = MessageReader::new(&body, order);
        r.skip(8).unwrap();
        assert_eq!(r.get_u32().unwrap(), 9);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_u8().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_fatal_error_from_peer() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut acceptor = accept_with(&ctx, transport).await;
        let _ = peer.read_message(order).await;
        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        pump(&mut acceptor).await;

        peer.send(&CoreMessage::Error(ErrorMessage {
            error_class: ErrorClass::BadLength.into(),
            offending_minor_opcode: MinorOpcode::Ping.into(),
            severity: Severity::FatalToConnection.into(),
            offending_sequence: 1,
            values: Bytes::new(),
        }).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::IoError);
        assert_eq!(acceptor.status(), ConnectionStatus::IoError);
    }

    #[test]
    fn test_negotiation_severity() {
        assert_eq!(negotiation_severity(MinorOpcode::ConnectionSetup), Severity::FatalToConnection);
        assert_eq!(negotiation_severity(MinorOpcode::AuthReply), Severity::FatalToProtocol);
        assert_eq!(negotiation_severity(MinorOpcode::ProtocolSetup), Severity::FatalToProtocol);
    }

    #[tokio::test]
    async fn test_protocol_setup_with_unusable_opcode() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        ctx.register_for_protocol_reply(acceptor_registration("A", &[Version::new(1, 0)])).await.unwrap();
        ctx.register_for_protocol_reply(acceptor_registration("B", &[Version::new(1, 0)])).await.unwrap();
        let order = ByteOrder::native();
        let (mut peer, mut acceptor) = accepted_raw_peer(&ctx).await;

        // opcode 0 is the core protocol's
        peer.send(&protocol_setup_message(0, "A", &[]).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        let (header, body) = peer.read_message(order).await;
        assert_eq!(header.data_u16(order), u16::from(ErrorClass::BadValue));
        let mut r = MessageReader::new(&body, order);
        assert_eq!(r.get_u8().unwrap(), u8::from(MinorOpcode::ProtocolSetup));
        r.skip(7).unwrap();
        assert_eq!(r.get_u32().unwrap(), 2);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_u8().unwrap(), 0);
        assert_eq!(acceptor.proto_ref_count(), 0);

        peer.send(&protocol_setup_message(4, "A", &[]).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        let (header, _) = peer.read_message(order).await;
        assert_eq!(header.minor_opcode, u8::from(MinorOpcode::ProtocolReply));
        assert_eq!(acceptor.proto_ref_count(), 1);

        peer.send(&protocol_setup_message(4, "B", &[]).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        let (header, body) = peer.read_message(order).await;
        assert_eq!(header.data_u16(order), u16::from(ErrorClass::MajorOpcodeDuplicate));
        assert_eq!(body[1], u8::from(Severity::FatalToProtocol));
        assert_eq!(body[8], 4);
        assert_eq!(acceptor.proto_ref_count(), 1);
        assert_eq!(acceptor.opcodes.get(4).unwrap().protocol_name, "A");
    }

    #[tokio::test]
    async fn test_replaced_protocol_setup_cleans_up_auth() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let method_a = Arc::new(CountingAuthMethod::new("X", vec![AcceptorAuthStatus::Continue(vec![1])]));
        let method_b = Arc::new(CountingAuthMethod::new("X", vec![AcceptorAuthStatus::Continue(vec![2])]));
        let mut registration_a = acceptor_registration("A", &[Version::new(1, 0)]);
        registration_a.auth_methods = vec![method_a.clone() as Arc<dyn AuthMethod>];
        let mut registration_b = acceptor_registration("B", &[Version::new(1, 0)]);
        registration_b.auth_methods = vec![method_b.clone() as Arc<dyn AuthMethod>];
        ctx.register_for_protocol_reply(registration_a).await.unwrap();
        ctx.register_for_protocol_reply(registration_b).await.unwrap();

        let order = ByteOrder::native();
        let (mut peer, mut acceptor) = accepted_raw_peer(&ctx).await;

        peer.send(&protocol_setup_message(4, "A", &["X"]).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        let (header, _) = peer.read_message(order).await;
        assert_eq!(header.minor_opcode, u8::from(MinorOpcode::AuthRequired));
        assert_eq!(method_a.clean_up_count(), 0);

        peer.send(&protocol_setup_message(5, "B", &["X"]).encode(order)).await;
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        let (header, _) = peer.read_message(order).await;
        assert_eq!(header.minor_opcode, u8::from(MinorOpcode::AuthRequired));

        assert_eq!(method_a.clean_up_count(), 1);
        assert_eq!(method_b.clean_up_count(), 0);
        assert_eq!(acceptor.protosetup_to_me.as_ref().unwrap().registration.name, "B");
    }
}
