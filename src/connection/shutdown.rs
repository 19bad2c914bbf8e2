use bytes::Bytes;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionStatus};
use crate::error::{ErrorClass, Severity};
use crate::protocol::core_messages::CoreMessage;
use crate::protocol::MinorOpcode;


/// The outcome of [Connection::close]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseStatus {
    /// the connection is gone
    ClosedNow,
    /// the connection is freed as soon as the outermost dispatch returns
    ClosedAsap,
    /// there are remaining references, the connection stays open
    ConnectionInUse,
    /// `WantToClose` was sent, the connection is freed when the peer closes its end
    StartedShutdownNegotiation,
}

impl Connection {
    fn no_references(&self) -> bool {
        self.open_ref_count == 0 && self.proto_ref_count == 0
    }

    /// Whether closing the connection negotiates with the peer (the default), or closes the
    ///  transport right away once the last reference is gone.
    pub fn set_shutdown_negotiation(&mut self, negotiate: bool) {
        self.skip_want_to_close = !negotiate;
    }

    pub fn shutdown_negotiation(&self) -> bool {
        !self.skip_want_to_close
    }

    /// Gives up one open reference to the connection. The connection is only really closed
    ///  when no open references and no active protocols remain.
    #[tracing::instrument(skip(self), fields(connection=self.connection_number))]
    pub async fn close(&mut self) -> CloseStatus {
        if self.freed {
            return CloseStatus::ClosedNow;
        }

        if self.from_listener && self.status != ConnectionStatus::Accepted {
            // setup never completed, there is nothing to negotiate
            debug!("closing connection that was never accepted");
            self.notify_closed().await;
            self.free_connection().await;
            return CloseStatus::ClosedNow;
        }

        if self.open_ref_count > 0 {
            self.open_ref_count -= 1;
        }
        let no_references = self.no_references();
        let level = self.dispatch_level();

        if !self.free_asap && (!self.io_ok || (no_references && self.skip_want_to_close)) {
            self.notify_closed().await;
            if level > 0 {
                self.free_asap = true;
            }
        }

        if self.io_ok && level == 0 && !self.skip_want_to_close && no_references && self.protosetup_to_you.is_none() {
            info!("starting shutdown negotiation with {}", self.connection_string);
            self.send_core(CoreMessage::WantToClose).await;
            self.flush_output().await;
            self.want_to_close = true;
            CloseStatus::StartedShutdownNegotiation
        }
        else if level == 0 && (!self.io_ok || (self.skip_want_to_close && (self.free_asap || no_references))) {
            self.free_connection().await;
            CloseStatus::ClosedNow
        }
        else if self.free_asap {
            CloseStatus::ClosedAsap
        }
        else {
            CloseStatus::ConnectionInUse
        }
    }

    /// Deactivates the protocol this side knows as `my_opcode`. If that was the last thing
    ///  keeping the connection open, shutdown negotiation starts. Returns false if the
    ///  protocol was not active.
    #[tracing::instrument(skip(self), fields(connection=self.connection_number))]
    pub async fn protocol_shutdown(&mut self, my_opcode: u8) -> bool {
        let Some(binding) = self.opcodes.remove_mine(my_opcode) else {
            debug!("protocol {} is not active", my_opcode);
            return false;
        };
        self.proto_ref_count = self.proto_ref_count.saturating_sub(1);
        info!("protocol {} with opcode {} was shut down", binding.protocol_name, my_opcode);

        if self.io_ok && self.no_references() && !self.skip_want_to_close && !self.want_to_close && self.protosetup_to_you.is_none() {
            debug!("last protocol is gone, starting shutdown negotiation");
            self.send_core(CoreMessage::WantToClose).await;
            self.flush_output().await;
            self.want_to_close = true;
        }
        true
    }

    pub(crate) async fn process_want_to_close(&mut self) {
        if self.want_to_close || self.open_ref_count == 0 {
            // both sides want to close, or nobody on this side holds the connection
            info!(connection=self.connection_number, "peer wants to close, closing connection to {}", self.connection_string);
            self.notify_closed().await;
            self.free_connection().await;
        }
        else {
            debug!(connection=self.connection_number, "peer wants to close, but the connection is in use");
            self.send_core(CoreMessage::NoClose).await;
        }
    }

    pub(crate) async fn process_no_close(&mut self) {
        if self.want_to_close {
            debug!(connection=self.connection_number, "peer declined closing the connection");
            self.want_to_close = false;
        }
        else {
            self.send_error(MinorOpcode::NoClose.into(), ErrorClass::BadState, Severity::CanContinue, Bytes::new()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceConfig;
    use crate::connection::ProcessMessagesStatus;
    use crate::context::{IceContext, MockConnectionWatch};
    use crate::protocol::{ByteOrder, Version};
    use crate::test_util::protocol::{active_protocol_pair, originator_registration};
    use crate::test_util::{accept_with, accepted_pair, pump, RawPeer};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_close_negotiates_with_idle_peer() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();

        let mut watch = MockConnectionWatch::new();
        watch.expect_connection_opened().return_const(());
        watch.expect_connection_closed().times(1).return_const(());
        acceptor_ctx.add_connection_watch(Arc::new(watch)).await;

        let (mut originator, mut acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;
        // nobody on the acceptor's side holds the connection
        acceptor.open_ref_count = 0;

        assert_eq!(originator.close().await, CloseStatus::StartedShutdownNegotiation);
        assert!(originator.want_to_close());

        // the acceptor has no open references left and agrees by closing
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::ConnectionClosed);
        assert!(acceptor.is_closed());
        assert_eq!(pump(&mut originator).await, ProcessMessagesStatus::ConnectionClosed);
        assert!(originator.is_closed());
    }

    #[tokio::test]
    async fn test_no_close_while_in_use() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let (mut originator, mut acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;

        assert_eq!(originator.close().await, CloseStatus::StartedShutdownNegotiation);

        // the acceptor still holds its reference and declines
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        assert!(!acceptor.is_closed());
        assert_eq!(pump(&mut originator).await, ProcessMessagesStatus::Success);
        assert!(!originator.want_to_close());
        assert!(originator.is_io_ok());
    }

    #[tokio::test]
    async fn test_competing_want_to_close() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let (mut originator, mut acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;

        assert_eq!(originator.close().await, CloseStatus::StartedShutdownNegotiation);
        assert_eq!(acceptor.close().await, CloseStatus::StartedShutdownNegotiation);

        // each side sees the other's WantToClose while wanting to close itself
        assert_eq!(pump(&mut originator).await, ProcessMessagesStatus::ConnectionClosed);
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_active_protocol_blocks_want_to_close() {
        let (mut originator, mut acceptor, opcode) = active_protocol_pair().await;
        assert_eq!(originator.proto_ref_count(), 1);

        assert_eq!(originator.close().await, CloseStatus::ConnectionInUse);
        assert!(!originator.want_to_close());

        assert!(originator.protocol_shutdown(opcode).await);
        assert!(originator.want_to_close());
        assert!(!originator.protocol_shutdown(opcode).await);

        // the acceptor's protocol is still active, its open reference is what counts
        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::Success);
        assert_eq!(pump(&mut originator).await, ProcessMessagesStatus::Success);
        assert!(!originator.want_to_close());
    }

    #[tokio::test]
    async fn test_second_protocol_keeps_connection() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let a = originator_ctx.register_for_protocol_setup(originator_registration("A", &[Version::new(1, 0)])).await.unwrap();
        let b = originator_ctx.register_for_protocol_setup(originator_registration("B", &[Version::new(1, 0)])).await.unwrap();
        let (mut originator, _acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;

        // fake two active protocols without negotiating them
        for opcode in [a, b] {
            originator.opcodes.add(opcode + 10, crate::connection::ProtocolBinding {
                my_opcode: opcode,
                protocol_name: format!("P{}", opcode),
                role: crate::auth::Role::Originator,
                handler: Arc::new(crate::test_util::protocol::RecordingHandler::default()),
                client_data: None,
            });
            originator.proto_ref_count += 1;
        }
        assert_eq!(originator.close().await, CloseStatus::ConnectionInUse);

        assert!(originator.protocol_shutdown(a).await);
        assert!(!originator.want_to_close());
        assert!(originator.protocol_shutdown(b).await);
        assert!(originator.want_to_close());
    }

    #[tokio::test]
    async fn test_close_without_negotiation() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let (mut originator, mut acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;

        originator.set_shutdown_negotiation(false);
        assert!(!originator.shutdown_negotiation());
        originator.add_open_reference();
        assert_eq!(originator.close().await, CloseStatus::ConnectionInUse);
        assert_eq!(originator.close().await, CloseStatus::ClosedNow);
        assert!(originator.is_closed());

        assert_eq!(pump(&mut acceptor).await, ProcessMessagesStatus::IoError);
    }

    #[tokio::test]
    async fn test_close_pending_listener_connection() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let (_peer, transport) = RawPeer::new(ByteOrder::native());
        let mut connection = accept_with(&ctx, transport).await;

        assert_eq!(connection.close().await, CloseStatus::ClosedNow);
        assert!(connection.is_closed());
        assert_eq!(connection.close().await, CloseStatus::ClosedNow);
    }

    #[tokio::test]
    async fn test_close_after_io_error() {
        let originator_ctx = IceContext::new(IceConfig::default()).unwrap();
        let acceptor_ctx = IceContext::new(IceConfig::default()).unwrap();
        let (mut originator, acceptor) = accepted_pair(&originator_ctx, &acceptor_ctx).await;
        drop(acceptor);

        assert_eq!(pump(&mut originator).await, ProcessMessagesStatus::IoError);
        assert_eq!(originator.close().await, CloseStatus::ClosedNow);
    }

    #[tokio::test]
    async fn test_unsolicited_no_close() {
        let ctx = IceContext::new(IceConfig::default()).unwrap();
        let order = ByteOrder::native();
        let (mut peer, transport) = RawPeer::new(order);
        let mut connection = accept_with(&ctx, transport).await;
        let _ = peer.read_message(order).await;
        peer.send(&CoreMessage::ByteOrder(order).encode(order)).await;
        pump(&mut connection).await;

        peer.send(&CoreMessage::NoClose.encode(order)).await;
        assert_eq!(pump(&mut connection).await, ProcessMessagesStatus::Success);
        let (header, _) = peer.read_message(order).await;
        assert_eq!(header.data_u16(order), u16::from(ErrorClass::BadState));
    }
}
