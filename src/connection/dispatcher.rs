use std::future::Future;
use std::pin::Pin;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionStatus, DispatchScope};
use crate::error::{ErrorClass, Severity};
use crate::protocol::header::Header;
use crate::protocol::{ByteOrder, MinorOpcode, CORE_MAJOR_OPCODE};
use crate::registry::IncomingMessage;
use crate::reply_wait::ReplyWait;


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessMessagesStatus {
    Success,
    /// The connection is unusable. All that is left to do is closing it.
    IoError,
    /// The connection was closed by shutdown negotiation, and its resources are released.
    ConnectionClosed,
}

impl Connection {
    /// Reads and dispatches a single message.
    ///
    /// A caller waiting for a reply passes its [ReplyWait]; when this returns, the wait is
    ///  ready if the reply (or an error answering the request) has arrived. Sub-protocol
    ///  handlers may call this recursively to pump messages while they wait for a reply of
    ///  their own.
    pub fn process_messages<'a>(&'a mut self, reply_wait: Option<&'a mut ReplyWait>) -> Pin<Box<dyn Future<Output = ProcessMessagesStatus> + Send + 'a>> {
        Box::pin(self.do_process_messages(reply_wait))
    }

    async fn do_process_messages(&mut self, mut reply_wait: Option<&mut ReplyWait>) -> ProcessMessagesStatus {
        if self.freed {
            return ProcessMessagesStatus::ConnectionClosed;
        }
        if !self.io_ok {
            return ProcessMessagesStatus::IoError;
        }

        if let Some(wait) = reply_wait.as_deref_mut() {
            // the reply may have arrived during a nested dispatch on behalf of someone else
            if self.reply_waits.claim(wait) {
                return ProcessMessagesStatus::Success;
            }
            self.reply_waits.add(wait);
        }

        let scope = DispatchScope::enter(&self.dispatch_level);
        let status = self.dispatch_one().await;
        drop(scope);

        if let Some(wait) = reply_wait {
            self.reply_waits.claim(wait);
        }

        if let Some(status) = status {
            return status;
        }
        if self.freed {
            return ProcessMessagesStatus::ConnectionClosed;
        }
        if self.dispatch_level() == 0 && self.free_asap {
            debug!(connection=self.connection_number, "outermost dispatch returned, freeing connection");
            self.free_connection().await;
            return ProcessMessagesStatus::ConnectionClosed;
        }
        if !self.io_ok {
            if self.status != ConnectionStatus::Rejected {
                self.status = ConnectionStatus::IoError;
            }
            return ProcessMessagesStatus::IoError;
        }
        ProcessMessagesStatus::Success
    }

    /// returns a status to return right away, or `None` to continue with the regular checks
    async fn dispatch_one(&mut self) -> Option<ProcessMessagesStatus> {
        self.flush_output().await;
        if !self.io_ok {
            return None;
        }

        let mut raw = [0u8; Header::SIZE];
        if let Err(e) = self.transport.read_exact(&mut raw).await {
            if self.want_to_close {
                // the peer agreed to close by closing the transport
                debug!(connection=self.connection_number, "peer closed connection after WantToClose");
                self.notify_closed().await;
                self.free_connection().await;
                return Some(ProcessMessagesStatus::ConnectionClosed);
            }
            self.io_failure(e).await;
            return None;
        }
        self.receive_sequence = self.receive_sequence.wrapping_add(1);

        if self.waiting_for_byte_order {
            return self.process_byte_order(&raw).await;
        }

        let header = Header::deser(&raw, self.peer_byte_order);
        trace!(connection=self.connection_number, seq=self.receive_sequence, ?header, "received header");

        if header.body_len() > self.context.config().max_message_size {
            warn!(connection=self.connection_number, "message of {} bytes exceeds the maximum message size", header.body_len());
            self.send_error(header.minor_opcode, ErrorClass::BadLength, Severity::FatalToConnection, Bytes::new()).await;
            self.mark_fatal();
            return None;
        }

        // the whole message is read before it is validated, so a bad message never leaves
        //  the stream out of sync
        let mut body = std::mem::take(&mut self.in_buf);
        body.clear();
        if body.try_reserve(header.body_len()).is_err() {
            self.send_error(header.minor_opcode, ErrorClass::BadLength, Severity::FatalToConnection, Bytes::new()).await;
            self.mark_fatal();
            return None;
        }
        body.resize(header.body_len(), 0);
        if let Err(e) = self.transport.read_exact(&mut body).await {
            self.in_buf = body;
            self.io_failure(e).await;
            return None;
        }

        if header.major_opcode == CORE_MAJOR_OPCODE {
            self.dispatch_core(&header, &body).await;
        }
        else {
            self.dispatch_protocol(&header, &body).await;
        }

        self.in_buf = body;
        self.flush_output().await;
        None
    }

    async fn process_byte_order(&mut self, raw: &[u8; Header::SIZE]) -> Option<ProcessMessagesStatus> {
        let header = Header::deser(raw, self.peer_byte_order);

        let announced = if header.major_opcode != CORE_MAJOR_OPCODE {
            self.send_bad_major(header.major_opcode, header.minor_opcode, Severity::FatalToConnection).await;
            None
        }
        else if header.minor_opcode != u8::from(MinorOpcode::ByteOrder) {
            self.send_error(header.minor_opcode, ErrorClass::BadState, Severity::FatalToConnection, Bytes::new()).await;
            None
        }
        else if header.length != 0 {
            self.send_error(header.minor_opcode, ErrorClass::BadLength, Severity::FatalToConnection, Bytes::new()).await;
            None
        }
        else {
            match ByteOrder::try_from(header.data[0]) {
                Ok(order) => Some(order),
                Err(_) => {
                    self.send_bad_value(header.minor_opcode, 2, &header.data[..1]).await;
                    None
                }
            }
        };

        match announced {
            Some(order) => {
                debug!(connection=self.connection_number, "peer byte order is {:?}", order);
                self.peer_byte_order = order;
                self.waiting_for_byte_order = false;
                None
            }
            None => {
                warn!(connection=self.connection_number, "peer did not start with a valid byte order message: {:?}", header);
                self.flush_output().await;
                self.status = ConnectionStatus::Rejected;
                self.io_ok = false;
                Some(ProcessMessagesStatus::IoError)
            }
        }
    }

    async fn dispatch_core(&mut self, header: &Header, body: &[u8]) {
        let mut matched = self.reply_waits.take_first_for(CORE_MAJOR_OPCODE);
        self.process_core_message(header, body, matched.as_mut().map(|(_, w)| w)).await;
        self.return_wait(matched);
    }

    async fn dispatch_protocol(&mut self, header: &Header, body: &[u8]) {
        let Some(binding) = self.opcodes.get(header.major_opcode).cloned() else {
            debug!(connection=self.connection_number, "message for unknown major opcode {} - skipping", header.major_opcode);
            self.send_bad_major(header.major_opcode, header.minor_opcode, Severity::CanContinue).await;
            return;
        };

        let message = IncomingMessage {
            major_opcode: binding.my_opcode,
            minor_opcode: header.minor_opcode,
            data: header.data,
            body: Bytes::copy_from_slice(body),
            byte_order: self.peer_byte_order,
        };
        trace!(connection=self.connection_number, protocol=?binding, ?message, "dispatching to sub-protocol");

        let mut matched = self.reply_waits.take_first_for(binding.my_opcode);
        binding.handler
            .process_message(self, message, &binding.client_data, matched.as_mut().map(|(_, w)| w))
            .await;
        self.return_wait(matched);
    }

    fn return_wait(&mut self, matched: Option<(usize, ReplyWait)>) {
        if let Some((idx, wait)) = matched {
            if wait.is_ready() {
                self.reply_waits.complete(wait);
            }
            else {
                self.reply_waits.restore(idx, wait);
            }
        }
    }
}
