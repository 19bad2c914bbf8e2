use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::protocol::Version;


/// The result stored in a [ReplyWait] once the awaited reply (or an error answering the
///  request) has arrived
pub enum Reply {
    ConnectionReply { version_index: usize, vendor: String, release: String },
    ConnectionError(String),
    ProtocolReply { major_opcode: u8, version_index: usize, vendor: String, release: String },
    ProtocolError(String),
    /// a sub-protocol's own reply type
    Protocol(Box<dyn Any + Send + Sync>),
}
impl Debug for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::ConnectionReply { version_index, vendor, release } => write!(f, "ConnectionReply{{#{} {} {}}}", version_index, vendor, release),
            Reply::ConnectionError(msg) => write!(f, "ConnectionError{{{}}}", msg),
            Reply::ProtocolReply { major_opcode, version_index, vendor, release } => write!(f, "ProtocolReply{{{}:#{} {} {}}}", major_opcode, version_index, vendor, release),
            Reply::ProtocolError(msg) => write!(f, "ProtocolError{{{}}}", msg),
            Reply::Protocol(_) => write!(f, "Protocol{{..}}"),
        }
    }
}

/// The negotiated outcome of a successful protocol setup
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolSetupReply {
    pub version: Version,
    pub vendor: String,
    pub release: String,
}

static NEXT_REPLY_WAIT_ID: AtomicU64 = AtomicU64::new(1);

/// Correlates a request with its reply. A caller creates this after sending a request and
///  passes it to [crate::connection::Connection::process_messages] until it is ready.
///
/// Dropping the wait abandons it: the connection discards its queued copy and any reply that
///  arrives for it.
pub struct ReplyWait {
    id: u64,
    pub sequence_of_request: u32,
    pub major_opcode_of_request: u8,
    pub minor_opcode_of_request: u8,
    reply: Option<Reply>,
    /// held by the caller's wait only, queued copies just observe it
    _liveness: Option<Arc<()>>,
    owner: Weak<()>,
}
impl Debug for ReplyWait {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WAIT{{#{} {}:{}@{} {}}}", self.id, self.major_opcode_of_request, self.minor_opcode_of_request, self.sequence_of_request,
               if self.reply.is_some() { "ready" } else { "pending" })
    }
}

impl ReplyWait {
    pub fn new(sequence_of_request: u32, major_opcode_of_request: u8, minor_opcode_of_request: u8) -> ReplyWait {
        let liveness = Arc::new(());
        ReplyWait {
            id: NEXT_REPLY_WAIT_ID.fetch_add(1, Ordering::Relaxed),
            sequence_of_request,
            major_opcode_of_request,
            minor_opcode_of_request,
            reply: None,
            owner: Arc::downgrade(&liveness),
            _liveness: Some(liveness),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_reply(&mut self, reply: Reply) {
        trace!(id=self.id, ?reply, "reply is ready");
        self.reply = Some(reply);
    }

    pub fn is_ready(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    pub fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }

    /// the copy that is queued on the connection while the caller holds on to the original
    fn queued_copy(&self) -> ReplyWait {
        ReplyWait {
            id: self.id,
            sequence_of_request: self.sequence_of_request,
            major_opcode_of_request: self.major_opcode_of_request,
            minor_opcode_of_request: self.minor_opcode_of_request,
            reply: None,
            _liveness: None,
            owner: self.owner.clone(),
        }
    }

    fn is_abandoned(&self) -> bool {
        self.owner.strong_count() == 0
    }
}

/// A connection's outstanding reply waits in submission order, plus replies that arrived for
///  waits whose caller has not picked them up yet (e.g. because they arrived during a nested
///  dispatch on behalf of another caller).
#[derive(Default)]
pub struct ReplyWaitQueue {
    waits: Vec<ReplyWait>,
    ready: FxHashMap<u64, (Weak<()>, Reply)>,
}

impl ReplyWaitQueue {
    /// Adding the same wait a second time is a no-op.
    pub fn add(&mut self, wait: &ReplyWait) {
        self.prune_abandoned();
        if self.ready.contains_key(&wait.id) || self.waits.iter().any(|w| w.id == wait.id) {
            return;
        }
        self.waits.push(wait.queued_copy());
    }

    /// Takes the oldest wait for a major opcode out of the queue. It must be handed back with
    ///  either [ReplyWaitQueue::restore] or [ReplyWaitQueue::complete].
    pub fn take_first_for(&mut self, major_opcode: u8) -> Option<(usize, ReplyWait)> {
        self.prune_abandoned();
        let idx = self.waits.iter()
            .position(|w| w.major_opcode_of_request == major_opcode)?;
        Some((idx, self.waits.remove(idx)))
    }

    pub fn restore(&mut self, idx: usize, wait: ReplyWait) {
        let idx = idx.min(self.waits.len());
        self.waits.insert(idx, wait);
    }

    pub fn complete(&mut self, mut wait: ReplyWait) {
        if wait.is_abandoned() {
            trace!(id=wait.id, "discarding reply for abandoned wait");
            return;
        }
        if let Some(reply) = wait.reply.take() {
            self.ready.insert(wait.id, (wait.owner, reply));
        }
    }

    /// Moves a ready reply into the caller's wait, returning whether there was one
    pub fn claim(&mut self, wait: &mut ReplyWait) -> bool {
        match self.ready.remove(&wait.id) {
            Some((_, reply)) => {
                wait.reply = Some(reply);
                true
            }
            None => false,
        }
    }

    /// removes a wait regardless of its state
    pub fn remove(&mut self, id: u64) {
        self.waits.retain(|w| w.id != id);
        self.ready.remove(&id);
    }

    /// drops queued waits and ready replies whose caller has gone away
    fn prune_abandoned(&mut self) {
        self.waits.retain(|w| !w.is_abandoned());
        self.ready.retain(|_, (owner, _)| owner.strong_count() > 0);
    }

    pub fn clear(&mut self) {
        self.waits.clear();
        self.ready.clear();
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}
