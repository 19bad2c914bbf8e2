//! Pluggable authentication for connection setup and protocol setup.
//!
//! An [AuthMethod] is a small state machine that is driven by the core protocol handler, one
//!  instance of per-negotiation state living in an [AuthSession] for the duration of a single
//!  setup. Which of the registered methods may be used for a given peer is decided by an
//!  [AuthPolicy], and a [HostBasedAuth] predicate can accept peers that have no auth method in
//!  common with this side.

pub mod magic_cookie;

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::{trace, warn};

use crate::protocol::{Version, MAX_AUTH_DATA_LEN};


/// Method-specific state of a single negotiation. It starts out as `None` for every new
///  negotiation.
pub type AuthState = Option<Box<dyn Any + Send + Sync>>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OriginatorAuthStatus {
    HaveReply(Vec<u8>),
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AcceptorAuthStatus {
    /// send the data to the originator as a challenge, and wait for its reply
    Continue(Vec<u8>),
    Accepted,
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// the side that sends `ConnectionSetup` or `ProtocolSetup`
    Originator,
    /// the side that answers it
    Acceptor,
}

pub trait AuthMethod: Send + Sync {
    /// The name on the wire, matched case-sensitively against the peer's offer
    fn name(&self) -> &str;

    /// Called with each challenge the acceptor sends (`AuthRequired`, then `AuthNextPhase`).
    fn originator_step(&self, state: &mut AuthState, network_id: &str, challenge: &[u8]) -> OriginatorAuthStatus;

    /// Called once with `None` when the negotiation starts, and then with each of the
    ///  originator's `AuthReply` messages.
    fn acceptor_step(&self, state: &mut AuthState, network_id: &str, reply: Option<&[u8]>) -> AcceptorAuthStatus;

    /// Releases whatever the method keeps in its state. This is called exactly once per
    ///  negotiation, regardless of how it ends.
    fn clean_up(&self, state: &mut AuthState) {
        *state = None;
    }
}

/// One side's part in a single authentication negotiation. Dropping the session cleans up the
///  method's state, so abandoning a negotiation for whatever reason is simply dropping it.
pub struct AuthSession {
    method: Arc<dyn AuthMethod>,
    state: AuthState,
}
impl Debug for AuthSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthSession{{{}}}", self.method.name())
    }
}

impl AuthSession {
    pub fn new(method: Arc<dyn AuthMethod>) -> AuthSession {
        AuthSession {
            method,
            state: None,
        }
    }

    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    /// Auth data that does not fit a message turns into a failure of the negotiation
    pub fn originator_step(&mut self, network_id: &str, challenge: &[u8]) -> OriginatorAuthStatus {
        let result = match self.method.originator_step(&mut self.state, network_id, challenge) {
            OriginatorAuthStatus::HaveReply(data) if data.len() > MAX_AUTH_DATA_LEN => {
                warn!(method=self.method.name(), "auth reply of {} bytes is too long", data.len());
                OriginatorAuthStatus::Failed(oversized_reason(data.len()))
            }
            other => other,
        };
        trace!(method=self.method.name(), ?result, "originator auth step");
        result
    }

    pub fn acceptor_step(&mut self, network_id: &str, reply: Option<&[u8]>) -> AcceptorAuthStatus {
        let result = match self.method.acceptor_step(&mut self.state, network_id, reply) {
            AcceptorAuthStatus::Continue(data) if data.len() > MAX_AUTH_DATA_LEN => {
                warn!(method=self.method.name(), "auth challenge of {} bytes is too long", data.len());
                AcceptorAuthStatus::Failed(oversized_reason(data.len()))
            }
            other => other,
        };
        trace!(method=self.method.name(), ?result, "acceptor auth step");
        result
    }
}

fn oversized_reason(len: usize) -> String {
    format!("authentication data of {} bytes exceeds the maximum of {}", len, MAX_AUTH_DATA_LEN)
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        trace!(method=self.method.name(), "cleaning up auth state");
        self.method.clean_up(&mut self.state);
    }
}

/// Decides which of the registered auth methods are usable with a given peer, e.g. because
///  credentials for that peer are available for some methods but not for others.
pub trait AuthPolicy: Send + Sync {
    fn is_usable(&self, role: Role, protocol_name: &str, network_id: &str, method_name: &str) -> bool;
}

/// The default policy: every registered method is usable with every peer
pub struct AllowAllAuthPolicy;
impl AuthPolicy for AllowAllAuthPolicy {
    fn is_usable(&self, _role: Role, _protocol_name: &str, _network_id: &str, _method_name: &str) -> bool {
        true
    }
}

/// Fallback for peers that offer no usable auth method and do not insist on authentication:
///  the predicate decides based on the peer's host name.
#[cfg_attr(test, automock)]
pub trait HostBasedAuth: Send + Sync {
    fn accept_host(&self, host_name: &str) -> bool;
}

/// Picks the first of the initiator's versions that the responder supports, scanning the
///  initiator's list as the outer loop. Returns the index into both lists.
pub fn select_version(offered: &[Version], supported: &[Version]) -> Option<(usize, usize)> {
    offered.iter()
        .enumerate()
        .find_map(|(his_idx, v)| {
            supported.iter()
                .position(|s| s == v)
                .map(|my_idx| (his_idx, my_idx))
        })
}

/// Picks the first of the responder's usable methods (in the responder's registration order)
///  that the initiator offered. Returns the index into both lists. If the initiator offers the
///  same name more than once, its first occurrence is used.
pub fn select_auth_method<S: AsRef<str>>(usable: &[Arc<dyn AuthMethod>], offered: &[S]) -> Option<(usize, usize)> {
    usable.iter()
        .enumerate()
        .find_map(|(my_idx, m)| {
            offered.iter()
                .position(|o| o.as_ref() == m.name())
                .map(|his_idx| (my_idx, his_idx))
        })
}

/// Filters `methods` down to those the policy permits, preserving their order
pub fn usable_methods(methods: &[Arc<dyn AuthMethod>], policy: &dyn AuthPolicy, role: Role, protocol_name: &str, network_id: &str) -> Vec<Arc<dyn AuthMethod>> {
    methods.iter()
        .filter(|m| policy.is_usable(role, protocol_name, network_id, m.name()))
        .cloned()
        .collect()
}
