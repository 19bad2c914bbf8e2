use rand::RngCore;

use crate::auth::{AcceptorAuthStatus, AuthMethod, AuthState, OriginatorAuthStatus};

pub const MAGIC_COOKIE_AUTH_NAME: &str = "MIT-MAGIC-COOKIE-1";

/// `MIT-MAGIC-COOKIE-1`: a shared secret the originator sends in the clear. The acceptor sends
///  an empty challenge, and compares the originator's reply to its own cookie.
pub struct MagicCookieAuth {
    cookie: Vec<u8>,
}

impl MagicCookieAuth {
    pub const COOKIE_LEN: usize = 16;

    pub fn new(cookie: Vec<u8>) -> MagicCookieAuth {
        MagicCookieAuth { cookie }
    }

    pub fn generate() -> MagicCookieAuth {
        let mut cookie = vec![0u8; Self::COOKIE_LEN];
        rand::thread_rng().fill_bytes(&mut cookie);
        MagicCookieAuth { cookie }
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }
}

impl AuthMethod for MagicCookieAuth {
    fn name(&self) -> &str {
        MAGIC_COOKIE_AUTH_NAME
    }

    fn originator_step(&self, _state: &mut AuthState, _network_id: &str, _challenge: &[u8]) -> OriginatorAuthStatus {
        if self.cookie.is_empty() {
            return OriginatorAuthStatus::Failed("no magic cookie available".to_string());
        }
        OriginatorAuthStatus::HaveReply(self.cookie.clone())
    }

    fn acceptor_step(&self, _state: &mut AuthState, _network_id: &str, reply: Option<&[u8]>) -> AcceptorAuthStatus {
        match reply {
            None => AcceptorAuthStatus::Continue(Vec::new()),
            Some(reply) if reply == self.cookie.as_slice() => AcceptorAuthStatus::Accepted,
            Some(_) => AcceptorAuthStatus::Rejected("Invalid Magic Cookie".to_string()),
        }
    }
}
