//! Readiness tokens.
//!
//! Every handle registered with a readiness backend carries a token that
//! comes back with its events. Connection tokens are slab keys of the
//! connection table; the top of the range is reserved for the listener and
//! the wake handle so the two can never collide with a connection.

use std::fmt;

/// Opaque handle identifying a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token reported when the reactor is woken up for shutdown.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

impl Token {
    /// Check if this token belongs to a connection rather than to the
    /// listener or the wake handle.
    pub fn is_connection(self) -> bool {
        self != LISTENER_TOKEN && self != WAKE_TOKEN
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Token> for mio::Token {
    fn from(token: Token) -> Self {
        mio::Token(token.0)
    }
}

impl From<mio::Token> for Token {
    fn from(token: mio::Token) -> Self {
        Token(token.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_tokens() {
        assert!(!LISTENER_TOKEN.is_connection());
        assert!(!WAKE_TOKEN.is_connection());
        assert!(Token(0).is_connection());
        assert_ne!(LISTENER_TOKEN, WAKE_TOKEN);
    }

    #[test]
    fn test_mio_round_trip() {
        let token = Token(42);
        let mio_token: mio::Token = token.into();
        assert_eq!(mio_token, mio::Token(42));
        assert_eq!(Token::from(mio_token), token);
    }
}
