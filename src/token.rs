//! The 16-byte correlator tying a reply to a pending query.

use std::fmt;
use std::str::FromStr;

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// A message token.
///
/// A message carries at most one outstanding pending-query registration per
/// token; the queue fabric and the pending-query cache key on this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub [u8; 16]);

impl Token {
    /// The all-zero token, used by messages that do not expect a reply.
    pub const NIL: Token = Token([0; 16]);

    /// Draw a fresh, cryptographically random token.
    pub fn random() -> Self {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes)
            .expect("the platform RNG must be able to fill 16 bytes");
        Token(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An invalid textual token was supplied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseTokenError;

impl fmt::Display for ParseTokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a token must be exactly 32 hex characters")
    }
}

impl std::error::Error for ParseTokenError {}

impl FromStr for Token {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseTokenError);
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseTokenError)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseTokenError)?;
        }
        Ok(Token(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_differ() {
        assert_ne!(Token::random(), Token::random());
    }

    #[test]
    fn display_then_parse_round_trips() {
        let token = Token::random();
        let text = token.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(Token::from_str(&text).unwrap(), token);
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(Token::from_str("too-short").is_err());
        assert!(Token::from_str("z".repeat(32).as_str()).is_err());
    }
}
