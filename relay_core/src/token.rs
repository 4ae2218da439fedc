//! Transfer tokens.
//!
//! Holding a token is the only authorization check in the relay, so tokens
//! are drawn from a CSPRNG with 128 bits of entropy.

use anyhow::{Result, anyhow};
use rand::{RngCore, TryRngCore, rngs::OsRng};
use std::fmt;

/// Random bytes per token (128 bits)
pub const TOKEN_BYTES: usize = 16;

/// Opaque single-use credential identifying one transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix that is safe to put in logs
    pub fn short(&self) -> &str {
        let end = self.0.len().min(6);
        self.0.get(..end).unwrap_or("")
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of fresh tokens
pub trait TokenSource: Send + Sync {
    fn issue(&self) -> Token;
}

/// Default token source: 16 CSPRNG bytes as 32 upper-case hex characters
#[derive(Debug, Clone, Copy)]
pub struct RandomTokens {
    _private: (),
}

impl RandomTokens {
    /// Check the OS entropy source once. Failing here is a startup error.
    pub fn new() -> Result<Self> {
        let mut sample = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| anyhow!("OS entropy source unavailable: {}", e))?;
        Ok(Self { _private: () })
    }
}

impl TokenSource for RandomTokens {
    fn issue(&self) -> Token {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Token(hex::encode_upper(bytes))
    }
}
