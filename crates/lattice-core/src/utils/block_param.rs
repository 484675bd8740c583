//! Block references accepted by the read methods that take a block argument.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use super::quantity::format_quantity;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

/// A specific block number or one of the standard tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockRef {
    Number(u64),
    Tag(BlockTag),
    #[default]
    Latest,
}

/// Standard Ethereum block tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Earliest,
    Pending,
    Safe,
    Finalized,
}

impl BlockTag {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Pending => "pending",
            Self::Safe => "safe",
            Self::Finalized => "finalized",
        }
    }
}

impl BlockRef {
    /// Parses `"latest"`, a tag, a `0x` hex number or a decimal number.
    ///
    /// # Errors
    /// Returns `ParseError` if the input is none of those.
    pub fn parse(param: &str) -> Result<Self, ParseError> {
        match param {
            "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Tag(BlockTag::Earliest)),
            "pending" => Ok(Self::Tag(BlockTag::Pending)),
            "safe" => Ok(Self::Tag(BlockTag::Safe)),
            "finalized" => Ok(Self::Tag(BlockTag::Finalized)),
            s => {
                if let Some(hex) = s.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                        .map(Self::Number)
                        .map_err(|_| ParseError::InvalidHex(s.to_string()))
                } else {
                    s.parse::<u64>()
                        .map(Self::Number)
                        .map_err(|_| ParseError::InvalidNumber(s.to_string()))
                }
            }
        }
    }

    /// JSON-RPC parameter form of this reference.
    #[must_use]
    pub fn to_param(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.write_str(&format_quantity(*n)),
            Self::Tag(tag) => f.write_str(tag.as_str()),
            Self::Latest => f.write_str("latest"),
        }
    }
}

impl TryFrom<&str> for BlockRef {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<u64> for BlockRef {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}
