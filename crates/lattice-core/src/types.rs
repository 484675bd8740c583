//! Core data types shared by transports, nodes and the pool.
//!
//! Blocks, receipts and logs stay opaque `serde_json::Value` payloads; only heads are
//! decoded, because the lifecycle needs their number and total difficulty.

use std::{borrow::Cow, cmp::Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    upstream::errors::NodeError,
    utils::quantity::{parse_quantity_i64, parse_quantity_u128},
};

/// EVM chain identifier (EIP-155).
pub type ChainId = u64;

pub const JSONRPC_VERSION: &str = "2.0";

/// Best-known position of a node, or of the pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    /// `-1` until the first head arrives.
    pub block_number: i64,
    pub total_difficulty: Option<u128>,
}

impl Default for ChainInfo {
    fn default() -> Self {
        Self { block_number: -1, total_difficulty: None }
    }
}

impl ChainInfo {
    /// Field-wise maximum of two positions.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            block_number: self.block_number.max(other.block_number),
            total_difficulty: self.total_difficulty.max(other.total_difficulty),
        }
    }
}

/// Decoded `newHeads` payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Head {
    pub number: i64,
    pub hash: Option<String>,
    pub parent_hash: Option<String>,
    pub total_difficulty: Option<u128>,
    /// Stamped by the node that received the head; `0` until then.
    pub chain_id: ChainId,
}

impl Head {
    /// Decodes a head from its JSON representation.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidResponse` if `number` is missing or malformed.
    pub fn from_json(value: &Value) -> Result<Self, NodeError> {
        let number = value
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::InvalidResponse("head without number".into()))
            .and_then(|s| {
                parse_quantity_i64(s).map_err(|e| NodeError::InvalidResponse(e.to_string()))
            })?;
        let total_difficulty = value
            .get("totalDifficulty")
            .and_then(Value::as_str)
            .and_then(|s| parse_quantity_u128(s).ok());
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);

        Ok(Self {
            number,
            hash: text("hash"),
            parent_hash: text("parentHash"),
            total_difficulty,
            chain_id: 0,
        })
    }

    #[must_use]
    pub fn with_chain_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Compares two heads by total difficulty; a missing value sorts below any value.
    #[must_use]
    pub fn cmp_difficulty(&self, other: &Self) -> Ordering {
        self.total_difficulty.cmp(&other.total_difficulty)
    }
}

/// One element of a batched call. Results and errors are filled in place.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchElem {
    pub method: String,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<NodeError>,
}

impl BatchElem {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params, result: None, error: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self { jsonrpc: Cow::Borrowed(JSONRPC_VERSION), method: method.into(), params, id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Converts the envelope into the call result.
    ///
    /// # Errors
    /// Returns `NodeError::Rpc` when the envelope carries an error object.
    pub fn into_result(self) -> Result<Value, NodeError> {
        match self.error {
            Some(err) => Err(NodeError::Rpc { code: err.code, message: err.message }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
