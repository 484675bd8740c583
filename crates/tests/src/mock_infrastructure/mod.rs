//! Mock Infrastructure for Testing lattice
//!
//! This module provides reusable mock types for testing nodes and pools
//! without requiring real network connections.
//!
//! ## Components
//!
//! - `MockEndpoint`: In-process scripted node, dialed through `MockConnector`
//! - `RpcMockBuilder`: Wraps mockito to stand in for an HTTP endpoint
//! - `MockWebSocketServer`: Local WebSocket JSON-RPC server for subscription testing
//! - `LogCapture`: Captures `tracing` events for assertions
//! - Test helpers for common scenarios
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{MockEndpoint, TEST_CHAIN_ID};
//!
//! let endpoint = MockEndpoint::new("primary-a", TEST_CHAIN_ID);
//! let spec = NodeSpec::primary("primary-a", endpoint.connector());
//! endpoint.push_head(42);
//! ```

pub mod log_capture;
pub mod mock_transport;

pub use log_capture::{CapturedEvent, LogCapture};
pub use mock_transport::{head_json, MockConnector, MockEndpoint, MockTransport};
pub use rpc_mock::RpcMockBuilder;
pub use test_helpers::*;
pub use websocket_mock::MockWebSocketServer;
