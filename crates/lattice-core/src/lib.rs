//! # Lattice Core
//!
//! Resilient multi-endpoint JSON-RPC client for EVM chains.
//!
//! A [`Pool`](upstream::Pool) keeps a set of redundant endpoints for one chain,
//! health-checks each of them continuously, routes reads to a healthy node chosen by a
//! pluggable selection policy, and fans transactions out to every live endpoint.
//!
//! - **[`upstream`]**: transports, the node lifecycle state machine, selectors, the pool
//!   and the send-error classifier.
//! - **[`config`]**: layered configuration (defaults, TOML file, environment).
//! - **[`metrics`]**: the injectable metrics sink and its Prometheus implementation.
//! - **[`logging`]**: `tracing` subscriber setup.
//!
//! ## Example
//!
//! ```no_run
//! use lattice_core::{config::LatticeConfig, upstream::PoolBuilder};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LatticeConfig::load()?;
//! let pool = PoolBuilder::from_config(&config)?.build()?;
//! pool.dial().await?;
//!
//! let head = pool.block_number().await?;
//! println!("latest block: {head}");
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod types;
pub mod upstream;
pub mod utils;
