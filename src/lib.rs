//! # Torii
//!
//! A resilient session client for push-based gateway APIs: it keeps one
//! long-lived websocket per shard alive, performs the identify/resume
//! handshake, heartbeats on the server's schedule, reconnects with backoff
//! on transient failures, and hands decoded events to the consumer in a
//! well-defined order.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use torii::{Config, Connection};
//!
//! #[tokio::main]
//! async fn main() -> torii::Result<()> {
//!     let (connection, mut events) = Connection::single(Config::bot("token"))?;
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.next().await {
//!             log::info!("Received event: {:?}", event);
//!         }
//!     });
//!
//!     connection.run().await
//! }
//! ```

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod gateway;

mod cluster;
mod config;
mod error;

pub use cluster::{Cluster, ClusterEvent, ClusterStream};
pub use config::{AccountKind, Config, ConnectionProperties, Shard, Tuning};
pub use error::{Error, Result};
pub use gateway::{Connection, Dispatch, Event, EventStream, IdentifyLimiter};
