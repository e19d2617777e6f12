#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! # Sheath
//!
//! An HTTP server framework whose request and response bodies travel through a
//! negotiated transform chain: compression first, then an ordered list of
//! encryption steps, all described in request and response headers.
//!
//! ## Example
//! ```no_run
//! use sheath::{Exchange, Handler, HandlerResult, Routes, Server, ServerConfig};
//!
//! #[derive(Default)]
//! struct Index;
//!
//! impl Handler for Index {
//!     fn get(&mut self, exchange: &mut Exchange) -> HandlerResult {
//!         exchange.write_str("Hello World!");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let routes = Routes::new().route::<Index>("/index")?;
//!     Server::new(ServerConfig::new()?).serve_routes(routes).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//! - `Server`: accepts connections and reads requests with hyper
//! - `Executor`: blocking worker pool the requests are dispatched on
//! - `Dispatcher`: routes a request, runs its handler and applies the transforms
//! - `HandlerType`: a handler factory with its outbound policy and instance pool
//! - `TransformEngine`: the compression and encryption chain
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `SHEATH_`)
//! - Configuration file (`config.toml`)
//!
//! ## Features
//! - `http2`: Enables HTTP/2 support (enabled by default)

pub use crate::codec::{Compression, LZ4_DECOMPRESS_RATIO, MAX_DECOMPRESSED_LEN};
pub use crate::config::ServerConfig;
pub use crate::content::ContentKind;
pub use crate::crypto::{Aes, KeyRing, KeyRole, RsaKeys, LEGACY_AES_PASSPHRASE};
pub use crate::dispatch::Dispatcher;
pub use crate::error::{
    CodecError, ContentError, CryptoError, ExecutorError, PoolError, RouteError, ServerError,
    TransformError,
};
pub use crate::executor::{Executor, WorkerId};
pub use crate::handler::{
    Exchange, Handler, HandlerError, HandlerInstance, HandlerResult, HandlerType, NotFound,
    ServerInfo,
};
pub use crate::http::{names, Bytes, InboundRequest, OutboundResponse, Verb};
pub use crate::policy::TransformPolicy;
pub use crate::pool::{Pool, Poolable};
pub use crate::routes::{Resolved, Routes};
pub use crate::server::{ConnectionInfo, Server, Service};
pub use crate::stats::{CounterMap, RequestIds, RouteStats};
pub use crate::transform::{ContentEnvelope, Degraded, EncryptStep, TransformEngine, Transformed};

mod codec;
mod config;
mod content;
mod crypto;
mod dispatch;
mod error;
mod executor;
mod handler;
mod http;
mod policy;
mod pool;
mod routes;
mod server;
mod stats;
mod transform;

// Re-export common types
pub use hyper;
