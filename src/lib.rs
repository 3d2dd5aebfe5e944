//! Server side of a browser-driven HTTP speed test.
//!
//! The endpoints serve synthetic payloads for timed downloads, swallow
//! uploads, answer latency probes, and offer an unauthenticated calibration
//! probe the client uses to pick its chunk sizes. They are meant to sit in
//! front of a larger file-serving host: the [`dispatch::Dispatcher`] claims
//! the handful of paths it recognises and passes every other request back.
//!
//! All throughput and latency math happens in the client; the server only
//! produces and consumes bytes. Nothing is persisted.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::Router;
//! use speedtest_server::access::StandaloneHost;
//! use speedtest_server::buffer::BufferManager;
//! use speedtest_server::config::SharedConfig;
//! use speedtest_server::dispatch::{self, Dispatcher};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(
//!     BufferManager::new(),
//!     Arc::new(SharedConfig::default()),
//!     Arc::new(StandaloneHost),
//! );
//! dispatcher.start();
//!
//! let app = Router::new().layer(axum::middleware::from_fn_with_state(
//!     dispatcher.clone(),
//!     dispatch::middleware,
//! ));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//!
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod access;
pub mod buffer;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod page;
pub mod params;
pub mod protocol;
