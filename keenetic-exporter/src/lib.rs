//! Prometheus exporter for Keenetic routers.
//!
//! The exporter logs into the router's RCI admin API, polls the configured
//! `show` commands and exposes selected values on an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Keenetic RCI   │────>│     Poller      │────>│   HTTP Server   │
//! │  (/rci/show/*)  │     │ (extract/store) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! KEENETIC_HOST=http://192.168.1.1 KEENETIC_USERNAME=admin KEENETIC_PASSWORD=secret \
//!     keenetic-exporter --config config/metrics.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod mapping;
pub mod poller;
pub mod selector;
pub mod session;
pub mod store;

pub use auth::{Credentials, encrypt_password};
pub use client::KeeneticClient;
pub use config::ExporterConfig;
pub use error::{AuthError, ClientError};
pub use extract::{CollectedMetric, TransformRegistry};
pub use http::HttpServer;
pub use poller::{CollectionReport, MetricSource, Poller, collect_metrics};
pub use store::{MetricStore, SharedStore};
