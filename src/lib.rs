//! # comfylite
//!
//! A thin control-plane gateway in front of an external image-generation
//! engine. Clients submit generation requests over HTTP; the gateway
//! templates them into an engine workflow graph, submits it, correlates the
//! engine's interleaved event/image stream back to the originating request,
//! and reports completion both synchronously and via a per-request webhook.
//!
//! ## Core modules
//!
//! - [`workflow`] — merges user parameters into an engine workflow template.
//! - [`tracker`] — the event correlator; the hardest component.
//! - [`engine_client`] — the persistent connection to the engine.
//! - [`service`] — orchestrates one request end-to-end.
//! - [`notifier`] — fire-and-forget webhook delivery.
//! - [`http`] — the HTTP facade.
//! - [`config`] — layered configuration and CLI overrides.

pub mod config;
pub mod engine_client;
pub mod http;
pub mod notifier;
pub mod service;
pub mod tracker;
pub mod workflow;
