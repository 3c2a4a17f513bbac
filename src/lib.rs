//! Craftgate - runs Minecraft servers as containers behind a subdomain router
//!
//! This library provides the orchestration layer of a game-server manager:
//! - Persists server descriptors in a single JSON document
//! - Generates a container definition per server and drives its lifecycle
//!   through the container engine
//! - Publishes `{subdomain}.{mc domain}` routes to a shared TCP router
//! - Streams status, log and job events to the management UI

pub mod api;
pub mod archive;
pub mod config;
pub mod controller;
pub mod definition;
pub mod docker;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod routes;
pub mod runtime;
pub mod store;
pub mod subdomain;
pub mod workload;
