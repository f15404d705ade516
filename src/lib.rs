//! Dockvision - on-demand tenant containers behind subdomain routing
//!
//! This library provides a small control plane that:
//! - Launches tagged containers per tenant and hands back a short routing key
//! - Resolves `<id>.<domain>` to a backend address, with a bounded-staleness cache
//! - Tracks when each instance last saw traffic
//! - Periodically reclaims idle and untracked instances
//! - Answers tenant traffic with an internal redirect for the proxy fabric

pub mod activity;
pub mod config;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod plane;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod runtime;
