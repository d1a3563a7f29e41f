//! Turnstile - sliding-window request throttling for HTTP services
//!
//! A chain of rules counts recent events per key in a pluggable event store
//! and rejects requests once a rule's threshold is exceeded within its
//! trailing window. The chain plugs into any `tower` stack as a layer.

pub mod config;
pub mod error;
pub mod throttle;
pub mod web;
