//! # RelayBus Runtime
//!
//! Shared, broker-agnostic building blocks every transport crate in this
//! workspace composes: retry with exponential backoff, a circuit breaker,
//! and a single-flight client cache.
//!
//! None of these types know what a transport is — they are plain
//! concurrency and resilience primitives that [`relaybus_core::transport`]
//! and the broker-specific crates wire together around a
//! [`relaybus_core::transport::BrokerOps`] implementation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Single-flight, lazily-built client cache.
pub mod cache;
/// Circuit breaker for broker calls that are failing repeatedly.
pub mod circuit_breaker;
/// Prometheus metrics shared across transport crates.
pub mod metrics;
/// Retry with exponential backoff for transient broker failures.
pub mod retry;
