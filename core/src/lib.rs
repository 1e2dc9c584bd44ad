//! # RelayBus Core
//!
//! A pluggable, transport-agnostic event bus: one publish/consume
//! abstraction backed by any of several broker transports (Azure Service
//! Bus, Azure Event Hubs, Azure Queue Storage, AWS SQS/SNS, AWS Kinesis,
//! RabbitMQ, or an in-memory harness for tests).
//!
//! ## Core concepts
//!
//! - [`context::EventContext`]: the envelope carrying a payload and its
//!   correlation metadata through publish and consume.
//! - [`naming`]: the pure pipeline deriving a stable wire name from a Rust
//!   type name.
//! - [`serializer`]: the dyn-compatible contract for encoding and decoding
//!   an [`context::EventContext`] to and from bytes.
//! - [`registry`]: where event and consumer bindings are configured, then
//!   frozen into their final derived names.
//! - [`transport`]: the trait every broker-specific crate implements, plus
//!   the shared retry/readiness pipeline built on top of it.
//! - [`bus::Bus`]: the façade tying a frozen registry to its wired
//!   transports — publish, cancel, start, stop, health check.
//! - [`publisher::Publisher`]: a narrower, publish-only view over a
//!   [`bus::Bus`] for application code that only emits events.
//!
//! ## Example
//!
//! ```ignore
//! use relaybus_core::bus::Bus;
//! use relaybus_core::context::EventContext;
//! use relaybus_core::naming::NamingOptions;
//! use relaybus_core::registry::{EntityKind, EventRegistrationStore};
//!
//! let mut registrations = EventRegistrationStore::new();
//! registrations.register::<OrderPlaced>("servicebus", EntityKind::Broadcast);
//! registrations.freeze(&NamingOptions::builder().build(), "order-service", &limits)?;
//!
//! let bus = Bus::new(registrations, transports, host_info)?;
//! bus.publish(EventContext::new(OrderPlaced { order_id: "o-1".into() }), None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The bus façade tying a frozen registry to its wired transports.
pub mod bus;
/// The envelope carrying a payload and its correlation metadata.
pub mod context;
/// Pure name-derivation pipeline for events and consumers.
pub mod naming;
/// A narrow publish-only facade over [`bus::Bus`].
pub mod publisher;
/// The registration store: events, consumers, and their derived names.
pub mod registry;
/// The serializer contract and its default JSON implementation.
pub mod serializer;
/// The broker-facing trait every transport crate implements.
pub mod transport;
