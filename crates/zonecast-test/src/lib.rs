//! Zonecast Test - Shared test utilities for the Zonecast event layer.
//!
//! This crate provides mock transports, fixtures, and a pre-wired gateway
//! harness for use across the Zonecast crates as a dev-dependency.
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! zonecast-test.workspace = true
//! ```
//!
//! Then use in your tests:
//!
//! ```rust,ignore
//! use zonecast_test::{GatewayHarness, MockSink};
//!
//! #[tokio::test]
//! async fn delivery_reaches_the_client() {
//!     let harness = GatewayHarness::new().await;
//!     let (client, sink) = harness.connect_operator("alice").await;
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
