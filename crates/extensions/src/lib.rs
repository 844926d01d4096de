//! A crate for building [Gardener](https://gardener.cloud) provider extensions.
//!
//! Extensions run in the seed cluster. They reconcile extension resources
//! (`ControlPlane`, `Worker`, ...) through provider specific collaborators and
//! mutate control plane objects at admission time.
//!
//! A provider supplies:
//!
//! - a [`controlplane::ValuesProvider`] computing chart values, driven by the
//!   [`controlplane::GenericActuator`],
//! - a [`webhook::Ensurer`] overriding the mutations it needs, served through
//!   the [`webhook::GenericMutator`],
//! - a [`worker::WorkerDelegate`] generating machine classes, driven by the
//!   [`worker::GenericActuator`].
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use extensions::webhook::{Ensurer, GenericMutator};
//! use extensions::client::ClusterReader;
//!
//! struct MyEnsurer;
//!
//! #[async_trait::async_trait]
//! impl Ensurer for MyEnsurer {}
//!
//! fn mutator(clusters: Arc<dyn ClusterReader>) -> GenericMutator {
//!     GenericMutator::new(Arc::new(MyEnsurer), clusters)
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod apis;
pub mod backoff;
pub mod chart;
pub mod checksum;
pub mod client;
pub mod config;
pub mod controller;
pub mod controlplane;
pub mod dns;
pub mod error;
pub mod imagevector;
pub mod managedresources;
pub mod merge;
pub mod quantity;
pub mod secrets;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod unit;
pub mod version;
pub mod webhook;
pub mod worker;

#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use error::Error;
