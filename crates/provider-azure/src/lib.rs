//! Gardener extension for Azure.
//!
//! Provides the values of the Azure control plane charts, the admission time
//! mutations of control plane components and kubelets, and the machine
//! classes of worker pools.

#![warn(missing_docs)]

pub mod apis;
pub mod controlplane;
pub mod webhook;
pub mod worker;

/// Provider type served by this extension.
pub const PROVIDER_NAME: &str = "azure";
/// Kind of the machine classes generated for Azure.
pub const MACHINE_CLASS_KIND: &str = "AzureMachineClass";
