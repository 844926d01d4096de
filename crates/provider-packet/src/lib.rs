//! Gardener extension for Packet.
//!
//! Packet runs an external cloud controller manager, so the extension only
//! mutates control plane components and kubelets at admission time.

#![warn(missing_docs)]

pub mod webhook;

/// Provider type served by this extension.
pub const PROVIDER_NAME: &str = "packet";
