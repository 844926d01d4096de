//! Gardener extension for Alibaba Cloud.
//!
//! Two admission ensurers: one for control planes exposed through the
//! seed's load balancers (API server advertise address, etcd backups) and
//! one for kubelets.

#![warn(missing_docs)]

pub mod exposure;
pub mod webhook;

/// Provider type served by this extension.
pub const PROVIDER_NAME: &str = "alicloud";
/// Storage provider of etcd backups in OSS buckets.
pub const STORAGE_PROVIDER: &str = "OSS";
/// Image of the etcd backup sidecar.
pub const ETCD_BACKUP_RESTORE_IMAGE_NAME: &str = "etcd-backup-restore";
