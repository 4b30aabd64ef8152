//! Services: the lifecycle coordinator and the collaborators it talks to.

pub mod admin_ops;
pub mod binding_store;
pub mod cluster;
pub mod provisioner;
pub mod reconciler;
pub mod s3_agent;
pub mod settings;
pub mod signer;
pub mod transport;
