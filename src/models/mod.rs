//! Core data models for the bucket provisioner.
//!
//! These types describe what flows through one lifecycle call: the incoming
//! bucket request, the binding record handed back to the claim owner, the
//! admin-plane views of users and buckets, and the access-policy / quota
//! documents held by the object store. All of them serialize via `serde`.

pub mod binding;
pub mod bucket;
pub mod policy;
pub mod quota;
pub mod user;
