//! Platform integrations.
//!
//! One implementation of the review state store exists today: Azure
//! DevOps, speaking its Git REST API with PAT authentication.

pub mod azure;

#[allow(unused_imports)]
pub use azure::AzureDevOpsStore;
