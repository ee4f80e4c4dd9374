//! prwarden: AI pull-request review service.
//!
//! Reviews Azure DevOps pull requests with one or more LLM providers
//! and reconciles their output onto the PR as inline comments, a
//! summary thread, a reviewer vote, durable metadata, and a
//! human-readable history table.

pub mod config;
pub mod gateway;
pub mod platform;
pub mod providers;
pub mod review;
