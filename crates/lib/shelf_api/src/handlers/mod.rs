//! Request handlers.

pub mod admin;
pub mod billing;
pub mod entitlements;
pub mod health;
pub mod webhooks;
