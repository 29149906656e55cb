//! Services used by request handlers.

pub mod auth;
pub mod gateway;
