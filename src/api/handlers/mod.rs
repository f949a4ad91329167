//! HTTP request handlers, one module per resource family (§6).

pub mod admin;
pub mod batches;
pub mod suppliers;
pub mod upload;
pub mod webhooks;
