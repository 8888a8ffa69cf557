//! Payflow - payment and subscription lifecycle engine
//!
//! Orders with stock reservation, payments through pluggable provider
//! gateways, idempotent callback processing, subscription plan state and
//! quota metering, with an HTTP API on top.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod id;
pub mod locks;
pub mod models;
pub mod pagination;
pub mod payments;
