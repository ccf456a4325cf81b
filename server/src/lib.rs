//! Helpdesk Server
//!
//! Relay core for a unified helpdesk inbox: ingests signed webhook deliveries
//! from a social-messaging platform, stores page conversations, pushes new
//! messages to agents and relays agent replies back with retries.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod notify;
pub mod relay;
pub mod webhooks;
