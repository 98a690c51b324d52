//! Proactive group-chat AI: a three-layer funnel (rule prefilter, judge,
//! tool-using agent) behind a small axum host server.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod database;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod persona;
pub mod pipeline;
pub mod proactive;
pub mod registry;
pub mod server;
pub mod tools;
pub mod trigger;

#[cfg(test)]
mod test_support;
