//! Master server for peer-hosted game servers: registration, liveness
//! tracking, discovery, and short-lived player auth tokens.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod realip;
pub mod registry;
pub mod storage;
pub mod upstream;
pub mod utils;
