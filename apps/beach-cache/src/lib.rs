pub mod client;
pub mod config;
pub mod coordination_redis;
pub mod discovery;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod routes;
pub mod source;
pub mod state;
pub mod telemetry;
