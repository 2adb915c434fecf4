pub mod cli;
pub mod config;
pub mod feed;
pub mod lease;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod store;
pub mod store_postgres;
pub mod store_redis;
pub mod telemetry;
pub mod writer;
