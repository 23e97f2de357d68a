// Library for the binaries and tests

pub mod aggregation;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod ingest;
pub mod models;
pub mod query;
pub mod receiver;
pub mod retention;
pub mod routes;
pub mod sampler;
pub mod sender;
pub mod store;
pub mod version;
