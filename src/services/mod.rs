pub mod audit;
pub mod balancer;
pub mod classifier;
pub mod ingest;
pub mod m3u;
pub mod metrics;
pub mod reporter;
pub mod shard_store;
