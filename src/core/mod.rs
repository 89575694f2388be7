pub mod error;
pub mod ttl_cache;
pub mod types;
pub mod version;
