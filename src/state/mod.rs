pub mod kv;
pub mod models;
pub mod queue;
pub mod store;
