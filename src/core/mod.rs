pub mod cache;
pub mod dedup;
pub mod error;
pub mod models;
pub mod store;
