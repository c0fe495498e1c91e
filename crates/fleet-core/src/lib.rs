pub mod checklist;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod store;
pub mod types;
