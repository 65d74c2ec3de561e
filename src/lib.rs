pub mod catalog;
pub mod config;
pub mod coverage;
pub mod hook;
pub mod index;
pub mod query;
pub mod session;
pub mod store;
