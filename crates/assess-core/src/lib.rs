pub mod config;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod sqlite;
