//! Blob migration worker: mapping store, transfer engine, sharded drivers
//! and the store adapters behind them.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod jobs;
pub mod mapping;
pub mod migrator;
pub mod reader;
pub mod scrubber;
pub mod source;

#[cfg(test)]
mod testing;
