// ABOUTME: Library crate for standby-sync
// ABOUTME: Brings a standby PostgreSQL database in line with its main database

pub mod config;
pub mod postgres;
pub mod setup;
pub mod sync;
pub mod utils;
