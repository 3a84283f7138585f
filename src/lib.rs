//! Grove - tree-planting donation backend
//!
//! Payment webhook ingestion and settlement: signature verification,
//! delivery deduplication, event classification, donation settlement and
//! achievement grants.

pub mod achievements;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod id;
pub mod models;
pub mod payments;
pub mod settlement;
