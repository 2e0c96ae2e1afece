//! Core domain types and logic.

pub mod bar;
pub mod calendar;
pub mod aggregator;
pub mod order;
pub mod position;
pub mod sizing;
pub mod lifecycle;
pub mod controller;
pub mod session;
pub mod metrics;
pub mod config_validation;
pub mod error;
