//! Integration tests for the context broker

pub mod test_utils;

mod config_integration;
mod determinism;
mod ledger;
mod policy;
