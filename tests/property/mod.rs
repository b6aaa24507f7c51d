//! Property-based tests for broker invariants

mod invariants;
