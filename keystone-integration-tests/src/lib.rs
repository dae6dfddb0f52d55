//! Integration tests for Keystone
//!
//! The tests in this crate drive the coordination layer end to end through
//! the in-memory adapters of `keystone-memory`.

// This is a test-only crate
#![cfg(test)]
