//! Property tests for system-wide invariants.
//!
//! Each module drives one subsystem through generated inputs and checks an
//! invariant that must hold for every input.

mod breaker_transitions;
mod consistent_hash_churn;
mod projection_idempotence;
mod saga_compensation_order;
mod snapshot_replay;
mod version_monotonicity;

/// A single-threaded runtime for driving async code inside `proptest!`.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}
