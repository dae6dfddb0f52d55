//! Testing utilities for the coordination layer.
//!
//! Enabled with the `testing` feature.
//!
//! - [`generators`]: `proptest` strategies for identifiers and payloads
//! - [`builders`]: fluent builders for events and commands
//! - [`fixtures`]: a counter aggregate with its command, query and
//!   projection handlers
//!
//! ```rust,ignore
//! use keystone::testing::prelude::*;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn ids_are_trimmed(id in arb_aggregate_id()) {
//!         prop_assert_eq!(id.as_ref().trim(), id.as_ref());
//!     }
//! }
//!
//! let event = EventBuilder::new()
//!     .aggregate_id("counter-1")
//!     .event_type("Incremented")
//!     .payload(serde_json::json!({"amount": 2}))
//!     .build();
//! ```

pub mod builders;
pub mod fixtures;
pub mod generators;

/// Everything in one import:
/// ```rust,ignore
/// use keystone::testing::prelude::*;
/// ```
pub mod prelude {
    pub use super::builders::*;
    pub use super::fixtures::*;
    pub use super::generators::*;
}
