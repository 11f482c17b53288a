//! step-ca Trust Engine Library
//!
//! Propagates trust in a private step-ca certificate authority across a
//! Docker fleet and the operator's host.

pub mod agents;

pub use agents::trust;
