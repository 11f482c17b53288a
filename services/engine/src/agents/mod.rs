//! Agent modules for the trust engine
//!
//! - `trust`: step-ca discovery and trust-store reconciliation

pub mod trust;
