//! Market module for short-window binary markets.
//!
//! This module handles:
//! - Market types and data structures
//! - The catalog adapter that validates listing and resolution payloads

pub mod catalog;
pub mod types;

pub use catalog::{normalize_resolution, CandidateFilter, CatalogAdapter};
pub use types::{MarketDescriptor, MarketId, ResolutionStatus, Side, TopOfBook};
