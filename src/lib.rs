// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod folders;
pub mod history;
pub mod metrics;
pub mod storage;
pub mod sync;

// ---- Re-exports for stable public API ----
pub use analyze::ai_adapter;
pub use crate::analyze::{CategoryResult, ClassificationSource};
pub use crate::api::{router, AppState};
pub use crate::config::SorterConfig;
pub use crate::content::{ContentItem, Fingerprint};
pub use crate::engine::{Degradation, SortOptions, SortOutcome, SortingEngine};
pub use crate::error::SortError;
