//! Walker engine
//!
//! Thread pools for the three operations, all built from the same parts:
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!                 │  Coordinator (dump/import/    │
//!                 │  purge), owns shutdown flag   │
//!                 └───────────────┬───────────────┘
//!                                 │
//!       ┌─────────────────────────┼──────────────────────────┐
//!       │                         │                          │
//! ┌─────▼──────┐          ┌───────▼───────┐          ┌───────▼──────┐
//! │ Discoverer │ ───────▶ │ Leaf workers  │ ───────▶ │  Aggregator  │
//! │ (injector) │ bounded  │ (retry loop)  │ bounded  │ (map/tally)  │
//! └────────────┘  queue   └───────────────┘  queue   └──────────────┘
//! ```
//!
//! Purge folds discovery and deletion into one injector-fed pool.

pub mod discover;
pub mod export;
pub mod import;
pub mod purge;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod tally;

pub use export::{DumpCoordinator, DumpOptions, DumpResult};
pub use import::{load_bundle, ImportOptions, ImportResult, LoadCoordinator};
pub use purge::{PurgeCoordinator, PurgeOptions, PurgeResult};
pub use retry::RetryPolicy;
pub use stats::{RunProgress, RunStats};
pub use tally::ErrorTally;
