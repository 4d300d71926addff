//! Dual-side file index: snapshot store, scanner, and diff engine.

mod differ;
mod scanner;
mod store;

pub use differ::{DiffEntry, DiffStatus, classify_pair, compute_diff};
pub use scanner::{ScanOutcome, mtime_ms, scan_side};
pub use store::{IndexEntry, IndexSnapshot, IndexStore, SideStats};
