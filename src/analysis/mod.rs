//! Statistics: payload parsing, merging and finalization.
//!
//! Everything here is synchronous and free of I/O.

pub mod aggregator;
pub mod analyzer;
pub mod payload;
pub mod table;
pub mod tdigest;

pub use aggregator::ResultAggregator;
pub use analyzer::StatisticalAnalyzer;
pub use payload::parse_payload;
