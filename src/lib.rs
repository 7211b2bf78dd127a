//! Incremental scope filter for file indexing
//!
//! Tracks which file ids belong to the project-and-libraries scope while an
//! indexing pass runs, and classifies each admitted file as new or already
//! known to the previous pass.
//!
//! # Example
//!
//! ```
//! use scopefilter::{FileAddStatus, IdFilter, IncrementalFilesFilter};
//!
//! let filter = IncrementalFilesFilter::new();
//! assert_eq!(filter.ensure_file_id_present(5, || true), FileAddStatus::Added);
//! assert!(filter.contains_file_id(5));
//!
//! // Next pass
//! filter.memoize_and_reset_file_ids();
//! assert!(!filter.contains_file_id(5));
//! assert_eq!(filter.ensure_file_id_present(5, || true), FileAddStatus::Present);
//! assert_eq!(filter.ensure_file_id_present(7, || true), FileAddStatus::Added);
//! filter.reset_previous_file_ids();
//! ```

mod bitset;
mod error;
mod filter;
mod persistence;
mod registry;
mod scanner;

// Re-export public API
pub use bitset::ConcurrentBitSet;
pub use error::{FilterError, Result};
pub use filter::{FileAddStatus, FileId, FilterScopeType, IdFilter, IncrementalFilesFilter};
pub use persistence::{load_state, load_state_mmap, save_state, state_exists, FilterState};
pub use registry::FileIdRegistry;
pub use scanner::{
    admits, build_exclude_set, discover_files, IncrementalIndexer, PassReport, ScanConfig,
};
