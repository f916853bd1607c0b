#![doc = r#"
whisper: Fixed-Size Round-Robin Time-Series File Store in Rust

This crate implements the whisper database format: a single file holds a
metric as a sequence of round-robin archives at progressively coarser
resolutions, with high-resolution points automatically downsampled into the
coarser archives for long-term retention. The file's total byte size is fixed
at creation and never grows. It provides:

- A self-describing big-endian binary format with strict layout invariants
- Create/update/fetch primitives with per-archive ring addressing
- Cross-archive propagation with a configurable coverage threshold
- Bulk operations: merge, fill, diff, and crash-consistent resize
- Optional advisory file locking, durability flushes, and mmap-served reads

See the README for usage examples and more details.
"#]

// Declare modules
pub mod archive;
pub mod bulk;
pub mod codec;
pub mod core;
pub mod error;
pub mod io;
pub mod propagation;
pub mod resize;
pub mod retention;
pub mod telemetry;
pub mod types;

/// Main handle for a single whisper file.
pub use crate::core::WhisperFile;
/// Options applied when opening an existing file.
pub use crate::core::OpenOptions;
/// Options applied when creating a new file.
pub use crate::core::CreateOptions;
/// Parsed header plus archive table, as reported by `info`.
pub use crate::core::{ArchiveSummary, FetchResult, Info, TimeInfo};
/// Default propagation coverage threshold.
pub use crate::core::DEFAULT_X_FILES_FACTOR;
/// Error type for whisper operations.
pub use crate::error::WhisperError;
/// Two-file operations.
pub use crate::bulk::{diff, fill, merge, ArchiveDiff, DiffPoint};
/// Layout rewrite.
pub use crate::resize::{resize, ResizeOptions};
/// Retention definition parsing (`60:1440`, `1h:7d`, ...).
pub use crate::retention::{parse_retention_def, validate_archive_list};
/// Structured event hook for observability.
pub use crate::telemetry::{StoreEvent, StoreEventListener};
/// The downsampling reductions and their header codes.
pub use crate::types::{AggregationMethod, AGGREGATION_METHODS};
/// A single `(timestamp, value)` slot.
pub use crate::types::{Point, Timestamp, Value};
