//! Cross-archive downsampling.
//!
//! After a write to a fine archive, each coarser archive is offered a refresh
//! of the single coarse slot covering the written timestamp. Archives are
//! visited strictly in ascending step order and each level reads its *finer
//! neighbor*, not the finest archive, so intermediate aggregates feed the
//! next level.

use crate::archive::Archive;
use crate::codec::Header;
use crate::error::WhisperError;
use crate::io::StoreFile;
use crate::types::{Timestamp, Value};

/// Outcome of refreshing one coarse slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// The aggregate was computed and written.
    Written,
    /// Coverage fell below the xFilesFactor; nothing was written and
    /// propagation stops for this and all coarser archives.
    Skipped { known: usize, expected: usize },
}

/// Refreshes the slot of `lower` covering `timestamp` from the slots of
/// `higher`, the immediately finer archive.
pub fn propagate(
    store: &StoreFile,
    header: &Header,
    timestamp: Timestamp,
    higher: &Archive,
    lower: &Archive,
) -> Result<Propagation, WhisperError> {
    let lower_interval_start = lower.interval_start(timestamp);

    // The covered fine slots: exactly lower.step / higher.step of them.
    let neighbor_values = higher.read_interval(
        store,
        lower_interval_start,
        lower_interval_start + lower.seconds_per_point,
    )?;

    let expected = neighbor_values.len();
    let known: Vec<Value> = neighbor_values.into_iter().flatten().collect();
    if known.is_empty() {
        return Ok(Propagation::Skipped { known: 0, expected });
    }

    let known_fraction = known.len() as f64 / expected as f64;
    if known_fraction < header.metadata.x_files_factor as f64 {
        return Ok(Propagation::Skipped {
            known: known.len(),
            expected,
        });
    }

    let method = header.metadata.aggregation_method;
    match method.apply(&known, expected) {
        Some(aggregate) => {
            lower.write_point(store, lower_interval_start, aggregate)?;
            Ok(Propagation::Written)
        }
        None => Ok(Propagation::Skipped {
            known: known.len(),
            expected,
        }),
    }
}
