//! Rewriting a file's archive layout.
//!
//! A resize never mutates the original file in place. The new layout is
//! built at a temporary path, populated, flushed, and then renamed over the
//! target; the rename is the commit point, so a failure at any earlier step
//! leaves the original byte-identical. The displaced original is kept as a
//! `.bak` sibling unless the caller suppresses it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{unix_now, CreateOptions, OpenOptions, WhisperFile};
use crate::error::WhisperError;
use crate::io;
use crate::retention::validate_archive_list;
use crate::telemetry::StoreEvent;
use crate::types::{AggregationMethod, Point, Timestamp, Value};

#[derive(Debug, Clone, Default)]
pub struct ResizeOptions {
    /// New xFilesFactor; keeps the file's current one when absent.
    pub x_files_factor: Option<f32>,
    /// New aggregation method; keeps the file's current one when absent.
    pub aggregation_method: Option<AggregationMethod>,
    /// Allow a resize that shrinks the maximum retention.
    pub force: bool,
    /// Re-aggregate old data into the new slot grid instead of copying
    /// archives point for point.
    pub aggregate: bool,
    /// Write the new database here and leave the original untouched.
    pub newfile: Option<PathBuf>,
    /// Delete the `.bak` file after a successful rename.
    pub nobackup: bool,
}

/// Rebuilds `path` with a new archive layout.
pub fn resize(
    path: &Path,
    archives: &[(u32, u32)],
    resize_options: &ResizeOptions,
    options: &OpenOptions,
) -> Result<(), WhisperError> {
    resize_at(path, archives, resize_options, options, unix_now())
}

/// [`resize`] relative to an explicit `now`.
pub fn resize_at(
    path: &Path,
    archives: &[(u32, u32)],
    resize_options: &ResizeOptions,
    options: &OpenOptions,
    now: Timestamp,
) -> Result<(), WhisperError> {
    let new_archives = validate_archive_list(archives)?;

    let source = WhisperFile::open_readonly(path, options.clone())?;
    let old_info = source.info();

    let new_max_retention = new_archives
        .iter()
        .map(|&(step, points)| step * points)
        .max()
        .unwrap_or(0);
    if new_max_retention < old_info.max_retention && !resize_options.force {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Resizing {:?} from {} to {} seconds of retention is destructive; \
             pass force to proceed",
            path, old_info.max_retention, new_max_retention
        )));
    }

    let x_files_factor = resize_options
        .x_files_factor
        .unwrap_or(old_info.x_files_factor);
    let aggregation_method = resize_options
        .aggregation_method
        .unwrap_or(old_info.aggregation_method);

    // Pull everything out of the old archives, coarsest first so finer data
    // lands last and wins where windows overlap.
    let mut old_data = Vec::with_capacity(old_info.archives.len());
    for summary in old_info.archives.iter().rev() {
        let from = now.saturating_sub(summary.retention) + summary.seconds_per_point;
        if let Some(result) = source.fetch_at(from, Some(now), now)? {
            old_data.push(result);
        }
    }

    let new_path = match &resize_options.newfile {
        Some(p) => p.clone(),
        None => {
            let mut tmp = path.as_os_str().to_owned();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            // A leftover temp file from an interrupted resize is stale.
            if tmp.exists() {
                fs::remove_file(&tmp)?;
            }
            tmp
        }
    };

    WhisperFile::create(
        &new_path,
        &new_archives,
        &CreateOptions {
            x_files_factor,
            aggregation_method,
            sparse: false,
            lock: options.lock,
            flush: false,
            event_listener: options.event_listener.clone(),
        },
    )?;

    let mut target = WhisperFile::open_with(&new_path, options.clone())?;
    if resize_options.aggregate {
        migrate_aggregated(&mut target, &old_data, x_files_factor, aggregation_method, now)?;
    } else {
        for result in &old_data {
            let points: Vec<Point> = (result.time_info.from..result.time_info.until)
                .step_by(result.time_info.step as usize)
                .zip(result.values.iter())
                .filter_map(|(ts, v)| v.map(|value| Point::new(ts, value)))
                .collect();
            if !points.is_empty() {
                target.update_many_at(&points, now)?;
            }
        }
    }
    target.sync()?;
    drop(target);
    drop(source);

    // Writing to an explicit new file never touches the original.
    if resize_options.newfile.is_some() {
        return Ok(());
    }

    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    let backup = PathBuf::from(backup);

    fs::rename(path, &backup)?;
    if let Err(e) = fs::rename(&new_path, path) {
        // Commit failed: put the original back before surfacing the error.
        let _ = fs::rename(&backup, path);
        return Err(WhisperError::Io(e));
    }
    if let Some(parent) = path.parent() {
        io::sync_dir(parent)?;
    }

    let bytes = fs::metadata(path)?.len();
    options.event_listener.on_event(StoreEvent::ResizeCommitted {
        path: path.to_path_buf(),
        bytes,
    });

    if resize_options.nobackup {
        fs::remove_file(&backup)?;
        options.event_listener.on_event(StoreEvent::BackupRemoved { path: backup });
    }
    Ok(())
}

/// Re-aggregates the merged old timeline into each new archive's slot grid,
/// honoring the xFilesFactor per slot.
fn migrate_aggregated(
    target: &mut WhisperFile,
    old_data: &[crate::core::FetchResult],
    x_files_factor: f32,
    aggregation_method: AggregationMethod,
    now: Timestamp,
) -> Result<(), WhisperError> {
    // Coarsest data was fetched first, so finer entries overwrite coarser
    // ones wherever both cover a timestamp.
    let mut timeline: BTreeMap<Timestamp, Option<Value>> = BTreeMap::new();
    for result in old_data {
        for (slot, value) in result.values.iter().enumerate() {
            let ts = result.time_info.from + slot as u32 * result.time_info.step;
            timeline.insert(ts, *value);
        }
    }

    let summaries: Vec<(u32, u32)> = target
        .info()
        .archives
        .iter()
        .map(|a| (a.seconds_per_point, a.retention))
        .collect();
    for (step, retention) in summaries {
        let start = now.saturating_sub(retention) - now.saturating_sub(retention) % step;
        let end = now - now % step + step;

        let mut points = Vec::new();
        let mut slot_start = start;
        while slot_start < end {
            let slot_end = slot_start + step;
            let window: Vec<Option<Value>> = timeline
                .range(slot_start..slot_end)
                .map(|(_, v)| *v)
                .collect();
            if !window.is_empty() {
                let known: Vec<Value> = window.iter().copied().flatten().collect();
                let coverage = known.len() as f64 / window.len() as f64;
                if coverage >= x_files_factor as f64 {
                    if let Some(value) = aggregation_method.apply(&known, window.len()) {
                        points.push(Point::new(slot_start, value));
                    }
                }
            }
            slot_start = slot_end;
        }
        if !points.is_empty() {
            target.update_many_at(&points, now)?;
        }
    }
    Ok(())
}
