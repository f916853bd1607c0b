//! Two-file operations: merge, fill, and diff.
//!
//! All three require the two files to share an identical archive
//! configuration; resize the input first otherwise. Each operation opens one
//! handle per file for its whole duration (source read-only, destination
//! read-write where it mutates).

use std::path::Path;

use serde::Serialize;

use crate::core::{unix_now, OpenOptions, WhisperFile};
use crate::error::WhisperError;
use crate::types::{Point, Timestamp, Value};

/// One differing slot reported by [`diff`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiffPoint {
    pub timestamp: Timestamp,
    pub a: Option<Value>,
    pub b: Option<Value>,
}

/// Differences found within one archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveDiff {
    pub archive_index: usize,
    pub diffs: Vec<DiffPoint>,
    /// Number of slot pairs examined in this archive.
    pub points: usize,
}

fn check_same_configuration(a: &WhisperFile, b: &WhisperFile) -> Result<(), WhisperError> {
    if a.archives() != b.archives() {
        return Err(WhisperError::InvalidConfiguration(format!(
            "{:?} and {:?} archive configurations are unalike; resize the input first",
            a.path(),
            b.path()
        )));
    }
    Ok(())
}

/// Copies the data of `src` into `dst` over an optional interval,
/// overwriting colliding destination points.
pub fn merge(
    src: &Path,
    dst: &Path,
    from: Option<Timestamp>,
    until: Option<Timestamp>,
    options: &OpenOptions,
) -> Result<(), WhisperError> {
    merge_at(src, dst, from, until, unix_now(), options)
}

/// [`merge`] relative to an explicit `now`.
///
/// Applied points flow through the destination's archive-level batch write,
/// so they also propagate into the destination's coarser archives.
pub fn merge_at(
    src: &Path,
    dst: &Path,
    from: Option<Timestamp>,
    until: Option<Timestamp>,
    now: Timestamp,
    options: &OpenOptions,
) -> Result<(), WhisperError> {
    let src_file = WhisperFile::open_readonly(src, options.clone())?;
    let dst_file = WhisperFile::open_with(dst, options.clone())?;
    check_same_configuration(&src_file, &dst_file)?;

    let until = until.unwrap_or(now);
    let from = from.unwrap_or(0);
    if until < from {
        return Err(WhisperError::InvalidTimeInterval { from, until });
    }

    // Archives are stored finest first; retention grows with the index.
    for index in 0..src_file.archives().len() {
        let archive = src_file.archives()[index];
        let horizon = now.saturating_sub(archive.retention());
        if until < horizon {
            // The requested window predates this archive entirely.
            continue;
        }
        let archive_from = from.max(horizon);

        let (time_info, values) = src_file.archive_fetch(&archive, archive_from, until)?;
        let points: Vec<Point> = (time_info.from..time_info.until)
            .step_by(time_info.step as usize)
            .zip(values)
            .filter_map(|(ts, v)| v.map(|value| Point::new(ts, value)))
            .collect();
        if points.is_empty() {
            continue;
        }
        dst_file.archive_update_many(index, &points)?;
    }

    if options.flush {
        dst_file.sync()?;
    }
    Ok(())
}

/// Compares two whisper databases archive by archive.
pub fn diff(
    a: &Path,
    b: &Path,
    ignore_empty: bool,
    until: Option<Timestamp>,
    options: &OpenOptions,
) -> Result<Vec<ArchiveDiff>, WhisperError> {
    diff_at(a, b, ignore_empty, until, unix_now(), options)
}

/// [`diff`] relative to an explicit `now`. Each coarser archive examines
/// only the window older than the one already covered by finer archives.
pub fn diff_at(
    a: &Path,
    b: &Path,
    ignore_empty: bool,
    until: Option<Timestamp>,
    now: Timestamp,
    options: &OpenOptions,
) -> Result<Vec<ArchiveDiff>, WhisperError> {
    let a_file = WhisperFile::open_readonly(a, options.clone())?;
    let b_file = WhisperFile::open_readonly(b, options.clone())?;
    check_same_configuration(&a_file, &b_file)?;

    let mut until = until.unwrap_or(now);
    let mut results = Vec::with_capacity(a_file.archives().len());

    for index in 0..a_file.archives().len() {
        let archive = a_file.archives()[index];
        let start_time = now.saturating_sub(archive.retention());

        let (a_info, a_values) = a_file.archive_fetch(&archive, start_time, until)?;
        let (b_info, b_values) = b_file.archive_fetch(&archive, start_time, until)?;

        let start = a_info.from.min(b_info.from);
        let end = a_info.until.max(b_info.until);
        let step = a_info.step.min(b_info.step);

        let mut diffs = Vec::new();
        let mut points = 0usize;
        for (slot, ts) in (start..end).step_by(step as usize).enumerate() {
            let va = a_values.get(slot).copied().flatten();
            let vb = b_values.get(slot).copied().flatten();
            let present = if ignore_empty {
                va.is_some() && vb.is_some()
            } else {
                va.is_some() || vb.is_some()
            };
            if !present {
                continue;
            }
            points += 1;
            if va != vb {
                diffs.push(DiffPoint {
                    timestamp: ts,
                    a: va,
                    b: vb,
                });
            }
        }

        results.push(ArchiveDiff {
            archive_index: index,
            diffs,
            points,
        });
        until = until.min(start_time);
    }

    Ok(results)
}

/// Copies from `src` only into the gaps of `dst`: no non-empty destination
/// slot is ever overwritten, and the finest source archive with data wins.
pub fn fill(src: &Path, dst: &Path, options: &OpenOptions) -> Result<(), WhisperError> {
    fill_at(src, dst, unix_now(), options)
}

/// [`fill`] relative to an explicit `now`.
pub fn fill_at(
    src: &Path,
    dst: &Path,
    now: Timestamp,
    options: &OpenOptions,
) -> Result<(), WhisperError> {
    let src_file = WhisperFile::open_readonly(src, options.clone())?;
    let mut dst_file = WhisperFile::open_with(dst, options.clone())?;

    // Walk destination archives finest first, scanning each one's window for
    // gaps; finer archives shrink the window left to coarser ones.
    let mut start_from = now;
    for index in 0..dst_file.archives().len() {
        let archive = dst_file.archives()[index];
        let from_time = now.saturating_sub(archive.retention());
        if from_time >= start_from {
            continue;
        }

        let Some(result) = dst_file.fetch_at(from_time, Some(start_from), now)? else {
            start_from = from_time;
            continue;
        };
        let (start, end, step) = (
            result.time_info.from,
            result.time_info.until,
            result.time_info.step,
        );

        let mut gap_start: Option<Timestamp> = None;
        let mut cursor = start;
        for value in &result.values {
            if value.is_none() && gap_start.is_none() {
                gap_start = Some(cursor);
            } else if let (Some(gap), true) = (gap_start, value.is_some()) {
                // Gaps of a single slot are left alone.
                if cursor - gap > step {
                    fill_window(&src_file, &mut dst_file, gap, cursor, now)?;
                }
                gap_start = None;
            } else if let (Some(gap), true) = (gap_start, cursor == end - step) {
                fill_window(&src_file, &mut dst_file, gap, end, now)?;
            }
            cursor += step;
        }

        start_from = from_time;
    }

    if options.flush {
        dst_file.sync()?;
    }
    Ok(())
}

/// Fills `[window_start, window_end)` of `dst` from `src`, walking source
/// archives finest first and backwards in time so higher-precision data is
/// preferred wherever the source has it.
fn fill_window(
    src: &WhisperFile,
    dst: &mut WhisperFile,
    window_start: Timestamp,
    mut window_end: Timestamp,
    now: Timestamp,
) -> Result<(), WhisperError> {
    let src_oldest = now.saturating_sub(src.max_retention());
    if window_start < src_oldest && window_end < src_oldest {
        return Ok(());
    }

    for archive in src.archives() {
        let horizon = now.saturating_sub(archive.retention());
        if window_end <= horizon {
            continue;
        }
        let from_time = horizon.max(window_start);

        if let Some(result) = src.fetch_at(from_time, Some(window_end), now)? {
            let points: Vec<Point> = (result.time_info.from..result.time_info.until)
                .step_by(result.time_info.step as usize)
                .zip(result.values)
                .filter_map(|(ts, v)| v.map(|value| Point::new(ts, value)))
                .collect();
            if !points.is_empty() {
                dst.update_many_at(&points, now)?;
            }
        }

        window_end = from_time;
        if window_start == window_end {
            return Ok(());
        }
    }
    Ok(())
}
