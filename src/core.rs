//! Core database logic: the `WhisperFile` handle and the primitive
//! operations (create, update, update_many, fetch, info, header rewrites).
//!
//! Each handle owns one open file for the duration of its use. When locking
//! is requested, writable handles hold an exclusive advisory lock and
//! read-only handles a shared one, acquired at open and released on drop.

use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::archive::Archive;
use crate::codec::{self, Header, Metadata};
use crate::error::WhisperError;
use crate::io::{self, LockMode, StoreFile};
use crate::propagation::{propagate, Propagation};
use crate::retention::validate_archive_list;
use crate::telemetry::{noop_event_listener, store_metrics, StoreEvent, StoreEventListener};
use crate::types::{AggregationMethod, Point, Timestamp, Value};

/// Default fraction of known fine slots required before a coarse slot is
/// refreshed during propagation.
pub const DEFAULT_X_FILES_FACTOR: f32 = 0.5;

/// Per-operation options for opening an existing file.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Hold an advisory lock for the lifetime of the handle.
    pub lock: bool,
    /// Flush file data to stable storage after every mutation.
    pub flush: bool,
    /// Serve reads from a read-only memory map (read-only handles only).
    pub mmap: bool,
    /// Structured event hook (no-op by default).
    pub event_listener: Arc<dyn StoreEventListener>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            lock: false,
            flush: false,
            mmap: false,
            event_listener: noop_event_listener(),
        }
    }
}

/// Options for creating a new file.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub x_files_factor: f32,
    pub aggregation_method: AggregationMethod,
    /// Allocate the data region as a filesystem hole instead of writing
    /// zeroes. Semantically identical to dense creation.
    pub sparse: bool,
    pub lock: bool,
    pub flush: bool,
    pub event_listener: Arc<dyn StoreEventListener>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            x_files_factor: DEFAULT_X_FILES_FACTOR,
            aggregation_method: AggregationMethod::Average,
            sparse: false,
            lock: false,
            flush: false,
            event_listener: noop_event_listener(),
        }
    }
}

/// One archive's entry in [`Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub offset: u32,
    pub seconds_per_point: u32,
    pub points: u32,
    pub retention: u32,
    pub size_bytes: u32,
}

impl From<&Archive> for ArchiveSummary {
    fn from(archive: &Archive) -> Self {
        ArchiveSummary {
            offset: archive.offset,
            seconds_per_point: archive.seconds_per_point,
            points: archive.points,
            retention: archive.retention(),
            size_bytes: archive.size_bytes(),
        }
    }
}

/// Parsed header as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Info {
    pub aggregation_method: AggregationMethod,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub archives: Vec<ArchiveSummary>,
}

/// The time window a fetch actually covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeInfo {
    pub from: Timestamp,
    pub until: Timestamp,
    pub step: u32,
}

/// Result of a fetch: aligned window plus one value slot per step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub time_info: TimeInfo,
    pub values: Vec<Option<Value>>,
}

/// Current wall-clock time in whole epoch seconds.
pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as Timestamp
}

/// An open whisper file.
#[derive(Debug)]
pub struct WhisperFile {
    store: StoreFile,
    header: Header,
    options: OpenOptions,
}

impl WhisperFile {
    /// Creates a new whisper file at `path` from `(seconds_per_point, points)`
    /// pairs. The layout is fixed at creation; the file never grows.
    pub fn create(
        path: &Path,
        archives: &[(u32, u32)],
        options: &CreateOptions,
    ) -> Result<(), WhisperError> {
        let sorted = validate_archive_list(archives)?;
        if !(0.0..=1.0).contains(&options.x_files_factor) {
            return Err(WhisperError::InvalidXFilesFactor(options.x_files_factor));
        }

        let lock = if options.lock {
            LockMode::Exclusive
        } else {
            LockMode::None
        };
        let store = StoreFile::create_new(path, lock)?;
        // A failure past this point leaves a half-created file; unlink it
        // rather than leaving surprises for the next open.
        match Self::write_layout(&store, &sorted, options) {
            Ok(total_size) => {
                options.event_listener.on_event(StoreEvent::FileCreated {
                    path: path.to_path_buf(),
                    bytes: total_size,
                });
                Ok(())
            }
            Err(e) => {
                drop(store);
                io::remove_partial(path);
                Err(e)
            }
        }
    }

    fn write_layout(
        store: &StoreFile,
        sorted: &[(u32, u32)],
        options: &CreateOptions,
    ) -> Result<u64, WhisperError> {
        let max_retention = sorted
            .iter()
            .map(|&(step, points)| step * points)
            .max()
            .unwrap_or(0);

        codec::write_metadata(
            store,
            &Metadata {
                aggregation_method: options.aggregation_method,
                max_retention,
                x_files_factor: options.x_files_factor,
                archive_count: sorted.len() as u32,
            },
        )?;

        let header_size = codec::header_size(sorted.len());
        let mut data_offset = header_size;
        for (i, &(seconds_per_point, points)) in sorted.iter().enumerate() {
            let archive = Archive {
                offset: data_offset as u32,
                seconds_per_point,
                points,
            };
            store.write_at(
                (codec::METADATA_SIZE + i * codec::ARCHIVE_INFO_SIZE) as u64,
                &codec::pack_archive_info(&archive),
            )?;
            data_offset += archive.size_bytes() as u64;
        }

        store.allocate(header_size, data_offset, options.sparse)?;
        if options.flush {
            store.sync_data()?;
        }
        Ok(data_offset)
    }

    /// Opens `path` read-write with default options.
    pub fn open(path: &Path) -> Result<Self, WhisperError> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Opens `path` read-write. Takes an exclusive lock when requested.
    pub fn open_with(path: &Path, options: OpenOptions) -> Result<Self, WhisperError> {
        let lock = if options.lock {
            LockMode::Exclusive
        } else {
            LockMode::None
        };
        let store = StoreFile::open(path, true, lock)?;
        let header = codec::read_header(&store)?;
        Ok(WhisperFile {
            store,
            header,
            options,
        })
    }

    /// Opens `path` read-only. Takes a shared lock when requested, and maps
    /// the file when the options ask for mmap-served reads.
    pub fn open_readonly(path: &Path, options: OpenOptions) -> Result<Self, WhisperError> {
        let lock = if options.lock {
            LockMode::Shared
        } else {
            LockMode::None
        };
        let mut store = StoreFile::open(path, false, lock)?;
        if options.mmap {
            store.map_readonly()?;
        }
        let header = codec::read_header(&store)?;
        Ok(WhisperFile {
            store,
            header,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn aggregation_method(&self) -> AggregationMethod {
        self.header.metadata.aggregation_method
    }

    pub fn x_files_factor(&self) -> f32 {
        self.header.metadata.x_files_factor
    }

    pub fn max_retention(&self) -> u32 {
        self.header.metadata.max_retention
    }

    pub(crate) fn archives(&self) -> &[Archive] {
        &self.header.archives
    }

    /// Header plus archive table, as stored on disk.
    pub fn info(&self) -> Info {
        Info {
            aggregation_method: self.header.metadata.aggregation_method,
            max_retention: self.header.metadata.max_retention,
            x_files_factor: self.header.metadata.x_files_factor,
            archives: self.header.archives.iter().map(ArchiveSummary::from).collect(),
        }
    }

    /// Writes one value. `timestamp` defaults to the current time.
    pub fn update(&mut self, value: Value, timestamp: Option<Timestamp>) -> Result<(), WhisperError> {
        self.update_at(value, timestamp, unix_now())
    }

    /// Writes one value relative to an explicit `now`.
    ///
    /// The timestamp must lie in `(now - max_retention, now]`; anything else
    /// is `TimestampNotCovered` and the file is untouched.
    pub fn update_at(
        &mut self,
        value: Value,
        timestamp: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<(), WhisperError> {
        let started = Instant::now();
        let timestamp = timestamp.unwrap_or(now);

        let age = match now.checked_sub(timestamp) {
            Some(age) if age < self.header.metadata.max_retention => age,
            _ => return Err(WhisperError::TimestampNotCovered),
        };

        // The highest-precision archive that covers this timestamp's age.
        let index = self
            .header
            .archives
            .iter()
            .position(|a| a.retention() >= age)
            .ok_or(WhisperError::TimestampNotCovered)?;
        let archive = self.header.archives[index];

        let interval = archive.interval_start(timestamp);
        archive.write_point(&self.store, interval, value)?;
        self.options.event_listener.on_event(StoreEvent::PointsWritten {
            step: archive.seconds_per_point,
            count: 1,
        });

        self.propagate_chain(index, interval)?;

        if self.options.flush {
            self.store.sync_data()?;
        }
        store_metrics::record_update(started.elapsed(), 1);
        Ok(())
    }

    /// Writes a batch of points, each carrying its own timestamp. Points
    /// older than every archive are dropped.
    pub fn update_many(&mut self, points: &[Point]) -> Result<(), WhisperError> {
        self.update_many_at(points, unix_now())
    }

    /// Batch write relative to an explicit `now`.
    ///
    /// Points are grouped per finest covering archive and committed in
    /// ascending timestamp order; propagation runs once per affected coarse
    /// slot after all finest-archive writes of that group.
    pub fn update_many_at(&mut self, points: &[Point], now: Timestamp) -> Result<(), WhisperError> {
        if points.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        // Order points newest first, then peel off one archive's worth at a
        // time as ages grow past each retention boundary.
        let mut ordered = points.to_vec();
        ordered.sort_by_key(|p| std::cmp::Reverse(p.timestamp));

        let archive_count = self.header.archives.len();
        let mut archive_index = 0usize;
        let mut group: Vec<Point> = Vec::new();
        let mut written = 0u64;

        'points: for point in ordered {
            let age = now as i64 - point.timestamp as i64;

            while (self.header.archives[archive_index].retention() as i64) < age {
                if !group.is_empty() {
                    group.reverse();
                    written += group.len() as u64;
                    self.archive_update_many(archive_index, &group)?;
                    group.clear();
                }
                archive_index += 1;
                if archive_index == archive_count {
                    // Remaining points are older than every archive; drop them.
                    break 'points;
                }
            }
            group.push(point);
        }

        if archive_index < archive_count && !group.is_empty() {
            group.reverse();
            written += group.len() as u64;
            self.archive_update_many(archive_index, &group)?;
        }

        if self.options.flush {
            self.store.sync_data()?;
        }
        store_metrics::record_update(started.elapsed(), written);
        Ok(())
    }

    /// Commits a batch into one archive and propagates each affected coarse
    /// slot downwards. Points must be sorted ascending by timestamp.
    pub(crate) fn archive_update_many(
        &self,
        index: usize,
        points: &[Point],
    ) -> Result<(), WhisperError> {
        let archive = self.header.archives[index];
        archive.write_many(&self.store, points)?;
        self.options.event_listener.on_event(StoreEvent::PointsWritten {
            step: archive.seconds_per_point,
            count: points.len(),
        });

        let mut higher = archive;
        for &lower in &self.header.archives[index + 1..] {
            let mut intervals: Vec<Timestamp> = points
                .iter()
                .map(|p| lower.interval_start(p.timestamp))
                .collect();
            intervals.sort_unstable();
            intervals.dedup();

            let mut propagated_further = false;
            for interval in intervals {
                match propagate(&self.store, &self.header, interval, &higher, &lower)? {
                    Propagation::Written => propagated_further = true,
                    Propagation::Skipped { known, expected } => {
                        self.report_skip(lower.seconds_per_point, known, expected);
                    }
                }
            }
            if !propagated_further {
                break;
            }
            higher = lower;
        }
        Ok(())
    }

    fn propagate_chain(&self, start_index: usize, timestamp: Timestamp) -> Result<(), WhisperError> {
        let mut higher = self.header.archives[start_index];
        for &lower in &self.header.archives[start_index + 1..] {
            match propagate(&self.store, &self.header, timestamp, &higher, &lower)? {
                Propagation::Written => higher = lower,
                Propagation::Skipped { known, expected } => {
                    self.report_skip(lower.seconds_per_point, known, expected);
                    break;
                }
            }
        }
        Ok(())
    }

    fn report_skip(&self, step: u32, known: usize, expected: usize) {
        self.options.event_listener.on_event(StoreEvent::PropagationSkipped {
            step,
            known,
            expected,
        });
        store_metrics::record_propagation_skip();
    }

    /// Fetches `[from, until]`, `until` defaulting to the current time.
    pub fn fetch(
        &self,
        from: Timestamp,
        until: Option<Timestamp>,
    ) -> Result<Option<FetchResult>, WhisperError> {
        self.fetch_at(from, until, unix_now())
    }

    /// Fetch relative to an explicit `now`.
    pub fn fetch_at(
        &self,
        from: Timestamp,
        until: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<Option<FetchResult>, WhisperError> {
        self.fetch_selected(from, until, now, None)
    }

    /// Fetch forcing the archive with the given step instead of letting the
    /// planner choose.
    pub fn fetch_selected(
        &self,
        from: Timestamp,
        until: Option<Timestamp>,
        now: Timestamp,
        seconds_per_point: Option<u32>,
    ) -> Result<Option<FetchResult>, WhisperError> {
        let started = Instant::now();
        let until = until.unwrap_or(now);
        if from > until {
            return Err(WhisperError::InvalidTimeInterval { from, until });
        }

        let oldest = now.saturating_sub(self.header.metadata.max_retention);
        // Window entirely in the future, or entirely beyond retention:
        // nothing to return.
        if from > now {
            return Ok(None);
        }
        if until < oldest {
            return Ok(None);
        }
        let mut from = from.max(oldest);
        let until = until.min(now);

        let archive = match seconds_per_point {
            Some(step) => self
                .header
                .archives
                .iter()
                .find(|a| a.seconds_per_point == step)
                .ok_or_else(|| {
                    WhisperError::InvalidConfiguration(format!("Invalid granularity: {}", step))
                })?,
            None => {
                // Finest archive whose retention reaches back to `from`;
                // falls back to the coarsest.
                let distance = now - from;
                let index = self
                    .header
                    .archives
                    .iter()
                    .position(|a| a.retention() >= distance)
                    .unwrap_or(self.header.archives.len() - 1);
                &self.header.archives[index]
            }
        };

        // An explicitly selected archive can only serve its own retention;
        // without this clamp the interval read would outrun its ring.
        from = from.max(now.saturating_sub(archive.retention()));
        if until < from {
            return Ok(None);
        }

        let (time_info, values) = self.archive_fetch(archive, from, until)?;
        store_metrics::record_fetch(started.elapsed(), values.len() as u64);
        Ok(Some(FetchResult { time_info, values }))
    }

    /// Reads one archive over `[from, until]`, both bounds aligned down to
    /// the archive's step. A zero-length window widens to the enclosing slot.
    pub(crate) fn archive_fetch(
        &self,
        archive: &Archive,
        from: Timestamp,
        until: Timestamp,
    ) -> Result<(TimeInfo, Vec<Option<Value>>), WhisperError> {
        let step = archive.seconds_per_point;
        let from_interval = archive.interval_start(from);
        let mut until_interval = archive.interval_start(until);
        if from_interval == until_interval {
            until_interval += step;
        }
        let values = archive.read_interval(&self.store, from_interval, until_interval)?;
        Ok((
            TimeInfo {
                from: from_interval,
                until: until_interval,
                step,
            },
            values,
        ))
    }

    /// Rewrites the aggregation method (and optionally the xFilesFactor) in
    /// the header; data is left unchanged. Returns the previous method.
    pub fn set_aggregation_method(
        &mut self,
        method: AggregationMethod,
        x_files_factor: Option<f32>,
    ) -> Result<AggregationMethod, WhisperError> {
        let old = self.header.metadata.aggregation_method;
        let mut metadata = self.header.metadata;
        metadata.aggregation_method = method;
        if let Some(xff) = x_files_factor {
            metadata.x_files_factor = xff;
        }
        self.rewrite_header(metadata)?;
        Ok(old)
    }

    /// Rewrites the xFilesFactor only. Returns the previous value.
    pub fn set_x_files_factor(&mut self, x_files_factor: f32) -> Result<f32, WhisperError> {
        let old = self.header.metadata.x_files_factor;
        let mut metadata = self.header.metadata;
        metadata.x_files_factor = x_files_factor;
        self.rewrite_header(metadata)?;
        Ok(old)
    }

    fn rewrite_header(&mut self, metadata: Metadata) -> Result<(), WhisperError> {
        codec::write_metadata(&self.store, &metadata)?;
        if self.options.flush {
            self.store.sync_data()?;
        }
        self.header.metadata = metadata;
        self.options.event_listener.on_event(StoreEvent::HeaderRewritten {
            path: self.store.path().to_path_buf(),
        });
        Ok(())
    }

    /// Raw slots of one archive in file order, for full-file scans.
    pub fn dump_archive(&self, index: usize) -> Result<Vec<Point>, WhisperError> {
        let archive = self.header.archives.get(index).ok_or_else(|| {
            WhisperError::InvalidConfiguration(format!("No archive with index {}", index))
        })?;
        archive.read_all(&self.store)
    }

    /// Flushes file data to stable storage.
    pub fn sync(&self) -> Result<(), WhisperError> {
        self.store.sync_data()
    }
}

/// Convenience wrapper: reads the header of `path` with default options.
pub fn info(path: &Path) -> Result<Info, WhisperError> {
    Ok(WhisperFile::open_readonly(path, OpenOptions::default())?.info())
}

/// Convenience wrapper: computes the on-disk size a layout would occupy.
pub fn expected_file_size(archives: &[(u32, u32)]) -> Result<u64, WhisperError> {
    let sorted = validate_archive_list(archives)?;
    let data: u64 = sorted
        .iter()
        .map(|&(_, points)| points as u64 * codec::POINT_SIZE as u64)
        .sum();
    Ok(codec::header_size(sorted.len()) + data)
}
