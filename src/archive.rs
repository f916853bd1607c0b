//! A single round-robin archive: ring addressing plus slot reads and writes.
//!
//! An archive has no head pointer. The timestamp stored in slot 0 (the base
//! point) anchors the ring: slot of interval `t` sits at
//! `offset + ((t - base) / step mod points) * POINT_SIZE`. Empty slots carry
//! timestamp 0, so every slot is self-describing and a stale slot left over
//! from a previous lap is simply reported as missing.

use serde::Serialize;

use crate::codec::{pack_point, unpack_point, unpack_points, POINT_SIZE};
use crate::error::WhisperError;
use crate::io::StoreFile;
use crate::types::{Point, Timestamp, Value};

/// One archive's entry in the header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Archive {
    /// Absolute byte offset of the archive's data region.
    pub offset: u32,
    /// Step size between consecutive points.
    pub seconds_per_point: u32,
    /// Ring capacity.
    pub points: u32,
}

impl Archive {
    /// Length of history this archive retains, in seconds.
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }

    /// Byte size of the data region.
    pub fn size_bytes(&self) -> u32 {
        self.points * POINT_SIZE as u32
    }

    /// Snaps a raw timestamp down to this archive's step grid.
    pub fn interval_start(&self, timestamp: Timestamp) -> Timestamp {
        timestamp - (timestamp % self.seconds_per_point)
    }

    /// Reads the base point (slot 0). Its timestamp anchors the ring; zero
    /// means the archive has never been written.
    pub fn read_base(&self, store: &StoreFile) -> Result<Point, WhisperError> {
        let mut buf = [0u8; POINT_SIZE];
        store.read_at(self.offset as u64, &mut buf)?;
        Ok(unpack_point(&buf))
    }

    /// Absolute byte offset of the slot holding `interval`, given the ring's
    /// anchor. Distances may be negative (interval older than the anchor), so
    /// the modulo is euclidean.
    fn slot_offset(&self, base_interval: Timestamp, interval: Timestamp) -> u64 {
        let time_distance = interval as i64 - base_interval as i64;
        let point_distance = time_distance / self.seconds_per_point as i64;
        let byte_distance = point_distance * POINT_SIZE as i64;
        (self.offset as i64 + byte_distance.rem_euclid(self.size_bytes() as i64)) as u64
    }

    /// Overwrites the slot for `interval` with `(interval, value)`. The first
    /// write to an empty archive lands in slot 0 and establishes the anchor.
    pub fn write_point(
        &self,
        store: &StoreFile,
        interval: Timestamp,
        value: Value,
    ) -> Result<(), WhisperError> {
        let packed = pack_point(interval, value);
        let base = self.read_base(store)?;
        let offset = if base.is_empty() {
            self.offset as u64
        } else {
            self.slot_offset(base.timestamp, interval)
        };
        store.write_at(offset, &packed)
    }

    /// Reads the slots covering `[from_interval, until_interval)`. Both
    /// bounds must be aligned to this archive's step. Returns one entry per
    /// step; a slot whose stored timestamp does not match its expected
    /// interval is reported as `None`.
    pub fn read_interval(
        &self,
        store: &StoreFile,
        from_interval: Timestamp,
        until_interval: Timestamp,
    ) -> Result<Vec<Option<Value>>, WhisperError> {
        let step = self.seconds_per_point;
        let count = ((until_interval as i64 - from_interval as i64) / step as i64) as usize;

        let base = self.read_base(store)?;
        if base.is_empty() {
            return Ok(vec![None; count]);
        }

        let buf = self.read_slots_wrapping(store, base.timestamp, from_interval, count)?;

        let mut values = vec![None; count];
        let mut expected = from_interval;
        for (slot, point) in values.iter_mut().zip(unpack_points(&buf)) {
            if point.timestamp == expected {
                *slot = Some(point.value);
            }
            expected += step;
        }
        Ok(values)
    }

    /// Reads `count` consecutive slots starting at the slot of
    /// `from_interval`, wrapping around the ring boundary when needed.
    fn read_slots_wrapping(
        &self,
        store: &StoreFile,
        base_interval: Timestamp,
        from_interval: Timestamp,
        count: usize,
    ) -> Result<Vec<u8>, WhisperError> {
        let from_offset = self.slot_offset(base_interval, from_interval);
        let until_offset = self.slot_offset(
            base_interval,
            from_interval + (count as u32) * self.seconds_per_point,
        );
        let archive_start = self.offset as u64;
        let archive_end = archive_start + self.size_bytes() as u64;

        let mut buf = vec![0u8; count * POINT_SIZE];
        if from_offset < until_offset {
            store.read_at(from_offset, &mut buf)?;
        } else {
            let tail = (archive_end - from_offset) as usize;
            store.read_at(from_offset, &mut buf[..tail])?;
            store.read_at(archive_start, &mut buf[tail..])?;
        }
        Ok(buf)
    }

    /// Applies a batch of points to this archive in one pass.
    ///
    /// Points must be sorted ascending by raw timestamp. Timestamps are
    /// aligned to the step; when several points land in one slot the latest
    /// wins. Adjacent slots coalesce into contiguous writes that split only
    /// at the ring boundary.
    pub fn write_many(&self, store: &StoreFile, points: &[Point]) -> Result<(), WhisperError> {
        if points.is_empty() {
            return Ok(());
        }
        let step = self.seconds_per_point;
        let aligned: Vec<(Timestamp, Value)> = points
            .iter()
            .map(|p| (self.interval_start(p.timestamp), p.value))
            .collect();

        // Pack each contiguous sequence of intervals into a single run.
        let mut runs: Vec<(Timestamp, Vec<u8>)> = Vec::new();
        let mut current = Vec::new();
        let mut previous: Option<Timestamp> = None;
        for i in 0..aligned.len() {
            // Take the last point in a run of duplicate intervals.
            if i + 1 < aligned.len() && aligned[i].0 == aligned[i + 1].0 {
                continue;
            }
            let (interval, value) = aligned[i];
            if let Some(prev) = previous {
                if interval != prev + step {
                    let count = (current.len() / POINT_SIZE) as u32;
                    let start = prev - step * (count - 1);
                    runs.push((start, std::mem::take(&mut current)));
                }
            }
            current.extend_from_slice(&pack_point(interval, value));
            previous = Some(interval);
        }
        if let (Some(prev), false) = (previous, current.is_empty()) {
            let count = (current.len() / POINT_SIZE) as u32;
            let start = prev - step * (count - 1);
            runs.push((start, current));
        }

        let base = self.read_base(store)?;
        let base_interval = if base.is_empty() {
            // First write: anchor the ring at our first run.
            runs[0].0
        } else {
            base.timestamp
        };

        let archive_start = self.offset as u64;
        let archive_end = archive_start + self.size_bytes() as u64;
        for (start_interval, packed) in &runs {
            let offset = self.slot_offset(base_interval, *start_interval);
            let end = offset + packed.len() as u64;
            if end > archive_end {
                // Run crosses the ring boundary; split the write.
                let head = (archive_end - offset) as usize;
                store.write_at(offset, &packed[..head])?;
                store.write_at(archive_start, &packed[head..])?;
            } else {
                store.write_at(offset, packed)?;
            }
        }
        Ok(())
    }

    /// Reads every slot of the archive in file order. Used by full-file
    /// scans such as dump.
    pub fn read_all(&self, store: &StoreFile) -> Result<Vec<Point>, WhisperError> {
        let mut buf = vec![0u8; self.size_bytes() as usize];
        store.read_at(self.offset as u64, &mut buf)?;
        Ok(unpack_points(&buf).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LockMode;
    use tempfile::tempdir;

    fn test_archive(dir: &std::path::Path, points: u32) -> (StoreFile, Archive) {
        let archive = Archive {
            offset: 0,
            seconds_per_point: 60,
            points,
        };
        let path = dir.join("ring.dat");
        let store = StoreFile::create_new(&path, LockMode::None).unwrap();
        store.allocate(0, archive.size_bytes() as u64, false).unwrap();
        (store, archive)
    }

    #[test]
    fn test_first_write_anchors_slot_zero() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);

        archive.write_point(&store, 600, 1.5).unwrap();
        let base = archive.read_base(&store).unwrap();
        assert_eq!(base, Point::new(600, 1.5));
    }

    #[test]
    fn test_ring_wraps_forwards_and_backwards() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);

        archive.write_point(&store, 600, 1.0).unwrap();
        // Two slots ahead of the anchor.
        archive.write_point(&store, 720, 3.0).unwrap();
        // One slot before the anchor wraps to the last slot.
        archive.write_point(&store, 540, 9.0).unwrap();

        let all = archive.read_all(&store).unwrap();
        assert_eq!(all[0], Point::new(600, 1.0));
        assert_eq!(all[2], Point::new(720, 3.0));
        assert_eq!(all[4], Point::new(540, 9.0));
    }

    #[test]
    fn test_read_interval_reports_stale_slots_as_missing() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);

        archive.write_point(&store, 600, 1.0).unwrap();
        archive.write_point(&store, 660, 2.0).unwrap();

        let values = archive.read_interval(&store, 600, 900).unwrap();
        assert_eq!(values, vec![Some(1.0), Some(2.0), None, None, None]);

        // A full lap later the old slots hold stale timestamps.
        let lap = archive.retention();
        let values = archive
            .read_interval(&store, 600 + lap, 900 + lap)
            .unwrap();
        assert_eq!(values, vec![None; 5]);
    }

    #[test]
    fn test_read_interval_empty_archive() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);
        let values = archive.read_interval(&store, 600, 780).unwrap();
        assert_eq!(values, vec![None, None, None]);
    }

    #[test]
    fn test_write_many_coalesces_and_wraps() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);

        // Anchor at 600, then write a contiguous run that crosses the ring
        // boundary: slots 3, 4 wrap into 0.
        archive.write_point(&store, 600, 0.0).unwrap();
        let run: Vec<Point> = vec![
            Point::new(780, 3.0),
            Point::new(840, 4.0),
            Point::new(900, 5.0),
        ];
        archive.write_many(&store, &run).unwrap();

        let values = archive.read_interval(&store, 660, 960).unwrap();
        assert_eq!(
            values,
            vec![None, None, Some(3.0), Some(4.0), Some(5.0)]
        );
    }

    #[test]
    fn test_write_many_duplicate_slot_keeps_latest() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 5);

        let points = vec![
            Point::new(601, 1.0),
            Point::new(630, 2.0),
            Point::new(659, 3.0),
        ];
        archive.write_many(&store, &points).unwrap();
        let values = archive.read_interval(&store, 600, 660).unwrap();
        assert_eq!(values, vec![Some(3.0)]);
    }

    #[test]
    fn test_write_many_disjoint_runs() {
        let dir = tempdir().unwrap();
        let (store, archive) = test_archive(dir.path(), 10);

        let points = vec![
            Point::new(600, 1.0),
            Point::new(660, 2.0),
            // gap at 720
            Point::new(780, 4.0),
        ];
        archive.write_many(&store, &points).unwrap();
        let values = archive.read_interval(&store, 600, 840).unwrap();
        assert_eq!(values, vec![Some(1.0), Some(2.0), None, Some(4.0)]);
    }
}
