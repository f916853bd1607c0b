//! Binary codec for the on-disk format.
//!
//! File = Header, ArchiveInfo table, then one data region per archive.
//! Header = aggregation code (u32), max retention (u32), xFilesFactor (f32),
//! archive count (u32). All integers and floats are big-endian. Every field
//! width and offset is part of the external contract.

use crate::archive::Archive;
use crate::error::WhisperError;
use crate::io::StoreFile;
use crate::types::{AggregationMethod, Point, Timestamp, Value};

/// Size of the packed header metadata block.
pub const METADATA_SIZE: usize = 16;
/// Size of one packed archive-info record.
pub const ARCHIVE_INFO_SIZE: usize = 12;
/// Size of one packed point.
pub const POINT_SIZE: usize = 12;

/// Parsed header metadata block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metadata {
    pub aggregation_method: AggregationMethod,
    pub max_retention: u32,
    pub x_files_factor: f32,
    pub archive_count: u32,
}

/// A fully parsed and validated file header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub metadata: Metadata,
    pub archives: Vec<Archive>,
}

impl Header {
    /// Total byte size the header implies for the whole file.
    pub fn expected_file_size(&self) -> u64 {
        let data: u64 = self
            .archives
            .iter()
            .map(|a| a.size_bytes() as u64)
            .sum();
        header_size(self.archives.len()) + data
    }
}

/// Byte size of metadata plus the archive-info table for `archive_count`
/// archives; the first archive's data region starts here.
pub fn header_size(archive_count: usize) -> u64 {
    (METADATA_SIZE + ARCHIVE_INFO_SIZE * archive_count) as u64
}

pub fn pack_metadata(metadata: &Metadata) -> [u8; METADATA_SIZE] {
    let mut buf = [0u8; METADATA_SIZE];
    buf[0..4].copy_from_slice(&metadata.aggregation_method.code().to_be_bytes());
    buf[4..8].copy_from_slice(&metadata.max_retention.to_be_bytes());
    buf[8..12].copy_from_slice(&metadata.x_files_factor.to_be_bytes());
    buf[12..16].copy_from_slice(&metadata.archive_count.to_be_bytes());
    buf
}

pub fn pack_archive_info(archive: &Archive) -> [u8; ARCHIVE_INFO_SIZE] {
    let mut buf = [0u8; ARCHIVE_INFO_SIZE];
    buf[0..4].copy_from_slice(&archive.offset.to_be_bytes());
    buf[4..8].copy_from_slice(&archive.seconds_per_point.to_be_bytes());
    buf[8..12].copy_from_slice(&archive.points.to_be_bytes());
    buf
}

pub fn pack_point(timestamp: Timestamp, value: Value) -> [u8; POINT_SIZE] {
    let mut buf = [0u8; POINT_SIZE];
    buf[0..4].copy_from_slice(&timestamp.to_be_bytes());
    buf[4..12].copy_from_slice(&value.to_be_bytes());
    buf
}

pub fn unpack_point(buf: &[u8]) -> Point {
    debug_assert!(buf.len() >= POINT_SIZE);
    let timestamp = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let value = f64::from_be_bytes([
        buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
    ]);
    Point { timestamp, value }
}

/// Unpacks a buffer of consecutive packed points. Trailing bytes that do not
/// form a whole point are ignored.
pub fn unpack_points(buf: &[u8]) -> impl Iterator<Item = Point> + '_ {
    buf.chunks_exact(POINT_SIZE).map(unpack_point)
}

fn unpack_archive_info(buf: &[u8]) -> Archive {
    debug_assert!(buf.len() >= ARCHIVE_INFO_SIZE);
    Archive {
        offset: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        seconds_per_point: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        points: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    }
}

/// Reads the archive-info record at `index` without parsing the whole table.
pub fn read_archive_info(store: &StoreFile, index: usize) -> Result<Archive, WhisperError> {
    let mut buf = [0u8; ARCHIVE_INFO_SIZE];
    let offset = METADATA_SIZE as u64 + (index * ARCHIVE_INFO_SIZE) as u64;
    store.read_at(offset, &mut buf)?;
    Ok(unpack_archive_info(&buf))
}

/// Reads and validates the full header.
///
/// Rejects files whose declared layout disagrees with the actual file size,
/// whose archive count is zero, whose offsets escape the file, or whose
/// xFilesFactor lies outside [0,1].
pub fn read_header(store: &StoreFile) -> Result<Header, WhisperError> {
    let path = store.path().to_path_buf();
    let file_len = store.len()?;

    let mut buf = [0u8; METADATA_SIZE];
    store
        .read_at(0, &mut buf)
        .map_err(|_| WhisperError::corrupt("Unable to read header", &path))?;

    let code = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let max_retention = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let x_files_factor = f32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let archive_count = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

    let aggregation_method = AggregationMethod::from_code(code).ok_or_else(|| {
        WhisperError::corrupt(format!("Unknown aggregation type {}", code), &path)
    })?;

    if !(0.0..=1.0).contains(&x_files_factor) {
        return Err(WhisperError::corrupt(
            format!("xFilesFactor {} out of range", x_files_factor),
            &path,
        ));
    }

    if archive_count == 0 {
        return Err(WhisperError::corrupt("Archive count is zero", &path));
    }

    let mut archives = Vec::with_capacity(archive_count as usize);
    for i in 0..archive_count as usize {
        let archive = read_archive_info(store, i)
            .map_err(|_| WhisperError::corrupt(format!("Unable to read archive{} metadata", i), &path))?;
        if archive.seconds_per_point == 0 || archive.points == 0 {
            return Err(WhisperError::corrupt(
                format!("archive{} has a zero step or point count", i),
                &path,
            ));
        }
        let end = archive.offset as u64 + archive.size_bytes() as u64;
        if end > file_len {
            return Err(WhisperError::corrupt(
                format!("archive{} data region escapes the file", i),
                &path,
            ));
        }
        archives.push(archive);
    }

    let header = Header {
        metadata: Metadata {
            aggregation_method,
            max_retention,
            x_files_factor,
            archive_count,
        },
        archives,
    };

    if header.expected_file_size() != file_len {
        return Err(WhisperError::corrupt(
            format!(
                "Declared size {} does not match actual size {}",
                header.expected_file_size(),
                file_len
            ),
            &path,
        ));
    }

    Ok(header)
}

/// Rewrites the 16-byte metadata block in place. Used by create and by the
/// header-only mutations (aggregation method, xFilesFactor).
pub fn write_metadata(store: &StoreFile, metadata: &Metadata) -> Result<(), WhisperError> {
    if !(0.0..=1.0).contains(&metadata.x_files_factor) {
        return Err(WhisperError::InvalidXFilesFactor(metadata.x_files_factor));
    }
    store.write_at(0, &pack_metadata(metadata))
}
