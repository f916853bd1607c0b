//! Retention specification parsing and archive-list validation.
//!
//! A retention definition is `step:retention`, e.g. `60:1440` (60 seconds per
//! point, 1440 points), `15m:8` (15 minutes per point, 8 points) or `1h:7d`
//! (1 hour per point, 7 days of history). A unit token is any prefix of
//! `seconds|minutes|hours|days|weeks|years`.

use crate::error::WhisperError;

/// `(full unit name, multiplier in seconds)`, checked in order.
const UNIT_MULTIPLIERS: [(&str, u32); 6] = [
    ("seconds", 1),
    ("minutes", 60),
    ("hours", 3600),
    ("days", 86400),
    ("weeks", 86400 * 7),
    ("years", 86400 * 365),
];

/// Resolves a unit token (`s`, `min`, `hours`, …) to its multiplier.
fn unit_multiplier(unit: &str) -> Result<u32, WhisperError> {
    UNIT_MULTIPLIERS
        .iter()
        .find(|(name, _)| name.starts_with(unit))
        .map(|&(_, mult)| mult)
        .ok_or_else(|| WhisperError::InvalidConfiguration(format!("Invalid unit '{}'", unit)))
}

/// Splits `120m` into `(120, "m")`. A bare number yields an empty unit.
fn split_quantity(s: &str) -> Option<(u32, &str)> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return None;
    }
    let unit = &s[digits_end..];
    if !unit.chars().all(|c| c.is_ascii_lowercase()) {
        return None;
    }
    s[..digits_end].parse().ok().map(|n| (n, unit))
}

/// Converts a quantity-with-unit to seconds; a bare number is seconds.
fn parse_duration(s: &str) -> Result<u32, WhisperError> {
    let (amount, unit) = split_quantity(s).ok_or_else(|| {
        WhisperError::InvalidConfiguration(format!("Invalid precision specification '{}'", s))
    })?;
    if unit.is_empty() {
        return Ok(amount);
    }
    amount
        .checked_mul(unit_multiplier(unit)?)
        .ok_or_else(|| {
            WhisperError::InvalidConfiguration(format!("Duration '{}' is out of range", s))
        })
}

/// Parses one `step:retention` definition into `(seconds_per_point, points)`.
///
/// When the second field carries a unit it is a length of history and the
/// point count is `retention / step`; a bare number is a raw point count.
pub fn parse_retention_def(def: &str) -> Result<(u32, u32), WhisperError> {
    let (precision, points) = def.trim().split_once(':').ok_or_else(|| {
        WhisperError::InvalidConfiguration(format!("Invalid retention definition '{}'", def))
    })?;

    let seconds_per_point = parse_duration(precision)?;
    if seconds_per_point == 0 {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Invalid precision specification '{}'",
            precision
        )));
    }

    let (amount, unit) = split_quantity(points).ok_or_else(|| {
        WhisperError::InvalidConfiguration(format!("Invalid retention specification '{}'", points))
    })?;
    let points = if unit.is_empty() {
        amount
    } else {
        amount
            .checked_mul(unit_multiplier(unit)?)
            .ok_or_else(|| {
                WhisperError::InvalidConfiguration(format!("Retention '{}' is out of range", def))
            })?
            / seconds_per_point
    };
    if points == 0 {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Invalid retention specification '{}'",
            def
        )));
    }

    Ok((seconds_per_point, points))
}

/// Validates and normalizes an archive list, returning it sorted by step.
///
/// A valid list has at least one archive; no duplicate steps; each coarser
/// step an exact multiple of the finer one; strictly growing retention; and
/// each finer archive holding at least one whole coarser step of points.
pub fn validate_archive_list(archives: &[(u32, u32)]) -> Result<Vec<(u32, u32)>, WhisperError> {
    if archives.is_empty() {
        return Err(WhisperError::InvalidConfiguration(
            "You must specify at least one archive configuration".to_string(),
        ));
    }
    for &(step, points) in archives {
        if step == 0 || points == 0 {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Archive ({}, {}) has a zero step or point count",
                step, points
            )));
        }
        if step as u64 * points as u64 > u32::MAX as u64 {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Archive ({}, {}) retention does not fit the header field",
                step, points
            )));
        }
    }

    let mut sorted = archives.to_vec();
    sorted.sort_by_key(|a| a.0);

    for i in 0..sorted.len() - 1 {
        let (step, points) = sorted[i];
        let (next_step, next_points) = sorted[i + 1];

        if step >= next_step {
            return Err(WhisperError::InvalidConfiguration(format!(
                "A whisper database may not be configured having two archives \
                 with the same precision (archive{}: {:?}, archive{}: {:?})",
                i,
                sorted[i],
                i + 1,
                sorted[i + 1]
            )));
        }

        if next_step % step != 0 {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Higher precision archives' precision must evenly divide all \
                 lower precision archives' precision (archive{}: {}, archive{}: {})",
                i,
                step,
                i + 1,
                next_step
            )));
        }

        let retention = step as u64 * points as u64;
        let next_retention = next_step as u64 * next_points as u64;
        if next_retention <= retention {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Lower precision archives must cover larger time intervals than \
                 higher precision archives (archive{}: {} seconds, archive{}: {} seconds)",
                i,
                retention,
                i + 1,
                next_retention
            )));
        }

        let points_per_consolidation = next_step / step;
        if points < points_per_consolidation {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Each archive must have at least enough points to consolidate \
                 to the next archive (archive{} consolidates {} of archive{}'s \
                 points but it has only {} total points)",
                i + 1,
                points_per_consolidation,
                i,
                points
            )));
        }
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_seconds_and_count() {
        assert_eq!(parse_retention_def("60:1440").unwrap(), (60, 1440));
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_retention_def("15m:8").unwrap(), (900, 8));
        assert_eq!(parse_retention_def("1h:7d").unwrap(), (3600, 168));
        assert_eq!(parse_retention_def("12h:2y").unwrap(), (43200, 1460));
        assert_eq!(parse_retention_def("1w:1y").unwrap(), (604800, 52));
    }

    #[test]
    fn test_parse_unit_prefixes() {
        // Any prefix of the full unit name is accepted.
        assert_eq!(parse_retention_def("1min:30minutes").unwrap(), (60, 30));
        assert_eq!(parse_retention_def("1hours:1d").unwrap(), (3600, 24));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_retention_def("60").is_err());
        assert!(parse_retention_def(":60").is_err());
        assert!(parse_retention_def("60:").is_err());
        assert!(parse_retention_def("1x:30").is_err());
        assert!(parse_retention_def("m1:30").is_err());
        assert!(parse_retention_def("0:30").is_err());
    }

    #[test]
    fn test_validate_sorts_by_precision() {
        let sorted = validate_archive_list(&[(300, 288), (60, 1440)]).unwrap();
        assert_eq!(sorted, vec![(60, 1440), (300, 288)]);
    }

    #[test]
    fn test_validate_rejects_duplicate_steps() {
        assert!(validate_archive_list(&[(60, 1440), (60, 2880)]).is_err());
    }

    #[test]
    fn test_validate_rejects_non_divisible_steps() {
        assert!(validate_archive_list(&[(60, 1440), (90, 1440)]).is_err());
    }

    #[test]
    fn test_validate_rejects_non_growing_retention() {
        // 300 * 200 = 60000 <= 60 * 1440 = 86400.
        assert!(validate_archive_list(&[(60, 1440), (300, 200)]).is_err());
    }

    #[test]
    fn test_validate_rejects_too_few_points_to_consolidate() {
        // Finer archive has 3 points but a coarse step covers 5 of them.
        assert!(validate_archive_list(&[(60, 3), (300, 100)]).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_list() {
        assert!(validate_archive_list(&[]).is_err());
    }
}
