//! Merge, fill, diff, and resize behavior.

use std::fs;
use std::path::PathBuf;

use tempfile::tempdir;
use whisper::bulk::{diff_at, fill_at, merge_at};
use whisper::resize::{resize_at, ResizeOptions};
use whisper::{CreateOptions, OpenOptions, Point, WhisperError, WhisperFile};

const NOW: u32 = 3000;

fn create_two_level(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    WhisperFile::create(&path, &[(60, 10), (300, 10)], &CreateOptions::default()).unwrap();
    path
}

fn fine_values(path: &PathBuf, from: u32, until: u32) -> Vec<Option<f64>> {
    let file = WhisperFile::open(path).unwrap();
    let result = file
        .fetch_selected(from, Some(until), NOW, Some(60))
        .unwrap()
        .unwrap();
    result.values
}

fn coarse_values(path: &PathBuf, from: u32, until: u32) -> Vec<Option<f64>> {
    let file = WhisperFile::open(path).unwrap();
    let result = file
        .fetch_selected(from, Some(until), NOW, Some(300))
        .unwrap()
        .unwrap();
    result.values
}

#[test]
fn test_merge_copies_and_overwrites() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = create_two_level(&dir, "dst.wsp");

    let mut src_file = WhisperFile::open(&src).unwrap();
    let points: Vec<Point> = (0..5).map(|i| Point::new(2640 + i * 60, i as f64)).collect();
    src_file.update_many_at(&points, NOW).unwrap();
    drop(src_file);

    // A colliding destination point gets overwritten.
    let mut dst_file = WhisperFile::open(&dst).unwrap();
    dst_file.update_at(99.0, Some(2700), NOW).unwrap();
    drop(dst_file);

    merge_at(&src, &dst, None, None, NOW, &OpenOptions::default()).unwrap();

    assert_eq!(
        fine_values(&dst, 2640, 2940),
        vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0), Some(4.0)]
    );
}

#[test]
fn test_merge_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = create_two_level(&dir, "dst.wsp");

    let mut src_file = WhisperFile::open(&src).unwrap();
    let points: Vec<Point> = (0..8).map(|i| Point::new(2460 + i * 60, i as f64)).collect();
    src_file.update_many_at(&points, NOW).unwrap();
    drop(src_file);

    merge_at(&src, &dst, None, None, NOW, &OpenOptions::default()).unwrap();
    let once = fs::read(&dst).unwrap();
    merge_at(&src, &dst, None, None, NOW, &OpenOptions::default()).unwrap();
    assert_eq!(fs::read(&dst).unwrap(), once);
}

#[test]
fn test_merge_respects_interval() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = create_two_level(&dir, "dst.wsp");

    let mut src_file = WhisperFile::open(&src).unwrap();
    let points: Vec<Point> = (0..5).map(|i| Point::new(2640 + i * 60, i as f64)).collect();
    src_file.update_many_at(&points, NOW).unwrap();
    drop(src_file);

    merge_at(&src, &dst, Some(2760), Some(2880), NOW, &OpenOptions::default()).unwrap();

    assert_eq!(
        fine_values(&dst, 2640, 2940),
        vec![None, None, Some(2.0), Some(3.0), None]
    );
}

#[test]
fn test_merge_rejects_mismatched_configurations() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = dir.path().join("other.wsp");
    WhisperFile::create(&dst, &[(60, 20), (300, 10)], &CreateOptions::default()).unwrap();

    assert!(matches!(
        merge_at(&src, &dst, None, None, NOW, &OpenOptions::default()),
        Err(WhisperError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_fill_only_touches_gaps() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = create_two_level(&dir, "dst.wsp");

    // Source holds a full fine window with recognizable values.
    let mut src_file = WhisperFile::open(&src).unwrap();
    let points: Vec<Point> = (0..10).map(|i| Point::new(2400 + i * 60, 10.0 + i as f64)).collect();
    src_file.update_many_at(&points, NOW).unwrap();
    drop(src_file);

    // Destination has data at the window's edges and an 8-slot gap between.
    let mut dst_file = WhisperFile::open(&dst).unwrap();
    dst_file.update_at(1.0, Some(2400), NOW).unwrap();
    dst_file.update_at(9.0, Some(2940), NOW).unwrap();
    drop(dst_file);

    fill_at(&src, &dst, NOW, &OpenOptions::default()).unwrap();

    let values = fine_values(&dst, 2400, 3000);
    // Existing points survive; the gap comes from the source.
    assert_eq!(
        values,
        vec![
            Some(1.0),
            Some(11.0),
            Some(12.0),
            Some(13.0),
            Some(14.0),
            Some(15.0),
            Some(16.0),
            Some(17.0),
            Some(18.0),
            Some(9.0),
        ]
    );
}

#[test]
fn test_fill_uses_coarse_source_for_old_gaps() {
    let dir = tempdir().unwrap();
    let src = create_two_level(&dir, "src.wsp");
    let dst = create_two_level(&dir, "dst.wsp");

    // Source coarse archive holds old history (past the fine retention).
    let mut src_file = WhisperFile::open(&src).unwrap();
    let points: Vec<Point> = (0..7).map(|i| Point::new(300 + i * 300, 20.0 + i as f64)).collect();
    src_file.update_many_at(&points, NOW).unwrap();
    drop(src_file);

    // Destination has the gap's edges only.
    let mut dst_file = WhisperFile::open(&dst).unwrap();
    dst_file.update_at(1.0, Some(300), NOW).unwrap();
    dst_file.update_at(7.0, Some(2100), NOW).unwrap();
    drop(dst_file);

    fill_at(&src, &dst, NOW, &OpenOptions::default()).unwrap();

    let values = coarse_values(&dst, 300, 2400);
    assert_eq!(
        values,
        vec![
            Some(1.0),
            Some(21.0),
            Some(22.0),
            Some(23.0),
            Some(24.0),
            Some(25.0),
            Some(7.0),
        ]
    );
}

#[test]
fn test_diff_reports_differing_slots() {
    let dir = tempdir().unwrap();
    let a = create_two_level(&dir, "a.wsp");
    let b = create_two_level(&dir, "b.wsp");

    let mut a_file = WhisperFile::open(&a).unwrap();
    a_file.update_at(1.0, Some(2700), NOW).unwrap();
    a_file.update_at(5.0, Some(2760), NOW).unwrap();
    drop(a_file);

    let mut b_file = WhisperFile::open(&b).unwrap();
    b_file.update_at(1.0, Some(2700), NOW).unwrap();
    b_file.update_at(6.0, Some(2760), NOW).unwrap();
    b_file.update_at(9.0, Some(2820), NOW).unwrap();
    drop(b_file);

    let result = diff_at(&a, &b, false, None, NOW, &OpenOptions::default()).unwrap();
    assert_eq!(result.len(), 2);

    let fine = &result[0];
    assert_eq!(fine.archive_index, 0);
    let reported: Vec<(u32, Option<f64>, Option<f64>)> =
        fine.diffs.iter().map(|d| (d.timestamp, d.a, d.b)).collect();
    assert_eq!(
        reported,
        vec![(2760, Some(5.0), Some(6.0)), (2820, None, Some(9.0))]
    );

    // Matching slots still count as examined points.
    assert_eq!(fine.points, 3);
}

#[test]
fn test_diff_ignore_empty_requires_both_sides() {
    let dir = tempdir().unwrap();
    let a = create_two_level(&dir, "a.wsp");
    let b = create_two_level(&dir, "b.wsp");

    let mut a_file = WhisperFile::open(&a).unwrap();
    a_file.update_at(5.0, Some(2760), NOW).unwrap();
    drop(a_file);

    let mut b_file = WhisperFile::open(&b).unwrap();
    b_file.update_at(9.0, Some(2820), NOW).unwrap();
    drop(b_file);

    let strict = diff_at(&a, &b, true, None, NOW, &OpenOptions::default()).unwrap();
    assert!(strict[0].diffs.is_empty());

    let loose = diff_at(&a, &b, false, None, NOW, &OpenOptions::default()).unwrap();
    assert_eq!(loose[0].diffs.len(), 2);
}

#[test]
fn test_diff_identical_files_reports_nothing() {
    let dir = tempdir().unwrap();
    let a = create_two_level(&dir, "a.wsp");
    let b = create_two_level(&dir, "b.wsp");

    for path in [&a, &b] {
        let mut file = WhisperFile::open(path).unwrap();
        file.update_at(3.0, Some(2700), NOW).unwrap();
    }

    let result = diff_at(&a, &b, false, None, NOW, &OpenOptions::default()).unwrap();
    assert!(result.iter().all(|archive| archive.diffs.is_empty()));
}

#[test]
fn test_resize_grow_preserves_data() {
    let dir = tempdir().unwrap();
    let path = create_two_level(&dir, "grow.wsp");

    let mut file = WhisperFile::open(&path).unwrap();
    let points: Vec<Point> = (0..5).map(|i| Point::new(2640 + i * 60, i as f64)).collect();
    file.update_many_at(&points, NOW).unwrap();
    drop(file);

    resize_at(
        &path,
        &[(60, 20), (300, 20)],
        &ResizeOptions::default(),
        &OpenOptions::default(),
        NOW,
    )
    .unwrap();

    // 16 + 2*12 + (20+20)*12 bytes.
    assert_eq!(fs::metadata(&path).unwrap().len(), 520);
    let info = whisper::core::info(&path).unwrap();
    assert_eq!(info.archives[0].points, 20);
    assert_eq!(
        fine_values(&path, 2640, 2940),
        vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0), Some(4.0)]
    );

    // The displaced original is kept as a backup.
    let backup = dir.path().join("grow.wsp.bak");
    assert!(backup.exists());
    let old_info = whisper::core::info(&backup).unwrap();
    assert_eq!(old_info.archives[0].points, 10);
}

#[test]
fn test_resize_shrink_requires_force() {
    let dir = tempdir().unwrap();
    let path = create_two_level(&dir, "shrink.wsp");
    let mut file = WhisperFile::open(&path).unwrap();
    file.update_at(5.0, Some(2940), NOW).unwrap();
    drop(file);
    let before = fs::read(&path).unwrap();

    let result = resize_at(
        &path,
        &[(60, 10), (300, 5)],
        &ResizeOptions::default(),
        &OpenOptions::default(),
        NOW,
    );
    assert!(matches!(result, Err(WhisperError::InvalidConfiguration(_))));
    assert_eq!(fs::read(&path).unwrap(), before);

    resize_at(
        &path,
        &[(60, 10), (300, 5)],
        &ResizeOptions {
            force: true,
            ..ResizeOptions::default()
        },
        &OpenOptions::default(),
        NOW,
    )
    .unwrap();
    assert_eq!(whisper::core::info(&path).unwrap().max_retention, 1500);
}

#[test]
fn test_resize_nobackup_removes_backup() {
    let dir = tempdir().unwrap();
    let path = create_two_level(&dir, "nobak.wsp");

    resize_at(
        &path,
        &[(60, 20), (300, 20)],
        &ResizeOptions {
            nobackup: true,
            ..ResizeOptions::default()
        },
        &OpenOptions::default(),
        NOW,
    )
    .unwrap();
    assert!(!dir.path().join("nobak.wsp.bak").exists());
}

#[test]
fn test_resize_newfile_leaves_original_untouched() {
    let dir = tempdir().unwrap();
    let path = create_two_level(&dir, "orig.wsp");
    let newfile = dir.path().join("copy.wsp");

    let mut file = WhisperFile::open(&path).unwrap();
    file.update_at(5.0, Some(2940), NOW).unwrap();
    drop(file);
    let before = fs::read(&path).unwrap();

    resize_at(
        &path,
        &[(60, 20), (300, 20)],
        &ResizeOptions {
            newfile: Some(newfile.clone()),
            ..ResizeOptions::default()
        },
        &OpenOptions::default(),
        NOW,
    )
    .unwrap();

    assert_eq!(fs::read(&path).unwrap(), before);
    let copied = WhisperFile::open(&newfile).unwrap();
    let result = copied
        .fetch_selected(2940, Some(3000), NOW, Some(60))
        .unwrap()
        .unwrap();
    assert_eq!(result.values, vec![Some(5.0)]);
}

#[test]
fn test_resize_aggregate_rebins_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("agg.wsp");
    WhisperFile::create(&path, &[(60, 10)], &CreateOptions::default()).unwrap();

    let mut file = WhisperFile::open(&path).unwrap();
    let points: Vec<Point> = (1..10).map(|i| Point::new(2400 + i * 60, i as f64)).collect();
    file.update_many_at(&points, NOW).unwrap();
    drop(file);

    resize_at(
        &path,
        &[(120, 10)],
        &ResizeOptions {
            aggregate: true,
            ..ResizeOptions::default()
        },
        &OpenOptions::default(),
        NOW,
    )
    .unwrap();

    let file = WhisperFile::open(&path).unwrap();
    let result = file
        .fetch_selected(2400, Some(3000), NOW, Some(120))
        .unwrap()
        .unwrap();
    // Each 120s slot averages its two 60s sources; the first covers only
    // the single surviving source slot.
    assert_eq!(
        result.values,
        vec![Some(1.0), Some(2.5), Some(4.5), Some(6.5), Some(8.5)]
    );
}
