//! Command-line front-end for whisper databases.
//!
//! One binary with a subcommand per operation (`create`, `info`, `update`,
//! `fetch`, `dump`, `merge`, `fill`, `diff`, `resize`, `set-aggregation`,
//! `set-xff`). Exits 0 on success and 1 on any error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use whisper::bulk;
use whisper::core::{expected_file_size, unix_now};
use whisper::resize::{resize, ResizeOptions};
use whisper::retention::parse_retention_def;
use whisper::{
    AggregationMethod, CreateOptions, OpenOptions, Point, Timestamp, WhisperError, WhisperFile,
};

// ---------- CLI ----------

/// Fixed-size round-robin time-series database tool.
#[derive(Parser, Debug)]
#[command(name = "whisper", version, about)]
struct Cli {
    /// Hold an advisory file lock for the duration of the operation.
    #[arg(long, global = true)]
    lock: bool,

    /// Flush file data to stable storage after mutations.
    #[arg(long, global = true)]
    flush: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new whisper database.
    Create {
        path: PathBuf,
        /// Retention definitions, e.g. 60:1440 or 1h:7d.
        #[arg(required = true)]
        retentions: Vec<String>,
        #[arg(long, default_value_t = whisper::DEFAULT_X_FILES_FACTOR)]
        x_files_factor: f32,
        #[arg(long, default_value = "average")]
        aggregation_method: AggregationMethod,
        /// Allocate the data region as a filesystem hole.
        #[arg(long)]
        sparse: bool,
    },
    /// Print header metadata and the archive table.
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write one or more timestamp:value pairs.
    Update {
        path: PathBuf,
        /// Data points, each as timestamp:value.
        #[arg(required = true)]
        points: Vec<String>,
    },
    /// Read a time window.
    Fetch {
        path: PathBuf,
        /// Unix epoch time the window starts at (default: 24h ago).
        #[arg(long)]
        from: Option<Timestamp>,
        /// Unix epoch time the window ends at (default: now).
        #[arg(long)]
        until: Option<Timestamp>,
        #[arg(long)]
        json: bool,
    },
    /// Print every stored slot of every archive.
    Dump { path: PathBuf },
    /// Copy data from one database into another, overwriting collisions.
    Merge {
        src: PathBuf,
        dst: PathBuf,
        #[arg(long)]
        from: Option<Timestamp>,
        #[arg(long)]
        until: Option<Timestamp>,
    },
    /// Copy data from one database into the gaps of another.
    Fill { src: PathBuf, dst: PathBuf },
    /// Compare two databases archive by archive.
    Diff {
        a: PathBuf,
        b: PathBuf,
        /// Only compare slots populated in both files.
        #[arg(long)]
        ignore_empty: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a database with a new archive layout.
    Resize {
        path: PathBuf,
        /// New retention definitions, e.g. 60:1440 or 1h:7d.
        #[arg(required = true)]
        retentions: Vec<String>,
        #[arg(long)]
        x_files_factor: Option<f32>,
        #[arg(long)]
        aggregation_method: Option<AggregationMethod>,
        /// Allow a destructive retention shrink.
        #[arg(long)]
        force: bool,
        /// Re-aggregate values to fit the new archives.
        #[arg(long)]
        aggregate: bool,
        /// Write the new database here without replacing the original.
        #[arg(long)]
        newfile: Option<PathBuf>,
        /// Delete the .bak file after a successful resize.
        #[arg(long)]
        nobackup: bool,
    },
    /// Change the aggregation method stored in the header.
    SetAggregation {
        path: PathBuf,
        method: AggregationMethod,
        #[arg(long)]
        x_files_factor: Option<f32>,
    },
    /// Change the xFilesFactor stored in the header.
    SetXff {
        path: PathBuf,
        x_files_factor: f32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            ExitCode::FAILURE
        }
    }
}

fn open_options(cli_lock: bool, cli_flush: bool, mmap: bool) -> OpenOptions {
    OpenOptions {
        lock: cli_lock,
        flush: cli_flush,
        mmap,
        ..OpenOptions::default()
    }
}

fn parse_retentions(defs: &[String]) -> Result<Vec<(u32, u32)>, WhisperError> {
    defs.iter().map(|d| parse_retention_def(d)).collect()
}

fn parse_point(s: &str) -> Result<Point, WhisperError> {
    let parse = |s: &str| -> Option<Point> {
        let (ts, value) = s.split_once(':')?;
        Some(Point::new(ts.parse().ok()?, value.parse().ok()?))
    };
    parse(s).ok_or_else(|| {
        WhisperError::InvalidConfiguration(format!("Invalid data point '{}', expected timestamp:value", s))
    })
}

fn run(cli: Cli) -> Result<(), WhisperError> {
    let lock = cli.lock;
    let flush = cli.flush;

    match cli.command {
        Command::Create {
            path,
            retentions,
            x_files_factor,
            aggregation_method,
            sparse,
        } => {
            let archives = parse_retentions(&retentions)?;
            WhisperFile::create(
                &path,
                &archives,
                &CreateOptions {
                    x_files_factor,
                    aggregation_method,
                    sparse,
                    lock,
                    flush,
                    ..CreateOptions::default()
                },
            )?;
            println!("Created: {} ({} bytes)", path.display(), expected_file_size(&archives)?);
        }

        Command::Info { path, json } => {
            let file = WhisperFile::open_readonly(&path, open_options(lock, false, true))?;
            let info = file.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info).map_err(to_io)?);
            } else {
                println!("aggregationMethod: {}", info.aggregation_method);
                println!("maxRetention: {}", info.max_retention);
                println!("xFilesFactor: {}", info.x_files_factor);
                println!("archiveCount: {}", info.archives.len());
                for (i, a) in info.archives.iter().enumerate() {
                    println!();
                    println!("Archive {}", i);
                    println!("offset: {}", a.offset);
                    println!("secondsPerPoint: {}", a.seconds_per_point);
                    println!("points: {}", a.points);
                    println!("retention: {}", a.retention);
                    println!("size: {}", a.size_bytes);
                }
            }
        }

        Command::Update { path, points } => {
            let mut file = WhisperFile::open_with(&path, open_options(lock, flush, false))?;
            let points: Vec<Point> = points
                .iter()
                .map(|s| parse_point(s))
                .collect::<Result<_, _>>()?;
            if points.len() == 1 {
                file.update(points[0].value, Some(points[0].timestamp))?;
            } else {
                file.update_many(&points)?;
            }
        }

        Command::Fetch {
            path,
            from,
            until,
            json,
        } => {
            let now = unix_now();
            let from = from.unwrap_or_else(|| now.saturating_sub(86400));
            let file = WhisperFile::open_readonly(&path, open_options(lock, false, false))?;
            match file.fetch_at(from, until, now)? {
                None => println!("No data in the requested interval"),
                Some(result) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result).map_err(to_io)?);
                    } else {
                        let mut ts = result.time_info.from;
                        for value in &result.values {
                            match value {
                                Some(v) => println!("{}\t{}", ts, v),
                                None => println!("{}\tNone", ts),
                            }
                            ts += result.time_info.step;
                        }
                    }
                }
            }
        }

        Command::Dump { path } => {
            let file = WhisperFile::open_readonly(&path, open_options(lock, false, true))?;
            let info = file.info();
            println!("Meta data:");
            println!("  aggregation method: {}", info.aggregation_method);
            println!("  max retention: {}", info.max_retention);
            println!("  xFilesFactor: {}", info.x_files_factor);
            for (i, a) in info.archives.iter().enumerate() {
                println!();
                println!("Archive {} info:", i);
                println!("  offset: {}", a.offset);
                println!("  seconds per point: {}", a.seconds_per_point);
                println!("  points: {}", a.points);
                println!("  retention: {}", a.retention);
                println!("  size: {}", a.size_bytes);
                println!();
                println!("Archive {} data:", i);
                for (slot, point) in file.dump_archive(i)?.iter().enumerate() {
                    println!("{}: {}, {:>10}", slot, point.timestamp, point.value);
                }
            }
        }

        Command::Merge {
            src,
            dst,
            from,
            until,
        } => {
            bulk::merge(&src, &dst, from, until, &open_options(lock, flush, false))?;
        }

        Command::Fill { src, dst } => {
            bulk::fill(&src, &dst, &open_options(lock, flush, false))?;
        }

        Command::Diff {
            a,
            b,
            ignore_empty,
            json,
        } => {
            let results = bulk::diff(&a, &b, ignore_empty, None, &open_options(lock, false, false))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results).map_err(to_io)?);
            } else {
                for archive in &results {
                    println!(
                        "Archive {} ({} of {} datapoints differ)",
                        archive.archive_index,
                        archive.diffs.len(),
                        archive.points
                    );
                    for d in &archive.diffs {
                        println!(
                            "{}\t{}\t{}",
                            d.timestamp,
                            format_value(d.a),
                            format_value(d.b)
                        );
                    }
                }
            }
        }

        Command::Resize {
            path,
            retentions,
            x_files_factor,
            aggregation_method,
            force,
            aggregate,
            newfile,
            nobackup,
        } => {
            let archives = parse_retentions(&retentions)?;
            resize(
                &path,
                &archives,
                &ResizeOptions {
                    x_files_factor,
                    aggregation_method,
                    force,
                    aggregate,
                    newfile,
                    nobackup,
                },
                &open_options(lock, flush, false),
            )?;
            println!("Resized: {}", path.display());
        }

        Command::SetAggregation {
            path,
            method,
            x_files_factor,
        } => {
            let mut file = WhisperFile::open_with(&path, open_options(lock, flush, false))?;
            let old = file.set_aggregation_method(method, x_files_factor)?;
            println!(
                "Updated aggregation method: {} ({} -> {})",
                path.display(),
                old,
                method
            );
        }

        Command::SetXff {
            path,
            x_files_factor,
        } => {
            let mut file = WhisperFile::open_with(&path, open_options(lock, flush, false))?;
            let old = file.set_x_files_factor(x_files_factor)?;
            println!(
                "Updated xFilesFactor: {} ({} -> {})",
                path.display(),
                old,
                x_files_factor
            );
        }
    }
    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

fn to_io(e: serde_json::Error) -> WhisperError {
    WhisperError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}
