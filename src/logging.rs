//! Log sink setup.
//!
//! The subscriber is installed as the default for the calling thread only and
//! removed again when the returned `LogSink` is shut down or dropped. Every
//! component logs through the `tracing` macros and picks it up from there.
//!
//! File output is size bounded: once the active file would exceed
//! `max_file_size` it is renamed to `<file>.1`, older copies shift up one
//! number, and at most `max_files` of them are kept.

use crate::config::LoggingConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::dispatcher::{self, DefaultGuard};
use tracing::{warn, Dispatch};
use tracing_subscriber::EnvFilter;

/// Where log lines end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

/// Installed log subscriber. Logging stops when this is dropped.
pub struct LogSink {
    guard: Option<DefaultGuard>,
    destination: Destination,
}

impl LogSink {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Uninstall the subscriber.
    pub fn shutdown(mut self) {
        self.guard.take();
    }
}

/// Build the subscriber described by `config` and install it for this thread.
///
/// `RUST_LOG` overrides the configured level. A log file that cannot be opened
/// falls back to stdout with a warning; it never fails startup.
pub fn init(config: &LoggingConfig) -> LogSink {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut open_failure = None;
    let (dispatch, destination) = match &config.file {
        Some(path) => match RotatingFile::open(path, config.max_file_size, config.max_files) {
            Ok(file) => {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .finish();
                (Dispatch::new(subscriber), Destination::File(path.clone()))
            }
            Err(e) => {
                open_failure = Some((path.clone(), e));
                (stdout_dispatch(filter), Destination::Stdout)
            }
        },
        None => (stdout_dispatch(filter), Destination::Stdout),
    };

    let guard = dispatcher::set_default(&dispatch);
    if let Some((path, e)) = open_failure {
        warn!(path = %path.display(), error = %e, "Cannot open log file, logging to stdout");
    }

    LogSink {
        guard: Some(guard),
        destination,
    }
}

/// Append-only log file that rotates by size.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, keep: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            keep,
            file,
            written,
        })
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        name.into()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.keep == 0 {
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        } else {
            for n in (1..self.keep).rev() {
                let from = self.backup(n);
                if from.exists() {
                    fs::rename(&from, self.backup(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup(1))?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A record larger than the limit still goes into a fresh file whole.
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn stdout_dispatch(filter: EnvFilter) -> Dispatch {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    Dispatch::new(subscriber)
}
