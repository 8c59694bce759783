//! Text loggers, dashboard sink and experiment tracker used by the
//! orchestrator. Every sink is an explicit handle; nothing is looked up
//! by name at runtime.

pub mod dashboard;
pub mod tracker;

pub use dashboard::{DashboardSink, FileDashboard};
pub use tracker::{ExperimentTracker, LocalTracker};

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{warn, LevelFilter};
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

pub fn init_logger(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .init();
}

/// A named logger appending timestamped lines to `{dir}/{file_stem}.log`,
/// optionally mirrored to the console through the `log` facade.
pub struct RunLogger {
    name: String,
    file: Option<Mutex<LineWriter<File>>>,
    screen: bool,
}

impl RunLogger {
    pub fn create(name: &str, dir: &Path, file_stem: &str, screen: bool) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.log", file_stem));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        Ok(Self {
            name: name.to_string(),
            file: Some(Mutex::new(LineWriter::new(file))),
            screen,
        })
    }

    /// Console-only logger.
    pub fn console(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: None,
            screen: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self, message: &str) {
        if let Some(file) = &self.file {
            let line = format!(
                "{} - INFO: {}",
                chrono::Local::now().format("%y-%m-%d %H:%M:%S%.3f"),
                message
            );
            match file.lock() {
                Ok(mut writer) => {
                    if let Err(e) = writeln!(writer, "{}", line) {
                        warn!("Failed to write to {} log: {}", self.name, e);
                    }
                }
                Err(_) => warn!("{} log writer poisoned", self.name),
            }
        }
        if self.screen {
            log::info!(target: self.name.as_str(), "{}", message);
        }
    }
}

/// Python-style scientific notation with four fractional digits and a
/// signed two-digit exponent, e.g. `1.2346e-02`.
pub fn sci(value: f64) -> String {
    if !value.is_finite() {
        return format!("{}", value);
    }
    let formatted = format!("{:.4e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => formatted,
    }
}

/// Thousands-separated integer, e.g. `12,000`.
pub fn grouped(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `<epoch:  3, iter:   1,000>` prefix shared by the train and val loggers.
pub fn progress_prefix(epoch: usize, step: usize) -> String {
    format!("<epoch:{:3}, iter:{:>8}>", epoch, grouped(step))
}
