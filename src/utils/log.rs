// src/utils/log.rs

//! Console run reports with server-style formatting.
//!
//! Library internals log through the `log` facade; the CLI renders its
//! human-facing reports (section headers, one line per site, summaries)
//! through these helpers so they carry the same timestamp and level prefix.

use std::sync::OnceLock;

use chrono::Local;

/// Report verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

/// Outcome marker of one line in a site listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Ok,
    Warn,
    Fail,
    Idle,
}

impl Mark {
    fn symbol(self) -> &'static str {
        match self {
            Mark::Ok => "✓",
            Mark::Warn => "!",
            Mark::Fail => "✗",
            Mark::Idle => "·",
        }
    }

    fn level(self) -> Level {
        match self {
            Mark::Ok | Mark::Idle => Level::Info,
            Mark::Warn => Level::Warn,
            Mark::Fail => Level::Error,
        }
    }
}

static THRESHOLD: OnceLock<Level> = OnceLock::new();

/// Set the report threshold from a level name (`debug`, `info`, ...).
pub fn init(level: &str) {
    let _ = THRESHOLD.set(Level::parse(level));
}

fn enabled(level: Level) -> bool {
    level >= THRESHOLD.get().copied().unwrap_or(Level::Info)
}

fn line(level: Level, message: &str) -> String {
    format!(
        "[{}] [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level.label(),
        message
    )
}

fn emit(level: Level, message: &str) {
    if !enabled(level) {
        return;
    }
    if level >= Level::Warn {
        eprintln!("{}", line(level, message));
    } else {
        println!("{}", line(level, message));
    }
}

pub fn warn(message: &str) {
    emit(Level::Warn, message);
}

pub fn error(message: &str) {
    emit(Level::Error, message);
}

/// Final success line; printed regardless of the threshold.
pub fn success(message: &str) {
    println!("{}", line(Level::Info, message));
}

/// Section banner.
pub fn header(title: &str) {
    let border = "═".repeat(60);
    emit(Level::Info, &border);
    emit(Level::Info, &format!("  {}", title));
    emit(Level::Info, &border);
}

/// Indented detail line.
pub fn sub_item(message: &str) {
    emit(Level::Info, &format!("    {}", message));
}

/// One site in a listing, e.g. `✓ casa-leiloes  12 extracted`.
pub fn site(mark: Mark, site_id: &str, detail: &str) {
    emit(mark.level(), &site_line(mark, site_id, detail));
}

fn site_line(mark: Mark, site_id: &str, detail: &str) -> String {
    format!("  {} {:<24} {}", mark.symbol(), site_id, detail)
}

/// Titled block of key/value pairs with aligned values.
pub fn summary(title: &str, items: &[(&str, String)]) {
    if !enabled(Level::Info) {
        return;
    }
    println!();
    emit(Level::Info, &format!("[SUMMARY] {}", title));
    let width = items.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    for (key, value) in items {
        emit(Level::Info, &format!("    {:<width$}  {}", key, value, width = width));
    }
}
