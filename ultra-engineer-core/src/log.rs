//! Timestamped logging helpers.
//!
//! Plain `println!`/`eprintln!` lines
//! prefixed with a wall-clock timestamp — no logging crate, no log levels
//! beyond "normal" and "verbose". `--log-file` additionally mirrors
//! every line to a file opened once at startup via [`set_log_file`].

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<Option<File>>> = OnceLock::new();

/// Opens (creating/appending) the given path as the mirror destination for
/// every subsequent `info`/`warn` line. Call once at process startup.
pub fn set_log_file(path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let cell = LOG_FILE.get_or_init(|| Mutex::new(None));
    *cell.lock().expect("log file mutex poisoned") = Some(file);
    Ok(())
}

fn mirror_to_file(line: &str) {
    if let Some(cell) = LOG_FILE.get() {
        if let Some(file) = cell.lock().expect("log file mutex poisoned").as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Current local time as `HH:MM:SS`, for prefixing log lines.
pub fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Print an informational line, prefixed with the timestamp and an optional scope tag.
///
/// `scope` is typically `"repo#42"` or a bare repo name; pass `""` for global lines.
pub fn info(scope: &str, msg: &str) {
    let line = if scope.is_empty() {
        format!("[{}] {}", timestamp(), msg)
    } else {
        format!("[{}] [{}] {}", timestamp(), scope, msg)
    };
    println!("{line}");
    mirror_to_file(&line);
}

/// Print a warning line to stderr.
pub fn warn(scope: &str, msg: &str) {
    let line = if scope.is_empty() {
        format!("[{}] WARN: {}", timestamp(), msg)
    } else {
        format!("[{}] [{}] WARN: {}", timestamp(), scope, msg)
    };
    eprintln!("{line}");
    mirror_to_file(&line);
}

/// Print a line only when verbose logging is enabled.
pub fn verbose(enabled: bool, scope: &str, msg: &str) {
    if enabled {
        info(scope, msg);
    }
}
