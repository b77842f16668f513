//! Progress reporting for long-running operations.
//!
//! Ingestion reports `(message, percent)` pairs through a [`ProgressReporter`].
//! Library callers can pass any `Fn(&str, u8)` closure; the CLI picks a
//! reporter from [`ProgressMode`]. CLI progress goes to **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;

/// Receives progress updates. Called synchronously from the ingesting thread.
pub trait ProgressReporter: Send + Sync {
    /// `percent` is clamped to `0..=100` by callers.
    fn report(&self, message: &str, percent: u8);
}

impl<F> ProgressReporter for F
where
    F: Fn(&str, u8) + Send + Sync,
{
    fn report(&self, message: &str, percent: u8) {
        self(message, percent)
    }
}

/// Human-friendly progress on stderr: `[ 40%] embedding 12 chunks of report.pdf`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, message: &str, percent: u8) {
        let line = format!("[{:>3}%] {}\n", percent.min(100), message);
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, message: &str, percent: u8) {
        let obj = serde_json::json!({
            "event": "progress",
            "message": message,
            "percent": percent.min(100),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _message: &str, _percent: u8) {}
}

/// Percentage of `done` out of `total`, 100 when `total` is zero.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.min(total) * 100) / total) as u8
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn percent_is_bounded() {
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(9, 4), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Mutex::new(Vec::new());
        let cb = |msg: &str, pct: u8| seen.lock().unwrap().push((msg.to_string(), pct));
        let reporter: &dyn ProgressReporter = &cb;
        reporter.report("extracting", 10);
        reporter.report("done", 100);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
