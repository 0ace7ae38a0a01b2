use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use tracing::{Level, event};

pub const PROGRESS_TRACE_TARGET: &str = "retouch::progress";

static PROGRESS_BARS: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

pub fn progress_bar(filename: &str) -> ProgressBar {
    let pb = PROGRESS_BARS.add(ProgressBar::new_spinner());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
        )
        .expect("set progress bar style"),
    );
    pb.set_message(filename.to_string());
    pb
}

/// Mirrors download progress as trace events so subscribers can follow it
/// without a terminal. Clones share the byte counter, so parallel chunk
/// downloads report a single running total.
#[derive(Debug, Clone)]
pub struct Emitter {
    filename: String,
    total: u64,
    current: Arc<AtomicU64>,
}

impl Emitter {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            total: 0,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn begin(&mut self, total: u64) {
        self.total = total;
        self.current.store(0, Ordering::Relaxed);
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "started",
            filename = %self.filename,
            total
        );
    }

    pub fn advance(&self, delta: u64) {
        if delta == 0 {
            return;
        }

        let current = self.current.fetch_add(delta, Ordering::Relaxed) + delta;
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "progress",
            filename = %self.filename,
            current,
            total = self.total
        );
    }

    pub fn complete(&self) {
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "finished",
            filename = %self.filename,
            current = self.current()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::Emitter;

    #[test]
    fn emitter_accumulates_across_clones() {
        let mut emitter = Emitter::new("weights.safetensors");
        emitter.begin(10);
        let chunk = emitter.clone();
        emitter.advance(4);
        chunk.advance(0);
        chunk.advance(3);
        assert_eq!(emitter.current(), 7);

        emitter.begin(5);
        assert_eq!(emitter.current(), 0);
        emitter.complete();
    }
}
