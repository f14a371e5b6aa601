//! Traffic capture for post-mortem inspection of a session.
//!
//! A sink is handed to a session through [`crate::ConnectOptions`]. By default
//! nothing is captured.

use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

pub trait DiagnosticSink: Send + Sync + std::fmt::Debug {
    fn record(&self, direction: Direction, label: &str, bytes: &[u8]);

    /// Called once when the owning session stops
    fn flush(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn record(&self, _direction: Direction, _label: &str, _bytes: &[u8]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub direction: Direction,
    pub label: String,
    pub bytes: Vec<u8>,
}

/// Keeps the most recent traffic up to a byte budget, evicting oldest first.
#[derive(Debug)]
pub struct RingSink {
    capacity: usize,
    dump_path: Option<PathBuf>,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    records: VecDeque<CapturedRecord>,
    used: usize,
}

impl RingSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            dump_path: None,
            inner: Mutex::new(Ring::default()),
        }
    }

    /// Writes the captured records to `path` on flush
    pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        match self.inner.lock() {
            Ok(ring) => ring.records.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn render(records: &[CapturedRecord]) -> String {
        let mut out = String::new();
        for r in records {
            let arrow = match r.direction {
                Direction::Sent => ">>",
                Direction::Received => "<<",
            };
            let _ = write!(out, "{arrow} {} {} ", r.label, r.bytes.len());
            for b in &r.bytes {
                let _ = write!(out, "{b:02x}");
            }
            out.push('\n');
        }
        out
    }
}

impl DiagnosticSink for RingSink {
    fn record(&self, direction: Direction, label: &str, bytes: &[u8]) {
        if bytes.len() > self.capacity {
            return;
        }
        let Ok(mut ring) = self.inner.lock() else {
            return;
        };
        while ring.used + bytes.len() > self.capacity {
            match ring.records.pop_front() {
                Some(old) => ring.used -= old.bytes.len(),
                None => break,
            }
        }
        ring.used += bytes.len();
        ring.records.push_back(CapturedRecord {
            direction,
            label: label.to_string(),
            bytes: bytes.to_vec(),
        });
    }

    fn flush(&self) {
        let Some(path) = &self.dump_path else {
            return;
        };
        let records = self.records();
        debug!("Dumping {} captured records to {}", records.len(), path.display());
        if let Err(e) = std::fs::write(path, Self::render(&records)) {
            warn!("Unable to dump diagnostics to {}: {e}", path.display());
        }
    }
}
