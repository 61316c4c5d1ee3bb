// ── Stream connection diagnostics ──
//
// Every stream connection attempt ends in exactly one record: success on the
// first event, failure when the attempt errors out.

use std::sync::Mutex;

use serde::Serialize;

/// Receives the outcome of each stream connection attempt.
pub trait DiagnosticsRecorder: Send + Sync {
    /// `timestamp` is when the attempt started (epoch millis).
    fn record_stream_init(&self, timestamp: i64, failed: bool, duration_millis: u64);
}

/// One stream connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInitRecord {
    pub timestamp: i64,
    pub failed: bool,
    pub duration_millis: u64,
}

/// Buffers records until the next diagnostic event drains them.
#[derive(Debug, Default)]
pub struct InMemoryDiagnostics {
    stream_inits: Mutex<Vec<StreamInitRecord>>,
}

impl InMemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything recorded so far.
    pub fn take_stream_inits(&self) -> Vec<StreamInitRecord> {
        std::mem::take(&mut *self.stream_inits.lock().expect("diagnostics lock poisoned"))
    }
}

impl DiagnosticsRecorder for InMemoryDiagnostics {
    fn record_stream_init(&self, timestamp: i64, failed: bool, duration_millis: u64) {
        self.stream_inits
            .lock()
            .expect("diagnostics lock poisoned")
            .push(StreamInitRecord {
                timestamp,
                failed,
                duration_millis,
            });
    }
}
