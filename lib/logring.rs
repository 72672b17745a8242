//! In-memory record of accessor calls.
//!
//! Every outbound remote call is recorded here (when verbose recording is
//! on) in addition to the `tracing` event the retry wrapper emits. The ring
//! is bounded; old records fall off the front. A pluggable sink sees every
//! record regardless of the bound.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One completed accessor call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Accessor operation name, e.g. `"ListEntries"`.
    pub call: &'static str,
    /// Remote path the call operated on.
    pub path: String,
    /// How many retries were needed (0 = first attempt succeeded).
    pub retries: u32,
    /// Wall time across all attempts.
    pub walltime: Duration,
    /// The final error, if the call ultimately failed.
    pub error: Option<String>,
}

impl std::fmt::Display for CallRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} retries={} walltime={:?}",
            self.call, self.path, self.retries, self.walltime
        )?;
        if let Some(err) = &self.error {
            write!(f, " error={err}")?;
        }
        Ok(())
    }
}

/// External handler invoked for every record as it is appended.
pub type LogSink = Box<dyn Fn(&CallRecord) + Send + Sync>;

struct RingInner {
    records: VecDeque<CallRecord>,
    sink: Option<LogSink>,
}

/// Bounded ring buffer of [`CallRecord`]s, safe for concurrent use.
pub struct CallLog {
    inner: Mutex<RingInner>,
    capacity: usize,
    verbose: bool,
}

impl CallLog {
    /// Default number of records kept.
    pub const DEFAULT_CAPACITY: usize = 4096;

    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self::with_capacity(verbose, Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(verbose: bool, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                records: VecDeque::new(),
                sink: None,
            }),
            capacity,
            verbose,
        }
    }

    /// Install a sink that observes every subsequent record.
    pub fn set_sink(&self, sink: LogSink) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sink = Some(sink);
    }

    /// Append a record. Ring retention only applies when verbose recording
    /// is enabled; the sink always fires.
    pub fn record(&self, record: CallRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = &inner.sink {
            sink(&record);
        }
        if !self.verbose && record.error.is_none() {
            return;
        }
        if inner.records.len() == self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
    }

    /// Snapshot of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CallRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.iter().cloned().collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rec(call: &'static str, err: Option<&str>) -> CallRecord {
        CallRecord {
            call,
            path: "/x".to_owned(),
            retries: 0,
            walltime: Duration::from_millis(1),
            error: err.map(str::to_owned),
        }
    }

    #[test]
    fn verbose_ring_retains_and_rotates() {
        let log = CallLog::with_capacity(true, 2);
        log.record(rec("A", None));
        log.record(rec("B", None));
        log.record(rec("C", None));
        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].call, "B");
        assert_eq!(snap[1].call, "C");
    }

    #[test]
    fn quiet_ring_keeps_only_failures() {
        let log = CallLog::new(false);
        log.record(rec("A", None));
        log.record(rec("B", Some("boom")));
        let snap = log.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].call, "B");
    }

    #[test]
    fn sink_sees_every_record() {
        let seen = Arc::new(AtomicUsize::new(0));
        let log = CallLog::new(false);
        let counter = Arc::clone(&seen);
        log.set_sink(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        log.record(rec("A", None));
        log.record(rec("B", Some("boom")));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
