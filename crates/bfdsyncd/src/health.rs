//! Health polling and terminal failure reporting.
//!
//! The poller runs on its own OS thread and shares nothing with the intake
//! loop except the [`FailureReporter`]. Probes look at the segment from the
//! outside (the backing file), never through the session store's lock.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sonic_shm_arena::layout::{DESCRIPTOR_LEN, HEADER_LEN};
use sonic_shm_arena::{SegmentHeader, SegmentLayout};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditRecord};
use crate::security_audit;

/// Health check status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Still functional; logged and re-checked on the next poll.
    Degraded(String),
    /// The daemon cannot continue.
    Unhealthy(String),
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded(_) => "degraded",
            HealthStatus::Unhealthy(_) => "unhealthy",
        }
    }
}

/// One health check.
pub trait HealthProbe: Send {
    fn name(&self) -> &'static str;
    fn check(&self) -> HealthStatus;
}

/// Checks that the segment's backing file still exists, has the expected
/// size, and still carries a header for the layout this process mapped.
pub struct SegmentFileProbe {
    path: PathBuf,
    layout: SegmentLayout,
}

impl SegmentFileProbe {
    pub fn new(path: impl Into<PathBuf>, layout: SegmentLayout) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }
}

impl HealthProbe for SegmentFileProbe {
    fn name(&self) -> &'static str {
        "segment_file"
    }

    fn check(&self) -> HealthStatus {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                return HealthStatus::Unhealthy(format!("{}: {}", self.path.display(), e));
            }
        };

        let expected = self.layout.total_len() as u64;
        match file.metadata() {
            Ok(meta) if meta.len() != expected => {
                return HealthStatus::Unhealthy(format!(
                    "{} is {} bytes, expected {}",
                    self.path.display(),
                    meta.len(),
                    expected
                ));
            }
            Ok(_) => {}
            Err(e) => return HealthStatus::Degraded(format!("stat failed: {}", e)),
        }

        let mut header = vec![0u8; HEADER_LEN + self.layout.descriptors().len() * DESCRIPTOR_LEN];
        if let Err(e) = file.read_exact(&mut header) {
            return HealthStatus::Degraded(format!("header read failed: {}", e));
        }
        match SegmentHeader::decode(&header) {
            Ok(header) => match self.layout.check_matches(&header) {
                Ok(()) => HealthStatus::Healthy,
                Err(detail) => HealthStatus::Unhealthy(format!("segment replaced: {}", detail)),
            },
            Err(e) => HealthStatus::Unhealthy(format!("segment header unreadable: {}", e)),
        }
    }
}

/// Single path through which the poller and the intake loop report a
/// terminal failure. The first report wins and requests shutdown.
#[derive(Debug)]
pub struct FailureReporter {
    shutdown: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
}

impl FailureReporter {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            shutdown,
            failure: Mutex::new(None),
        })
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Records a terminal failure and requests shutdown.
    pub fn report(&self, source: &str, detail: impl Into<String>) {
        let detail = detail.into();
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                debug!(source, detail = %detail, "additional failure after shutdown request");
                return;
            }
            *failure = Some(format!("{}: {}", source, detail));
        }

        security_audit!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            source,
            "terminal_failure"
        )
        .with_error(detail));
        self.shutdown.send_replace(true);
    }

    /// Ordinary shutdown, e.g. on a signal.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// First reported failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// Runs probes at a fixed interval.
pub struct HealthPoller {
    probes: Vec<Box<dyn HealthProbe>>,
    interval: Duration,
    reporter: Arc<FailureReporter>,
}

impl HealthPoller {
    pub fn new(interval: Duration, reporter: Arc<FailureReporter>) -> Self {
        Self {
            probes: Vec::new(),
            interval,
            reporter,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Runs every probe once. Returns the worst status seen; an unhealthy
    /// probe is reported as a terminal failure.
    pub fn poll_once(&self) -> HealthStatus {
        let mut worst = HealthStatus::Healthy;
        for probe in &self.probes {
            match probe.check() {
                HealthStatus::Healthy => {}
                HealthStatus::Degraded(detail) => {
                    warn!(probe = probe.name(), detail = %detail, "health degraded");
                    if worst == HealthStatus::Healthy {
                        worst = HealthStatus::Degraded(detail);
                    }
                }
                HealthStatus::Unhealthy(detail) => {
                    self.reporter.report(probe.name(), detail.clone());
                    return HealthStatus::Unhealthy(detail);
                }
            }
        }
        worst
    }

    /// Starts the poller thread.
    pub fn spawn(self) -> std::io::Result<HealthHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("bfd-health".to_string())
            .spawn(move || {
                info!(
                    interval_secs = self.interval.as_secs(),
                    probes = self.probes.len(),
                    "health poller started"
                );
                loop {
                    match stopped.recv_timeout(self.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let HealthStatus::Unhealthy(_) = self.poll_once() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("health poller stopped");
            })?;
        Ok(HealthHandle { stop, join })
    }
}

/// Owner of a running poller thread.
pub struct HealthHandle {
    stop: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl HealthHandle {
    pub fn stop(self) {
        // The thread may already have exited after a failure
        let _ = self.stop.send(());
        if self.join.join().is_err() {
            warn!("health poller thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session_layout;
    use pretty_assertions::assert_eq;
    use sonic_shm_arena::{SegmentConfig, SharedSegment};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(HealthStatus, Arc<AtomicUsize>);

    impl HealthProbe for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn check(&self) -> HealthStatus {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone()
        }
    }

    #[test]
    fn test_health_status_strings() {
        assert_eq!(HealthStatus::Healthy.as_str(), "healthy");
        assert_eq!(HealthStatus::Degraded(String::new()).as_str(), "degraded");
        assert_eq!(HealthStatus::Unhealthy(String::new()).as_str(), "unhealthy");
    }

    #[test]
    fn test_reporter_first_failure_wins() {
        let reporter = FailureReporter::new();
        let rx = reporter.subscribe();
        assert!(!reporter.is_shutdown());

        reporter.report("segment_file", "gone");
        reporter.report("intake", "later");

        assert!(*rx.borrow());
        assert_eq!(reporter.failure().as_deref(), Some("segment_file: gone"));
    }

    #[test]
    fn test_request_shutdown_is_not_a_failure() {
        let reporter = FailureReporter::new();
        reporter.request_shutdown();
        assert!(reporter.is_shutdown());
        assert!(reporter.failure().is_none());
    }

    #[test]
    fn test_poll_once_reports_unhealthy() {
        let reporter = FailureReporter::new();
        let checks = Arc::new(AtomicUsize::new(0));
        let poller = HealthPoller::new(Duration::from_secs(1), reporter.clone())
            .with_probe(Box::new(FixedProbe(
                HealthStatus::Degraded("slow".into()),
                checks.clone(),
            )))
            .with_probe(Box::new(FixedProbe(
                HealthStatus::Unhealthy("broken".into()),
                checks.clone(),
            )));

        assert_eq!(poller.poll_once(), HealthStatus::Unhealthy("broken".into()));
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert!(reporter.is_shutdown());
    }

    #[test]
    fn test_poller_thread_stops_on_request() {
        let reporter = FailureReporter::new();
        let checks = Arc::new(AtomicUsize::new(0));
        let handle = HealthPoller::new(Duration::from_millis(5), reporter.clone())
            .with_probe(Box::new(FixedProbe(HealthStatus::Healthy, checks.clone())))
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert!(checks.load(Ordering::SeqCst) > 0);
        assert!(!reporter.is_shutdown());
    }

    #[test]
    fn test_segment_file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bfd.seg");
        let layout = session_layout(4).unwrap();
        let segment = SharedSegment::open(&SegmentConfig::new(&path), layout.clone()).unwrap();

        let probe = SegmentFileProbe::new(&path, layout.clone());
        assert_eq!(probe.check(), HealthStatus::Healthy);

        // Reinitialised for a different capacity by someone else
        let other = session_layout(8).unwrap();
        let probe_other = SegmentFileProbe::new(&path, other);
        assert!(matches!(probe_other.check(), HealthStatus::Unhealthy(_)));

        segment.destroy().unwrap();
        assert!(matches!(probe.check(), HealthStatus::Unhealthy(_)));
    }
}
