//! The staged attendance pipeline.
//!
//! Three named OS threads joined by bounded crossbeam queues:
//!
//! ```text
//! capture ──frames (drop when full)──▶ recognize ──mark requests (drop when full)──▶ ledger
//! ```
//!
//! The recognize thread owns the engine, so there is never more than one
//! engine call in flight. The ledger thread is the only writer of the
//! attendance ledger. Shutdown cascades: the stop signal ends capture, whose
//! dropped sender ends recognize, whose dropped sender lets the ledger drain
//! and flush.

use crate::display::{DisplaySink, NullDisplay};
use crate::scheduler::{Identifier, Scheduler, StepOutcome};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rollcall_core::{
    compositor, AttendanceLedger, Clock, LedgerError, MarkOutcome, RecognitionEngine,
    SystemClock,
};
use rollcall_hw::{Frame, ReconnectingSource, SourceOpener, StopSignal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const FRAME_QUEUE_DEPTH: usize = 2;
pub const MARK_QUEUE_DEPTH: usize = 32;

/// Bounded retry for ledger writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Counters shared with the heartbeat.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames: AtomicU64,
    frames_dropped: AtomicU64,
    samples: AtomicU64,
    samples_discarded: AtomicU64,
    reconnects: AtomicU64,
    marks: AtomicU64,
    mark_requests_dropped: AtomicU64,
    ledger_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub frames_dropped: u64,
    pub samples: u64,
    pub samples_discarded: u64,
    pub reconnects: u64,
    pub marks: u64,
    pub mark_requests_dropped: u64,
    pub ledger_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            marks: self.marks.load(Ordering::Relaxed),
            mark_requests_dropped: self.mark_requests_dropped.load(Ordering::Relaxed),
            ledger_failures: self.ledger_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Final state after shutdown.
#[derive(Debug, Clone, Copy)]
pub struct PipelineReport {
    pub stats: StatsSnapshot,
    /// Whether the final ledger flush succeeded.
    pub ledger_flushed: bool,
}

struct MarkRequest {
    identity_id: String,
    display_name: String,
}

pub struct Pipeline<C: Clock + 'static = SystemClock> {
    opener: Box<dyn SourceOpener>,
    reconnect_backoff: Duration,
    scheduler: Scheduler,
    engine: Box<dyn RecognitionEngine>,
    identifier: Identifier,
    display: Box<dyn DisplaySink>,
    ledger: AttendanceLedger<C>,
    retry: RetryPolicy,
    frame_queue_depth: usize,
    stats: Arc<PipelineStats>,
}

impl<C: Clock + 'static> Pipeline<C> {
    pub fn new(
        opener: Box<dyn SourceOpener>,
        reconnect_backoff: Duration,
        scheduler: Scheduler,
        engine: Box<dyn RecognitionEngine>,
        identifier: Identifier,
        ledger: AttendanceLedger<C>,
    ) -> Self {
        Self {
            opener,
            reconnect_backoff,
            scheduler,
            engine,
            identifier,
            display: Box::new(NullDisplay),
            ledger,
            retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(200),
            },
            frame_queue_depth: FRAME_QUEUE_DEPTH,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_display(mut self, display: Box<dyn DisplaySink>) -> Self {
        self.display = display;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn with_frame_queue_depth(mut self, depth: usize) -> Self {
        self.frame_queue_depth = depth.max(1);
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `stop` fires and every stage has drained.
    pub fn run(self, stop: StopSignal) -> Result<PipelineReport> {
        let Self {
            opener,
            reconnect_backoff,
            mut scheduler,
            mut engine,
            identifier,
            mut display,
            mut ledger,
            retry,
            frame_queue_depth,
            stats,
        } = self;

        let (frame_tx, frame_rx) = bounded::<Frame>(frame_queue_depth);
        let (mark_tx, mark_rx) = bounded::<MarkRequest>(MARK_QUEUE_DEPTH);

        let ledger_stats = Arc::clone(&stats);
        let ledger_handle = thread::Builder::new()
            .name("rollcall-ledger".into())
            .spawn(move || run_ledger(&mut ledger, mark_rx, retry, &ledger_stats))
            .context("failed to spawn ledger thread")?;

        let recognize_stats = Arc::clone(&stats);
        let recognize_handle = thread::Builder::new()
            .name("rollcall-recognize".into())
            .spawn(move || {
                run_recognize(
                    &mut scheduler,
                    engine.as_mut(),
                    &identifier,
                    display.as_mut(),
                    frame_rx,
                    mark_tx,
                    &recognize_stats,
                )
            })
            .context("failed to spawn recognize thread")?;

        let capture_stats = Arc::clone(&stats);
        let capture_handle = thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || run_capture(opener, reconnect_backoff, stop, frame_tx, &capture_stats))
            .context("failed to spawn capture thread")?;

        capture_handle
            .join()
            .map_err(|_| anyhow!("capture thread panicked"))?;
        recognize_handle
            .join()
            .map_err(|_| anyhow!("recognize thread panicked"))?;
        let flushed = ledger_handle
            .join()
            .map_err(|_| anyhow!("ledger thread panicked"))?;

        Ok(PipelineReport {
            stats: stats.snapshot(),
            ledger_flushed: flushed,
        })
    }
}

fn run_capture(
    opener: Box<dyn SourceOpener>,
    backoff: Duration,
    stop: StopSignal,
    frame_tx: Sender<Frame>,
    stats: &PipelineStats,
) {
    let mut source = ReconnectingSource::new(opener, backoff, stop);
    while let Some(frame) = source.next_frame() {
        PipelineStats::bump(&stats.frames);
        stats.reconnects.store(source.reconnects(), Ordering::Relaxed);
        if frame.sequence == 0 {
            tracing::info!(
                width = frame.width(),
                height = frame.height(),
                brightness = frame.avg_brightness(),
                "first frame captured"
            );
        }
        match frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                PipelineStats::bump(&stats.frames_dropped);
                tracing::debug!(sequence = frame.sequence, "recognizer busy, frame dropped");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    stats.reconnects.store(source.reconnects(), Ordering::Relaxed);
    tracing::info!(reconnects = source.reconnects(), "capture stopped");
}

fn run_recognize(
    scheduler: &mut Scheduler,
    engine: &mut dyn RecognitionEngine,
    identifier: &Identifier,
    display: &mut dyn DisplaySink,
    frame_rx: Receiver<Frame>,
    mark_tx: Sender<MarkRequest>,
    stats: &PipelineStats,
) {
    for frame in frame_rx.iter() {
        match scheduler.step(&frame, engine, identifier) {
            StepOutcome::Reused => {}
            StepOutcome::Discarded => PipelineStats::bump(&stats.samples_discarded),
            StepOutcome::Sampled => {
                PipelineStats::bump(&stats.samples);
                for result in scheduler.overlay() {
                    let Some(identity_id) = result.label.identity_id() else {
                        continue;
                    };
                    let request = MarkRequest {
                        identity_id: identity_id.to_string(),
                        display_name: result.label.to_string(),
                    };
                    if let Err(TrySendError::Full(dropped)) = mark_tx.try_send(request) {
                        PipelineStats::bump(&stats.mark_requests_dropped);
                        tracing::warn!(
                            identity = %dropped.identity_id,
                            "ledger busy, mark request dropped"
                        );
                    }
                }
            }
        }

        if display.wants_frames() {
            let annotated = compositor::annotate(&frame.image, scheduler.overlay());
            if let Err(e) = display.show(&annotated) {
                tracing::warn!(error = %e, "display update failed");
            }
        }
    }
    tracing::info!("recognizer stopped");
}

/// Seam between the ledger stage and the ledger, so retries can be tested.
trait AttendanceSink {
    fn mark_now(&mut self, identity_id: &str, display_name: &str) -> Result<MarkOutcome, LedgerError>;
    fn flush(&mut self) -> Result<(), LedgerError>;
}

impl<C: Clock> AttendanceSink for AttendanceLedger<C> {
    fn mark_now(&mut self, identity_id: &str, display_name: &str) -> Result<MarkOutcome, LedgerError> {
        AttendanceLedger::mark_now(self, identity_id, display_name)
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        AttendanceLedger::flush(self)
    }
}

/// Drain mark requests until the recognizer hangs up, then flush. Returns
/// whether the flush succeeded.
fn run_ledger(
    sink: &mut impl AttendanceSink,
    mark_rx: Receiver<MarkRequest>,
    retry: RetryPolicy,
    stats: &PipelineStats,
) -> bool {
    for request in mark_rx.iter() {
        record_with_retry(sink, &request, retry, stats);
    }
    match sink.flush() {
        Ok(()) => {
            tracing::info!("attendance ledger flushed");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "final ledger flush failed");
            false
        }
    }
}

fn record_with_retry(
    sink: &mut impl AttendanceSink,
    request: &MarkRequest,
    retry: RetryPolicy,
    stats: &PipelineStats,
) {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        match sink.mark_now(&request.identity_id, &request.display_name) {
            Ok(MarkOutcome::Marked) => {
                PipelineStats::bump(&stats.marks);
                return;
            }
            Ok(MarkOutcome::AlreadyMarked) => return,
            Err(e) => {
                tracing::warn!(
                    identity = %request.identity_id,
                    attempt,
                    attempts,
                    error = %e,
                    "attendance write failed"
                );
                if attempt < attempts {
                    thread::sleep(retry.backoff * attempt);
                }
            }
        }
    }
    PipelineStats::bump(&stats.ledger_failures);
    tracing::error!(
        identity = %request.identity_id,
        "giving up on attendance write; identity stays unmarked until next detection"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{alice_gallery, PixelEngine};
    use chrono::{NaiveDate, NaiveDateTime};
    use image::{Rgb, RgbImage};
    use rollcall_core::compositor::{MATCHED_COLOR, UNKNOWN_COLOR};
    use rollcall_core::ledger::read_partition;
    use rollcall_core::EuclideanMatcher;
    use rollcall_hw::{stop_signal, FrameSource, SourceError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Clone)]
    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    fn morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap()
    }

    struct ScriptedSource {
        frames: VecDeque<RgbImage>,
    }

    impl FrameSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
            Ok(self.frames.pop_front())
        }
    }

    /// First open yields the scripted frames; later opens fail.
    struct OnceOpener {
        frames: Option<Vec<RgbImage>>,
    }

    impl SourceOpener for OnceOpener {
        fn open(&mut self) -> Result<Box<dyn FrameSource>, SourceError> {
            match self.frames.take() {
                Some(frames) => Ok(Box::new(ScriptedSource {
                    frames: frames.into(),
                })),
                None => Err(SourceError::Unavailable("scripted end".into())),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingDisplay {
        frames: Arc<Mutex<Vec<RgbImage>>>,
    }

    impl DisplaySink for RecordingDisplay {
        fn wants_frames(&mut self) -> bool {
            true
        }

        fn show(&mut self, frame: &RgbImage) -> Result<(), crate::display::DisplayError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_end_to_end_single_record_and_unknown_frame() {
        let dir = tempfile::tempdir().unwrap();
        // Red channel / 100 is the distance to Alice: 0.1, 1.2, 0.15.
        let frames = vec![
            RgbImage::from_pixel(64, 48, Rgb([10, 0, 0])),
            RgbImage::from_pixel(64, 48, Rgb([120, 0, 0])),
            RgbImage::from_pixel(64, 48, Rgb([15, 0, 0])),
        ];
        let ledger = AttendanceLedger::with_clock(dir.path(), FixedClock(morning())).unwrap();
        let display = RecordingDisplay::default();
        let shown = Arc::clone(&display.frames);

        let pipeline = Pipeline::new(
            Box::new(OnceOpener {
                frames: Some(frames),
            }),
            Duration::from_millis(10),
            Scheduler::new(1, 1.0),
            Box::new(PixelEngine::new()),
            Identifier::new(Box::new(EuclideanMatcher), alice_gallery(), 0.8),
            ledger,
        )
        .with_display(Box::new(display))
        .with_frame_queue_depth(8);
        let stats = pipeline.stats();

        let (trigger, signal) = stop_signal();
        let handle = thread::spawn(move || pipeline.run(signal));

        assert!(wait_for(Duration::from_secs(5), || shown.lock().unwrap().len() == 3));
        trigger.trigger();
        let report = handle.join().unwrap().unwrap();

        assert!(report.ledger_flushed);
        assert_eq!(report.stats.frames, 3);
        assert_eq!(report.stats.samples, 3);
        assert_eq!(report.stats.marks, 1);
        assert!(report.stats.reconnects >= 1);
        assert_eq!(stats.snapshot(), report.stats);

        let records = read_partition(dir.path(), morning().date()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity_id, "S001");
        assert_eq!(records[0].display_name, "Alice");

        // Face box left edge sits at x = 16; frame 2 was drawn as unknown.
        let shown = shown.lock().unwrap();
        assert_eq!(*shown[0].get_pixel(16, 30), MATCHED_COLOR);
        assert_eq!(*shown[1].get_pixel(16, 30), UNKNOWN_COLOR);
        assert_eq!(*shown[2].get_pixel(16, 30), MATCHED_COLOR);
    }

    #[test]
    fn test_stop_during_outage_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AttendanceLedger::with_clock(dir.path(), FixedClock(morning())).unwrap();
        let pipeline = Pipeline::new(
            Box::new(OnceOpener { frames: None }),
            Duration::from_secs(60),
            Scheduler::new(5, 0.5),
            Box::new(PixelEngine::new()),
            Identifier::new(Box::new(EuclideanMatcher), alice_gallery(), 0.8),
            ledger,
        );
        let stats = pipeline.stats();
        let (trigger, signal) = stop_signal();
        let handle = thread::spawn(move || pipeline.run(signal));

        // The first failed open puts capture into a 60 s backoff.
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        trigger.trigger();
        let report = handle.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.stats.frames, 0);
        assert_eq!(report.stats.reconnects, 1);
        assert_eq!(stats.snapshot().marks, 0);
    }

    struct FlakySink {
        failures_left: u32,
        marked: Vec<String>,
        calls: u32,
    }

    impl AttendanceSink for FlakySink {
        fn mark_now(&mut self, identity_id: &str, _name: &str) -> Result<MarkOutcome, LedgerError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(LedgerError::Write {
                    path: "/full/disk.csv".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
                });
            }
            if self.marked.iter().any(|m| m == identity_id) {
                return Ok(MarkOutcome::AlreadyMarked);
            }
            self.marked.push(identity_id.to_string());
            Ok(MarkOutcome::Marked)
        }

        fn flush(&mut self) -> Result<(), LedgerError> {
            Ok(())
        }
    }

    fn request(id: &str) -> MarkRequest {
        MarkRequest {
            identity_id: id.into(),
            display_name: "Alice".into(),
        }
    }

    const FAST_RETRY: RetryPolicy = RetryPolicy {
        attempts: 3,
        backoff: Duration::from_millis(1),
    };

    #[test]
    fn test_ledger_retry_recovers() {
        let stats = PipelineStats::default();
        let mut sink = FlakySink {
            failures_left: 2,
            marked: Vec::new(),
            calls: 0,
        };
        record_with_retry(&mut sink, &request("S001"), FAST_RETRY, &stats);
        assert_eq!(sink.calls, 3);
        assert_eq!(sink.marked, vec!["S001".to_string()]);
        assert_eq!(stats.snapshot().marks, 1);
        assert_eq!(stats.snapshot().ledger_failures, 0);
    }

    #[test]
    fn test_ledger_gives_up_then_next_detection_marks() {
        let stats = PipelineStats::default();
        let mut sink = FlakySink {
            failures_left: 3,
            marked: Vec::new(),
            calls: 0,
        };
        record_with_retry(&mut sink, &request("S001"), FAST_RETRY, &stats);
        assert!(sink.marked.is_empty());
        assert_eq!(stats.snapshot().ledger_failures, 1);

        // The identity was left unmarked, so the next detection records it.
        record_with_retry(&mut sink, &request("S001"), FAST_RETRY, &stats);
        assert_eq!(sink.marked, vec!["S001".to_string()]);
        record_with_retry(&mut sink, &request("S001"), FAST_RETRY, &stats);
        assert_eq!(stats.snapshot().marks, 1);
    }

    #[test]
    fn test_ledger_stage_drains_before_flush() {
        let stats = PipelineStats::default();
        let mut sink = FlakySink {
            failures_left: 0,
            marked: Vec::new(),
            calls: 0,
        };
        let (tx, rx) = bounded(MARK_QUEUE_DEPTH);
        for id in ["S001", "S002", "S001"] {
            tx.send(request(id)).unwrap();
        }
        drop(tx);
        assert!(run_ledger(&mut sink, rx, FAST_RETRY, &stats));
        assert_eq!(sink.marked, vec!["S001".to_string(), "S002".to_string()]);
    }
}
