// src/session.rs - Scan epochs: detect once, then track and classify until the epoch expires
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;
use nalgebra::Point2;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{CasterConfig, FaultPolicy, PreprocessConfig, SessionConfig};
use crate::detect::{CandidateDetector, Detect};
use crate::dispatch::ActionDispatcher;
use crate::gesture::{Gesture, GestureClassifier};
use crate::overlay::{Marker, Overlay, RenderSink};
use crate::tracking::{FlowResult, PointTracker, TrackingFault};
use crate::video::{grayscale, CaptureError, Frame, FrameSource};

/// Process-wide stop request, set by ctrl-c or the viewer.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Epoch expiry as seen by the session loop. At most one expiry is pending
/// at a time and arming discards any earlier one.
pub trait EpochSignal: Send {
    fn arm(&mut self, period: Duration);
    fn expired(&mut self) -> bool;
}

/// Runs each epoch's countdown as a tokio task feeding a one-slot channel.
pub struct EpochTimer {
    handle: Handle,
    tx: mpsc::Sender<u64>,
    rx: mpsc::Receiver<u64>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl EpochTimer {
    pub fn new(handle: Handle) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            handle,
            tx,
            rx,
            generation: 0,
            task: None,
        }
    }
}

impl EpochSignal for EpochTimer {
    fn arm(&mut self, period: Duration) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        while self.rx.try_recv().is_ok() {}

        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        self.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(period).await;
            let _ = tx.try_send(generation);
        }));
    }

    fn expired(&mut self) -> bool {
        while let Ok(generation) = self.rx.try_recv() {
            if generation == self.generation {
                return true;
            }
        }
        false
    }
}

impl Drop for EpochTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Rolling frame-rate estimate over the last 30 frames.
#[derive(Debug, Default)]
pub struct FrameTiming {
    intervals: VecDeque<f32>,
    last: Option<Instant>,
}

impl FrameTiming {
    const WINDOW: usize = 30;

    pub fn tick(&mut self, at: Instant) {
        if let Some(last) = self.last {
            self.intervals.push_front(at.saturating_duration_since(last).as_secs_f32());
            if self.intervals.len() > Self::WINDOW {
                self.intervals.pop_back();
            }
        }
        self.last = Some(at);
    }

    pub fn fps(&self) -> f32 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let avg = self.intervals.iter().sum::<f32>() / self.intervals.len() as f32;
        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub id: usize,
    pub position: Point2<f32>,
}

#[derive(Debug, Default)]
pub struct StepReport {
    pub casts: Vec<(usize, Gesture)>,
    pub markers: Vec<Marker>,
    pub dropped: usize,
}

/// Everything that belongs to one epoch. Replaced wholesale when a new
/// epoch starts.
pub struct SessionState {
    epoch: u64,
    prev_gray: GrayImage,
    tracks: Vec<Track>,
    overlay: Overlay,
}

impl SessionState {
    pub fn new(epoch: u64, gray: GrayImage, candidates: Vec<Point2<f32>>) -> Self {
        let overlay = Overlay::new(gray.width(), gray.height());
        let tracks = candidates
            .into_iter()
            .enumerate()
            .map(|(id, position)| Track { id, position })
            .collect();
        Self {
            epoch,
            prev_gray: gray,
            tracks,
            overlay,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn positions(&self) -> Vec<Point2<f32>> {
        self.tracks.iter().map(|t| t.position).collect()
    }

    /// Applies one frame of flow: lost tracks are dropped for the rest of the
    /// epoch, eligible tracks are classified, and short moves are traced.
    pub fn advance(
        &mut self,
        flow: &FlowResult,
        next_gray: GrayImage,
        classifier: &mut GestureClassifier,
        movement_threshold: f32,
    ) -> StepReport {
        let mut report = StepReport::default();
        let mut live = Vec::with_capacity(self.tracks.len());

        for (track, next) in self.tracks.drain(..).zip(flow.next.iter()) {
            let Some(new) = *next else {
                report.dropped += 1;
                continue;
            };

            if classifier.is_eligible(track.id) {
                if let Some(gesture) = classifier.classify(track.id, track.position, new) {
                    self.overlay.record_cast(gesture);
                    report.casts.push((track.id, gesture));
                }
                if nalgebra::distance(&track.position, &new) < movement_threshold {
                    self.overlay.trace(track.position, new);
                    report.markers.push(Marker {
                        track_id: track.id,
                        position: new,
                    });
                }
            }
            live.push(Track {
                id: track.id,
                position: new,
            });
        }

        self.tracks = live;
        self.prev_gray = next_gray;
        report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Detecting,
    Tracking,
    Expired,
    Failed(TrackingFault),
    Closed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Detecting => "detecting",
            Phase::Tracking => "tracking",
            Phase::Expired => "expired",
            Phase::Failed(_) => "failed",
            Phase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Cancelled,
    SourceExhausted,
    Faulted(TrackingFault),
}

/// `Err` carries the outcome of a session that has to end.
type Step = Result<Phase, SessionOutcome>;

pub struct SceneSession {
    config: SessionConfig,
    preprocess: PreprocessConfig,
    source: Box<dyn FrameSource>,
    sink: Box<dyn RenderSink>,
    detector: Box<dyn Detect>,
    tracker: PointTracker,
    classifier: GestureClassifier,
    dispatcher: ActionDispatcher,
    epoch_signal: Box<dyn EpochSignal>,
    shutdown: Shutdown,
    state: Option<SessionState>,
    phase: Phase,
    epochs: u64,
    timing: FrameTiming,
    outcome: Option<SessionOutcome>,
}

impl SceneSession {
    pub fn new(
        config: &CasterConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn RenderSink>,
        dispatcher: ActionDispatcher,
        epoch_signal: Box<dyn EpochSignal>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config: config.session.clone(),
            preprocess: config.preprocess.clone(),
            source,
            sink,
            detector: Box::new(CandidateDetector::new(config.detector.clone())),
            tracker: PointTracker::new(config.tracker.clone()),
            classifier: GestureClassifier::new(config.classifier.clone()),
            dispatcher,
            epoch_signal,
            shutdown,
            state: None,
            phase: Phase::Detecting,
            epochs: 0,
            timing: FrameTiming::default(),
            outcome: None,
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn Detect>) -> Self {
        self.detector = detector;
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn classifier(&self) -> &GestureClassifier {
        &self.classifier
    }

    /// Steps until the session closes.
    pub fn run(&mut self) -> SessionOutcome {
        tracing::debug!("scan started");
        loop {
            if let Some(outcome) = self.step() {
                return outcome;
            }
        }
    }

    /// Performs one transition or one tracking iteration. Returns the
    /// outcome once the session has closed.
    pub fn step(&mut self) -> Option<SessionOutcome> {
        if self.phase == Phase::Closed {
            return self.outcome.clone();
        }
        if self.shutdown.is_triggered() {
            return Some(self.close(SessionOutcome::Cancelled));
        }

        let previous = self.phase.name();
        let step = match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Detecting => self.detect_step(),
            Phase::Tracking => self.track_step(),
            Phase::Expired => Ok(Phase::Detecting),
            Phase::Failed(fault) => self.recover(fault),
            Phase::Closed => return self.outcome.clone(),
        };

        match step {
            Ok(next) => {
                if next.name() != previous {
                    tracing::debug!("{} -> {}", previous, next.name());
                }
                self.phase = next;
                None
            }
            Err(outcome) => Some(self.close(outcome)),
        }
    }

    fn capture(&mut self) -> Result<Option<Frame>, SessionOutcome> {
        match self.source.capture() {
            Ok(frame) => Ok(Some(frame)),
            Err(CaptureError::Exhausted) => Err(SessionOutcome::SourceExhausted),
            Err(CaptureError::Transient(e)) => {
                tracing::debug!("capture failed, retrying: {:#}", e);
                Ok(None)
            }
        }
    }

    fn detect_step(&mut self) -> Step {
        let Some(frame) = self.capture()? else {
            return Ok(Phase::Detecting);
        };
        let gray = grayscale(&frame.image, &self.preprocess);
        let candidates = self.detector.detect(&gray);

        self.epochs += 1;
        if candidates.is_empty() {
            tracing::debug!("epoch {}: no wand candidates", self.epochs);
        } else {
            tracing::debug!("epoch {}: tracking {} candidates", self.epochs, candidates.len());
        }

        self.classifier.reset();
        self.state = Some(SessionState::new(self.epochs, gray, candidates));
        self.epoch_signal.arm(self.config.epoch());
        self.timing.tick(frame.captured_at);
        Ok(Phase::Tracking)
    }

    fn track_step(&mut self) -> Step {
        if self.epoch_signal.expired() {
            tracing::debug!("epoch {} expired", self.epochs);
            return Ok(Phase::Expired);
        }
        let Some(frame) = self.capture()? else {
            return Ok(Phase::Tracking);
        };
        let gray = grayscale(&frame.image, &self.preprocess);
        let Some(state) = self.state.as_mut() else {
            return Ok(Phase::Detecting);
        };

        let flow = match self.tracker.track(&state.prev_gray, &state.positions(), &gray) {
            Ok(flow) => flow,
            Err(fault) => {
                tracing::error!("tracking fault in epoch {}: {}", state.epoch, fault);
                return Ok(Phase::Failed(fault));
            }
        };

        let report = state.advance(&flow, gray, &mut self.classifier, self.config.movement_threshold);
        if report.dropped > 0 {
            tracing::debug!(
                "epoch {}: lost {} tracks, {} remain",
                state.epoch,
                report.dropped,
                state.tracks.len()
            );
        }
        for (track_id, gesture) in &report.casts {
            tracing::debug!("track {} cast {}", track_id, gesture);
            self.dispatcher.dispatch(*gesture);
        }

        self.timing.tick(frame.captured_at);
        let composite = state
            .overlay
            .compose(&frame.image, report.markers, state.epoch, self.timing.fps());
        self.sink.show(&self.config.window_title, composite);
        Ok(Phase::Tracking)
    }

    fn recover(&mut self, fault: TrackingFault) -> Step {
        match self.config.fault_policy {
            FaultPolicy::Close => Err(SessionOutcome::Faulted(fault)),
            FaultPolicy::Restart => {
                tracing::warn!("restarting detection after tracking fault: {}", fault);
                self.state = None;
                Ok(Phase::Detecting)
            }
        }
    }

    fn close(&mut self, outcome: SessionOutcome) -> SessionOutcome {
        tracing::debug!("closing session: {:?}", outcome);
        self.source.release();
        self.sink.close(&self.config.window_title);
        self.state = None;
        self.phase = Phase::Closed;
        self.outcome = Some(outcome.clone());
        outcome
    }
}
