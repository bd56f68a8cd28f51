// Gesture adapter - turns the noisy, asynchronously-arriving stream of
// hand-pose classifications into clean, rate-limited mode changes
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::ModeController;
use crate::types::{GestureEvent, Mode};

const SINGLE_CONFIDENCE: f32 = 0.55;
const COMBO_CONFIDENCE: f32 = 0.8;
const COMBO_CATEGORY: &str = "Pointing_Up";

/// Opaque frame handed from the camera feed to the recognizer. The adapter
/// only inspects the timestamp; the payload is the recognizer's business.
pub struct VideoFrame {
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

/// Camera-stream provider. Acquisition is asynchronous and fallible
/// (permission denied, missing device).
#[async_trait]
pub trait CameraProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn CameraFeed>>;
}

#[async_trait]
pub trait CameraFeed: Send {
    /// Wait for the next frame. None means the source closed.
    async fn next_frame(&mut self) -> Option<VideoFrame>;

    /// Release the underlying device. The inference loop calls this exactly
    /// once, on every exit path.
    fn release(&mut self);
}

/// Classifier factory; loading may fetch a model and take a while.
#[async_trait]
pub trait GestureModel: Send + Sync {
    async fn load(&self) -> Result<Box<dyn Recognizer>>;
}

pub trait Recognizer: Send {
    fn classify(&mut self, frame: &VideoFrame, timestamp_ms: u64) -> Result<Vec<GestureEvent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStage {
    Idle,
    ModelLoading,
    Ready,
    Error,
}

/// Observable adapter state for the status pane and the HTTP API.
#[derive(Clone)]
pub struct GestureStatus {
    stage: Arc<Mutex<AdapterStage>>,
    label: Arc<Mutex<Option<String>>>,
}

impl GestureStatus {
    fn new() -> Self {
        GestureStatus {
            stage: Arc::new(Mutex::new(AdapterStage::Idle)),
            label: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stage(&self) -> AdapterStage {
        *self.stage.lock().unwrap()
    }

    fn set_stage(&self, stage: AdapterStage) {
        *self.stage.lock().unwrap() = stage;
    }

    /// Most recently recognized gesture label, for UI feedback only.
    pub fn label(&self) -> Option<String> {
        self.label.lock().unwrap().clone()
    }

    fn set_label(&self, label: Option<String>) {
        *self.label.lock().unwrap() = label;
    }
}

/// Fixed gesture-category to mode lookup. Closed like the Mode enum itself;
/// unknown categories simply never match.
pub fn map_category(category: &str) -> Option<Mode> {
    match category {
        "Open_Palm" => Some(Mode::Scatter),
        "Closed_Fist" => Some(Mode::Tree),
        "Victory" | "ILoveYou" | "Thumb_Up" => Some(Mode::Heart),
        "Thumb_Down" => Some(Mode::Saturn),
        "Pointing_Up" => Some(Mode::Flower),
        _ => None,
    }
}

/// Decision rules applied to one classification result: the two-hand combo
/// takes priority over any single-hand mapping.
#[derive(Debug, Clone)]
pub struct GestureRules {
    pub single_confidence: f32,
    pub combo_confidence: f32,
    pub combo_category: String,
    pub combo_mode: Mode,
}

impl Default for GestureRules {
    fn default() -> Self {
        GestureRules {
            single_confidence: SINGLE_CONFIDENCE,
            combo_confidence: COMBO_CONFIDENCE,
            combo_category: COMBO_CATEGORY.to_string(),
            combo_mode: Mode::Dna,
        }
    }
}

impl GestureRules {
    /// Returns the mode to request (if any) and the label to surface.
    pub fn decide(&self, events: &[GestureEvent]) -> (Option<Mode>, Option<String>) {
        // Combo check: the paired category on two distinct hands, both above
        // the high-confidence bar, wins outright.
        let mut combo_hands: Vec<usize> = events
            .iter()
            .filter(|e| e.category == self.combo_category && e.confidence >= self.combo_confidence)
            .map(|e| e.hand_index)
            .collect();
        combo_hands.sort_unstable();
        combo_hands.dedup();
        if combo_hands.len() >= 2 {
            return (
                Some(self.combo_mode),
                Some(format!("{}+{}", self.combo_category, self.combo_category)),
            );
        }

        // Otherwise the single highest-confidence gesture across all hands.
        let best = events
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some(event) if event.confidence > self.single_confidence => {
                (map_category(&event.category), Some(event.category.clone()))
            }
            _ => (None, None),
        }
    }
}

/// Caps inference cost independent of frame rate: a frame is classified
/// only if it is new (timestamp changed) and the minimum interval elapsed.
pub struct InferenceThrottle {
    min_interval: Duration,
    last_run: Option<Instant>,
    last_frame_ts: Option<u64>,
}

impl InferenceThrottle {
    pub fn new(min_interval: Duration) -> Self {
        InferenceThrottle {
            min_interval,
            last_run: None,
            last_frame_ts: None,
        }
    }

    pub fn ready(&mut self, now: Instant, frame_ts: u64) -> bool {
        if self.last_frame_ts == Some(frame_ts) {
            return false;
        }
        if let Some(last) = self.last_run {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_run = Some(now);
        self.last_frame_ts = Some(frame_ts);
        true
    }
}

/// State machine over {Idle, ModelLoading, Ready, Error} driving a throttled
/// inference loop on its own tokio task. The render loop never learns this
/// component exists; all it ever does is call `ModeController::set_mode`.
pub struct GestureAdapter {
    controller: Arc<ModeController>,
    rules: Arc<GestureRules>,
    min_interval: Duration,
    status: GestureStatus,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl GestureAdapter {
    pub fn new(controller: Arc<ModeController>, rules: GestureRules, min_interval: Duration) -> Self {
        GestureAdapter {
            controller,
            rules: Arc::new(rules),
            min_interval,
            status: GestureStatus::new(),
            cancel: None,
            task: None,
        }
    }

    pub fn status(&self) -> GestureStatus {
        self.status.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Start the inference loop. No-op if it is already running.
    pub fn enable(&mut self, camera: Arc<dyn CameraProvider>, model: Arc<dyn GestureModel>) {
        if self.is_enabled() {
            return;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);
        self.status.set_stage(AdapterStage::ModelLoading);
        self.task = Some(tokio::spawn(run_inference_loop(
            self.controller.clone(),
            self.rules.clone(),
            self.status.clone(),
            self.min_interval,
            cancel_rx,
            camera,
            model,
        )));
    }

    /// Stop the inference loop. Safe to call in any stage; an in-flight
    /// model load or camera acquisition becomes a no-op on completion.
    pub fn disable(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
    }

    /// Wait for the loop to unwind (camera released, stage settled).
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_inference_loop(
    controller: Arc<ModeController>,
    rules: Arc<GestureRules>,
    status: GestureStatus,
    min_interval: Duration,
    mut cancel: watch::Receiver<bool>,
    camera: Arc<dyn CameraProvider>,
    model: Arc<dyn GestureModel>,
) {
    // Model load and camera acquisition both race against cancellation, so
    // teardown during startup cannot leave state updates behind.
    let recognizer = tokio::select! {
        loaded = model.load() => loaded,
        _ = cancel.changed() => {
            status.set_stage(AdapterStage::Idle);
            return;
        }
    };
    let mut recognizer = match recognizer {
        Ok(r) => r,
        Err(e) => {
            eprintln!("gesture model load failed: {}", e);
            status.set_stage(AdapterStage::Error);
            return;
        }
    };

    let feed = tokio::select! {
        acquired = camera.acquire() => acquired,
        _ = cancel.changed() => {
            status.set_stage(AdapterStage::Idle);
            return;
        }
    };
    let mut feed = match feed {
        Ok(f) => f,
        Err(e) => {
            eprintln!("camera acquisition failed: {}", e);
            status.set_stage(AdapterStage::Error);
            return;
        }
    };

    status.set_stage(AdapterStage::Ready);
    let mut throttle = InferenceThrottle::new(min_interval);

    loop {
        let frame = tokio::select! {
            frame = feed.next_frame() => frame,
            _ = cancel.changed() => break,
        };
        let Some(frame) = frame else { break };

        if !throttle.ready(Instant::now(), frame.timestamp_ms) {
            continue;
        }

        match recognizer.classify(&frame, frame.timestamp_ms) {
            Ok(events) => {
                let (mode, label) = rules.decide(&events);
                status.set_label(label);
                if let Some(mode) = mode {
                    if let Err(e) = controller.set_mode(mode) {
                        eprintln!("gesture mode change rejected: {}", e);
                    }
                }
            }
            // Transient: degrade to "no gesture this tick".
            Err(e) => eprintln!("gesture classification failed: {}", e),
        }
    }

    // Single exit point past acquisition: the device is released exactly
    // once, whether the loop ended by cancel or by source close.
    feed.release();
    status.set_label(None);
    status.set_stage(AdapterStage::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::GroupSpec;
    use crate::shapes::ShapeParams;
    use crate::types::GroupRole;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(category: &str, confidence: f32, hand: usize) -> GestureEvent {
        GestureEvent {
            category: category.to_string(),
            confidence,
            hand_index: hand,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_single_hand_mapping_above_threshold() {
        let rules = GestureRules::default();
        let (mode, label) = rules.decide(&[event("Open_Palm", 0.9, 0)]);
        assert_eq!(mode, Some(Mode::Scatter));
        assert_eq!(label.as_deref(), Some("Open_Palm"));
    }

    #[test]
    fn test_below_threshold_holds_state() {
        let rules = GestureRules::default();
        let (mode, label) = rules.decide(&[event("Closed_Fist", 0.4, 0)]);
        assert_eq!(mode, None);
        assert_eq!(label, None);
    }

    #[test]
    fn test_highest_confidence_wins_across_hands() {
        let rules = GestureRules::default();
        let (mode, _) = rules.decide(&[
            event("Closed_Fist", 0.6, 0),
            event("Thumb_Down", 0.85, 1),
        ]);
        assert_eq!(mode, Some(Mode::Saturn));
    }

    #[test]
    fn test_combo_beats_higher_confidence_single() {
        let rules = GestureRules::default();
        // Open_Palm scores highest, but both hands hold the combo category
        // above the combo bar: combo takes priority.
        let (mode, _) = rules.decide(&[
            event("Pointing_Up", 0.82, 0),
            event("Pointing_Up", 0.85, 1),
            event("Open_Palm", 0.99, 0),
        ]);
        assert_eq!(mode, Some(Mode::Dna));
    }

    #[test]
    fn test_combo_requires_two_distinct_hands() {
        let rules = GestureRules::default();
        let (mode, _) = rules.decide(&[
            event("Pointing_Up", 0.9, 0),
            event("Pointing_Up", 0.95, 0),
        ]);
        // Same hand twice is not a combo; single-hand mapping applies.
        assert_eq!(mode, Some(Mode::Flower));
    }

    #[test]
    fn test_single_pointing_up_maps_to_flower() {
        let rules = GestureRules::default();
        let (mode, label) = rules.decide(&[event("Pointing_Up", 0.7, 1)]);
        assert_eq!(mode, Some(Mode::Flower));
        assert_eq!(label.as_deref(), Some("Pointing_Up"));
    }

    #[test]
    fn test_throttle_interval_and_frame_dedup() {
        let mut throttle = InferenceThrottle::new(Duration::from_millis(200));
        let t0 = Instant::now();

        assert!(throttle.ready(t0, 1));
        // Same frame again: never reclassified, regardless of time.
        assert!(!throttle.ready(t0 + Duration::from_millis(500), 1));
        // New frame but inside the minimum interval.
        assert!(!throttle.ready(t0 + Duration::from_millis(100), 2));
        // New frame past the interval.
        assert!(throttle.ready(t0 + Duration::from_millis(250), 3));
    }

    // Scripted collaborators for the loop-level tests.

    struct ScriptedCamera {
        frames: Mutex<VecDeque<VideoFrame>>,
        hold_open: bool,
        released: Arc<AtomicUsize>,
    }

    struct ScriptedFeed {
        frames: VecDeque<VideoFrame>,
        hold_open: bool,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CameraProvider for ScriptedCamera {
        async fn acquire(&self) -> Result<Box<dyn CameraFeed>> {
            Ok(Box::new(ScriptedFeed {
                frames: std::mem::take(&mut *self.frames.lock().unwrap()),
                hold_open: self.hold_open,
                released: self.released.clone(),
            }))
        }
    }

    #[async_trait]
    impl CameraFeed for ScriptedFeed {
        async fn next_frame(&mut self) -> Option<VideoFrame> {
            match self.frames.pop_front() {
                Some(frame) => Some(frame),
                None if self.hold_open => {
                    // Block like a real camera waiting for light.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => None,
            }
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedModel {
        events: Vec<GestureEvent>,
        calls: Arc<AtomicUsize>,
    }

    struct ScriptedRecognizer {
        events: Vec<GestureEvent>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GestureModel for ScriptedModel {
        async fn load(&self) -> Result<Box<dyn Recognizer>> {
            Ok(Box::new(ScriptedRecognizer {
                events: self.events.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    impl Recognizer for ScriptedRecognizer {
        fn classify(&mut self, _frame: &VideoFrame, _ts: u64) -> Result<Vec<GestureEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.events.clone())
        }
    }

    fn test_controller() -> Arc<ModeController> {
        Arc::new(
            ModeController::bootstrap(
                Mode::Tree,
                &[GroupSpec {
                    role: GroupRole::Main,
                    count: 10,
                    damping: 2.0,
                }],
                ShapeParams::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_loop_applies_gesture_and_releases_camera_once() {
        let controller = test_controller();
        let released = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let camera = Arc::new(ScriptedCamera {
            frames: Mutex::new(VecDeque::from([VideoFrame {
                timestamp_ms: 1,
                data: Vec::new(),
            }])),
            hold_open: false,
            released: released.clone(),
        });
        let model = Arc::new(ScriptedModel {
            events: vec![event("Open_Palm", 0.9, 0)],
            calls: calls.clone(),
        });

        let mut adapter =
            GestureAdapter::new(controller.clone(), GestureRules::default(), Duration::ZERO);
        adapter.enable(camera, model);
        adapter.join().await;

        assert_eq!(controller.current_mode(), Mode::Scatter);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1, "camera released exactly once");
        assert_eq!(adapter.status().stage(), AdapterStage::Idle);
    }

    #[tokio::test]
    async fn test_disable_stops_pending_loop_and_releases_once() {
        let controller = test_controller();
        let released = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        // Camera delivers nothing and then blocks: disable must still
        // unwind the loop and release the device.
        let camera = Arc::new(ScriptedCamera {
            frames: Mutex::new(VecDeque::new()),
            hold_open: true,
            released: released.clone(),
        });
        let model = Arc::new(ScriptedModel {
            events: Vec::new(),
            calls: calls.clone(),
        });

        let mut adapter =
            GestureAdapter::new(controller, GestureRules::default(), Duration::ZERO);
        adapter.enable(camera, model);

        // Let the task reach Ready before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(adapter.status().stage(), AdapterStage::Ready);

        adapter.disable();
        adapter.join().await;

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no classification after teardown");
        assert_eq!(adapter.status().stage(), AdapterStage::Idle);
        assert!(!adapter.is_enabled());
    }

    struct FailingModel;

    #[async_trait]
    impl GestureModel for FailingModel {
        async fn load(&self) -> Result<Box<dyn Recognizer>> {
            anyhow::bail!("model fetch failed")
        }
    }

    #[tokio::test]
    async fn test_model_failure_lands_in_error_stage() {
        let controller = test_controller();
        let mut adapter =
            GestureAdapter::new(controller, GestureRules::default(), Duration::ZERO);
        let camera = Arc::new(ScriptedCamera {
            frames: Mutex::new(VecDeque::new()),
            hold_open: false,
            released: Arc::new(AtomicUsize::new(0)),
        });
        adapter.enable(camera, Arc::new(FailingModel));
        adapter.join().await;
        assert_eq!(adapter.status().stage(), AdapterStage::Error);
    }
}
