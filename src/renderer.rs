// Renderer module - fixed-rate animation thread and wire-frame packing
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::controller::ModeController;
use crate::particles::{GroupSnapshot, MorphEngine};
use crate::types::{GroupRole, Mode};

pub const FRAME_VERSION: u8 = 1;

// Shared state between main thread and render thread. The generation
// counter tells the render thread a setting changed without it having to
// diff every field.
#[derive(Clone)]
pub struct SharedRenderState {
    pub fps: f64,
    pub paused: bool,
    pub generation: u64,
}

impl SharedRenderState {
    pub fn new(fps: f64) -> Self {
        SharedRenderState {
            fps,
            paused: false,
            generation: 0,
        }
    }
}

fn mode_index(mode: Mode) -> u8 {
    Mode::all().iter().position(|m| *m == mode).unwrap_or(0) as u8
}

fn role_index(role: GroupRole) -> u8 {
    match role {
        GroupRole::Main => 0,
        GroupRole::Ribbon => 1,
        GroupRole::Ambient => 2,
    }
}

/// Pack one animation frame for the point-stream websocket.
///
/// Layout (little-endian):
///   [version u8][mode u8][group_count u8][pad u8][generation u32]
///   then per group:
///   [role u8][pad u8 x3][count u32][x y z f32 x count][r g b f32 x count]
pub fn pack_frame(mode: Mode, generation: u64, snapshots: &[GroupSnapshot]) -> Vec<u8> {
    let payload: usize = snapshots.iter().map(|s| 8 + s.count() * 24).sum();
    let mut buf = Vec::with_capacity(8 + payload);

    buf.push(FRAME_VERSION);
    buf.push(mode_index(mode));
    buf.push(snapshots.len() as u8);
    buf.push(0);
    buf.extend_from_slice(&(generation as u32).to_le_bytes());

    for snap in snapshots {
        buf.push(role_index(snap.role));
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&(snap.count() as u32).to_le_bytes());
        for p in &snap.positions {
            buf.extend_from_slice(&p.x.to_le_bytes());
            buf.extend_from_slice(&p.y.to_le_bytes());
            buf.extend_from_slice(&p.z.to_le_bytes());
        }
        for c in &snap.colors {
            buf.extend_from_slice(&c.r.to_le_bytes());
            buf.extend_from_slice(&c.g.to_le_bytes());
            buf.extend_from_slice(&c.b.to_le_bytes());
        }
    }

    buf
}

// Dedicated renderer that runs in its own thread at configurable FPS
pub struct Renderer {
    engine: Arc<Mutex<MorphEngine>>,
    controller: Arc<ModeController>,
    frames_tx: broadcast::Sender<Vec<u8>>,
    shared_state: Arc<Mutex<SharedRenderState>>,
    shutdown: Arc<AtomicBool>,
    measured_fps: Arc<Mutex<f64>>,
}

impl Renderer {
    pub fn new(
        controller: Arc<ModeController>,
        frames_tx: broadcast::Sender<Vec<u8>>,
        shared_state: Arc<Mutex<SharedRenderState>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Renderer {
            engine: controller.engine(),
            controller,
            frames_tx,
            shared_state,
            shutdown,
            measured_fps: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Handle for the status pane; updated once a second by the loop.
    pub fn measured_fps_handle(&self) -> Arc<Mutex<f64>> {
        self.measured_fps.clone()
    }

    // Ticks the engine and packs one wire frame. The generation counter is
    // read before taking the engine lock: set_mode locks the controller's
    // internal state first and the engine second, so touching the controller
    // while holding the engine lock would invert that order and deadlock.
    fn build_frame(&self, dt: f32, paused: bool) -> Vec<u8> {
        let generation = self.controller.generation();
        let mut engine = self.engine.lock().unwrap();
        if !paused {
            engine.tick(dt);
        }
        let snapshots = engine.snapshots();
        pack_frame(engine.mode(), generation, &snapshots)
    }

    // Main render loop that runs at configurable FPS
    pub fn run(self) {
        let mut last_frame = Instant::now();
        let mut window_start = Instant::now();
        let mut window_frames: u32 = 0;

        loop {
            let loop_start = Instant::now();

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let (fps, paused) = {
                let state = self.shared_state.lock().unwrap();
                (state.fps.max(1.0), state.paused)
            };
            let frame_duration = Duration::from_micros((1_000_000.0 / fps) as u64);

            let elapsed = loop_start.duration_since(last_frame);
            if elapsed >= frame_duration {
                last_frame = loop_start;

                let frame = self.build_frame(elapsed.as_secs_f32(), paused);

                // No subscribers is fine; the animation keeps running.
                let _ = self.frames_tx.send(frame);

                window_frames += 1;
                let window = loop_start.duration_since(window_start);
                if window >= Duration::from_secs(1) {
                    *self.measured_fps.lock().unwrap() =
                        window_frames as f64 / window.as_secs_f64();
                    window_start = loop_start;
                    window_frames = 0;
                }
            }

            // Tiny sleep to avoid spinning CPU at 100%
            thread::sleep(Duration::from_micros(100));
        }
    }
}

/// Spawn the render loop on a plain OS thread so animation cadence is
/// independent of the async runtime.
pub fn spawn_render_thread(renderer: Renderer) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("render".to_string())
        .spawn(move || renderer.run())
        .unwrap_or_else(|e| {
            eprintln!("Failed to spawn render thread: {}", e);
            std::process::exit(1);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rgb;
    use glam::Vec3;

    fn snapshot(role: GroupRole, count: usize) -> GroupSnapshot {
        GroupSnapshot {
            role,
            positions: (0..count).map(|i| Vec3::new(i as f32, 1.5, -2.0)).collect(),
            colors: vec![Rgb::new(0.25, 0.5, 0.75); count],
        }
    }

    #[test]
    fn test_pack_frame_layout() {
        let snaps = vec![snapshot(GroupRole::Main, 2), snapshot(GroupRole::Ambient, 1)];
        let buf = pack_frame(Mode::Heart, 7, &snaps);

        assert_eq!(buf.len(), 8 + (8 + 2 * 24) + (8 + 24));
        assert_eq!(buf[0], FRAME_VERSION);
        assert_eq!(buf[1], 1, "heart is mode index 1");
        assert_eq!(buf[2], 2, "two groups");
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 7);

        // First group header.
        assert_eq!(buf[8], 0, "main role index");
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 2);

        // Second particle's x of the first group: offset 16 + 12.
        let x = f32::from_le_bytes(buf[28..32].try_into().unwrap());
        assert!((x - 1.0).abs() < 1e-6);

        // First color channel of the first group: after 2 positions.
        let r = f32::from_le_bytes(buf[40..44].try_into().unwrap());
        assert!((r - 0.25).abs() < 1e-6);

        // Second group starts right after the first.
        assert_eq!(buf[8 + 8 + 48], role_index(GroupRole::Ambient));
    }

    #[test]
    fn test_pack_frame_empty_groups() {
        let buf = pack_frame(Mode::Tree, 0, &[]);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[2], 0);
    }

    #[test]
    fn test_frame_build_and_mode_switch_do_not_block_each_other() {
        use crate::controller::{GroupSpec, ModeController};
        use crate::shapes::ShapeParams;
        use std::sync::mpsc;

        let controller = Arc::new(
            ModeController::bootstrap(
                Mode::Tree,
                &[GroupSpec {
                    role: GroupRole::Main,
                    count: 50,
                    damping: 2.0,
                }],
                ShapeParams::default(),
            )
            .unwrap(),
        );
        let (frames_tx, _frames_rx) = broadcast::channel(8);
        let renderer = Renderer::new(
            controller.clone(),
            frames_tx,
            Arc::new(Mutex::new(SharedRenderState::new(60.0))),
            Arc::new(AtomicBool::new(false)),
        );

        let (render_done_tx, render_done_rx) = mpsc::channel();
        let (switch_done_tx, switch_done_rx) = mpsc::channel();

        let render_thread = thread::spawn(move || {
            for _ in 0..200 {
                let frame = renderer.build_frame(0.016, false);
                assert!(frame.len() > 8);
            }
            render_done_tx.send(()).unwrap();
        });
        let switch_controller = controller.clone();
        let switch_thread = thread::spawn(move || {
            for i in 0..200 {
                let target = if i % 2 == 0 { Mode::Heart } else { Mode::Tree };
                switch_controller.set_mode(target).unwrap();
            }
            switch_done_tx.send(()).unwrap();
        });

        // Either side hanging means the two lock paths wait on each other.
        assert!(render_done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(switch_done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        render_thread.join().unwrap();
        switch_thread.join().unwrap();
    }

    #[test]
    fn test_mode_index_stable_order() {
        for (i, mode) in Mode::all().iter().enumerate() {
            assert_eq!(mode_index(*mode) as usize, i);
        }
    }
}
