// Particle state and morph engine - per-tick blending of live buffers
// toward the active shape targets
use glam::Vec3;
use std::sync::Arc;

use crate::shapes::{ShapeTarget, AMBIENT_EXTENT};
use crate::types::{GroupRole, Mode, Rgb};

const RIBBON_SPIN_RATE: f32 = 0.1;
const AMBIENT_FALL_RATE: f32 = 2.0;
const TREE_WOBBLE: f32 = 0.002;

/// One independently-animated particle population: live buffers, the target
/// they blend toward, and the convergence rate. `count` is fixed for the
/// group's lifetime and always equals both buffer lengths.
pub struct ParticleGroup {
    role: GroupRole,
    count: usize,
    live_positions: Vec<Vec3>,
    live_colors: Vec<Rgb>,
    target: Arc<ShapeTarget>,
    damping: f32,
}

impl ParticleGroup {
    /// Live buffers start on the initial target so the first frame is
    /// already a coherent shape.
    pub fn new(role: GroupRole, target: Arc<ShapeTarget>, damping: f32) -> Self {
        ParticleGroup {
            role,
            count: target.count(),
            live_positions: target.positions().to_vec(),
            live_colors: target.colors().to_vec(),
            target,
            damping,
        }
    }

    /// Swap the target only. Live buffers are deliberately untouched: the
    /// in-flight positions become the starting point of the new blend, so a
    /// mode switch never pops.
    pub fn retarget(&mut self, target: Arc<ShapeTarget>) {
        debug_assert_eq!(target.count(), self.count);
        self.target = target;
    }

    pub fn role(&self) -> GroupRole {
        self.role
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn live_positions(&self) -> &[Vec3] {
        &self.live_positions
    }

    pub fn live_colors(&self) -> &[Rgb] {
        &self.live_colors
    }

    pub fn target(&self) -> &Arc<ShapeTarget> {
        &self.target
    }

    pub fn damping(&self) -> f32 {
        self.damping
    }

    pub fn set_damping(&mut self, damping: f32) {
        self.damping = damping.max(0.0);
    }
}

/// What the rendering collaborator consumes every frame: positions after
/// presentation transforms (ribbon spin, ambient drift), colors, count.
#[derive(Clone)]
pub struct GroupSnapshot {
    pub role: GroupRole,
    pub positions: Vec<Vec3>,
    pub colors: Vec<Rgb>,
}

impl GroupSnapshot {
    pub fn count(&self) -> usize {
        self.positions.len()
    }
}

/// Advances every group's live buffers toward their targets once per
/// animation tick.
///
/// The blend is the exact exponential-approach form
/// `live += (target - live) * (1 - exp(-damping * dt))`, which converges
/// monotonically for any damping > 0 and cannot overshoot regardless of dt.
/// Secondary motion (tree wobble, ribbon spin, ambient snowfall) is layered
/// on top of the blend and never resets the live buffers.
pub struct MorphEngine {
    groups: Vec<ParticleGroup>,
    mode: Mode,
    elapsed: f32,
    ribbon_spin: f32,
    ambient_fall: f32,
}

impl MorphEngine {
    pub fn new(groups: Vec<ParticleGroup>, mode: Mode) -> Self {
        MorphEngine {
            groups,
            mode,
            elapsed: 0.0,
            ribbon_spin: 0.0,
            ambient_fall: 0.0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn groups(&self) -> &[ParticleGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ParticleGroup] {
        &mut self.groups
    }

    pub fn group(&self, role: GroupRole) -> Option<&ParticleGroup> {
        self.groups.iter().find(|g| g.role() == role)
    }

    /// Swap one group's target. Called by the controller while it holds the
    /// engine lock, so all groups of a mode switch land in the same frame.
    pub fn retarget(&mut self, role: GroupRole, target: Arc<ShapeTarget>) {
        if let Some(group) = self.groups.iter_mut().find(|g| g.role() == role) {
            group.retarget(target);
        }
    }

    pub fn set_active_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// One animation tick. Bounded-time arithmetic over fixed buffers; no
    /// allocation on this path.
    pub fn tick(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.elapsed += dt;
        self.ribbon_spin = (self.ribbon_spin + dt * RIBBON_SPIN_RATE) % (std::f32::consts::PI * 2.0);
        self.ambient_fall = (self.ambient_fall + dt * AMBIENT_FALL_RATE) % (AMBIENT_EXTENT * 2.0);

        let mode = self.mode;
        let elapsed = self.elapsed;

        for group in &mut self.groups {
            let k = 1.0 - (-group.damping * dt).exp();
            let targets = group.target.positions();
            let target_colors = group.target.colors();

            for (live, target) in group.live_positions.iter_mut().zip(targets) {
                *live += (*target - *live) * k;
            }
            for (live, target) in group.live_colors.iter_mut().zip(target_colors) {
                live.r += (target.r - live.r) * k;
                live.g += (target.g - live.g) * k;
                live.b += (target.b - live.b) * k;
            }

            // Gentle additive wave on the main cloud while it holds the
            // tree shape. Tiny relative to the blend, so convergence wins.
            if group.role == GroupRole::Main && mode == Mode::Tree {
                for live in group.live_positions.iter_mut() {
                    live.x += (elapsed + live.y).sin() * TREE_WOBBLE;
                }
            }
        }
    }

    /// Build per-group snapshots for the renderer. Presentation transforms
    /// (whole-ribbon rotation, ambient fall with wraparound) are applied to
    /// the copies, never to the live buffers, so they cannot disturb
    /// convergence.
    pub fn snapshots(&self) -> Vec<GroupSnapshot> {
        self.groups
            .iter()
            .map(|group| {
                let mut positions = group.live_positions.clone();
                match group.role {
                    GroupRole::Main => {}
                    GroupRole::Ribbon => {
                        let (sin, cos) = (-self.ribbon_spin).sin_cos();
                        for p in positions.iter_mut() {
                            let (x, z) = (p.x, p.z);
                            p.x = x * cos + z * sin;
                            p.z = -x * sin + z * cos;
                        }
                    }
                    GroupRole::Ambient => {
                        for p in positions.iter_mut() {
                            p.y = (p.y - self.ambient_fall + AMBIENT_EXTENT)
                                .rem_euclid(AMBIENT_EXTENT * 2.0)
                                - AMBIENT_EXTENT;
                        }
                    }
                }
                GroupSnapshot {
                    role: group.role,
                    positions,
                    colors: group.live_colors.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{self, ShapeParams};

    fn target_for(mode: Mode, count: usize) -> Arc<ShapeTarget> {
        Arc::new(shapes::generate(mode, GroupRole::Main, count, &ShapeParams::default()).unwrap())
    }

    fn engine_with(mode_from: Mode, mode_to: Mode, count: usize, damping: f32) -> MorphEngine {
        let mut engine = MorphEngine::new(
            vec![ParticleGroup::new(GroupRole::Main, target_for(mode_from, count), damping)],
            mode_from,
        );
        engine.retarget(GroupRole::Main, target_for(mode_to, count));
        engine.set_active_mode(mode_to);
        engine
    }

    fn max_error(engine: &MorphEngine) -> f32 {
        let group = &engine.groups()[0];
        group
            .live_positions()
            .iter()
            .zip(group.target.positions())
            .map(|(live, target)| (*live - *target).length())
            .fold(0.0f32, f32::max)
    }

    #[test]
    fn test_tick_converges_monotonically() {
        let mut engine = engine_with(Mode::Scatter, Mode::Heart, 200, 2.0);
        let mut prev = max_error(&engine);
        assert!(prev > 0.0);
        for _ in 0..300 {
            engine.tick(1.0 / 60.0);
            let err = max_error(&engine);
            assert!(err <= prev + 1e-6, "error increased: {} -> {}", prev, err);
            prev = err;
        }
        assert!(prev < 1e-2, "did not converge: residual {}", prev);
    }

    #[test]
    fn test_no_overshoot_for_huge_dt() {
        // damping * dt >> 1: the exact blend form saturates at k < 1 and
        // must land between start and target, never past it.
        let mut engine = engine_with(Mode::Scatter, Mode::Sphere, 100, 2.0);
        let start: Vec<Vec3> = engine.groups()[0].live_positions().to_vec();
        engine.tick(100.0);
        let group = &engine.groups()[0];
        for ((s, live), target) in start
            .iter()
            .zip(group.live_positions())
            .zip(group.target.positions())
        {
            for axis in 0..3 {
                let (s, l, t) = (s[axis], live[axis], target[axis]);
                let (lo, hi) = if s < t { (s, t) } else { (t, s) };
                assert!(l >= lo - 1e-4 && l <= hi + 1e-4, "overshot {s} -> {l} (target {t})");
            }
        }
    }

    #[test]
    fn test_retarget_does_not_touch_live_buffers() {
        let mut engine = engine_with(Mode::Tree, Mode::Tree, 150, 2.0);
        engine.tick(0.5);
        let before: Vec<Vec3> = engine.groups()[0].live_positions().to_vec();
        engine.retarget(GroupRole::Main, target_for(Mode::Saturn, 150));
        let after = engine.groups()[0].live_positions();
        assert_eq!(before.as_slice(), after, "retarget must not snap live positions");
    }

    #[test]
    fn test_blend_is_framerate_invariant() {
        // One 1s tick and sixty 1/60s ticks leave the same residual for the
        // exact exponential form (heart mode: no additive wobble).
        let mut coarse = engine_with(Mode::Scatter, Mode::Heart, 1, 2.0);
        let mut fine = engine_with(Mode::Scatter, Mode::Heart, 1, 2.0);
        // Identical starting points are required: copy coarse's state.
        fine.groups_mut()[0].live_positions[0] = coarse.groups()[0].live_positions()[0];
        fine.groups_mut()[0].retarget(coarse.groups()[0].target.clone());

        coarse.tick(1.0);
        for _ in 0..60 {
            fine.tick(1.0 / 60.0);
        }

        let a = coarse.groups()[0].live_positions()[0];
        let b = fine.groups()[0].live_positions()[0];
        assert!((a - b).length() < 1e-3, "{a:?} vs {b:?}");
    }

    #[test]
    fn test_ambient_snapshot_wraps_within_extent() {
        let ambient = Arc::new(
            shapes::generate(Mode::Scatter, GroupRole::Ambient, 300, &ShapeParams::default())
                .unwrap(),
        );
        let mut engine = MorphEngine::new(
            vec![ParticleGroup::new(GroupRole::Ambient, ambient, 1.5)],
            Mode::Scatter,
        );
        for _ in 0..500 {
            engine.tick(0.05);
        }
        for snap in engine.snapshots() {
            for p in &snap.positions {
                assert!(p.y >= -AMBIENT_EXTENT - 1e-3 && p.y <= AMBIENT_EXTENT + 1e-3);
            }
        }
    }

    #[test]
    fn test_snapshot_counts_match_groups() {
        let engine = engine_with(Mode::Tree, Mode::Tree, 123, 2.0);
        let snaps = engine.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].count(), 123);
        assert_eq!(snaps[0].colors.len(), 123);
    }
}
