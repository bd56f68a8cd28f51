// Mode controller - single source of truth for the active mode, plus the
// memoizing shape-target cache that feeds retargets to the morph engine
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::particles::{MorphEngine, ParticleGroup};
use crate::shapes::{self, ShapeParams, ShapeTarget};
use crate::types::{GroupRole, Mode};

/// Sizing and damping for one particle group, taken from config.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    pub role: GroupRole,
    pub count: usize,
    pub damping: f32,
}

struct Inner {
    current: Mode,
    generation: u64,
    cache: HashMap<(Mode, GroupRole, usize), Arc<ShapeTarget>>,
}

/// Holds the authoritative current mode and performs retargets.
///
/// `set_mode` is the sole cross-loop synchronization point: the UI key loop,
/// the HTTP API and the gesture adapter all call it concurrently. The inner
/// mutex makes the mode assignment plus the dispatch of new targets one
/// logical step; callers observe either the old mode or the new one, never a
/// half-applied switch. Lock order is always inner before engine.
pub struct ModeController {
    engine: Arc<Mutex<MorphEngine>>,
    inner: Mutex<Inner>,
    params: ShapeParams,
}

impl ModeController {
    /// Generate the initial targets, build the particle groups and the
    /// engine, and seed the target cache. Fails fast on invalid counts.
    pub fn bootstrap(initial: Mode, specs: &[GroupSpec], params: ShapeParams) -> Result<Self> {
        let mut cache = HashMap::new();
        let mut groups = Vec::with_capacity(specs.len());

        for spec in specs {
            let target = Arc::new(shapes::generate(initial, spec.role, spec.count, &params)?);
            cache.insert((initial, spec.role, spec.count), target.clone());
            groups.push(ParticleGroup::new(spec.role, target, spec.damping));
        }

        Ok(ModeController {
            engine: Arc::new(Mutex::new(MorphEngine::new(groups, initial))),
            inner: Mutex::new(Inner {
                current: initial,
                generation: 0,
                cache,
            }),
            params,
        })
    }

    /// Shared handle for the render loop; the controller keeps its own.
    pub fn engine(&self) -> Arc<Mutex<MorphEngine>> {
        self.engine.clone()
    }

    pub fn current_mode(&self) -> Mode {
        self.inner.lock().unwrap().current
    }

    /// Bumps on every applied mode switch, for cheap change detection by
    /// observers (status pane, websocket clients).
    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Switch the active mode. Requesting the current mode is a no-op and
    /// returns false: no target is generated and nothing observable changes
    /// beyond the ongoing convergence.
    pub fn set_mode(&self, requested: Mode) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current == requested {
            return Ok(false);
        }

        // Group layout is fixed for the session; read it briefly.
        let layout: Vec<(GroupRole, usize)> = {
            let engine = self.engine.lock().unwrap();
            engine.groups().iter().map(|g| (g.role(), g.count())).collect()
        };

        // Generation is deterministic and side-effect-free, so memoize per
        // (mode, role, count). Potentially slow (first visit of a mode),
        // which is why it happens before the engine lock is taken.
        let mut targets = Vec::with_capacity(layout.len());
        for (role, count) in layout {
            let key = (requested, role, count);
            let target = match inner.cache.get(&key) {
                Some(t) => t.clone(),
                None => {
                    let t = Arc::new(shapes::generate(requested, role, count, &self.params)?);
                    inner.cache.insert(key, t.clone());
                    t
                }
            };
            targets.push((role, target));
        }

        inner.current = requested;
        inner.generation += 1;

        // One engine lock so every group's retarget lands in the same frame.
        let mut engine = self.engine.lock().unwrap();
        for (role, target) in targets {
            engine.retarget(role, target);
        }
        engine.set_active_mode(requested);

        Ok(true)
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn controller(initial: Mode, count: usize) -> ModeController {
        ModeController::bootstrap(
            initial,
            &[GroupSpec {
                role: GroupRole::Main,
                count,
                damping: 2.0,
            }],
            ShapeParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_set_mode_idempotent() {
        let ctl = controller(Mode::Tree, 100);
        let cached = ctl.cache_len();
        let generation = ctl.generation();

        assert!(!ctl.set_mode(Mode::Tree).unwrap());
        assert_eq!(ctl.cache_len(), cached, "no new target may be generated");
        assert_eq!(ctl.generation(), generation);
        assert_eq!(ctl.current_mode(), Mode::Tree);
    }

    #[test]
    fn test_set_mode_switches_and_memoizes() {
        let ctl = controller(Mode::Tree, 100);
        assert!(ctl.set_mode(Mode::Heart).unwrap());
        assert_eq!(ctl.current_mode(), Mode::Heart);
        let cached = ctl.cache_len();

        // Round trip: both targets already cached, nothing regenerated.
        assert!(ctl.set_mode(Mode::Tree).unwrap());
        assert!(ctl.set_mode(Mode::Heart).unwrap());
        assert_eq!(ctl.cache_len(), cached);
        assert_eq!(ctl.generation(), 3);
    }

    #[test]
    fn test_set_mode_does_not_snap_live_buffers() {
        let ctl = controller(Mode::Tree, 200);
        let engine = ctl.engine();
        engine.lock().unwrap().tick(0.25);

        let before: Vec<Vec3> = engine.lock().unwrap().groups()[0].live_positions().to_vec();
        ctl.set_mode(Mode::Saturn).unwrap();
        let after: Vec<Vec3> = engine.lock().unwrap().groups()[0].live_positions().to_vec();

        assert_eq!(before, after, "set_mode must not mutate live buffers");
    }

    #[test]
    fn test_tree_to_heart_end_to_end_convergence() {
        let ctl = controller(Mode::Tree, 3000);
        let engine = ctl.engine();
        ctl.set_mode(Mode::Heart).unwrap();

        // Twenty simulated seconds at 60 fps: residual must be inside a
        // tight tolerance of the assigned heart target, per particle index.
        for _ in 0..1200 {
            engine.lock().unwrap().tick(1.0 / 60.0);
        }

        let engine = engine.lock().unwrap();
        let group = &engine.groups()[0];
        let eps = 1e-3;
        for (live, target) in group.live_positions().iter().zip(group.target().positions()) {
            assert!(
                (*live - *target).length() < eps,
                "particle did not converge: {live:?} vs {target:?}"
            );
        }
    }

    #[test]
    fn test_invalid_count_rejected_at_bootstrap() {
        let result = ModeController::bootstrap(
            Mode::Tree,
            &[GroupSpec {
                role: GroupRole::Main,
                count: 0,
                damping: 2.0,
            }],
            ShapeParams::default(),
        );
        assert!(result.is_err());
    }
}
