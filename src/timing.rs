//! Human-plausible delays.
//!
//! The executor never sleeps a hard-coded amount; it asks a [`DelayPolicy`].
//! [`HumanTiming`] draws jittered delays from a seeded RNG so a fixed seed
//! reproduces a run exactly.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TypingConfig;

/// Source of every delay the executor and obstruction handlers wait on.
pub trait DelayPolicy: Send + Sync {
    /// Pause after one typed character.
    fn keystroke(&self) -> Duration;

    /// Pause between hovering an element and pressing it.
    fn pre_click(&self) -> Duration;

    /// Pause after an interaction that is expected to change the page.
    fn settle(&self) -> Duration;

    /// Pause between two points of a synthesized mouse path.
    fn mouse_step(&self) -> Duration;

    /// Intermediate pointer positions from `from` to `to`, ending at `to`.
    fn mouse_path(&self, from: (f64, f64), to: (f64, f64)) -> Vec<(f64, f64)>;
}

/// Jittered delays around configured means.
pub struct HumanTiming {
    config: TypingConfig,
    rng: Mutex<StdRng>,
}

impl HumanTiming {
    /// Seeded from `config.seed`, or from OS entropy when unset.
    pub fn new(config: &TypingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config: config.clone(),
            rng: Mutex::new(rng),
        }
    }

    /// Deterministic policy for tests and replays.
    pub fn seeded(config: &TypingConfig, seed: u64) -> Self {
        Self {
            config: config.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    /// `base` ± `jitter` percent.
    fn jittered(&self, base_ms: u64) -> Duration {
        let spread = base_ms as f64 * self.config.jitter;
        if spread <= 0.0 {
            return Duration::from_millis(base_ms);
        }
        let ms = self.with_rng(|rng| rng.random_range(-spread..=spread)) + base_ms as f64;
        Duration::from_millis(ms.max(0.0).round() as u64)
    }
}

impl DelayPolicy for HumanTiming {
    fn keystroke(&self) -> Duration {
        let base = self.jittered(self.config.keystroke_ms);
        let thinking = self.with_rng(|rng| {
            let chance = self.config.thinking_chance.clamp(0.0, 1.0);
            rng.random_bool(chance).then(|| {
                rng.random_range(self.config.thinking_min_ms..=self.config.thinking_max_ms)
            })
        });
        base + Duration::from_millis(thinking.unwrap_or(0))
    }

    fn pre_click(&self) -> Duration {
        self.jittered(self.config.pre_click_ms)
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.config.settle_ms)
    }

    fn mouse_step(&self) -> Duration {
        self.jittered(self.config.mouse_step_ms)
    }

    fn mouse_path(&self, from: (f64, f64), to: (f64, f64)) -> Vec<(f64, f64)> {
        let steps = self.config.mouse_steps.max(1);
        // Quadratic curve through a control point pushed off the straight line.
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let bend = self.with_rng(|rng| rng.random_range(-0.25..=0.25));
        let control = (
            from.0 + dx / 2.0 - dy * bend,
            from.1 + dy / 2.0 + dx * bend,
        );
        let mut path: Vec<(f64, f64)> = (1..steps)
            .map(|i| {
                let t = i as f64 / steps as f64;
                let u = 1.0 - t;
                let wobble = self.with_rng(|rng| (rng.random_range(-1.5..=1.5), rng.random_range(-1.5..=1.5)));
                (
                    u * u * from.0 + 2.0 * u * t * control.0 + t * t * to.0 + wobble.0,
                    u * u * from.1 + 2.0 * u * t * control.1 + t * t * to.1 + wobble.1,
                )
            })
            .collect();
        path.push(to);
        path
    }
}
