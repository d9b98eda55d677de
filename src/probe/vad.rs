//! Voice activity simulation.
//!
//! Talk spurts and silences alternate with exponentially distributed
//! lengths. The simulator runs on packet time (one `advance` per packet), so a
//! stalled sender does not skip states.

use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::time::Duration;

use crate::config::VadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Talking,
    Silent,
}

#[derive(Debug, Clone)]
pub struct VadSimulator {
    config: VadConfig,
    state: VoiceState,
    remaining: Duration,
}

impl VadSimulator {
    /// Start in a talk spurt of random length
    pub fn new<R: Rng>(config: VadConfig, rng: &mut R) -> Self {
        let remaining = draw(config.talk_mean, rng);
        Self {
            config,
            state: VoiceState::Talking,
            remaining,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// Advance by one packet time and report whether this packet carries speech
    pub fn advance<R: Rng>(&mut self, step: Duration, rng: &mut R) -> bool {
        let talking = self.state == VoiceState::Talking;

        let mut step = step;
        while step >= self.remaining {
            step -= self.remaining;
            self.state = match self.state {
                VoiceState::Talking => VoiceState::Silent,
                VoiceState::Silent => VoiceState::Talking,
            };
            let mean = match self.state {
                VoiceState::Talking => self.config.talk_mean,
                VoiceState::Silent => self.config.silence_mean,
            };
            // A zero-length draw would spin; states last at least 1ms
            self.remaining = draw(mean, rng).max(Duration::from_millis(1));
        }
        self.remaining -= step;

        talking
    }
}

fn draw<R: Rng>(mean: Duration, rng: &mut R) -> Duration {
    let mean_secs = mean.as_secs_f64();
    match Exp::new(1.0 / mean_secs) {
        Ok(exp) if mean_secs > 0.0 => Duration::from_secs_f64(exp.sample(rng)),
        _ => mean,
    }
}
