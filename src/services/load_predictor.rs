//! Per-agent load prediction.
//!
//! `L_{t+1} = (1-α)·L_t + α·P_t + β·trend_t`, where `P_t` is the observed
//! utilization scaled by the agent's slowdown factor and `trend_t` is the
//! least-squares slope of the recent utilization window.
//!
//! Each observation is also scored against the prediction made at the
//! previous step; [`LoadPredictor::accuracy`] reports `1 - mean |error|`.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::domain::models::{AgentId, PredictorConfig};

/// Bounds for the actual/estimated duration ratio.
const MIN_SLOWDOWN: f64 = 0.25;
const MAX_SLOWDOWN: f64 = 4.0;

#[derive(Debug, Clone)]
struct PredictorState {
    predicted: f64,
    history: VecDeque<f64>,
    slowdown: f64,
}

impl Default for PredictorState {
    fn default() -> Self {
        Self {
            predicted: 0.0,
            history: VecDeque::new(),
            slowdown: 1.0,
        }
    }
}

/// Point-in-time view of one agent's predictor state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadForecast {
    pub predicted: f64,
    pub trend: f64,
    pub slowdown: f64,
}

#[derive(Debug, Default)]
struct PredictionErrors {
    total: f64,
    samples: u64,
}

pub struct LoadPredictor {
    config: PredictorConfig,
    slowdown_rate: f64,
    states: DashMap<AgentId, PredictorState>,
    errors: Mutex<PredictionErrors>,
}

impl LoadPredictor {
    /// `slowdown_rate` is the EMA rate for the duration ratio.
    pub fn new(config: PredictorConfig, slowdown_rate: f64) -> Self {
        Self {
            config,
            slowdown_rate,
            states: DashMap::new(),
            errors: Mutex::new(PredictionErrors::default()),
        }
    }

    /// Record a utilization observation and return the new prediction.
    pub fn observe(&self, agent_id: AgentId, utilization: f64) -> f64 {
        let window = self.config.window.max(1);
        let mut state = self.states.entry(agent_id).or_default();

        if !state.history.is_empty() {
            let mut errors = self.errors.lock();
            errors.total += (state.predicted - utilization).abs();
            errors.samples += 1;
        }

        state.history.push_back(utilization);
        while state.history.len() > window {
            state.history.pop_front();
        }

        let trend = slope(&state.history);
        let observed = utilization * state.slowdown;
        let predicted = (1.0 - self.config.alpha) * state.predicted
            + self.config.alpha * observed
            + self.config.beta * trend;
        state.predicted = predicted.max(0.0);

        tracing::trace!(
            agent_id = %agent_id,
            utilization,
            trend,
            predicted = state.predicted,
            "load prediction updated"
        );
        state.predicted
    }

    /// Fold one completed task's actual/estimated duration ratio into the
    /// agent's slowdown factor.
    pub fn record_duration(&self, agent_id: AgentId, estimated_secs: f64, actual_secs: f64) {
        if estimated_secs <= 0.0 || !actual_secs.is_finite() {
            return;
        }
        let ratio = (actual_secs / estimated_secs).clamp(MIN_SLOWDOWN, MAX_SLOWDOWN);
        let mut state = self.states.entry(agent_id).or_default();
        state.slowdown = (1.0 - self.slowdown_rate) * state.slowdown + self.slowdown_rate * ratio;
    }

    pub fn predicted(&self, agent_id: AgentId) -> f64 {
        self.states
            .get(&agent_id)
            .map_or(0.0, |state| state.predicted)
    }

    pub fn forecast(&self, agent_id: AgentId) -> LoadForecast {
        self.states.get(&agent_id).map_or(
            LoadForecast {
                predicted: 0.0,
                trend: 0.0,
                slowdown: 1.0,
            },
            |state| LoadForecast {
                predicted: state.predicted,
                trend: slope(&state.history),
                slowdown: state.slowdown,
            },
        )
    }

    /// `1 - mean |predicted - observed|` over every observation that had a
    /// prior prediction, clamped to `[0, 1]`. `None` before the first one.
    pub fn accuracy(&self) -> Option<f64> {
        let errors = self.errors.lock();
        if errors.samples == 0 {
            return None;
        }
        Some((1.0 - errors.total / errors.samples as f64).clamp(0.0, 1.0))
    }

    pub fn remove(&self, agent_id: AgentId) {
        self.states.remove(&agent_id);
    }

    pub fn clear(&self) {
        self.states.clear();
        *self.errors.lock() = PredictionErrors::default();
    }
}

/// Least-squares slope of `values` against their index; zero below two points.
pub fn slope(values: &VecDeque<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
