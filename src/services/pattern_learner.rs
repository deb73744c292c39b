//! Online access-pattern learner for the hierarchical cache.
//!
//! Every cache access becomes a small feature vector. The learner keeps `K`
//! cluster centers, seeded by the first `K` distinct observations and nudged
//! toward each new observation (`c ← c + γ(x - c)`). A background daemon
//! periodically re-runs a few Lloyd iterations over the recent window so the
//! centers track drift in the workload.

use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::domain::models::CacheContext;

pub const FEATURE_DIM: usize = 5;

/// Normalised access features: key hash bucket, key length, agent bucket,
/// task complexity, time-of-day bucket. Each component lies in `[0, 1]`.
pub type FeatureVector = [f64; FEATURE_DIM];

const HASH_BUCKETS: u64 = 100;
const MAX_KEY_LEN: usize = 128;
const AGENT_BUCKETS: u64 = 16;

/// 64-bit FNV-1a. Stable across processes, so restored centers stay meaningful.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

pub fn extract_features(key: &str, context: &CacheContext) -> FeatureVector {
    let hash_bucket = (fnv1a(key.as_bytes()) % HASH_BUCKETS) as f64 / (HASH_BUCKETS - 1) as f64;
    let length = key.len().min(MAX_KEY_LEN) as f64 / MAX_KEY_LEN as f64;
    let agent = context
        .agent_id
        .map_or(0.0, |id| (id.0 % AGENT_BUCKETS) as f64 / (AGENT_BUCKETS - 1) as f64);
    let complexity = context
        .complexity
        .map_or(0.0, |c| f64::from(c.level()) / 4.0);
    let hour = context
        .time_bucket
        .map_or_else(|| Utc::now().hour(), |bucket| u32::from(bucket.min(23)));
    let time = f64::from(hour) / 23.0;

    [hash_bucket, length, agent, complexity, time]
}

/// Euclidean distance scaled by `sqrt(FEATURE_DIM)` into `[0, 1]`.
pub fn distance(a: &FeatureVector, b: &FeatureVector) -> f64 {
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (sum / FEATURE_DIM as f64).sqrt()
}

pub fn pattern_score(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Level for an item at `distance` from its nearest center, before any
/// fallback for zero-capacity levels. Level 0 is the hottest.
pub fn level_for_distance(distance: f64, levels: usize, level_span: f64) -> usize {
    if levels == 0 {
        return 0;
    }
    if level_span <= 0.0 {
        return 0;
    }
    let band = (distance / level_span).floor();
    if band.is_finite() && band >= 0.0 {
        (band as usize).min(levels - 1)
    } else {
        levels - 1
    }
}

#[derive(Debug, Clone)]
pub struct PatternLearner {
    clusters: usize,
    rate: f64,
    window_size: usize,
    centers: Vec<FeatureVector>,
    window: VecDeque<FeatureVector>,
    observations: u64,
}

impl PatternLearner {
    pub fn new(clusters: usize, rate: f64, window_size: usize) -> Self {
        Self {
            clusters,
            rate,
            window_size: window_size.max(1),
            centers: Vec::with_capacity(clusters),
            window: VecDeque::with_capacity(window_size),
            observations: 0,
        }
    }

    /// Fold one observation into the centers.
    pub fn observe(&mut self, x: FeatureVector) {
        self.observations += 1;
        self.window.push_back(x);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        if self.centers.len() < self.clusters {
            if !self.centers.contains(&x) {
                self.centers.push(x);
            }
            return;
        }

        if let Some((idx, _)) = self.nearest(&x) {
            let rate = self.rate;
            for (c, v) in self.centers[idx].iter_mut().zip(x) {
                *c += rate * (v - *c);
            }
        }
    }

    /// Index of and distance to the nearest center.
    pub fn nearest(&self, x: &FeatureVector) -> Option<(usize, f64)> {
        self.centers
            .iter()
            .enumerate()
            .map(|(i, c)| (i, distance(c, x)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Distance to the nearest center; 0 while no centers exist.
    pub fn nearest_distance(&self, x: &FeatureVector) -> f64 {
        self.nearest(x).map_or(0.0, |(_, d)| d)
    }

    /// Batch Lloyd iterations over the recent window. Centers with no members
    /// keep their position.
    pub fn refine(&mut self, iterations: usize) -> usize {
        if self.centers.is_empty() || self.window.is_empty() {
            return 0;
        }
        let mut moved = 0;
        for _ in 0..iterations {
            let mut sums = vec![[0.0; FEATURE_DIM]; self.centers.len()];
            let mut counts = vec![0usize; self.centers.len()];
            for x in &self.window {
                if let Some((idx, _)) = self.nearest(x) {
                    counts[idx] += 1;
                    for (s, v) in sums[idx].iter_mut().zip(x) {
                        *s += v;
                    }
                }
            }

            moved = 0;
            for ((center, sum), count) in self.centers.iter_mut().zip(&sums).zip(&counts) {
                if *count == 0 {
                    continue;
                }
                let mean: FeatureVector = std::array::from_fn(|i| sum[i] / *count as f64);
                if mean != *center {
                    *center = mean;
                    moved += 1;
                }
            }
            if moved == 0 {
                break;
            }
        }
        moved
    }

    pub fn centers(&self) -> &[FeatureVector] {
        &self.centers
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    pub fn restore_centers(&mut self, centers: Vec<FeatureVector>) {
        self.centers = centers;
        self.centers.truncate(self.clusters);
        self.window.clear();
    }
}

/// Configuration for the refinement daemon.
#[derive(Debug, Clone)]
pub struct RefineDaemonConfig {
    pub interval: Duration,
    pub iterations: usize,
}

impl Default for RefineDaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            iterations: 3,
        }
    }
}

/// Status of the refinement daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefineStatus {
    pub running: bool,
    pub runs: u64,
    pub centers_moved: u64,
}

/// Handle to control the refinement daemon.
#[derive(Clone)]
pub struct RefineHandle {
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<RefineStatus>>,
}

impl RefineHandle {
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn status(&self) -> RefineStatus {
        self.status.read().clone()
    }
}

/// Background daemon that periodically refines the shared learner.
pub struct PatternRefineDaemon {
    learner: Arc<RwLock<PatternLearner>>,
    config: RefineDaemonConfig,
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<RefineStatus>>,
}

impl PatternRefineDaemon {
    pub fn new(learner: Arc<RwLock<PatternLearner>>, config: RefineDaemonConfig) -> Self {
        Self {
            learner,
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(RefineStatus::default())),
        }
    }

    pub fn handle(&self) -> RefineHandle {
        RefineHandle {
            stop_flag: Arc::clone(&self.stop_flag),
            status: Arc::clone(&self.status),
        }
    }

    /// Run until stopped. The first tick is skipped so a fresh cache has time
    /// to seed its centers.
    pub async fn run(self) {
        self.status.write().running = true;
        info!(interval_ms = self.config.interval.as_millis() as u64, "pattern refine daemon started");

        let mut timer = interval(self.config.interval.max(Duration::from_millis(1)));
        timer.tick().await;

        while !self.stop_flag.load(Ordering::Acquire) {
            timer.tick().await;
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            let moved = self.learner.write().refine(self.config.iterations);
            let mut status = self.status.write();
            status.runs += 1;
            status.centers_moved += moved as u64;
            debug!(run = status.runs, moved, "pattern centers refined");
        }

        self.status.write().running = false;
        info!("pattern refine daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentId, Complexity};

    #[test]
    fn test_features_are_normalised_and_stable() {
        let ctx = CacheContext::for_agent(AgentId(3))
            .with_complexity(Complexity::Complex)
            .with_time_bucket(12);
        let a = extract_features("route:downtown", &ctx);
        let b = extract_features("route:downtown", &ctx);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((a[3] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_seeding_uses_distinct_observations() {
        let mut learner = PatternLearner::new(2, 0.1, 10);
        learner.observe([0.0; FEATURE_DIM]);
        learner.observe([0.0; FEATURE_DIM]);
        assert_eq!(learner.centers().len(), 1);
        learner.observe([1.0; FEATURE_DIM]);
        assert_eq!(learner.centers().len(), 2);
        assert_eq!(learner.nearest_distance(&[1.0; FEATURE_DIM]), 0.0);
    }

    #[test]
    fn test_online_update_moves_nearest_center() {
        let mut learner = PatternLearner::new(1, 0.5, 10);
        learner.observe([0.0; FEATURE_DIM]);
        learner.observe([1.0; FEATURE_DIM]);
        assert!(learner.centers()[0].iter().all(|c| (c - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_no_centers_means_zero_distance() {
        let learner = PatternLearner::new(4, 0.1, 10);
        assert_eq!(learner.nearest_distance(&[0.3; FEATURE_DIM]), 0.0);
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(level_for_distance(0.0, 3, 0.25), 0);
        assert_eq!(level_for_distance(0.3, 3, 0.25), 1);
        assert_eq!(level_for_distance(0.9, 3, 0.25), 2);
        assert_eq!(level_for_distance(0.9, 1, 0.25), 0);
        assert!((pattern_score(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_refine_moves_centers_to_cluster_means() {
        let mut learner = PatternLearner::new(2, 0.0, 10);
        learner.observe([0.0; FEATURE_DIM]);
        learner.observe([1.0; FEATURE_DIM]);
        learner.observe([0.2; FEATURE_DIM]);
        learner.observe([0.8; FEATURE_DIM]);
        learner.refine(5);
        let mut firsts: Vec<f64> = learner.centers().iter().map(|c| c[0]).collect();
        firsts.sort_by(f64::total_cmp);
        assert!((firsts[0] - 0.1).abs() < 1e-12);
        assert!((firsts[1] - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_daemon_stops_on_request() {
        let learner = Arc::new(RwLock::new(PatternLearner::new(2, 0.1, 10)));
        let daemon = PatternRefineDaemon::new(
            learner,
            RefineDaemonConfig {
                interval: Duration::from_millis(5),
                iterations: 1,
            },
        );
        let handle = daemon.handle();
        let task = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.status().running);
        assert!(handle.status().runs >= 1);
    }
}
