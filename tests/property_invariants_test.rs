//! Property tests for similarity, knowledge updates, cache capacity and
//! scheduler load accounting.

mod common;

use cohort::domain::models::{
    CacheConfig, CacheContext, LearningConfig, PredictorConfig, SchedulerConfig,
};
use cohort::services::{
    interpolate, AgentProfile, AgentRegistry, CacheManager, LearningEngine, LoadPredictor,
    Scheduler, SimilarityEngine,
};
use cohort::{AgentConstraints, AgentId, CacheLookup, Task, TaskSpec};
use common::caps;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const TAGS: [&str; 6] = ["route", "traffic", "safety", "weather", "map", "audit"];

fn profile_strategy() -> impl Strategy<Value = AgentProfile> {
    (
        prop::collection::btree_set(0usize..TAGS.len(), 0..TAGS.len()),
        prop::option::of(0.0f64..=1.0),
        prop::collection::btree_map(0usize..TAGS.len(), 0.1f64..10.0, 0..4),
    )
        .prop_map(|(tags, success_rate, spec)| AgentProfile {
            id: AgentId(0),
            capabilities: tags.into_iter().map(|i| TAGS[i]).collect(),
            success_rate,
            specialization: spec
                .into_iter()
                .map(|(i, w)| (TAGS[i].to_string(), w))
                .collect::<BTreeMap<_, _>>(),
        })
}

#[derive(Debug, Clone)]
enum CacheOp {
    Put(u8),
    Get(u8),
    Invalidate(u8),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0u8..12).prop_map(CacheOp::Put),
        (0u8..12).prop_map(CacheOp::Get),
        (0u8..12).prop_map(CacheOp::Invalidate),
    ]
}

proptest! {
    #[test]
    fn prop_similarity_is_symmetric_and_bounded(a in profile_strategy(), b in profile_strategy()) {
        let engine = SimilarityEngine::default();
        let ab = engine.similarity(&a, &b);
        let ba = engine.similarity(&b, &a);
        prop_assert!((0.0..=100.0).contains(&ab));
        prop_assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn prop_identical_profiles_are_maximally_close(a in profile_strategy(), b in profile_strategy()) {
        let engine = SimilarityEngine::default();
        let mut twin = b.clone();
        twin.capabilities = a.capabilities.clone();
        twin.success_rate = a.success_rate;
        twin.specialization = a.specialization.clone();
        prop_assert!(engine.similarity(&a, &twin) + 1e-9 >= engine.similarity(&a, &b));
    }

    #[test]
    fn prop_interpolate_stays_between_endpoints(
        old in 0.0f64..=100.0,
        target in 0.0f64..=100.0,
        rate in 0.0f64..=100.0,
    ) {
        let value = interpolate(old, target, rate);
        prop_assert!(value >= old.min(target) - 1e-9);
        prop_assert!(value <= old.max(target) + 1e-9);
    }

    #[test]
    fn prop_repeated_updates_converge_without_overshoot(
        reward in 0.0f64..=100.0,
        rate in 1.0f64..=100.0,
        rounds in 1usize..30,
    ) {
        let registry = Arc::new(AgentRegistry::new(10));
        let agent = registry.register("worker", caps(&["x"]), AgentConstraints::default());
        let engine = LearningEngine::new(Arc::clone(&registry), LearningConfig::default());

        let mut previous_gap = (reward - engine.knowledge(agent, "k").unwrap()).abs();
        for _ in 0..rounds {
            let value = engine.update_knowledge(agent, "k", reward, rate).unwrap();
            prop_assert!((0.0..=100.0).contains(&value));
            let gap = (reward - value).abs();
            prop_assert!(gap <= previous_gap + 1e-9);
            previous_gap = gap;
        }
    }

    #[test]
    fn prop_transfer_never_moves_peers_past_source(
        source_value in 0.0f64..=100.0,
        peer_value in 0.0f64..=100.0,
        transfer_rate in 0.0f64..=100.0,
        threshold in 0.0f64..=101.0,
    ) {
        let registry = Arc::new(AgentRegistry::new(10));
        let source = registry.register("a", caps(&["x"]), AgentConstraints::default());
        let peer = registry.register("b", caps(&["x"]), AgentConstraints::default());
        registry.with_agent_mut(peer, |agent| {
            agent.knowledge_base.insert("k".into(), peer_value);
        });
        let engine = LearningEngine::new(Arc::clone(&registry), LearningConfig::default());

        let report = engine
            .transfer_to_peers(source, &[peer], "k", source_value, transfer_rate, threshold)
            .unwrap();
        let after = engine.knowledge(peer, "k").unwrap();

        prop_assert!(after >= peer_value.min(source_value) - 1e-9);
        prop_assert!(after <= peer_value.max(source_value) + 1e-9);
        if threshold > 100.0 {
            prop_assert!(report.transfers.is_empty());
            prop_assert_eq!(after, peer_value);
        }
        // Transfer never touches the source.
        prop_assert_eq!(engine.knowledge(source, "k").unwrap(), 0.0);
    }

    #[test]
    fn prop_cache_respects_capacity_and_reads_own_writes(
        levels in 1usize..4,
        capacity in 0usize..5,
        ops in prop::collection::vec(cache_op(), 1..80),
    ) {
        let cache = CacheManager::new(CacheConfig::uniform(levels, capacity));
        let ctx = CacheContext::for_agent(AgentId(1));

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                CacheOp::Put(k) => {
                    let key = format!("k{k}");
                    let value = serde_json::json!(i);
                    cache.put(&key, value.clone(), &ctx);
                    if capacity > 0 {
                        prop_assert_eq!(cache.get(&key, &ctx), CacheLookup::Hit(value));
                    } else {
                        prop_assert_eq!(cache.get(&key, &ctx), CacheLookup::Miss);
                    }
                }
                CacheOp::Get(k) => {
                    cache.get(&format!("k{k}"), &ctx);
                }
                CacheOp::Invalidate(k) => {
                    let key = format!("k{k}");
                    cache.invalidate(&key);
                    prop_assert_eq!(cache.get(&key, &ctx), CacheLookup::Miss);
                }
            }

            let stats = cache.stats();
            for level in &stats.levels {
                prop_assert!(level.size <= level.capacity);
            }
        }
    }

    #[test]
    fn prop_scheduler_load_matches_reservations(
        estimates in prop::collection::vec(0.05f64..1.5, 1..40),
        complete_every in 1usize..5,
    ) {
        let config = SchedulerConfig::default();
        let registry = Arc::new(AgentRegistry::new(config.history_limit));
        let predictor = Arc::new(LoadPredictor::new(PredictorConfig::default(), 0.1));
        let scheduler = Scheduler::new(registry, predictor, config);
        let agents: Vec<AgentId> = [1.0, 1.0, 2.0]
            .into_iter()
            .map(|capacity| {
                scheduler.register("worker", caps(&["x"]), AgentConstraints::with_capacity(capacity))
            })
            .collect();

        let mut outstanding = Vec::new();
        for (i, est) in estimates.into_iter().enumerate() {
            let task = Task::from_spec(TaskSpec::new(["x"], est)).unwrap();
            if let Ok(assignment) = scheduler.submit(&task) {
                outstanding.push((assignment.agent_id, assignment.task_id, est));
            }
            if i % complete_every == 0 && !outstanding.is_empty() {
                let (agent, task_id, _) = outstanding.remove(0);
                scheduler
                    .record_completion(agent, task_id, Duration::from_millis(5), i % 2 == 0)
                    .unwrap();
            }

            for id in &agents {
                let status = scheduler.status(*id).unwrap();
                let reserved: f64 = outstanding
                    .iter()
                    .filter(|(agent, _, _)| agent == id)
                    .map(|(_, _, est)| est)
                    .sum();
                prop_assert!(status.load <= status.capacity + 1e-9);
                prop_assert!((status.load - reserved).abs() < 1e-9);
            }
        }
    }
}
