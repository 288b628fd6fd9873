//! Fight runner: builds the arena from a config, runs the reference fight and
//! hands the ledger to the Monte Carlo engine.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::action::ActionRegistry;
use crate::arena::{Arena, Millis};
use crate::config::SimulationConfig;
use crate::entity::{DamageLedger, EntityId, TickMode};
use crate::error::Result;
use crate::formula::StatModel;
use crate::montecarlo::{self, MonteCarloConfig};
use crate::resolver::ActionResolver;
use crate::rotation::Rotation;
use crate::stats::MonteCarloReport;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub at: Millis,
    pub dps: f64,
}

/// Result of one reference fight.
#[derive(Debug, Clone, Serialize)]
pub struct FightOutcome {
    pub name: String,
    pub ledger: DamageLedger,
    pub pull_ms: Millis,
    pub end_ms: Millis,
    pub duration_ms: Millis,
    pub total_mean: f64,
    /// Standard deviation of the total under independent hits.
    pub total_stddev: f64,
    pub dps: f64,
    pub target_defeated: bool,
    pub executed: usize,
    pub skipped: usize,
    pub timeline: Vec<TimelinePoint>,
}

/// Sets up the arena for `config` and returns it with the player's id.
pub fn build_arena(config: &SimulationConfig) -> Result<(Arena, EntityId)> {
    let registry = Arc::new(ActionRegistry::from_config(config)?);
    let rotation = Rotation::from_config(&config.rotation, &registry)?;
    let stats = StatModel::from_gearset(&config.gearset, config.fight.variance)?;
    let fight = &config.fight;

    let mut arena = Arena::new(fight.start_ms, Arc::clone(&registry));
    arena.set_pull(fight.pull_ms);
    arena.set_resource_poll(fight.resource_poll_ms);
    if fight.trace {
        arena.enable_trace();
    }
    for target in &fight.targets {
        arena.add_target(target.name.clone(), target.hp);
    }

    // Scheduled before anything else so it wins ties at the stop time.
    arena.end_fight_at(fight.stop_ms())?;

    let resolver = ActionResolver::with_resources(fight.start_ms, &config.resources);
    let name = if config.name.is_empty() { "Player" } else { config.name.as_str() };
    let player = arena.add_player(name, stats, resolver, rotation)?;

    if fight.auto_attacks {
        arena.enable_auto_attacks(player, fight.auto_attack_potency)?;
    }
    if config.statuses.iter().any(|s| s.tick == TickMode::ServerTick) {
        let first = (fight.pull_ms + fight.server_tick_offset_ms).max(fight.start_ms);
        arena.start_server_tick_with(fight.server_tick_ms, first)?;
    }
    if let Some(interval) = fight.marker_interval_ms {
        let mut at = fight.pull_ms + interval;
        let mut id = 0;
        while at <= fight.stop_ms() {
            arena.schedule_marker(id, at)?;
            id += 1;
            at += interval;
        }
    }

    Ok((arena, player))
}

/// Runs the reference fight described by `config`.
pub fn run_fight(config: &SimulationConfig) -> Result<FightOutcome> {
    let (mut arena, player) = build_arena(config)?;
    arena.run()?;

    let ledger = arena.ledger();
    let (executed, skipped) = arena
        .player(player)
        .map_or((0, 0), |p| (p.cursor.executed(), p.cursor.skipped()));
    let outcome = FightOutcome {
        name: config.name.clone(),
        total_mean: ledger.total_mean(),
        total_stddev: ledger.total_variance().sqrt(),
        ledger,
        pull_ms: arena.pull_at(),
        end_ms: arena.fight_end(),
        duration_ms: arena.duration_ms(),
        dps: arena.dps(),
        target_defeated: arena.fight_end() < config.fight.stop_ms(),
        executed,
        skipped,
        timeline: arena
            .dps_timeline()
            .into_iter()
            .map(|(at, dps)| TimelinePoint { at, dps })
            .collect(),
    };

    info!(
        records = outcome.ledger.len(),
        duration_ms = outcome.duration_ms,
        dps = outcome.dps,
        executed,
        skipped,
        "reference fight complete"
    );
    Ok(outcome)
}

/// Runs the reference fight, then resamples its ledger.
pub fn run_and_analyze(
    config: &SimulationConfig,
    mc: &MonteCarloConfig,
) -> Result<(FightOutcome, MonteCarloReport)> {
    let outcome = run_fight(config)?;
    let report = montecarlo::analyze(&outcome.ledger, outcome.duration_ms, mc)?;
    Ok((outcome, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: Samurai
gearset:
  weapon_damage: 146
  main_attribute: 5130
  critical_hit: 420
  determination: 440
  direct_hit: 420
  speed: 420
  weapon_delay: 2.64
  party_bonus: 1.0
actions:
  - name: Gyofu
    gcd: true
    recast_ms: 2500
    effects:
      - type: damage
        potency: 240
rotation:
  entries:
    - action: Gyofu
    - action: Gyofu
    - action: Gyofu
    - action: Gyofu
    - action: Gyofu
    - action: Gyofu
fight:
  duration_ms: 10000
  marker_interval_ms: 5000
"#;

    #[test]
    fn dps_is_total_over_duration() {
        let config = SimulationConfig::from_yaml_str(YAML).unwrap();
        let outcome = run_fight(&config).unwrap();
        assert_eq!(outcome.ledger.len(), 4);
        assert_eq!(outcome.duration_ms, 10_000);
        let expected = outcome.ledger.records().iter().map(|r| r.mean).sum::<f64>() / 10.0;
        assert!((outcome.dps - expected).abs() < 1e-9);
        assert_eq!(outcome.executed, 4);
        assert_eq!(outcome.timeline.len(), 2);
        assert!(!outcome.target_defeated);
    }

    #[test]
    fn scripted_hp_ends_the_fight_early() {
        let yaml = YAML.replace(
            "  marker_interval_ms: 5000\n",
            "  targets:\n    - name: Add\n      hp: 1.0\n",
        );
        let config = SimulationConfig::from_yaml_str(&yaml).unwrap();
        let outcome = run_fight(&config).unwrap();
        assert!(outcome.target_defeated);
        assert_eq!(outcome.ledger.len(), 1);
        assert_eq!(outcome.end_ms, 0);
        assert_eq!(outcome.dps, 0.0);
    }
}
