//! Configuration structures for loading simulation YAML/JSON files
//!
//! A config file carries everything one reference fight needs: the gearset,
//! resource gauges, the status and action catalogs, the rotation, the fight
//! window and the Monte Carlo settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::action::{ComboAction, EffectTarget};
use crate::arena::Millis;
use crate::entity::{RefreshPolicy, StatusModifiers, TickMode};
use crate::error::{Result, SimError};
use crate::formula::{DamageKind, VarianceBand};
use crate::montecarlo::MonteCarloConfig;
use crate::rotation::Condition;

/// Immutable per-fight character snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gearset {
    pub weapon_damage: f64,
    pub main_attribute: f64,
    pub critical_hit: f64,
    pub determination: f64,
    pub direct_hit: f64,
    pub speed: f64,
    /// Auto-attack delay in seconds.
    pub weapon_delay: f64,
    pub party_bonus: f64,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default = "default_job_modifier")]
    pub job_modifier: f64,
    #[serde(default = "default_trait_multiplier")]
    pub trait_multiplier: f64,
}

fn default_level() -> u32 {
    100
}

fn default_job_modifier() -> f64 {
    100.0
}

fn default_trait_multiplier() -> f64 {
    1.0
}

impl Gearset {
    /// All numeric fields must be finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("weapon_damage", self.weapon_damage),
            ("main_attribute", self.main_attribute),
            ("critical_hit", self.critical_hit),
            ("determination", self.determination),
            ("direct_hit", self.direct_hit),
            ("speed", self.speed),
            ("weapon_delay", self.weapon_delay),
            ("party_bonus", self.party_bonus),
            ("job_modifier", self.job_modifier),
            ("trait_multiplier", self.trait_multiplier),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::config(format!(
                    "gearset field `{name}` must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// A gauge such as Kenki or Meditation stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub initial: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    pub name: String,
    pub duration_ms: Millis,
    /// Cap for the `extend` refresh policy; defaults to the duration.
    #[serde(default)]
    pub max_duration_ms: Option<Millis>,
    #[serde(default = "default_stacks")]
    pub max_stacks: u32,
    #[serde(default)]
    pub tick: TickMode,
    #[serde(default)]
    pub refresh: RefreshPolicy,
    /// Track one instance per applier (DoTs) instead of one per holder.
    #[serde(default)]
    pub per_source: bool,
    #[serde(default)]
    pub modifiers: StatusModifiers,
    #[serde(default)]
    pub tick_potency: f64,
}

fn default_stacks() -> u32 {
    1
}

/// Reference to an action by numeric id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionRef {
    Id(u32),
    Name(String),
}

impl std::fmt::Display for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionRef::Id(id) => write!(f, "#{id}"),
            ActionRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub resource: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectConfig {
    Damage {
        potency: f64,
        #[serde(default)]
        kind: DamageKind,
        #[serde(default)]
        guaranteed_crit: bool,
        #[serde(default)]
        guaranteed_direct_hit: bool,
    },
    ApplyStatus {
        status: String,
        #[serde(default)]
        on: EffectTarget,
    },
    RemoveStatus {
        status: String,
        #[serde(default)]
        on: EffectTarget,
    },
    GainResource {
        resource: String,
        amount: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    /// Assigned from the catalog position when omitted.
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub gcd: bool,
    #[serde(default)]
    pub recast_ms: Millis,
    /// GCD lock when `recast_ms` is the action's own cooldown.
    #[serde(default)]
    pub gcd_recast_ms: Option<Millis>,
    #[serde(default)]
    pub cooldown_group: Option<String>,
    #[serde(default = "default_charges")]
    pub max_charges: u32,
    #[serde(default)]
    pub cast_time_ms: Millis,
    #[serde(default = "default_animation_lock")]
    pub animation_lock_ms: Millis,
    #[serde(default)]
    pub damage_delay_ms: Millis,
    #[serde(default)]
    pub cost: Vec<ResourceAmount>,
    #[serde(default)]
    pub combo_requires: Option<ActionRef>,
    #[serde(default)]
    pub combo: ComboAction,
    #[serde(default)]
    pub effects: Vec<EffectConfig>,
}

fn default_charges() -> u32 {
    1
}

fn default_animation_lock() -> Millis {
    crate::resolver::ANIMATION_LOCK_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEntryConfig {
    pub action: ActionRef,
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Earliest execution time.
    #[serde(default)]
    pub at: Option<Millis>,
    /// Index into `fight.targets`.
    #[serde(default)]
    pub target: Option<usize>,
    #[serde(default)]
    pub wait_for_resource_ms: Option<Millis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub name: String,
    pub entries: Vec<RotationEntryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Scripted HP; the fight ends once mean damage exhausts it.
    #[serde(default)]
    pub hp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FightConfig {
    #[serde(default = "default_start")]
    pub start_ms: Millis,
    #[serde(default)]
    pub pull_ms: Millis,
    pub duration_ms: Millis,
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub auto_attacks: bool,
    #[serde(default = "default_auto_potency")]
    pub auto_attack_potency: f64,
    #[serde(default = "default_server_tick")]
    pub server_tick_ms: Millis,
    #[serde(default)]
    pub server_tick_offset_ms: Millis,
    #[serde(default)]
    pub variance: VarianceBand,
    #[serde(default = "default_resource_poll")]
    pub resource_poll_ms: Millis,
    /// Interval for DPS-over-time markers.
    #[serde(default)]
    pub marker_interval_ms: Option<Millis>,
    #[serde(default)]
    pub trace: bool,
}

fn default_start() -> Millis {
    crate::arena::PRE_PULL_MS
}

fn default_targets() -> Vec<TargetConfig> {
    vec![TargetConfig {
        name: "Striking Dummy".to_string(),
        hp: None,
    }]
}

fn default_auto_potency() -> f64 {
    90.0
}

fn default_server_tick() -> Millis {
    crate::arena::SERVER_TICK_MS
}

fn default_resource_poll() -> Millis {
    100
}

impl FightConfig {
    pub fn stop_ms(&self) -> Millis {
        self.pull_ms + self.duration_ms
    }
}

/// Full simulation configuration loaded from YAML/JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub name: String,
    pub gearset: Gearset,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub statuses: Vec<StatusConfig>,
    pub actions: Vec<ActionConfig>,
    pub rotation: RotationConfig,
    pub fight: FightConfig,
    #[serde(default)]
    pub montecarlo: MonteCarloConfig,
}

impl SimulationConfig {
    /// Load a configuration file, JSON by extension, YAML otherwise.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let path_str = path.as_ref().to_string_lossy().to_lowercase();

        let config: SimulationConfig = if path_str.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string (for Python interop)
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SimulationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need the action registry.
    pub fn validate(&self) -> Result<()> {
        self.gearset.validate()?;
        self.fight.variance.validate()?;

        if self.fight.duration_ms <= 0 {
            return Err(SimError::config("fight duration must be positive"));
        }
        if self.fight.start_ms > self.fight.pull_ms {
            return Err(SimError::config("fight start must not be after the pull"));
        }
        if self.fight.targets.is_empty() {
            return Err(SimError::config("at least one target is required"));
        }
        if self.fight.server_tick_ms <= 0 || self.fight.resource_poll_ms <= 0 {
            return Err(SimError::config("tick and poll intervals must be positive"));
        }
        if let Some(interval) = self.fight.marker_interval_ms {
            if interval <= 0 {
                return Err(SimError::config("marker interval must be positive"));
            }
        }
        for target in &self.fight.targets {
            if matches!(target.hp, Some(hp) if !(hp > 0.0)) {
                return Err(SimError::config(format!(
                    "target `{}` must have positive HP",
                    target.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.name.as_str()) {
                return Err(SimError::config(format!("duplicate resource `{}`", resource.name)));
            }
            if resource.max < 0.0 || resource.initial < 0.0 || resource.initial > resource.max {
                return Err(SimError::config(format!(
                    "resource `{}` must satisfy 0 <= initial <= max",
                    resource.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for status in &self.statuses {
            if !seen.insert(status.name.as_str()) {
                return Err(SimError::config(format!("duplicate status `{}`", status.name)));
            }
            if status.duration_ms < 0 || status.max_stacks == 0 || status.tick_potency < 0.0 {
                return Err(SimError::config(format!(
                    "status `{}` has a negative duration, potency or zero stacks",
                    status.name
                )));
            }
            if let TickMode::Interval { interval_ms } = status.tick {
                if interval_ms <= 0 {
                    return Err(SimError::config(format!(
                        "status `{}` tick interval must be positive",
                        status.name
                    )));
                }
            }
            let m = &status.modifiers;
            if m.speed_multiplier <= 0.0
                || m.main_stat_bonus < 0.0
                || m.main_stat_bonus_max.is_some_and(|cap| cap < 0.0)
            {
                return Err(SimError::config(format!(
                    "status `{}` has a non-positive speed multiplier or a negative main stat bonus",
                    status.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for action in &self.actions {
            if !seen.insert(action.name.as_str()) {
                return Err(SimError::config(format!("duplicate action `{}`", action.name)));
            }
            let timings = [
                action.recast_ms,
                action.gcd_recast_ms.unwrap_or(0),
                action.cast_time_ms,
                action.animation_lock_ms,
                action.damage_delay_ms,
            ];
            if timings.iter().any(|t| *t < 0) || action.max_charges == 0 {
                return Err(SimError::config(format!(
                    "action `{}` has negative timings or zero charges",
                    action.name
                )));
            }
            if action.gcd_recast_ms.is_some() && !action.gcd {
                return Err(SimError::config(format!(
                    "action `{}` sets gcd_recast_ms but is not on the GCD",
                    action.name
                )));
            }
            if action.cost.iter().any(|c| c.amount < 0.0) {
                return Err(SimError::config(format!(
                    "action `{}` has a negative resource cost",
                    action.name
                )));
            }
            for effect in &action.effects {
                let bad = match effect {
                    EffectConfig::Damage { potency, .. } => *potency < 0.0,
                    EffectConfig::GainResource { amount, .. } => !amount.is_finite(),
                    _ => false,
                };
                if bad {
                    return Err(SimError::config(format!(
                        "action `{}` has an invalid effect",
                        action.name
                    )));
                }
            }
        }

        for entry in &self.rotation.entries {
            if let Some(target) = entry.target {
                if target >= self.fight.targets.len() {
                    return Err(SimError::config(format!(
                        "rotation entry `{}` targets slot {target} but only {} targets exist",
                        entry.action,
                        self.fight.targets.len()
                    )));
                }
            }
            if matches!(entry.wait_for_resource_ms, Some(w) if w < 0) {
                return Err(SimError::config("resource wait bound must be non-negative"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
gearset:
  weapon_damage: 146
  main_attribute: 5130
  critical_hit: 3174
  determination: 2080
  direct_hit: 1311
  speed: 420
  weapon_delay: 2.64
  party_bonus: 1.05
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
    - action: 0
fight:
  duration_ms: 10000
"#;

    #[test]
    fn yaml_defaults_are_filled() {
        let config = SimulationConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.gearset.level, 100);
        assert_eq!(config.gearset.job_modifier, 100.0);
        assert_eq!(config.fight.start_ms, -30_000);
        assert_eq!(config.fight.targets.len(), 1);
        assert_eq!(config.actions[0].animation_lock_ms, 700);
        assert_eq!(config.rotation.entries[1].action, ActionRef::Id(0));
        assert_eq!(config.fight.variance, VarianceBand::Uniform { half_width: 0.05 });
    }

    #[test]
    fn negative_gear_is_rejected() {
        let yaml = MINIMAL.replace("speed: 420", "speed: -1");
        let err = SimulationConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, SimError::Configuration { .. }));
    }

    #[test]
    fn missing_gear_field_is_a_parse_error() {
        let yaml = MINIMAL.replace("  party_bonus: 1.05\n", "");
        assert!(matches!(
            SimulationConfig::from_yaml_str(&yaml),
            Err(SimError::Yaml(_))
        ));
    }

    #[test]
    fn out_of_range_target_slot_is_rejected() {
        let yaml = MINIMAL.replace("    - action: 0\n", "    - action: 0\n      target: 3\n");
        assert!(SimulationConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn gcd_recast_needs_a_gcd_action() {
        let on_gcd = MINIMAL.replace("    recast_ms: 2500\n", "    recast_ms: 60000\n    gcd_recast_ms: 2500\n");
        let config = SimulationConfig::from_yaml_str(&on_gcd).unwrap();
        assert_eq!(config.actions[0].gcd_recast_ms, Some(2500));

        let off_gcd = on_gcd.replace("    gcd: true\n", "");
        assert!(matches!(
            SimulationConfig::from_yaml_str(&off_gcd),
            Err(SimError::Configuration { .. })
        ));
    }
}
