//! Entities, status effects and the damage ledger.
//!
//! The arena owns every [`Entity`]. Cross references (the applier of a status,
//! the source of a damage record) are [`EntityId`] lookups and never keep the
//! referenced entity alive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::action::{ActionEffect, ActionId};
use crate::arena::Millis;
use crate::formula::{DamageDistribution, DamageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusId(pub u32);

/// When a status delivers its periodic effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TickMode {
    #[default]
    None,
    Interval { interval_ms: Millis },
    ServerTick,
}

/// What re-applying an active status does. Fixed per status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Expiry resets to `now + duration`.
    #[default]
    Refresh,
    /// Duration is added to the remaining time, capped at the max duration.
    Extend,
    /// Stack count increments up to the cap; expiry is untouched.
    Stack,
}

/// A timer a speed modifier can shorten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTimer {
    Cast,
    Recast,
    AutoAttack,
}

/// Set of timers scaled by a status's `speed_multiplier`.
///
/// Written as a list in config, e.g. `speed_scope: [recast, auto_attack]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SpeedTimer>", into = "Vec<SpeedTimer>")]
pub struct SpeedScope {
    pub cast: bool,
    pub recast: bool,
    pub auto_attack: bool,
}

impl SpeedScope {
    pub fn covers(&self, timer: SpeedTimer) -> bool {
        match timer {
            SpeedTimer::Cast => self.cast,
            SpeedTimer::Recast => self.recast,
            SpeedTimer::AutoAttack => self.auto_attack,
        }
    }
}

impl Default for SpeedScope {
    fn default() -> Self {
        Self {
            cast: true,
            recast: true,
            auto_attack: false,
        }
    }
}

impl From<Vec<SpeedTimer>> for SpeedScope {
    fn from(timers: Vec<SpeedTimer>) -> Self {
        Self {
            cast: timers.contains(&SpeedTimer::Cast),
            recast: timers.contains(&SpeedTimer::Recast),
            auto_attack: timers.contains(&SpeedTimer::AutoAttack),
        }
    }
}

impl From<SpeedScope> for Vec<SpeedTimer> {
    fn from(scope: SpeedScope) -> Self {
        [SpeedTimer::Cast, SpeedTimer::Recast, SpeedTimer::AutoAttack]
            .into_iter()
            .filter(|t| scope.covers(*t))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusModifiers {
    pub damage_multiplier: f64,
    pub damage_taken_multiplier: f64,
    pub crit_rate_bonus: f64,
    pub direct_hit_rate_bonus: f64,
    /// Multiplies the timers in `speed_scope`; `0.87` is a 13% haste.
    pub speed_multiplier: f64,
    pub speed_scope: SpeedScope,
    /// Fraction of the holder's main stat added while active (tinctures).
    pub main_stat_bonus: f64,
    /// Cap on the points `main_stat_bonus` adds; uncapped when absent.
    pub main_stat_bonus_max: Option<f64>,
}

impl StatusModifiers {
    /// Main stat points this status adds to a holder with `main_stat`.
    pub fn main_stat_points(&self, main_stat: f64) -> f64 {
        let points = (main_stat * self.main_stat_bonus).floor().max(0.0);
        self.main_stat_bonus_max.map_or(points, |cap| points.min(cap))
    }
}

impl Default for StatusModifiers {
    fn default() -> Self {
        Self {
            damage_multiplier: 1.0,
            damage_taken_multiplier: 1.0,
            crit_rate_bonus: 0.0,
            direct_hit_rate_bonus: 0.0,
            speed_multiplier: 1.0,
            speed_scope: SpeedScope::default(),
            main_stat_bonus: 0.0,
            main_stat_bonus_max: None,
        }
    }
}

/// Registered definition of a status effect.
#[derive(Clone)]
pub struct StatusSpec {
    pub id: StatusId,
    pub name: String,
    pub duration_ms: Millis,
    pub max_duration_ms: Millis,
    pub max_stacks: u32,
    pub tick: TickMode,
    pub refresh: RefreshPolicy,
    pub per_source: bool,
    pub modifiers: StatusModifiers,
    /// Potency of each tick, snapshotted at application.
    pub tick_potency: f64,
    /// Extra callback run on every tick with the applier as caster.
    pub on_tick: Option<Arc<dyn ActionEffect>>,
}

impl std::fmt::Debug for StatusSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("duration_ms", &self.duration_ms)
            .field("tick", &self.tick)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

impl StatusSpec {
    pub fn new(id: StatusId, name: impl Into<String>, duration_ms: Millis) -> Self {
        Self {
            id,
            name: name.into(),
            duration_ms,
            max_duration_ms: duration_ms,
            max_stacks: 1,
            tick: TickMode::None,
            refresh: RefreshPolicy::Refresh,
            per_source: false,
            modifiers: StatusModifiers::default(),
            tick_potency: 0.0,
            on_tick: None,
        }
    }

    pub fn key(&self, source: EntityId) -> StatusKey {
        StatusKey {
            id: self.id,
            source: self.per_source.then_some(source),
        }
    }

    pub fn deals_tick_damage(&self) -> bool {
        self.tick_potency > 0.0 && self.tick != TickMode::None
    }
}

/// Identity of an active status on its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusKey {
    pub id: StatusId,
    pub source: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusInstance {
    pub applied_at: Millis,
    pub expires_at: Millis,
    pub stacks: u32,
    /// Applier, lookup only.
    pub source: EntityId,
    /// Reassigned whenever the expiry moves; stale expiry events carry an older value.
    pub expiry_gen: u64,
    pub next_tick_at: Option<Millis>,
    pub snapshot: Option<DamageDistribution>,
}

impl StatusInstance {
    pub fn remaining(&self, now: Millis) -> Millis {
        (self.expires_at - now).max(0)
    }
}

/// Active statuses of one entity, ordered by key for deterministic iteration.
#[derive(Debug, Clone, Default)]
pub struct StatusSet {
    active: BTreeMap<StatusKey, StatusInstance>,
}

impl StatusSet {
    pub fn get(&self, key: &StatusKey) -> Option<&StatusInstance> {
        self.active.get(key)
    }

    pub fn get_mut(&mut self, key: &StatusKey) -> Option<&mut StatusInstance> {
        self.active.get_mut(key)
    }

    pub fn insert(&mut self, key: StatusKey, instance: StatusInstance) {
        self.active.insert(key, instance);
    }

    pub fn remove(&mut self, key: &StatusKey) -> Option<StatusInstance> {
        self.active.remove(key)
    }

    /// Finds `id` applied by `source`, falling back to an unsourced instance.
    pub fn lookup(&self, id: StatusId, source: EntityId) -> Option<&StatusInstance> {
        self.active
            .get(&StatusKey { id, source: Some(source) })
            .or_else(|| self.active.get(&StatusKey { id, source: None }))
    }

    pub fn has(&self, id: StatusId) -> bool {
        self.active.keys().any(|k| k.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StatusKey, &StatusInstance)> {
        self.active.iter()
    }

    pub fn keys(&self) -> Vec<StatusKey> {
        self.active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HpPool {
    pub max: f64,
    pub current: f64,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub statuses: StatusSet,
    pub hp: Option<HpPool>,
    /// Present on damage-taking entities only.
    pub ledger: Option<DamageLedger>,
}

impl Entity {
    pub fn player(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: EntityKind::Player,
            statuses: StatusSet::default(),
            hp: None,
            ledger: None,
        }
    }

    pub fn target(id: EntityId, name: impl Into<String>, hp: Option<f64>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: EntityKind::Target,
            statuses: StatusSet::default(),
            hp: hp.map(|max| HpPool { max, current: max }),
            ledger: Some(DamageLedger::default()),
        }
    }

    pub fn is_depleted(&self) -> bool {
        matches!(self.hp, Some(pool) if pool.current <= 0.0)
    }
}

/// One damage-dealing resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRecord {
    /// Fight-wide sequence number in event order.
    pub index: usize,
    pub timestamp: Millis,
    #[serde(rename = "ability_label")]
    pub label: String,
    pub mean: f64,
    pub stddev: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<ActionId>,
    pub source: EntityId,
    pub target: EntityId,
    pub kind: DamageKind,
}

/// Append-only damage log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DamageLedger {
    records: Vec<DamageRecord>,
}

impl DamageLedger {
    pub fn push(&mut self, record: DamageRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[DamageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_mean(&self) -> f64 {
        self.records.iter().map(|r| r.mean).sum()
    }

    pub fn total_variance(&self) -> f64 {
        self.records.iter().map(|r| r.stddev * r.stddev).sum()
    }

    /// Merges several ledgers back into fight-wide event order.
    pub fn merged<'a>(ledgers: impl IntoIterator<Item = &'a DamageLedger>) -> DamageLedger {
        let mut records: Vec<DamageRecord> = ledgers
            .into_iter()
            .flat_map(|l| l.records.iter().cloned())
            .collect();
        records.sort_by_key(|r| r.index);
        DamageLedger { records }
    }

    /// Total mean damage per label, in first-seen order.
    pub fn breakdown(&self) -> Vec<(String, usize, f64)> {
        let mut rows: Vec<(String, usize, f64)> = Vec::new();
        for record in &self.records {
            match rows.iter_mut().find(|(label, _, _)| *label == record.label) {
                Some(row) => {
                    row.1 += 1;
                    row.2 += record.mean;
                }
                None => rows.push((record.label.clone(), 1, record.mean)),
            }
        }
        rows
    }
}
