//! Action registry and the effect capability the resolver invokes.
//!
//! Job logic stays outside the engine: an action is a cost/cooldown/combo
//! description plus an [`ActionEffect`]. The built-in effects cover what a
//! config file can express; callers may register their own implementations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::arena::{Arena, Millis};
use crate::config::{ActionRef, EffectConfig, SimulationConfig};
use crate::entity::{EntityId, StatusId, StatusSpec};
use crate::error::{Result, SimError};
use crate::formula::DamageKind;
use crate::resolver::BASE_GCD_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub u32);

/// How an action moves the combo token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboAction {
    /// Leaves the token untouched.
    #[default]
    Neutral,
    Start,
    Continue,
    Break,
}

/// Which side of the cast an effect lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectTarget {
    #[default]
    Target,
    Caster,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCost {
    pub resource: String,
    pub amount: f64,
}

/// Capability invoked by the resolver once an action's preconditions pass.
pub trait ActionEffect: Send + Sync + fmt::Debug {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()>;
}

/// Registered ability.
#[derive(Debug, Clone)]
pub struct ActionDef {
    pub id: ActionId,
    pub name: String,
    pub gcd: bool,
    /// GCD recast for plain GCD actions, the cooldown otherwise.
    pub recast_ms: Millis,
    /// GCD lock of a GCD action that also has its own cooldown.
    pub gcd_recast_ms: Option<Millis>,
    pub cooldown_group: Option<String>,
    pub max_charges: u32,
    pub cast_time_ms: Millis,
    pub animation_lock_ms: Millis,
    pub damage_delay_ms: Millis,
    pub cost: Vec<ResourceCost>,
    pub combo_requires: Option<ActionId>,
    pub combo: ComboAction,
    pub effect: Arc<dyn ActionEffect>,
}

impl ActionDef {
    pub fn new(id: ActionId, name: impl Into<String>, effect: Arc<dyn ActionEffect>) -> Self {
        Self {
            id,
            name: name.into(),
            gcd: false,
            recast_ms: 0,
            gcd_recast_ms: None,
            cooldown_group: None,
            max_charges: 1,
            cast_time_ms: 0,
            animation_lock_ms: crate::resolver::ANIMATION_LOCK_MS,
            damage_delay_ms: 0,
            cost: Vec::new(),
            combo_requires: None,
            combo: ComboAction::Neutral,
            effect,
        }
    }

    pub fn gcd(id: ActionId, name: impl Into<String>, recast_ms: Millis, effect: Arc<dyn ActionEffect>) -> Self {
        Self {
            gcd: true,
            recast_ms,
            ..Self::new(id, name, effect)
        }
    }

    pub fn ogcd(id: ActionId, name: impl Into<String>, cooldown_ms: Millis, effect: Arc<dyn ActionEffect>) -> Self {
        Self {
            recast_ms: cooldown_ms,
            ..Self::new(id, name, effect)
        }
    }

    /// Whether the action has its own cooldown track besides the GCD.
    pub fn has_cooldown(&self) -> bool {
        self.cooldown_group.is_some()
            || self.max_charges > 1
            || (self.recast_ms > 0 && (!self.gcd || self.gcd_recast_ms.is_some()))
    }

    /// Unscaled GCD lock of a GCD action.
    ///
    /// When `recast_ms` belongs to the action's own cooldown, the lock falls
    /// back to [`BASE_GCD_MS`] unless `gcd_recast_ms` says otherwise.
    pub fn gcd_recast(&self) -> Millis {
        match self.gcd_recast_ms {
            Some(ms) => ms,
            None if self.has_cooldown() => BASE_GCD_MS,
            None => self.recast_ms,
        }
    }
}

/// Handle given to an [`ActionEffect`] while it runs.
pub struct EffectContext<'a> {
    arena: &'a mut Arena,
    caster: EntityId,
    target: EntityId,
    action: Option<ActionId>,
    label: String,
    damage_delay_ms: Millis,
}

impl<'a> EffectContext<'a> {
    pub(crate) fn new(
        arena: &'a mut Arena,
        caster: EntityId,
        target: EntityId,
        action: Option<ActionId>,
        label: String,
        damage_delay_ms: Millis,
    ) -> Self {
        Self {
            arena,
            caster,
            target,
            action,
            label,
            damage_delay_ms,
        }
    }

    pub fn now(&self) -> Millis {
        self.arena.now()
    }

    pub fn caster(&self) -> EntityId {
        self.caster
    }

    pub fn target(&self) -> EntityId {
        self.target
    }

    pub fn resolve(&self, on: EffectTarget) -> EntityId {
        match on {
            EffectTarget::Target => self.target,
            EffectTarget::Caster => self.caster,
        }
    }

    /// Records a hit on the target, landing after the action's damage delay.
    pub fn deal_damage(
        &mut self,
        potency: f64,
        kind: DamageKind,
        guaranteed_crit: bool,
        guaranteed_direct_hit: bool,
    ) -> Result<()> {
        let hit = crate::arena::HitRequest {
            label: self.label.clone(),
            action: self.action,
            potency,
            kind,
            guaranteed_crit,
            guaranteed_direct_hit,
        };
        self.arena
            .deal_damage(self.caster, self.target, hit, self.damage_delay_ms)
    }

    pub fn apply_status(&mut self, status: StatusId, on: EffectTarget) -> Result<()> {
        let holder = self.resolve(on);
        self.arena.apply_status(self.caster, holder, status)
    }

    pub fn remove_status(&mut self, status: StatusId, on: EffectTarget) -> bool {
        let holder = self.resolve(on);
        self.arena.remove_status(holder, status, self.caster)
    }

    pub fn has_status(&self, status: StatusId, on: EffectTarget) -> bool {
        let holder = self.resolve(on);
        self.arena
            .entity(holder)
            .is_some_and(|e| e.statuses.lookup(status, self.caster).is_some())
    }

    pub fn gain_resource(&mut self, resource: &str, amount: f64) {
        self.arena.gain_resource(self.caster, resource, amount);
    }

    pub fn resource(&self, resource: &str) -> f64 {
        self.arena.resource(self.caster, resource)
    }

    /// Schedules a checkpoint marker; `at` must not be in the past.
    pub fn schedule_marker(&mut self, id: u64, at: Millis) -> Result<()> {
        self.arena.schedule_marker(id, at)
    }
}

#[derive(Debug, Clone)]
pub struct Damage {
    pub potency: f64,
    pub kind: DamageKind,
    pub guaranteed_crit: bool,
    pub guaranteed_direct_hit: bool,
}

impl Damage {
    pub fn new(potency: f64) -> Self {
        Self {
            potency,
            kind: DamageKind::Weaponskill,
            guaranteed_crit: false,
            guaranteed_direct_hit: false,
        }
    }
}

impl ActionEffect for Damage {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()> {
        ctx.deal_damage(
            self.potency,
            self.kind,
            self.guaranteed_crit,
            self.guaranteed_direct_hit,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApplyStatus {
    pub status: StatusId,
    pub on: EffectTarget,
}

impl ActionEffect for ApplyStatus {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()> {
        ctx.apply_status(self.status, self.on)
    }
}

#[derive(Debug, Clone)]
pub struct RemoveStatus {
    pub status: StatusId,
    pub on: EffectTarget,
}

impl ActionEffect for RemoveStatus {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()> {
        ctx.remove_status(self.status, self.on);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GainResource {
    pub resource: String,
    pub amount: f64,
}

impl ActionEffect for GainResource {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()> {
        ctx.gain_resource(&self.resource, self.amount);
        Ok(())
    }
}

/// Runs effects in order, stopping at the first error.
#[derive(Debug, Clone, Default)]
pub struct Sequence(pub Vec<Arc<dyn ActionEffect>>);

impl ActionEffect for Sequence {
    fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<()> {
        for effect in &self.0 {
            effect.apply(ctx)?;
        }
        Ok(())
    }
}

/// Lookup table of actions and statuses, shared read-only by every player.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<ActionId, Arc<ActionDef>>,
    action_names: HashMap<String, ActionId>,
    statuses: Vec<Arc<StatusSpec>>,
    status_names: HashMap<String, StatusId>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: ActionDef) -> Result<ActionId> {
        if self.actions.contains_key(&def.id) {
            return Err(SimError::config(format!("action id {} registered twice", def.id.0)));
        }
        if self.action_names.contains_key(&def.name) {
            return Err(SimError::config(format!("action `{}` registered twice", def.name)));
        }
        if let Some(required) = def.combo_requires {
            if required != def.id && !self.actions.contains_key(&required) {
                return Err(SimError::UnknownAction(format!("#{}", required.0)));
            }
        }
        let id = def.id;
        self.action_names.insert(def.name.clone(), id);
        self.actions.insert(id, Arc::new(def));
        Ok(id)
    }

    /// Registers a status; its id is assigned from the catalog position.
    pub fn register_status(&mut self, mut spec: StatusSpec) -> Result<StatusId> {
        if self.status_names.contains_key(&spec.name) {
            return Err(SimError::config(format!("status `{}` registered twice", spec.name)));
        }
        let id = StatusId(self.statuses.len() as u32);
        spec.id = id;
        self.status_names.insert(spec.name.clone(), id);
        self.statuses.push(Arc::new(spec));
        Ok(id)
    }

    pub fn get(&self, id: ActionId) -> Option<&Arc<ActionDef>> {
        self.actions.get(&id)
    }

    pub fn action(&self, id: ActionId) -> Result<&Arc<ActionDef>> {
        self.actions
            .get(&id)
            .ok_or_else(|| SimError::UnknownAction(format!("#{}", id.0)))
    }

    pub fn resolve(&self, reference: &ActionRef) -> Result<ActionId> {
        match reference {
            ActionRef::Id(raw) if self.actions.contains_key(&ActionId(*raw)) => Ok(ActionId(*raw)),
            ActionRef::Name(name) => self
                .action_names
                .get(name)
                .copied()
                .ok_or_else(|| SimError::UnknownAction(name.clone())),
            other => Err(SimError::UnknownAction(other.to_string())),
        }
    }

    pub fn status(&self, id: StatusId) -> Option<&Arc<StatusSpec>> {
        self.statuses.get(id.0 as usize)
    }

    pub fn status_id(&self, name: &str) -> Result<StatusId> {
        self.status_names
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownStatus(name.to_string()))
    }

    pub fn actions(&self) -> impl Iterator<Item = &Arc<ActionDef>> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Builds the registry described by a config file.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let mut registry = Self::new();

        for status in &config.statuses {
            let spec = StatusSpec {
                max_duration_ms: status.max_duration_ms.unwrap_or(status.duration_ms),
                max_stacks: status.max_stacks,
                tick: status.tick,
                refresh: status.refresh,
                per_source: status.per_source,
                modifiers: status.modifiers,
                tick_potency: status.tick_potency,
                ..StatusSpec::new(StatusId(0), status.name.clone(), status.duration_ms)
            };
            registry.register_status(spec)?;
        }

        let ids: Vec<ActionId> = config
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| ActionId(a.id.unwrap_or(i as u32)))
            .collect();
        let lookup = |reference: &ActionRef| -> Result<ActionId> {
            match reference {
                ActionRef::Id(raw) if ids.contains(&ActionId(*raw)) => Ok(ActionId(*raw)),
                ActionRef::Name(name) => config
                    .actions
                    .iter()
                    .position(|a| &a.name == name)
                    .map(|i| ids[i])
                    .ok_or_else(|| SimError::UnknownAction(name.clone())),
                other => Err(SimError::UnknownAction(other.to_string())),
            }
        };

        // Combo prerequisites may point forward in the catalog, so resolve them
        // all before registering anything.
        let mut defs = Vec::with_capacity(config.actions.len());
        for (action, &id) in config.actions.iter().zip(&ids) {
            let mut effects: Vec<Arc<dyn ActionEffect>> = Vec::with_capacity(action.effects.len());
            for effect in &action.effects {
                effects.push(registry.build_effect(effect)?);
            }
            let effect: Arc<dyn ActionEffect> = if effects.len() == 1 {
                effects.remove(0)
            } else {
                Arc::new(Sequence(effects))
            };

            defs.push(ActionDef {
                gcd: action.gcd,
                recast_ms: action.recast_ms,
                gcd_recast_ms: action.gcd_recast_ms,
                cooldown_group: action.cooldown_group.clone(),
                max_charges: action.max_charges,
                cast_time_ms: action.cast_time_ms,
                animation_lock_ms: action.animation_lock_ms,
                damage_delay_ms: action.damage_delay_ms,
                cost: action
                    .cost
                    .iter()
                    .map(|c| ResourceCost {
                        resource: c.resource.clone(),
                        amount: c.amount,
                    })
                    .collect(),
                combo_requires: action.combo_requires.as_ref().map(lookup).transpose()?,
                combo: action.combo,
                ..ActionDef::new(id, action.name.clone(), effect)
            });
        }

        // Register prerequisites before their dependents.
        let mut pending = defs;
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for def in pending {
                let ready = def
                    .combo_requires
                    .map_or(true, |r| r == def.id || registry.actions.contains_key(&r));
                if ready {
                    registry.register(def)?;
                } else {
                    deferred.push(def);
                }
            }
            if deferred.len() == before {
                return Err(SimError::config("combo prerequisites form a cycle"));
            }
            pending = deferred;
        }

        Ok(registry)
    }

    fn build_effect(&self, effect: &EffectConfig) -> Result<Arc<dyn ActionEffect>> {
        let built: Arc<dyn ActionEffect> = match effect {
            EffectConfig::Damage {
                potency,
                kind,
                guaranteed_crit,
                guaranteed_direct_hit,
            } => Arc::new(Damage {
                potency: *potency,
                kind: *kind,
                guaranteed_crit: *guaranteed_crit,
                guaranteed_direct_hit: *guaranteed_direct_hit,
            }),
            EffectConfig::ApplyStatus { status, on } => Arc::new(ApplyStatus {
                status: self.status_id(status)?,
                on: *on,
            }),
            EffectConfig::RemoveStatus { status, on } => Arc::new(RemoveStatus {
                status: self.status_id(status)?,
                on: *on,
            }),
            EffectConfig::GainResource { resource, amount } => Arc::new(GainResource {
                resource: resource.clone(),
                amount: *amount,
            }),
        };
        Ok(built)
    }
}
