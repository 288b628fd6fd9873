//! Discrete-event fight engine.
//!
//! The [`Arena`] owns the clock, the event queue and every entity in the
//! fight. Events are ordered by timestamp and, for equal timestamps, by the
//! order they were scheduled. Handlers run to completion and may schedule
//! further events, never in the past.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::action::{ActionDef, ActionId, ActionRegistry, EffectContext};
use crate::entity::{
    DamageLedger, DamageRecord, Entity, EntityId, RefreshPolicy, SpeedTimer, StatusId,
    StatusInstance, StatusKey, TickMode,
};
use crate::error::{Result, SimError};
use crate::formula::{DamageDistribution, DamageKind, HitModifiers, StatModel};
use crate::resolver::{ActionResolver, Blocked, Execution};
use crate::rotation::{ConditionView, Rotation, RotationCursor};

/// Simulation time in milliseconds. Negative values are pre-pull.
pub type Millis = i64;

pub const PRE_PULL_MS: Millis = -30_000;
pub const SERVER_TICK_MS: Millis = 3_000;

/// A hit whose distribution is fixed but which has not landed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHit {
    pub source: EntityId,
    pub target: EntityId,
    pub label: String,
    pub action: Option<ActionId>,
    pub kind: DamageKind,
    pub distribution: DamageDistribution,
}

/// Damage requested by an effect; resolved against the caster's stats.
#[derive(Debug, Clone, PartialEq)]
pub struct HitRequest {
    pub label: String,
    pub action: Option<ActionId>,
    pub potency: f64,
    pub kind: DamageKind,
    pub guaranteed_crit: bool,
    pub guaranteed_direct_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RotationAdvance { player: EntityId },
    CastComplete { player: EntityId, action: ActionId, target: EntityId },
    DamageLanded(PendingHit),
    StatusTick { holder: EntityId, key: StatusKey },
    StatusExpire { holder: EntityId, key: StatusKey, gen: u64 },
    ServerTick,
    AutoAttack { player: EntityId },
    Marker(u64),
    FightEnd,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RotationAdvance { .. } => "rotation_advance",
            Event::CastComplete { .. } => "cast_complete",
            Event::DamageLanded(_) => "damage_landed",
            Event::StatusTick { .. } => "status_tick",
            Event::StatusExpire { .. } => "status_expire",
            Event::ServerTick => "server_tick",
            Event::AutoAttack { .. } => "auto_attack",
            Event::Marker(_) => "marker",
            Event::FightEnd => "fight_end",
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    at: Millis,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; seq keeps equal timestamps FIFO
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One dispatched event, recorded when tracing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub at: Millis,
    pub seq: u64,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerPoint {
    pub id: u64,
    pub at: Millis,
    pub cumulative_mean: f64,
}

/// Arena-side state of a player character.
#[derive(Debug, Clone)]
pub struct Player {
    pub entity: EntityId,
    pub stats: StatModel,
    pub resolver: ActionResolver,
    pub rotation: Rotation,
    pub cursor: RotationCursor,
    pub default_target: EntityId,
    pub auto_attack_potency: Option<f64>,
}

pub struct Arena {
    now: Millis,
    seq: u64,
    queue: BinaryHeap<Scheduled>,
    entities: Vec<Entity>,
    players: BTreeMap<EntityId, Player>,
    targets: Vec<EntityId>,
    registry: Arc<ActionRegistry>,
    pull_at: Millis,
    stop_at: Option<Millis>,
    ended_at: Option<Millis>,
    server_tick_ms: Option<Millis>,
    resource_poll_ms: Millis,
    next_record: usize,
    /// Source of expiry generations; never reused within a fight.
    status_gen: u64,
    trace: Option<Vec<TraceEntry>>,
    markers: Vec<MarkerPoint>,
}

impl Arena {
    pub fn new(start: Millis, registry: Arc<ActionRegistry>) -> Self {
        Self {
            now: start,
            seq: 0,
            queue: BinaryHeap::new(),
            entities: Vec::new(),
            players: BTreeMap::new(),
            targets: Vec::new(),
            registry,
            pull_at: start.max(0),
            stop_at: None,
            ended_at: None,
            server_tick_ms: None,
            resource_poll_ms: 100,
            next_record: 0,
            status_gen: 0,
            trace: None,
            markers: Vec::new(),
        }
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn pull_at(&self) -> Millis {
        self.pull_at
    }

    pub fn set_pull(&mut self, at: Millis) {
        self.pull_at = at;
    }

    pub fn set_resource_poll(&mut self, poll_ms: Millis) {
        self.resource_poll_ms = poll_ms.max(1);
    }

    pub fn enable_trace(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    pub fn trace(&self) -> Option<&[TraceEntry]> {
        self.trace.as_deref()
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0)
    }

    pub fn player(&self, id: EntityId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn targets(&self) -> &[EntityId] {
        &self.targets
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn add_target(&mut self, name: impl Into<String>, hp: Option<f64>) -> EntityId {
        let id = EntityId(self.entities.len());
        self.entities.push(Entity::target(id, name, hp));
        self.targets.push(id);
        id
    }

    /// Adds a player whose rotation starts at the pull, or earlier if its
    /// first entry is timed pre-pull.
    pub fn add_player(
        &mut self,
        name: impl Into<String>,
        stats: StatModel,
        resolver: ActionResolver,
        rotation: Rotation,
    ) -> Result<EntityId> {
        let default_target = *self
            .targets
            .first()
            .ok_or_else(|| SimError::config("players need a target to attack"))?;
        let id = EntityId(self.entities.len());
        self.entities.push(Entity::player(id, name));

        let first_at = rotation
            .entries()
            .first()
            .and_then(|e| e.at)
            .map_or(self.pull_at, |at| at.min(self.pull_at))
            .max(self.now);
        self.players.insert(
            id,
            Player {
                entity: id,
                stats,
                resolver,
                rotation,
                cursor: RotationCursor::default(),
                default_target,
                auto_attack_potency: None,
            },
        );
        self.schedule(Event::RotationAdvance { player: id }, first_at)?;
        Ok(id)
    }

    /// Swings every weapon delay from the pull while not casting.
    pub fn enable_auto_attacks(&mut self, player: EntityId, potency: f64) -> Result<()> {
        let p = self
            .players
            .get_mut(&player)
            .ok_or_else(|| SimError::config(format!("entity {} is not a player", player.0)))?;
        p.auto_attack_potency = Some(potency);
        let at = self.pull_at.max(self.now);
        self.schedule(Event::AutoAttack { player }, at)?;
        Ok(())
    }

    /// Fixes the end of the half-open fight window `[pull, stop)`.
    pub fn end_fight_at(&mut self, stop: Millis) -> Result<()> {
        self.schedule(Event::FightEnd, stop)?;
        self.stop_at = Some(stop);
        Ok(())
    }

    pub fn start_server_tick(&mut self) -> Result<()> {
        let first = self.now;
        self.start_server_tick_with(SERVER_TICK_MS, first)
    }

    pub fn start_server_tick_with(&mut self, interval_ms: Millis, first_at: Millis) -> Result<()> {
        if interval_ms <= 0 {
            return Err(SimError::config("server tick interval must be positive"));
        }
        self.server_tick_ms = Some(interval_ms);
        self.schedule(Event::ServerTick, first_at)?;
        Ok(())
    }

    pub fn schedule_marker(&mut self, id: u64, at: Millis) -> Result<()> {
        self.schedule(Event::Marker(id), at).map(|_| ())
    }

    /// Queues `event` at `at`. Scheduling in the past is an engine bug.
    pub fn schedule(&mut self, event: Event, at: Millis) -> Result<u64> {
        if at < self.now {
            return Err(SimError::SchedulingViolation { at, now: self.now });
        }
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Scheduled { at, seq, event });
        Ok(seq)
    }

    /// Advances the clock by `advance_by`, dispatching every event due at or
    /// before the new time.
    pub fn step(&mut self, advance_by: Millis) -> Result<()> {
        if advance_by < 0 {
            return Err(SimError::SchedulingViolation {
                at: self.now + advance_by,
                now: self.now,
            });
        }
        let target = self.now + advance_by;
        while self.queue.peek().is_some_and(|s| s.at <= target) {
            let Some(next) = self.queue.pop() else { break };
            self.now = next.at;
            if let Some(trace) = self.trace.as_mut() {
                trace.push(TraceEntry {
                    at: next.at,
                    seq: next.seq,
                    kind: next.event.kind(),
                });
            }
            self.dispatch(next.event)?;
        }
        self.now = target;
        Ok(())
    }

    pub fn run_until(&mut self, at: Millis) -> Result<()> {
        self.step((at - self.now).max(0))
    }

    /// Runs to the stop time set by [`Arena::end_fight_at`].
    pub fn run(&mut self) -> Result<()> {
        let stop = self
            .stop_at
            .ok_or_else(|| SimError::config("fight has no stop time"))?;
        info!(pull = self.pull_at, stop, players = self.players.len(), "fight started");
        self.run_until(stop)
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::FightEnd => {
                self.finish("time limit");
                Ok(())
            }
            Event::Marker(id) => {
                let cumulative_mean = self.total_damage();
                self.markers.push(MarkerPoint {
                    id,
                    at: self.now,
                    cumulative_mean,
                });
                Ok(())
            }
            Event::StatusExpire { holder, key, gen } => self.on_status_expire(holder, key, gen),
            _ if self.is_ended() => Ok(()),
            Event::RotationAdvance { player } => self.advance_rotation(player),
            Event::CastComplete {
                player,
                action,
                target,
            } => {
                let def = Arc::clone(self.registry.action(action)?);
                debug!(action = %def.name, at = self.now, "cast completes");
                self.resolve_effect(player, &def, target)
            }
            Event::DamageLanded(hit) => {
                self.record_hit(hit);
                Ok(())
            }
            Event::StatusTick { holder, key } => self.on_status_tick(holder, key),
            Event::ServerTick => self.on_server_tick(),
            Event::AutoAttack { player } => self.on_auto_attack(player),
        }
    }

    fn finish(&mut self, reason: &str) {
        if self.ended_at.is_none() {
            self.ended_at = Some(self.now);
            info!(at = self.now, reason, total = self.total_damage(), "fight ended");
        }
    }

    /// Attempts `action` for `player` at the current time.
    ///
    /// The outer `Result` carries engine errors; the inner one the
    /// precondition outcome.
    pub fn try_execute(
        &mut self,
        player: EntityId,
        action: ActionId,
        target: EntityId,
    ) -> Result<std::result::Result<Execution, Blocked>> {
        let def = Arc::clone(self.registry.action(action)?);
        let recast_speed = self.speed_multiplier(player, SpeedTimer::Recast);
        let cast_speed = self.speed_multiplier(player, SpeedTimer::Cast);
        let now = self.now;
        let p = self
            .players
            .get_mut(&player)
            .ok_or_else(|| SimError::config(format!("entity {} is not a player", player.0)))?;
        let (gcd_length, cast_time) = if def.gcd {
            let cast = (def.cast_time_ms as f64 * cast_speed / 10.0).floor() as Millis * 10;
            (p.stats.gcd_length(def.gcd_recast(), recast_speed), cast)
        } else {
            (0, def.cast_time_ms)
        };

        let execution = match p.resolver.try_begin_with_cast(&def, now, gcd_length, cast_time) {
            Ok(execution) => execution,
            Err(blocked) => {
                debug!(action = %def.name, at = now, ?blocked, "action blocked");
                return Ok(Err(blocked));
            }
        };

        if cast_time > 0 {
            self.schedule(
                Event::CastComplete {
                    player,
                    action,
                    target,
                },
                execution.effect_at,
            )?;
        } else {
            self.resolve_effect(player, &def, target)?;
        }
        Ok(Ok(execution))
    }

    fn resolve_effect(&mut self, player: EntityId, def: &ActionDef, target: EntityId) -> Result<()> {
        let effect = Arc::clone(&def.effect);
        let mut ctx = EffectContext::new(
            self,
            player,
            target,
            Some(def.id),
            def.name.clone(),
            def.damage_delay_ms,
        );
        effect.apply(&mut ctx)
    }

    fn advance_rotation(&mut self, id: EntityId) -> Result<()> {
        loop {
            let Some(player) = self.players.get(&id) else {
                return Ok(());
            };
            let Some(entry) = player.cursor.current(&player.rotation).cloned() else {
                debug!(player = id.0, at = self.now, "rotation exhausted");
                return Ok(());
            };

            if let Some(at) = entry.at {
                if self.now < at {
                    self.schedule(Event::RotationAdvance { player: id }, at)?;
                    return Ok(());
                }
            }

            let target = entry
                .target
                .and_then(|slot| self.targets.get(slot).copied())
                .unwrap_or(player.default_target);

            if let Some(condition) = &entry.condition {
                if !condition.evaluate(&self.condition_view(id, target)?) {
                    warn!(player = id.0, action = entry.action.0, at = self.now, "condition failed, entry skipped");
                    self.cursor_mut(id)?.skip();
                    continue;
                }
            }

            let blocked = match self.try_execute(id, entry.action, target)? {
                Ok(execution) => {
                    self.cursor_mut(id)?.advance();
                    let next = execution.next_action_at.max(self.now);
                    self.schedule(Event::RotationAdvance { player: id }, next)?;
                    return Ok(());
                }
                Err(blocked) => blocked,
            };

            if let Some(ready_at) = blocked.ready_at() {
                self.schedule(Event::RotationAdvance { player: id }, ready_at)?;
                return Ok(());
            }

            if let Blocked::InsufficientResource { resource, have, need } = &blocked {
                let now = self.now;
                let poll = self.resource_poll_ms;
                let bound = entry.wait_for_resource_ms.unwrap_or(0);
                let since = self.cursor_mut(id)?.begin_wait(now);
                if now + poll <= since + bound {
                    self.schedule(Event::RotationAdvance { player: id }, now + poll)?;
                    return Ok(());
                }
                warn!(
                    player = id.0,
                    action = entry.action.0,
                    resource = %resource,
                    have,
                    need,
                    waited = now - since,
                    "resource wait exhausted, entry skipped"
                );
            } else {
                warn!(player = id.0, action = entry.action.0, at = self.now, ?blocked, "entry skipped");
            }
            self.cursor_mut(id)?.skip();
        }
    }

    fn cursor_mut(&mut self, id: EntityId) -> Result<&mut RotationCursor> {
        self.players
            .get_mut(&id)
            .map(|p| &mut p.cursor)
            .ok_or_else(|| SimError::config(format!("entity {} is not a player", id.0)))
    }

    fn condition_view(&self, player: EntityId, target: EntityId) -> Result<ConditionView<'_>> {
        let missing = |id: EntityId| SimError::config(format!("unknown entity {}", id.0));
        let p = self.players.get(&player).ok_or_else(|| missing(player))?;
        Ok(ConditionView {
            registry: &self.registry,
            resolver: &p.resolver,
            caster: self.entities.get(player.0).ok_or_else(|| missing(player))?,
            target: self.entities.get(target.0).ok_or_else(|| missing(target))?,
            now: self.now,
        })
    }

    /// Buff and debuff totals applying to a hit from `source` on `target`.
    pub fn hit_modifiers(
        &self,
        source: EntityId,
        target: EntityId,
        guaranteed_crit: bool,
        guaranteed_direct_hit: bool,
    ) -> HitModifiers {
        let mut hit = HitModifiers {
            guaranteed_crit,
            guaranteed_direct_hit,
            ..HitModifiers::default()
        };
        let main_stat = self.players.get(&source).map_or(0.0, |p| p.stats.main_stat);
        if let Some(caster) = self.entities.get(source.0) {
            for (key, _) in caster.statuses.iter() {
                if let Some(spec) = self.registry.status(key.id) {
                    hit.damage_multiplier *= spec.modifiers.damage_multiplier;
                    hit.crit_rate_bonus += spec.modifiers.crit_rate_bonus;
                    hit.direct_hit_rate_bonus += spec.modifiers.direct_hit_rate_bonus;
                    hit.main_stat_bonus += spec.modifiers.main_stat_points(main_stat);
                }
            }
        }
        if let Some(holder) = self.entities.get(target.0) {
            for (key, _) in holder.statuses.iter() {
                if let Some(spec) = self.registry.status(key.id) {
                    hit.damage_multiplier *= spec.modifiers.damage_taken_multiplier;
                }
            }
        }
        hit
    }

    /// Product of the speed multipliers on `player` that scale `timer`.
    pub fn speed_multiplier(&self, player: EntityId, timer: SpeedTimer) -> f64 {
        self.entities.get(player.0).map_or(1.0, |e| {
            e.statuses
                .iter()
                .filter_map(|(key, _)| self.registry.status(key.id))
                .filter(|spec| spec.modifiers.speed_scope.covers(timer))
                .map(|spec| spec.modifiers.speed_multiplier)
                .product()
        })
    }

    /// Computes the hit from the caster's current state and records it now or
    /// after `delay_ms`.
    pub fn deal_damage(
        &mut self,
        source: EntityId,
        target: EntityId,
        hit: HitRequest,
        delay_ms: Millis,
    ) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        let modifiers = self.hit_modifiers(source, target, hit.guaranteed_crit, hit.guaranteed_direct_hit);
        let player = self
            .players
            .get(&source)
            .ok_or_else(|| SimError::config(format!("damage source {} is not a player", source.0)))?;
        let distribution = player.stats.damage_distribution(hit.potency, hit.kind, &modifiers);
        let pending = PendingHit {
            source,
            target,
            label: hit.label,
            action: hit.action,
            kind: hit.kind,
            distribution,
        };
        if delay_ms > 0 {
            self.schedule(Event::DamageLanded(pending), self.now + delay_ms)?;
        } else {
            self.record_hit(pending);
        }
        Ok(())
    }

    fn record_hit(&mut self, hit: PendingHit) {
        if self.is_ended() {
            return;
        }
        let now = self.now;
        let index = self.next_record;
        let Some(entity) = self.entities.get_mut(hit.target.0) else {
            warn!(entity = hit.target.0, "hit on unknown entity dropped");
            return;
        };
        let Some(ledger) = entity.ledger.as_mut() else {
            warn!(entity = hit.target.0, "entity does not take damage");
            return;
        };
        self.next_record += 1;
        debug!(label = %hit.label, at = now, mean = hit.distribution.mean, "damage landed");
        ledger.push(DamageRecord {
            index,
            timestamp: now,
            label: hit.label,
            mean: hit.distribution.mean,
            stddev: hit.distribution.std_dev(),
            action: hit.action,
            source: hit.source,
            target: hit.target,
            kind: hit.kind,
        });

        let mut depleted = false;
        if let Some(pool) = entity.hp.as_mut() {
            pool.current -= hit.distribution.mean;
            depleted = pool.current <= 0.0;
        }
        if depleted {
            self.finish("target defeated");
        }
    }

    /// Applies (or refreshes) `status` from `source` onto `holder`.
    pub fn apply_status(&mut self, source: EntityId, holder: EntityId, status: StatusId) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        let spec = Arc::clone(
            self.registry
                .status(status)
                .ok_or_else(|| SimError::UnknownStatus(format!("#{}", status.0)))?,
        );
        let snapshot = if spec.deals_tick_damage() {
            self.players.get(&source).map(|p| {
                let modifiers = self.hit_modifiers(source, holder, false, false);
                p.stats.damage_distribution(spec.tick_potency, DamageKind::Dot, &modifiers)
            })
        } else {
            None
        };

        let now = self.now;
        let key = spec.key(source);
        self.status_gen += 1;
        let gen = self.status_gen;
        let entity = self
            .entities
            .get_mut(holder.0)
            .ok_or_else(|| SimError::config(format!("unknown entity {}", holder.0)))?;

        let mut follow_up = Vec::with_capacity(2);
        match entity.statuses.get_mut(&key) {
            Some(instance) => {
                match spec.refresh {
                    RefreshPolicy::Refresh => instance.expires_at = now + spec.duration_ms,
                    RefreshPolicy::Extend => {
                        let cap = now + spec.max_duration_ms.max(spec.duration_ms);
                        instance.expires_at = (instance.expires_at + spec.duration_ms).min(cap);
                    }
                    RefreshPolicy::Stack => {
                        instance.stacks = (instance.stacks + 1).min(spec.max_stacks);
                    }
                }
                if spec.refresh != RefreshPolicy::Stack {
                    instance.expiry_gen = gen;
                    instance.source = source;
                    if snapshot.is_some() {
                        instance.snapshot = snapshot;
                    }
                    follow_up.push((
                        Event::StatusExpire {
                            holder,
                            key,
                            gen: instance.expiry_gen,
                        },
                        instance.expires_at,
                    ));
                }
                debug!(status = %spec.name, holder = holder.0, stacks = instance.stacks, expires_at = instance.expires_at, "status refreshed");
            }
            None => {
                let next_tick_at = match spec.tick {
                    TickMode::Interval { interval_ms } => Some(now + interval_ms),
                    _ => None,
                };
                let expires_at = now + spec.duration_ms;
                entity.statuses.insert(
                    key,
                    StatusInstance {
                        applied_at: now,
                        expires_at,
                        stacks: 1,
                        source,
                        expiry_gen: gen,
                        next_tick_at,
                        snapshot,
                    },
                );
                follow_up.push((Event::StatusExpire { holder, key, gen }, expires_at));
                if let Some(at) = next_tick_at {
                    follow_up.push((Event::StatusTick { holder, key }, at));
                }
                debug!(status = %spec.name, holder = holder.0, expires_at, "status applied");
            }
        }

        for (event, at) in follow_up {
            self.schedule(event, at)?;
        }
        Ok(())
    }

    /// Removes `status` from `holder`; returns whether anything was removed.
    pub fn remove_status(&mut self, holder: EntityId, status: StatusId, source: EntityId) -> bool {
        let Some(spec) = self.registry.status(status) else {
            return false;
        };
        let key = spec.key(source);
        self.entities
            .get_mut(holder.0)
            .and_then(|e| e.statuses.remove(&key))
            .is_some()
    }

    fn on_status_tick(&mut self, holder: EntityId, key: StatusKey) -> Result<()> {
        let interval = match self.registry.status(key.id).map(|s| s.tick) {
            Some(TickMode::Interval { interval_ms }) => interval_ms,
            _ => return Ok(()),
        };
        let now = self.now;
        let Some(instance) = self
            .entities
            .get_mut(holder.0)
            .and_then(|e| e.statuses.get_mut(&key))
        else {
            return Ok(());
        };
        if instance.next_tick_at != Some(now) {
            return Ok(());
        }
        instance.next_tick_at = Some(now + interval);
        self.schedule(Event::StatusTick { holder, key }, now + interval)?;
        self.deliver_tick(holder, key)
    }

    fn on_status_expire(&mut self, holder: EntityId, key: StatusKey, gen: u64) -> Result<()> {
        let now = self.now;
        let Some(instance) = self.entities.get(holder.0).and_then(|e| e.statuses.get(&key)) else {
            return Ok(());
        };
        if instance.expiry_gen != gen || instance.expires_at != now {
            return Ok(());
        }
        // A tick due exactly at expiry still lands.
        let interval_tick = matches!(
            self.registry.status(key.id).map(|s| s.tick),
            Some(TickMode::Interval { .. })
        );
        if interval_tick && instance.next_tick_at == Some(now) && !self.is_ended() {
            self.deliver_tick(holder, key)?;
        }
        if let Some(entity) = self.entities.get_mut(holder.0) {
            entity.statuses.remove(&key);
        }
        debug!(status = key.id.0, holder = holder.0, at = now, "status expired");
        Ok(())
    }

    fn on_server_tick(&mut self) -> Result<()> {
        let now = self.now;
        let mut due = Vec::new();
        for entity in &self.entities {
            for (key, instance) in entity.statuses.iter() {
                let server_ticked = self
                    .registry
                    .status(key.id)
                    .is_some_and(|s| s.tick == TickMode::ServerTick);
                if server_ticked && instance.applied_at < now {
                    due.push((entity.id, *key));
                }
            }
        }
        for (holder, key) in due {
            self.deliver_tick(holder, key)?;
        }
        if let Some(interval) = self.server_tick_ms {
            self.schedule(Event::ServerTick, now + interval)?;
        }
        Ok(())
    }

    fn deliver_tick(&mut self, holder: EntityId, key: StatusKey) -> Result<()> {
        let Some(spec) = self.registry.status(key.id).cloned() else {
            return Ok(());
        };
        let Some(instance) = self.entities.get(holder.0).and_then(|e| e.statuses.get(&key)) else {
            return Ok(());
        };
        let source = instance.source;
        if let Some(distribution) = instance.snapshot {
            let stacks = instance.stacks.max(1) as f64;
            self.record_hit(PendingHit {
                source,
                target: holder,
                label: format!("{} (tick)", spec.name),
                action: None,
                kind: DamageKind::Dot,
                distribution: distribution.scaled(stacks),
            });
        }
        // The applier may have left the fight; its callback is skipped then.
        if let Some(hook) = &spec.on_tick {
            if self.players.contains_key(&source) && !self.is_ended() {
                let mut ctx = EffectContext::new(self, source, holder, None, spec.name.clone(), 0);
                hook.apply(&mut ctx)?;
            }
        }
        Ok(())
    }

    fn on_auto_attack(&mut self, id: EntityId) -> Result<()> {
        let now = self.now;
        let Some(player) = self.players.get(&id) else {
            return Ok(());
        };
        let Some(potency) = player.auto_attack_potency else {
            return Ok(());
        };
        if let Some(end) = player.resolver.casting_until().filter(|end| *end > now) {
            self.schedule(Event::AutoAttack { player: id }, end)?;
            return Ok(());
        }
        let speed = self.speed_multiplier(id, SpeedTimer::AutoAttack);
        let delay = ((player.stats.weapon_delay_ms as f64 * speed).floor() as Millis).max(1);
        let target = player.default_target;
        let hit = HitRequest {
            label: "Auto Attack".to_string(),
            action: None,
            potency,
            kind: DamageKind::AutoAttack,
            guaranteed_crit: false,
            guaranteed_direct_hit: false,
        };
        self.deal_damage(id, target, hit, 0)?;
        self.schedule(Event::AutoAttack { player: id }, now + delay)?;
        Ok(())
    }

    pub fn gain_resource(&mut self, player: EntityId, resource: &str, amount: f64) {
        if let Some(p) = self.players.get_mut(&player) {
            p.resolver.gain(resource, amount);
        }
    }

    pub fn resource(&self, player: EntityId, resource: &str) -> f64 {
        self.players
            .get(&player)
            .map_or(0.0, |p| p.resolver.resource(resource))
    }

    /// Fight-wide ledger in event order.
    pub fn ledger(&self) -> DamageLedger {
        DamageLedger::merged(self.entities.iter().filter_map(|e| e.ledger.as_ref()))
    }

    pub fn total_damage(&self) -> f64 {
        self.entities
            .iter()
            .filter_map(|e| e.ledger.as_ref())
            .map(|l| l.total_mean())
            .sum()
    }

    /// End of the fight window: kill time, stop time, or the current clock.
    pub fn fight_end(&self) -> Millis {
        self.ended_at.or(self.stop_at).unwrap_or(self.now)
    }

    pub fn duration_ms(&self) -> Millis {
        (self.fight_end() - self.pull_at).max(0)
    }

    pub fn dps(&self) -> f64 {
        let duration = self.duration_ms();
        if duration <= 0 {
            return 0.0;
        }
        self.total_damage() / (duration as f64 / 1000.0)
    }

    pub fn markers(&self) -> &[MarkerPoint] {
        &self.markers
    }

    /// Cumulative DPS at each marker after the pull.
    pub fn dps_timeline(&self) -> Vec<(Millis, f64)> {
        self.markers
            .iter()
            .filter(|m| m.at > self.pull_at)
            .map(|m| {
                let seconds = (m.at - self.pull_at) as f64 / 1000.0;
                (m.at, m.cumulative_mean / seconds)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_arena(start: Millis) -> Arena {
        Arena::new(start, Arc::new(ActionRegistry::new()))
    }

    #[test]
    fn equal_timestamps_fire_in_scheduling_order() {
        let mut arena = empty_arena(0);
        arena.schedule(Event::Marker(3), 500).unwrap();
        arena.schedule(Event::Marker(1), 100).unwrap();
        arena.schedule(Event::Marker(4), 500).unwrap();
        arena.schedule(Event::Marker(2), 100).unwrap();
        arena.step(1000).unwrap();
        let ids: Vec<u64> = arena.markers().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(arena.now(), 1000);
    }

    #[test]
    fn step_stops_at_boundary_inclusive() {
        let mut arena = empty_arena(-1000);
        arena.schedule(Event::Marker(1), 0).unwrap();
        arena.schedule(Event::Marker(2), 1).unwrap();
        arena.step(1000).unwrap();
        assert_eq!(arena.markers().len(), 1);
        assert_eq!(arena.pending_events(), 1);
    }

    #[test]
    fn past_scheduling_fails_fast() {
        let mut arena = empty_arena(0);
        arena.step(500).unwrap();
        let err = arena.schedule(Event::Marker(0), 499).unwrap_err();
        assert!(matches!(err, SimError::SchedulingViolation { at: 499, now: 500 }));
        assert!(arena.step(-1).is_err());
    }

    #[test]
    fn server_tick_recurs() {
        let mut arena = empty_arena(0);
        arena.enable_trace();
        arena.start_server_tick().unwrap();
        arena.step(9000).unwrap();
        let ticks: Vec<Millis> = arena
            .trace()
            .unwrap()
            .iter()
            .filter(|t| t.kind == "server_tick")
            .map(|t| t.at)
            .collect();
        assert_eq!(ticks, vec![0, 3000, 6000, 9000]);
    }

    #[test]
    fn fight_end_fires_before_later_scheduled_events() {
        let mut arena = empty_arena(0);
        arena.enable_trace();
        arena.end_fight_at(1000).unwrap();
        arena.schedule(Event::Marker(7), 1000).unwrap();
        arena.run().unwrap();
        let kinds: Vec<&str> = arena.trace().unwrap().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec!["fight_end", "marker"]);
        assert!(arena.is_ended());
        assert_eq!(arena.fight_end(), 1000);
    }
}
