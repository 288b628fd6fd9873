//! Per-character action gate: GCD, animation lock, cooldowns, resources and
//! the combo token.
//!
//! [`ActionResolver::try_begin`] is check-then-act: every precondition is
//! evaluated before any state changes, so a blocked attempt leaves the
//! resolver exactly as it found it.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::action::{ActionDef, ActionId, ComboAction};
use crate::arena::Millis;
use crate::config::ResourceConfig;

pub const ANIMATION_LOCK_MS: Millis = 700;
/// Extra lock after a cast completes.
pub const CAST_LOCK_PADDING_MS: Millis = 100;
pub const COMBO_WINDOW_MS: Millis = 30_000;
/// GCD lock of a GCD action whose recast is its own cooldown.
pub const BASE_GCD_MS: Millis = 2_500;

/// A failed precondition. Recoverable; the rotation decides what to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Blocked {
    AnimationLocked { ready_at: Millis },
    GcdLocked { ready_at: Millis },
    OnCooldown { ready_at: Millis },
    InsufficientResource { resource: String, have: f64, need: f64 },
    ComboMismatch { expected: ActionId, current: Option<ActionId> },
}

impl Blocked {
    /// When retrying makes sense, if the block clears on its own.
    pub fn ready_at(&self) -> Option<Millis> {
        match self {
            Blocked::AnimationLocked { ready_at }
            | Blocked::GcdLocked { ready_at }
            | Blocked::OnCooldown { ready_at } => Some(*ready_at),
            _ => None,
        }
    }
}

/// Outcome of a successful `try_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub action: ActionId,
    pub started_at: Millis,
    /// When the effect resolves (cast completion for cast actions).
    pub effect_at: Millis,
    /// Earliest time any action can be attempted again.
    pub next_action_at: Millis,
    pub gcd_ready_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CooldownKey {
    Action(ActionId),
    Group(u64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CooldownTrack {
    /// When every charge is back.
    recharge_end: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourcePool {
    pub value: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComboToken {
    pub action: ActionId,
    pub expires_at: Millis,
}

#[derive(Debug, Clone, Default)]
pub struct ActionResolver {
    gcd_ready_at: Millis,
    anim_lock_until: Millis,
    casting_until: Option<Millis>,
    cooldowns: BTreeMap<CooldownKey, CooldownTrack>,
    combo: Option<ComboToken>,
    resources: BTreeMap<String, ResourcePool>,
}

fn group_hash(name: &str) -> u64 {
    // FNV-1a; group names only need a stable key.
    name.bytes()
        .fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}

impl ActionResolver {
    pub fn new(start: Millis) -> Self {
        Self {
            gcd_ready_at: start,
            anim_lock_until: start,
            ..Self::default()
        }
    }

    pub fn with_resources(start: Millis, resources: &[ResourceConfig]) -> Self {
        let mut resolver = Self::new(start);
        for r in resources {
            resolver.resources.insert(
                r.name.clone(),
                ResourcePool {
                    value: r.initial,
                    max: r.max,
                },
            );
        }
        resolver
    }

    fn cooldown_key(def: &ActionDef) -> CooldownKey {
        match &def.cooldown_group {
            Some(group) => CooldownKey::Group(group_hash(group)),
            None => CooldownKey::Action(def.id),
        }
    }

    /// Time at which `def` next has a charge available.
    pub fn cooldown_ready_at(&self, def: &ActionDef, at: Millis) -> Millis {
        if !def.has_cooldown() {
            return at;
        }
        let Some(track) = self.cooldowns.get(&Self::cooldown_key(def)) else {
            return at;
        };
        // A charge is free once no more than (max - 1) recasts remain.
        let spare = (def.max_charges as Millis - 1) * def.recast_ms;
        (track.recharge_end - spare).max(at)
    }

    pub fn charges(&self, def: &ActionDef, at: Millis) -> u32 {
        if def.recast_ms <= 0 {
            return def.max_charges;
        }
        let Some(track) = self.cooldowns.get(&Self::cooldown_key(def)) else {
            return def.max_charges;
        };
        let outstanding = (track.recharge_end - at).max(0);
        let missing = (outstanding + def.recast_ms - 1) / def.recast_ms;
        def.max_charges.saturating_sub(missing as u32)
    }

    pub fn combo(&self, at: Millis) -> Option<ActionId> {
        self.combo.filter(|t| at < t.expires_at).map(|t| t.action)
    }

    pub fn resource(&self, name: &str) -> f64 {
        self.resources.get(name).map_or(0.0, |p| p.value)
    }

    /// Adds (or with a negative amount removes) gauge, clamped to `[0, max]`.
    pub fn gain(&mut self, name: &str, amount: f64) {
        if let Some(pool) = self.resources.get_mut(name) {
            pool.value = (pool.value + amount).clamp(0.0, pool.max);
        }
    }

    pub fn gcd_ready_at(&self) -> Millis {
        self.gcd_ready_at
    }

    pub fn animation_lock_until(&self) -> Millis {
        self.anim_lock_until
    }

    pub fn is_casting(&self, at: Millis) -> bool {
        matches!(self.casting_until, Some(end) if at < end)
    }

    pub fn casting_until(&self) -> Option<Millis> {
        self.casting_until
    }

    /// Checks every precondition for `def` at `at`, then commits.
    ///
    /// `gcd_length` is the already speed-scaled recast for GCD actions.
    pub fn try_begin(
        &mut self,
        def: &ActionDef,
        at: Millis,
        gcd_length: Millis,
    ) -> Result<Execution, Blocked> {
        self.try_begin_with_cast(def, at, gcd_length, def.cast_time_ms)
    }

    /// As [`ActionResolver::try_begin`], with a speed-adjusted cast time.
    pub fn try_begin_with_cast(
        &mut self,
        def: &ActionDef,
        at: Millis,
        gcd_length: Millis,
        cast_time_ms: Millis,
    ) -> Result<Execution, Blocked> {
        // (a) locks
        if at < self.anim_lock_until {
            return Err(Blocked::AnimationLocked {
                ready_at: self.anim_lock_until,
            });
        }
        if def.gcd && at < self.gcd_ready_at {
            return Err(Blocked::GcdLocked {
                ready_at: self.gcd_ready_at,
            });
        }

        // (b) cooldown
        let ready = self.cooldown_ready_at(def, at);
        if ready > at {
            return Err(Blocked::OnCooldown { ready_at: ready });
        }

        // (c) resources
        for cost in &def.cost {
            let have = self.resource(&cost.resource);
            if have + 1e-9 < cost.amount {
                return Err(Blocked::InsufficientResource {
                    resource: cost.resource.clone(),
                    have,
                    need: cost.amount,
                });
            }
        }

        // (d) combo
        if let Some(expected) = def.combo_requires {
            let current = self.combo(at);
            if current != Some(expected) {
                return Err(Blocked::ComboMismatch { expected, current });
            }
        }

        // commit
        for cost in &def.cost {
            self.gain(&cost.resource, -cost.amount);
        }

        if def.has_cooldown() && def.recast_ms > 0 {
            let key = Self::cooldown_key(def);
            let end = self
                .cooldowns
                .get(&key)
                .map_or(at, |t| t.recharge_end.max(at));
            self.cooldowns.insert(
                key,
                CooldownTrack {
                    recharge_end: end + def.recast_ms,
                },
            );
        }

        match def.combo {
            ComboAction::Neutral => {}
            ComboAction::Start | ComboAction::Continue => {
                self.combo = Some(ComboToken {
                    action: def.id,
                    expires_at: at + COMBO_WINDOW_MS,
                });
            }
            ComboAction::Break => self.combo = None,
        }

        let effect_at = at + cast_time_ms;
        if cast_time_ms > 0 {
            self.casting_until = Some(effect_at);
            self.anim_lock_until = effect_at + CAST_LOCK_PADDING_MS;
        } else {
            self.casting_until = None;
            self.anim_lock_until = at + def.animation_lock_ms;
        }
        if def.gcd {
            self.gcd_ready_at = at + gcd_length;
        }

        debug!(action = %def.name, at, gcd_ready_at = self.gcd_ready_at, "action begins");

        Ok(Execution {
            action: def.id,
            started_at: at,
            effect_at,
            next_action_at: self.anim_lock_until,
            gcd_ready_at: self.gcd_ready_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionEffect, ResourceCost, Sequence};
    use std::sync::Arc;

    fn noop() -> Arc<dyn ActionEffect> {
        Arc::new(Sequence::default())
    }

    fn kenki(start: f64) -> ActionResolver {
        ActionResolver::with_resources(
            0,
            &[ResourceConfig {
                name: "kenki".into(),
                initial: start,
                max: 100.0,
            }],
        )
    }

    #[test]
    fn gcd_lock_then_release() {
        let mut resolver = ActionResolver::new(0);
        let gyofu = ActionDef::gcd(ActionId(0), "Gyofu", 2500, noop());
        let exec = resolver.try_begin(&gyofu, 0, 2500).unwrap();
        assert_eq!(exec.next_action_at, 700);
        assert_eq!(exec.gcd_ready_at, 2500);
        assert_eq!(
            resolver.try_begin(&gyofu, 1000, 2500),
            Err(Blocked::GcdLocked { ready_at: 2500 })
        );
        assert!(resolver.try_begin(&gyofu, 2500, 2500).is_ok());
    }

    #[test]
    fn ogcd_weaves_after_animation_lock() {
        let mut resolver = ActionResolver::new(0);
        let gyofu = ActionDef::gcd(ActionId(0), "Gyofu", 2500, noop());
        let shinten = ActionDef::ogcd(ActionId(1), "Shinten", 1000, noop());
        resolver.try_begin(&gyofu, 0, 2500).unwrap();
        assert_eq!(
            resolver.try_begin(&shinten, 300, 0),
            Err(Blocked::AnimationLocked { ready_at: 700 })
        );
        assert!(resolver.try_begin(&shinten, 700, 0).is_ok());
        assert_eq!(
            resolver.try_begin(&shinten, 1400, 0),
            Err(Blocked::OnCooldown { ready_at: 1700 })
        );
    }

    #[test]
    fn blocked_attempt_changes_nothing() {
        let mut resolver = kenki(10.0);
        let mut shinten = ActionDef::ogcd(ActionId(1), "Shinten", 1000, noop());
        shinten.cost.push(ResourceCost {
            resource: "kenki".into(),
            amount: 25.0,
        });
        let before = format!("{resolver:?}");
        let blocked = resolver.try_begin(&shinten, 0, 0).unwrap_err();
        assert_eq!(
            blocked,
            Blocked::InsufficientResource {
                resource: "kenki".into(),
                have: 10.0,
                need: 25.0
            }
        );
        assert_eq!(before, format!("{resolver:?}"));
        assert_eq!(resolver.cooldown_ready_at(&shinten, 0), 0);
    }

    #[test]
    fn charges_recharge_serially() {
        let mut resolver = ActionResolver::new(0);
        let mut gyoten = ActionDef::ogcd(ActionId(2), "Meikyo", 55_000, noop());
        gyoten.max_charges = 2;
        gyoten.animation_lock_ms = 0;
        assert!(resolver.try_begin(&gyoten, 0, 0).is_ok());
        assert_eq!(resolver.charges(&gyoten, 0), 1);
        assert!(resolver.try_begin(&gyoten, 0, 0).is_ok());
        assert_eq!(resolver.charges(&gyoten, 0), 0);
        assert_eq!(
            resolver.try_begin(&gyoten, 10, 0),
            Err(Blocked::OnCooldown { ready_at: 55_000 })
        );
        assert_eq!(resolver.charges(&gyoten, 55_000), 1);
    }

    #[test]
    fn shared_group_blocks_siblings() {
        let mut resolver = ActionResolver::new(0);
        let mut a = ActionDef::ogcd(ActionId(3), "Kaeshi: Setsugekka", 60_000, noop());
        let mut b = ActionDef::ogcd(ActionId(4), "Kaeshi: Goken", 60_000, noop());
        a.cooldown_group = Some("kaeshi".into());
        b.cooldown_group = Some("kaeshi".into());
        resolver.try_begin(&a, 0, 0).unwrap();
        assert_eq!(
            resolver.try_begin(&b, 5000, 0),
            Err(Blocked::OnCooldown { ready_at: 60_000 })
        );
    }

    #[test]
    fn combo_chain_and_expiry() {
        let mut resolver = ActionResolver::new(0);
        let mut hakaze = ActionDef::gcd(ActionId(0), "Gyofu", 2500, noop());
        hakaze.combo = ComboAction::Start;
        let mut jinpu = ActionDef::gcd(ActionId(1), "Jinpu", 2500, noop());
        jinpu.combo_requires = Some(ActionId(0));
        jinpu.combo = ComboAction::Continue;

        assert_eq!(
            resolver.try_begin(&jinpu, 0, 2500),
            Err(Blocked::ComboMismatch { expected: ActionId(0), current: None })
        );
        resolver.try_begin(&hakaze, 0, 2500).unwrap();
        assert_eq!(resolver.combo(2500), Some(ActionId(0)));
        assert_eq!(resolver.combo(30_000), None);
        resolver.try_begin(&jinpu, 2500, 2500).unwrap();
        assert_eq!(resolver.combo(2500), Some(ActionId(1)));
    }

    #[test]
    fn cast_time_locks_until_cast_end_plus_padding() {
        let mut resolver = ActionResolver::new(0);
        let mut midare = ActionDef::gcd(ActionId(5), "Midare Setsugekka", 2500, noop());
        midare.cast_time_ms = 1300;
        let exec = resolver.try_begin(&midare, 0, 2500).unwrap();
        assert_eq!(exec.effect_at, 1300);
        assert_eq!(exec.next_action_at, 1400);
        assert!(resolver.is_casting(1000));
        assert!(!resolver.is_casting(1300));
    }

    #[test]
    fn resources_are_clamped() {
        let mut resolver = kenki(90.0);
        resolver.gain("kenki", 25.0);
        assert_eq!(resolver.resource("kenki"), 100.0);
        resolver.gain("kenki", -150.0);
        assert_eq!(resolver.resource("kenki"), 0.0);
        assert_eq!(resolver.resource("unknown"), 0.0);
    }
}
