//! Planned ability sequence and the per-player cursor over it.
//!
//! A [`Rotation`] is immutable once built. The arena drives a
//! [`RotationCursor`] through it: failed conditions and combo mismatches skip
//! the entry, timing blocks retry when the lock clears, and resource shortfalls
//! wait up to the entry's bound before skipping.

use serde::{Deserialize, Serialize};

use crate::action::{ActionId, ActionRegistry, EffectTarget};
use crate::arena::Millis;
use crate::config::{ActionRef, RotationConfig};
use crate::entity::Entity;
use crate::error::{Result, SimError};
use crate::resolver::ActionResolver;

/// Guard on a rotation entry, evaluated right before the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    ResourceAtLeast {
        resource: String,
        amount: f64,
    },
    ResourceAtMost {
        resource: String,
        amount: f64,
    },
    HasStatus {
        status: String,
        #[serde(default)]
        on: EffectTarget,
    },
    LacksStatus {
        status: String,
        #[serde(default)]
        on: EffectTarget,
    },
    /// True when the status is missing or has less than `ms` left.
    StatusRemainingBelow {
        status: String,
        #[serde(default)]
        on: EffectTarget,
        ms: Millis,
    },
    ComboIs {
        action: String,
    },
    All {
        of: Vec<Condition>,
    },
    Any {
        of: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

/// Read-only fight state a condition can inspect.
pub struct ConditionView<'a> {
    pub registry: &'a ActionRegistry,
    pub resolver: &'a ActionResolver,
    pub caster: &'a Entity,
    pub target: &'a Entity,
    pub now: Millis,
}

impl ConditionView<'_> {
    fn remaining(&self, status: &str, on: EffectTarget) -> Option<Millis> {
        let id = self.registry.status_id(status).ok()?;
        let holder = match on {
            EffectTarget::Target => self.target,
            EffectTarget::Caster => self.caster,
        };
        holder
            .statuses
            .lookup(id, self.caster.id)
            .map(|s| s.remaining(self.now))
    }
}

impl Condition {
    pub fn evaluate(&self, view: &ConditionView<'_>) -> bool {
        match self {
            Condition::ResourceAtLeast { resource, amount } => {
                view.resolver.resource(resource) >= *amount
            }
            Condition::ResourceAtMost { resource, amount } => {
                view.resolver.resource(resource) <= *amount
            }
            Condition::HasStatus { status, on } => view.remaining(status, *on).is_some(),
            Condition::LacksStatus { status, on } => view.remaining(status, *on).is_none(),
            Condition::StatusRemainingBelow { status, on, ms } => {
                view.remaining(status, *on).map_or(true, |left| left < *ms)
            }
            Condition::ComboIs { action } => {
                let expected = view.registry.resolve(&ActionRef::Name(action.clone()));
                matches!(expected, Ok(id) if view.resolver.combo(view.now) == Some(id))
            }
            Condition::All { of } => of.iter().all(|c| c.evaluate(view)),
            Condition::Any { of } => of.iter().any(|c| c.evaluate(view)),
            Condition::Not { condition } => !condition.evaluate(view),
        }
    }

    /// Checks every status and action name against the registry.
    fn check(&self, registry: &ActionRegistry) -> Result<()> {
        match self {
            Condition::ResourceAtLeast { .. } | Condition::ResourceAtMost { .. } => Ok(()),
            Condition::HasStatus { status, .. }
            | Condition::LacksStatus { status, .. }
            | Condition::StatusRemainingBelow { status, .. } => {
                registry.status_id(status).map(|_| ())
            }
            Condition::ComboIs { action } => registry
                .resolve(&ActionRef::Name(action.clone()))
                .map(|_| ()),
            Condition::All { of } | Condition::Any { of } => {
                of.iter().try_for_each(|c| c.check(registry))
            }
            Condition::Not { condition } => condition.check(registry),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotationEntry {
    pub action: ActionId,
    pub condition: Option<Condition>,
    pub at: Option<Millis>,
    /// Target slot; the player's default target when absent.
    pub target: Option<usize>,
    pub wait_for_resource_ms: Option<Millis>,
}

impl RotationEntry {
    pub fn new(action: ActionId) -> Self {
        Self {
            action,
            condition: None,
            at: None,
            target: None,
            wait_for_resource_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rotation {
    name: String,
    entries: Vec<RotationEntry>,
}

impl Rotation {
    pub fn new(name: impl Into<String>, entries: Vec<RotationEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Resolves a configured rotation against the registry. Unknown actions
    /// and statuses are reported, never dropped.
    pub fn from_config(config: &RotationConfig, registry: &ActionRegistry) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.entries.len());
        for (position, entry) in config.entries.iter().enumerate() {
            let action = registry.resolve(&entry.action).map_err(|err| match err {
                SimError::UnknownAction(name) => {
                    SimError::UnknownAction(format!("{name} (rotation entry {position})"))
                }
                other => other,
            })?;
            if let Some(condition) = &entry.condition {
                condition.check(registry)?;
            }
            entries.push(RotationEntry {
                action,
                condition: entry.condition.clone(),
                at: entry.at,
                target: entry.target,
                wait_for_resource_ms: entry.wait_for_resource_ms,
            });
        }
        Ok(Self::new(config.name.clone(), entries))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[RotationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live position of a player in its rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationCursor {
    position: usize,
    waiting_since: Option<Millis>,
    executed: usize,
    skipped: usize,
}

impl RotationCursor {
    pub fn current<'r>(&self, rotation: &'r Rotation) -> Option<&'r RotationEntry> {
        rotation.entries.get(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn advance(&mut self) {
        self.position += 1;
        self.executed += 1;
        self.waiting_since = None;
    }

    pub fn skip(&mut self) {
        self.position += 1;
        self.skipped += 1;
        self.waiting_since = None;
    }

    /// Starts (or continues) a resource wait; returns when it began.
    pub fn begin_wait(&mut self, now: Millis) -> Millis {
        *self.waiting_since.get_or_insert(now)
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_finished(&self, rotation: &Rotation) -> bool {
        self.position >= rotation.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationEntryConfig;
    use crate::entity::{EntityId, StatusInstance, StatusKey, StatusSpec, StatusId};
    use crate::action::{ActionDef, Sequence};
    use std::sync::Arc;

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        let noop = Arc::new(Sequence::default());
        registry.register(ActionDef::gcd(ActionId(0), "Gyofu", 2500, noop.clone())).unwrap();
        registry.register(ActionDef::gcd(ActionId(1), "Jinpu", 2500, noop)).unwrap();
        registry.register_status(StatusSpec::new(StatusId(0), "Fugetsu", 40_000)).unwrap();
        registry
    }

    fn entry(action: ActionRef) -> RotationEntryConfig {
        RotationEntryConfig {
            action,
            condition: None,
            at: None,
            target: None,
            wait_for_resource_ms: None,
        }
    }

    #[test]
    fn unknown_action_is_reported() {
        let config = RotationConfig {
            name: "opener".into(),
            entries: vec![entry(ActionRef::Name("Gyofu".into())), entry(ActionRef::Name("Hakaze".into()))],
        };
        let err = Rotation::from_config(&config, &registry()).unwrap_err();
        match err {
            SimError::UnknownAction(name) => assert!(name.contains("Hakaze")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_status_in_condition_is_reported() {
        let mut e = entry(ActionRef::Id(1));
        e.condition = Some(Condition::LacksStatus {
            status: "Fuka".into(),
            on: EffectTarget::Caster,
        });
        let config = RotationConfig { name: String::new(), entries: vec![e] };
        assert!(matches!(
            Rotation::from_config(&config, &registry()),
            Err(SimError::UnknownStatus(_))
        ));
    }

    #[test]
    fn combo_condition_names_a_known_action() {
        let mut e = entry(ActionRef::Id(1));
        e.condition = Some(Condition::ComboIs { action: "Hakaze".into() });
        let config = RotationConfig { name: String::new(), entries: vec![e.clone()] };
        assert!(matches!(
            Rotation::from_config(&config, &registry()),
            Err(SimError::UnknownAction(_))
        ));

        e.condition = Some(Condition::ComboIs { action: "Gyofu".into() });
        let config = RotationConfig { name: String::new(), entries: vec![e] };
        assert!(Rotation::from_config(&config, &registry()).is_ok());
    }

    #[test]
    fn loading_twice_is_identical() {
        let mut e = entry(ActionRef::Name("Jinpu".into()));
        e.condition = Some(Condition::Not {
            condition: Box::new(Condition::HasStatus {
                status: "Fugetsu".into(),
                on: EffectTarget::Caster,
            }),
        });
        let config = RotationConfig {
            name: "loop".into(),
            entries: vec![entry(ActionRef::Id(0)), e],
        };
        let registry = registry();
        let a = Rotation::from_config(&config, &registry).unwrap();
        let b = Rotation::from_config(&config, &registry).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.entries()[1].action, ActionId(1));
    }

    #[test]
    fn conditions_read_statuses_and_resources() {
        let registry = registry();
        let resolver = ActionResolver::with_resources(
            0,
            &[crate::config::ResourceConfig {
                name: "kenki".into(),
                initial: 30.0,
                max: 100.0,
            }],
        );
        let mut caster = Entity::player(EntityId(1), "Samurai");
        let target = Entity::target(EntityId(0), "Dummy", None);
        caster.statuses.insert(
            StatusKey { id: StatusId(0), source: None },
            StatusInstance {
                applied_at: 0,
                expires_at: 5000,
                stacks: 1,
                source: EntityId(1),
                expiry_gen: 0,
                next_tick_at: None,
                snapshot: None,
            },
        );
        let view = ConditionView {
            registry: &registry,
            resolver: &resolver,
            caster: &caster,
            target: &target,
            now: 1000,
        };
        let has = Condition::HasStatus { status: "Fugetsu".into(), on: EffectTarget::Caster };
        let below = Condition::StatusRemainingBelow {
            status: "Fugetsu".into(),
            on: EffectTarget::Caster,
            ms: 5000,
        };
        let on_target = Condition::HasStatus { status: "Fugetsu".into(), on: EffectTarget::Target };
        assert!(has.evaluate(&view));
        assert!(below.evaluate(&view));
        assert!(!on_target.evaluate(&view));
        assert!(Condition::ResourceAtLeast { resource: "kenki".into(), amount: 25.0 }.evaluate(&view));
        assert!(!Condition::All {
            of: vec![has, Condition::ResourceAtMost { resource: "kenki".into(), amount: 10.0 }]
        }
        .evaluate(&view));
    }

    #[test]
    fn cursor_tracks_waits_and_skips() {
        let mut cursor = RotationCursor::default();
        assert_eq!(cursor.begin_wait(100), 100);
        assert_eq!(cursor.begin_wait(200), 100);
        cursor.skip();
        assert_eq!(cursor.begin_wait(300), 300);
        cursor.advance();
        assert_eq!((cursor.position(), cursor.executed(), cursor.skipped()), (2, 1, 1));
    }
}
