//! Stat model: gearset attributes to damage multipliers, GCD length and the
//! per-hit damage distribution.
//!
//! Every function here is pure. A [`StatModel`] is derived once at fight start
//! from the immutable [`Gearset`] and cached on the player.

use serde::{Deserialize, Serialize};

use crate::config::Gearset;
use crate::error::{Result, SimError};

/// Multiplier applied by a direct hit.
pub const DIRECT_HIT_POWER: f64 = 1.25;

/// Level-dependent constants used by every substat formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelModifier {
    pub main_attribute: f64,
    pub sub: f64,
    pub div: f64,
    pub attack_power: f64,
}

/// Returns the modifier row for a supported level.
pub fn level_modifier(level: u32) -> Option<LevelModifier> {
    let row = match level {
        70 => LevelModifier { main_attribute: 292.0, sub: 364.0, div: 900.0, attack_power: 125.0 },
        80 => LevelModifier { main_attribute: 340.0, sub: 380.0, div: 1300.0, attack_power: 165.0 },
        90 => LevelModifier { main_attribute: 390.0, sub: 400.0, div: 1900.0, attack_power: 195.0 },
        100 => LevelModifier { main_attribute: 440.0, sub: 420.0, div: 2780.0, attack_power: 237.0 },
        _ => return None,
    };
    Some(row)
}

/// `f_ap` for a main stat value at the given level.
pub fn attack_power_factor(lvl: &LevelModifier, main: f64) -> f64 {
    1.0 + (lvl.attack_power * (main - lvl.main_attribute) / lvl.main_attribute).floor() / 100.0
}

/// How a damage event is computed from potency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageKind {
    #[default]
    Weaponskill,
    Spell,
    Dot,
    AutoAttack,
}

/// Shape of the per-hit damage roll around the expected value.
///
/// The game rolls damage within ±5% of the computed value. The normal variant
/// is a truncated normal on `[1 - clip, 1 + clip]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VarianceBand {
    Uniform { half_width: f64 },
    Normal { sigma: f64, clip: f64 },
}

impl Default for VarianceBand {
    fn default() -> Self {
        VarianceBand::Uniform { half_width: 0.05 }
    }
}

impl VarianceBand {
    /// Variance of the multiplicative roll factor (its mean is 1).
    pub fn factor_variance(&self) -> f64 {
        match *self {
            VarianceBand::Uniform { half_width } => half_width * half_width / 3.0,
            VarianceBand::Normal { sigma, clip } => {
                if sigma <= 0.0 || clip <= 0.0 {
                    return 0.0;
                }
                let c = clip / sigma;
                let mass = 2.0 * std_normal_cdf(c) - 1.0;
                if mass <= 0.0 {
                    return 0.0;
                }
                sigma * sigma * (1.0 - 2.0 * c * std_normal_pdf(c) / mass)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            VarianceBand::Uniform { half_width } => (0.0..1.0).contains(&half_width),
            VarianceBand::Normal { sigma, clip } => sigma >= 0.0 && (0.0..1.0).contains(&clip),
        };
        if ok {
            Ok(())
        } else {
            Err(SimError::config(format!("invalid variance band {:?}", self)))
        }
    }
}

fn std_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn std_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Mean and variance of one damage event.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DamageDistribution {
    pub mean: f64,
    pub variance: f64,
}

impl DamageDistribution {
    pub fn fixed(value: f64) -> Self {
        Self { mean: value, variance: 0.0 }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            mean: self.mean * factor,
            variance: self.variance * factor * factor,
        }
    }
}

/// Buff state and forced outcomes for a single hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitModifiers {
    pub crit_rate_bonus: f64,
    pub direct_hit_rate_bonus: f64,
    pub damage_multiplier: f64,
    /// Flat main stat points added by buffs, already capped.
    pub main_stat_bonus: f64,
    pub guaranteed_crit: bool,
    pub guaranteed_direct_hit: bool,
}

impl Default for HitModifiers {
    fn default() -> Self {
        Self {
            crit_rate_bonus: 0.0,
            direct_hit_rate_bonus: 0.0,
            damage_multiplier: 1.0,
            main_stat_bonus: 0.0,
            guaranteed_crit: false,
            guaranteed_direct_hit: false,
        }
    }
}

/// Derived multipliers for one gearset, computed once per fight.
#[derive(Debug, Clone, PartialEq)]
pub struct StatModel {
    /// Main attribute after the party bonus, before any buff.
    pub main_stat: f64,
    pub level: LevelModifier,
    pub crit_rate: f64,
    pub crit_power: f64,
    pub direct_hit_rate: f64,
    pub f_ap: f64,
    pub f_det: f64,
    pub f_wd: f64,
    pub f_auto: f64,
    pub f_spd: f64,
    /// Speed stat reduction in thousandths, applied to GCD recasts.
    pub speed_reduction: f64,
    pub trait_multiplier: f64,
    pub weapon_delay_ms: i64,
    pub variance: VarianceBand,
}

impl StatModel {
    pub fn from_gearset(gear: &Gearset, variance: VarianceBand) -> Result<Self> {
        gear.validate()?;
        variance.validate()?;
        let lvl = level_modifier(gear.level).ok_or_else(|| {
            SimError::config(format!("unsupported character level {}", gear.level))
        })?;

        let sub_ratio = |stat: f64, scale: f64| scale * (stat - lvl.sub) / lvl.div;

        let crit_rate = ((sub_ratio(gear.critical_hit, 200.0) + 50.0).floor() / 1000.0).max(0.0);
        let crit_power = (sub_ratio(gear.critical_hit, 200.0) + 1400.0).floor() / 1000.0;
        let direct_hit_rate = (sub_ratio(gear.direct_hit, 550.0).floor() / 1000.0).max(0.0);

        // Party bonus scales the main attribute before the attack power conversion.
        let main = (gear.main_attribute * gear.party_bonus).floor();
        let f_ap = attack_power_factor(&lvl, main);
        let f_det = 1.0 + (140.0 * (gear.determination - lvl.main_attribute) / lvl.div).floor() / 1000.0;

        let job_base = (lvl.main_attribute * gear.job_modifier / 1000.0).floor();
        let f_wd = (job_base + gear.weapon_damage) / 100.0;
        let delay = (gear.weapon_delay / 3.0 * 100.0).trunc() / 100.0;
        let f_auto = ((job_base + gear.weapon_damage) * delay).floor() / 100.0;

        let speed_reduction = sub_ratio(gear.speed, 130.0).floor().max(0.0);
        let f_spd = 1.0 + speed_reduction / 1000.0;

        Ok(Self {
            main_stat: main,
            level: lvl,
            crit_rate,
            crit_power,
            direct_hit_rate,
            f_ap,
            f_det,
            f_wd,
            f_auto,
            f_spd,
            speed_reduction,
            trait_multiplier: gear.trait_multiplier,
            weapon_delay_ms: (gear.weapon_delay * 1000.0).round() as i64,
            variance,
        })
    }

    /// GCD recast for a base recast time, floored to 10 ms.
    pub fn gcd_length(&self, base_ms: i64, speed_multiplier: f64) -> i64 {
        let scaled = base_ms as f64 * (1000.0 - self.speed_reduction) / 1000.0;
        let scaled = (scaled * speed_multiplier).floor();
        ((scaled / 10.0).floor() * 10.0) as i64
    }

    /// Attack power multiplier for a main stat raised by `bonus` points.
    pub fn boosted_f_ap(&self, bonus: f64) -> f64 {
        if bonus <= 0.0 {
            return self.f_ap;
        }
        attack_power_factor(&self.level, self.main_stat + bonus)
    }

    /// Expected damage before critical/direct hit rolls and the variance band.
    pub fn base_damage(&self, potency: f64, kind: DamageKind) -> f64 {
        self.base_damage_with(potency, kind, self.f_ap)
    }

    fn base_damage_with(&self, potency: f64, kind: DamageKind, f_ap: f64) -> f64 {
        let d = match kind {
            DamageKind::Weaponskill => ((potency * f_ap).floor() * self.f_det).floor() * self.f_wd,
            DamageKind::Spell => ((potency * self.f_wd).floor() * f_ap).floor() * self.f_det,
            DamageKind::Dot => {
                (((potency * f_ap).floor() * self.f_det).floor() * self.f_wd).floor() * self.f_spd
            }
            DamageKind::AutoAttack => {
                (((potency * f_ap).floor() * self.f_det).floor() * self.f_auto).floor() * self.f_spd
            }
        };
        (d.floor() * self.trait_multiplier).floor()
    }

    /// Mean and variance of one hit of `potency`.
    ///
    /// Critical and direct hits are independent Bernoulli trials; the four
    /// outcomes form a mixture, each scaled by the variance band.
    pub fn damage_distribution(
        &self,
        potency: f64,
        kind: DamageKind,
        hit: &HitModifiers,
    ) -> DamageDistribution {
        let f_ap = self.boosted_f_ap(hit.main_stat_bonus);
        let base = self.base_damage_with(potency, kind, f_ap) * hit.damage_multiplier;
        if base <= 0.0 {
            return DamageDistribution::default();
        }

        let mut crit_rate = (self.crit_rate + hit.crit_rate_bonus).clamp(0.0, 1.0);
        let mut dh_rate = (self.direct_hit_rate + hit.direct_hit_rate_bonus).clamp(0.0, 1.0);
        let mut crit_power = self.crit_power;
        let mut dh_power = DIRECT_HIT_POWER;

        if hit.guaranteed_crit {
            crit_rate = 1.0;
            crit_power *= 1.0 + (self.crit_power - 1.0) * hit.crit_rate_bonus;
        }
        if hit.guaranteed_direct_hit {
            dh_rate = 1.0;
            dh_power *= 1.0 + (DIRECT_HIT_POWER - 1.0) * hit.direct_hit_rate_bonus;
        }

        let outcomes = [
            ((1.0 - crit_rate) * (1.0 - dh_rate), 1.0),
            (crit_rate * (1.0 - dh_rate), crit_power),
            ((1.0 - crit_rate) * dh_rate, dh_power),
            (crit_rate * dh_rate, crit_power * dh_power),
        ];

        let band = self.variance.factor_variance();
        let mut mean = 0.0;
        let mut second_moment = 0.0;
        for (weight, multiplier) in outcomes {
            if weight <= 0.0 {
                continue;
            }
            let m = base * multiplier;
            mean += weight * m;
            // E[X^2] of a component = var + mean^2, var = m^2 * band
            second_moment += weight * m * m * (1.0 + band);
        }

        DamageDistribution {
            mean,
            variance: (second_moment - mean * mean).max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline_gear() -> Gearset {
        Gearset {
            weapon_damage: 146.0,
            main_attribute: 5130.0,
            critical_hit: 420.0,
            determination: 440.0,
            direct_hit: 420.0,
            speed: 420.0,
            weapon_delay: 2.64,
            party_bonus: 1.0,
            level: 100,
            job_modifier: 112.0,
            trait_multiplier: 1.0,
        }
    }

    #[test]
    fn base_substats_give_floor_rates() {
        let model = StatModel::from_gearset(&baseline_gear(), VarianceBand::default()).unwrap();
        assert!((model.crit_rate - 0.05).abs() < 1e-12);
        assert!((model.crit_power - 1.4).abs() < 1e-12);
        assert_eq!(model.direct_hit_rate, 0.0);
        assert_eq!(model.f_det, 1.0);
        assert_eq!(model.gcd_length(2500, 1.0), 2500);
    }

    #[test]
    fn speed_shortens_gcd() {
        let mut gear = baseline_gear();
        gear.speed = 420.0 + 2780.0 / 130.0 * 28.0;
        let model = StatModel::from_gearset(&gear, VarianceBand::default()).unwrap();
        assert!(model.gcd_length(2500, 1.0) < 2500);
        assert_eq!(model.gcd_length(2500, 1.0) % 10, 0);
    }

    #[test]
    fn speed_below_base_does_not_lengthen_gcd() {
        let mut gear = baseline_gear();
        gear.speed = 0.0;
        let model = StatModel::from_gearset(&gear, VarianceBand::default()).unwrap();
        assert_eq!(model.gcd_length(2500, 1.0), 2500);
    }

    #[test]
    fn unsupported_level_is_a_configuration_error() {
        let mut gear = baseline_gear();
        gear.level = 55;
        let err = StatModel::from_gearset(&gear, VarianceBand::default()).unwrap_err();
        assert!(matches!(err, SimError::Configuration { .. }));
    }

    #[test]
    fn no_variance_and_no_crit_yields_point_mass() {
        let mut model = StatModel::from_gearset(&baseline_gear(), VarianceBand::Uniform { half_width: 0.0 }).unwrap();
        model.crit_rate = 0.0;
        let dist = model.damage_distribution(300.0, DamageKind::Weaponskill, &HitModifiers::default());
        assert_eq!(dist.mean, model.base_damage(300.0, DamageKind::Weaponskill));
        assert!(dist.variance.abs() < 1e-9);
    }

    #[test]
    fn guaranteed_crit_uses_crit_power() {
        let model = StatModel::from_gearset(&baseline_gear(), VarianceBand::default()).unwrap();
        let hit = HitModifiers { guaranteed_crit: true, ..HitModifiers::default() };
        let dist = model.damage_distribution(300.0, DamageKind::Weaponskill, &hit);
        let base = model.base_damage(300.0, DamageKind::Weaponskill);
        assert!((dist.mean - base * model.crit_power).abs() < 1e-9);
    }

    #[test]
    fn crit_mixture_raises_mean_and_variance() {
        let model = StatModel::from_gearset(&baseline_gear(), VarianceBand::default()).unwrap();
        let base = model.base_damage(300.0, DamageKind::Weaponskill);
        let dist = model.damage_distribution(300.0, DamageKind::Weaponskill, &HitModifiers::default());
        let expected = base * (0.95 + 0.05 * model.crit_power);
        assert!((dist.mean - expected).abs() < 1e-9);
        let band_only = base * base * VarianceBand::default().factor_variance();
        assert!(dist.variance > band_only);
    }

    #[test]
    fn main_stat_bonus_recomputes_attack_power() {
        let model = StatModel::from_gearset(&baseline_gear(), VarianceBand::default()).unwrap();
        assert_eq!(model.main_stat, 5130.0);
        assert!((model.f_ap - 26.26).abs() < 1e-9);
        assert!((model.boosted_f_ap(392.0) - 28.37).abs() < 1e-9);
        assert_eq!(model.boosted_f_ap(0.0), model.f_ap);

        let plain = model.damage_distribution(300.0, DamageKind::Weaponskill, &HitModifiers::default());
        let hit = HitModifiers { main_stat_bonus: 392.0, ..HitModifiers::default() };
        let buffed = model.damage_distribution(300.0, DamageKind::Weaponskill, &hit);
        assert!(buffed.mean > plain.mean * 1.07);
    }

    #[test]
    fn truncated_normal_band_is_narrower_than_sigma() {
        let band = VarianceBand::Normal { sigma: 0.05, clip: 0.05 };
        let v = band.factor_variance();
        assert!(v > 0.0 && v < 0.05 * 0.05);
        let wide = VarianceBand::Normal { sigma: 0.01, clip: 0.5 };
        assert!((wide.factor_variance() - 0.0001).abs() < 1e-7);
    }
}
