//! Prints the derived stat multipliers of a config's gearset

use rotation_sim::config::SimulationConfig;
use rotation_sim::formula::{DamageKind, HitModifiers, StatModel};
use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: inspect_gearset <config.yaml|config.json> [potency]");
        std::process::exit(2);
    }
    let potency: f64 = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(100.0);

    let config = match SimulationConfig::from_file(&args[1]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    let stats = match StatModel::from_gearset(&config.gearset, config.fight.variance) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Invalid gearset: {}", e);
            std::process::exit(1);
        }
    };

    println!("\n=== GEARSET (level {}) ===", config.gearset.level);
    println!("  crit rate:      {:.4}", stats.crit_rate);
    println!("  crit power:     {:.4}", stats.crit_power);
    println!("  direct hit:     {:.4}", stats.direct_hit_rate);
    println!("  f_ap:           {:.4}", stats.f_ap);
    println!("  f_det:          {:.4}", stats.f_det);
    println!("  f_wd:           {:.4}", stats.f_wd);
    println!("  f_auto:         {:.4}", stats.f_auto);
    println!("  f_spd (dot):    {:.4}", stats.f_spd);
    println!("  trait:          {:.2}", stats.trait_multiplier);
    println!("  weapon delay:   {}ms", stats.weapon_delay_ms);
    println!("  GCD 2.50s:      {}ms", stats.gcd_length(2500, 1.0));
    println!("  GCD 1.50s:      {}ms", stats.gcd_length(1500, 1.0));

    println!("\n=== {} POTENCY ===", potency);
    for (name, kind) in [
        ("weaponskill", DamageKind::Weaponskill),
        ("spell", DamageKind::Spell),
        ("dot tick", DamageKind::Dot),
        ("auto-attack", DamageKind::AutoAttack),
    ] {
        let dist = stats.damage_distribution(potency, kind, &HitModifiers::default());
        println!(
            "  {:<12} base {:>9.1}  expected {:>9.1} ± {:.1}",
            name,
            stats.base_damage(potency, kind),
            dist.mean,
            dist.std_dev()
        );
    }
}
