use std::path::PathBuf;

use rotation_sim::action::ActionRegistry;
use rotation_sim::config::SimulationConfig;
use rotation_sim::montecarlo::Strategy;
use rotation_sim::rotation::Rotation;
use rotation_sim::simulation::run_fight;
use rotation_sim::SimError;

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/samurai.yaml")
}

fn demo_yaml() -> String {
    std::fs::read_to_string(demo_path()).unwrap()
}

fn load_rotation(yaml: &str) -> Result<Rotation, SimError> {
    let config = SimulationConfig::from_yaml_str(yaml)?;
    let registry = ActionRegistry::from_config(&config)?;
    Rotation::from_config(&config.rotation, &registry)
}

#[test]
fn demo_config_loads() {
    let config = SimulationConfig::from_file(demo_path()).unwrap();
    assert_eq!(config.name, "Samurai");
    assert_eq!(config.resources[0].name, "kenki");
    assert_eq!(config.montecarlo.seed, Some(7));
    assert_eq!(config.montecarlo.strategy, Strategy::Auto);
    assert_eq!(config.fight.start_ms, -30_000);
}

#[test]
fn loading_twice_yields_the_same_rotation() {
    let yaml = demo_yaml();
    let first = load_rotation(&yaml).unwrap();
    let second = load_rotation(&yaml).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.name(), "standard loop");
    assert!(first.entries().iter().any(|e| e.condition.is_some()));
}

#[test]
fn json_and_yaml_files_drive_the_same_fight() {
    let yaml_config = SimulationConfig::from_file(demo_path()).unwrap();
    let json_path = std::env::temp_dir().join(format!("rotation-sim-demo-{}.json", std::process::id()));
    std::fs::write(&json_path, serde_json::to_string_pretty(&yaml_config).unwrap()).unwrap();
    let json_config = SimulationConfig::from_file(&json_path).unwrap();
    std::fs::remove_file(&json_path).ok();

    let a = run_fight(&yaml_config).unwrap();
    let b = run_fight(&json_config).unwrap();
    assert_eq!(a.ledger.len(), b.ledger.len());
    assert!((a.dps - b.dps).abs() < 1e-6);
}

#[test]
fn unknown_rotation_action_is_reported() {
    let yaml = demo_yaml().replacen("    - action: Jinpu\n", "    - action: Hakaze\n", 1);
    match load_rotation(&yaml) {
        Err(SimError::UnknownAction(name)) => assert!(name.contains("Hakaze"), "{name}"),
        other => panic!("expected an unknown action error, got {other:?}"),
    }
    let config = SimulationConfig::from_yaml_str(&yaml).unwrap();
    assert!(run_fight(&config).is_err());
}

#[test]
fn unknown_status_in_condition_is_reported() {
    let yaml = demo_yaml().replace("        status: Higanbana\n        ms: 5000", "        status: Tsubame\n        ms: 5000");
    assert!(matches!(load_rotation(&yaml), Err(SimError::UnknownStatus(_))));
}

#[test]
fn unknown_status_in_effect_is_reported() {
    let yaml = demo_yaml().replace("        status: Fugetsu\n        on: caster", "        status: Shifu\n        on: caster");
    let config = SimulationConfig::from_yaml_str(&yaml).unwrap();
    assert!(matches!(ActionRegistry::from_config(&config), Err(SimError::UnknownStatus(_))));
}

#[test]
fn negative_numerics_are_configuration_errors() {
    let cases = [
        ("  determination: 2080", "  determination: -2080"),
        ("    recast_ms: 1000\n", "    recast_ms: -1000\n"),
        ("fight:\n  duration_ms: 60000", "fight:\n  duration_ms: 0"),
        ("        amount: 25\n", "        amount: -25\n"),
    ];
    for (from, to) in cases {
        let yaml = demo_yaml().replacen(from, to, 1);
        assert_ne!(yaml, demo_yaml(), "pattern `{from}` not found");
        let err = SimulationConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, SimError::Configuration { .. }), "{from}: {err}");
    }
}

#[test]
fn combo_cycle_is_rejected() {
    let yaml = demo_yaml().replacen("    combo: start\n", "    combo: start\n    combo_requires: Gekko\n", 1);
    let config = SimulationConfig::from_yaml_str(&yaml).unwrap();
    assert!(matches!(
        ActionRegistry::from_config(&config),
        Err(SimError::Configuration { .. })
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = SimulationConfig::from_file("does/not/exist.yaml").unwrap_err();
    assert!(matches!(err, SimError::Io(_)));
}
