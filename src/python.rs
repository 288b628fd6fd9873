//! Python bindings (feature `python`)

use numpy::{IntoPyArray, PyArray1};
use pyo3::prelude::*;

use crate::config::SimulationConfig;
use crate::montecarlo::{MonteCarloSimulator, Strategy};
use crate::simulation::{run_and_analyze, run_fight};

fn value_error(e: impl std::fmt::Display) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string())
}

fn parse_strategy(name: &str) -> PyResult<Strategy> {
    match name.to_lowercase().as_str() {
        "sequential" => Ok(Strategy::Sequential),
        "parallel" => Ok(Strategy::Parallel),
        "streaming" => Ok(Strategy::Streaming),
        "auto" => Ok(Strategy::Auto),
        _ => Err(value_error(format!("Invalid strategy: {}", name))),
    }
}

/// Runs the reference fight and the Monte Carlo analysis from a JSON config.
/// Returns `{"fight": ..., "report": ...}` as a JSON string.
#[pyfunction]
#[pyo3(signature = (config_json, fights=None, strategy="auto"))]
fn simulate_json(py: Python<'_>, config_json: &str, fights: Option<u64>, strategy: &str) -> PyResult<String> {
    let config = SimulationConfig::from_json(config_json).map_err(value_error)?;
    let mut mc = config.montecarlo.clone();
    if let Some(fights) = fights {
        mc.fights = fights;
    }
    mc.strategy = parse_strategy(strategy)?;

    // Release GIL during computation
    let (fight, report) = py
        .allow_threads(|| run_and_analyze(&config, &mc))
        .map_err(value_error)?;

    let output = serde_json::json!({ "fight": fight, "report": report });
    serde_json::to_string(&output).map_err(|e| {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("Failed to serialize results: {}", e))
    })
}

/// Per-fight DPS samples of the resampled distribution.
#[pyfunction]
#[pyo3(signature = (config_json, fights, seed=0))]
fn ledger_samples<'py>(
    py: Python<'py>,
    config_json: &str,
    fights: u64,
    seed: u64,
) -> PyResult<Bound<'py, PyArray1<f64>>> {
    let config = SimulationConfig::from_json(config_json).map_err(value_error)?;
    let kernel = config.montecarlo.kernel;
    let samples = py
        .allow_threads(|| -> crate::Result<Vec<f64>> {
            let fight = run_fight(&config)?;
            let sim = MonteCarloSimulator::new(&fight.ledger, fight.duration_ms)?;
            let seconds = fight.duration_ms as f64 / 1000.0;
            Ok(sim
                .sample_totals(fights, seed, kernel)
                .into_iter()
                .map(|total| total / seconds)
                .collect())
        })
        .map_err(value_error)?;
    Ok(samples.into_pyarray(py))
}

#[pyfunction]
fn get_available_cores() -> usize {
    num_cpus::get()
}

#[pymodule]
fn rotation_sim(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(simulate_json, m)?)?;
    m.add_function(wrap_pyfunction!(ledger_samples, m)?)?;
    m.add_function(wrap_pyfunction!(get_available_cores, m)?)?;
    Ok(())
}
