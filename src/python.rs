//! Python bindings, so a Python experiment runner can host the harness.

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::clock::SystemClock;
use crate::config::ExperimentConfig;
use crate::controller::{ControllerEvent, ExperimentController, Stimulus};
use crate::errors::HarnessError;
use crate::logging;
use crate::sequencer::FlagSlot;
use crate::serial::{PortBackend, SystemPorts};
use crate::timing::CsvFileSink;

fn to_py_err(e: HarnessError) -> PyErr {
    match e {
        HarnessError::Config(msg) => PyValueError::new_err(msg),
        other => PyIOError::new_err(other.to_string()),
    }
}

fn to_strings(events: Vec<ControllerEvent>) -> Vec<String> {
    events.into_iter().map(|e| e.to_string()).collect()
}

/// A running experiment.
///
/// Every method returns the events it caused as strings, e.g.
/// ``["trial_recorded p01,1.2,0.8", "budget_reached"]``.
///
/// Example:
///     >>> exp = Experiment("experiment.json")
///     >>> exp.start_trial()
///     >>> exp.slider_moved(3)
///     >>> exp.tick()
#[pyclass(name = "Experiment", unsendable)]
struct PyExperiment {
    inner: ExperimentController<SystemClock, CsvFileSink, FlagSlot>,
}

#[pymethods]
impl PyExperiment {
    /// Create an experiment from a JSON config file, or from defaults.
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => ExperimentConfig::load(path)
                .map_err(|e| PyValueError::new_err(format!("{e:#}")))?,
            None => ExperimentConfig::default(),
        };
        let inner = ExperimentController::from_config(&config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn start_trial(&mut self) -> PyResult<Vec<String>> {
        self.handle(Stimulus::StartTrial)
    }

    fn slider_moved(&mut self, value: f64) -> PyResult<Vec<String>> {
        self.handle(Stimulus::SliderMoved(value))
    }

    fn contact(&mut self, tag: String) -> PyResult<Vec<String>> {
        self.handle(Stimulus::Contact(tag))
    }

    fn manual_trigger(&mut self) -> PyResult<Vec<String>> {
        self.handle(Stimulus::ManualTrigger)
    }

    /// Send a command line to the actuator.
    fn toggle(&mut self, message: String) -> PyResult<Vec<String>> {
        self.handle(Stimulus::Toggle(message))
    }

    /// Call once per frame.
    fn tick(&mut self) -> PyResult<Vec<String>> {
        self.inner.tick().map(to_strings).map_err(to_py_err)
    }

    fn reset_block(&mut self) {
        self.inner.reset_block();
    }

    #[getter]
    fn subject_id(&self) -> String {
        self.inner.subject_id().to_string()
    }

    #[setter]
    fn set_subject_id(&mut self, subject_id: String) {
        self.inner.set_subject_id(subject_id);
    }

    #[getter]
    fn position(&self) -> usize {
        self.inner.position()
    }

    #[getter]
    fn completed(&self) -> usize {
        self.inner.timing().completed()
    }

    fn __repr__(&self) -> String {
        format!(
            "Experiment(subject={}, position={}, completed={}/{})",
            self.inner.subject_id(),
            self.inner.position(),
            self.inner.timing().completed(),
            self.inner.timing().target()
        )
    }
}

impl PyExperiment {
    fn handle(&mut self, stimulus: Stimulus) -> PyResult<Vec<String>> {
        self.inner
            .handle(stimulus)
            .map(to_strings)
            .map_err(to_py_err)
    }
}

/// Names of the serial ports the OS currently exposes.
#[pyfunction]
fn list_ports() -> PyResult<Vec<String>> {
    SystemPorts.list_candidate_ports().map_err(to_py_err)
}

#[pyfunction]
fn init_logging(py: Python<'_>) -> PyResult<()> {
    logging::init_python_logging(py)
}

#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

#[pymodule]
fn haptic_trials(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyExperiment>()?;
    m.add_function(wrap_pyfunction!(list_ports, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add("HANDSHAKE", crate::serial::HANDSHAKE)?;
    Ok(())
}
