//! Experiment harness for haptic psychophysics trials.
//!
//! The subject works through an ordered sequence of trial slots. In each
//! trial they select a target and move it into position; the harness times
//! both phases, appends one record per trial to a results file, and can
//! command a vibrotactile actuator over a serial link.
//!
//! # Pieces
//!
//! - [`TrialSequencer`]: which slot is active, with hooks on leaving and
//!   re-entering slot 0.
//! - [`TimingLog`]: selection and positioning times, persisted per trial up
//!   to a budget.
//! - [`SerialChannel`]: finds the actuator among the system's serial ports
//!   and writes command lines to it. [`SerialWorker`] moves it off the
//!   caller's thread.
//! - [`ExperimentController`]: turns host stimuli into calls on the above.
//!
//! The host engine (rendering, physics, UI) stays outside; it forwards
//! stimuli and calls [`ExperimentController::tick`] once per frame.

pub mod clock;
pub mod config;
pub mod controller;
mod errors;
pub mod logging;
pub mod sequencer;
pub mod serial;
pub mod timing;
pub mod worker;

#[cfg(feature = "python")]
mod python;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExperimentConfig, SerialSettings};
pub use controller::{ControllerEvent, ExperimentController, Stimulus};
pub use errors::*;
pub use sequencer::{FlagSlot, SequenceHooks, Transition, TrialSequencer, TrialSlot};
pub use serial::{
    ChannelState, CommandSink, LineConfig, PortBackend, SerialChannel, SerialLink, SystemPorts,
};
pub use timing::{CsvFileSink, MemorySink, RecordSink, StopOutcome, TimingLog, TrialRecord};
pub use worker::SerialWorker;
