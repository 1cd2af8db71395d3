//! Wires stimuli to the timing log, the trial sequencer and the actuator.
//!
//! The host forwards each input as a [`Stimulus`] and calls
//! [`ExperimentController::tick`] once per frame. Both return the
//! [`ControllerEvent`]s they caused, in order.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{ExperimentConfig, SerialSettings};
use crate::errors::Result;
use crate::sequencer::{FlagSlot, Transition, TrialSequencer, TrialSlot};
use crate::serial::{CommandSink, SerialChannel};
use crate::timing::{CsvFileSink, RecordSink, StopOutcome, TimingLog, TrialRecord};
use crate::worker::SerialWorker;

/// Slider values closer than this count as equal.
const VALUE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    /// A new trial begins.
    StartTrial,
    /// The subject moved the slider to this value.
    SliderMoved(f64),
    /// Something with this tag touched the trigger volume.
    Contact(String),
    /// The experimenter asked for the next slot.
    ManualTrigger,
    /// Send this command to the actuator.
    Toggle(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    TrialStarted,
    TargetSelected,
    TrialRecorded(TrialRecord),
    BudgetReached,
    Advanced(Transition),
    CommandDispatched { message: String, delivered: bool },
    /// The stimulus had no effect: a contact with another tag, or a commit
    /// while no trial was running.
    StimulusIgnored(Stimulus),
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerEvent::TrialStarted => write!(f, "trial_started"),
            ControllerEvent::TargetSelected => write!(f, "target_selected"),
            ControllerEvent::TrialRecorded(record) => write!(f, "trial_recorded {record}"),
            ControllerEvent::BudgetReached => write!(f, "budget_reached"),
            ControllerEvent::Advanced(t) => write!(f, "advanced {} -> {}", t.from, t.to),
            ControllerEvent::CommandDispatched { message, delivered } => {
                write!(f, "command {message:?} delivered={delivered}")
            }
            ControllerEvent::StimulusIgnored(stimulus) => write!(f, "ignored {stimulus:?}"),
        }
    }
}

/// Selection state of the response slider.
#[derive(Debug, Clone, Copy, Default)]
struct SliderState {
    value: Option<f64>,
    selected: bool,
    last_move: Option<Instant>,
}

pub struct ExperimentController<C: Clock + Clone, K: RecordSink, S: TrialSlot = FlagSlot> {
    clock: C,
    timing: TimingLog<C, K>,
    sequencer: TrialSequencer<S>,
    commands: Option<Box<dyn CommandSink>>,
    subject_id: String,
    slider: SliderState,
    slider_target: f64,
    reselect_interval: Duration,
    contact_tag: String,
    advance_delay: Duration,
    advance_on_completion: bool,
    reset_on_completion: bool,
}

impl ExperimentController<SystemClock, CsvFileSink, FlagSlot> {
    /// Build a controller on the real clock, writing results to the CSV file
    /// named by `config` and driving the serial device it describes.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let sink = CsvFileSink::create(&config.results_dir, &config.data_label)?;
        let slots = vec![FlagSlot::default(); config.slot_count];
        let commands = command_sink(&config.serial)?;
        Self::new(config, SystemClock, sink, slots, Some(commands))
    }
}

/// Build the actuator command path described by `settings`.
pub fn command_sink(settings: &SerialSettings) -> Result<Box<dyn CommandSink>> {
    let mut channel = SerialChannel::system(settings.port_name.clone());
    channel.set_disabled(settings.disabled);
    if settings.worker {
        Ok(Box::new(SerialWorker::spawn(channel)?))
    } else {
        Ok(Box::new(channel))
    }
}

impl<C: Clock + Clone, K: RecordSink, S: TrialSlot> ExperimentController<C, K, S> {
    pub fn new(
        config: &ExperimentConfig,
        clock: C,
        sink: K,
        slots: Vec<S>,
        commands: Option<Box<dyn CommandSink>>,
    ) -> Result<Self> {
        let sequencer = TrialSequencer::new(slots)?;
        let timing = TimingLog::new(clock.clone(), sink, config.iterations);
        info!(
            "experiment ready: subject={}, iterations={}, slots={}",
            config.subject_id,
            config.iterations,
            sequencer.len()
        );

        Ok(Self {
            clock,
            timing,
            sequencer,
            commands,
            subject_id: config.subject_id.clone(),
            slider: SliderState::default(),
            slider_target: config.slider_target,
            reselect_interval: config.reselect_interval(),
            contact_tag: config.contact_tag.clone(),
            advance_delay: config.advance_delay(),
            advance_on_completion: config.advance_on_completion,
            reset_on_completion: config.reset_on_completion,
        })
    }

    /// React to one external input.
    ///
    /// Only a failure to persist a trial record is returned as an error.
    pub fn handle(&mut self, stimulus: Stimulus) -> Result<Vec<ControllerEvent>> {
        let mut events = Vec::new();
        match stimulus {
            Stimulus::StartTrial => {
                self.timing.start();
                self.slider.selected = false;
                events.push(ControllerEvent::TrialStarted);
            }
            Stimulus::SliderMoved(value) => self.slider_moved(value, &mut events),
            Stimulus::Contact(tag) => {
                let committed = tag == self.contact_tag && self.commit(&mut events)?;
                if !committed {
                    debug!("contact ignored: tag={}", tag);
                    events.push(ControllerEvent::StimulusIgnored(Stimulus::Contact(tag)));
                }
            }
            Stimulus::ManualTrigger => {
                let now = self.clock.now();
                self.sequencer.request_advance(now, self.advance_delay);
            }
            Stimulus::Toggle(message) => {
                let delivered = match self.commands.as_mut() {
                    Some(sink) => sink.dispatch(&message),
                    None => false,
                };
                events.push(ControllerEvent::CommandDispatched { message, delivered });
            }
        }
        Ok(events)
    }

    /// Per-frame update: commits a settled slider and runs a due advance.
    pub fn tick(&mut self) -> Result<Vec<ControllerEvent>> {
        let mut events = Vec::new();
        let now = self.clock.now();

        if self.slider_settled_on_target(now) {
            self.slider.selected = false;
            self.commit(&mut events)?;
        }
        if let Some(transition) = self.sequencer.poll(now) {
            events.push(ControllerEvent::Advanced(transition));
        }
        Ok(events)
    }

    fn slider_moved(&mut self, value: f64, events: &mut Vec<ControllerEvent>) {
        self.slider.value = Some(value);
        self.slider.last_move = Some(self.clock.now());
        if !self.slider.selected && self.timing.is_running() {
            self.slider.selected = true;
            self.timing.select();
            events.push(ControllerEvent::TargetSelected);
        }
    }

    // The subject may overshoot and come back, so the value must rest on
    // the target for the whole reselect interval.
    fn slider_settled_on_target(&self, now: Instant) -> bool {
        let on_target = self
            .slider
            .value
            .is_some_and(|v| (v - self.slider_target).abs() < VALUE_TOLERANCE);
        let settled = self
            .slider
            .last_move
            .is_some_and(|t| now.saturating_duration_since(t) >= self.reselect_interval);
        self.slider.selected && on_target && settled
    }

    /// Stop the running trial. Returns `false` if there was none.
    fn commit(&mut self, events: &mut Vec<ControllerEvent>) -> Result<bool> {
        let outcome = self.timing.stop(&self.subject_id)?;
        if outcome == StopOutcome::NotRunning {
            return Ok(false);
        }
        if let StopOutcome::Recorded { record, .. } = &outcome {
            events.push(ControllerEvent::TrialRecorded(record.clone()));
        }
        if outcome.fires_completion() {
            events.push(ControllerEvent::BudgetReached);
            if self.reset_on_completion {
                self.timing.reset();
            }
            if self.advance_on_completion {
                let now = self.clock.now();
                self.sequencer.request_advance(now, self.advance_delay);
            }
        }
        Ok(true)
    }

    /// Send a command to the actuator directly.
    pub fn dispatch(&mut self, message: &str) -> bool {
        self.commands
            .as_mut()
            .is_some_and(|sink| sink.dispatch(message))
    }

    pub fn set_subject_id(&mut self, subject_id: impl Into<String>) {
        self.subject_id = subject_id.into();
        info!("subject set: {}", self.subject_id);
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Start a new block: the trial count returns to zero.
    pub fn reset_block(&mut self) {
        self.timing.reset();
    }

    pub fn position(&self) -> usize {
        self.sequencer.position()
    }

    pub fn timing(&self) -> &TimingLog<C, K> {
        &self.timing
    }

    pub fn sequencer(&self) -> &TrialSequencer<S> {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut TrialSequencer<S> {
        &mut self.sequencer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::serial::fake::{FakeBackend, PortBehaviour};
    use crate::timing::MemorySink;

    type TestController = ExperimentController<ManualClock, MemorySink>;

    fn config(iterations: usize, slots: usize) -> ExperimentConfig {
        ExperimentConfig {
            subject_id: "p01".into(),
            iterations,
            slot_count: slots,
            slider_target: 5.0,
            ..Default::default()
        }
    }

    fn controller(cfg: &ExperimentConfig) -> (ManualClock, TestController) {
        let clock = ManualClock::new();
        let slots = vec![FlagSlot::default(); cfg.slot_count];
        let controller =
            ExperimentController::new(cfg, clock.clone(), MemorySink::default(), slots, None)
                .unwrap();
        (clock, controller)
    }

    #[test]
    fn slider_trial_is_recorded_after_settling() {
        let cfg = config(3, 2);
        let (clock, mut c) = controller(&cfg);

        c.handle(Stimulus::StartTrial).unwrap();
        clock.advance_secs(2.0);
        let events = c.handle(Stimulus::SliderMoved(3.0)).unwrap();
        assert_eq!(events, vec![ControllerEvent::TargetSelected]);

        clock.advance_secs(1.0);
        assert!(c.handle(Stimulus::SliderMoved(5.0)).unwrap().is_empty());

        // Not settled yet.
        clock.advance_secs(0.05);
        assert!(c.tick().unwrap().is_empty());

        clock.advance_secs(0.05);
        let events = c.tick().unwrap();
        let expected = TrialRecord {
            subject_id: "p01".into(),
            selection_seconds: 2.0,
            positioning_seconds: 1.1,
        };
        assert_eq!(events.len(), 1);
        match &events[0] {
            ControllerEvent::TrialRecorded(r) => {
                assert_eq!(r.subject_id, expected.subject_id);
                assert!((r.selection_seconds - 2.0).abs() < 1e-9);
                assert!((r.positioning_seconds - 1.1).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(c.timing().completed(), 1);

        // A second tick does not commit again.
        assert!(c.tick().unwrap().is_empty());
    }

    #[test]
    fn slider_off_target_never_commits() {
        let cfg = config(3, 1);
        let (clock, mut c) = controller(&cfg);
        c.handle(Stimulus::StartTrial).unwrap();
        c.handle(Stimulus::SliderMoved(4.0)).unwrap();
        clock.advance_secs(5.0);
        assert!(c.tick().unwrap().is_empty());
        assert_eq!(c.timing().completed(), 0);
    }

    #[test]
    fn selection_fires_once_per_trial() {
        let cfg = config(3, 1);
        let (clock, mut c) = controller(&cfg);
        c.handle(Stimulus::StartTrial).unwrap();

        let mut selections = 0;
        for v in [1.0, 2.0, 3.0] {
            clock.advance_secs(0.01);
            selections += c
                .handle(Stimulus::SliderMoved(v))
                .unwrap()
                .iter()
                .filter(|e| **e == ControllerEvent::TargetSelected)
                .count();
        }
        assert_eq!(selections, 1);

        c.handle(Stimulus::StartTrial).unwrap();
        let events = c.handle(Stimulus::SliderMoved(4.0)).unwrap();
        assert_eq!(events, vec![ControllerEvent::TargetSelected]);
    }

    #[test]
    fn contact_with_matching_tag_commits() {
        let cfg = config(3, 1);
        let (clock, mut c) = controller(&cfg);
        c.handle(Stimulus::StartTrial).unwrap();
        clock.advance_secs(1.0);
        c.handle(Stimulus::SliderMoved(1.0)).unwrap();
        clock.advance_secs(1.0);

        let sphere = Stimulus::Contact("Sphere".into());
        assert_eq!(
            c.handle(sphere.clone()).unwrap(),
            vec![ControllerEvent::StimulusIgnored(sphere)]
        );
        let events = c.handle(Stimulus::Contact("Cube".into())).unwrap();
        assert!(matches!(events[0], ControllerEvent::TrialRecorded(_)));
    }

    #[test]
    fn completion_resets_and_advances_after_delay() {
        let cfg = config(1, 3);
        let (clock, mut c) = controller(&cfg);

        c.handle(Stimulus::StartTrial).unwrap();
        c.handle(Stimulus::SliderMoved(2.0)).unwrap();
        let events = c.handle(Stimulus::Contact("Cube".into())).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ControllerEvent::BudgetReached);
        assert_eq!(c.timing().completed(), 0);
        assert_eq!(c.position(), 0);

        clock.advance(Duration::from_millis(100));
        let events = c.tick().unwrap();
        match events.as_slice() {
            [ControllerEvent::Advanced(t)] => {
                assert_eq!((t.from, t.to), (0, 1));
                assert!(t.exited_first);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(c.position(), 1);
    }

    #[test]
    fn budget_without_reset_keeps_signalling() {
        let cfg = ExperimentConfig {
            reset_on_completion: false,
            advance_on_completion: false,
            ..config(1, 2)
        };
        let (_clock, mut c) = controller(&cfg);
        for _ in 0..3 {
            c.handle(Stimulus::StartTrial).unwrap();
            let events = c.handle(Stimulus::Contact("Cube".into())).unwrap();
            assert!(events.contains(&ControllerEvent::BudgetReached));
        }
        assert_eq!(c.timing().total_recorded(), 1);
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn commit_without_start_is_ignored() {
        let cfg = config(2, 1);
        let (_clock, mut c) = controller(&cfg);
        let cube = Stimulus::Contact("Cube".into());
        assert_eq!(
            c.handle(cube.clone()).unwrap(),
            vec![ControllerEvent::StimulusIgnored(cube.clone())]
        );
        assert_eq!(c.timing().completed(), 0);

        // A second contact after a recorded trial has nothing left to stop.
        c.handle(Stimulus::StartTrial).unwrap();
        let events = c.handle(cube.clone()).unwrap();
        assert!(matches!(events[0], ControllerEvent::TrialRecorded(_)));
        assert_eq!(
            c.handle(cube.clone()).unwrap(),
            vec![ControllerEvent::StimulusIgnored(cube)]
        );
        assert_eq!(c.timing().completed(), 1);
    }

    #[test]
    fn slider_moves_before_start_are_silent() {
        let cfg = config(3, 1);
        let (clock, mut c) = controller(&cfg);
        assert!(c.handle(Stimulus::SliderMoved(5.0)).unwrap().is_empty());
        clock.advance_secs(1.0);
        assert!(c.tick().unwrap().is_empty());
        assert_eq!(c.timing().completed(), 0);

        c.handle(Stimulus::StartTrial).unwrap();
        let events = c.handle(Stimulus::SliderMoved(4.0)).unwrap();
        assert_eq!(events, vec![ControllerEvent::TargetSelected]);
    }

    #[test]
    fn ignored_stimulus_is_displayed() {
        let event = ControllerEvent::StimulusIgnored(Stimulus::Contact("Sphere".into()));
        assert_eq!(event.to_string(), "ignored Contact(\"Sphere\")");
    }

    #[test]
    fn manual_trigger_advances_once() {
        let cfg = config(2, 3);
        let (clock, mut c) = controller(&cfg);
        c.handle(Stimulus::ManualTrigger).unwrap();
        c.handle(Stimulus::ManualTrigger).unwrap();
        clock.advance_secs(1.0);
        let events = c.tick().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(c.position(), 1);
    }

    #[test]
    fn toggles_go_to_the_serial_channel() {
        let cfg = config(2, 1);
        let clock = ManualClock::new();
        let backend = FakeBackend::new(&[("ttyA", PortBehaviour::Healthy)]);
        let channel = SerialChannel::new(backend.clone(), None);
        let mut c = ExperimentController::new(
            &cfg,
            clock,
            MemorySink::default(),
            vec![FlagSlot::default()],
            Some(Box::new(channel)),
        )
        .unwrap();

        let events = c.handle(Stimulus::Toggle("128 0".into())).unwrap();
        assert_eq!(
            events,
            vec![ControllerEvent::CommandDispatched {
                message: "128 0".into(),
                delivered: true
            }]
        );
        assert!(c.dispatch("0 0"));
        assert_eq!(backend.written("ttyA"), "0 0\n128 0\n0 0\n");
    }

    #[test]
    fn toggles_without_channel_are_dropped() {
        let cfg = config(2, 1);
        let (_clock, mut c) = controller(&cfg);
        let events = c.handle(Stimulus::Toggle("1 1".into())).unwrap();
        assert_eq!(
            events,
            vec![ControllerEvent::CommandDispatched {
                message: "1 1".into(),
                delivered: false
            }]
        );
    }

    #[test]
    fn subject_change_applies_to_next_record() {
        let cfg = config(5, 1);
        let (_clock, mut c) = controller(&cfg);
        c.set_subject_id("p02");
        c.handle(Stimulus::StartTrial).unwrap();
        c.handle(Stimulus::Contact("Cube".into())).unwrap();
        assert_eq!(c.timing().last_record().unwrap().subject_id, "p02");
    }
}
