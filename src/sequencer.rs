//! Ordered progression through trial slots.
//!
//! A [`TrialSequencer`] owns a fixed list of slots and keeps exactly one of
//! them active. Every advance deactivates the current slot before activating
//! the next one, wrapping back to slot 0 at the end of the list. Slot 0 is the
//! start of a block, so leaving it and re-entering it are reported through
//! [`SequenceHooks`] and in the returned [`Transition`].

use std::time::{Duration, Instant};

use log::debug;

use crate::errors::{Result, SequenceError};

/// One unit of experiment state that can be switched on and off.
pub trait TrialSlot {
    fn set_active(&mut self, active: bool);
    fn is_active(&self) -> bool;
}

/// A slot that is nothing more than its activation flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSlot {
    active: bool,
}

impl TrialSlot for FlagSlot {
    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Callbacks fired when the sequence leaves or re-enters slot 0.
pub trait SequenceHooks {
    fn on_exit_first(&mut self) {}
    fn on_enter_first(&mut self) {}
}

impl SequenceHooks for () {}

/// What a single advance did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    pub exited_first: bool,
    pub entered_first: bool,
}

/// Whether an advance is waiting on its transition delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerPhase {
    Idle,
    Pending { due: Instant },
}

pub struct TrialSequencer<S: TrialSlot, H: SequenceHooks = ()> {
    slots: Vec<S>,
    position: usize,
    hooks: H,
    phase: SequencerPhase,
}

impl<S: TrialSlot> TrialSequencer<S> {
    /// Build a sequencer without hooks. See [`TrialSequencer::with_hooks`].
    pub fn new(slots: Vec<S>) -> Result<Self> {
        Self::with_hooks(slots, ())
    }
}

impl<S: TrialSlot, H: SequenceHooks> TrialSequencer<S, H> {
    /// Build a sequencer and run the startup pass.
    ///
    /// The startup pass advances until the position wraps back to 0, so
    /// every slot is visited exactly once and the sequence then rests on
    /// slot 0 with only that slot active. Hooks fire during this pass just as
    /// they do for later advances.
    pub fn with_hooks(slots: Vec<S>, hooks: H) -> Result<Self> {
        if slots.is_empty() {
            return Err(SequenceError::Empty.into());
        }

        let mut sequencer = Self {
            slots,
            position: 0,
            hooks,
            phase: SequencerPhase::Idle,
        };

        sequencer.advance();
        while sequencer.position != 0 {
            sequencer.advance();
        }
        debug!("trial sequence initialised: slots={}", sequencer.slots.len());
        Ok(sequencer)
    }

    /// Deactivate the current slot and activate the next one.
    ///
    /// Any pending delayed advance is cancelled, since this call performs the
    /// transition it was waiting for.
    pub fn advance(&mut self) -> Transition {
        assert!(!self.slots.is_empty(), "advance on an empty trial sequence");
        self.phase = SequencerPhase::Idle;

        let from = self.position;
        let exited_first = self.deactivate_current();
        let entered_first = self.activate_current();

        let transition = Transition {
            from,
            to: self.position,
            exited_first,
            entered_first,
        };
        debug!("trial slot {} -> {}", transition.from, transition.to);
        transition
    }

    /// Schedule an advance to happen `delay` after `now`.
    ///
    /// Returns `false` if an advance is already pending; the earlier request
    /// keeps its deadline so two transitions can never interleave.
    pub fn request_advance(&mut self, now: Instant, delay: Duration) -> bool {
        match self.phase {
            SequencerPhase::Pending { .. } => false,
            SequencerPhase::Idle => {
                self.phase = SequencerPhase::Pending { due: now + delay };
                true
            }
        }
    }

    /// Perform the pending advance if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<Transition> {
        match self.phase {
            SequencerPhase::Pending { due } if now >= due => Some(self.advance()),
            _ => None,
        }
    }

    fn deactivate_current(&mut self) -> bool {
        let exited_first = self.position == 0;
        if exited_first {
            self.hooks.on_exit_first();
        }
        self.slots[self.position].set_active(false);
        self.position = (self.position + 1) % self.slots.len();
        exited_first
    }

    fn activate_current(&mut self) -> bool {
        let entered_first = self.position == 0;
        if entered_first {
            self.hooks.on_enter_first();
        }
        self.slots[self.position].set_active(true);
        entered_first
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; an empty sequence cannot be built.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn phase(&self) -> SequencerPhase {
        self.phase
    }

    pub fn slots(&self) -> &[S] {
        &self.slots
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HarnessError;

    #[derive(Debug, Default)]
    struct CountingHooks {
        exits: usize,
        enters: usize,
    }

    impl SequenceHooks for CountingHooks {
        fn on_exit_first(&mut self) {
            self.exits += 1;
        }

        fn on_enter_first(&mut self) {
            self.enters += 1;
        }
    }

    /// Slot that counts how often it was switched on and off.
    #[derive(Debug, Default)]
    struct TrackedSlot {
        active: bool,
        activations: usize,
        deactivations: usize,
    }

    impl TrialSlot for TrackedSlot {
        fn set_active(&mut self, active: bool) {
            if active {
                self.activations += 1;
            } else {
                self.deactivations += 1;
            }
            self.active = active;
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn flags(n: usize) -> Vec<FlagSlot> {
        vec![FlagSlot::default(); n]
    }

    fn active_positions<S: TrialSlot, H: SequenceHooks>(seq: &TrialSequencer<S, H>) -> Vec<usize> {
        seq.slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let err = TrialSequencer::new(Vec::<FlagSlot>::new()).err();
        assert!(matches!(
            err,
            Some(HarnessError::Sequence(SequenceError::Empty))
        ));
    }

    #[test]
    fn startup_rests_on_first_slot() {
        let seq = TrialSequencer::with_hooks(flags(4), CountingHooks::default()).unwrap();
        assert_eq!(seq.position(), 0);
        assert_eq!(active_positions(&seq), vec![0]);
        // One full cycle during startup.
        assert_eq!(seq.hooks().exits, 1);
        assert_eq!(seq.hooks().enters, 1);
    }

    #[test]
    fn startup_visits_each_slot_once() {
        let slots: Vec<TrackedSlot> = (0..5).map(|_| TrackedSlot::default()).collect();
        let seq = TrialSequencer::new(slots).unwrap();
        for slot in seq.slots() {
            assert_eq!(slot.deactivations, 1);
            assert_eq!(slot.activations, 1);
        }
    }

    #[test]
    fn single_slot_startup_terminates() {
        let mut seq = TrialSequencer::with_hooks(flags(1), CountingHooks::default()).unwrap();
        assert_eq!(seq.hooks().exits, 1);
        assert_eq!(seq.hooks().enters, 1);

        let t = seq.advance();
        assert_eq!((t.from, t.to), (0, 0));
        assert!(t.exited_first && t.entered_first);
        assert_eq!(active_positions(&seq), vec![0]);
    }

    #[test]
    fn three_slots_cycle_back_to_start() {
        let mut seq = TrialSequencer::with_hooks(flags(3), CountingHooks::default()).unwrap();
        let baseline = (seq.hooks().exits, seq.hooks().enters);

        let first = seq.advance();
        let second = seq.advance();
        let third = seq.advance();

        assert_eq!([first.to, second.to, third.to], [1, 2, 0]);
        assert!(first.exited_first && !first.entered_first);
        assert!(!second.exited_first && !second.entered_first);
        assert!(!third.exited_first && third.entered_first);
        assert_eq!(seq.hooks().exits, baseline.0 + 1);
        assert_eq!(seq.hooks().enters, baseline.1 + 1);
    }

    #[test]
    fn n_advances_return_to_start_for_all_lengths() {
        for n in 1..=8 {
            let slots: Vec<TrackedSlot> = (0..n).map(|_| TrackedSlot::default()).collect();
            let mut seq = TrialSequencer::with_hooks(slots, CountingHooks::default()).unwrap();
            for _ in 0..n {
                seq.advance();
                assert_eq!(active_positions(&seq).len(), 1);
            }
            assert_eq!(seq.position(), 0, "length {n}");
            assert_eq!(seq.hooks().exits, 2);
            assert_eq!(seq.hooks().enters, 2);
            for slot in seq.slots() {
                assert_eq!(slot.activations, 2);
                assert_eq!(slot.deactivations, 2);
            }
        }
    }

    #[test]
    fn delayed_advance_waits_for_deadline() {
        let mut seq = TrialSequencer::new(flags(2)).unwrap();
        let t0 = Instant::now();
        let delay = Duration::from_millis(100);

        assert!(seq.request_advance(t0, delay));
        assert_eq!(seq.poll(t0 + Duration::from_millis(50)), None);
        assert_eq!(seq.position(), 0);

        let t = seq.poll(t0 + delay).unwrap();
        assert_eq!(t.to, 1);
        assert_eq!(seq.phase(), SequencerPhase::Idle);
        assert_eq!(seq.poll(t0 + delay * 2), None);
    }

    #[test]
    fn repeated_requests_do_not_stack() {
        let mut seq = TrialSequencer::new(flags(3)).unwrap();
        let t0 = Instant::now();
        let delay = Duration::from_millis(100);

        assert!(seq.request_advance(t0, delay));
        assert!(!seq.request_advance(t0 + Duration::from_millis(10), delay));

        seq.poll(t0 + Duration::from_secs(1));
        assert_eq!(seq.position(), 1);
        assert_eq!(seq.poll(t0 + Duration::from_secs(2)), None);
    }

    #[test]
    fn immediate_advance_cancels_pending_request() {
        let mut seq = TrialSequencer::new(flags(3)).unwrap();
        let t0 = Instant::now();
        seq.request_advance(t0, Duration::from_millis(100));

        seq.advance();
        assert_eq!(seq.position(), 1);
        assert_eq!(seq.poll(t0 + Duration::from_secs(1)), None);
        assert_eq!(seq.position(), 1);
    }
}
