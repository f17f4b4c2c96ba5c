use embedded_hal::{
    delay::DelayNs,
    digital::{Error as _, OutputPin},
};
use log::{debug, info, warn};

use crate::{
    error::StepperError,
    types::{Direction, Motion},
};

pub const PHASE_COUNT: u8 = 4;

// Wave drive: one coil energised per phase, IN1..IN4 in order.
const PHASE_TABLE: [[bool; 4]; PHASE_COUNT as usize] = [
    [true, false, false, false],
    [false, true, false, false],
    [false, false, true, false],
    [false, false, false, true],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Stepping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    pub phase: u8,
    pub enabled: bool,
    pub remaining: u32,
    pub direction: Direction,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            phase: 0,
            enabled: false,
            remaining: 0,
            direction: Direction::Forward,
        }
    }
}

impl ActuatorState {
    pub fn motion(&self) -> MotionState {
        if self.enabled {
            MotionState::Stepping
        } else {
            MotionState::Idle
        }
    }
}

pub fn next_phase(phase: u8, direction: Direction) -> u8 {
    match direction {
        Direction::Forward => (phase + 1) % PHASE_COUNT,
        Direction::Backward => (phase + PHASE_COUNT - 1) % PHASE_COUNT,
    }
}

pub fn phase_lines(phase: u8) -> [bool; 4] {
    PHASE_TABLE[(phase % PHASE_COUNT) as usize]
}

// 28BYJ-48 on a ULN2003 board, driven in bounded slices.
pub struct Stepper<P, D> {
    coils: [P; 4],
    delay: D,
    step_period_ms: u32,
    slice_steps: u32,
    state: ActuatorState,
    total_steps: u64,
}

impl<P, D> Stepper<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(coils: [P; 4], delay: D, step_period_ms: u32, slice_steps: u32) -> Self {
        Self {
            coils,
            delay,
            step_period_ms,
            slice_steps: slice_steps.max(1),
            state: ActuatorState::default(),
            total_steps: 0,
        }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state.motion() == MotionState::Idle
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn start(&mut self, motion: Motion) -> bool {
        if !self.is_idle() {
            return false;
        }
        if motion.steps == 0 {
            debug!("ignoring zero-step {} rotation", motion.direction.as_str());
            return true;
        }

        info!(
            "stepper: rotating {} for {} steps",
            motion.direction.as_str(),
            motion.steps
        );
        self.state.direction = motion.direction;
        self.state.remaining = motion.steps;
        self.state.enabled = true;
        true
    }

    pub fn advance(&mut self, max_steps: u32) -> Result<u32, StepperError> {
        let mut taken = 0;
        while self.state.enabled && taken < max_steps {
            self.step_once()?;
            taken += 1;
        }
        Ok(taken)
    }

    pub fn rotate<F>(&mut self, motion: Motion, mut between_slices: F) -> Result<(), StepperError>
    where
        F: FnMut(&ActuatorState),
    {
        if !self.start(motion) {
            return Ok(());
        }
        while self.state.enabled {
            self.advance(self.slice_steps)?;
            between_slices(&self.state);
        }
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), StepperError> {
        self.write_lines([false; 4])
    }

    fn step_once(&mut self) -> Result<(), StepperError> {
        let phase = next_phase(self.state.phase, self.state.direction);
        if let Err(err) = self.write_lines(phase_lines(phase)) {
            self.abort(&err);
            return Err(err);
        }
        self.state.phase = phase;
        self.state.remaining -= 1;
        self.total_steps = self.total_steps.saturating_add(1);
        self.delay.delay_ms(self.step_period_ms);

        if self.state.remaining == 0 {
            self.state.enabled = false;
            self.release()?;
            info!("stepper: rotation complete, phase {}", self.state.phase);
        }
        Ok(())
    }

    // Phase and remaining keep their last good values.
    fn abort(&mut self, cause: &StepperError) {
        self.state.enabled = false;
        warn!(
            "stepper: {cause}; rotation aborted with {} steps remaining",
            self.state.remaining
        );
        if let Err(err) = self.release() {
            warn!("stepper: release after fault failed: {err}");
        }
    }

    fn write_lines(&mut self, lines: [bool; 4]) -> Result<(), StepperError> {
        for (index, (coil, high)) in self.coils.iter_mut().zip(lines).enumerate() {
            let result = if high { coil.set_high() } else { coil.set_low() };
            result.map_err(|err| StepperError::Coil {
                line: index + 1,
                kind: err.kind(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use embedded_hal::{
        delay::DelayNs,
        digital::{ErrorKind, ErrorType, OutputPin},
    };

    // One frame per full write of IN1..IN4.
    pub type CoilLog = Rc<RefCell<Vec<[bool; 4]>>>;

    pub struct FakeCoil {
        index: usize,
        level: Rc<RefCell<[bool; 4]>>,
        log: CoilLog,
        fault: Rc<Cell<bool>>,
    }

    impl ErrorType for FakeCoil {
        type Error = ErrorKind;
    }

    // While `fault` is set, energising a line fails; releasing still works.
    impl OutputPin for FakeCoil {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.write(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            if self.fault.get() {
                return Err(ErrorKind::Other);
            }
            self.write(true);
            Ok(())
        }
    }

    impl FakeCoil {
        fn write(&mut self, high: bool) {
            let mut level = self.level.borrow_mut();
            level[self.index] = high;
            // A full frame is complete once IN4 has been written.
            if self.index == 3 {
                self.log.borrow_mut().push(*level);
            }
        }
    }

    pub fn coils() -> ([FakeCoil; 4], CoilLog) {
        let (coils, log, _) = faulty_coils();
        (coils, log)
    }

    pub fn faulty_coils() -> ([FakeCoil; 4], CoilLog, Rc<Cell<bool>>) {
        let level = Rc::new(RefCell::new([false; 4]));
        let log = CoilLog::default();
        let fault = Rc::new(Cell::new(false));
        let coils = [0, 1, 2, 3].map(|index| FakeCoil {
            index,
            level: level.clone(),
            log: log.clone(),
            fault: fault.clone(),
        });
        (coils, log, fault)
    }

    #[derive(Default)]
    pub struct NoDelay {
        pub total_ns: u64,
    }

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += ns as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal::digital::ErrorKind;

    use super::{testing::*, *};

    fn stepper() -> (Stepper<FakeCoil, NoDelay>, CoilLog) {
        let (coils, log) = coils();
        (Stepper::new(coils, NoDelay::default(), 2, 64), log)
    }

    #[test]
    fn phase_advances_by_step_count_modulo_four() {
        for direction in [Direction::Forward, Direction::Backward] {
            for steps in [0_u32, 1, 2, 3, 4, 5, 7, 64, 65, 1_001, 10_240] {
                let (mut stepper, _) = stepper();
                stepper.rotate(Motion { direction, steps }, |_| {}).unwrap();

                let expected = match direction {
                    Direction::Forward => (steps % 4) as u8,
                    Direction::Backward => ((4 - steps % 4) % 4) as u8,
                };
                assert_eq!(stepper.state().phase, expected, "{direction:?} x {steps}");
                assert!(stepper.is_idle());
                assert_eq!(stepper.state().remaining, 0);
                assert_eq!(stepper.total_steps(), steps as u64);
            }
        }
    }

    #[test]
    fn one_coil_per_step_then_release() {
        let (mut stepper, log) = stepper();
        stepper
            .rotate(
                Motion {
                    direction: Direction::Forward,
                    steps: 5,
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                [false, true, false, false],
                [false, false, true, false],
                [false, false, false, true],
                [true, false, false, false],
                [false, true, false, false],
                [false, false, false, false],
            ]
        );
    }

    #[test]
    fn backward_walks_the_same_table_in_reverse() {
        let (mut stepper, log) = stepper();
        stepper
            .rotate(
                Motion {
                    direction: Direction::Backward,
                    steps: 3,
                },
                |_| {},
            )
            .unwrap();

        assert_eq!(
            log.borrow()[..3],
            [
                [false, false, false, true],
                [false, false, true, false],
                [false, true, false, false],
            ]
        );
    }

    #[test]
    fn rotate_yields_between_bounded_slices() {
        let (mut stepper, _) = stepper();
        let mut remaining_seen = Vec::new();
        stepper
            .rotate(
                Motion {
                    direction: Direction::Forward,
                    steps: 150,
                },
                |state| remaining_seen.push(state.remaining),
            )
            .unwrap();

        assert_eq!(remaining_seen, vec![86, 22, 0]);
    }

    #[test]
    fn remaining_decreases_monotonically_while_enabled() {
        let (mut stepper, _) = stepper();
        assert!(stepper.start(Motion {
            direction: Direction::Backward,
            steps: 10,
        }));

        let mut last = stepper.state().remaining;
        while !stepper.is_idle() {
            assert_eq!(stepper.advance(3).unwrap(), 3.min(last));
            let now = stepper.state().remaining;
            assert!(now < last);
            assert!(stepper.state().phase < PHASE_COUNT);
            last = now;
        }
        assert_eq!(stepper.state().motion(), MotionState::Idle);
    }

    #[test]
    fn busy_stepper_refuses_a_second_rotation() {
        let (mut stepper, _) = stepper();
        let motion = Motion {
            direction: Direction::Forward,
            steps: 100,
        };
        assert!(stepper.start(motion));
        stepper.advance(10).unwrap();
        assert!(!stepper.start(Motion {
            direction: Direction::Backward,
            steps: 5,
        }));
        assert_eq!(stepper.state().remaining, 90);
        assert_eq!(stepper.state().direction, Direction::Forward);
    }

    #[test]
    fn step_period_is_respected() {
        let (coils, _) = coils();
        let mut stepper = Stepper::new(coils, NoDelay::default(), 2, 8);
        stepper
            .rotate(
                Motion {
                    direction: Direction::Forward,
                    steps: 10,
                },
                |_| {},
            )
            .unwrap();
        assert_eq!(stepper.delay.total_ns, 10 * 2_000_000);
    }

    #[test]
    fn coil_fault_aborts_rotation_and_releases_lines() {
        let (coils, log, fault) = faulty_coils();
        let mut stepper = Stepper::new(coils, NoDelay::default(), 2, 64);
        assert!(stepper.start(Motion {
            direction: Direction::Forward,
            steps: 10,
        }));
        assert_eq!(stepper.advance(3).unwrap(), 3);

        fault.set(true);
        let err = stepper.advance(3).unwrap_err();

        assert_eq!(
            err,
            StepperError::Coil {
                line: 1,
                kind: ErrorKind::Other,
            }
        );
        assert_eq!(stepper.state().phase, 3);
        assert_eq!(stepper.state().remaining, 7);
        assert_eq!(stepper.total_steps(), 3);
        assert!(stepper.is_idle());
        assert_eq!(log.borrow().last(), Some(&[false; 4]));
    }
}
