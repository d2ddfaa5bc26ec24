//! Three complementary PWM channel pairs feeding the DRV8301 half-bridge inputs.
//!
//! Dead-time is never produced in software: [`PwmStage`] validates the requested value and
//! hands it to the timer's dead-time generator through [`PwmOutputs::set_dead_time`].

use crate::fault::SafeState;
use crate::HalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub const fn index(self) -> usize {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }
}

/// What `set_duty` does with a value outside `[0.0, max_duty]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DutyPolicy {
    Clamp,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmConfig {
    /// Dead-time applied to all three channel pairs.
    pub dead_time_ns: u32,
    /// Shortest dead-time the power stage tolerates.
    pub min_dead_time_ns: u32,
    /// Longest dead-time the timer can generate.
    pub max_dead_time_ns: u32,
    pub duty_policy: DutyPolicy,
    /// Duty ceiling, at most 1.0. Bootstrapped high-side drivers need some off time.
    pub max_duty: f32,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            dead_time_ns: 500,
            min_dead_time_ns: 100,
            max_dead_time_ns: 5_000,
            duty_policy: DutyPolicy::Clamp,
            max_duty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmChannelConfig {
    pub duty: f32,
    pub enabled: bool,
}

/// Raw timer access for the three complementary channel pairs.
///
/// `disable_all` is called from interrupt context and must not block.
pub trait PwmOutputs {
    /// Compare value for 100 % duty.
    fn max_compare(&self) -> u16;

    fn set_compare(&mut self, phase: Phase, compare: u16);

    /// Enables or disables both outputs of the pair.
    fn set_enabled(&mut self, phase: Phase, enabled: bool);

    /// Programs the hardware dead-time generator.
    fn set_dead_time(&mut self, dead_time_ns: u32);

    /// Forces all six gate inputs off.
    fn disable_all(&mut self);
}

/// Duty and enable bookkeeping on top of [`PwmOutputs`].
///
/// The stage starts with its fault-disable latch set. While latched, no duty or enable
/// request reaches the hardware.
pub struct PwmStage<P> {
    outputs: P,
    config: PwmConfig,
    channels: [PwmChannelConfig; 3],
    latched: bool,
}

impl<P: PwmOutputs> PwmStage<P> {
    /// Validates `config`, programs the dead-time and leaves every output disabled.
    pub fn new(outputs: P, config: PwmConfig) -> Result<Self, HalError> {
        if config.min_dead_time_ns > config.max_dead_time_ns
            || config.max_duty.is_nan()
            || config.max_duty <= 0.0
            || config.max_duty > 1.0
        {
            return Err(HalError::OutOfRange);
        }
        let mut stage = Self {
            outputs,
            config,
            channels: [PwmChannelConfig::default(); 3],
            latched: true,
        };
        stage.disable_all();
        stage.set_dead_time(config.dead_time_ns)?;
        Ok(stage)
    }

    /// Commands `value` on `phase` and returns the duty actually applied.
    ///
    /// NaN is always rejected. Other out-of-range values are clamped or rejected according
    /// to [`PwmConfig::duty_policy`].
    pub fn set_duty(&mut self, phase: Phase, value: f32) -> Result<f32, HalError> {
        if self.latched {
            return Err(HalError::FaultLatched);
        }
        let duty = self.bounded(value)?;
        let max = self.outputs.max_compare();
        let compare = ((duty * max as f32) + 0.5) as u16;
        self.outputs.set_compare(phase, compare.min(max));
        self.channels[phase.index()].duty = duty;
        trace!("phase {:?} duty {} compare {}", phase, duty, compare);
        Ok(duty)
    }

    fn bounded(&self, value: f32) -> Result<f32, HalError> {
        if value.is_nan() {
            return Err(HalError::OutOfRange);
        }
        let max = self.config.max_duty;
        if (0.0..=max).contains(&value) {
            return Ok(value);
        }
        match self.config.duty_policy {
            DutyPolicy::Clamp => Ok(value.clamp(0.0, max)),
            DutyPolicy::Reject => Err(HalError::OutOfRange),
        }
    }

    /// Fails with [`HalError::OutOfRange`] outside the configured dead-time bounds.
    pub fn set_dead_time(&mut self, dead_time_ns: u32) -> Result<(), HalError> {
        if dead_time_ns < self.config.min_dead_time_ns
            || dead_time_ns > self.config.max_dead_time_ns
        {
            return Err(HalError::OutOfRange);
        }
        self.outputs.set_dead_time(dead_time_ns);
        self.config.dead_time_ns = dead_time_ns;
        debug!("dead time set to {} ns", dead_time_ns);
        Ok(())
    }

    pub fn enable(&mut self, phase: Phase) -> Result<(), HalError> {
        if self.latched {
            return Err(HalError::FaultLatched);
        }
        self.outputs.set_enabled(phase, true);
        self.channels[phase.index()].enabled = true;
        Ok(())
    }

    pub fn enable_all(&mut self) -> Result<(), HalError> {
        Phase::ALL.into_iter().try_for_each(|phase| self.enable(phase))
    }

    /// The single safe-state entry point: zero duty, outputs off, latch set.
    pub fn disable_all(&mut self) {
        self.latched = true;
        self.outputs.disable_all();
        for phase in Phase::ALL {
            self.outputs.set_compare(phase, 0);
            self.outputs.set_enabled(phase, false);
        }
        self.channels = [PwmChannelConfig::default(); 3];
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Releases the latch. Outputs stay disabled until enabled again.
    pub(crate) fn rearm(&mut self) {
        self.latched = false;
    }

    pub fn channel(&self, phase: Phase) -> PwmChannelConfig {
        self.channels[phase.index()]
    }

    pub fn any_enabled(&self) -> bool {
        self.channels.iter().any(|channel| channel.enabled)
    }

    pub fn config(&self) -> &PwmConfig {
        &self.config
    }

    pub fn outputs(&self) -> &P {
        &self.outputs
    }

    /// Disables everything and hands the timer back.
    pub fn release(mut self) -> P {
        self.disable_all();
        self.outputs
    }
}

impl<P: PwmOutputs> SafeState for PwmStage<P> {
    fn force_safe(&mut self) {
        self.disable_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Timer {
        compare: [u16; 3],
        enabled: [bool; 3],
        dead_time_ns: u32,
        writes: u32,
        disables: u32,
    }

    impl PwmOutputs for Timer {
        fn max_compare(&self) -> u16 {
            1000
        }

        fn set_compare(&mut self, phase: Phase, compare: u16) {
            self.compare[phase.index()] = compare;
            self.writes += 1;
        }

        fn set_enabled(&mut self, phase: Phase, enabled: bool) {
            self.enabled[phase.index()] = enabled;
        }

        fn set_dead_time(&mut self, dead_time_ns: u32) {
            self.dead_time_ns = dead_time_ns;
        }

        fn disable_all(&mut self) {
            self.disables += 1;
        }
    }

    fn armed(config: PwmConfig) -> PwmStage<Timer> {
        let mut stage = PwmStage::new(Timer::default(), config).unwrap();
        stage.rearm();
        stage
    }

    #[test]
    fn starts_latched_and_disabled() {
        let mut stage = PwmStage::new(Timer::default(), PwmConfig::default()).unwrap();
        assert!(stage.is_latched());
        assert_eq!(stage.outputs().disables, 1);
        assert_eq!(stage.outputs().dead_time_ns, 500);

        let writes = stage.outputs().writes;
        assert_eq!(stage.set_duty(Phase::A, 0.5), Err(HalError::FaultLatched));
        assert_eq!(stage.enable(Phase::A), Err(HalError::FaultLatched));
        assert_eq!(stage.outputs().writes, writes);
    }

    #[test]
    fn duty_maps_to_compare() {
        let mut stage = armed(PwmConfig::default());
        assert_eq!(stage.set_duty(Phase::B, 0.25), Ok(0.25));
        assert_eq!(stage.outputs().compare, [0, 250, 0]);
        assert_eq!(stage.set_duty(Phase::C, 1.0), Ok(1.0));
        assert_eq!(stage.outputs().compare[2], 1000);
        assert_eq!(stage.channel(Phase::B).duty, 0.25);
    }

    #[test]
    fn clamp_policy_is_deterministic() {
        let mut stage = armed(PwmConfig::default());
        assert_eq!(stage.set_duty(Phase::A, 1.7), Ok(1.0));
        assert_eq!(stage.set_duty(Phase::A, -0.3), Ok(0.0));
        assert_eq!(stage.set_duty(Phase::A, f32::INFINITY), Ok(1.0));
        assert_eq!(stage.set_duty(Phase::A, f32::NAN), Err(HalError::OutOfRange));
        assert_eq!(stage.outputs().compare[0], 1000);
    }

    #[test]
    fn reject_policy_leaves_previous_duty() {
        let mut stage = armed(PwmConfig {
            duty_policy: DutyPolicy::Reject,
            ..PwmConfig::default()
        });
        stage.set_duty(Phase::A, 0.4).unwrap();
        assert_eq!(stage.set_duty(Phase::A, 1.01), Err(HalError::OutOfRange));
        assert_eq!(stage.set_duty(Phase::A, -0.01), Err(HalError::OutOfRange));
        assert_eq!(stage.outputs().compare[0], 400);
        assert_eq!(stage.channel(Phase::A).duty, 0.4);
    }

    #[test]
    fn duty_ceiling() {
        let mut stage = armed(PwmConfig {
            max_duty: 0.9,
            ..PwmConfig::default()
        });
        assert_eq!(stage.set_duty(Phase::A, 0.95), Ok(0.9));
        assert_eq!(stage.outputs().compare[0], 900);
    }

    #[test]
    fn dead_time_bounds() {
        let mut stage = armed(PwmConfig::default());
        assert_eq!(stage.set_dead_time(99), Err(HalError::OutOfRange));
        assert_eq!(stage.set_dead_time(5_001), Err(HalError::OutOfRange));
        assert_eq!(stage.outputs().dead_time_ns, 500);
        assert_eq!(stage.set_dead_time(100), Ok(()));
        assert_eq!(stage.config().dead_time_ns, 100);

        let bad = PwmConfig {
            dead_time_ns: 20,
            ..PwmConfig::default()
        };
        assert!(matches!(PwmStage::new(Timer::default(), bad), Err(HalError::OutOfRange)));
    }

    #[test]
    fn disable_all_latches() {
        let mut stage = armed(PwmConfig::default());
        stage.enable_all().unwrap();
        stage.set_duty(Phase::A, 0.5).unwrap();
        assert!(stage.any_enabled());

        stage.force_safe();
        assert!(stage.is_latched());
        assert!(!stage.any_enabled());
        assert_eq!(stage.outputs().compare, [0; 3]);
        assert_eq!(stage.outputs().enabled, [false; 3]);
        assert_eq!(stage.set_duty(Phase::A, 0.5), Err(HalError::FaultLatched));

        // rearming does not re-enable anything
        stage.rearm();
        assert!(!stage.any_enabled());
        let timer = stage.release();
        assert_eq!(timer.disables, 3);
    }
}
