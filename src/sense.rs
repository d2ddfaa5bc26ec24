//! Phase current and bus voltage from raw ADC samples.
//!
//! Sampling is owned by the caller (typically the ADC end-of-conversion interrupt), which hands
//! each conversion to [`CurrentSense::capture`]. Reads are pure functions of the latest sample
//! and the calibration; they never start a conversion.

use crate::fault::FaultStatus;
use crate::pwm::Phase;
use crate::{HalError, ShuntAmplifierGain};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Amps(pub f32);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Volts(pub f32);

/// `physical = (raw - offset) * gain`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelCalibration {
    /// Raw counts at zero.
    pub offset: f32,
    /// Physical units per count.
    pub gain: f32,
}

impl ChannelCalibration {
    pub const fn new(offset: f32, gain: f32) -> Self {
        Self { offset, gain }
    }

    pub fn apply(&self, raw: u16) -> f32 {
        (raw as f32 - self.offset) * self.gain
    }
}

/// Analog front end of the board around the DRV8301 shunt amplifiers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BoardSense {
    pub shunt_ohms: f32,
    pub adc_reference_volts: f32,
    pub adc_bits: u8,
    /// Bus volts per volt at the ADC pin.
    pub bus_divider_ratio: f32,
    /// The DRV8301 has two shunt amplifiers. Boards without a third one derive phase C.
    pub phase_c_measured: bool,
}

impl Default for BoardSense {
    fn default() -> Self {
        Self {
            shunt_ohms: 0.01,
            adc_reference_volts: 3.3,
            adc_bits: 12,
            bus_divider_ratio: (95.3 + 4.99) / 4.99,
            phase_c_measured: false,
        }
    }
}

/// Per-channel offset and gain, fixed once the power stage is armed.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseCalibration {
    pub phase_a: ChannelCalibration,
    pub phase_b: ChannelCalibration,
    /// `None`: phase C is computed as `-(ia + ib)`.
    pub phase_c: Option<ChannelCalibration>,
    pub bus_voltage: ChannelCalibration,
}

impl SenseCalibration {
    /// Nominal calibration from the board's component values.
    ///
    /// The amplifier output sits at mid-scale for zero current and falls as current rises,
    /// so the current gain is negative.
    pub fn from_board(board: &BoardSense, gain: ShuntAmplifierGain) -> Self {
        let full_scale = ((1u32 << board.adc_bits.min(16)) - 1) as f32;
        let volts_per_count = board.adc_reference_volts / full_scale;
        let amps_per_count = -volts_per_count / (amplifier_gain(gain) * board.shunt_ohms);
        let phase = ChannelCalibration::new(full_scale / 2.0, amps_per_count);

        Self {
            phase_a: phase,
            phase_b: phase,
            phase_c: board.phase_c_measured.then_some(phase),
            bus_voltage: ChannelCalibration::new(0.0, volts_per_count * board.bus_divider_ratio),
        }
    }

    /// Replaces the phase offsets, e.g. with the result of an [`OffsetCalibrator`] pass.
    pub fn with_offsets(mut self, offsets: [f32; 3]) -> Self {
        self.phase_a.offset = offsets[0];
        self.phase_b.offset = offsets[1];
        if let Some(phase_c) = self.phase_c.as_mut() {
            phase_c.offset = offsets[2];
        }
        self
    }
}

impl Default for SenseCalibration {
    fn default() -> Self {
        Self::from_board(&BoardSense::default(), ShuntAmplifierGain::Gain10)
    }
}

pub fn amplifier_gain(gain: ShuntAmplifierGain) -> f32 {
    match gain {
        ShuntAmplifierGain::Gain10 => 10.0,
        ShuntAmplifierGain::Gain20 => 20.0,
        ShuntAmplifierGain::Gain40 => 40.0,
        ShuntAmplifierGain::Gain80 => 80.0,
    }
}

/// One conversion of every sense channel, in raw counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawSample {
    /// Indexed by [`Phase::index`]. The phase C entry is ignored when phase C is derived.
    pub phase: [u16; 3],
    pub bus_voltage: u16,
}

pub struct CurrentSense {
    calibration: SenseCalibration,
    latest: Option<RawSample>,
    captured: u32,
}

impl CurrentSense {
    pub const fn new(calibration: SenseCalibration) -> Self {
        Self {
            calibration,
            latest: None,
            captured: 0,
        }
    }

    pub fn capture(&mut self, sample: RawSample) {
        self.latest = Some(sample);
        self.captured = self.captured.wrapping_add(1);
    }

    pub fn latest(&self) -> Option<RawSample> {
        self.latest
    }

    pub fn samples_captured(&self) -> u32 {
        self.captured
    }

    pub fn calibration(&self) -> &SenseCalibration {
        &self.calibration
    }

    pub(crate) fn set_calibration(&mut self, calibration: SenseCalibration) {
        self.calibration = calibration;
    }

    /// Fails with [`HalError::StaleSample`] until the first capture.
    pub fn read_phase_current(&self, phase: Phase) -> Result<Amps, HalError> {
        let sample = self.latest.ok_or(HalError::StaleSample)?;
        Ok(Amps(self.current(&sample, phase)))
    }

    /// All three phases from the same sample.
    pub fn read_phase_currents(&self) -> Result<[Amps; 3], HalError> {
        let sample = self.latest.ok_or(HalError::StaleSample)?;
        Ok(Phase::ALL.map(|phase| Amps(self.current(&sample, phase))))
    }

    pub fn read_bus_voltage(&self) -> Result<Volts, HalError> {
        let sample = self.latest.ok_or(HalError::StaleSample)?;
        Ok(Volts(self.calibration.bus_voltage.apply(sample.bus_voltage)))
    }

    /// Shunt overcurrent flags for every phase whose magnitude exceeds `limit`.
    pub fn overcurrent(&self, limit: Amps) -> FaultStatus {
        let Ok(currents) = self.read_phase_currents() else {
            return FaultStatus::EMPTY;
        };
        Phase::ALL
            .into_iter()
            .zip(currents)
            .filter(|(_, Amps(current))| *current > limit.0 || *current < -limit.0)
            .fold(FaultStatus::EMPTY, |status, (phase, _)| {
                status.with(FaultStatus::shunt_flag(phase), true)
            })
    }

    fn current(&self, sample: &RawSample, phase: Phase) -> f32 {
        let cal = &self.calibration;
        match (phase, cal.phase_c) {
            (Phase::A, _) => cal.phase_a.apply(sample.phase[0]),
            (Phase::B, _) => cal.phase_b.apply(sample.phase[1]),
            (Phase::C, Some(phase_c)) => phase_c.apply(sample.phase[2]),
            (Phase::C, None) => {
                -(cal.phase_a.apply(sample.phase[0]) + cal.phase_b.apply(sample.phase[1]))
            }
        }
    }
}

/// Averages zero-current samples into phase offsets.
///
/// Feed it conversions taken with the DRV8301 `DC_CAL` switches closed (amplifier inputs
/// shorted) and the outputs disabled.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OffsetCalibrator {
    sums: [u32; 3],
    count: u32,
    target: u32,
}

impl OffsetCalibrator {
    pub const fn new(target_samples: u32) -> Self {
        Self {
            sums: [0; 3],
            count: 0,
            target: if target_samples == 0 { 1 } else { target_samples },
        }
    }

    /// Returns `true` once enough samples are in. Later samples are ignored.
    pub fn accumulate(&mut self, sample: &RawSample) -> bool {
        if self.count < self.target {
            for (sum, raw) in self.sums.iter_mut().zip(sample.phase) {
                *sum = sum.saturating_add(raw as u32);
            }
            self.count += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.target
    }

    pub fn samples(&self) -> u32 {
        self.count
    }

    /// Averaged raw counts per phase, once complete.
    pub fn offsets(&self) -> Option<[f32; 3]> {
        self.is_complete()
            .then(|| self.sums.map(|sum| sum as f32 / self.count as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        let diff = a - b;
        diff < 1e-3 && diff > -1e-3
    }

    fn sample(a: u16, b: u16, c: u16, bus: u16) -> RawSample {
        RawSample {
            phase: [a, b, c],
            bus_voltage: bus,
        }
    }

    #[test]
    fn stale_until_first_capture() {
        let mut sense = CurrentSense::new(SenseCalibration::default());
        assert_eq!(sense.read_phase_current(Phase::A), Err(HalError::StaleSample));
        assert_eq!(sense.read_bus_voltage(), Err(HalError::StaleSample));
        assert!(sense.overcurrent(Amps(1.0)).is_empty());

        sense.capture(sample(2048, 2048, 0, 0));
        assert!(sense.read_phase_current(Phase::A).is_ok());
        assert_eq!(sense.samples_captured(), 1);
    }

    #[test]
    fn applies_offset_and_gain() {
        let calibration = SenseCalibration {
            phase_a: ChannelCalibration::new(2000.0, 0.01),
            phase_b: ChannelCalibration::new(2100.0, -0.02),
            phase_c: Some(ChannelCalibration::new(1900.0, 0.005)),
            bus_voltage: ChannelCalibration::new(0.0, 0.02),
        };
        let mut sense = CurrentSense::new(calibration);
        sense.capture(sample(2100, 2000, 2100, 1200));

        let [a, b, c] = sense.read_phase_currents().unwrap();
        assert!(close(a.0, 1.0));
        assert!(close(b.0, 2.0));
        assert!(close(c.0, 1.0));
        assert!(close(sense.read_bus_voltage().unwrap().0, 24.0));
    }

    #[test]
    fn derives_phase_c() {
        let calibration = SenseCalibration {
            phase_c: None,
            ..SenseCalibration::default()
        };
        let mut sense = CurrentSense::new(calibration);
        let ia_raw = 2000;
        let ib_raw = 2200;
        sense.capture(sample(ia_raw, ib_raw, 0, 0));

        let ia = sense.read_phase_current(Phase::A).unwrap().0;
        let ib = sense.read_phase_current(Phase::B).unwrap().0;
        let ic = sense.read_phase_current(Phase::C).unwrap().0;
        assert!(close(ia + ib + ic, 0.0));
    }

    #[test]
    fn nominal_board_calibration() {
        let board = BoardSense::default();
        let calibration = SenseCalibration::from_board(&board, ShuntAmplifierGain::Gain20);
        assert!(calibration.phase_c.is_none());
        assert!(close(calibration.phase_a.offset, 2047.5));

        // 0.1 V below mid-scale at the amplifier output is +0.5 A through 10 mOhm at 20 V/V
        let counts_per_volt = 4095.0 / 3.3;
        let raw = (2047.5 - 0.1 * counts_per_volt) as u16;
        let amps = calibration.phase_a.apply(raw);
        assert!(amps > 0.49 && amps < 0.51);

        let bus = calibration.bus_voltage.apply(4095);
        assert!(bus > 66.2 && bus < 66.5);
    }

    #[test]
    fn overcurrent_flags_per_phase() {
        let calibration = SenseCalibration {
            phase_a: ChannelCalibration::new(0.0, 0.1),
            phase_b: ChannelCalibration::new(0.0, -0.1),
            phase_c: Some(ChannelCalibration::new(0.0, 0.1)),
            bus_voltage: ChannelCalibration::new(0.0, 1.0),
        };
        let mut sense = CurrentSense::new(calibration);
        sense.capture(sample(50, 300, 100, 0));

        let status = sense.overcurrent(Amps(20.0));
        assert!(!status.phase_a_overcurrent());
        assert!(status.phase_b_overcurrent());
        assert!(!status.phase_c_overcurrent());
        assert!(!status.has_desaturation());
    }

    #[test]
    fn offset_calibration_pass() {
        let mut calibrator = OffsetCalibrator::new(4);
        assert_eq!(calibrator.offsets(), None);
        for raw in [2040, 2042, 2044, 2046] {
            calibrator.accumulate(&sample(raw, raw + 10, raw + 20, 0));
        }
        assert!(calibrator.is_complete());
        // extra samples are ignored
        assert!(calibrator.accumulate(&sample(0, 0, 0, 0)));
        assert_eq!(calibrator.samples(), 4);
        assert_eq!(calibrator.offsets(), Some([2043.0, 2053.0, 2063.0]));

        let calibration = SenseCalibration::default().with_offsets([2043.0, 2053.0, 2063.0]);
        assert_eq!(calibration.phase_a.offset, 2043.0);
        assert_eq!(calibration.phase_b.offset, 2053.0);
        assert!(calibration.phase_c.is_none());
    }
}
