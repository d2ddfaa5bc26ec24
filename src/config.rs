//! Bring-up configuration for the power stage.

use crate::pwm::PwmConfig;
use crate::sense::Amps;
use crate::{DEFAULT_BUS_ATTEMPTS, GateCurrent, OcAdjSet, OcpMode, OctwMode, ShuntAmplifierGain};

/// How the MCU drives the DRV8301 inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PwmInputMode {
    /// Six independent inputs, dead-time from the MCU timer.
    SixPwm,
    /// Three inputs, complementary signals generated by the DRV8301.
    ThreePwm,
}

/// Contents of Control Register 1 and Control Register 2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDriveConfig {
    pub gate_current: GateCurrent,
    pub ocp_mode: OcpMode,
    pub oc_threshold: OcAdjSet,
    pub pwm_mode: PwmInputMode,
    pub amplifier_gain: ShuntAmplifierGain,
    pub octw_mode: OctwMode,
    /// `true` selects off-time control, `false` cycle-by-cycle.
    pub oc_off_time_control: bool,
}

impl Default for GateDriveConfig {
    fn default() -> Self {
        Self {
            gate_current: GateCurrent::Peak1A7,
            ocp_mode: OcpMode::OcLatchShutdown,
            oc_threshold: OcAdjSet::Vds250MV,
            pwm_mode: PwmInputMode::SixPwm,
            amplifier_gain: ShuntAmplifierGain::Gain10,
            octw_mode: OctwMode::OtAndOc,
            oc_off_time_control: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalConfig {
    pub gate: GateDriveConfig,
    pub pwm: PwmConfig,
    /// Attempts per register transaction before the error escalates.
    pub bus_attempts: u8,
    /// Fault-free ticks required in `Recovering` before returning to `Normal`.
    pub debounce_ticks: u32,
    /// Latch on the over-temperature warning as well as on faults.
    pub latch_on_warning: bool,
    /// Software shunt overcurrent limit checked on every captured sample.
    pub phase_current_limit: Option<Amps>,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            gate: GateDriveConfig::default(),
            pwm: PwmConfig::default(),
            bus_attempts: DEFAULT_BUS_ATTEMPTS,
            debounce_ticks: 100,
            latch_on_warning: false,
            phase_current_limit: None,
        }
    }
}
