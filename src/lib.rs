#![cfg_attr(not(any(test, feature = "std")), no_std)]
//! # DRV8301 Power-Stage HAL
//!
//! This crate is a hardware abstraction layer for three-phase BLDC drive boards built around
//! the DRV8301 gate driver. It owns everything between the motor-control algorithm and the
//! silicon:
//!
//! *   **Register interface:** typed and raw access to the DRV8301 SPI registers, declared
//!     with the `device-driver` DSL, with bounded retry over any [`ControlBus`] implementation.
//! *   **Fault management:** a `Normal` / `FaultLatched` / `Recovering` state machine that
//!     forces the PWM outputs into the safe state in the same call that latches the fault.
//! *   **PWM abstraction:** three complementary channel pairs with dead-time and duty bounds.
//! *   **Sense abstraction:** calibrated phase currents and bus voltage from raw ADC samples.
//!
//! Blocking and async flavours share one implementation through [`bisync`](https://docs.rs/bisync):
//! [`PowerStage`] / [`Drv8301`] work with `embedded-hal`, [`PowerStageAsync`] /
//! [`Drv8301Async`] with `embedded-hal-async`.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use drv8301_hal::{
//!     FaultLine, HalConfig, HalError, Phase, PowerStage, PwmOutputs, SafeState,
//!     SenseCalibration, SpiControlBus,
//! };
//! use embedded_hal::spi::SpiDevice;
//!
//! static FAULT_LINE: FaultLine = FaultLine::new();
//!
//! fn bring_up<S: SpiDevice, P: PwmOutputs>(spi: S, timer: P) -> Result<(), HalError> {
//!     let bus = SpiControlBus::new(spi);
//!     let (config, calibration) = (HalConfig::default(), SenseCalibration::default());
//!     let mut stage = PowerStage::init(bus, timer, &FAULT_LINE, config, calibration)?;
//!
//!     stage.enable_outputs()?;
//!     stage.set_duty(Phase::A, 0.25)?;
//!
//!     // From the control loop:
//!     let _state = stage.poll_faults(1)?;
//!     Ok(())
//! }
//!
//! // From the nFAULT interrupt, with the handler's own gate-enable pin:
//! fn on_nfault(now: u32, gate_enable: &mut impl SafeState) {
//!     FAULT_LINE.on_fault_interrupt(now, gate_enable);
//! }
//! ```
//!
//! The interrupt side never touches the bus and never blocks: it forces its own safe-state
//! sink and sets an atomic. The stage latches on its next call.
//!
//! ## Warning!
//!
//! ***Caution!*** This chip controls power FETs that can handle high voltages and currents.
//! Incorrect configuration can potentially damage FETs, motors, or other components.
//! Proceed with care and always consult the DRV8301 datasheet.

#[macro_use]
pub(crate) mod fmt;

pub mod config;
pub mod fault;
pub mod pwm;
pub mod registers;
pub mod sense;
pub mod sim;

pub use config::{GateDriveConfig, HalConfig, PwmInputMode};
pub use fault::{
    FaultLine, FaultLog, FaultMonitor, FaultRecord, FaultState, FaultStatus, SafeState, Transition,
};
pub use pwm::{DutyPolicy, Phase, PwmChannelConfig, PwmConfig, PwmOutputs, PwmStage};
pub use registers::{RegisterAddress, RegisterSet, RegisterValue};
pub use sense::{
    Amps, BoardSense, ChannelCalibration, CurrentSense, OffsetCalibrator, RawSample,
    SenseCalibration, Volts,
};
pub use sim::SimulatedBus;

use thiserror::Error;

device_driver::create_device!(
    device_name: DrvLowLevel,
    dsl: {
        config {
            type RegisterAddressType = u8;
            type DefaultByteOrder = BE;
        }

        /// Status Register 1 (0x00): fault flags, latched until read or `GATE_RESET`
        register StatusRegister1 {
            type Access = RO;
            const ADDRESS = 0x00;
            const SIZE_BITS = 16;

            /// Phase C low-side FET VDS overcurrent
            fetlc_oc: bool = 0,
            /// Phase C high-side FET VDS overcurrent
            fethc_oc: bool = 1,
            /// Phase B low-side FET VDS overcurrent
            fetlb_oc: bool = 2,
            /// Phase B high-side FET VDS overcurrent
            fethb_oc: bool = 3,
            /// Phase A low-side FET VDS overcurrent
            fetla_oc: bool = 4,
            /// Phase A high-side FET VDS overcurrent
            fetha_oc: bool = 5,
            /// Over-temperature warning
            otw: bool = 6,
            /// Over-temperature shutdown
            otsd: bool = 7,
            /// PVDD undervoltage
            pvdd_uv: bool = 8,
            /// GVDD undervoltage
            gvdd_uv: bool = 9,
            /// Summary fault flag (mirrors nFAULT)
            fault: bool = 10,
        },

        /// Status Register 2 (0x01)
        register StatusRegister2 {
            type Access = RO;
            const ADDRESS = 0x01;
            const SIZE_BITS = 16;

            /// Device ID
            device_id: uint = 0..4,
            /// GVDD overvoltage
            gvdd_ov: bool = 7,
        },

        /// Control Register 1 (0x02): gate drive and overcurrent protection
        register ControlRegister1 {
            const ADDRESS = 0x02;
            const SIZE_BITS = 16;

            /// Peak gate drive current
            gate_current: uint as enum GateCurrent {
                Peak1A7 = 0,
                Peak0A7 = 1,
                Peak0A25 = 2,
                Reserved = 3,
            } = 0..2,
            /// Reset latched gate driver faults (self-clearing)
            gate_reset: bool = 2,
            /// `true` selects 3-PWM input mode, `false` 6-PWM
            pwm_mode: bool = 3,
            /// Overcurrent protection mode
            ocp_mode: uint as enum OcpMode {
                CurrentLimit = 0,
                OcLatchShutdown = 1,
                ReportOnly = 2,
                Disabled = 3,
            } = 4..6,
            /// VDS overcurrent trip threshold
            oc_adj_set: uint as enum OcAdjSet {
                Vds60mV = 0,
                Vds68mV = 1,
                Vds76mV = 2,
                Vds86mV = 3,
                Vds97mV = 4,
                Vds109mV = 5,
                Vds123mV = 6,
                Vds138mV = 7,
                Vds155mV = 8,
                Vds175mV = 9,
                Vds197mV = 10,
                Vds222mV = 11,
                Vds250mV = 12,
                Vds282mV = 13,
                Vds317mV = 14,
                Vds358mV = 15,
                Vds403mV = 16,
                Vds454mV = 17,
                Vds511mV = 18,
                Vds576mV = 19,
                Vds648mV = 20,
                Vds730mV = 21,
                Vds822mV = 22,
                Vds926mV = 23,
                Vds1043mV = 24,
                Vds1175mV = 25,
                Vds1324mV = 26,
                Vds1491mV = 27,
                Vds1679mV = 28,
                Vds1892mV = 29,
                Vds2131mV = 30,
                Vds2400mV = 31,
            } = 6..11,
        },

        /// Control Register 2 (0x03): reporting and shunt amplifiers
        register ControlRegister2 {
            const ADDRESS = 0x03;
            const SIZE_BITS = 16;

            /// nOCTW pin reporting mode
            octw_mode: uint as enum OctwMode {
                OtAndOc = 0,
                OtOnly = 1,
                OcOnly = 2,
                OcOnlyReserved = 3,
            } = 0..2,
            /// Current shunt amplifier gain
            gain: uint as enum ShuntAmplifierGain {
                Gain10 = 0,
                Gain20 = 1,
                Gain40 = 2,
                Gain80 = 3,
            } = 2..4,
            /// Short shunt amplifier 1 inputs for offset calibration
            dc_cal_ch1: bool = 4,
            /// Short shunt amplifier 2 inputs for offset calibration
            dc_cal_ch2: bool = 5,
            /// `true` selects off-time control, `false` cycle-by-cycle
            oc_toff: bool = 6,
        }
    }
);

/// Failure reported by a [`ControlBus`] transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    #[error("bus transaction timed out")]
    Timeout,
    #[error("SPI error: {0:?}")]
    Spi(embedded_hal::spi::ErrorKind),
    #[error("SPI frame error detected in response")]
    FrameError,
    #[error("malformed response frame")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalError {
    #[error("invalid register address, reserved bits or reserved encoding")]
    InvalidRegister,
    #[error("control bus error: {0}")]
    Bus(BusError),
    #[error("no sample captured since initialization")]
    StaleSample,
    #[error("operation refused while a fault is latched")]
    FaultLatched,
    #[error("value out of range")]
    OutOfRange,
    #[error("offset calibration: {0}")]
    CalibrationState(&'static str),
}

impl From<BusError> for HalError {
    fn from(err: BusError) -> Self {
        HalError::Bus(err)
    }
}

/// Transfer direction of a single control bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
}

/// Number of attempts a register transaction gets before the error is surfaced.
pub const DEFAULT_BUS_ATTEMPTS: u8 = 3;

/// `device-driver` register interface over a [`ControlBus`], retrying failed transactions
/// up to a bounded number of attempts.
pub struct DrvInterface<Bus> {
    bus: Bus,
    attempts: u8,
    retries: u32,
}

impl<Bus> DrvInterface<Bus> {
    pub fn new(bus: Bus) -> Self {
        Self::with_attempts(bus, DEFAULT_BUS_ATTEMPTS)
    }

    /// `attempts` is clamped to at least one.
    pub fn with_attempts(bus: Bus, attempts: u8) -> Self {
        Self {
            bus,
            attempts: attempts.max(1),
            retries: 0,
        }
    }

    /// Total number of retried transactions since construction.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn release(self) -> Bus {
        self.bus
    }
}

#[path = "."]
mod asynchronous {
    use bisync::asynchronous::*;
    use device_driver::AsyncRegisterInterface as RegisterInterface;
    use embedded_hal_async::spi::SpiDevice;
    mod driver;
    mod stage;
    pub use driver::*;
    pub use stage::*;
}
pub use asynchronous::{
    ControlBus as AsyncControlBus, Drv8301 as Drv8301Async, PowerStage as PowerStageAsync,
};

#[path = "."]
mod blocking {
    use bisync::synchronous::*;
    use device_driver::RegisterInterface;
    use embedded_hal::spi::SpiDevice;
    #[allow(clippy::duplicate_mod)]
    mod driver;
    #[allow(clippy::duplicate_mod)]
    mod stage;
    pub use driver::*;
    pub use stage::*;
}
pub use blocking::{ControlBus, Drv8301, PowerStage};

/// Hardware-backed [`ControlBus`] over an SPI device (blocking or async).
pub struct SpiControlBus<Spi> {
    spi: Spi,
}

impl<Spi> SpiControlBus<Spi> {
    pub fn new(spi: Spi) -> Self {
        Self { spi }
    }

    pub fn release(self) -> Spi {
        self.spi
    }
}

const READ_BIT: u16 = 0x8000;
const FRAME_ERROR_BIT: u16 = 0x8000;
const ADDRESS_SHIFT: u16 = 11;
const ADDRESS_MASK: u16 = 0x0F;

/// Builds a 16-bit command word: bit 15 = R/W, bits 14:11 = address, bits 10:0 = data.
fn command_word(address: u8, direction: Direction, data: u16) -> u16 {
    let header = (address as u16 & ADDRESS_MASK) << ADDRESS_SHIFT;
    match direction {
        Direction::Read => READ_BIT | header,
        Direction::Write => header | (data & RegisterValue::MASK),
    }
}

/// Checks a response word against the addressed register and extracts its data bits.
fn parse_response(address: u8, response: u16) -> Result<u16, BusError> {
    if response & FRAME_ERROR_BIT != 0 {
        return Err(BusError::FrameError);
    }
    if (response >> ADDRESS_SHIFT) & ADDRESS_MASK != address as u16 & ADDRESS_MASK {
        return Err(BusError::Malformed);
    }
    Ok(response & RegisterValue::MASK)
}
