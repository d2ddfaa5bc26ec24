use super::{RegisterInterface, SpiDevice, bisync, only_async, only_sync};
use crate::config::{GateDriveConfig, PwmInputMode};
use crate::fault::FaultStatus;
use crate::registers::{RegisterAddress, RegisterSet, RegisterValue};
use crate::{
    BusError, DEFAULT_BUS_ATTEMPTS, Direction, DrvInterface, DrvLowLevel, HalError, SimulatedBus,
    SpiControlBus, command_word, parse_response,
};
use crate::{GateCurrent, OcAdjSet, OcpMode, OctwMode, ShuntAmplifierGain};
use device_driver::{FieldSet, ReadCapability, RegisterOperation, WriteCapability};
use embedded_hal::spi::Error as _;

/// One framed register transaction with the DRV8301.
///
/// Implemented by [`SpiControlBus`] for hardware and by [`SimulatedBus`] for tests. For
/// reads the returned word holds the 11 data bits of the addressed register.
#[only_sync]
pub trait ControlBus {
    fn transact(&mut self, address: u8, direction: Direction, data: u16) -> Result<u16, BusError>;
}

/// One framed register transaction with the DRV8301.
///
/// Implemented by [`SpiControlBus`] for hardware and by [`SimulatedBus`] for tests. For
/// reads the returned word holds the 11 data bits of the addressed register.
#[only_async]
#[allow(async_fn_in_trait)]
pub trait ControlBus {
    async fn transact(
        &mut self,
        address: u8,
        direction: Direction,
        data: u16,
    ) -> Result<u16, BusError>;
}

#[bisync]
impl<Spi> ControlBus for SpiControlBus<Spi>
where
    Spi: SpiDevice,
{
    async fn transact(
        &mut self,
        address: u8,
        direction: Direction,
        data: u16,
    ) -> Result<u16, BusError> {
        let cmd_bytes = command_word(address, direction, data).to_be_bytes();

        let mut response_bytes = [0u8; 2];
        self.spi
            .transfer(&mut response_bytes, &cmd_bytes)
            .await
            .map_err(|e| BusError::Spi(e.kind()))?;

        match direction {
            // the response to a write carries the previous frame, nothing to check
            Direction::Write => Ok(data & RegisterValue::MASK),
            Direction::Read => {
                // N+1 timing: the data arrives in the following frame
                self.spi
                    .transfer(&mut response_bytes, &cmd_bytes)
                    .await
                    .map_err(|e| BusError::Spi(e.kind()))?;
                parse_response(address, u16::from_be_bytes(response_bytes))
            }
        }
    }
}

#[bisync]
impl ControlBus for SimulatedBus {
    async fn transact(
        &mut self,
        address: u8,
        direction: Direction,
        data: u16,
    ) -> Result<u16, BusError> {
        self.exchange(address, direction, data)
    }
}

#[bisync]
async fn transact_with_retry<Bus: ControlBus>(
    iface: &mut DrvInterface<Bus>,
    address: u8,
    direction: Direction,
    data: u16,
) -> Result<u16, HalError> {
    let mut attempt = 1;
    loop {
        match iface.bus.transact(address, direction, data).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < iface.attempts => {
                debug!(
                    "register {:#x} {:?} failed on attempt {}: {:?}",
                    address, direction, attempt, err
                );
                iface.retries = iface.retries.saturating_add(1);
                attempt += 1;
            }
            Err(err) => {
                error!(
                    "register {:#x} {:?} failed after {} attempts: {:?}",
                    address, direction, attempt, err
                );
                return Err(HalError::Bus(err));
            }
        }
    }
}

#[bisync]
impl<Bus> RegisterInterface for DrvInterface<Bus>
where
    Bus: ControlBus,
{
    type AddressType = u8;
    type Error = HalError;

    async fn read_register(
        &mut self,
        address: u8,
        _size_bits: u32,
        data: &mut [u8],
    ) -> Result<(), Self::Error> {
        let value = transact_with_retry(self, address, Direction::Read, 0).await?;

        // big-endian, as declared in the register map
        let bytes = (value & RegisterValue::MASK).to_be_bytes();
        match data {
            [hi, lo, ..] => {
                *hi = bytes[0];
                *lo = bytes[1];
            }
            [lo] => *lo = bytes[1],
            [] => {}
        }
        Ok(())
    }

    async fn write_register(
        &mut self,
        address: u8,
        _size_bits: u32,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        let value = match data {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            [lo] => *lo as u16,
            [] => 0,
        };
        transact_with_retry(self, address, Direction::Write, value).await?;
        Ok(())
    }
}

/// DRV8301 register driver over any [`ControlBus`].
///
/// Raw accesses keep a shadow copy of each register in a [`RegisterSet`]; the typed
/// read-modify-write helpers drop the shadow entry they touch.
pub struct Drv8301<Bus> {
    pub ll: DrvLowLevel<DrvInterface<Bus>>,
    shadow: RegisterSet,
}

impl<Bus> Drv8301<Bus> {
    pub fn new(bus: Bus) -> Self {
        Self::with_attempts(bus, DEFAULT_BUS_ATTEMPTS)
    }

    /// `attempts` is the number of tries each register transaction gets, at least one.
    pub fn with_attempts(bus: Bus, attempts: u8) -> Self {
        Self {
            ll: DrvLowLevel::new(DrvInterface::with_attempts(bus, attempts)),
            shadow: RegisterSet::new(),
        }
    }

    /// Last value exchanged with each register through the raw accessors.
    pub fn registers(&self) -> &RegisterSet {
        &self.shadow
    }

    /// Transactions retried since construction.
    pub fn retries(&self) -> u32 {
        self.ll.interface.retries()
    }

    pub fn bus(&self) -> &Bus {
        self.ll.interface.bus()
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        self.ll.interface.bus_mut()
    }

    pub fn release(self) -> Bus {
        self.ll.interface.release()
    }
}

impl<Spi: SpiDevice> Drv8301<SpiControlBus<Spi>> {
    pub fn from_spi(spi: Spi) -> Self {
        Self::new(SpiControlBus::new(spi))
    }
}

include!("bisync_helpers.rs");

impl<Bus> Drv8301<Bus>
where
    Bus: ControlBus,
{
    /// Writes a raw 11-bit value to a control register.
    ///
    /// Status registers, bits outside the register's field map and reserved encodings are
    /// rejected with [`HalError::InvalidRegister`] before anything reaches the bus.
    #[bisync]
    pub async fn write_register(
        &mut self,
        address: RegisterAddress,
        value: RegisterValue,
    ) -> Result<(), HalError> {
        address.validate_write(value)?;
        let bytes = value.bits().to_be_bytes();
        self.ll
            .interface
            .write_register(address.raw(), 16, &bytes)
            .await?;
        self.shadow.record(address, value);
        trace!("wrote {:#x} to register {:?}", value.bits(), address);
        Ok(())
    }

    /// Reads the raw 11-bit content of any register.
    #[bisync]
    pub async fn read_register(
        &mut self,
        address: RegisterAddress,
    ) -> Result<RegisterValue, HalError> {
        let mut bytes = [0u8; 2];
        self.ll
            .interface
            .read_register(address.raw(), 16, &mut bytes)
            .await?;
        let value = RegisterValue::from_bus(u16::from_be_bytes(bytes));
        self.shadow.record(address, value);
        Ok(value)
    }

    /// Check if any fault condition is active
    #[bisync]
    pub async fn has_fault(&mut self) -> Result<bool, HalError> {
        let mut op = self.ll.status_register_1();
        let status = read_internal(&mut op).await?;
        Ok(status.fault())
    }

    /// Get device ID from Status Register 2
    #[bisync]
    pub async fn get_device_id(&mut self) -> Result<u8, HalError> {
        let mut op = self.ll.status_register_2();
        let status = read_internal(&mut op).await?;
        Ok(status.device_id())
    }

    /// Get complete fault status from both status registers
    ///
    /// Only the gate-driver bits are filled in. Shunt overcurrent, bus watchdog and the
    /// external pin are detected by the [`PowerStage`](super::PowerStage).
    ///
    /// # Example
    /// ```rust,no_run
    /// # use drv8301_hal::{Drv8301, SimulatedBus};
    /// # let mut drv = Drv8301::new(SimulatedBus::new());
    /// let status = drv.get_fault_status()?;
    /// if status.has_overcurrent() {
    ///     // Handle overcurrent condition
    /// }
    /// if status.phase_a_overcurrent() {
    ///     // Phase A specific handling
    /// }
    /// # Ok::<(), drv8301_hal::HalError>(())
    /// ```
    #[bisync]
    pub async fn get_fault_status(&mut self) -> Result<FaultStatus, HalError> {
        let status1 = self.read_register(RegisterAddress::Status1).await?;
        let status2 = self.read_register(RegisterAddress::Status2).await?;
        Ok(FaultStatus::from_registers(status1.bits(), status2.bits()))
    }

    /// Set the overcurrent (VDS) threshold
    #[bisync]
    pub async fn set_oc_threshold(&mut self, threshold: OcAdjSet) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control1);
        let mut op = self.ll.control_register_1();
        modify_internal(&mut op, |r| r.set_oc_adj_set(threshold)).await
    }

    /// Set the overcurrent protection mode
    #[bisync]
    pub async fn set_ocp_mode(&mut self, mode: OcpMode) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control1);
        let mut op = self.ll.control_register_1();
        modify_internal(&mut op, |r| r.set_ocp_mode(mode)).await
    }

    /// Set PWM mode (6-PWM or 3-PWM)
    #[bisync]
    pub async fn set_pwm_mode(&mut self, mode: PwmInputMode) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control1);
        let three_pwm = mode == PwmInputMode::ThreePwm;
        let mut op = self.ll.control_register_1();
        modify_internal(&mut op, |r| r.set_pwm_mode(three_pwm)).await
    }

    /// Reset latched gate driver faults. The bit clears itself.
    #[bisync]
    pub async fn reset_gate_faults(&mut self) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control1);
        let mut op = self.ll.control_register_1();
        modify_internal(&mut op, |r| r.set_gate_reset(true)).await
    }

    /// Set the peak gate drive current
    #[bisync]
    pub async fn set_gate_current(&mut self, current: GateCurrent) -> Result<(), HalError> {
        if current == GateCurrent::Reserved {
            return Err(HalError::InvalidRegister);
        }
        self.shadow.invalidate(RegisterAddress::Control1);
        let mut op = self.ll.control_register_1();
        modify_internal(&mut op, |r| r.set_gate_current(current)).await
    }

    /// Set the current shunt amplifier gain
    #[bisync]
    pub async fn set_shunt_amplifier_gain(
        &mut self,
        gain: ShuntAmplifierGain,
    ) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| r.set_gain(gain)).await
    }

    /// Set the nOCTW pin reporting mode
    #[bisync]
    pub async fn set_octw_mode(&mut self, mode: OctwMode) -> Result<(), HalError> {
        if mode == OctwMode::OcOnlyReserved {
            return Err(HalError::InvalidRegister);
        }
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| r.set_octw_mode(mode)).await
    }

    /// Enable or disable DC calibration mode for shunt amplifier channel 1
    #[bisync]
    pub async fn set_dc_cal_ch1(&mut self, enable: bool) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| r.set_dc_cal_ch_1(enable)).await
    }

    /// Enable or disable DC calibration mode for shunt amplifier channel 2
    #[bisync]
    pub async fn set_dc_cal_ch2(&mut self, enable: bool) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| r.set_dc_cal_ch_2(enable)).await
    }

    /// Opens or closes both `DC_CAL` switches in a single register write.
    #[bisync]
    pub async fn set_dc_cal(&mut self, enable: bool) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| {
            r.set_dc_cal_ch_1(enable);
            r.set_dc_cal_ch_2(enable);
        })
        .await
    }

    /// Set overcurrent off-time control mode
    #[bisync]
    pub async fn set_oc_toff(&mut self, off_time_control: bool) -> Result<(), HalError> {
        self.shadow.invalidate(RegisterAddress::Control2);
        let mut op = self.ll.control_register_2();
        modify_internal(&mut op, |r| r.set_oc_toff(off_time_control)).await
    }

    /// Programs both control registers from `config` and reads them back.
    ///
    /// DC calibration is switched off and `GATE_RESET` is left clear. A read-back that
    /// differs from what was written fails with [`HalError::InvalidRegister`].
    #[bisync]
    pub async fn configure(&mut self, config: &GateDriveConfig) -> Result<(), HalError> {
        if config.gate_current == GateCurrent::Reserved
            || config.octw_mode == OctwMode::OcOnlyReserved
        {
            return Err(HalError::InvalidRegister);
        }
        self.shadow.invalidate(RegisterAddress::Control1);
        self.shadow.invalidate(RegisterAddress::Control2);

        let three_pwm = config.pwm_mode == PwmInputMode::ThreePwm;
        let mut op1 = self.ll.control_register_1();
        modify_internal(&mut op1, |r| {
            r.set_gate_current(config.gate_current);
            r.set_gate_reset(false);
            r.set_pwm_mode(three_pwm);
            r.set_ocp_mode(config.ocp_mode);
            r.set_oc_adj_set(config.oc_threshold);
        })
        .await?;

        let mut op2 = self.ll.control_register_2();
        modify_internal(&mut op2, |r| {
            r.set_octw_mode(config.octw_mode);
            r.set_gain(config.amplifier_gain);
            r.set_dc_cal_ch_1(false);
            r.set_dc_cal_ch_2(false);
            r.set_oc_toff(config.oc_off_time_control);
        })
        .await?;

        let mut op1 = self.ll.control_register_1();
        let ctrl1 = read_internal(&mut op1).await?;
        let mut op2 = self.ll.control_register_2();
        let ctrl2 = read_internal(&mut op2).await?;

        let matches = ctrl1.gate_current() == config.gate_current
            && ctrl1.pwm_mode() == three_pwm
            && ctrl1.ocp_mode() == config.ocp_mode
            && ctrl1.oc_adj_set() == config.oc_threshold
            && ctrl2.octw_mode() == config.octw_mode
            && ctrl2.gain() == config.amplifier_gain
            && !ctrl2.dc_cal_ch_1()
            && !ctrl2.dc_cal_ch_2()
            && ctrl2.oc_toff() == config.oc_off_time_control;
        if !matches {
            error!("control register read-back does not match the written configuration");
            return Err(HalError::InvalidRegister);
        }
        debug!("gate driver configured");
        Ok(())
    }
}
