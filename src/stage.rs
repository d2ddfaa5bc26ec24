use super::{ControlBus, Drv8301, bisync};
use crate::HalError;
use crate::config::HalConfig;
use crate::fault::{FaultLine, FaultLog, FaultMonitor, FaultState, FaultStatus, Transition};
use crate::pwm::{Phase, PwmOutputs, PwmStage};
use crate::sense::{Amps, CurrentSense, OffsetCalibrator, RawSample, SenseCalibration, Volts};

/// The drive board as one unit: DRV8301 registers, PWM outputs, sense channels and the
/// fault state machine tying them together.
///
/// The context is owned by one task and every bus transaction runs there. The nFAULT
/// interrupt never reaches the context: it signals the shared [`FaultLine`], and the
/// stage drains the line at the start of each call.
pub struct PowerStage<Bus, Pwm> {
    drv: Drv8301<Bus>,
    pwm: PwmStage<Pwm>,
    line: &'static FaultLine,
    faults: FaultMonitor,
    sense: CurrentSense,
    config: HalConfig,
    // Some while the DC_CAL switches may be closed
    calibrator: Option<OffsetCalibrator>,
}

impl<Bus, Pwm> PowerStage<Bus, Pwm>
where
    Bus: ControlBus,
    Pwm: PwmOutputs,
{
    /// Brings the board up with all outputs disabled.
    ///
    /// Clears power-up faults, programs and verifies the control registers, then reads the
    /// status registers once. Any error aborts bring-up. A fault still present at that
    /// point, or already signalled on `line`, leaves the stage in `FaultLatched`; otherwise
    /// the PWM is armed, with every output still disabled until
    /// [`enable_outputs`](Self::enable_outputs).
    #[bisync]
    pub async fn init(
        bus: Bus,
        pwm: Pwm,
        line: &'static FaultLine,
        config: HalConfig,
        calibration: SenseCalibration,
    ) -> Result<Self, HalError> {
        let pwm = PwmStage::new(pwm, config.pwm)?;
        let mut stage = Self {
            drv: Drv8301::with_attempts(bus, config.bus_attempts),
            pwm,
            line,
            faults: FaultMonitor::new(config.debounce_ticks, config.latch_on_warning),
            sense: CurrentSense::new(calibration),
            config,
            calibrator: None,
        };

        let device_id = stage.drv.get_device_id().await?;
        stage.drv.reset_gate_faults().await?;
        stage.drv.configure(&config.gate).await?;
        let status = stage.drv.get_fault_status().await?;

        stage.drain_line();
        stage.faults.observe(status, 0, &mut stage.pwm);
        if stage.faults.is_normal() {
            stage.pwm.rearm();
            info!("power stage up, DRV8301 device id {}", device_id);
        } else {
            warn!("power stage up with fault asserted: {:?}", stage.faults.last_status());
        }
        Ok(stage)
    }

    /// Reads the status registers and feeds them to the fault state machine.
    ///
    /// A bus failure that survives the retries latches [`FaultStatus::BUS_WATCHDOG`]
    /// before the error is returned.
    #[bisync]
    pub async fn poll_faults(&mut self, now: u32) -> Result<FaultState, HalError> {
        self.drain_line();
        let status = match self.drv.get_fault_status().await {
            Ok(status) => status,
            Err(err) => return Err(self.escalate(err, now)),
        };
        let transition = self.faults.observe(status, now, &mut self.pwm);
        self.apply(transition);
        Ok(self.faults.state())
    }

    /// Stores one ADC conversion. Checks the software phase current limit if one is
    /// configured and feeds a running offset calibration.
    pub fn capture_sample(&mut self, sample: RawSample, now: u32) -> Transition {
        let drained = self.drain_line();
        self.sense.capture(sample);
        if let Some(calibrator) = self.calibrator.as_mut() {
            calibrator.accumulate(&sample);
        }

        let Some(limit) = self.config.phase_current_limit else {
            return drained;
        };
        let over = self.sense.overcurrent(limit);
        if over.is_fault() {
            self.faults.trip(over, now, &mut self.pwm)
        } else {
            drained
        }
    }

    /// Pulses `GATE_RESET`, re-reads the status registers and moves to `Recovering` if they
    /// are clean. Fails with [`HalError::FaultLatched`] while the condition persists.
    ///
    /// Outside `FaultLatched` this is a no-op.
    #[bisync]
    pub async fn request_clear(&mut self, now: u32) -> Result<FaultState, HalError> {
        self.drain_line();
        if self.faults.state() != FaultState::FaultLatched {
            return Ok(self.faults.state());
        }
        if let Err(err) = self.drv.reset_gate_faults().await {
            return Err(self.escalate(err, now));
        }
        let status = match self.drv.get_fault_status().await {
            Ok(status) => status,
            Err(err) => return Err(self.escalate(err, now)),
        };
        self.faults.request_clear(status, now)?;
        Ok(self.faults.state())
    }

    fn apply(&mut self, transition: Transition) {
        if transition == Transition::Recovered {
            self.pwm.rearm();
        }
    }

    /// Latches whatever the fault line collected since the last call.
    fn drain_line(&mut self) -> Transition {
        match self.line.take() {
            Some((status, tick)) => self.faults.trip(status, tick, &mut self.pwm),
            None => Transition::None,
        }
    }

    /// Bus errors that survived the retries latch the control bus watchdog.
    fn escalate(&mut self, err: HalError, now: u32) -> HalError {
        if matches!(err, HalError::Bus(_)) {
            error!("control bus lost: {:?}", err);
            let watchdog = FaultStatus::from_bits(FaultStatus::BUS_WATCHDOG);
            self.faults.trip(watchdog, now, &mut self.pwm);
        }
        err
    }

    /// Refused with [`HalError::FaultLatched`] outside `Normal`.
    pub fn set_duty(&mut self, phase: Phase, value: f32) -> Result<f32, HalError> {
        self.drain_line();
        if !self.faults.is_normal() {
            return Err(HalError::FaultLatched);
        }
        self.pwm.set_duty(phase, value)
    }

    pub fn set_dead_time(&mut self, dead_time_ns: u32) -> Result<(), HalError> {
        self.pwm.set_dead_time(dead_time_ns)
    }

    /// Enables all three channel pairs. Refused outside `Normal` and while an offset
    /// calibration is running.
    ///
    /// The fault line is checked and the outputs enabled inside one short critical section,
    /// so an nFAULT interrupt lands either before (and the call is refused) or after (and
    /// its sink turns the outputs off again).
    pub fn enable_outputs(&mut self) -> Result<(), HalError> {
        critical_section::with(|_| {
            self.drain_line();
            if !self.faults.is_normal() {
                return Err(HalError::FaultLatched);
            }
            if self.calibrator.is_some() {
                return Err(HalError::CalibrationState("in progress"));
            }
            self.pwm.enable_all()
        })
    }

    /// Zero duty, all outputs off. Does not latch a fault.
    pub fn disable_all(&mut self) {
        self.pwm.disable_all();
        self.drain_line();
        if self.faults.is_normal() {
            self.pwm.rearm();
        }
    }

    pub fn read_phase_current(&self, phase: Phase) -> Result<Amps, HalError> {
        self.sense.read_phase_current(phase)
    }

    pub fn read_phase_currents(&self) -> Result<[Amps; 3], HalError> {
        self.sense.read_phase_currents()
    }

    pub fn read_bus_voltage(&self) -> Result<Volts, HalError> {
        self.sense.read_bus_voltage()
    }

    /// `FaultLatched` as soon as the fault line has been signalled, even before the stage
    /// has drained it.
    pub fn fault_state(&self) -> FaultState {
        if self.line.is_pending() {
            FaultState::FaultLatched
        } else {
            self.faults.state()
        }
    }

    /// Most recent fault snapshot, polled or interrupt-sourced.
    pub fn fault_status(&self) -> FaultStatus {
        let pending = self.line.peek();
        if pending.is_fault() {
            pending
        } else {
            self.faults.last_status()
        }
    }

    /// Every fault bit seen since the last successful clear.
    pub fn accumulated_faults(&self) -> FaultStatus {
        self.faults.accumulated()
    }

    pub fn fault_log(&self) -> &FaultLog {
        self.faults.log()
    }

    /// Closes the `DC_CAL` switches and starts averaging the next `samples` captures.
    ///
    /// Only allowed with every output disabled. Calling it again restarts the averaging.
    /// If the switch write fails the switches may be closed, so the calibration stays
    /// marked as running and [`enable_outputs`](Self::enable_outputs) stays refused until
    /// [`finish_offset_calibration`](Self::finish_offset_calibration) confirms them open.
    #[bisync]
    pub async fn begin_offset_calibration(
        &mut self,
        samples: u32,
        now: u32,
    ) -> Result<(), HalError> {
        self.drain_line();
        if self.pwm.any_enabled() {
            return Err(HalError::CalibrationState("outputs enabled"));
        }
        self.calibrator = Some(OffsetCalibrator::new(samples));
        if let Err(err) = self.drv.set_dc_cal(true).await {
            return Err(self.escalate(err, now));
        }
        debug!("offset calibration started, {} samples", samples);
        Ok(())
    }

    /// Opens the `DC_CAL` switches and installs the averaged offsets.
    ///
    /// The calibration only ends once the switches are confirmed open; a bus failure
    /// keeps it running so the call can be repeated. Fails with
    /// [`HalError::StaleSample`] if fewer samples than requested were captured, in which
    /// case the switches are open and the calibration is abandoned.
    #[bisync]
    pub async fn finish_offset_calibration(
        &mut self,
        now: u32,
    ) -> Result<SenseCalibration, HalError> {
        self.drain_line();
        let offsets = match self.calibrator.as_ref() {
            Some(calibrator) => calibrator.offsets(),
            None => return Err(HalError::CalibrationState("not started")),
        };
        if let Err(err) = self.drv.set_dc_cal(false).await {
            return Err(self.escalate(err, now));
        }
        self.calibrator = None;

        let offsets = offsets.ok_or(HalError::StaleSample)?;
        let calibration = self.sense.calibration().with_offsets(offsets);
        self.sense.set_calibration(calibration);
        info!("offset calibration done: {:?}", offsets);
        Ok(calibration)
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrator.is_some()
    }

    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    pub fn pwm(&self) -> &PwmStage<Pwm> {
        &self.pwm
    }

    pub fn sense(&self) -> &CurrentSense {
        &self.sense
    }

    pub fn fault_line(&self) -> &'static FaultLine {
        self.line
    }

    pub fn drv(&self) -> &Drv8301<Bus> {
        &self.drv
    }

    /// Direct register access. Changing the protection settings here bypasses
    /// [`HalConfig`].
    pub fn drv_mut(&mut self) -> &mut Drv8301<Bus> {
        &mut self.drv
    }

    /// Disables every output and hands back the bus and the PWM timer.
    pub fn release(self) -> (Bus, Pwm) {
        let pwm = self.pwm.release();
        (self.drv.release(), pwm)
    }
}
