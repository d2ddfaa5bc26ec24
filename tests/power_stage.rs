use drv8301_hal::{
    Amps, BusError, FaultLine, FaultState, FaultStatus, HalConfig, HalError, Phase, PowerStage,
    PowerStageAsync, PwmOutputs, RawSample, RegisterAddress, RegisterValue, SafeState,
    SenseCalibration, SimulatedBus, Transition,
};
use embassy_futures::block_on;

#[derive(Debug, Default)]
struct RecordingPwm {
    compare: [u16; 3],
    enabled: [bool; 3],
    dead_time_ns: u32,
    compare_writes: u32,
    disables: u32,
}

impl PwmOutputs for RecordingPwm {
    fn max_compare(&self) -> u16 {
        2000
    }

    fn set_compare(&mut self, phase: Phase, compare: u16) {
        self.compare[phase.index()] = compare;
        self.compare_writes += 1;
    }

    fn set_enabled(&mut self, phase: Phase, enabled: bool) {
        self.enabled[phase.index()] = enabled;
    }

    fn set_dead_time(&mut self, dead_time_ns: u32) {
        self.dead_time_ns = dead_time_ns;
    }

    fn disable_all(&mut self) {
        self.disables += 1;
        self.enabled = [false; 3];
    }
}

/// The interrupt handler's own kill switch, e.g. the `EN_GATE` pin.
#[derive(Debug, Default)]
struct GateEnable {
    cuts: u32,
}

impl SafeState for GateEnable {
    fn force_safe(&mut self) {
        self.cuts += 1;
    }
}

const DEBOUNCE: u32 = 50;

fn fault_line() -> &'static FaultLine {
    Box::leak(Box::new(FaultLine::new()))
}

fn config() -> HalConfig {
    HalConfig {
        debounce_ticks: DEBOUNCE,
        ..HalConfig::default()
    }
}

fn stage_with(config: HalConfig) -> PowerStage<SimulatedBus, RecordingPwm> {
    PowerStage::init(
        SimulatedBus::new(),
        RecordingPwm::default(),
        fault_line(),
        config,
        SenseCalibration::default(),
    )
    .unwrap()
}

fn running() -> PowerStage<SimulatedBus, RecordingPwm> {
    let mut stage = stage_with(config());
    stage.enable_outputs().unwrap();
    stage.set_duty(Phase::A, 0.5).unwrap();
    stage.set_duty(Phase::B, 0.25).unwrap();
    stage
}

#[test]
fn init_programs_control_registers() {
    let stage = stage_with(config());
    assert_eq!(stage.fault_state(), FaultState::Normal);
    assert!(!stage.pwm().is_latched());
    assert!(!stage.pwm().any_enabled());
    assert_eq!(stage.pwm().outputs().dead_time_ns, 500);

    // 1.7 A gate current, 6-PWM, latch shutdown, 0.250 V threshold
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control1), 0x0310);
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2), 0x0000);
}

#[test]
fn injected_overcurrent_disables_outputs() {
    let mut stage = running();
    assert_eq!(stage.pwm().outputs().compare, [1000, 500, 0]);
    assert_eq!(stage.pwm().outputs().enabled, [true; 3]);

    stage
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::FETHA_OC));
    assert_eq!(stage.poll_faults(10), Ok(FaultState::FaultLatched));

    let outputs = stage.pwm().outputs();
    assert_eq!(outputs.compare, [0; 3]);
    assert_eq!(outputs.enabled, [false; 3]);
    assert!(stage.fault_status().phase_a_overcurrent());
    assert!(stage.fault_status().desaturation(Phase::A));

    let writes = stage.pwm().outputs().compare_writes;
    assert_eq!(stage.set_duty(Phase::A, 0.5), Err(HalError::FaultLatched));
    assert_eq!(stage.enable_outputs(), Err(HalError::FaultLatched));
    assert_eq!(stage.pwm().outputs().compare_writes, writes);

    let record = stage.fault_log().latest().unwrap();
    assert_eq!(record.tick, 10);
    assert!(record.status.phase_a_overcurrent());
}

#[test]
fn clear_waits_for_condition_and_debounce() {
    let mut stage = running();
    stage
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::OTSD));
    stage.poll_faults(100).unwrap();

    // condition still present
    assert_eq!(stage.request_clear(110), Err(HalError::FaultLatched));
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);

    stage.drv_mut().bus_mut().clear_fault_condition();
    assert_eq!(stage.request_clear(120), Ok(FaultState::Recovering));
    assert_eq!(stage.set_duty(Phase::A, 0.1), Err(HalError::FaultLatched));

    assert_eq!(stage.poll_faults(120 + DEBOUNCE - 1), Ok(FaultState::Recovering));
    assert_eq!(stage.poll_faults(120 + DEBOUNCE), Ok(FaultState::Normal));

    // back in Normal the outputs are armed but still off
    assert!(!stage.pwm().any_enabled());
    assert_eq!(stage.set_duty(Phase::A, 0.1), Ok(0.1));
    assert_eq!(stage.pwm().outputs().compare[0], 200);
}

#[test]
fn reassertion_while_recovering_relatches() {
    let mut stage = running();
    let bus = stage.drv_mut().bus_mut();
    bus.inject_fault(FaultStatus::from_bits(FaultStatus::PVDD_UV));
    stage.poll_faults(0).unwrap();
    stage.drv_mut().bus_mut().clear_fault_condition();
    assert_eq!(stage.request_clear(5), Ok(FaultState::Recovering));

    stage
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::PVDD_UV));
    assert_eq!(stage.poll_faults(6), Ok(FaultState::FaultLatched));

    // the debounce window has no effect once latched again
    assert_eq!(stage.poll_faults(5 + DEBOUNCE * 2), Ok(FaultState::FaultLatched));
}

#[test]
fn debounce_survives_tick_wraparound() {
    let mut stage = running();
    stage
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::GVDD_UV));
    stage.poll_faults(u32::MAX - 30).unwrap();
    stage.drv_mut().bus_mut().clear_fault_condition();
    stage.request_clear(u32::MAX - 20).unwrap();

    assert_eq!(stage.poll_faults(10), Ok(FaultState::Recovering));
    assert_eq!(stage.poll_faults(DEBOUNCE - 21), Ok(FaultState::Normal));
}

#[test]
fn warning_is_recorded_but_not_latched() {
    let mut stage = running();
    stage
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::OTW));
    assert_eq!(stage.poll_faults(1), Ok(FaultState::Normal));
    assert!(stage.fault_status().overtemperature_warning());
    assert_eq!(stage.fault_log().len(), 1);
    assert_eq!(stage.set_duty(Phase::C, 0.3), Ok(0.3));

    let mut strict = stage_with(HalConfig {
        latch_on_warning: true,
        ..config()
    });
    strict
        .drv_mut()
        .bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::OTW));
    assert_eq!(strict.poll_faults(1), Ok(FaultState::FaultLatched));
}

#[test]
fn fault_interrupt_never_touches_the_bus() {
    let mut stage = running();
    let line = stage.fault_line();
    let before = stage.drv().bus().transactions();
    let mut gate = GateEnable::default();

    line.on_fault_interrupt(42, &mut gate);
    assert_eq!(gate.cuts, 1);
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);
    assert!(stage.fault_status().contains(FaultStatus::EXTERNAL));

    // the stage latches on its next call, with the interrupt's tick
    assert_eq!(stage.set_duty(Phase::A, 0.5), Err(HalError::FaultLatched));
    assert_eq!(stage.pwm().outputs().enabled, [false; 3]);
    assert_eq!(stage.pwm().outputs().compare, [0; 3]);
    assert_eq!(stage.fault_log().latest().map(|r| r.tick), Some(42));
    assert!(!line.is_pending());
    assert_eq!(stage.drv().bus().transactions(), before);

    // a second interrupt while latched forces the safe state again
    let disables = stage.pwm().outputs().disables;
    line.on_fault_interrupt(43, &mut gate);
    stage.disable_all();
    assert_eq!(gate.cuts, 2);
    assert_eq!(stage.pwm().outputs().disables, disables + 2);
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);

    // no register fault behind it, so a clear goes through
    assert_eq!(stage.request_clear(50), Ok(FaultState::Recovering));
}

#[test]
fn interrupt_before_enable_is_honoured() {
    let mut stage = stage_with(config());
    let mut gate = GateEnable::default();
    stage.fault_line().on_fault_interrupt(7, &mut gate);

    assert_eq!(stage.enable_outputs(), Err(HalError::FaultLatched));
    assert_eq!(stage.pwm().outputs().enabled, [false; 3]);
    assert!(stage.accumulated_faults().contains(FaultStatus::EXTERNAL));
}

#[test]
fn fault_present_at_power_up_stays_latched() {
    let mut bus = SimulatedBus::new();
    bus.inject_fault(FaultStatus::from_bits(FaultStatus::GVDD_UV));
    let mut stage = PowerStage::init(
        bus,
        RecordingPwm::default(),
        fault_line(),
        config(),
        SenseCalibration::default(),
    )
    .unwrap();

    assert_eq!(stage.fault_state(), FaultState::FaultLatched);
    assert!(stage.pwm().is_latched());
    assert_eq!(stage.enable_outputs(), Err(HalError::FaultLatched));
}

#[test]
fn transient_bus_errors_are_retried() {
    let mut stage = running();
    stage.drv_mut().bus_mut().fail_next(2, BusError::Timeout);
    assert_eq!(stage.poll_faults(1), Ok(FaultState::Normal));
    assert_eq!(stage.drv().retries(), 2);
}

#[test]
fn exhausted_retries_latch_the_bus_watchdog() {
    let mut stage = running();
    stage.drv_mut().bus_mut().fail_next(3, BusError::FrameError);
    assert_eq!(stage.poll_faults(1), Err(HalError::Bus(BusError::FrameError)));
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);
    assert!(stage.fault_status().bus_watchdog());
    assert_eq!(stage.pwm().outputs().enabled, [false; 3]);

    // a clear that loses the bus as well leaves the stage latched
    stage.drv_mut().bus_mut().fail_next(3, BusError::Timeout);
    assert_eq!(stage.request_clear(2), Err(HalError::Bus(BusError::Timeout)));
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);

    // the bus is back and the registers are clean
    assert_eq!(stage.request_clear(3), Ok(FaultState::Recovering));
}

#[test]
fn bring_up_fails_without_a_bus() {
    let mut bus = SimulatedBus::new();
    bus.fail_next(10, BusError::Timeout);
    let result = PowerStage::init(
        bus,
        RecordingPwm::default(),
        fault_line(),
        config(),
        SenseCalibration::default(),
    );
    assert!(matches!(result, Err(HalError::Bus(BusError::Timeout))));
}

#[test]
fn reads_are_stale_before_first_capture() {
    let mut stage = running();
    assert_eq!(stage.read_phase_current(Phase::A), Err(HalError::StaleSample));
    assert_eq!(stage.read_bus_voltage(), Err(HalError::StaleSample));

    let sample = RawSample {
        phase: [2048, 2047, 0],
        bus_voltage: 1000,
    };
    assert_eq!(stage.capture_sample(sample, 1), Transition::None);
    let Amps(ia) = stage.read_phase_current(Phase::A).unwrap();
    assert!(ia.abs() < 0.01);
    assert!(stage.read_bus_voltage().unwrap().0 > 0.0);
}

#[test]
fn software_current_limit_trips() {
    let mut stage = stage_with(HalConfig {
        phase_current_limit: Some(Amps(10.0)),
        ..config()
    });
    stage.enable_outputs().unwrap();
    let quiet = RawSample {
        phase: [2048, 2048, 2048],
        bus_voltage: 1000,
    };
    assert_eq!(stage.capture_sample(quiet, 1), Transition::None);

    // phase A at zero counts is about 16.5 A with the default board
    let loud = RawSample {
        phase: [0, 2048, 2048],
        bus_voltage: 1000,
    };
    assert_eq!(stage.capture_sample(loud, 2), Transition::Latched);
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);
    assert!(stage.fault_status().contains(FaultStatus::SHUNT_OC_A));
    assert!(!stage.fault_status().contains(FaultStatus::SHUNT_OC_B));
    assert_eq!(stage.pwm().outputs().enabled, [false; 3]);
}

#[test]
fn raw_register_round_trip() {
    let mut stage = stage_with(config());
    let drv = stage.drv_mut();

    let value = RegisterValue::new(0x0034).unwrap();
    drv.write_register(RegisterAddress::Control2, value).unwrap();
    assert_eq!(drv.read_register(RegisterAddress::Control2), Ok(value));
    assert_eq!(drv.registers().get(RegisterAddress::Control2), Some(value));

    // typed helpers drop the shadow entry they touch
    drv.set_oc_toff(true).unwrap();
    assert_eq!(drv.registers().get(RegisterAddress::Control2), None);
    assert_eq!(
        drv.read_register(RegisterAddress::Control2).unwrap().bits(),
        0x0074
    );
}

#[test]
fn invalid_writes_never_reach_the_bus() {
    let mut stage = stage_with(config());
    let drv = stage.drv_mut();
    let before = drv.bus().transactions();

    let zero = RegisterValue::new(0).unwrap();
    assert_eq!(
        drv.write_register(RegisterAddress::Status1, zero),
        Err(HalError::InvalidRegister)
    );
    // D10:D7 of Control Register 2 are reserved
    let reserved = RegisterValue::new(0x0080).unwrap();
    assert_eq!(
        drv.write_register(RegisterAddress::Control2, reserved),
        Err(HalError::InvalidRegister)
    );
    // GATE_CURRENT = 0b11
    let reserved = RegisterValue::new(0x0313).unwrap();
    assert_eq!(
        drv.write_register(RegisterAddress::Control1, reserved),
        Err(HalError::InvalidRegister)
    );
    // GATE_RESET self-clears and is left to reset_gate_faults
    let reset = RegisterValue::new(0x0314).unwrap();
    assert_eq!(
        drv.write_register(RegisterAddress::Control1, reset),
        Err(HalError::InvalidRegister)
    );
    assert_eq!(RegisterValue::new(0x0800), Err(HalError::InvalidRegister));
    assert_eq!(drv.bus().transactions(), before);
}

#[test]
fn typed_register_access() {
    let mut stage = stage_with(config());
    let drv = stage.drv_mut();
    assert_eq!(drv.get_device_id(), Ok(SimulatedBus::DEVICE_ID));
    assert_eq!(drv.has_fault(), Ok(false));

    drv.set_oc_threshold(drv8301_hal::OcAdjSet::Vds60MV).unwrap();
    drv.set_ocp_mode(drv8301_hal::OcpMode::ReportOnly).unwrap();
    assert_eq!(drv.bus().peek(RegisterAddress::Control1), 0x0020);

    drv.set_shunt_amplifier_gain(drv8301_hal::ShuntAmplifierGain::Gain40)
        .unwrap();
    assert_eq!(drv.bus().peek(RegisterAddress::Control2), 0x0008);

    assert_eq!(
        drv.set_gate_current(drv8301_hal::GateCurrent::Reserved),
        Err(HalError::InvalidRegister)
    );

    drv.bus_mut()
        .inject_fault(FaultStatus::from_bits(FaultStatus::FETLC_OC));
    assert_eq!(drv.has_fault(), Ok(true));
    let status = drv.get_fault_status().unwrap();
    assert!(status.phase_c_overcurrent());
    assert!(status.contains(FaultStatus::FAULT));
}

#[test]
fn offset_calibration_uses_dc_cal() {
    let mut stage = stage_with(config());
    stage.begin_offset_calibration(4, 0).unwrap();
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0x0030);
    assert_eq!(stage.enable_outputs(), Err(HalError::CalibrationState("in progress")));

    for offset in [2040, 2042, 2040, 2042] {
        let sample = RawSample {
            phase: [offset, 2050, 0],
            bus_voltage: 0,
        };
        stage.capture_sample(sample, 0);
    }

    let calibration = stage.finish_offset_calibration(1).unwrap();
    assert_eq!(calibration.phase_a.offset, 2041.0);
    assert_eq!(calibration.phase_b.offset, 2050.0);
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0);
    assert_eq!(stage.sense().calibration(), &calibration);

    stage.enable_outputs().unwrap();
    assert_eq!(
        stage.begin_offset_calibration(4, 2),
        Err(HalError::CalibrationState("outputs enabled"))
    );
}

#[test]
fn incomplete_calibration_is_rejected() {
    let mut stage = stage_with(config());
    stage.begin_offset_calibration(10, 0).unwrap();
    stage.capture_sample(RawSample::default(), 0);
    assert_eq!(stage.finish_offset_calibration(1), Err(HalError::StaleSample));
    assert!(!stage.is_calibrating());
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0);
    assert_eq!(
        stage.finish_offset_calibration(2),
        Err(HalError::CalibrationState("not started"))
    );
}

#[test]
fn calibration_ends_only_once_the_switches_reopen() {
    let mut stage = stage_with(config());
    stage.begin_offset_calibration(1, 0).unwrap();
    let quiet = RawSample {
        phase: [2048, 2048, 2048],
        bus_voltage: 0,
    };
    stage.capture_sample(quiet, 1);

    stage.drv_mut().bus_mut().fail_next(3, BusError::Timeout);
    assert_eq!(stage.finish_offset_calibration(2), Err(HalError::Bus(BusError::Timeout)));
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0x0030);
    assert!(stage.is_calibrating());
    assert!(stage.enable_outputs().is_err());
    assert_eq!(stage.set_duty(Phase::A, 0.5), Err(HalError::FaultLatched));
    assert!(stage.accumulated_faults().bus_watchdog());

    // bus back: the retry reopens the switches and installs the offsets
    let calibration = stage.finish_offset_calibration(3).unwrap();
    assert_eq!(calibration.phase_a.offset, 2048.0);
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0);
    assert!(!stage.is_calibrating());

    assert_eq!(stage.request_clear(4), Ok(FaultState::Recovering));
    assert_eq!(stage.poll_faults(4 + DEBOUNCE), Ok(FaultState::Normal));
    stage.enable_outputs().unwrap();
}

#[test]
fn bus_loss_while_starting_calibration_latches() {
    let mut stage = stage_with(config());
    stage.drv_mut().bus_mut().fail_next(3, BusError::FrameError);

    assert_eq!(
        stage.begin_offset_calibration(4, 10),
        Err(HalError::Bus(BusError::FrameError))
    );
    assert_eq!(stage.fault_state(), FaultState::FaultLatched);
    assert!(stage.fault_status().bus_watchdog());
    assert_eq!(stage.fault_log().latest().map(|r| r.tick), Some(10));
    // the switch state is unknown, so the calibration counts as running
    assert!(stage.is_calibrating());

    assert_eq!(stage.finish_offset_calibration(11), Err(HalError::StaleSample));
    assert_eq!(stage.drv().bus().peek(RegisterAddress::Control2) & 0x0030, 0);
    assert!(!stage.is_calibrating());
    assert_eq!(stage.request_clear(12), Ok(FaultState::Recovering));
}

#[test]
fn release_leaves_outputs_disabled() {
    let stage = running();
    let (bus, pwm) = stage.release();
    assert_eq!(pwm.enabled, [false; 3]);
    assert_eq!(pwm.compare, [0; 3]);
    assert_eq!(bus.peek(RegisterAddress::Control1), 0x0310);
}

#[test]
fn async_flavour_handles_faults() {
    block_on(async {
        let line = fault_line();
        let mut stage = PowerStageAsync::init(
            SimulatedBus::new(),
            RecordingPwm::default(),
            line,
            config(),
            SenseCalibration::default(),
        )
        .await
        .unwrap();
        stage.enable_outputs().unwrap();
        stage.set_duty(Phase::B, 0.75).unwrap();
        assert_eq!(stage.pwm().outputs().compare[1], 1500);

        stage
            .drv_mut()
            .bus_mut()
            .inject_fault(FaultStatus::from_bits(FaultStatus::FETLB_OC));
        assert_eq!(stage.poll_faults(3).await, Ok(FaultState::FaultLatched));
        assert_eq!(stage.pwm().outputs().compare, [0; 3]);

        stage.drv_mut().bus_mut().clear_fault_condition();
        assert_eq!(stage.request_clear(4).await, Ok(FaultState::Recovering));
        assert_eq!(stage.poll_faults(4 + DEBOUNCE).await, Ok(FaultState::Normal));
    });
}

#[test]
fn async_poll_in_flight_does_not_block_the_interrupt() {
    block_on(async {
        let line = fault_line();
        let mut stage = PowerStageAsync::init(
            SimulatedBus::new(),
            RecordingPwm::default(),
            line,
            config(),
            SenseCalibration::default(),
        )
        .await
        .unwrap();
        stage.enable_outputs().unwrap();

        // the poll holds the stage; the interrupt only needs the line
        let poll = stage.poll_faults(8);
        let mut gate = GateEnable::default();
        line.on_fault_interrupt(8, &mut gate);
        assert_eq!(gate.cuts, 1);

        assert_eq!(poll.await, Ok(FaultState::FaultLatched));
        assert_eq!(stage.pwm().outputs().enabled, [false; 3]);
        assert!(stage.accumulated_faults().contains(FaultStatus::EXTERNAL));
    });
}
