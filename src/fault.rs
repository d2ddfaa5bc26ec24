//! Fault decoding and the fault management state machine.
//!
//! [`FaultMonitor`] moves between [`FaultState::Normal`], [`FaultState::FaultLatched`] and
//! [`FaultState::Recovering`]. Every transition into `FaultLatched` drives the [`SafeState`]
//! sink before returning, so the outputs are already disabled when the caller learns about
//! the fault.
//!
//! Time is a caller-supplied monotonic tick counter. Elapsed time is computed with wrapping
//! arithmetic, so the counter may roll over.
//!
//! Interrupt handlers never see the monitor. They go through a [`FaultLine`], which only
//! forces their own safe-state sink and publishes the fault bits atomically.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::HalError;
use crate::pwm::Phase;

/// Snapshot of decoded fault bits.
///
/// The low eleven bits mirror Status Register 1 one-to-one. The remaining bits come from
/// Status Register 2 or are raised by the HAL itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultStatus {
    bits: u32,
}

impl FaultStatus {
    pub const FETLC_OC: u32 = 1 << 0;
    pub const FETHC_OC: u32 = 1 << 1;
    pub const FETLB_OC: u32 = 1 << 2;
    pub const FETHB_OC: u32 = 1 << 3;
    pub const FETLA_OC: u32 = 1 << 4;
    pub const FETHA_OC: u32 = 1 << 5;
    pub const OTW: u32 = 1 << 6;
    pub const OTSD: u32 = 1 << 7;
    pub const PVDD_UV: u32 = 1 << 8;
    pub const GVDD_UV: u32 = 1 << 9;
    pub const FAULT: u32 = 1 << 10;
    pub const GVDD_OV: u32 = 1 << 11;
    /// Shunt current above the configured software limit.
    pub const SHUNT_OC_A: u32 = 1 << 12;
    pub const SHUNT_OC_B: u32 = 1 << 13;
    pub const SHUNT_OC_C: u32 = 1 << 14;
    /// Control bus retries exhausted.
    pub const BUS_WATCHDOG: u32 = 1 << 15;
    /// nFAULT asserted, register contents not read yet.
    pub const EXTERNAL: u32 = 1 << 16;

    pub const ALL: u32 = (1 << 17) - 1;

    const STATUS1_MASK: u16 = 0x07FF;
    const STATUS2_GVDD_OV: u16 = 1 << 7;

    pub const EMPTY: FaultStatus = FaultStatus { bits: 0 };

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits: bits & Self::ALL,
        }
    }

    /// Decodes the raw contents of Status Register 1 and Status Register 2.
    pub const fn from_registers(status1: u16, status2: u16) -> Self {
        let mut bits = (status1 & Self::STATUS1_MASK) as u32;
        if status2 & Self::STATUS2_GVDD_OV != 0 {
            bits |= Self::GVDD_OV;
        }
        Self { bits }
    }

    pub const fn bits(self) -> u32 {
        self.bits
    }

    pub const fn with(self, flag: u32, set: bool) -> Self {
        if set {
            Self::from_bits(self.bits | flag)
        } else {
            Self::from_bits(self.bits & !flag)
        }
    }

    pub const fn contains(self, flags: u32) -> bool {
        self.bits & flags == flags
    }

    pub const fn intersects(self, flags: u32) -> bool {
        self.bits & flags != 0
    }

    pub const fn union(self, other: FaultStatus) -> Self {
        Self::from_bits(self.bits | other.bits)
    }

    pub const fn masked(self, flags: u32) -> Self {
        Self::from_bits(self.bits & flags)
    }

    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Bits set in `self` that were clear in `previous`.
    pub const fn newly_asserted(self, previous: FaultStatus) -> Self {
        Self::from_bits(self.bits & !previous.bits)
    }

    /// Any fault or warning bit set.
    pub const fn is_fault(self) -> bool {
        !self.is_empty()
    }

    pub const fn has_desaturation(self) -> bool {
        self.intersects(
            Self::FETHA_OC
                | Self::FETLA_OC
                | Self::FETHB_OC
                | Self::FETLB_OC
                | Self::FETHC_OC
                | Self::FETLC_OC,
        )
    }

    /// High- or low-side VDS overcurrent on `phase`.
    pub const fn desaturation(self, phase: Phase) -> bool {
        let flags = match phase {
            Phase::A => Self::FETHA_OC | Self::FETLA_OC,
            Phase::B => Self::FETHB_OC | Self::FETLB_OC,
            Phase::C => Self::FETHC_OC | Self::FETLC_OC,
        };
        self.intersects(flags)
    }

    /// Any per-phase overcurrent, from the gate driver's VDS monitors or the shunt limit.
    pub const fn has_overcurrent(self) -> bool {
        self.has_desaturation()
            || self.intersects(Self::SHUNT_OC_A | Self::SHUNT_OC_B | Self::SHUNT_OC_C)
    }

    pub const fn phase_overcurrent(self, phase: Phase) -> bool {
        self.desaturation(phase) || self.intersects(Self::shunt_flag(phase))
    }

    pub const fn phase_a_overcurrent(self) -> bool {
        self.phase_overcurrent(Phase::A)
    }

    pub const fn phase_b_overcurrent(self) -> bool {
        self.phase_overcurrent(Phase::B)
    }

    pub const fn phase_c_overcurrent(self) -> bool {
        self.phase_overcurrent(Phase::C)
    }

    pub const fn overtemperature(self) -> bool {
        self.intersects(Self::OTSD)
    }

    pub const fn overtemperature_warning(self) -> bool {
        self.intersects(Self::OTW)
    }

    pub const fn undervoltage(self) -> bool {
        self.intersects(Self::PVDD_UV | Self::GVDD_UV)
    }

    pub const fn overvoltage(self) -> bool {
        self.intersects(Self::GVDD_OV)
    }

    pub const fn bus_watchdog(self) -> bool {
        self.intersects(Self::BUS_WATCHDOG)
    }

    pub(crate) const fn shunt_flag(phase: Phase) -> u32 {
        match phase {
            Phase::A => Self::SHUNT_OC_A,
            Phase::B => Self::SHUNT_OC_B,
            Phase::C => Self::SHUNT_OC_C,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultState {
    Normal,
    FaultLatched,
    Recovering,
}

/// Outcome of feeding the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    None,
    /// Entered `FaultLatched`; the safe state has been forced.
    Latched,
    Recovering,
    /// Debounce elapsed, back to `Normal`.
    Recovered,
}

/// Sink the state machine drives when it latches a fault.
///
/// Implementations must not block, allocate, or touch the control bus: this runs from
/// interrupt context.
pub trait SafeState {
    fn force_safe(&mut self);
}

/// Interrupt-side half of the fault path, meant to live in a `static`.
///
/// The nFAULT handler owns a safe-state sink of its own (the `EN_GATE` pin or the timer
/// break input) and calls [`on_fault_interrupt`](Self::on_fault_interrupt). That forces the
/// sink and publishes [`FaultStatus::EXTERNAL`] with one atomic operation: no lock, no bus
/// access, no loop. The [`PowerStage`](crate::PowerStage) holding the same line drains it at
/// the start of its next call and latches its state machine with the tick of the interrupt.
#[derive(Debug)]
pub struct FaultLine {
    pending: AtomicU32,
    tick: AtomicU32,
}

impl FaultLine {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            tick: AtomicU32::new(0),
        }
    }

    /// nFAULT interrupt entry point.
    pub fn on_fault_interrupt<S: SafeState>(&self, now: u32, outputs: &mut S) {
        self.signal(FaultStatus::from_bits(FaultStatus::EXTERNAL), now, outputs);
    }

    /// Forces `outputs` safe, then publishes `status` for the owning stage.
    pub fn signal<S: SafeState>(&self, status: FaultStatus, now: u32, outputs: &mut S) {
        outputs.force_safe();
        self.tick.store(now, Ordering::Relaxed);
        self.pending.fetch_or(status.bits(), Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Bits signalled and not drained yet.
    pub fn peek(&self) -> FaultStatus {
        FaultStatus::from_bits(self.pending.load(Ordering::Acquire))
    }

    /// Drains the pending bits, together with the tick of the latest signal.
    pub fn take(&self) -> Option<(FaultStatus, u32)> {
        let bits = self.pending.swap(0, Ordering::AcqRel);
        if bits == 0 {
            return None;
        }
        Some((FaultStatus::from_bits(bits), self.tick.load(Ordering::Relaxed)))
    }
}

impl Default for FaultLine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultRecord {
    pub tick: u32,
    pub status: FaultStatus,
}

pub const FAULT_LOG_CAPACITY: usize = 8;

/// Ring of the most recent clear-to-set transitions.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaultLog {
    records: [FaultRecord; FAULT_LOG_CAPACITY],
    head: usize,
    len: usize,
    overwritten: u32,
}

impl FaultLog {
    pub const fn new() -> Self {
        Self {
            records: [FaultRecord {
                tick: 0,
                status: FaultStatus::EMPTY,
            }; FAULT_LOG_CAPACITY],
            head: 0,
            len: 0,
            overwritten: 0,
        }
    }

    pub fn push(&mut self, tick: u32, status: FaultStatus) {
        let slot = (self.head + self.len) % FAULT_LOG_CAPACITY;
        self.records[slot] = FaultRecord { tick, status };
        if self.len == FAULT_LOG_CAPACITY {
            self.head = (self.head + 1) % FAULT_LOG_CAPACITY;
            self.overwritten = self.overwritten.saturating_add(1);
        } else {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records pushed out by newer ones.
    pub fn overwritten(&self) -> u32 {
        self.overwritten
    }

    pub fn latest(&self) -> Option<FaultRecord> {
        self.len
            .checked_sub(1)
            .map(|last| self.records[(self.head + last) % FAULT_LOG_CAPACITY])
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = FaultRecord> + '_ {
        (0..self.len).map(move |i| self.records[(self.head + i) % FAULT_LOG_CAPACITY])
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FaultMonitor {
    state: FaultState,
    since: u32,
    debounce_ticks: u32,
    latch_mask: u32,
    last: FaultStatus,
    accumulated: FaultStatus,
    log: FaultLog,
}

impl FaultMonitor {
    /// The over-temperature warning only latches when `latch_on_warning` is set.
    pub const fn new(debounce_ticks: u32, latch_on_warning: bool) -> Self {
        let latch_mask = if latch_on_warning {
            FaultStatus::ALL
        } else {
            FaultStatus::ALL & !FaultStatus::OTW
        };
        Self {
            state: FaultState::Normal,
            since: 0,
            debounce_ticks,
            latch_mask,
            last: FaultStatus::EMPTY,
            accumulated: FaultStatus::EMPTY,
            log: FaultLog::new(),
        }
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub fn is_normal(&self) -> bool {
        self.state == FaultState::Normal
    }

    /// Most recent snapshot fed to the monitor.
    pub fn last_status(&self) -> FaultStatus {
        self.last
    }

    /// Every bit seen asserted since the last successful clear.
    pub fn accumulated(&self) -> FaultStatus {
        self.accumulated
    }

    pub fn log(&self) -> &FaultLog {
        &self.log
    }

    pub fn debounce_ticks(&self) -> u32 {
        self.debounce_ticks
    }

    /// Feeds a polled or interrupt-sourced snapshot.
    pub fn observe<S: SafeState>(
        &mut self,
        status: FaultStatus,
        now: u32,
        outputs: &mut S,
    ) -> Transition {
        self.record(status, now);
        let latching = status.masked(self.latch_mask);

        match self.state {
            FaultState::Normal | FaultState::Recovering if latching.is_fault() => {
                self.latch(latching, outputs);
                Transition::Latched
            }
            FaultState::Recovering if now.wrapping_sub(self.since) >= self.debounce_ticks => {
                self.state = FaultState::Normal;
                info!("fault recovery complete");
                Transition::Recovered
            }
            FaultState::FaultLatched => {
                self.accumulated = self.accumulated.union(latching);
                Transition::None
            }
            _ => Transition::None,
        }
    }

    /// Latches unconditionally, whatever the snapshot holds. Used for faults the HAL raises
    /// itself and for bits drained from a [`FaultLine`].
    pub fn trip<S: SafeState>(
        &mut self,
        status: FaultStatus,
        now: u32,
        outputs: &mut S,
    ) -> Transition {
        self.record(status, now);
        if self.state == FaultState::FaultLatched {
            // re-assert the safe state
            outputs.force_safe();
            self.accumulated = self.accumulated.union(status);
            return Transition::None;
        }
        self.latch(status, outputs);
        Transition::Latched
    }

    /// Moves `FaultLatched` to `Recovering` if `confirmed` (a fresh register read) shows no
    /// latching condition. Does nothing in the other states.
    pub fn request_clear(
        &mut self,
        confirmed: FaultStatus,
        now: u32,
    ) -> Result<Transition, HalError> {
        if self.state != FaultState::FaultLatched {
            return Ok(Transition::None);
        }
        self.record(confirmed, now);
        let latching = confirmed.masked(self.latch_mask);
        if latching.is_fault() {
            self.accumulated = self.accumulated.union(latching);
            debug!("clear refused, fault still asserted: {:?}", latching);
            return Err(HalError::FaultLatched);
        }
        self.state = FaultState::Recovering;
        self.since = now;
        self.accumulated = FaultStatus::EMPTY;
        info!("fault cleared, debouncing for {} ticks", self.debounce_ticks);
        Ok(Transition::Recovering)
    }

    fn record(&mut self, status: FaultStatus, now: u32) {
        if status.newly_asserted(self.last).is_fault() {
            self.log.push(now, status);
        }
        self.last = status;
    }

    fn latch<S: SafeState>(&mut self, status: FaultStatus, outputs: &mut S) {
        outputs.force_safe();
        self.state = FaultState::FaultLatched;
        self.accumulated = self.accumulated.union(status);
        warn!("fault latched: {:?}", status);
    }
}
