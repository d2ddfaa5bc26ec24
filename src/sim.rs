//! In-memory DRV8301 model used as a [`ControlBus`](crate::ControlBus) in tests and on the
//! bench without hardware.
//!
//! Fault conditions latch into Status Register 1 and stay there until `GATE_RESET` is written
//! after the condition has gone away, as on the real part.

use crate::fault::FaultStatus;
use crate::registers::{RegisterAddress, RegisterValue};
use crate::{BusError, Direction};

const GATE_RESET: u16 = 1 << 2;
const STATUS1_FAULT_BITS: u16 = 0x03FF;
const STATUS1_FAULT_SUMMARY: u16 = 1 << 10;
const OTW: u16 = 1 << 6;
const STATUS2_GVDD_OV: u16 = 1 << 7;

#[derive(Debug, Clone)]
pub struct SimulatedBus {
    control: [u16; 2],
    active: u16,
    latched: u16,
    gvdd_ov_active: bool,
    gvdd_ov_latched: bool,
    device_id: u8,
    pending_failures: u8,
    failure: BusError,
    transactions: u32,
}

impl SimulatedBus {
    pub const DEVICE_ID: u8 = 0x1;

    pub const fn new() -> Self {
        Self {
            control: [0; 2],
            active: 0,
            latched: 0,
            gvdd_ov_active: false,
            gvdd_ov_latched: false,
            device_id: Self::DEVICE_ID,
            pending_failures: 0,
            failure: BusError::Timeout,
            transactions: 0,
        }
    }

    /// Makes the gate-driver-side bits of `status` an active, latching condition. HAL-only
    /// bits (shunt limit, bus watchdog, external pin) have no register and are ignored.
    pub fn inject_fault(&mut self, status: FaultStatus) {
        let bits = status.bits() as u16 & STATUS1_FAULT_BITS;
        self.active |= bits;
        self.latched |= bits;
        if status.overvoltage() {
            self.gvdd_ov_active = true;
            self.gvdd_ov_latched = true;
        }
    }

    /// The physical condition goes away; the latched bits stay until `GATE_RESET`.
    pub fn clear_fault_condition(&mut self) {
        self.active = 0;
        self.gvdd_ov_active = false;
    }

    /// The next `count` transactions fail with `error`.
    pub fn fail_next(&mut self, count: u8, error: BusError) {
        self.pending_failures = count;
        self.failure = error;
    }

    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    /// Current register contents, without a bus transaction.
    pub fn peek(&self, address: RegisterAddress) -> u16 {
        match address {
            RegisterAddress::Status1 => {
                let bits = self.latched | self.active;
                let summary = bits & !OTW != 0 || self.gvdd_ov_latched;
                if summary {
                    bits | STATUS1_FAULT_SUMMARY
                } else {
                    bits
                }
            }
            RegisterAddress::Status2 => {
                let ov = if self.gvdd_ov_latched {
                    STATUS2_GVDD_OV
                } else {
                    0
                };
                (self.device_id as u16 & 0x0F) | ov
            }
            RegisterAddress::Control1 => self.control[0],
            RegisterAddress::Control2 => self.control[1],
        }
    }

    /// One register transaction, as seen by the driver after framing.
    pub fn exchange(
        &mut self,
        address: u8,
        direction: Direction,
        data: u16,
    ) -> Result<u16, BusError> {
        self.transactions = self.transactions.wrapping_add(1);
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(self.failure);
        }
        let register = RegisterAddress::try_from(address).map_err(|_| BusError::FrameError)?;
        let data = data & RegisterValue::MASK;

        match (direction, register) {
            (Direction::Read, _) => Ok(self.peek(register)),
            // writes to status registers are ignored by the part
            (Direction::Write, RegisterAddress::Status1 | RegisterAddress::Status2) => Ok(0),
            (Direction::Write, RegisterAddress::Control1) => {
                if data & GATE_RESET != 0 {
                    self.latched = self.active;
                    self.gvdd_ov_latched = self.gvdd_ov_active;
                }
                self.control[0] = data & !GATE_RESET;
                Ok(0)
            }
            (Direction::Write, RegisterAddress::Control2) => {
                self.control[1] = data;
                Ok(0)
            }
        }
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}
