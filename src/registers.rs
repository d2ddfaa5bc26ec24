//! Raw register view of the DRV8301: the fixed address enumeration, 11-bit register values,
//! write validation, and the shadow copy kept by the register interface.

use crate::HalError;

/// The four DRV8301 registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RegisterAddress {
    Status1 = 0x00,
    Status2 = 0x01,
    Control1 = 0x02,
    Control2 = 0x03,
}

impl RegisterAddress {
    pub const ALL: [RegisterAddress; 4] = [
        RegisterAddress::Status1,
        RegisterAddress::Status2,
        RegisterAddress::Control1,
        RegisterAddress::Control2,
    ];

    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, RegisterAddress::Control1 | RegisterAddress::Control2)
    }

    /// Bits that may be set in a write to this register. Zero for read-only registers.
    pub const fn writable_mask(self) -> u16 {
        match self {
            RegisterAddress::Status1 | RegisterAddress::Status2 => 0,
            // D2 is GATE_RESET, which self-clears; resets go through `reset_gate_faults`
            RegisterAddress::Control1 => 0x07FB,
            // D10:D7 reserved
            RegisterAddress::Control2 => 0x007F,
        }
    }

    /// Checks `value` for a write to this register.
    ///
    /// Rejects read-only registers, bits outside the writable mask (which excludes
    /// `GATE_RESET`), and the reserved `GATE_CURRENT = 0b11` and `OCTW_MODE = 0b11` encodings.
    pub fn validate_write(self, value: RegisterValue) -> Result<(), HalError> {
        let bits = value.bits();
        if !self.is_writable() || bits & !self.writable_mask() != 0 {
            return Err(HalError::InvalidRegister);
        }
        match self {
            RegisterAddress::Control1 | RegisterAddress::Control2 if bits & 0b11 == 0b11 => {
                Err(HalError::InvalidRegister)
            }
            _ => Ok(()),
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for RegisterAddress {
    type Error = HalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(RegisterAddress::Status1),
            0x01 => Ok(RegisterAddress::Status2),
            0x02 => Ok(RegisterAddress::Control1),
            0x03 => Ok(RegisterAddress::Control2),
            _ => Err(HalError::InvalidRegister),
        }
    }
}

/// An 11-bit DRV8301 register payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterValue(u16);

impl RegisterValue {
    pub const MASK: u16 = 0x07FF;

    /// Fails with [`HalError::InvalidRegister`] if `bits` does not fit in 11 bits.
    pub const fn new(bits: u16) -> Result<Self, HalError> {
        if bits & !Self::MASK != 0 {
            Err(HalError::InvalidRegister)
        } else {
            Ok(Self(bits))
        }
    }

    pub(crate) const fn from_bus(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for RegisterValue {
    type Error = HalError;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        Self::new(bits)
    }
}

impl From<RegisterValue> for u16 {
    fn from(value: RegisterValue) -> Self {
        value.0
    }
}

/// Last value exchanged on the bus for each register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterSet {
    values: [Option<RegisterValue>; 4],
}

impl RegisterSet {
    pub const fn new() -> Self {
        Self { values: [None; 4] }
    }

    /// `None` until the register has been read or written through the raw interface.
    pub fn get(&self, address: RegisterAddress) -> Option<RegisterValue> {
        self.values[address.index()]
    }

    pub(crate) fn record(&mut self, address: RegisterAddress, value: RegisterValue) {
        self.values[address.index()] = Some(value);
    }

    pub(crate) fn invalidate(&mut self, address: RegisterAddress) {
        self.values[address.index()] = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegisterAddress, Option<RegisterValue>)> + '_ {
        RegisterAddress::ALL
            .into_iter()
            .map(|address| (address, self.get(address)))
    }
}
