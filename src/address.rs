//! Real-mode segment:offset addresses and their flat equivalents.

use std::cmp;
use std::fmt;

use thiserror::Error;

/// Size of the real-mode address space, 1 MiB.
pub const ADDRESS_SPACE: u32 = 1 << 20;

/// An address that does not fit in the 20-bit real-mode address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("address {address} is outside the 1 MiB address space (flat {linear:#x})")]
pub struct AddressError {
    pub address: RealModeAddress,
    pub linear: u32,
}

/// A byte offset into the real-mode address space, always less than
/// `ADDRESS_SPACE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlatAddress(u32);

impl FlatAddress {
    pub fn new(linear: u32) -> Option<Self> {
        if linear < ADDRESS_SPACE {
            Some(FlatAddress(linear))
        } else {
            None
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FlatAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:05x}", self.0)
    }
}

/// A segment:offset far pointer.
///
/// Many different pairs name the same byte, so equality and ordering are
/// defined on the linear address rather than on the fields.
#[derive(Debug, Copy, Clone)]
pub struct RealModeAddress {
    pub segment: u16,
    pub offset: u16,
}

impl RealModeAddress {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// `segment * 16 + offset`, without any range check. The result is at most
    /// `0x10ffef`.
    pub fn linear(&self) -> u32 {
        u32::from(self.segment) * 16 + u32::from(self.offset)
    }

    /// Converts to a flat address, failing if the result would be 1 MiB or
    /// more. There is no wraparound at the top of memory.
    pub fn to_flat(&self) -> Result<FlatAddress, AddressError> {
        let linear = self.linear();
        FlatAddress::new(linear).ok_or(AddressError { address: *self, linear })
    }

    /// Returns the address `n` bytes past this one, normalized so that the
    /// offset is less than 16. Returns `None` if the segment would overflow.
    pub fn advance(&self, n: u32) -> Option<Self> {
        let offset = u32::from(self.offset).checked_add(n)?;
        let segment = u32::from(self.segment).checked_add(offset >> 4)?;
        Some(Self {
            segment: u16::try_from(segment).ok()?,
            offset: (offset & 0xf) as u16,
        })
    }
}

impl fmt::Display for RealModeAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

impl cmp::Ord for RealModeAddress {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.linear().cmp(&other.linear())
    }
}

impl cmp::PartialOrd for RealModeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::PartialEq for RealModeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.linear() == other.linear()
    }
}

impl cmp::Eq for RealModeAddress {}
