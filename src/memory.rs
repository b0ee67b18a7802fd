//! A bounds-checked emulation of the real-mode address space.
//!
//! All accesses go through `Memory`, addressed by segment:offset and checked
//! against the capacity of the backing store before anything is read or
//! written. Multi-byte values are little-endian.

use thiserror::Error;

use crate::address::{AddressError, RealModeAddress, ADDRESS_SPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The address itself does not fit in 20 bits.
    #[error("access of {width} bytes: {err}")]
    Address { #[source] err: AddressError, width: usize },
    /// The access starts at or runs past the end of memory.
    #[error("access of {width} bytes at flat address {flat:#x} is out of bounds")]
    OutOfBounds { flat: u32, width: usize },
}

impl MemoryError {
    /// The flat address of the failed access.
    pub fn flat(&self) -> u32 {
        match self {
            MemoryError::Address { err, .. } => err.linear,
            MemoryError::OutOfBounds { flat, .. } => *flat,
        }
    }
}

/// Byte-addressable memory with checked little-endian accessors.
///
/// Only the `_slice` methods need to be provided; the fixed-width accessors
/// are defined in terms of them.
pub trait Memory {
    type Address: Copy;

    /// Capacity in bytes.
    fn size(&self) -> usize;

    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    fn read_slice(&self, address: Self::Address, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copies `buf` into memory starting at `address`. Either all of `buf` is
    /// written or nothing is.
    fn write_slice(&mut self, address: Self::Address, buf: &[u8]) -> Result<(), MemoryError>;

    /// Returns an independent copy of the whole of memory.
    fn snapshot(&self) -> Vec<u8>;

    fn read_u8(&self, address: Self::Address) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read_slice(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: Self::Address) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read_slice(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: Self::Address) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read_slice(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: Self::Address) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read_slice(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, address: Self::Address, v: u8) -> Result<(), MemoryError> {
        self.write_slice(address, &[v])
    }

    fn write_u16(&mut self, address: Self::Address, v: u16) -> Result<(), MemoryError> {
        self.write_slice(address, &v.to_le_bytes())
    }

    fn write_u32(&mut self, address: Self::Address, v: u32) -> Result<(), MemoryError> {
        self.write_slice(address, &v.to_le_bytes())
    }

    fn write_u64(&mut self, address: Self::Address, v: u64) -> Result<(), MemoryError> {
        self.write_slice(address, &v.to_le_bytes())
    }
}

/// The 1 MiB real-mode address space, as one contiguous zero-initialized
/// allocation.
pub struct RealModeMemory {
    buf: Box<[u8]>,
}

impl RealModeMemory {
    pub fn new() -> Self {
        Self::with_capacity(ADDRESS_SPACE as usize)
    }

    /// A smaller memory, for when only the bottom `capacity` bytes of the
    /// address space are needed. Addresses at or above `capacity` are out of
    /// bounds. `capacity` is clamped to 1 MiB.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(ADDRESS_SPACE as usize);
        Self { buf: vec![0; capacity].into_boxed_slice() }
    }

    /// Returns the index range `[flat, flat + width)` after checking it lies
    /// within `buf`.
    fn range(&self, address: RealModeAddress, width: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let flat = address.to_flat().map_err(|err| MemoryError::Address { err, width })?.get();
        let start = flat as usize;
        match start.checked_add(width) {
            Some(end) if end <= self.buf.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { flat, width }),
        }
    }
}

impl Default for RealModeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory for RealModeMemory {
    type Address = RealModeAddress;

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn read_slice(&self, address: RealModeAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.buf[range]);
        Ok(())
    }

    fn write_slice(&mut self, address: RealModeAddress, buf: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        self.buf[range].copy_from_slice(buf);
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
