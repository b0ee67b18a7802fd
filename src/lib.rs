//! Decompressor for self-extracting DOS executables packed with LZEXE 0.90
//! and 0.91.
//!
//! The work is split into layers:
//!
//! * `address`: real-mode segment:offset addresses and their flat
//!   equivalents.
//! * `memory`: a bounds-checked emulation of the 1 MiB real-mode address
//!   space.
//! * `lz`: the LZEXE compressed stream.
//! * `reloc`: the packed relocation tables of the two LZEXE versions.
//! * `exe`: reading and writing MZ executables.
//! * `lzexe`: recognizing packed executables and putting the above together.
//!
//! # Decompression
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! let mut input = BufReader::new(File::open("packed.exe")?);
//! let packed = unlzexe::exe::Exe::read(&mut input, None)?;
//! let unpacked = unlzexe::lzexe::unpack(&packed)?;
//! unpacked.write(&mut File::create("unpacked.exe")?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Inconsistencies
//!
//! Doesn't try to be bug-compatible with the LZEXE stub. Known differences:
//!
//! * The stub does not check anything while it decompresses. Here, a
//!   back-reference before the start of the program, output past the end of
//!   memory, or a relocation outside the decompressed program are errors.
//! * The 0.90 stub checksum is not verified.

pub mod address;
pub mod exe;
pub mod lz;
pub mod lzexe;
pub mod memory;
pub mod reloc;

pub use address::{FlatAddress, RealModeAddress};
pub use lzexe::{decompress, unpack, CompressedInput, DecompressionOutput, Error};
pub use memory::{Memory, RealModeMemory};
