//! Decompressor for self-extracting DOS executables packed with LZEXE.
//!
//! An LZEXE-packed executable is an MZ file whose load module holds the
//! compressed program followed by a decompression stub. The stub starts at
//! `cs:0000` with a block of variables (see `Header`), continues with the
//! decompression code, and ends with the relocation table of the original
//! program, packed in a version-specific way. The MZ header itself is always
//! two paragraphs long, has no relocations of its own, and carries the
//! signature `"LZ09"` (version 0.90) or `"LZ91"` (version 0.91) where its
//! relocation table would otherwise start.
//!
//! ```text
//! +-----------+----------------------+-----------+------+--------------+
//! | MZ header | compressed program   | variables | code | relocations  |
//! +-----------+----------------------+-----------+------+--------------+
//!             ^                      ^
//!             (cs - compressed) * 16 cs:0000
//! ```
//!
//! # Decompression
//!
//! `CompressedInput::from_exe` locates the regions of a packed `exe::Exe`.
//! `decompress` checks the signature, expands the compressed program into an
//! emulated real-mode memory, and decodes the relocation table, producing a
//! `DecompressionOutput`. `unpack` does all of that and builds an
//! uncompressed `exe::Exe` from the result.
//!
//! # References
//!
//! * <https://bellard.org/lzexe.html>

use log::{debug, warn};
use thiserror::Error;

use crate::address::RealModeAddress;
use crate::exe;
use crate::lz::{self, DecodeError};
use crate::memory::{Memory, MemoryError, RealModeMemory};
use crate::reloc::{self, RelocError};

/// Offset of the signature in the MZ header. LZEXE points `e_lfarlc` here.
pub const SIGNATURE_OFFSET: u16 = 0x1c;

/// Length of the MZ header of a packed executable: two paragraphs.
const PACKED_HEADER_LEN: usize = 32;

/// Memory, in paragraphs, that the stub reserves beyond what it declares in
/// `Header::increase_paragraphs` and `Header::stub_len`.
const STUB_RESERVED_PARAGRAPHS: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V090,
    V091,
}

impl Version {
    pub fn from_signature(signature: &[u8]) -> Option<Self> {
        match signature {
            b"LZ09" => Some(Version::V090),
            b"LZ91" => Some(Version::V091),
            _ => None,
        }
    }

    pub fn signature(self) -> &'static [u8; 4] {
        match self {
            Version::V090 => b"LZ09",
            Version::V091 => b"LZ91",
        }
    }

    /// Length of the variables at `cs:0000`.
    pub fn header_len(self) -> usize {
        match self {
            Version::V090 => 16,
            Version::V091 => 14,
        }
    }

    /// Offset of the relocation table from `cs:0000`.
    pub fn relocation_offset(self) -> usize {
        match self {
            Version::V090 => 0x19d,
            Version::V091 => 0x158,
        }
    }

    pub fn relocation_format(self) -> reloc::Format {
        match self {
            Version::V090 => reloc::Format::Grouped,
            Version::V091 => reloc::Format::Packed,
        }
    }
}

/// Reasons an executable is not recognized as LZEXE-packed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotPacked {
    #[error("MZ header is {len} bytes, expected {expected}", expected = PACKED_HEADER_LEN)]
    HeaderLength { len: usize },
    #[error("relocation table offset is {0:#06x}, expected {expected:#06x}", expected = SIGNATURE_OFFSET)]
    RelocationTableOffset(u16),
    #[error("overlay number is {0}, expected 0")]
    Overlay(u16),
    #[error("the packed executable has {0} relocations of its own")]
    Relocations(usize),
    #[error("unknown signature {0:02x?}")]
    Signature([u8; 4]),
    #[error("{paragraphs} paragraphs of compressed data do not fit below cs={cs:#06x}")]
    CompressedLength { paragraphs: u16, cs: u16 },
    #[error("stub of {len} bytes is too short; expected at least {needed}")]
    StubTooShort { len: usize, needed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("not an LZEXE executable, or a corrupt one: {0}")]
    NotPackedOrCorrupt(#[from] NotPacked),
    #[error("LZEXE variables at offset {offset:#x} extend past the end of the file ({len} bytes)")]
    HeaderPastEndOfFile { offset: usize, len: usize },
    #[error("compressed stream ends in the middle of a token at offset {offset}")]
    TruncatedStream { offset: usize },
    #[error("back-reference at stream offset {offset} reaches {distance} bytes back, but only {produced} bytes have been produced")]
    InvalidBackReference { offset: usize, distance: u16, produced: usize },
    #[error("decompressed byte {position} does not fit in memory: {err}")]
    InvalidAddress { position: usize, #[source] err: MemoryError },
    #[error("corrupt relocation table: {0}")]
    CorruptRelocationTable(#[from] RelocError),
    #[error("relocation {address} lies outside the decompressed program")]
    RelocationOutsideImage { address: RealModeAddress },
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::TruncatedStream { offset } => Error::TruncatedStream { offset },
            DecodeError::InvalidBackReference { offset, distance, produced } =>
                Error::InvalidBackReference { offset, distance, produced },
            DecodeError::Memory { position, err } => Error::InvalidAddress { position, err },
        }
    }
}

/// The variables at `cs:0000`, all little-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Entry point of the original program.
    pub real_ip: u16,
    pub real_cs: u16,
    /// Initial stack of the original program.
    pub real_sp: u16,
    pub real_ss: u16,
    /// Paragraphs of compressed data immediately below `cs:0000`.
    pub compressed_paragraphs: u16,
    /// Extra paragraphs the stub needs to expand the program in place.
    pub increase_paragraphs: u16,
    /// Size of the stub in bytes.
    pub stub_len: u16,
    /// 0.90 only. Not verified.
    pub checksum: Option<u16>,
}

impl Header {
    pub fn parse(stub: &[u8], version: Version) -> Result<Self, NotPacked> {
        let needed = version.header_len();
        let buf = stub.get(..needed).ok_or(NotPacked::StubTooShort { len: stub.len(), needed })?;
        let word = |i: usize| u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
        Ok(Self {
            real_ip: word(0),
            real_cs: word(1),
            real_sp: word(2),
            real_ss: word(3),
            compressed_paragraphs: word(4),
            increase_paragraphs: word(5),
            stub_len: word(6),
            checksum: match version {
                Version::V090 => Some(word(7)),
                Version::V091 => None,
            },
        })
    }
}

/// The parts of a packed executable that decompression works on.
#[derive(Debug, Clone, Copy)]
pub struct CompressedInput<'a> {
    /// Where in memory the decompressed program is assembled. Relocations are
    /// counted from this address, offset included.
    pub start: RealModeAddress,
    /// The 4 signature bytes from the MZ header.
    pub signature: [u8; 4],
    /// The compressed stream.
    pub data: &'a [u8],
    /// Everything from `cs:0000` to the end of the load module: variables,
    /// code, and relocation table.
    pub stub: &'a [u8],
}

impl<'a> CompressedInput<'a> {
    /// Locates the compressed stream and the stub of a packed `exe::Exe`.
    /// Fails with `Error::NotPackedOrCorrupt` if the MZ header does not have
    /// the shape LZEXE gives it.
    pub fn from_exe(exe: &'a exe::Exe, start: RealModeAddress) -> Result<Self, Error> {
        if !exe.relocs.is_empty() {
            return Err(NotPacked::Relocations(exe.relocs.len()).into());
        }
        let header_len = exe::HEADER_LEN as usize + exe.header_extra.len();
        if header_len != PACKED_HEADER_LEN {
            return Err(NotPacked::HeaderLength { len: header_len }.into());
        }
        if exe.e_lfarlc != SIGNATURE_OFFSET {
            return Err(NotPacked::RelocationTableOffset(exe.e_lfarlc).into());
        }
        if exe.e_ovno != 0 {
            return Err(NotPacked::Overlay(exe.e_ovno).into());
        }
        let mut signature = [0; 4];
        signature.copy_from_slice(&exe.header_extra[..4]);

        let stub_offset = usize::from(exe.e_cs) * 16;
        // The whole variable block must be present, not just the word read here.
        let needed = Version::from_signature(&signature).map_or(10, Version::header_len);
        let compressed_paragraphs = exe.body.get(stub_offset..stub_offset + needed)
            .map(|w| u16::from_le_bytes([w[8], w[9]]))
            .ok_or(Error::HeaderPastEndOfFile { offset: stub_offset, len: exe.body.len() })?;
        let data_offset = exe.e_cs.checked_sub(compressed_paragraphs)
            .ok_or(NotPacked::CompressedLength { paragraphs: compressed_paragraphs, cs: exe.e_cs })?;
        let data_offset = usize::from(data_offset) * 16;
        if data_offset > 0 {
            warn!("ignoring {} bytes before the compressed data", data_offset);
        }
        debug!("compressed data {:#x}..{:#x}, stub {:#x}..{:#x}",
            data_offset, stub_offset, stub_offset, exe.body.len());

        Ok(Self {
            start,
            signature,
            data: &exe.body[data_offset..stub_offset],
            stub: &exe.body[stub_offset..],
        })
    }
}

/// Decides whether a `CompressedInput` is something `decompress` can handle,
/// and which version of LZEXE produced it.
pub trait StubCheck {
    fn check(&self, input: &CompressedInput) -> Result<Version, NotPacked>;
}

/// Identifies the version by the signature in the MZ header, and checks that
/// the stub is long enough to contain the relocation table.
///
/// The 0.90 checksum is not verified.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureCheck;

impl StubCheck for SignatureCheck {
    fn check(&self, input: &CompressedInput) -> Result<Version, NotPacked> {
        let version = Version::from_signature(&input.signature)
            .ok_or(NotPacked::Signature(input.signature))?;
        let needed = version.relocation_offset();
        if input.stub.len() < needed {
            return Err(NotPacked::StubTooShort { len: input.stub.len(), needed });
        }
        Ok(version)
    }
}

/// The result of a successful `decompress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompressionOutput {
    /// Entry point, relative to the start of the program. Not relocated.
    pub code_start: RealModeAddress,
    /// Initial stack, relative to the start of the program. Not relocated.
    pub stack_start: RealModeAddress,
    /// Locations of segment words in the program, in table order, counted
    /// from `CompressedInput::start`.
    pub relocation_table: Vec<RealModeAddress>,
    /// The decompressed program.
    pub executable_code: Vec<u8>,
    pub version: Version,
    pub header: Header,
}

/// Decompresses `input`, accepting it if `SignatureCheck` does.
pub fn decompress(input: &CompressedInput) -> Result<DecompressionOutput, Error> {
    decompress_with(input, &SignatureCheck)
}

/// Decompresses `input`, accepting it if `check` does. Nothing is
/// decompressed if `check` fails.
pub fn decompress_with<C>(input: &CompressedInput, check: &C) -> Result<DecompressionOutput, Error>
where
    C: StubCheck + ?Sized,
{
    let version = check.check(input)?;
    let header = Header::parse(input.stub, version)?;
    debug!("LZEXE {:?} {:?}", version, header);

    let start = input.start.to_flat()
        .map_err(|err| Error::InvalidAddress { position: 0, err: MemoryError::Address { err, width: 1 } })?
        .get() as usize;
    let mut memory = RealModeMemory::new();
    let expansion = lz::decompress(input.data, &mut memory, input.start)?;
    if expansion.consumed < input.data.len() {
        debug!("{} bytes follow the end of the compressed stream", input.data.len() - expansion.consumed);
    }

    let relocs_offset = version.relocation_offset();
    let relocs_region = input.stub.get(relocs_offset..)
        .ok_or(NotPacked::StubTooShort { len: input.stub.len(), needed: relocs_offset })?;
    let (relocs_len, relocation_table) = reloc::extract(relocs_region, version.relocation_format(), input.start)?;
    debug!("relocation table at cs:{:04x}..cs:{:04x}", relocs_offset, relocs_offset + relocs_len);

    let end = start + expansion.len;
    for &address in relocation_table.iter() {
        let flat = address.linear() as usize;
        if flat < start || flat + 2 > end {
            return Err(Error::RelocationOutsideImage { address });
        }
    }

    let mut executable_code = memory.snapshot();
    executable_code.truncate(end);
    executable_code.drain(..start);

    Ok(DecompressionOutput {
        code_start: RealModeAddress::new(header.real_cs, header.real_ip),
        stack_start: RealModeAddress::new(header.real_ss, header.real_sp),
        relocation_table,
        executable_code,
        version,
        header,
    })
}

/// Returns `(e_minalloc, e_maxalloc)` for the unpacked program. The packed
/// one asks for enough extra memory to hold the stub and expand in place,
/// which the unpacked program does not need.
fn unpacked_alloc(e_minalloc: u16, e_maxalloc: u16, header: &Header) -> (u16, u16) {
    if e_maxalloc == 0 {
        return (e_minalloc, e_maxalloc);
    }
    let reserved = u32::from(header.increase_paragraphs)
        + (u32::from(header.stub_len) + 15) / 16
        + STUB_RESERVED_PARAGRAPHS;
    let minalloc = u32::from(e_minalloc).saturating_sub(reserved) as u16;
    let maxalloc = if e_maxalloc == 0xffff {
        e_maxalloc
    } else {
        e_maxalloc.saturating_sub(e_minalloc - minalloc)
    };
    (minalloc, maxalloc)
}

/// Unpacks an LZEXE-packed `exe::Exe` into an uncompressed `exe::Exe`.
pub fn unpack(exe: &exe::Exe) -> Result<exe::Exe, Error> {
    let input = CompressedInput::from_exe(exe, RealModeAddress::new(0, 0))?;
    let output = decompress(&input)?;
    let (e_minalloc, e_maxalloc) = unpacked_alloc(exe.e_minalloc, exe.e_maxalloc, &output.header);
    Ok(exe::Exe {
        e_minalloc,
        e_maxalloc,
        e_ss: output.stack_start.segment,
        e_sp: output.stack_start.offset,
        e_ip: output.code_start.offset,
        e_cs: output.code_start.segment,
        e_ovno: exe.e_ovno,
        e_lfarlc: exe::HEADER_LEN as u16,
        relocs: output.relocation_table,
        header_extra: Vec::new(),
        body: output.executable_code,
    })
}
