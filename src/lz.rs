//! The LZEXE compressed stream.
//!
//! The stream interleaves 16-bit little-endian control words with data bytes.
//! Control bits are consumed least significant first, and a new control word
//! is read as soon as the last bit of the previous one has been used, so the
//! position of each control word depends on how many data bytes the preceding
//! tokens consumed.
//!
//! ```text
//! 1               <byte>          literal
//! 0 0 b1 b0       <d>             match, length 2 + b1b0, distance 0x100 - d
//! 0 1             <lo> <hi>       match, length 2 + (hi & 7),
//!                                 distance 0x2000 - (lo | (hi & 0xf8) << 5)
//! 0 1             <lo> <hi> <n>   when hi & 7 == 0: n == 0 ends the stream,
//!                                 n == 1 marks a segment boundary, otherwise
//!                                 length n + 1
//! ```
//!
//! Matches copy forward one byte at a time, so a distance shorter than the
//! length repeats the most recent bytes.

use log::{debug, trace};
use thiserror::Error;

use crate::address::RealModeAddress;
use crate::memory::{Memory, MemoryError, RealModeMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Output one byte.
    Literal(u8),
    /// Copy `length` bytes starting `distance` bytes behind the write position.
    Match { distance: u16, length: u16 },
    /// The decompression stub renormalizes its segment registers here. Produces
    /// no output.
    SegmentBoundary,
    /// End of the compressed stream.
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("compressed stream ends at offset {offset} in the middle of a token")]
    TruncatedStream { offset: usize },
    #[error("back-reference at stream offset {offset} reaches {distance} bytes back, but only {produced} bytes have been produced")]
    InvalidBackReference { offset: usize, distance: u16, produced: usize },
    #[error("writing decompressed byte {position}: {err}")]
    Memory { position: usize, #[source] err: MemoryError },
}

/// Splits a compressed stream into `Token`s.
///
/// As an `Iterator`, yields tokens up to and including `Token::End`, or up to
/// the first error.
pub struct Tokens<'a> {
    input: &'a [u8],
    pos: usize,
    bits: u16,
    // Bits remaining in `bits`. 0 only when a refill failed.
    count: u8,
    done: bool,
}

impl<'a> Tokens<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let mut tokens = Self { input, pos: 0, bits: 0, count: 0, done: false };
        tokens.refill();
        tokens
    }

    /// The offset in the input of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn refill(&mut self) {
        match self.input.get(self.pos..self.pos + 2) {
            Some(word) => {
                self.bits = u16::from_le_bytes([word[0], word[1]]);
                self.count = 16;
                self.pos += 2;
            }
            // Not an error until somebody asks for the next bit.
            None => self.count = 0,
        }
    }

    fn bit(&mut self) -> Result<u16, DecodeError> {
        if self.count == 0 {
            return Err(DecodeError::TruncatedStream { offset: self.pos });
        }
        let b = self.bits & 1;
        self.bits >>= 1;
        self.count -= 1;
        if self.count == 0 {
            self.refill();
        }
        Ok(b)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.input.get(self.pos)
            .ok_or(DecodeError::TruncatedStream { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    /// Decodes the next token.
    pub fn next_token(&mut self) -> Result<Token, DecodeError> {
        if self.bit()? == 1 {
            return Ok(Token::Literal(self.byte()?));
        }
        if self.bit()? == 0 {
            let length = (self.bit()? << 1 | self.bit()?) + 2;
            let distance = 0x100 - u16::from(self.byte()?);
            return Ok(Token::Match { distance, length });
        }
        let lo = u16::from(self.byte()?);
        let hi = u16::from(self.byte()?);
        let distance = 0x2000 - (lo | (hi & 0xf8) << 5);
        let length = match hi & 0x07 {
            0 => match self.byte()? {
                0 => return Ok(Token::End),
                1 => return Ok(Token::SegmentBoundary),
                n => u16::from(n) + 1,
            },
            n => n + 2,
        };
        Ok(Token::Match { distance, length })
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Token, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let token = self.next_token();
        self.done = !matches!(token, Ok(Token::Literal(_)) | Ok(Token::Match { .. }) | Ok(Token::SegmentBoundary));
        Some(token)
    }
}

/// The result of a successful `decompress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    /// Number of bytes written to memory.
    pub len: usize,
    /// Number of compressed bytes consumed, including the end marker.
    pub consumed: usize,
}

/// Returns the address `n` bytes past `start`.
fn output_address(start: RealModeAddress, n: usize) -> Result<RealModeAddress, MemoryError> {
    u32::try_from(n).ok()
        .and_then(|n| start.advance(n))
        .ok_or(MemoryError::OutOfBounds { flat: start.linear().saturating_add(n as u32), width: 1 })
}

/// Decompresses `input` into `memory`, starting at `start`. Decompression
/// stops at the stream's end marker; anything in `input` after that is
/// ignored.
pub fn decompress<M>(input: &[u8], memory: &mut M, start: RealModeAddress) -> Result<Expansion, DecodeError>
where
    M: Memory<Address = RealModeAddress> + ?Sized,
{
    let mut tokens = Tokens::new(input);
    let mut produced: usize = 0;
    loop {
        let offset = tokens.position();
        match tokens.next_token()? {
            Token::Literal(b) => {
                output_address(start, produced)
                    .and_then(|address| memory.write_u8(address, b))
                    .map_err(|err| DecodeError::Memory { position: produced, err })?;
                produced += 1;
            }
            Token::Match { distance, length } => {
                if usize::from(distance) > produced {
                    return Err(DecodeError::InvalidBackReference { offset, distance, produced });
                }
                for _ in 0..length {
                    output_address(start, produced - usize::from(distance))
                        .and_then(|address| memory.read_u8(address))
                        .and_then(|b| {
                            output_address(start, produced)
                                .and_then(|address| memory.write_u8(address, b))
                        })
                        .map_err(|err| DecodeError::Memory { position: produced, err })?;
                    produced += 1;
                }
            }
            Token::SegmentBoundary => {
                trace!("segment boundary at stream offset {}, output {}", offset, produced);
            }
            Token::End => break,
        }
    }
    debug!("decompressed {} bytes into {} bytes at {}", tokens.position(), produced, start);
    Ok(Expansion { len: produced, consumed: tokens.position() })
}

/// Decompresses `input` and returns the decompressed bytes.
pub fn decompress_to_vec(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut memory = RealModeMemory::new();
    let expansion = decompress(input, &mut memory, RealModeAddress::new(0, 0))?;
    let mut output = memory.snapshot();
    output.truncate(expansion.len);
    Ok(output)
}
