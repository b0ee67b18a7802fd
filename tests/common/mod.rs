//! Builds LZEXE-packed executables for tests.
//!
//! The packer here produces the same file layout as LZEXE, but with a stub
//! that is only filler bytes: enough for the decompressor, which never runs
//! the stub.

#![allow(dead_code)]

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path;

use unlzexe::exe;
use unlzexe::lzexe::Version;
use unlzexe::RealModeAddress;

/// Writes a compressed stream token by token.
pub struct Stream {
    out: Vec<u8>,
    // Index in `out` of the control word being filled.
    slot: usize,
    nbits: u32,
}

impl Stream {
    pub fn new() -> Self {
        Self { out: vec![0, 0], slot: 0, nbits: 0 }
    }

    fn bit(&mut self, b: u16) {
        let word = u16::from_le_bytes([self.out[self.slot], self.out[self.slot + 1]]) | (b << self.nbits);
        self.out[self.slot..self.slot + 2].clone_from_slice(&word.to_le_bytes());
        self.nbits += 1;
        if self.nbits == 16 {
            self.slot = self.out.len();
            self.out.extend_from_slice(&[0, 0]);
            self.nbits = 0;
        }
    }

    pub fn literal(&mut self, b: u8) {
        self.bit(1);
        self.out.push(b);
    }

    pub fn short(&mut self, distance: usize, length: usize) {
        assert!((1..=0x100).contains(&distance) && (2..=5).contains(&length));
        self.bit(0);
        self.bit(0);
        self.bit(((length - 2) >> 1) as u16);
        self.bit(((length - 2) & 1) as u16);
        self.out.push((0x100 - distance) as u8);
    }

    pub fn long(&mut self, distance: usize, length: usize) {
        assert!((1..=0x2000).contains(&distance) && (3..=0x100).contains(&length));
        let field = 0x2000 - distance;
        self.bit(0);
        self.bit(1);
        self.out.push(field as u8);
        if length <= 9 {
            self.out.push((field >> 5) as u8 & 0xf8 | (length - 2) as u8);
        } else {
            self.out.push((field >> 5) as u8 & 0xf8);
            self.out.push((length - 1) as u8);
        }
    }

    pub fn segment_boundary(&mut self) {
        self.bit(0);
        self.bit(1);
        self.out.extend_from_slice(&[0x00, 0x00, 0x01]);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bit(0);
        self.bit(1);
        self.out.extend_from_slice(&[0x00, 0x00, 0x00]);
        self.out
    }
}

/// Returns the longest earlier match for `data[pos..]` as `(distance,
/// length)`.
fn longest_match(data: &[u8], pos: usize) -> (usize, usize) {
    let max_len = (data.len() - pos).min(0x100);
    let mut best = (0, 0);
    for distance in 1..=pos.min(0x2000) {
        let len = (0..max_len)
            .take_while(|&i| data[pos - distance + i] == data[pos + i])
            .count();
        if len > best.1 {
            best = (distance, len);
        }
    }
    best
}

/// Greedily compresses `data`, with a segment boundary marker after every
/// 0x1000 bytes of output.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut stream = Stream::new();
    let mut pos = 0;
    let mut next_boundary = 0x1000;
    while pos < data.len() {
        let (distance, length) = longest_match(data, pos);
        if length >= 2 && length <= 5 && distance <= 0x100 {
            stream.short(distance, length);
            pos += length;
        } else if length >= 3 {
            stream.long(distance, length);
            pos += length;
        } else {
            stream.literal(data[pos]);
            pos += 1;
        }
        if pos >= next_boundary {
            stream.segment_boundary();
            next_boundary += 0x1000;
        }
    }
    stream.finish()
}

/// A program to be packed.
pub struct Program {
    pub code: Vec<u8>,
    /// Flat offsets of segment words in `code`, ascending.
    pub relocs: Vec<u32>,
    pub cs: u16,
    pub ip: u16,
    pub ss: u16,
    pub sp: u16,
    pub minalloc: u16,
    pub maxalloc: u16,
}

impl Program {
    pub fn relocs(&self) -> Vec<RealModeAddress> {
        self.relocs.iter()
            .map(|&flat| RealModeAddress::new((flat >> 4) as u16, (flat & 0xf) as u16))
            .collect()
    }
}

/// Something that looks a little like machine code: runs of repeated
/// instructions, with some noise in between.
pub fn sample_program(len: usize) -> Program {
    let mut code = Vec::with_capacity(len);
    let mut x: u32 = 12345;
    while code.len() < len {
        x = x.wrapping_mul(1103515245).wrapping_add(12345);
        match (x >> 16) % 4 {
            0 => code.extend_from_slice(b"\xb8\x00\x00\x8e\xd8\xba\x10\x00\xb4\x09\xcd\x21"),
            1 => code.extend(std::iter::repeat(0x90).take((x >> 24) as usize % 40)),
            _ => code.push((x >> 8) as u8),
        }
    }
    code.truncate(len);
    let relocs: Vec<u32> = (0..len as u32 - 2).step_by(997).map(|i| i + 1).collect();
    Program {
        code,
        relocs,
        cs: 0x0010,
        ip: 0x0100,
        ss: (len / 16) as u16 + 1,
        sp: 0x0200,
        minalloc: 0x0100,
        maxalloc: 0xffff,
    }
}

pub fn relocation_table(version: Version, relocs: &[u32]) -> Vec<u8> {
    let mut table = Vec::new();
    match version {
        Version::V090 => {
            for group in 0..16 {
                let offsets: Vec<u16> = relocs.iter()
                    .filter(|&&flat| flat >> 16 == group)
                    .map(|&flat| flat as u16)
                    .collect();
                table.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
                for offset in offsets {
                    table.extend_from_slice(&offset.to_le_bytes());
                }
            }
        }
        Version::V091 => {
            let mut prev = 0;
            for &flat in relocs {
                let span = flat - prev;
                assert!(span <= 0xffff);
                if span > 0 && span < 0x100 {
                    table.push(span as u8);
                } else {
                    table.push(0);
                    table.extend_from_slice(&(span as u16).to_le_bytes());
                }
                prev = flat;
            }
            table.extend_from_slice(&[0x00, 0x01, 0x00]);
        }
    }
    table
}

/// Extra paragraphs the packed program claims to need.
pub const INCREASE_PARAGRAPHS: u16 = 0x0020;

/// Packs `program` into the bytes of an executable file.
pub fn pack(version: Version, program: &Program) -> Vec<u8> {
    let mut body = compress(&program.code);
    body.resize((body.len() + 15) / 16 * 16, 0);
    let cs = (body.len() / 16) as u16;
    let table = relocation_table(version, &program.relocs);
    let stub_len = (version.relocation_offset() + table.len()) as u16;
    let variables = [program.ip, program.cs, program.sp, program.ss, cs, INCREASE_PARAGRAPHS, stub_len, 0];
    for w in &variables[..version.header_len() / 2] {
        body.extend_from_slice(&w.to_le_bytes());
    }
    body.resize(usize::from(cs) * 16 + version.relocation_offset(), 0x90);
    body.extend_from_slice(&table);

    let (e_cblp, e_cp) = exe::encode_exe_len(32 + body.len()).unwrap();
    let header = [
        0x5a4d, e_cblp, e_cp, 0, 2,
        program.minalloc, program.maxalloc,
        cs + 0x0030, 0x0080, 0,
        version.header_len() as u16, cs,
        0x001c, 0,
    ];
    let mut buf = Vec::new();
    for w in &header {
        buf.extend_from_slice(&w.to_le_bytes());
    }
    buf.extend_from_slice(version.signature());
    buf.extend_from_slice(&body);
    buf
}

pub fn store_u16le(buf: &mut [u8], i: usize, v: u16) {
    buf[i..i + 2].clone_from_slice(&u16::to_le_bytes(v));
}

pub fn read_exe(buf: &[u8]) -> Result<exe::Exe, exe::Error> {
    exe::Exe::read(&mut io::Cursor::new(buf), Some(buf.len() as u64))
}

pub fn save_exe<P: AsRef<path::Path>>(path: P, contents: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let f = fs::File::create(path)?;
    let mut w = io::BufWriter::new(f);
    w.write_all(contents)?;
    w.flush()?;
    Ok(())
}

// call save_exe if the environment variable UNLZEXE_TEST_SAVE_EXE is set.
pub fn maybe_save_exe<P: AsRef<path::Path>>(path: P, contents: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("UNLZEXE_TEST_SAVE_EXE").is_some() {
        save_exe(path, contents)?;
    }
    Ok(())
}
