//! Packed relocation tables.
//!
//! LZEXE stores the relocations of the original program after its
//! decompression stub, in one of two encodings. Both describe addresses in
//! ascending order, and both occasionally have to move the base segment
//! forward (a "carry") because a 16-bit offset cannot reach the whole image.
//! Offsets within a group are strictly ascending, groups are 64 KiB apart,
//! spans are at least 1 and carries only move forward, so the decoded
//! addresses of either encoding are strictly increasing and never repeat.
//!
//! # References
//!
//! * <https://bellard.org/lzexe.html>

use log::debug;
use thiserror::Error;

use crate::address::{AddressError, RealModeAddress};

/// The most carries a table may contain. Each carry moves the base at least
/// 0xfff0 bytes further, so more than this cannot describe a location inside
/// 1 MiB.
pub const MAX_CARRIES: usize = 16;

/// How a relocation table is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// LZEXE 0.90: 16 groups, one per 64 KiB of the image. Each group is a
    /// 16-bit count followed by that many 16-bit offsets. Moving to the next
    /// group advances the segment by 0x1000.
    Grouped,
    /// LZEXE 0.91: a byte span from the previous relocation. A zero byte is an
    /// escape followed by a 16-bit word: 0 advances the segment by 0x0fff, 1
    /// ends the table, anything else is a span.
    Packed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocError {
    #[error("relocation table ends unexpectedly at byte {position}")]
    Truncated { position: usize },
    #[error("relocation offset {offset:#06x} at byte {position} does not follow {previous:#06x}")]
    NotAscending { position: usize, previous: u16, offset: u16 },
    #[error("relocation table advances the segment more than {max} times at byte {position}", max = MAX_CARRIES)]
    TooManyCarries { position: usize },
    #[error("relocation segment overflows at byte {position}")]
    SegmentOverflow { position: usize },
    #[error("relocation at byte {position}: {err}")]
    Address { position: usize, #[source] err: AddressError },
}

impl RelocError {
    /// The byte position in the table where the problem was found.
    pub fn position(&self) -> usize {
        match *self {
            RelocError::Truncated { position }
            | RelocError::NotAscending { position, .. }
            | RelocError::TooManyCarries { position }
            | RelocError::SegmentOverflow { position }
            | RelocError::Address { position, .. } => position,
        }
    }
}

/// A cursor over the table bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, RelocError> {
        let b = *self.buf.get(self.pos).ok_or(RelocError::Truncated { position: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16le(&mut self) -> Result<u16, RelocError> {
        let bytes = self.buf.get(self.pos..self.pos + 2)
            .ok_or(RelocError::Truncated { position: self.pos })?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

/// Builds an entry, rejecting one whose segment no longer fits in 16 bits or
/// that falls outside the address space.
fn entry(position: usize, segment: u32, offset: u16) -> Result<RealModeAddress, RelocError> {
    let segment = u16::try_from(segment).or(Err(RelocError::SegmentOverflow { position }))?;
    let address = RealModeAddress::new(segment, offset);
    address.to_flat().map_err(|err| RelocError::Address { position, err })?;
    Ok(address)
}

/// Decodes the relocation table at the beginning of `buf`. Entries are
/// counted from `base`, the address where the program starts. Returns the
/// number of bytes the table occupies and the entries in table order.
pub fn extract(buf: &[u8], format: Format, base: RealModeAddress) -> Result<(usize, Vec<RealModeAddress>), RelocError> {
    let mut r = Reader { buf, pos: 0 };
    let mut entries = Vec::new();
    match format {
        Format::Grouped => {
            for group in 0..16u32 {
                let segment = u32::from(base.segment) + group * 0x1000;
                let count = r.u16le()?;
                let mut previous: Option<u16> = None;
                for _ in 0..count {
                    let position = r.pos;
                    let offset = r.u16le()?;
                    if let Some(previous) = previous {
                        if offset <= previous {
                            return Err(RelocError::NotAscending { position, previous, offset });
                        }
                    }
                    previous = Some(offset);
                    // An offset pushed past 0xffff by the base moves on to the
                    // next 64 KiB.
                    let offset = u32::from(offset) + u32::from(base.offset);
                    entries.push(entry(position, segment + (offset >> 16) * 0x1000, offset as u16)?);
                }
            }
        }
        Format::Packed => {
            let mut segment = u32::from(base.segment);
            let mut offset = u32::from(base.offset);
            let mut carries = 0;
            loop {
                let position = r.pos;
                let span = match r.u8()? {
                    0 => match r.u16le()? {
                        0 => {
                            carries += 1;
                            if carries > MAX_CARRIES {
                                return Err(RelocError::TooManyCarries { position });
                            }
                            segment += 0x0fff;
                            continue;
                        }
                        1 => break,
                        span => u32::from(span),
                    },
                    span => u32::from(span),
                };
                offset += span;
                segment += offset >> 4;
                offset &= 0xf;
                entries.push(entry(position, segment, offset as u16)?);
            }
        }
    }
    debug!("{:?} relocation table of {} bytes with {} entries", format, r.pos, entries.len());
    Ok((r.pos, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grouped(groups: &[&[u16]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for i in 0..16 {
            let group = groups.get(i).copied().unwrap_or(&[]);
            buf.extend_from_slice(&(group.len() as u16).to_le_bytes());
            for offset in group {
                buf.extend_from_slice(&offset.to_le_bytes());
            }
        }
        buf
    }

    fn at(segment: u16) -> RealModeAddress {
        RealModeAddress::new(segment, 0)
    }

    fn fields(entries: &[RealModeAddress]) -> Vec<(u16, u16)> {
        entries.iter().map(|a| (a.segment, a.offset)).collect()
    }

    #[test]
    fn test_grouped() {
        let buf = grouped(&[&[0x0010, 0x0030]]);
        let (len, entries) = extract(&buf, Format::Grouped, at(0x0100)).unwrap();
        assert_eq!(len, 32 + 4);
        assert_eq!(fields(&entries), vec![(0x0100, 0x0010), (0x0100, 0x0030)]);
    }

    #[test]
    fn test_grouped_carry() {
        let buf = grouped(&[&[0x0010], &[0x0030]]);
        let (_, entries) = extract(&buf, Format::Grouped, at(0x0100)).unwrap();
        assert_eq!(fields(&entries), vec![(0x0100, 0x0010), (0x1100, 0x0030)]);

        let buf = grouped(&[&[], &[], &[0xfffe]]);
        let (_, entries) = extract(&buf, Format::Grouped, at(0)).unwrap();
        assert_eq!(fields(&entries), vec![(0x2000, 0xfffe)]);
    }

    #[test]
    fn test_grouped_base_offset() {
        let buf = grouped(&[&[0x0010, 0xfffc]]);
        let (_, entries) = extract(&buf, Format::Grouped, RealModeAddress::new(0x0100, 0x0008)).unwrap();
        assert_eq!(fields(&entries), vec![(0x0100, 0x0018), (0x1100, 0x0004)]);
        assert_eq!(entries.iter().map(|a| a.linear()).collect::<Vec<_>>(), vec![0x1018, 0x11004]);
    }

    #[test]
    fn test_grouped_trailing_bytes_ignored() {
        let mut buf = grouped(&[&[0x0002]]);
        let len = buf.len();
        buf.extend_from_slice(&[0xcc; 7]);
        assert_eq!(extract(&buf, Format::Grouped, at(0)).map(|(n, _)| n), Ok(len));
    }

    #[test]
    fn test_grouped_not_ascending() {
        for group in &[&[0x0030u16, 0x0010] as &[u16], &[0x0010, 0x0010]] {
            let buf = grouped(&[*group]);
            assert_eq!(extract(&buf, Format::Grouped, at(0)),
                Err(RelocError::NotAscending { position: 4, previous: group[0], offset: group[1] }));
        }
    }

    #[test]
    fn test_grouped_truncated() {
        let buf = grouped(&[&[0x0010, 0x0030]]);
        for len in 0..buf.len() {
            match extract(&buf[..len], Format::Grouped, at(0)) {
                Err(RelocError::Truncated { position }) => assert!(position <= len),
                x => panic!("{:?} {}", x, len),
            }
        }
    }

    #[test]
    fn test_grouped_outside_address_space() {
        let buf = grouped(&[&[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[], &[0x0010]]);
        match extract(&buf, Format::Grouped, at(0x0fff)) {
            Err(RelocError::Address { position: 32, .. }) => (),
            x => panic!("{:?}", x),
        }
        match extract(&buf, Format::Grouped, at(0x1000)) {
            Err(RelocError::SegmentOverflow { position: 32 }) => (),
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn test_packed() {
        let buf = [0x10, 0x20, 0x00, 0x01, 0x00];
        let (len, entries) = extract(&buf, Format::Packed, at(0)).unwrap();
        assert_eq!(len, 5);
        // Each entry is normalized so that its offset is less than 16.
        assert_eq!(fields(&entries), vec![(0x0001, 0x0000), (0x0003, 0x0000)]);
        assert_eq!(entries, vec![RealModeAddress::new(0, 0x0010), RealModeAddress::new(0, 0x0030)]);
    }

    #[test]
    fn test_packed_word_span_and_carry() {
        let buf = [
            0x05,             // 0000:0005
            0x00, 0x34, 0x12, // span 0x1234
            0x00, 0x00, 0x00, // carry
            0x03,
            0x00, 0x01, 0x00, // end
        ];
        let (len, entries) = extract(&buf, Format::Packed, at(0x0200)).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(fields(&entries), vec![
            (0x0200, 0x0005),
            (0x0323, 0x0009),
            (0x0323 + 0x0fff, 0x000c),
        ]);
    }

    #[test]
    fn test_packed_base_offset() {
        let buf = [0x02, 0x04, 0x00, 0x01, 0x00];
        for &(base, expected) in &[
            (RealModeAddress::new(0x1000, 0x0001), [0x10003u32, 0x10007]),
            (RealModeAddress::new(0x1000, 0x0008), [0x1000a, 0x1000e]),
            (RealModeAddress::new(0x0ff0, 0x0123), [0x10025, 0x10029]),
        ] {
            let (_, entries) = extract(&buf, Format::Packed, base).unwrap();
            assert_eq!(entries.iter().map(|a| a.linear()).collect::<Vec<_>>(), expected, "{}", base);
            assert!(entries.iter().all(|a| a.offset < 16), "{}", base);
        }
    }

    #[test]
    fn test_entries_strictly_increasing() {
        let buf = grouped(&[&[0x0001, 0xffff], &[0x0000, 0x0002], &[], &[0x8000]]);
        let (_, entries) = extract(&buf, Format::Grouped, at(0)).unwrap();
        assert!(entries.windows(2).all(|w| w[0] < w[1]), "{:?}", entries);

        let buf = [0x01, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x01, 0xff, 0x00, 0x01, 0x00];
        let (_, entries) = extract(&buf, Format::Packed, at(0)).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.windows(2).all(|w| w[0] < w[1]), "{:?}", entries);
    }

    #[test]
    fn test_packed_empty() {
        assert_eq!(extract(&[0x00, 0x01, 0x00], Format::Packed, at(0)), Ok((3, Vec::new())));
    }

    #[test]
    fn test_packed_too_many_carries() {
        let mut buf = Vec::new();
        for _ in 0..MAX_CARRIES {
            buf.extend_from_slice(&[0x00, 0x00, 0x00]);
        }
        let mut ok = buf.clone();
        ok.extend_from_slice(&[0x00, 0x01, 0x00]);
        assert_eq!(extract(&ok, Format::Packed, at(0)), Ok((ok.len(), Vec::new())));

        buf.extend_from_slice(&[0x00, 0x00, 0x00]);
        assert_eq!(extract(&buf, Format::Packed, at(0)),
            Err(RelocError::TooManyCarries { position: MAX_CARRIES * 3 }));
    }

    #[test]
    fn test_packed_truncated() {
        for buf in &[&[] as &[u8], &[0x04], &[0x04, 0x00], &[0x04, 0x00, 0x01]] {
            match extract(buf, Format::Packed, at(0)) {
                Err(RelocError::Truncated { .. }) => (),
                x => panic!("{:?} {:?}", x, buf),
            }
        }
    }
}
