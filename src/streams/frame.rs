// src/streams/frame.rs

//! Frame codec: `tag:u8 | size | payload`
//!
//! Sizes below `0x8000` take two big-endian bytes. Larger sizes take four
//! big-endian bytes with the high bit set, so a reader can tell the two
//! apart from the first size byte.

use crate::error::{Error, Result};

const SMALL_LIMIT: usize = 0x8000;
const LARGE_FLAG: u32 = 0x8000_0000;
const LARGE_LIMIT: usize = 0x7fff_ffff;

/// Append one frame to `out`
pub fn write_frame(out: &mut Vec<u8>, tag: u8, payload: &[u8]) -> Result<()> {
    out.push(tag);
    let len = payload.len();
    if len < SMALL_LIMIT {
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= LARGE_LIMIT {
        out.extend_from_slice(&(len as u32 | LARGE_FLAG).to_be_bytes());
    } else {
        return Err(Error::ParseError(format!(
            "stream frame for tag {} is too large ({} bytes)",
            tag, len
        )));
    }
    out.extend_from_slice(payload);
    Ok(())
}

/// Iterator over the frames of a frozen stream set
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::ParseError("truncated stream frame".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_frame(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.take(1)?[0];
        let first = self.take(2)?;
        let len = if first[0] & 0x80 == 0 {
            u16::from_be_bytes([first[0], first[1]]) as usize
        } else {
            let rest = self.take(2)?;
            let raw = u32::from_be_bytes([first[0], first[1], rest[0], rest[1]]);
            (raw & !LARGE_FLAG) as usize
        };
        let payload = self.take(len)?;
        Ok((tag, payload))
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<(u8, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let frame = self.read_frame();
        if frame.is_err() {
            // stop after the first malformed frame
            self.pos = self.data.len();
        }
        Some(frame)
    }
}
