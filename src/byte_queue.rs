//! Fragment queue with protocol-aware extraction.
//!
//! A [`ByteQueue`] holds the received-but-unconsumed bytes of a connection (its
//! read queue) or the bytes waiting for the socket (its write queue). Fragments
//! are only pushed at the tail and consumed from the head. Every extraction is
//! all-or-nothing: either the requested unit is removed in full or the queue is
//! left exactly as it was and [`Error::InsufficientData`] is returned.
//!
//! ```text
//!  head                                                   tail
//!  ┌──────────┐ ┌──────────────┐ ┌──────┐ ┌──────────────────┐
//!  │ "GET /x\r│ │ \nHost: a\r\n│ │ \r\n │ │ partial next ... │
//!  └──────────┘ └──────────────┘ └──────┘ └──────────────────┘
//!        └── a delimiter may straddle two fragments ──┘
//! ```

use std::{cmp, collections::VecDeque, mem};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Fixed-width big-endian values that can be read from and written to a stream.
pub trait Scalar: Copy + Sized {
    const WIDTH: usize;

    /// Decodes from exactly `WIDTH` big-endian bytes.
    fn from_be_slice(bytes: &[u8]) -> Self;

    fn extend_be(self, out: &mut Vec<u8>);
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const WIDTH: usize = mem::size_of::<$ty>();

                #[inline]
                fn from_be_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$ty>::from_be_bytes(raw)
                }

                #[inline]
                fn extend_be(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Width of the length field in front of a length-prefixed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    U8,
    U16,
    U32,
}

impl LengthPrefix {
    pub fn width(self) -> usize {
        match self {
            LengthPrefix::U8 => 1,
            LengthPrefix::U16 => 2,
            LengthPrefix::U32 => 4,
        }
    }

    /// Largest payload the field can describe.
    pub fn max_len(self) -> usize {
        match self {
            LengthPrefix::U8 => u8::MAX as usize,
            LengthPrefix::U16 => u16::MAX as usize,
            LengthPrefix::U32 => u32::MAX as usize,
        }
    }

    fn decode(self, raw: &[u8]) -> usize {
        match self {
            LengthPrefix::U8 => u8::from_be_slice(raw) as usize,
            LengthPrefix::U16 => u16::from_be_slice(raw) as usize,
            LengthPrefix::U32 => u32::from_be_slice(raw) as usize,
        }
    }

    pub(crate) fn encode(self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        if len > self.max_len() {
            return Err(Error::FrameTooLarge {
                max: self.max_len(),
            });
        }
        match self {
            LengthPrefix::U8 => (len as u8).extend_be(out),
            LengthPrefix::U16 => (len as u16).extend_be(out),
            LengthPrefix::U32 => (len as u32).extend_be(out),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ByteQueue {
    fragments: VecDeque<Bytes>,
    len: usize,
    consumed: u64,
    /// Fragments removed since the mark was set, in removal order.
    mark: Option<Vec<Bytes>>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Total bytes removed from the head so far. Only [`reset`](Self::reset)
    /// moves it backwards, so an unchanged value means no forward progress.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn append(&mut self, fragment: Bytes) {
        if fragment.is_empty() {
            return;
        }
        self.len += fragment.len();
        self.fragments.push_back(fragment);
    }

    pub fn append_slice(&mut self, data: &[u8]) {
        self.append(Bytes::copy_from_slice(data));
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.fragments.front()
    }

    /// Drops everything, including a pending mark.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.len = 0;
        self.mark = None;
    }

    /// Removes up to `n` bytes from the head and returns how many were removed.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = cmp::min(n, self.len);
        self.take_front(n);
        n
    }

    /// Position of the first occurrence of `delimiter`, without consuming.
    pub fn index_of(&self, delimiter: &[u8]) -> Option<usize> {
        let first = *delimiter.first()?;
        if delimiter.len() > self.len {
            return None;
        }

        let mut offset = 0;
        for (index, fragment) in self.fragments.iter().enumerate() {
            for (pos, byte) in fragment.iter().enumerate() {
                if *byte == first && self.matches_at(index, pos, delimiter) {
                    return Some(offset + pos);
                }
            }
            offset += fragment.len();
        }
        None
    }

    /// Removes exactly `n` bytes, returned as the fragments they occupied.
    pub fn read_by_length(&mut self, n: usize) -> Result<Vec<Bytes>> {
        if self.len < n {
            return Err(Error::InsufficientData);
        }
        Ok(self.take_front(n))
    }

    /// Like [`read_by_length`](Self::read_by_length) but returns one contiguous
    /// buffer. No copy happens when the bytes sit in a single fragment.
    pub fn read_bytes_by_length(&mut self, n: usize) -> Result<Bytes> {
        self.read_by_length(n).map(concat)
    }

    /// Removes the record in front of the first `delimiter` together with the
    /// delimiter itself and returns the record.
    ///
    /// With `max_len` set, fails with [`Error::FrameTooLarge`] as soon as it is
    /// clear the record cannot fit, instead of waiting for more data.
    pub fn read_by_delimiter(&mut self, delimiter: &[u8], max_len: Option<usize>) -> Result<Vec<Bytes>> {
        if delimiter.is_empty() {
            return Err(Error::InvalidArgument("delimiter must not be empty"));
        }

        match self.index_of(delimiter) {
            Some(index) => {
                if let Some(max) = max_len {
                    if index > max {
                        return Err(Error::FrameTooLarge { max });
                    }
                }
                let record = self.take_front(index);
                self.take_front(delimiter.len());
                Ok(record)
            }
            None => {
                if let Some(max) = max_len {
                    if self.len >= max.saturating_add(delimiter.len()) {
                        return Err(Error::FrameTooLarge { max });
                    }
                }
                Err(Error::InsufficientData)
            }
        }
    }

    pub fn read_bytes_by_delimiter(&mut self, delimiter: &[u8], max_len: Option<usize>) -> Result<Bytes> {
        self.read_by_delimiter(delimiter, max_len).map(concat)
    }

    pub fn read_scalar<T: Scalar>(&mut self) -> Result<T> {
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::WIDTH];
        if !self.copy_prefix(raw) {
            return Err(Error::InsufficientData);
        }
        self.take_front(T::WIDTH);
        Ok(T::from_be_slice(raw))
    }

    /// Reads a frame preceded by a big-endian length field. The length field
    /// is only consumed together with the complete payload.
    pub fn read_length_prefixed(&mut self, prefix: LengthPrefix, max_len: Option<usize>) -> Result<Bytes> {
        let width = prefix.width();
        let mut raw = [0u8; 4];
        if !self.copy_prefix(&mut raw[..width]) {
            return Err(Error::InsufficientData);
        }

        let length = prefix.decode(&raw[..width]);
        if let Some(max) = max_len {
            if length > max {
                return Err(Error::FrameTooLarge { max });
            }
        }
        if self.len < width + length {
            return Err(Error::InsufficientData);
        }

        self.take_front(width);
        Ok(concat(self.take_front(length)))
    }

    /// Remembers the current read position. Setting a new mark discards the
    /// previous one.
    pub fn mark(&mut self) {
        self.mark = Some(Vec::new());
    }

    /// Puts back every byte consumed since [`mark`](Self::mark). The mark stays
    /// in place. Returns `false` when no mark is set.
    pub fn reset(&mut self) -> bool {
        let Some(log) = self.mark.as_mut() else {
            return false;
        };

        let restored: usize = log.iter().map(Bytes::len).sum();
        for fragment in log.drain(..).rev() {
            self.fragments.push_front(fragment);
        }
        self.len += restored;
        self.consumed -= restored as u64;
        true
    }

    pub fn remove_mark(&mut self) {
        self.mark = None;
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    fn matches_at(&self, mut index: usize, mut pos: usize, delimiter: &[u8]) -> bool {
        for expected in delimiter {
            loop {
                match self.fragments.get(index) {
                    Some(fragment) if pos < fragment.len() => break,
                    Some(_) => {
                        index += 1;
                        pos = 0;
                    }
                    None => return false,
                }
            }
            if self.fragments[index][pos] != *expected {
                return false;
            }
            pos += 1;
        }
        true
    }

    fn copy_prefix(&self, out: &mut [u8]) -> bool {
        if self.len < out.len() {
            return false;
        }

        let mut filled = 0;
        for fragment in &self.fragments {
            if filled == out.len() {
                break;
            }
            let n = cmp::min(fragment.len(), out.len() - filled);
            out[filled..filled + n].copy_from_slice(&fragment[..n]);
            filled += n;
        }
        true
    }

    fn take_front(&mut self, n: usize) -> Vec<Bytes> {
        let mut taken = Vec::new();
        let mut remaining = n;

        while remaining > 0 {
            let Some(mut front) = self.fragments.pop_front() else {
                break;
            };
            if front.len() > remaining {
                taken.push(front.split_to(remaining));
                self.fragments.push_front(front);
                remaining = 0;
            } else {
                remaining -= front.len();
                taken.push(front);
            }
        }

        let removed = n - remaining;
        self.len -= removed;
        self.consumed += removed as u64;
        if let Some(log) = self.mark.as_mut() {
            log.extend(taken.iter().cloned());
        }
        taken
    }
}

/// Joins fragments, copying only when there is more than one.
pub(crate) fn concat(mut parts: Vec<Bytes>) -> Bytes {
    match parts.len() {
        0 => Bytes::new(),
        1 => parts.swap_remove(0),
        _ => {
            let total = parts.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for part in &parts {
                joined.extend_from_slice(part);
            }
            joined.freeze()
        }
    }
}
