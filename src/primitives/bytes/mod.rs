#![forbid(unsafe_code)]
//! Fixed-width big-endian accessors, varints, and a bounds-checked reader.

pub mod be {
    //! Big-endian integers at fixed offsets inside page buffers.

    /// Reads a u16 at `off`.
    #[inline]
    pub fn read_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_be_bytes([buf[off], buf[off + 1]])
    }

    /// Writes a u16 at `off`.
    #[inline]
    pub fn write_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a u32 at `off`.
    #[inline]
    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[off..off + 4]);
        u32::from_be_bytes(b)
    }

    /// Writes a u32 at `off`.
    #[inline]
    pub fn write_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a u64 at `off`.
    #[inline]
    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[off..off + 8]);
        u64::from_be_bytes(b)
    }

    /// Writes a u64 at `off`.
    #[inline]
    pub fn write_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads the low `width` bytes of a big-endian unsigned integer.
    pub fn read_uint(src: &[u8], width: usize) -> u64 {
        debug_assert!(width <= 8);
        src[..width]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    /// Writes the low `width` bytes of `v` big-endian into `dst`.
    pub fn write_uint(dst: &mut [u8], width: usize, v: u64) {
        debug_assert!(width <= 8);
        for (i, slot) in dst[..width].iter_mut().enumerate() {
            *slot = (v >> (8 * (width - 1 - i))) as u8;
        }
    }
}

pub mod var {
    //! Unsigned LEB128 varints.

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint at `*off`, advancing it.
    ///
    /// Returns `None` when the input is truncated or longer than 64 bits.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Option<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src.get(*off)?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return None;
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
        }
        None
    }
}

pub mod buf {
    //! A slice-backed reader that reports truncation instead of panicking.

    use core::fmt;

    use super::var;

    /// Reads bytes from a slice with offset tracking.
    pub struct Reader<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Reader<'a> {
        /// Creates a reader positioned at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, or `None` if fewer remain.
        pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
            let end = self.off.checked_add(n)?;
            let slice = self.buf.get(self.off..end)?;
            self.off = end;
            Some(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Option<u8> {
            self.take(1).map(|b| b[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Option<u16> {
            self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Option<u32> {
            self.take(4).map(|b| super::be::read_u32(b, 0))
        }

        /// Reads a varint.
        pub fn varint(&mut self) -> Option<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Reader<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
