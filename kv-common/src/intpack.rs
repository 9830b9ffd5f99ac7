//! Order-preserving variable-length packing of record numbers.
//!
//! Small numbers take a single byte, and the packed forms of two numbers
//! compare (as byte strings) in the same order as the numbers themselves,
//! so a record-number key can be handed to the engine as raw bytes.
//!
//! | range                     | layout                                   |
//! |---------------------------|------------------------------------------|
//! | `0..=63`                  | `10xxxxxx`                               |
//! | `64..=8255`               | `110xxxxx xxxxxxxx` (value - 64)         |
//! | `8256..`                  | `1110llll` + `l` big-endian bytes (value - 8256) |

/// Upper bound on the size of any packed record number.
pub const MAX_PACKED_SIZE: usize = 9;

const POS_1BYTE_MARKER: u8 = 0x80;
const POS_2BYTE_MARKER: u8 = 0xc0;
const POS_MULTI_MARKER: u8 = 0xe0;

const POS_1BYTE_MAX: u64 = (1 << 6) - 1;
const POS_2BYTE_MAX: u64 = (1 << 13) + POS_1BYTE_MAX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    #[error("packed integer is truncated")]
    Truncated,
    #[error("unsupported packed integer marker {0:#04x}")]
    UnsupportedMarker(u8),
    #[error("packed integer overflows u64")]
    Overflow,
    #[error("{0} trailing bytes after packed integer")]
    TrailingBytes(usize),
}

/// Pack `x` into `buf`, returning the number of bytes written.
pub fn pack_uint(x: u64, buf: &mut [u8; MAX_PACKED_SIZE]) -> usize {
    if x <= POS_1BYTE_MAX {
        buf[0] = POS_1BYTE_MARKER | (x as u8);
        1
    } else if x <= POS_2BYTE_MAX {
        let x = x - (POS_1BYTE_MAX + 1);
        buf[0] = POS_2BYTE_MARKER | ((x >> 8) as u8 & 0x1f);
        buf[1] = x as u8;
        2
    } else {
        let x = x - (POS_2BYTE_MAX + 1);
        let len = std::cmp::max(1, (64 - x.leading_zeros() as usize + 7) / 8);
        buf[0] = POS_MULTI_MARKER | len as u8;
        buf[1..=len].copy_from_slice(&x.to_be_bytes()[8 - len..]);
        len + 1
    }
}

/// Unpack a record number from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn unpack_uint(buf: &[u8]) -> Result<(u64, usize), PackError> {
    let Some(&marker) = buf.first() else {
        return Err(PackError::Truncated);
    };
    if marker & 0xf0 == POS_MULTI_MARKER {
        let len = usize::from(marker & 0x0f);
        if len == 0 || len > 8 {
            return Err(PackError::UnsupportedMarker(marker));
        }
        let bytes = buf.get(1..=len).ok_or(PackError::Truncated)?;
        let x = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let x = x
            .checked_add(POS_2BYTE_MAX + 1)
            .ok_or(PackError::Overflow)?;
        Ok((x, len + 1))
    } else if marker & 0xe0 == POS_2BYTE_MARKER {
        let low = *buf.get(1).ok_or(PackError::Truncated)?;
        let x = (u64::from(marker & 0x1f) << 8) | u64::from(low);
        Ok((x + POS_1BYTE_MAX + 1, 2))
    } else if marker & 0xc0 == POS_1BYTE_MARKER {
        Ok((u64::from(marker & 0x3f), 1))
    } else {
        Err(PackError::UnsupportedMarker(marker))
    }
}

/// A record number together with its packed form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PackedRecno {
    recno: u64,
    buf: [u8; MAX_PACKED_SIZE],
    len: u8,
}

impl PackedRecno {
    pub fn new(recno: u64) -> Self {
        let mut buf = [0; MAX_PACKED_SIZE];
        let len = pack_uint(recno, &mut buf);
        PackedRecno {
            recno,
            buf,
            len: len as u8,
        }
    }

    /// Parse an already-packed record number. The whole of `packed` must be consumed.
    pub fn from_packed(packed: &[u8]) -> Result<Self, PackError> {
        let (recno, consumed) = unpack_uint(packed)?;
        if consumed != packed.len() {
            return Err(PackError::TrailingBytes(packed.len() - consumed));
        }
        Ok(Self::new(recno))
    }

    pub fn recno(&self) -> u64 {
        self.recno
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

impl std::fmt::Debug for PackedRecno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedRecno")
            .field("recno", &self.recno)
            .field("packed", &self.as_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(x: u64) -> Vec<u8> {
        PackedRecno::new(x).as_bytes().to_vec()
    }

    #[test]
    fn boundaries() {
        assert_eq!(packed(0), vec![0x80]);
        assert_eq!(packed(63), vec![0xbf]);
        assert_eq!(packed(64), vec![0xc0, 0x00]);
        assert_eq!(packed(8255), vec![0xdf, 0xff]);
        assert_eq!(packed(8256), vec![0xe1, 0x00]);
        assert_eq!(packed(8256 + 256), vec![0xe2, 0x01, 0x00]);
        assert_eq!(packed(u64::MAX).len(), MAX_PACKED_SIZE);
    }

    #[test]
    fn unpack_matches_pack() {
        for x in [0, 1, 63, 64, 65, 8255, 8256, 70_000, 1 << 40, u64::MAX] {
            let p = packed(x);
            assert_eq!(unpack_uint(&p), Ok((x, p.len())), "x={x}");
        }
    }

    #[test]
    fn packed_form_preserves_order() {
        let values = [1u64, 2, 63, 64, 200, 8255, 8256, 9000, 1 << 20, 1 << 33, u64::MAX];
        for w in values.windows(2) {
            assert!(packed(w[0]) < packed(w[1]), "{} vs {}", w[0], w[1]);
        }
    }

    #[test]
    fn malformed_input() {
        assert_eq!(unpack_uint(&[]), Err(PackError::Truncated));
        assert_eq!(unpack_uint(&[0xc3]), Err(PackError::Truncated));
        assert_eq!(unpack_uint(&[0xe3, 0x01]), Err(PackError::Truncated));
        assert_eq!(unpack_uint(&[0x7f]), Err(PackError::UnsupportedMarker(0x7f)));
        assert_eq!(unpack_uint(&[0xe0]), Err(PackError::UnsupportedMarker(0xe0)));
        assert_eq!(
            unpack_uint(&[0xe8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(PackError::Overflow)
        );
        assert_eq!(
            PackedRecno::from_packed(&[0x81, 0x00]),
            Err(PackError::TrailingBytes(1))
        );
    }
}
