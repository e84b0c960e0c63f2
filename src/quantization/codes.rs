//! Bit-packed PQ codes.
//!
//! Each segment index takes `ceil(log2(codebook_size))` bits, packed LSB-first
//! into a byte string. A 256-entry codebook degenerates to one byte per
//! segment; a 16-entry codebook packs two segments per byte.

use serde::{Deserialize, Serialize};

use crate::error::{LeannError, Result};

/// Layout of one packed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLayout {
    segments: usize,
    codebook_size: usize,
    bits: u32,
}

impl CodeLayout {
    pub fn new(segments: usize, codebook_size: usize) -> Result<Self> {
        if segments == 0 || !(2..=256).contains(&codebook_size) {
            return Err(LeannError::config(format!(
                "invalid code layout: {segments} segments, codebook size {codebook_size}"
            )));
        }
        let bits = usize::BITS - (codebook_size - 1).leading_zeros();
        Ok(Self {
            segments,
            codebook_size,
            bits,
        })
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn bits_per_segment(&self) -> u32 {
        self.bits
    }

    /// Packed length in bytes.
    pub fn code_len(&self) -> usize {
        (self.segments * self.bits as usize).div_ceil(8)
    }

    /// Pack one centroid index per segment.
    pub fn pack(&self, indices: &[u8]) -> Result<Vec<u8>> {
        if indices.len() != self.segments {
            return Err(LeannError::build(format!(
                "expected {} segment indices, got {}",
                self.segments,
                indices.len()
            )));
        }
        if self.bits == 8 {
            return Ok(indices.to_vec());
        }
        let mut out = vec![0u8; self.code_len()];
        let mut bit = 0usize;
        for &idx in indices {
            let mut value = u16::from(idx);
            let mut remaining = self.bits as usize;
            while remaining > 0 {
                let byte = bit / 8;
                let offset = bit % 8;
                let take = remaining.min(8 - offset);
                let mask = (1u16 << take) - 1;
                out[byte] |= ((value & mask) as u8) << offset;
                value >>= take;
                bit += take;
                remaining -= take;
            }
        }
        Ok(out)
    }

    /// Unpack into `out`. Rejects codes of the wrong length or with indices
    /// outside the codebook.
    pub fn unpack_into(&self, code: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if code.len() != self.code_len() {
            return Err(LeannError::query(format!(
                "malformed code: {} bytes, expected {}",
                code.len(),
                self.code_len()
            )));
        }
        out.clear();
        if self.bits == 8 {
            out.extend_from_slice(code);
        } else {
            let mut bit = 0usize;
            for _ in 0..self.segments {
                let mut value = 0u16;
                let mut filled = 0usize;
                while filled < self.bits as usize {
                    let byte = bit / 8;
                    let offset = bit % 8;
                    let take = (self.bits as usize - filled).min(8 - offset);
                    let mask = (1u16 << take) - 1;
                    value |= ((u16::from(code[byte]) >> offset) & mask) << filled;
                    filled += take;
                    bit += take;
                }
                out.push(value as u8);
            }
        }
        if let Some(&bad) = out.iter().find(|&&i| usize::from(i) >= self.codebook_size) {
            return Err(LeannError::query(format!(
                "malformed code: centroid index {bad} outside codebook of {}",
                self.codebook_size
            )));
        }
        Ok(())
    }

    pub fn unpack(&self, code: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.segments);
        self.unpack_into(code, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bit_widths() {
        assert_eq!(CodeLayout::new(16, 256).unwrap().bits_per_segment(), 8);
        assert_eq!(CodeLayout::new(16, 256).unwrap().code_len(), 16);
        assert_eq!(CodeLayout::new(16, 16).unwrap().bits_per_segment(), 4);
        assert_eq!(CodeLayout::new(16, 16).unwrap().code_len(), 8);
        assert_eq!(CodeLayout::new(3, 5).unwrap().bits_per_segment(), 3);
        assert_eq!(CodeLayout::new(3, 5).unwrap().code_len(), 2);
        assert_eq!(CodeLayout::new(7, 2).unwrap().code_len(), 1);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let layout = CodeLayout::new(2, 5).unwrap();
        // 3 bits each: index 7 in segment 0 is outside a 5-entry codebook.
        assert!(layout.unpack(&[0b0000_0111]).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let layout = CodeLayout::new(4, 256).unwrap();
        assert!(layout.unpack(&[1, 2, 3]).is_err());
    }

    proptest! {
        #[test]
        fn prop_small_alphabets_survive_packing(
            k in 2usize..=256,
            raw in proptest::collection::vec(any::<u8>(), 1..40),
        ) {
            let layout = CodeLayout::new(raw.len(), k).unwrap();
            let indices: Vec<u8> = raw.iter().map(|&x| (usize::from(x) % k) as u8).collect();
            let packed = layout.pack(&indices).unwrap();
            prop_assert_eq!(packed.len(), layout.code_len());
            prop_assert_eq!(layout.unpack(&packed).unwrap(), indices);
        }
    }
}
