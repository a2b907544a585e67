//! STM32-style CRC32 used to verify uploads.
//!
//! This is the watch MCU's hardware CRC: polynomial 0x04C11DB7, initial value
//! 0xFFFFFFFF, no reflection, no final xor, fed one little-endian 32-bit word
//! at a time. A trailing partial word is byte-reversed and zero-padded.
//! It is unrelated to the CRC32C used for whole-file integrity checks.

/// CRC polynomial.
pub const STM32_CRC_POLY: u32 = 0x04C1_1DB7;

/// CRC initial value.
pub const STM32_CRC_INIT: u32 = 0xFFFF_FFFF;

/// Incremental STM32 CRC32.
#[derive(Debug, Clone)]
pub struct Stm32Crc {
    crc: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl Stm32Crc {
    pub fn new() -> Self {
        Self {
            crc: STM32_CRC_INIT,
            pending: [0; 4],
            pending_len: 0,
        }
    }

    /// Feeds more data. Word boundaries are tracked across calls.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < 4 {
                return;
            }
            self.crc = process_word(self.crc, u32::from_le_bytes(self.pending));
            self.pending_len = 0;
        }

        let mut words = data.chunks_exact(4);
        for word in &mut words {
            self.crc = process_word(self.crc, u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }

        let rest = words.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Returns the CRC, folding in any trailing partial word.
    pub fn finalize(&self) -> u32 {
        if self.pending_len == 0 {
            return self.crc;
        }
        let mut word = [0u8; 4];
        for (i, byte) in self.pending[..self.pending_len].iter().rev().enumerate() {
            word[i] = *byte;
        }
        process_word(self.crc, u32::from_le_bytes(word))
    }
}

impl Default for Stm32Crc {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the STM32 CRC32 of a whole buffer.
pub fn stm32_crc32(data: &[u8]) -> u32 {
    let mut crc = Stm32Crc::new();
    crc.update(data);
    crc.finalize()
}

fn process_word(crc: u32, word: u32) -> u32 {
    let mut crc = crc ^ word;
    for _ in 0..32 {
        crc = if crc & 0x8000_0000 != 0 {
            (crc << 1) ^ STM32_CRC_POLY
        } else {
            crc << 1
        };
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(stm32_crc32(b""), 0xffff_ffff);
        assert_eq!(stm32_crc32(&[0, 0, 0, 0]), 0xc704_dd7b);
        assert_eq!(stm32_crc32(b"12345678"), 0xfefc_54f9);
    }

    #[test]
    fn test_partial_trailing_word() {
        assert_eq!(stm32_crc32(b"123456789"), 0xaff1_9057);
        assert_eq!(stm32_crc32(&[1, 2, 3, 4, 5]), 0xba23_7be3);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2003).collect();
        let expected = stm32_crc32(&data);

        for split in [1, 2, 3, 5, 7, 2000] {
            let mut crc = Stm32Crc::new();
            for chunk in data.chunks(split) {
                crc.update(chunk);
            }
            assert_eq!(crc.finalize(), expected, "split {}", split);
        }
    }
}
