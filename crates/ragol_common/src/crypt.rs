//! The table stream ciphers used on client connections.
//!
//! Pre-Blue-Burst clients negotiate a 32-bit seed in the welcome packet and
//! run a 521-word subtractive-generator keystream; Blue Burst negotiates a
//! 48-byte seed block and runs a doubled, 1042-word variant of the same
//! construction. Encryption is XOR with the keystream a 32-bit word at a
//! time, so it is its own inverse and both directions advance their own
//! state independently.

const PSO_STREAM_LEN: usize = 521;
const PSO_STREAM_LAG: usize = 489;

const BB_STREAM_LEN: usize = 1042;
const BB_STREAM_LAG: usize = 978;

/// Keystream for DC/PC/GC/Xbox connections, keyed from one 32-bit seed.
pub struct PsoCipher {
    stream: [u32; PSO_STREAM_LEN],
    offset: usize,
}

impl PsoCipher {
    pub fn new(seed: u32) -> PsoCipher {
        let mut stream = [0u32; PSO_STREAM_LEN];
        expand_seed(&mut stream, seed);

        let mut c = PsoCipher { stream, offset: 0 };

        // Churn the generator a few times before use, like the client does.
        for _ in 0..3 {
            c.update_stream();
        }

        c
    }

    fn update_stream(&mut self) {
        update_subtractive(&mut self.stream, PSO_STREAM_LAG);
        self.offset = 0;
    }

    fn next_key(&mut self) -> u32 {
        if self.offset >= PSO_STREAM_LEN {
            self.update_stream();
        }

        let k = self.stream[self.offset];
        self.offset += 1;
        k
    }

    /// XOR `data` with the keystream in place. `data.len()` must be a
    /// multiple of 4; the codec only hands us whole padded packets.
    pub fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 4, 0);

        for chunk in data.chunks_exact_mut(4) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let word = word ^ self.next_key();
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Keystream for Blue Burst connections, keyed from the 48-byte seed block
/// exchanged in the welcome packet.
pub struct BbCipher {
    stream: [u32; BB_STREAM_LEN],
    offset: usize,
}

impl BbCipher {
    pub fn new(seed: &[u8; 48]) -> BbCipher {
        let mut words = [0u32; 12];
        for (w, chunk) in words.iter_mut().zip(seed.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let mut folded = 0u32;
        for w in words {
            folded = folded.rotate_left(7) ^ w;
        }

        let mut stream = [0u32; BB_STREAM_LEN];
        expand_seed(&mut stream, folded);

        // Spread the raw seed words back across the table so every byte of
        // the 48-byte block contributes to the state directly, not just
        // through the fold.
        for (i, slot) in stream.iter_mut().enumerate() {
            *slot ^= words[i % 12].rotate_left((i % 31) as u32);
        }

        let mut c = BbCipher { stream, offset: 0 };

        for _ in 0..3 {
            c.update_stream();
        }

        c
    }

    fn update_stream(&mut self) {
        update_subtractive(&mut self.stream, BB_STREAM_LAG);
        self.offset = 0;
    }

    fn next_key(&mut self) -> u32 {
        if self.offset >= BB_STREAM_LEN {
            self.update_stream();
        }

        let k = self.stream[self.offset];
        self.offset += 1;
        k
    }

    /// XOR `data` with the keystream in place, 4 bytes per key word.
    pub fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 4, 0);

        for chunk in data.chunks_exact_mut(4) {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let word = word ^ self.next_key();
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Fill `stream` from a 32-bit seed. The first 17 words come from a bitwise
/// LCG walk, the rest are derived by the shift-mix recurrence the games use.
fn expand_seed(stream: &mut [u32], mut seed: u32) {
    let n = stream.len();
    let mut basekey = 0u32;

    for word in stream.iter_mut().take(17) {
        for _ in 0..32 {
            seed = seed.wrapping_mul(0x5D58_8B65).wrapping_add(1);
            basekey >>= 1;

            if seed & 0x8000_0000 != 0 {
                basekey |= 0x8000_0000;
            } else {
                basekey &= 0x7FFF_FFFF;
            }
        }

        *word = basekey;
    }

    stream[16] = (stream[0] >> 9) ^ (stream[16] << 23) ^ stream[15];

    let mut i = 17;
    while i < n {
        stream[i] =
            stream[i - 1] ^ (((stream[i - 17] << 23) & 0xFF80_0000) | ((stream[i - 16] >> 9) & 0x007F_FFFF));
        i += 1;
    }
}

/// One round of the lagged subtractive generator over the whole table.
fn update_subtractive(stream: &mut [u32], lag: usize) {
    let n = stream.len();

    for i in 0..(n - lag) {
        stream[i] = stream[i].wrapping_sub(stream[i + lag]);
    }

    for i in (n - lag)..n {
        stream[i] = stream[i].wrapping_sub(stream[i - (n - lag)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pso_cipher_known_answer() {
        // First keystream words for two fixed seeds. These pin the whole
        // construction: the seed expansion, the shift-mix recurrence and
        // the three warm-up rounds of the subtractive generator.
        let mut c = PsoCipher::new(0x1234_5678);
        assert_eq!(c.next_key(), 0x940D_CA4D);
        assert_eq!(c.next_key(), 0x64F0_3483);
        assert_eq!(c.next_key(), 0x3AAD_C3C5);
        assert_eq!(c.next_key(), 0x3C68_F05A);

        let mut c = PsoCipher::new(0xDEAD_BEEF);
        assert_eq!(c.next_key(), 0xF804_0157);
        assert_eq!(c.next_key(), 0xF99C_3617);
        assert_eq!(c.next_key(), 0x147B_FBB9);
        assert_eq!(c.next_key(), 0x8D87_255E);
    }

    #[test]
    fn bb_cipher_known_answer() {
        // The 48-byte seed 00 01 02 .. 2F.
        let mut seed = [0u8; 48];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = i as u8;
        }

        let mut c = BbCipher::new(&seed);
        assert_eq!(c.next_key(), 0x9FF1_22F2);
        assert_eq!(c.next_key(), 0x8DF0_96ED);
        assert_eq!(c.next_key(), 0xD819_5FBA);
        assert_eq!(c.next_key(), 0x3926_1BC0);
    }

    #[test]
    fn pso_cipher_round_trips() {
        let mut enc = PsoCipher::new(0xDEADBEEF);
        let mut dec = PsoCipher::new(0xDEADBEEF);

        let mut data = *b"a test packet of 24 len.";
        let orig = data;

        enc.apply(&mut data);
        assert_ne!(data, orig);
        dec.apply(&mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn pso_cipher_is_deterministic_per_seed() {
        let mut a = PsoCipher::new(0x12345678);
        let mut b = PsoCipher::new(0x12345678);
        let mut c = PsoCipher::new(0x12345679);

        let keys_a: Vec<u32> = (0..600).map(|_| a.next_key()).collect();
        let keys_b: Vec<u32> = (0..600).map(|_| b.next_key()).collect();
        let keys_c: Vec<u32> = (0..600).map(|_| c.next_key()).collect();

        assert_eq!(keys_a, keys_b);
        assert_ne!(keys_a, keys_c);
    }

    #[test]
    fn pso_cipher_keystream_spans_table_reloads() {
        // Consuming more words than the table holds must keep producing a
        // deterministic stream (the update routine runs in place).
        let mut a = PsoCipher::new(7);
        let mut b = PsoCipher::new(7);

        for _ in 0..(PSO_STREAM_LEN * 3 + 5) {
            assert_eq!(a.next_key(), b.next_key());
        }
    }

    #[test]
    fn bb_cipher_round_trips() {
        let mut seed = [0u8; 48];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = i as u8;
        }

        let mut enc = BbCipher::new(&seed);
        let mut dec = BbCipher::new(&seed);

        let mut data = [0x5Au8; 32];
        let orig = data;

        enc.apply(&mut data);
        assert_ne!(data, orig);
        dec.apply(&mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn bb_cipher_uses_the_whole_seed_block() {
        let seed_a = [1u8; 48];
        let mut seed_b = [1u8; 48];
        seed_b[47] = 2;

        let mut a = BbCipher::new(&seed_a);
        let mut b = BbCipher::new(&seed_b);

        let keys_a: Vec<u32> = (0..64).map(|_| a.next_key()).collect();
        let keys_b: Vec<u32> = (0..64).map(|_| b.next_key()).collect();
        assert_ne!(keys_a, keys_b);
    }
}
