//! Rolling checksum for the encoder's block index.

/// Adler32-style rolling checksum over a fixed-width window.
///
/// Two 16-bit sums (a, b) are packed into the 32-bit digest. Sliding the
/// window by one byte is O(1): drop the oldest byte, take in the newest.
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    /// Hash of `window`, ready to be rolled forward.
    pub fn over(window: &[u8]) -> Self {
        // Accumulate in u64 so the modular reduction happens once, not per byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in window {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window: window.len() as u32,
        }
    }

    /// Slide the window one byte: `outgoing` leaves the front, `incoming` joins the back.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        let drop = (1 + (out * self.window) % MOD_ADLER) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - drop + self.a) % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
