//! Rabin–Karp rolling hash over a fixed byte window.

/// Width of the rolling window in bytes.
pub const WINDOW: usize = 48;
/// Polynomial base. Odd, so multiplication is invertible modulo 2^64.
pub const SEED: u64 = 0x0100_0000_01B3;

/// Polynomial hash of the last [`WINDOW`] bytes, updated in O(1) per byte.
///
/// `H = b[0]·S^(W-1) + b[1]·S^(W-2) + … + b[W-1]` with wrapping arithmetic.
#[derive(Clone)]
pub(crate) struct RollingHash {
    window: [u8; WINDOW],
    head: usize,
    filled: usize,
    hash: u64,
    outgoing_factor: u64,
}

impl RollingHash {
    pub fn new() -> Self {
        let outgoing_factor = (1..WINDOW).fold(1u64, |acc, _| acc.wrapping_mul(SEED));
        Self {
            window: [0; WINDOW],
            head: 0,
            filled: 0,
            hash: 0,
            outgoing_factor,
        }
    }

    /// Push `byte` into the window, dropping the oldest once full.
    pub fn roll(&mut self, byte: u8) -> u64 {
        if self.filled == WINDOW {
            let outgoing = u64::from(self.window[self.head]);
            self.hash = self.hash.wrapping_sub(outgoing.wrapping_mul(self.outgoing_factor));
        } else {
            self.filled += 1;
        }
        self.hash = self.hash.wrapping_mul(SEED).wrapping_add(u64::from(byte));
        self.window[self.head] = byte;
        self.head = (self.head + 1) % WINDOW;
        self.hash
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.filled = 0;
        self.hash = 0;
    }
}
