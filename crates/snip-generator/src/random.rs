use crate::clock::{Clock, SystemClock};
use crate::Generator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snip_core::ShortCode;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of every generated code.
pub const CODE_LENGTH: usize = 10;

/// 52 ASCII letters followed by 10 digits.
pub const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// Odd 64-bit constant (golden ratio) spreading the call counter over all bits.
const SEED_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Random short code generator.
///
/// Every call seeds a fresh RNG from the clock's nanosecond timestamp mixed
/// with a per-instance call counter, so two calls landing on the same
/// nanosecond still draw from different seeds.
#[derive(Debug)]
pub struct RandomGenerator<C: Clock = SystemClock> {
    clock: C,
    calls: AtomicU64,
}

impl RandomGenerator<SystemClock> {
    /// Creates a generator seeded from the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for RandomGenerator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RandomGenerator<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            calls: AtomicU64::new(0),
        }
    }

    fn seed(&self) -> u64 {
        let nanos = self.clock.now().as_nanosecond() as u64;
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        nanos ^ call.wrapping_mul(SEED_GAMMA)
    }

    /// Draws the next code.
    pub fn next_code(&self) -> ShortCode {
        let mut rng = StdRng::seed_from_u64(self.seed());
        let code: String = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        ShortCode::new_unchecked(code)
    }
}

impl<C: Clock + 'static> Generator for RandomGenerator<C> {
    type Output = ShortCode;

    fn generate(&self) -> Self::Output {
        self.next_code()
    }
}
