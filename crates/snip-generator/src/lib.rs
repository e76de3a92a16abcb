//! Short code generators.

mod clock;
pub mod random;

pub use clock::{Clock, SystemClock};
pub use random::{RandomGenerator, ALPHABET, CODE_LENGTH};

use snip_core::ShortCode;

/// Trait for generating short codes.
///
/// Implementations are pure generators that don't interact with storage.
/// They give no uniqueness guarantee: collisions are detected by the
/// repository on write.
pub trait Generator: Send + Sync + 'static {
    type Output: Into<ShortCode>;

    /// Generates a value that can be converted into a short code.
    fn generate(&self) -> Self::Output;
}
