//! Secure random number generation.
//!
//! Nonces come straight from the operating system CSPRNG. Conversation
//! ids come from a [`ConvIdGenerator`], which owns an injectable CSPRNG so
//! tests can replay a seeded sequence.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand_core::{CryptoRng, OsRng, RngCore};

use crate::CryptoError;

/// Redraws allowed before [`ConvIdGenerator::next`] gives up.
const MAX_DRAWS: usize = 64;

/// Most recent ids a generator refuses to hand out again.
pub const RECENT_IDS: usize = 4096;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Object-safe CSPRNG bound.
pub trait CsRng: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> CsRng for T {}

struct GeneratorState {
    rng: Box<dyn CsRng>,
    recent: VecDeque<u32>,
    tracked: HashSet<u32>,
    issued: usize,
}

impl GeneratorState {
    fn remember(&mut self, conv: u32) {
        self.recent.push_back(conv);
        if self.recent.len() > RECENT_IDS {
            if let Some(oldest) = self.recent.pop_front() {
                self.tracked.remove(&oldest);
            }
        }
        self.issued += 1;
    }
}

/// Issues non-zero conversation ids.
///
/// An id is never repeated while it is among the last [`RECENT_IDS`]
/// issued, so memory stays bounded for long-running dialers.
pub struct ConvIdGenerator {
    state: Mutex<GeneratorState>,
}

impl ConvIdGenerator {
    /// Generator backed by the OS CSPRNG.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }

    /// Generator backed by `rng`.
    pub fn with_rng<R: CsRng + 'static>(rng: R) -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                rng: Box::new(rng),
                recent: VecDeque::with_capacity(RECENT_IDS),
                tracked: HashSet::with_capacity(RECENT_IDS),
                issued: 0,
            }),
        }
    }

    /// Process-wide generator shared by every client that does not bring
    /// its own.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<ConvIdGenerator>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Draw the next id.
    ///
    /// # Errors
    ///
    /// [`CryptoError::RandomFailed`] if the RNG fails, or
    /// [`CryptoError::ConvIdExhausted`] if every draw collided.
    pub fn next(&self) -> Result<u32, CryptoError> {
        let mut state = self.state.lock();
        for _ in 0..MAX_DRAWS {
            let mut bytes = [0u8; 4];
            state
                .rng
                .try_fill_bytes(&mut bytes)
                .map_err(|_| CryptoError::RandomFailed)?;
            let conv = u32::from_le_bytes(bytes);
            if conv != 0 && state.tracked.insert(conv) {
                state.remember(conv);
                return Ok(conv);
            }
        }
        Err(CryptoError::ConvIdExhausted {
            attempts: MAX_DRAWS,
        })
    }

    /// Number of ids issued so far.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.state.lock().issued
    }

    /// Number of recent ids currently held back from reuse.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.state.lock().tracked.len()
    }
}

impl Default for ConvIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConvIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvIdGenerator")
            .field("issued", &self.issued())
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Replays a fixed script of words, then zeros.
    struct Scripted(Vec<u32>);

    impl RngCore for Scripted {
        fn next_u32(&mut self) -> u32 {
            if self.0.is_empty() { 0 } else { self.0.remove(0) }
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(4) {
                let word = self.next_u32().to_le_bytes();
                chunk.copy_from_slice(&word[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for Scripted {}

    #[test]
    fn test_fill_random() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a).unwrap();
        fill_random(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_nonzero_and_unique() {
        let generator = ConvIdGenerator::with_rng(StdRng::seed_from_u64(7));
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generator.next().unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
        assert_eq!(generator.issued(), 1000);
    }

    #[test]
    fn test_seeded_generators_agree() {
        let a = ConvIdGenerator::with_rng(StdRng::seed_from_u64(42));
        let b = ConvIdGenerator::with_rng(StdRng::seed_from_u64(42));
        for _ in 0..10 {
            assert_eq!(a.next().unwrap(), b.next().unwrap());
        }
    }

    #[test]
    fn test_zero_and_repeats_redrawn() {
        let generator = ConvIdGenerator::with_rng(Scripted(vec![0, 5, 5, 0, 9]));
        assert_eq!(generator.next().unwrap(), 5);
        assert_eq!(generator.next().unwrap(), 9);
    }

    #[test]
    fn test_tracked_ids_stay_bounded() {
        let generator = ConvIdGenerator::with_rng(StdRng::seed_from_u64(11));
        for _ in 0..RECENT_IDS * 3 {
            generator.next().unwrap();
        }
        assert_eq!(generator.issued(), RECENT_IDS * 3);
        assert_eq!(generator.tracked(), RECENT_IDS);
    }

    #[test]
    fn test_evicted_id_may_return() {
        let mut script = vec![5];
        script.extend(1000..1000 + RECENT_IDS as u32);
        script.push(5);
        let generator = ConvIdGenerator::with_rng(Scripted(script));
        assert_eq!(generator.next().unwrap(), 5);
        for expected in 1000..1000 + RECENT_IDS as u32 {
            assert_eq!(generator.next().unwrap(), expected);
        }
        assert_eq!(generator.next().unwrap(), 5);
        assert_eq!(generator.tracked(), RECENT_IDS);
    }

    #[test]
    fn test_exhaustion_reported() {
        let generator = ConvIdGenerator::with_rng(Scripted(vec![]));
        assert!(matches!(
            generator.next(),
            Err(CryptoError::ConvIdExhausted { .. })
        ));
    }

    #[test]
    fn test_shared_is_singleton() {
        let a = ConvIdGenerator::shared();
        let b = ConvIdGenerator::shared();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
