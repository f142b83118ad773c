/*!
    Deterministic randomness for reproducible tests

    Backoff jitter and tagged channel ids both draw random numbers; these
    helpers pin them to a seed.
*/

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

use crate::core_connection::JitterSource;

/// Default seed for deterministic tests
pub const DEFAULT_TEST_SEED: u64 = 42;

/// Create a deterministic RNG with the default seed
pub fn test_rng() -> StdRng {
    test_rng_with_seed(DEFAULT_TEST_SEED)
}

/// Create a deterministic RNG with a custom seed
pub fn test_rng_with_seed(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Jitter source replaying a seeded sequence
pub fn seeded_jitter(seed: u64) -> JitterSource {
    let rng = Mutex::new(test_rng_with_seed(seed));
    Arc::new(move || rng.lock().unwrap_or_else(|e| e.into_inner()).random::<f64>())
}

/// Jitter source that always returns `value`
pub fn fixed_jitter(value: f64) -> JitterSource {
    Arc::new(move || value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_is_deterministic() {
        let mut rng1 = test_rng();
        let mut rng2 = test_rng();

        for _ in 0..100 {
            assert_eq!(rng1.random::<u64>(), rng2.random::<u64>());
        }
    }

    #[test]
    fn test_seeded_jitter_replays() {
        let a = seeded_jitter(7);
        let b = seeded_jitter(7);
        let first: Vec<f64> = (0..10).map(|_| a()).collect();
        let second: Vec<f64> = (0..10).map(|_| b()).collect();

        assert_eq!(first, second);
        assert!(first.iter().all(|r| (0.0..1.0).contains(r)));
    }
}
