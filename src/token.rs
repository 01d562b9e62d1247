use std::sync::Mutex;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random `[A-Za-z0-9]` string of exactly `len` characters.
pub fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Source of booking identifiers and access tokens.
pub trait TokenSource: Send + Sync {
    fn token(&self, len: usize) -> String;
}

/// Draws from the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngTokens;

impl TokenSource for ThreadRngTokens {
    fn token(&self, len: usize) -> String {
        random_token(&mut rand::thread_rng(), len)
    }
}

/// Deterministic source for tests.
pub struct SeededTokens {
    rng: Mutex<StdRng>,
}

impl SeededTokens {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl TokenSource for SeededTokens {
    fn token(&self, len: usize) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        random_token(&mut *rng, len)
    }
}
