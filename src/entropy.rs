//! Random data generation.
//!
//! This uses a ChaCha-based generator seeded once per process from the
//! system clock and process id. It backs TCP initial sequence numbers and
//! is not meant as a general cryptographic source.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};

static POOL: Mutex<Option<ChaCha20Rng>> = Mutex::new(None);

fn seed_entropy() -> [u8; 32] {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_nanos())
		.unwrap_or_default();
	let pid = std::process::id();

	let mut seed = [0u8; 32];
	seed[..16].copy_from_slice(&nanos.to_le_bytes());
	seed[16..20].copy_from_slice(&pid.to_le_bytes());
	seed
}

/// Fills `buf` with random data.
pub fn read(buf: &mut [u8]) {
	let pool = &mut *POOL.lock().unwrap();
	let pool = match pool {
		Some(pool) => pool,
		pool @ None => pool.insert(ChaCha20Rng::from_seed(seed_entropy())),
	};

	pool.fill_bytes(buf);
}

/// Returns a random `u32`.
pub fn random_u32() -> u32 {
	let mut buf = [0u8; 4];
	read(&mut buf);
	u32::from_le_bytes(buf)
}
