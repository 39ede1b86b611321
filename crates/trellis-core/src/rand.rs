//! Deterministic randomness.
//!
//! Load balancing reaches for randomness in a couple of places: the random
//! policy's pick, and the hash fallback for requests with no hash of their
//! own. Everything routes through here so that setting `TRELLIS_SEED` makes
//! a run reproducible: a single seeded root rng hands each thread its own
//! seed on first use.

use std::cell::RefCell;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static ROOT_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| {
    let env_seed = std::env::var("TRELLIS_SEED")
        .ok()
        .and_then(|value| value.parse::<u64>().ok());

    Mutex::new(match env_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    })
});

thread_local! {
    static THREAD_RNG: RefCell<StdRng> = RefCell::new({
        let seed = ROOT_RNG.lock().unwrap().gen();
        StdRng::from_seed(seed)
    });
}

/// Call a function with this thread's rng. Prefer this over
/// `rand::thread_rng()`, which can't be seeded for deterministic tests.
pub(crate) fn with_thread_rng<F, T>(f: F) -> T
where
    F: FnMut(&mut StdRng) -> T,
{
    THREAD_RNG.with_borrow_mut(f)
}

pub(crate) fn random<T>() -> T
where
    rand::distributions::Standard: rand::distributions::Distribution<T>,
{
    with_thread_rng(|rng| rng.gen())
}
