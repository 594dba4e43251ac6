//! Ready-made successor generators
//!
//! - [`json`]: structural reductions of JSON documents
//! - [`Shuffled`]: randomized enumeration order for any generator

pub mod json;

pub use json::{RemoveArrayElements, RemoveObjectFields, SimplifyScalars};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::successor::{SuccessorGenerator, SuccessorIter};

/// Enumerates the successors of another generator in random order.
///
/// The inner enumeration is collected up front and shuffled, so this
/// generator is not lazy. Every call draws a fresh permutation from the
/// same seeded source, which makes runs reproducible for a fixed seed.
pub struct Shuffled<G> {
    inner: G,
    rng: Mutex<StdRng>,
}

impl<G> Shuffled<G> {
    /// Shuffle with a fixed seed
    pub fn new(inner: G, seed: u64) -> Self {
        Self::from_rng(inner, StdRng::seed_from_u64(seed))
    }

    /// Shuffle with an explicit random source
    pub fn from_rng(inner: G, rng: StdRng) -> Self {
        Self {
            inner,
            rng: Mutex::new(rng),
        }
    }
}

impl<S, G> SuccessorGenerator<S> for Shuffled<G>
where
    S: Send,
    G: SuccessorGenerator<S>,
{
    fn name(&self) -> &str {
        "shuffled"
    }

    fn successors<'a>(&'a self, state: &'a S) -> SuccessorIter<'a, S> {
        let mut all: Vec<_> = self.inner.successors(state).collect();
        all.shuffle(&mut *self.rng.lock());
        Box::new(all.into_iter())
    }
}
