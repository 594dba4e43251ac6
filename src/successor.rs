//! Successors and the generators that enumerate them
//!
//! A generator turns the current instance into a lazy, finite sequence of
//! candidate instances. Each candidate owns an independent copy of its
//! state, so nothing is ever aliased with the parent instance.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything that can be minimized.
///
/// The search never looks inside an instance. It clones it and writes it
/// to (and reads it from) a JSON state file.
pub trait Instance: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Instance for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A candidate next instance
#[derive(Debug, Clone, PartialEq)]
pub struct Successor<S> {
    /// The transformed instance
    pub state: S,
    /// Human-readable description of the transformation
    pub change: String,
}

impl<S> Successor<S> {
    /// Create a new successor
    pub fn new(state: S, change: impl Into<String>) -> Self {
        Self {
            state,
            change: change.into(),
        }
    }

    /// Consume the successor, keeping only its state
    pub fn into_state(self) -> S {
        self.state
    }
}

/// Lazy sequence of successors borrowed from a generator and its input
pub type SuccessorIter<'a, S> = Box<dyn Iterator<Item = Successor<S>> + Send + 'a>;

/// Enumerates successors of an instance.
///
/// Implementations must not mutate the input and must keep the order of a
/// single enumeration stable, because batch positions are mapped back to
/// successors by index. Different calls may enumerate in different orders.
pub trait SuccessorGenerator<S>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Enumerate the successors of `state`
    fn successors<'a>(&'a self, state: &'a S) -> SuccessorIter<'a, S>;
}

impl<S, G> SuccessorGenerator<S> for Box<G>
where
    G: SuccessorGenerator<S> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn successors<'a>(&'a self, state: &'a S) -> SuccessorIter<'a, S> {
        (**self).successors(state)
    }
}

/// Runs a list of generators one after the other.
///
/// Every successor of the first generator is yielded before any successor
/// of the second, and so on. A chain is itself a generator and can be
/// nested.
pub struct ChainGenerators<S> {
    generators: Vec<Box<dyn SuccessorGenerator<S>>>,
}

impl<S> ChainGenerators<S> {
    /// Create a chain from an ordered list of generators
    pub fn new(generators: Vec<Box<dyn SuccessorGenerator<S>>>) -> Self {
        Self { generators }
    }

    /// Append a generator to the end of the chain
    pub fn with(mut self, generator: impl SuccessorGenerator<S> + 'static) -> Self {
        self.generators.push(Box::new(generator));
        self
    }

    /// Number of chained generators
    pub fn len(&self) -> usize {
        self.generators.len()
    }

    /// Whether the chain holds no generator at all
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

impl<S> Default for ChainGenerators<S> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<S: Sync> SuccessorGenerator<S> for ChainGenerators<S> {
    fn name(&self) -> &str {
        "chain"
    }

    fn successors<'a>(&'a self, state: &'a S) -> SuccessorIter<'a, S> {
        Box::new(
            self.generators
                .iter()
                .flat_map(move |generator| generator.successors(state)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `state + offset + i` for `i` in `0..count`
    struct Offsets {
        offset: u32,
        count: u32,
    }

    impl SuccessorGenerator<u32> for Offsets {
        fn name(&self) -> &str {
            "offsets"
        }

        fn successors<'a>(&'a self, state: &'a u32) -> SuccessorIter<'a, u32> {
            Box::new((0..self.count).map(move |i| {
                Successor::new(state + self.offset + i, format!("add {}", self.offset + i))
            }))
        }
    }

    #[test]
    fn test_chain_exhausts_generators_in_order() {
        let chain = ChainGenerators::default()
            .with(Offsets { offset: 10, count: 3 })
            .with(Offsets { offset: 100, count: 2 });

        let states: Vec<u32> = chain.successors(&0).map(|s| s.state).collect();
        assert_eq!(states, vec![10, 11, 12, 100, 101]);
    }

    #[test]
    fn test_empty_chain_yields_nothing() {
        let chain: ChainGenerators<u32> = ChainGenerators::default();
        assert!(chain.is_empty());
        assert_eq!(chain.successors(&5).count(), 0);
    }

    #[test]
    fn test_nested_chains() {
        let inner = ChainGenerators::default()
            .with(Offsets { offset: 1, count: 1 })
            .with(Offsets { offset: 2, count: 1 });
        let outer = ChainGenerators::default()
            .with(inner)
            .with(Offsets { offset: 3, count: 1 });

        assert_eq!(outer.len(), 2);
        let changes: Vec<String> = outer.successors(&0).map(|s| s.change).collect();
        assert_eq!(changes, vec!["add 1", "add 2", "add 3"]);
    }

    #[test]
    fn test_enumeration_is_restartable() {
        let chain = ChainGenerators::default().with(Offsets { offset: 1, count: 4 });
        let first: Vec<u32> = chain.successors(&7).map(|s| s.state).collect();
        let second: Vec<u32> = chain.successors(&7).map(|s| s.state).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_successors_do_not_alias_input() {
        struct PushOne;

        impl SuccessorGenerator<Vec<u8>> for PushOne {
            fn name(&self) -> &str {
                "push-one"
            }

            fn successors<'a>(&'a self, state: &'a Vec<u8>) -> SuccessorIter<'a, Vec<u8>> {
                let mut next = state.clone();
                next.push(1);
                Box::new(std::iter::once(Successor::new(next, "push 1")))
            }
        }

        let original = vec![0u8];
        let successor = PushOne.successors(&original).next().unwrap();
        assert_eq!(original, vec![0]);
        assert_eq!(successor.into_state(), vec![0, 1]);
    }
}
