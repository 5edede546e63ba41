use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Join-semilattice with finite ascending chains.
pub(crate) trait Lattice: Clone + Debug + Eq {
    /// Join `other` into `self`; returns whether `self` strictly increased.
    fn join_with(&mut self, other: &Self) -> bool;

    fn leq(&self, other: &Self) -> bool {
        let mut joined = other.clone();
        !joined.join_with(self)
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        joined.join_with(other);
        joined
    }
}

/// May-set: join is union.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct MaySet<T: Ord>(pub(crate) BTreeSet<T>);

impl<T: Ord + Clone + Debug> Lattice for MaySet<T> {
    fn join_with(&mut self, other: &Self) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() != before
    }
}

impl<T: Ord> MaySet<T> {
    pub(crate) fn new() -> Self {
        Self(BTreeSet::new())
    }
}

/// Must-set: join is intersection, so larger sets sit lower in the order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct MustSet<T: Ord>(pub(crate) BTreeSet<T>);

impl<T: Ord + Clone + Debug> Lattice for MustSet<T> {
    fn join_with(&mut self, other: &Self) -> bool {
        let before = self.0.len();
        self.0.retain(|item| other.0.contains(item));
        self.0.len() != before
    }
}

impl<T: Ord> MustSet<T> {
    pub(crate) fn new() -> Self {
        Self(BTreeSet::new())
    }
}

/// Pointwise map; a missing key is bottom.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct MapLattice<K: Ord, V>(pub(crate) BTreeMap<K, V>);

impl<K, V> Lattice for MapLattice<K, V>
where
    K: Ord + Clone + Debug,
    V: Lattice,
{
    fn join_with(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (key, value) in &other.0 {
            match self.0.get_mut(key) {
                Some(existing) => changed |= existing.join_with(value),
                None => {
                    self.0.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

impl<K: Ord, V> MapLattice<K, V> {
    pub(crate) fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.0.get(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        self.0.insert(key, value);
    }

    pub(crate) fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.0.retain(f);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter()
    }
}

/// Two-point lattice used for boolean "may" facts.
impl Lattice for bool {
    fn join_with(&mut self, other: &Self) -> bool {
        let changed = !*self && *other;
        *self |= *other;
        changed
    }
}
