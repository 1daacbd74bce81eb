//! Processor affinity sets.
//!
//! An [`Affinity`] is an immutable set of CPU ids. Only the predefined
//! affinities (the set of every available CPU and each single CPU) and
//! generated singletons may pin a schedulable; larger generated sets exist
//! to bound the members of a group.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::config::num_cpus;
use crate::error::{RtError, RtResult};

/// Immutable CPU set.
#[derive(Clone, PartialEq, Eq)]
pub struct Affinity {
    cpus: Arc<BTreeSet<usize>>,
    predefined: bool,
}

impl Affinity {
    /// Every available CPU.
    pub fn all() -> Self {
        Self {
            cpus: Arc::new((0..num_cpus()).collect()),
            predefined: true,
        }
    }

    /// The predefined affinities: every CPU, then each CPU on its own.
    pub fn predefined_set() -> Vec<Affinity> {
        let mut set = vec![Self::all()];
        set.extend((0..num_cpus()).map(|cpu| Self {
            cpus: Arc::new(BTreeSet::from([cpu])),
            predefined: true,
        }));
        set
    }

    /// Generate an affinity from a CPU set.
    ///
    /// Fails with `ProcessorAffinity` for an empty set or an unknown CPU.
    pub fn generate(cpus: impl IntoIterator<Item = usize>) -> RtResult<Self> {
        let available = num_cpus();
        let cpus: BTreeSet<usize> = cpus.into_iter().collect();
        if cpus.is_empty() {
            return Err(RtError::ProcessorAffinity("affinity must name at least one CPU"));
        }
        if cpus.iter().any(|&cpu| cpu >= available) {
            return Err(RtError::ProcessorAffinity("affinity names an unavailable CPU"));
        }
        Ok(Self {
            cpus: Arc::new(cpus),
            predefined: false,
        })
    }

    /// Single-CPU affinity.
    pub fn single(cpu: usize) -> RtResult<Self> {
        Self::generate([cpu])
    }

    /// Number of CPUs in the set.
    pub fn cardinality(&self) -> usize {
        self.cpus.len()
    }

    /// Whether `cpu` is in the set.
    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// CPUs in ascending order.
    pub fn cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// Whether this affinity may pin a single schedulable.
    pub fn is_valid(&self) -> bool {
        self.predefined || self.cardinality() == 1
    }

    /// Fail with `ProcessorAffinity` unless [`Affinity::is_valid`].
    pub fn ensure_valid(&self) -> RtResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(RtError::ProcessorAffinity("multi-CPU generated affinity cannot pin a schedulable"))
        }
    }
}

impl Default for Affinity {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Affinity")
            .field("cpus", &self.cpus)
            .field("predefined", &self.predefined)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(Affinity::all().is_valid());
        assert!(Affinity::single(0).unwrap().is_valid());
        assert!(Affinity::predefined_set().iter().all(Affinity::is_valid));
        if num_cpus() > 1 {
            let pair = Affinity::generate([0, 1]).unwrap();
            assert_eq!(pair.cardinality(), 2);
            assert!(!pair.is_valid());
            assert!(matches!(pair.ensure_valid(), Err(RtError::ProcessorAffinity(_))));
        }
    }

    #[test]
    fn test_generate_rejects_bad_sets() {
        assert!(Affinity::generate(Vec::new()).is_err());
        assert!(Affinity::single(usize::MAX).is_err());
    }

    #[test]
    fn test_duplicates_collapse() {
        let a = Affinity::generate([0, 0, 0]).unwrap();
        assert_eq!(a.cardinality(), 1);
        assert!(a.contains(0));
        assert_eq!(a.cpus().collect::<Vec<_>>(), vec![0]);
    }
}
