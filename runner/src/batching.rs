use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("A single replica needs {per_replica_cores} cores but only {total_cores} are available")]
    Capacity {
        per_replica_cores: usize,
        total_cores: usize,
    },
}

/// Anything that is co-scheduled as one unit and occupies a number of replica slots
pub trait GroupSize {
    fn replica_count(&self) -> usize;
}

impl<T> GroupSize for Vec<T> {
    fn replica_count(&self) -> usize {
        self.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Ordered groups submitted together and waited on as one
pub struct Wave<G> {
    pub groups: Vec<G>,
}

impl<G: GroupSize> Wave<G> {
    pub fn replica_count(&self) -> usize {
        self.groups.iter().map(GroupSize::replica_count).sum()
    }

    pub fn core_demand(&self, per_replica_cores: usize) -> usize {
        self.replica_count() * per_replica_cores
    }
}

/// Partition `groups` into waves whose core demand fits into `total_cores`.
///
/// Groups are packed greedily in input order, concatenating the waves yields the input again.
/// A group that exceeds the budget on its own is submitted as a singleton wave. Only a budget
/// that can't hold a single replica is an error.
pub fn plan_waves<G: GroupSize>(
    groups: Vec<G>,
    per_replica_cores: usize,
    total_cores: usize,
) -> Result<Vec<Wave<G>>, BatchError> {
    if groups.is_empty() {
        return Ok(Vec::new());
    }

    if total_cores == 0 || per_replica_cores > total_cores {
        return Err(BatchError::Capacity {
            per_replica_cores,
            total_cores,
        });
    }

    let mut waves = Vec::new();
    let mut current: Vec<G> = Vec::new();
    let mut current_count = 0;

    for group in groups {
        let size = group.replica_count();

        if (current_count + size) * per_replica_cores <= total_cores {
            current_count += size;
            current.push(group);

            continue;
        }

        if !current.is_empty() {
            waves.push(Wave {
                groups: std::mem::take(&mut current),
            });
        }

        if size * per_replica_cores > total_cores {
            warn!(
                replicas = size,
                "Group exceeds the core budget of {total_cores}, submitting it on its own"
            );
            waves.push(Wave {
                groups: vec![group],
            });
            current_count = 0;
        } else {
            current_count = size;
            current.push(group);
        }
    }

    if !current.is_empty() {
        waves.push(Wave { groups: current });
    }

    for (index, wave) in waves.iter().enumerate() {
        trace!(wave = index, cores = wave.core_demand(per_replica_cores), "Wave");
    }
    debug!(
        waves = waves.len(),
        "Planned waves with {per_replica_cores} cores per replica and a budget of {total_cores}"
    );

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn groups(sizes: &[usize]) -> Vec<Vec<usize>> {
        let mut next = 0;

        sizes
            .iter()
            .map(|size| {
                let group = (next..next + size).collect::<Vec<_>>();
                next += size;
                group
            })
            .collect()
    }

    fn shape(waves: &[Wave<Vec<usize>>]) -> Vec<usize> {
        waves.iter().map(|wave| wave.groups.len()).collect()
    }

    #[test]
    fn ten_singletons_on_four_cores() {
        let waves = plan_waves(groups(&[1; 10]), 1, 4).unwrap();

        assert_eq!(shape(&waves), vec![4, 4, 2]);
    }

    #[test]
    fn empty_input() {
        let waves = plan_waves(Vec::<Vec<usize>>::new(), 1, 4).unwrap();

        assert!(waves.is_empty());
    }

    #[test]
    fn oversized_group_gets_own_wave() {
        let waves = plan_waves(groups(&[2, 6, 1, 1]), 1, 4).unwrap();

        assert_eq!(shape(&waves), vec![1, 1, 2]);
        assert_eq!(waves[1].replica_count(), 6);
    }

    #[test]
    fn oversized_first_group() {
        let waves = plan_waves(groups(&[5, 3]), 1, 4).unwrap();

        assert_eq!(shape(&waves), vec![1, 1]);
    }

    #[test]
    fn multi_core_replicas() {
        let waves = plan_waves(groups(&[2, 2, 2]), 2, 8).unwrap();

        assert_eq!(shape(&waves), vec![2, 1]);
        assert_eq!(waves[0].core_demand(2), 8);
    }

    #[test]
    fn replica_larger_than_budget() {
        assert_eq!(
            plan_waves(groups(&[1]), 8, 4),
            Err(BatchError::Capacity {
                per_replica_cores: 8,
                total_cores: 4
            })
        );
        assert!(plan_waves(groups(&[1]), 1, 0).is_err());
    }

    proptest! {
        #[test]
        fn waves_fit_budget(
            sizes in prop::collection::vec(1usize..8, 0..40),
            per_replica_cores in 1usize..4,
            extra in 0usize..16,
        ) {
            let total_cores = per_replica_cores + extra;
            let waves = plan_waves(groups(&sizes), per_replica_cores, total_cores).unwrap();

            for wave in waves.iter() {
                prop_assert!(!wave.groups.is_empty());
                prop_assert!(
                    wave.core_demand(per_replica_cores) <= total_cores
                        || (wave.groups.len() == 1
                            && wave.groups[0].len() * per_replica_cores > total_cores)
                );
            }
        }

        #[test]
        fn waves_preserve_order(
            sizes in prop::collection::vec(1usize..8, 0..40),
            total_cores in 1usize..20,
        ) {
            let input = groups(&sizes);
            let waves = plan_waves(input.clone(), 1, total_cores).unwrap();
            let flattened = waves.into_iter().flat_map(|wave| wave.groups).collect::<Vec<_>>();

            prop_assert_eq!(flattened, input);
        }
    }
}
