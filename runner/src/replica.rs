use crate::{batching::GroupSize, config::DimensionConfig};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type ReplicaId = usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Replica {0} does not exist")]
    UnknownReplica(ReplicaId),
    #[error("Replica {replica} has no dimension {dimension}")]
    MissingDimension { replica: ReplicaId, dimension: String },
    #[error("Checkpoint does not match the configured dimensions")]
    Mismatch,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Type tag of an exchange axis
pub enum DimensionKind {
    Temperature,
    Umbrella,
    Salt,
}

impl DimensionKind {
    /// salt exchanges need an additional per replica exchange wave
    pub fn is_salt(self) -> bool {
        self == Self::Salt
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    pub params: Vec<f64>,
    pub cores: usize,
}

impl Dimension {
    pub fn from_config(config: &DimensionConfig, replica_cores: usize) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            params: config.params.clone(),
            cores: config.cores.unwrap_or(replica_cores),
        }
    }

    pub fn replicas(&self) -> usize {
        self.params.len()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ReplicaDimension {
    #[serde(rename = "type")]
    pub kind: DimensionKind,
    pub par: f64,
    /// ladder position of `par`
    pub seq: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub dims: BTreeMap<String, ReplicaDimension>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Replicas that are scheduled together for one sub-step
pub struct Group {
    pub index: usize,
    pub replicas: Vec<ReplicaId>,
}

impl GroupSize for Group {
    fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
/// All replicas of a run, `replicas[i].id == i` holds at all times
pub struct ReplicaSet {
    replicas: Vec<Replica>,
}

impl ReplicaSet {
    /// One replica for every point of the cartesian product of the dimension ladders, the
    /// first dimension varies slowest.
    pub fn new(dimensions: &[Dimension]) -> Self {
        let replicas = dimensions
            .iter()
            .map(|dimension| 0..dimension.replicas())
            .multi_cartesian_product()
            .enumerate()
            .map(|(id, slots)| Replica {
                id,
                dims: dimensions
                    .iter()
                    .zip(slots)
                    .map(|(dimension, seq)| {
                        (
                            dimension.name.clone(),
                            ReplicaDimension {
                                kind: dimension.kind,
                                par: dimension.params[seq],
                                seq,
                            },
                        )
                    })
                    .collect(),
            })
            .collect();

        Self { replicas }
    }

    /// restore from persisted replicas, verifying ids and dimensions
    pub fn restore(replicas: Vec<Replica>, dimensions: &[Dimension]) -> Result<Self, ReplicaError> {
        for (index, replica) in replicas.iter().enumerate() {
            if replica.id != index {
                return Err(ReplicaError::Mismatch);
            }
            for dimension in dimensions {
                if !replica.dims.contains_key(&dimension.name) {
                    return Err(ReplicaError::MissingDimension {
                        replica: replica.id,
                        dimension: dimension.name.clone(),
                    });
                }
            }
        }

        Ok(Self { replicas })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    pub fn get(&self, id: ReplicaId) -> Result<&Replica, ReplicaError> {
        self.replicas.get(id).ok_or(ReplicaError::UnknownReplica(id))
    }

    pub fn as_slice(&self) -> &[Replica] {
        &self.replicas
    }

    /// Exchange groups along `dimension`: replicas that share the ladder position in every
    /// other dimension, ordered by their position in `dimension`.
    pub fn exchange_groups(&self, dimension: &str) -> Vec<Group> {
        let mut groups: BTreeMap<Vec<usize>, Vec<(usize, ReplicaId)>> = BTreeMap::new();

        for replica in self.replicas.iter() {
            let key = replica
                .dims
                .iter()
                .filter(|(name, _)| name.as_str() != dimension)
                .map(|(_, state)| state.seq)
                .collect_vec();
            let seq = replica.dims.get(dimension).map_or(0, |state| state.seq);

            groups.entry(key).or_default().push((seq, replica.id));
        }

        groups
            .into_values()
            .enumerate()
            .map(|(index, mut members)| {
                members.sort_unstable();

                Group {
                    index,
                    replicas: members.into_iter().map(|(_, id)| id).collect(),
                }
            })
            .collect()
    }

    /// every replica in its own group, ordered by id
    pub fn single_groups(&self) -> Vec<Group> {
        self.replicas
            .iter()
            .map(|replica| Group {
                index: replica.id,
                replicas: vec![replica.id],
            })
            .collect()
    }

    /// Swap the parameters of `a` and `b` along `dimension`. Both replicas are checked before
    /// either is touched, swapping a replica with itself does nothing.
    pub fn perform_swap(
        &mut self,
        a: ReplicaId,
        b: ReplicaId,
        dimension: &str,
    ) -> Result<(), ReplicaError> {
        for id in [a, b] {
            if !self.get(id)?.dims.contains_key(dimension) {
                return Err(ReplicaError::MissingDimension {
                    replica: id,
                    dimension: dimension.to_owned(),
                });
            }
        }

        if a == b {
            return Ok(());
        }

        let (low, high) = (a.min(b), a.max(b));
        let (head, tail) = self.replicas.split_at_mut(high);

        if let (Some(first), Some(second)) = (
            head[low].dims.get_mut(dimension),
            tail[0].dims.get_mut(dimension),
        ) {
            std::mem::swap(&mut first.par, &mut second.par);
            std::mem::swap(&mut first.seq, &mut second.seq);
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
/// Resumption point of a run, cycles start at 1
pub struct CycleCursor {
    pub cycle: usize,
    pub dim: usize,
}

impl Default for CycleCursor {
    fn default() -> Self {
        Self { cycle: 1, dim: 0 }
    }
}

impl CycleCursor {
    /// move to the next dimension, wrapping into the next cycle
    pub fn advance(&mut self, dim_count: usize) {
        self.dim += 1;

        if self.dim >= dim_count {
            self.dim = 0;
            self.cycle += 1;
        }
    }

    pub fn is_exhausted(&self, nr_cycles: usize) -> bool {
        self.cycle > nr_cycles
    }

    /// tag used for telemetry and unit names
    pub fn tag(&self) -> String {
        format!("c{}_d{}", self.cycle, self.dim)
    }
}
