use crate::replica::ReplicaId;
use std::num::ParseFloatError;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Failed to parse swap matrix entry '{entry}' in row {row}: {source}")]
    InvalidEntry {
        row: usize,
        entry: String,
        source: ParseFloatError,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Exchange eligibility of replica pairs, row `i` belongs to replica `i`
pub struct SwapMatrix {
    rows: Vec<Vec<f64>>,
}

impl SwapMatrix {
    #[cfg(test)]
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self { rows }
    }

    /// Parse whitespace separated numbers, one row per non empty line
    pub fn parse(output: &str) -> Result<Self, ExchangeError> {
        let rows = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(row, line)| {
                line.split_whitespace()
                    .map(|entry| {
                        entry.parse::<f64>().map_err(|source| ExchangeError::InvalidEntry {
                            row,
                            entry: entry.to_owned(),
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rows })
    }

    /// Assemble the matrix from per replica outputs, each output being one column
    pub fn from_columns<S: AsRef<str>>(columns: &[S]) -> Result<Self, ExchangeError> {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(column, output)| {
                output
                    .as_ref()
                    .split_whitespace()
                    .map(|entry| {
                        entry.parse::<f64>().map_err(|source| ExchangeError::InvalidEntry {
                            row: column,
                            entry: entry.to_owned(),
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let height = columns.iter().map(Vec::len).max().unwrap_or(0);
        let rows = (0..height)
            .map(|row| {
                columns
                    .iter()
                    .map(|column| column.get(row).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();

        Ok(Self { rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (
            self.rows.len(),
            self.rows.iter().map(Vec::len).max().unwrap_or(0),
        )
    }

    /// Column holding the maximum of row `replica`, the first one wins ties. Replicas without a
    /// row stay with themselves.
    pub fn partner(&self, replica: ReplicaId) -> ReplicaId {
        self.rows
            .get(replica)
            .and_then(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, value)| !value.is_nan())
                    .fold(None, |best: Option<(usize, f64)>, (column, value)| match best {
                        Some((_, max)) if max >= *value => best,
                        _ => Some((column, *value)),
                    })
            })
            .map_or(replica, |(column, _)| column)
    }

    /// Mutual partner pairs `(a, b)` with `a < b` among the first `replicas` replicas, in order
    /// of `a`. A choice that isn't returned by the partner is dropped.
    pub fn exchange_pairs(&self, replicas: usize) -> Vec<(ReplicaId, ReplicaId)> {
        let mut pairs = Vec::new();

        for replica in 0..replicas {
            let partner = self.partner(replica);

            if partner == replica {
                continue;
            }
            if partner >= replicas {
                warn!(replica, partner, "Swap matrix selected a partner that doesn't exist, ignoring");
                continue;
            }
            if self.partner(partner) != replica {
                warn!(replica, partner, "Partner choice is not mutual, ignoring");
                continue;
            }
            if replica < partner {
                pairs.push((replica, partner));
            }
        }

        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_rows() {
        let matrix = SwapMatrix::parse("0 1 0\n1 0 0\n\n0 0 1\n").unwrap();

        assert_eq!(matrix.dimensions(), (3, 3));
        assert_eq!(matrix.partner(0), 1);
        assert_eq!(matrix.partner(1), 0);
        assert_eq!(matrix.partner(2), 2);
        assert_eq!(matrix.exchange_pairs(3), vec![(0, 1)]);
    }

    #[test]
    fn parse_invalid_entry() {
        assert!(matches!(
            SwapMatrix::parse("0 1\n1 x\n"),
            Err(ExchangeError::InvalidEntry { row: 1, .. })
        ));
    }

    #[test]
    fn empty_output_means_no_exchange() {
        let matrix = SwapMatrix::parse("").unwrap();

        assert!(matrix.is_empty());
        assert_eq!(matrix.partner(4), 4);
        assert!(matrix.exchange_pairs(8).is_empty());
    }

    #[test]
    fn non_mutual_choice_is_dropped() {
        // 0 wants 1, 1 wants 2, 2 wants 1
        let matrix = SwapMatrix::new(vec![
            vec![0.1, 0.9, 0.0],
            vec![0.0, 0.2, 0.8],
            vec![0.0, 0.7, 0.3],
        ]);

        assert_eq!(matrix.exchange_pairs(3), vec![(1, 2)]);
    }

    #[test]
    fn partner_out_of_range() {
        let matrix = SwapMatrix::new(vec![vec![0.0, 0.0, 1.0], vec![0.0, 1.0, 0.0]]);

        assert!(matrix.exchange_pairs(2).is_empty());
    }

    #[test]
    fn columns_are_transposed() {
        let matrix = SwapMatrix::from_columns(&["0 1", "1 0 0.5"]).unwrap();

        assert_eq!(
            matrix,
            SwapMatrix::new(vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 0.5]])
        );
    }

    proptest! {
        #[test]
        fn pairs_are_mutual_and_disjoint(
            rows in prop::collection::vec(prop::collection::vec(0.0f64..1.0, 0..8), 0..8),
            replicas in 0usize..10,
        ) {
            let matrix = SwapMatrix::new(rows);
            let pairs = matrix.exchange_pairs(replicas);
            let mut seen = Vec::new();

            for &(a, b) in pairs.iter() {
                prop_assert!(a < b && b < replicas);
                prop_assert_eq!(matrix.partner(a), b);
                prop_assert_eq!(matrix.partner(b), a);
                prop_assert!(!seen.contains(&a) && !seen.contains(&b));
                seen.extend([a, b]);
            }
        }
    }
}
