//! Distribution of a container's topic selection over its sub-units.
//!
//! Group-managed selections give every sub-unit the same subscription and let
//! the broker balance partitions between group members. Manual assignments
//! are split by range: sub-unit `i` gets a contiguous slice, the first
//! `len % n` sub-units one partition more than the rest.
//!
//! With 7 partitions and 3 sub-units:
//! - sub-unit 0: partitions [0, 1, 2]
//! - sub-unit 1: partitions [3, 4]
//! - sub-unit 2: partitions [5, 6]

use regex::Regex;

use crate::endpoint::TopicSelection;
use crate::record::TopicPartitionOffset;

/// What one sub-unit consumes.
#[derive(Debug, Clone)]
pub enum UnitSelection {
    Subscribe(Vec<String>),
    Pattern(Regex),
    Assign(Vec<TopicPartitionOffset>),
}

/// Plan the selection of each sub-unit.
///
/// For manual assignment the number of sub-units is capped at the number of
/// partitions, so every sub-unit owns at least one partition.
pub fn plan(selection: &TopicSelection, concurrency: usize) -> Vec<UnitSelection> {
    match selection {
        TopicSelection::Topics(topics) => {
            vec![UnitSelection::Subscribe(topics.clone()); concurrency]
        }
        TopicSelection::Pattern(pattern) => {
            vec![UnitSelection::Pattern(pattern.clone()); concurrency]
        }
        TopicSelection::Partitions(partitions) => split_range(partitions, concurrency)
            .into_iter()
            .map(UnitSelection::Assign)
            .collect(),
    }
}

fn split_range(
    partitions: &[TopicPartitionOffset],
    concurrency: usize,
) -> Vec<Vec<TopicPartitionOffset>> {
    let units = concurrency.min(partitions.len()).max(1);
    let base = partitions.len() / units;
    let extra = partitions.len() % units;

    let mut out = Vec::with_capacity(units);
    let mut start = 0;
    for unit in 0..units {
        let len = base + usize::from(unit < extra);
        out.push(partitions[start..start + len].to_vec());
        start += len;
    }
    out
}
