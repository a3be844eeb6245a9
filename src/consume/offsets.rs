//! Starting-offset resolution.
//!
//! Each partition's retained range is queried once per consume run; the
//! starting offset is derived from the run flags with tail clamping so a
//! request for more history than the broker retains degrades to "everything
//! still there".

use crate::broker::BrokerConnection;
use crate::config::{ConsumeFlags, OffsetSpec};
use crate::error::Result;

/// A partition's retained offset range.
///
/// `newest` is the high-water mark (exclusive); `oldest` the lowest retained
/// offset. `oldest <= newest` always holds for broker-reported ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffsets {
    pub oldest: i64,
    pub newest: i64,
}

impl PartitionOffsets {
    /// True when the partition holds no retained records.
    pub fn is_empty(&self) -> bool {
        self.newest == self.oldest
    }
}

/// Query the broker for a partition's retained range.
pub async fn resolve_range(
    conn: &dyn BrokerConnection,
    topic: &str,
    partition: i32,
) -> Result<PartitionOffsets> {
    conn.offset_range(topic, partition).await
}

/// Compute the offset consumption starts at for one partition.
///
/// `--tail N` takes precedence over the offset flag and clamps to the
/// retained range: `max(newest - N, oldest)`.
pub fn starting_offset(flags: &ConsumeFlags, range: PartitionOffsets) -> Result<i64> {
    let spec = flags.offset_spec()?;
    let mut start = match spec {
        OffsetSpec::Oldest => range.oldest,
        OffsetSpec::Newest => range.newest,
        OffsetSpec::Literal(offset) => offset,
    };
    if flags.tail > 0 {
        start = (range.newest - flags.tail).max(range.oldest);
    }
    Ok(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn flags_with(offset: &str, tail: i64) -> ConsumeFlags {
        ConsumeFlags {
            offset: offset.to_string(),
            tail,
            ..Default::default()
        }
    }

    #[test]
    fn test_starting_offset_oldest_and_newest() {
        let range = PartitionOffsets {
            oldest: 3,
            newest: 42,
        };
        assert_eq!(starting_offset(&flags_with("oldest", 0), range).unwrap(), 3);
        assert_eq!(
            starting_offset(&flags_with("newest", 0), range).unwrap(),
            42
        );
    }

    #[test]
    fn test_starting_offset_literal() {
        let range = PartitionOffsets {
            oldest: 0,
            newest: 100,
        };
        assert_eq!(starting_offset(&flags_with("7", 0), range).unwrap(), 7);
    }

    #[test]
    fn test_starting_offset_rejects_malformed_literal() {
        let range = PartitionOffsets {
            oldest: 0,
            newest: 100,
        };
        assert!(matches!(
            starting_offset(&flags_with("seven", 0), range),
            Err(Error::OffsetParse(_))
        ));
    }

    #[test]
    fn test_tail_overrides_offset_flag() {
        let range = PartitionOffsets {
            oldest: 0,
            newest: 100,
        };
        // tail wins even when the flag says oldest
        assert_eq!(
            starting_offset(&flags_with("oldest", 10), range).unwrap(),
            90
        );
        assert_eq!(
            starting_offset(&flags_with("newest", 10), range).unwrap(),
            90
        );
    }

    #[test]
    fn test_tail_clamps_to_retained_range() {
        let range = PartitionOffsets {
            oldest: 40,
            newest: 50,
        };
        // Asking for more history than retained starts at oldest.
        assert_eq!(
            starting_offset(&flags_with("oldest", 1000), range).unwrap(),
            40
        );
    }

    #[test]
    fn test_tail_scenario_two_partitions() {
        // newest [100, 50], oldest [0, 0], tail=10 -> starts [90, 40]
        let p0 = PartitionOffsets {
            oldest: 0,
            newest: 100,
        };
        let p1 = PartitionOffsets {
            oldest: 0,
            newest: 50,
        };
        let flags = flags_with("oldest", 10);
        assert_eq!(starting_offset(&flags, p0).unwrap(), 90);
        assert_eq!(starting_offset(&flags, p1).unwrap(), 40);
    }

    #[test]
    fn test_start_always_within_range() {
        for (oldest, newest) in [(0i64, 0i64), (0, 5), (10, 10), (7, 1000)] {
            let range = PartitionOffsets { oldest, newest };
            for tail in [0i64, 1, 5, 10_000] {
                let start = starting_offset(&flags_with("oldest", tail), range).unwrap();
                assert!(start >= oldest, "start {start} < oldest {oldest}");
                assert!(start <= newest, "start {start} > newest {newest}");
            }
        }
    }
}
