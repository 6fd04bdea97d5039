use std::{net::Ipv4Addr, num::NonZeroUsize};

use ipstat_common::decode_key;

use crate::table::{CounterTable, TableError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Entry {
    pub(crate) address: Ipv4Addr,
    pub(crate) bytes: u64,
}

/// Counter table contents ordered by byte count, highest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct RankedSnapshot {
    entries: Vec<Entry>,
}

impl RankedSnapshot {
    /// Sorts `entries` by byte count and keeps the first `limit`. The sort is stable, so rows
    /// with equal counts keep the order they were read in.
    pub(crate) fn rank(mut entries: Vec<Entry>, limit: Option<NonZeroUsize>) -> Self {
        entries.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        if let Some(limit) = limit {
            entries.truncate(limit.get());
        }
        Self { entries }
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Reads one pass over `table` and ranks it. The first iteration error aborts the pass.
pub(crate) fn read<T: CounterTable + ?Sized>(
    table: &T,
    limit: Option<NonZeroUsize>,
) -> Result<RankedSnapshot, TableError> {
    let mut entries = Vec::new();
    for entry in table.entries() {
        let (key, bytes) = entry?;
        entries.push(Entry {
            address: decode_key(key),
            bytes,
        });
    }
    Ok(RankedSnapshot::rank(entries, limit))
}
