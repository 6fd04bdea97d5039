// Read side of the counter map shared with the kernel program.
//
// The kernel updates entries concurrently and without coordinating with us, so a single pass
// may see some keys before and some after an update. No lock is taken and nothing is written.

use aya::maps::{HashMap, Map, MapData, MapError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TableError {
    #[error("counter table unavailable: {0}")]
    Unavailable(#[from] MapError),
}

pub(crate) type TableEntries<'a> = Box<dyn Iterator<Item = Result<(u32, u64), TableError>> + 'a>;

/// A key to byte counter table, iterated in unspecified order.
///
/// An `Err` item is terminal: callers stop at the first one.
pub(crate) trait CounterTable: Send + Sync + 'static {
    fn entries(&self) -> TableEntries<'_>;
}

pub(crate) struct IpStatsTable {
    map: HashMap<MapData, u32, u64>,
}

impl IpStatsTable {
    pub(crate) fn from_map(map: Map) -> Result<Self, MapError> {
        Ok(Self {
            map: HashMap::try_from(map)?,
        })
    }
}

impl CounterTable for IpStatsTable {
    fn entries(&self) -> TableEntries<'_> {
        Box::new(self.map.iter().map(|entry| entry.map_err(TableError::from)))
    }
}
