//! The ordered chain of data sources a build processes in turn: one or more
//! bounded snapshots followed by an unbounded tailing change-log.

use serde::{Deserialize, Serialize};

/// Kind of data source within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Bounded bulk snapshot.
    Snapshot,
    /// Unbounded, continuously-appended change-log. Offsets are timestamps.
    Tailing,
}

/// One entry of the chain. The orchestrator never interprets `description`;
/// it is handed to workers verbatim so the reader can connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDesc {
    pub name: String,
    pub kind: SourceKind,
    pub description: String,
}

impl DataSourceDesc {
    pub fn is_tailing(&self) -> bool {
        self.kind == SourceKind::Tailing
    }

    /// Tailing readers report consumable checkpoints back; snapshot readers
    /// do not.
    pub fn supports_checkpoint(&self) -> bool {
        self.is_tailing()
    }
}

/// Ordered sequence of source descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceChain {
    sources: Vec<DataSourceDesc>,
}

impl DataSourceChain {
    pub fn new(sources: Vec<DataSourceDesc>) -> Self {
        DataSourceChain { sources }
    }

    pub fn get(&self, idx: u32) -> Option<&DataSourceDesc> {
        self.sources.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn is_last(&self, idx: u32) -> bool {
        !self.is_empty() && idx as usize == self.sources.len() - 1
    }

    pub fn is_tailing(&self, idx: u32) -> bool {
        self.get(idx).is_some_and(DataSourceDesc::is_tailing)
    }

    /// Whether any source in the chain is a tailing one. An incremental step
    /// cannot run without it.
    pub fn has_tailing(&self) -> bool {
        self.sources.iter().any(DataSourceDesc::is_tailing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DataSourceChain {
        DataSourceChain::new(vec![
            DataSourceDesc {
                name: "full-dump".to_string(),
                kind: SourceKind::Snapshot,
                description: "hdfs://dump/part-*".to_string(),
            },
            DataSourceDesc {
                name: "changelog".to_string(),
                kind: SourceKind::Tailing,
                description: "broker://changelog".to_string(),
            },
        ])
    }

    #[test]
    fn test_chain_lookup() {
        let chain = chain();
        assert_eq!(chain.len(), 2);
        assert!(!chain.is_tailing(0));
        assert!(chain.is_tailing(1));
        assert!(chain.is_last(1));
        assert!(!chain.is_last(0));
        assert!(chain.get(2).is_none());
        assert!(chain.has_tailing());
    }

    #[test]
    fn test_empty_chain() {
        let chain = DataSourceChain::default();
        assert!(chain.is_empty());
        assert!(!chain.is_last(0));
        assert!(!chain.has_tailing());
    }
}
