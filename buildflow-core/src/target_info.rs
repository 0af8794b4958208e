//! Per-slot progress cache. Carries the best-known read position across
//! worker restarts while the fleet shape stays put; a reshape starts fresh
//! from the step's base offset. Offsets never regress on a stale report.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{BasicShape, Locator};
use crate::error::{Error, Result};

const TARGET_INFOS_FORMAT_VERSION: u32 = 1;

/// Best-known `(offset, user_data)` for one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub offset: i64,
    #[serde(default)]
    pub user_data: Bytes,
}

impl TargetInfo {
    fn at(offset: i64) -> Self {
        TargetInfo {
            offset,
            user_data: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfos {
    src: u32,
    partition_count: u32,
    parallelism: u32,
    targets: Vec<TargetInfo>,
}

#[derive(Serialize, Deserialize)]
struct TargetInfosDoc {
    version: u32,
    src: u32,
    partition_count: u32,
    parallelism: u32,
    targets: Vec<TargetInfo>,
}

impl TargetInfos {
    /// Folds per-worker candidate locators into the cache. A change of
    /// source, partition count, or parallelism discards everything and
    /// reinitializes each slot to `basic.offset`; otherwise a slot is
    /// overwritten only by a strictly greater offset.
    pub fn update(&mut self, basic: &BasicShape, candidates: &[Option<Locator>]) {
        if self.src != basic.src
            || self.partition_count != basic.partition_count
            || self.parallelism != basic.parallelism
            || self.targets.len() != basic.worker_count()
        {
            self.src = basic.src;
            self.partition_count = basic.partition_count;
            self.parallelism = basic.parallelism;
            self.targets = vec![TargetInfo::at(basic.offset); basic.worker_count()];
        }

        for (target, candidate) in self.targets.iter_mut().zip(candidates) {
            let Some(locator) = candidate else {
                continue;
            };
            if locator.offset > target.offset {
                target.offset = locator.offset;
                target.user_data = locator.user_data.clone();
            }
        }
    }

    /// Authoritative target for a slot, used to build worker assignments.
    pub fn get(&self, index: usize) -> Option<&TargetInfo> {
        self.targets.get(index)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn to_payload(&self) -> Result<String> {
        let doc = TargetInfosDoc {
            version: TARGET_INFOS_FORMAT_VERSION,
            src: self.src,
            partition_count: self.partition_count,
            parallelism: self.parallelism,
            targets: self.targets.clone(),
        };
        serde_json::to_string(&doc).map_err(|e| Error::Task(e.to_string()))
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        let doc: TargetInfosDoc = serde_json::from_str(payload)
            .map_err(|e| Error::UnsupportedFormat(format!("target infos payload: {e}")))?;
        if doc.version != TARGET_INFOS_FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "target infos format version {}",
                doc.version
            )));
        }
        Ok(TargetInfos {
            src: doc.src,
            partition_count: doc.partition_count,
            parallelism: doc.parallelism,
            targets: doc.targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::UNKNOWN_OFFSET;

    fn basic(src: u32, offset: i64, partition_count: u32, parallelism: u32) -> BasicShape {
        BasicShape {
            src,
            offset,
            partition_count,
            parallelism,
        }
    }

    #[test]
    fn test_first_update_initializes_from_base_offset() {
        let mut infos = TargetInfos::default();
        infos.update(
            &basic(0, UNKNOWN_OFFSET, 2, 1),
            &[Some(Locator::new(0, 5)), None],
        );
        assert_eq!(infos.get(0).unwrap().offset, 5);
        assert_eq!(infos.get(1).unwrap().offset, UNKNOWN_OFFSET);
    }

    #[test]
    fn test_monotonic_only() {
        let mut infos = TargetInfos::default();
        let shape = basic(0, 0, 2, 1);
        infos.update(&shape, &[Some(Locator::new(0, 10)), Some(Locator::new(0, 4))]);
        // stale report for slot 0, progress for slot 1
        infos.update(&shape, &[Some(Locator::new(0, 7)), Some(Locator::new(0, 6))]);
        assert_eq!(infos.get(0).unwrap().offset, 10);
        assert_eq!(infos.get(1).unwrap().offset, 6);
    }

    #[test]
    fn test_reset_on_source_switch() {
        let mut infos = TargetInfos::default();
        infos.update(&basic(0, 0, 2, 1), &[Some(Locator::new(0, 99)), None]);
        infos.update(&basic(1, 10, 2, 1), &[None, None]);
        assert_eq!(infos.get(0).unwrap().offset, 10);
        assert_eq!(infos.get(1).unwrap().offset, 10);
    }

    #[test]
    fn test_reset_on_reshape() {
        let mut infos = TargetInfos::default();
        infos.update(&basic(0, 0, 2, 1), &[Some(Locator::new(0, 42)), None]);
        infos.update(&basic(0, 3, 3, 3), &vec![None; 9]);
        assert_eq!(infos.len(), 9);
        for i in 0..9 {
            assert_eq!(infos.get(i).unwrap().offset, 3);
        }
    }

    #[test]
    fn test_user_data_follows_offset() {
        let mut infos = TargetInfos::default();
        let mut locator = Locator::new(0, 8);
        locator.user_data = Bytes::from_static(b"cursor-8");
        infos.update(&basic(0, 0, 1, 1), &[Some(locator)]);
        assert_eq!(infos.get(0).unwrap().user_data, Bytes::from_static(b"cursor-8"));
    }

    #[test]
    fn test_payload_round_trip() {
        let mut infos = TargetInfos::default();
        infos.update(
            &basic(2, 7, 2, 1),
            &[Some(Locator::new(2, 11)), Some(Locator::new(2, 9))],
        );
        let payload = infos.to_payload().unwrap();
        let restored = TargetInfos::from_payload(&payload).unwrap();
        assert_eq!(restored, infos);
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let payload = serde_json::json!({
            "version": 99,
            "src": 0,
            "partition_count": 1,
            "parallelism": 1,
            "targets": [],
        })
        .to_string();
        let err = TargetInfos::from_payload(&payload).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
