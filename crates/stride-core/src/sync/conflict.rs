//! Local vs remote resolution for cloud documents

use crate::models::SyncMeta;

/// The parts of sync metadata that order two versions of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub version: i64,
    pub last_synced_at: Option<i64>,
}

impl From<SyncMeta> for VersionStamp {
    fn from(meta: SyncMeta) -> Self {
        Self {
            version: meta.version,
            last_synced_at: meta.last_synced_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
}

/// Decides which side of a cloud conflict wins.
///
/// Implementations must be deterministic: the same inputs always yield the
/// same resolution.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: VersionStamp, remote: VersionStamp) -> Resolution;
}

/// Higher version wins; on a tie the later `last_synced_at` wins (absent sorts
/// lowest); a full tie keeps the local copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionResolver;

impl ConflictResolver for VersionResolver {
    fn resolve(&self, local: VersionStamp, remote: VersionStamp) -> Resolution {
        let local_key = (local.version, local.last_synced_at);
        let remote_key = (remote.version, remote.last_synced_at);
        if remote_key > local_key {
            Resolution::UseRemote
        } else {
            Resolution::UseLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn stamp(version: i64, last_synced_at: Option<i64>) -> VersionStamp {
        VersionStamp {
            version,
            last_synced_at,
        }
    }

    #[test]
    fn test_higher_version_wins() {
        let resolver = VersionResolver;
        assert_eq!(
            resolver.resolve(stamp(2, Some(10)), stamp(3, Some(1))),
            Resolution::UseRemote
        );
        assert_eq!(
            resolver.resolve(stamp(4, None), stamp(3, Some(99))),
            Resolution::UseLocal
        );
    }

    #[test]
    fn test_equal_versions_compare_sync_time() {
        let resolver = VersionResolver;
        assert_eq!(
            resolver.resolve(stamp(2, Some(10)), stamp(2, Some(11))),
            Resolution::UseRemote
        );
        assert_eq!(
            resolver.resolve(stamp(2, Some(11)), stamp(2, Some(10))),
            Resolution::UseLocal
        );
        assert_eq!(
            resolver.resolve(stamp(2, None), stamp(2, Some(1))),
            Resolution::UseRemote
        );
    }

    #[test]
    fn test_full_tie_keeps_local_every_time() {
        let resolver = VersionResolver;
        for _ in 0..3 {
            assert_eq!(
                resolver.resolve(stamp(5, Some(7)), stamp(5, Some(7))),
                Resolution::UseLocal
            );
            assert_eq!(resolver.resolve(stamp(0, None), stamp(0, None)), Resolution::UseLocal);
        }
    }
}
