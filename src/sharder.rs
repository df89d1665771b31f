//! Deterministic bucketing of identities.
use std::sync::Arc;

/// Number of buckets used for rollout percentages and variant weights.
pub const TOTAL_BUCKETS: u64 = 100;

pub trait Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64;
}

/// The default sharder: first four bytes of the md5 digest, big-endian.
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as u64) % total_shards
    }
}

/// Reproduces the 31-multiplier 32-bit string hash over UTF-16 code units used by earlier
/// clients. Use it only to keep buckets compatible with assignments made by those clients.
pub struct LegacySharder;

impl Sharder for LegacySharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        let hash = input
            .encode_utf16()
            .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32));
        (hash as i64).unsigned_abs() % total_shards
    }
}

/// Which input is fed to the sharder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BucketingMode {
    /// Hash `identity:scope`, where scope is the flag name or experiment id. Unrelated flags and
    /// experiments get independent populations.
    #[default]
    Salted,
    /// Hash the identity alone. Every rollout and experiment sees the same bucket for a given
    /// identity, so exposure is correlated across them.
    IdentityOnly,
}

/// Maps an identity into `[0, 100)` for a given scope.
#[derive(Clone)]
pub struct BucketHasher {
    sharder: Arc<dyn Sharder + Send + Sync>,
    mode: BucketingMode,
}

impl BucketHasher {
    pub fn new(sharder: Arc<dyn Sharder + Send + Sync>, mode: BucketingMode) -> BucketHasher {
        BucketHasher { sharder, mode }
    }

    pub fn mode(&self) -> BucketingMode {
        self.mode
    }

    pub fn bucket(&self, identity: &str, scope: &str) -> u32 {
        let shard = match self.mode {
            BucketingMode::Salted => self
                .sharder
                .get_shard(&format!("{identity}:{scope}"), TOTAL_BUCKETS),
            BucketingMode::IdentityOnly => self.sharder.get_shard(identity, TOTAL_BUCKETS),
        };
        shard as u32
    }
}

impl Default for BucketHasher {
    fn default() -> BucketHasher {
        BucketHasher::new(Arc::new(Md5Sharder), BucketingMode::default())
    }
}

impl std::fmt::Debug for BucketHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketHasher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u64) -> u64 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BucketHasher, BucketingMode, LegacySharder, Md5Sharder, Sharder};

    #[test]
    fn test_md5_sharder() {
        assert_eq!(Md5Sharder.get_shard("test-input", 10_000), 5619);
        assert_eq!(Md5Sharder.get_shard("alice", 10_000), 3170);
        assert_eq!(Md5Sharder.get_shard("bob", 10_000), 7420);
        assert_eq!(Md5Sharder.get_shard("charlie", 10_000), 7497);
    }

    #[test]
    fn test_legacy_sharder() {
        assert_eq!(LegacySharder.get_shard("alice", u64::MAX), 92_903_040);
        assert_eq!(LegacySharder.get_shard("bob", u64::MAX), 97_717);
        assert_eq!(LegacySharder.get_shard("alice", 100), 40);
        assert_eq!(LegacySharder.get_shard("", 100), 0);
    }

    #[test]
    fn identity_only_ignores_scope() {
        let hasher = BucketHasher::new(Arc::new(Md5Sharder), BucketingMode::IdentityOnly);
        assert_eq!(hasher.bucket("alice", "flag_a"), 70);
        assert_eq!(hasher.bucket("alice", "flag_b"), 70);
    }

    #[test]
    fn salted_mixes_scope() {
        let hasher = BucketHasher::new(Arc::new(Md5Sharder), BucketingMode::Salted);
        assert_eq!(
            hasher.bucket("device-abc", "daily_challenge"),
            Md5Sharder.get_shard("device-abc:daily_challenge", 100) as u32
        );
        assert_eq!(hasher.bucket("device-abc", "daily_challenge"), 23);

        // Independence: buckets for two scopes are not the same function of identity.
        let differing = (0..1_000)
            .filter(|i| {
                let id = format!("device-{i}");
                hasher.bucket(&id, "flag_a") != hasher.bucket(&id, "flag_b")
            })
            .count();
        assert!(differing > 900, "only {differing} identities differ");
    }

    #[test]
    fn buckets_are_in_range() {
        let hasher = BucketHasher::default();
        assert!((0..5_000).all(|i| hasher.bucket(&format!("user-{i}"), "scope") < 100));
    }
}
