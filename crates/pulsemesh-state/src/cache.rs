//! Cached encrypted full snapshot.

/// Caches the sealed bytes of this node's full-snapshot message.
///
/// Serializing and encrypting an unchanged snapshot every heartbeat
/// period is wasted work, so the sealed bytes are kept until the
/// local committer invalidates them. Invalidation is an explicit call
/// tied to the mutation, not an implicit memoization.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    wire: Option<Vec<u8>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached bytes, or the result of `build` (cached on success).
    pub fn get_or_build<E>(
        &mut self,
        build: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Vec<u8>, E> {
        if let Some(wire) = &self.wire {
            return Ok(wire.clone());
        }
        let wire = build()?;
        self.wire = Some(wire.clone());
        Ok(wire)
    }

    /// Drop the cached bytes; the next tick re-seals.
    pub fn invalidate(&mut self) {
        self.wire = None;
    }

    pub fn is_cached(&self) -> bool {
        self.wire.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_once_until_invalidated() {
        let mut cache = SnapshotCache::new();
        let mut builds = 0;

        for _ in 0..3 {
            let wire = cache
                .get_or_build(|| -> Result<Vec<u8>, ()> {
                    builds += 1;
                    Ok(vec![builds as u8])
                })
                .unwrap();
            assert_eq!(wire, vec![1]);
        }
        assert_eq!(builds, 1);

        cache.invalidate();
        let wire = cache
            .get_or_build(|| -> Result<Vec<u8>, ()> {
                builds += 1;
                Ok(vec![builds as u8])
            })
            .unwrap();
        assert_eq!(wire, vec![2]);
    }

    #[test]
    fn test_build_error_not_cached() {
        let mut cache = SnapshotCache::new();
        let result: Result<Vec<u8>, &str> = cache.get_or_build(|| Err("sealing failed"));
        assert!(result.is_err());
        assert!(!cache.is_cached());
    }
}
