use serde::{Deserialize, Serialize};

/// Transformed line -> original line for one instrumented file.
///
/// Lines are 1-based on both sides. Injected lines map to the original line
/// of the statement they precede, so the mapping is non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    /// `original[t - 1]` is the original line of transformed line `t`.
    original: Vec<u32>,
}

impl SourceMap {
    /// Map for a file that was not changed line-wise.
    pub fn identity(lines: u32) -> Self {
        Self {
            original: (1..=lines).collect(),
        }
    }

    pub(crate) fn from_vec(original: Vec<u32>) -> Self {
        debug_assert!(original.windows(2).all(|w| w[0] <= w[1]));
        Self { original }
    }

    /// Number of transformed lines.
    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    pub fn original(&self, transformed: u32) -> Option<u32> {
        transformed
            .checked_sub(1)
            .and_then(|i| self.original.get(i as usize))
            .copied()
    }

    /// Transformed line holding the original line's own text (the last one
    /// that maps to it, after any injected lines).
    pub fn transformed(&self, original: u32) -> Option<u32> {
        let end = self.original.partition_point(|o| *o <= original);
        (end > 0 && self.original[end - 1] == original).then_some(end as u32)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.original
            .iter()
            .enumerate()
            .map(|(i, o)| (i as u32 + 1, *o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        // Original line 2 got one injected line in front of it.
        let map = SourceMap::from_vec(vec![1, 2, 2, 3]);
        assert_eq!(map.original(2), Some(2));
        assert_eq!(map.original(3), Some(2));
        assert_eq!(map.original(5), None);
        assert_eq!(map.original(0), None);
        assert_eq!(map.transformed(2), Some(3));
        assert_eq!(map.transformed(3), Some(4));
        assert_eq!(map.transformed(9), None);
    }

    #[test]
    fn test_identity() {
        let map = SourceMap::identity(3);
        assert_eq!(map.len(), 3);
        assert!(map.iter().all(|(t, o)| t == o));
    }
}
