use relcache_core::ScalarValue;
use serde::{Deserialize, Serialize};

/// Per-column min/max/null-count statistics, recorded while encoding and
/// consulted by block-level pruning. `min`/`max` are `None` until a
/// non-null value is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    pub null_count: u64,
}

impl Default for ColumnStats {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            null_count: 0,
        }
    }
}

impl ColumnStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: &ScalarValue) {
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        match &self.min {
            Some(min) if !matches!(value.partial_cmp(min), Some(std::cmp::Ordering::Less)) => {}
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if !matches!(value.partial_cmp(max), Some(std::cmp::Ordering::Greater)) => {}
            _ => self.max = Some(value.clone()),
        }
    }

    pub fn observe_null(&mut self) {
        self.null_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_tracks_bounds() {
        let mut stats = ColumnStats::new();
        for v in [5i64, -2, 9, 3] {
            stats.observe(&ScalarValue::Int64(Some(v)));
        }
        stats.observe_null();

        assert_eq!(stats.min, Some(ScalarValue::Int64(Some(-2))));
        assert_eq!(stats.max, Some(ScalarValue::Int64(Some(9))));
        assert_eq!(stats.null_count, 1);
    }

    #[test]
    fn test_all_null_has_no_bounds() {
        let mut stats = ColumnStats::new();
        stats.observe(&ScalarValue::Int64(None));
        stats.observe_null();

        assert_eq!(stats.min, None);
        assert_eq!(stats.max, None);
        assert_eq!(stats.null_count, 2);
    }

    #[test]
    fn test_string_bounds() {
        let mut stats = ColumnStats::new();
        for s in ["pear", "apple", "quince"] {
            stats.observe(&ScalarValue::Utf8(Some(s.to_string())));
        }
        assert_eq!(stats.min, Some(ScalarValue::Utf8(Some("apple".into()))));
        assert_eq!(stats.max, Some(ScalarValue::Utf8(Some("quince".into()))));
    }
}
