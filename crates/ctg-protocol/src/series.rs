use serde::{Deserialize, Serialize};

/// One stored data point. The compact field names match the JSON documents
/// persisted in the `fhr_data` / `uc_data` columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CtgPoint {
    pub t: f64,
    pub v: f64,
}

/// Append-only time series stored as one JSONB document per session column.
///
/// Invariants: `count == points.len()`, `last_time == points.last().t` when
/// non-empty, and `t` values are non-decreasing. Appends happen in-database
/// (`points || new_points`), so this struct is mostly read back whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(default)]
    pub points: Vec<CtgPoint>,
    #[serde(default)]
    pub last_time: f64,
    #[serde(default)]
    pub count: i64,
}

impl TimeSeries {
    /// Check the stored-document invariants (used by tests and health checks).
    pub fn is_consistent(&self) -> bool {
        if self.count != self.points.len() as i64 {
            return false;
        }
        match self.points.last() {
            Some(last) => self.last_time == last.t,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_shape() {
        // The insert path relies on this exact default document.
        let doc = serde_json::to_value(TimeSeries::default()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({"points": [], "last_time": 0.0, "count": 0})
        );
    }

    #[test]
    fn test_roundtrip_and_consistency() {
        let raw = r#"{"points":[{"t":0.5,"v":140.0},{"t":1.0,"v":141.0}],"last_time":1.0,"count":2}"#;
        let series: TimeSeries = serde_json::from_str(raw).unwrap();
        assert!(series.is_consistent());
        assert_eq!(series.points[1].v, 141.0);

        let broken: TimeSeries = serde_json::from_str(
            r#"{"points":[{"t":0.5,"v":140.0}],"last_time":9.0,"count":1}"#,
        )
        .unwrap();
        assert!(!broken.is_consistent());
    }
}
