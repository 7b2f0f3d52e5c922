//! Summary report parsing and typed metric access (C6, spec §4.6).

use std::path::Path;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ExperimentError, ReportErrorKind};

const TOTAL_CYCLES_KEY: &str = "Total Cycles";
const TOTAL_INSTRUCTIONS_ALL_THREADS_KEY: &str = "Total Instructions Retired (All Threads)";
const TOTAL_INSTRUCTIONS_KEY: &str = "Total Instructions Retired";

/// Parsed `summary.json`, with internal ordering keys (`_`-prefixed) dropped
/// and the two convenience metrics resolved per §4.6.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    metrics: Vec<(String, f64)>,
    total_cycles: f64,
    total_instructions: Option<f64>,
}

impl SummaryReport {
    pub fn total_cycles(&self) -> f64 {
        self.total_cycles
    }

    pub fn total_instructions(&self) -> Option<f64> {
        self.total_instructions
    }

    pub fn get_metric_value(&self, key: &str) -> Option<f64> {
        self.metrics.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// Keys in the source JSON's iteration order, optionally filtered by
    /// `pattern`.
    pub fn get_metric_keys(&self, pattern: Option<&str>) -> Result<Vec<String>, ExperimentError> {
        match pattern {
            None => Ok(self.metrics.iter().map(|(k, _)| k.clone()).collect()),
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|e| ExperimentError::report(ReportErrorKind::Parse, format!("invalid metric key pattern: {e}")))?;
                Ok(self.metrics.iter().filter(|(k, _)| re.is_match(k)).map(|(k, _)| k.clone()).collect())
            }
        }
    }
}

/// Parse a `summary.json` document per §4.6's rules.
pub fn parse_summary(contents: &str) -> Result<SummaryReport, ExperimentError> {
    let value: Value = serde_json::from_str(contents).map_err(|e| ExperimentError::report(ReportErrorKind::Parse, format!("invalid JSON: {e}")))?;
    let object = value.as_object().ok_or_else(|| ExperimentError::report(ReportErrorKind::Parse, "summary.json is not a JSON object"))?;

    let mut metrics = Vec::with_capacity(object.len());
    let mut total_cycles = None;
    let mut total_instructions_all_threads = None;
    let mut total_instructions_single = None;

    for (key, value) in object {
        if key.starts_with('_') {
            continue;
        }
        let number = value
            .as_f64()
            .ok_or_else(|| ExperimentError::report(ReportErrorKind::Parse, format!("metric {key} is not numeric")))?;

        if key == TOTAL_CYCLES_KEY {
            total_cycles = Some(number);
        }
        if key == TOTAL_INSTRUCTIONS_ALL_THREADS_KEY {
            total_instructions_all_threads = Some(number);
        }
        if key == TOTAL_INSTRUCTIONS_KEY {
            total_instructions_single = Some(number);
        }
        metrics.push((key.clone(), number));
    }

    let total_cycles = total_cycles.ok_or_else(|| ExperimentError::report(ReportErrorKind::MissingField, "missing \"Total Cycles\""))?;
    let total_instructions = total_instructions_all_threads.or(total_instructions_single);

    Ok(SummaryReport { metrics, total_cycles, total_instructions })
}

/// Before loading the real `summary.json`, scan `summary_dir` for any
/// `summary*.json` file whose contents parse with both totals at zero
/// (invalid ROI stubs) and remove them (§4.6).
pub async fn cleanup_invalid_stubs(summary_dir: &Path) -> Result<(), ExperimentError> {
    let mut entries = match tokio::fs::read_dir(summary_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ExperimentError::report(ReportErrorKind::Parse, format!("read summary dir: {e}"))),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ExperimentError::report(ReportErrorKind::Parse, format!("walk summary dir: {e}")))?
    {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("summary") || !name.ends_with(".json") {
            continue;
        }
        let Ok(contents) = tokio::fs::read_to_string(&path).await else { continue };
        let Ok(report) = parse_summary(&contents) else { continue };
        if report.total_cycles() == 0.0 && report.total_instructions().unwrap_or(0.0) == 0.0 {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
    Ok(())
}

/// Read and parse `summary_dir/summary.json` after running the cleanup pass.
pub async fn load_summary(summary_dir: &Path) -> Result<SummaryReport, ExperimentError> {
    cleanup_invalid_stubs(summary_dir).await?;
    let path = summary_dir.join("summary.json");
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ExperimentError::report(ReportErrorKind::MissingField, format!("read {}: {e}", path.display())))?;
    parse_summary(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_all_threads_variant() {
        let json = r#"{"Total Cycles": 253629, "Total Instructions Retired": 200000, "Total Instructions Retired (All Threads)": 393252}"#;
        let report = parse_summary(json).unwrap();
        assert_eq!(report.total_cycles(), 253629.0);
        assert_eq!(report.total_instructions(), Some(393252.0));
    }

    #[test]
    fn falls_back_to_single_thread_variant() {
        let json = r#"{"Total Cycles": 253629, "Total Instructions Retired": 196626}"#;
        let report = parse_summary(json).unwrap();
        assert_eq!(report.total_instructions(), Some(196626.0));
    }

    #[test]
    fn missing_total_cycles_is_an_error() {
        let json = r#"{"Total Instructions Retired": 1}"#;
        let err = parse_summary(json).unwrap_err();
        assert_eq!(err.kind_tag(), "report");
    }

    #[test]
    fn internal_ordering_keys_are_dropped() {
        let json = r#"{"Total Cycles": 1, "_order": 99}"#;
        let report = parse_summary(json).unwrap();
        assert_eq!(report.get_metric_value("_order"), None);
    }

    #[test]
    fn metric_keys_filtered_by_pattern() {
        let json = r#"{"Total Cycles": 1, "L1 Cache Hits": 2, "L1 Cache Misses": 3}"#;
        let report = parse_summary(json).unwrap();
        let keys = report.get_metric_keys(Some("^L1")).unwrap();
        assert_eq!(keys, vec!["L1 Cache Hits".to_string(), "L1 Cache Misses".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_removes_zeroed_stubs_but_keeps_real_summary() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("summary.json"), r#"{"Total Cycles": 100, "Total Instructions Retired": 50}"#)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("summary_stub.json"), r#"{"Total Cycles": 0, "Total Instructions Retired": 0}"#)
            .await
            .unwrap();

        let report = load_summary(dir.path()).await.unwrap();
        assert_eq!(report.total_cycles(), 100.0);
        assert!(!dir.path().join("summary_stub.json").exists());
        assert!(dir.path().join("summary.json").exists());
    }
}
