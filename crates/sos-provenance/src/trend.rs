//! Trend analysis over a provenance window.

use serde_json::{json, Value};

use crate::BundleWindow;

/// Per-run trend entry plus window aggregates. Pure function of the window,
/// so regenerated reports are reproducible.
pub fn analyze_window(window: &BundleWindow) -> Value {
    let mut runs: Vec<Value> = Vec::new();
    let mut prior: Option<(f64, f64)> = None;
    let mut improved_count = 0usize;

    for record in &window.snapshots {
        let executed = number(&record.payload, "executed");
        let passed = number(&record.payload, "passed");
        let improved = match prior {
            Some((prior_executed, prior_passed)) => {
                passed > prior_passed || (executed > prior_executed && passed >= prior_passed)
            }
            None => false,
        };
        if improved {
            improved_count += 1;
        }
        runs.push(json!({
            "source": record.file_name,
            "timestamp": record.payload.get("timestamp").cloned().unwrap_or(Value::Null),
            "executed": executed,
            "passed": passed,
            "improved": improved,
        }));
        prior = Some((executed, passed));
    }

    let last_three_stalled = runs.len() >= 3
        && runs[runs.len() - 3..]
            .iter()
            .all(|run| run["improved"] == json!(false));

    json!({
        "schema_version": 1,
        "window": {
            "from": window.started_at,
            "to": window.ended_at,
            "count": window.snapshots.len(),
        },
        "runs": runs,
        "improved_count": improved_count,
        "stagnation_alert": last_three_stalled,
    })
}

fn number(payload: &Value, key: &str) -> f64 {
    payload
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{append_snapshot, load_snapshots, select_window, WindowSelection};
    use serde_json::json;

    fn window_from(counts: &[(i64, i64)]) -> BundleWindow {
        let dir = tempfile::tempdir().unwrap();
        for (n, (executed, passed)) in counts.iter().enumerate() {
            append_snapshot(
                dir.path(),
                &format!("run_{n:02}.json"),
                json!({
                    "timestamp": format!("2026-01-01T00:00:{n:02}Z"),
                    "executed": executed,
                    "passed": passed,
                }),
            )
            .unwrap();
        }
        select_window(load_snapshots(dir.path()), &WindowSelection::Last(counts.len())).unwrap()
    }

    #[test]
    fn rising_pass_counts_read_as_improvement() {
        let report = analyze_window(&window_from(&[(10, 8), (10, 9), (10, 10)]));
        assert_eq!(report["improved_count"], json!(2));
        assert_eq!(report["stagnation_alert"], json!(false));
    }

    #[test]
    fn three_flat_runs_trigger_stagnation_alert() {
        let report = analyze_window(&window_from(&[(10, 10), (10, 10), (10, 10), (10, 10)]));
        assert_eq!(report["improved_count"], json!(0));
        assert_eq!(report["stagnation_alert"], json!(true));
    }

    #[test]
    fn report_is_deterministic() {
        let window = window_from(&[(5, 4), (6, 5)]);
        assert_eq!(analyze_window(&window), analyze_window(&window));
    }
}
