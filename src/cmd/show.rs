//! Persisted run inspection: `eventsense show <RUN_ID>`.

use anyhow::{Context, Result};
use std::path::Path;

use eventsense::attribution::db::RunDb;
use eventsense::attribution::query::{ResultView, StatusView};
use eventsense_common::RunId;

/// Render a stored run as pretty JSON: the status view, or the result view
/// when `result` is set.
pub fn render(db_path: &Path, run_id: &str, result: bool) -> Result<String> {
    if !db_path.exists() {
        anyhow::bail!("No run database at {}", db_path.display());
    }
    let db = RunDb::new(db_path)
        .with_context(|| format!("Failed to open run database {}", db_path.display()))?;
    let run_id = RunId::from(run_id.trim());
    let run = db
        .get_run(&run_id)?
        .with_context(|| format!("Run {} not found in {}", run_id, db_path.display()))?;

    let json = if result {
        serde_json::to_string_pretty(&ResultView::from(&run))?
    } else {
        serde_json::to_string_pretty(&StatusView::from(&run))?
    };
    Ok(json)
}

pub fn cmd_show(db_path: &Path, run_id: &str, result: bool) -> Result<()> {
    println!("{}", render(db_path, run_id, result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventsense::attribution::pipeline::PipelineDefinition;
    use eventsense_common::{AttributionOptions, Run, RunParams};

    fn seeded_db(dir: &Path) -> (std::path::PathBuf, RunId) {
        let path = dir.join("runs.db");
        let db = RunDb::new(&path).unwrap();
        let run = Run::new(
            RunId::from("run_0123456789ab"),
            RunParams {
                ticker: "MSFT".to_string(),
                selected_day_et: chrono::NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                nl_query: None,
                options: AttributionOptions::default(),
            },
            PipelineDefinition::attribution().initial_records(),
        );
        db.upsert_run(&run).unwrap();
        (path, run.run_id)
    }

    #[test]
    fn test_render_status() {
        let dir = tempfile::tempdir().unwrap();
        let (path, run_id) = seeded_db(dir.path());
        let json: serde_json::Value =
            serde_json::from_str(&render(&path, run_id.as_str(), false).unwrap()).unwrap();
        assert_eq!(json["run_id"], "run_0123456789ab");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["steps"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_render_result_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let (path, run_id) = seeded_db(dir.path());
        let json: serde_json::Value =
            serde_json::from_str(&render(&path, run_id.as_str(), true).unwrap()).unwrap();
        assert_eq!(json["results"], serde_json::json!([]));
        assert_eq!(json["ir"], serde_json::json!({"event_ir": {}, "report_ir": {}}));
    }

    #[test]
    fn test_missing_database_and_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(render(&dir.path().join("nope.db"), "run_x", false).is_err());
        let (path, _) = seeded_db(dir.path());
        let err = render(&path, "run_ffffffffffff", false).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
