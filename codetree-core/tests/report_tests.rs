// Tests for summary reports and exports

use codetree_core::ledger::{Ledger, RunStatus, SummaryFilter};
use codetree_core::report::{
    CSV_HEADER, ReportFormat, gather_report_data, generate_csv_report, generate_json_report,
    generate_path_list, generate_report, generate_text_report, save_report,
};
use codetree_scanner::{ArtifactRef, CategoryPath, ScanError, VisitRecord};
use std::path::PathBuf;
use tempfile::TempDir;

fn path(key: &str) -> CategoryPath {
    CategoryPath::parse_key(key).unwrap()
}

fn success(key: &str, file: &str) -> VisitRecord {
    VisitRecord::success(
        path(key),
        ArtifactRef {
            path: PathBuf::from(file),
            original_name: Some("export.xlsx".to_string()),
        },
    )
}

/// Two majors, one failure, one branch failure.
fn populated_ledger() -> (TempDir, Ledger, String) {
    let temp_dir = TempDir::new().unwrap();
    let ledger = Ledger::open(&temp_dir.path().join("ledger.db")).unwrap();
    let run_id = ledger.create_run("https://portal.example/index.do", "{}").unwrap();

    ledger
        .record(&run_id, &success("Surgery(S) > Bone > Joint(S001)", "/out/a.xlsx"))
        .unwrap();
    ledger
        .record(
            &run_id,
            &VisitRecord::failed(
                path("Surgery(S) > Bone > Spine, upper"),
                &ScanError::DownloadFailed("no results".to_string()),
            ),
        )
        .unwrap();
    ledger
        .record(&run_id, &success("Exam(E) > Blood > AB12 Count", "/out/b.xlsx"))
        .unwrap();
    ledger
        .record(
            &run_id,
            &VisitRecord::failed(
                path("Exam(E) > Urine"),
                &ScanError::ElementNotFound("Urine".to_string()),
            ),
        )
        .unwrap();
    ledger.finish_run(&run_id, RunStatus::Completed).unwrap();

    (temp_dir, ledger, run_id)
}

// ============================================================================
// Report Data Tests
// ============================================================================

#[test]
fn test_gather_report_data_counts() {
    let (_temp_dir, ledger, run_id) = populated_ledger();

    let data = gather_report_data(&ledger, &SummaryFilter::Run(run_id.clone())).unwrap();
    assert_eq!(data.run.as_ref().unwrap().id, run_id);
    assert_eq!(data.counts.success, 2);
    assert_eq!(data.counts.failed, 2);
    assert_eq!(data.counts.skipped, 0);
    assert_eq!(data.hierarchy.majors, 2);
    assert_eq!(data.hierarchy.mids, 3);
    assert_eq!(data.hierarchy.leaves, 3);
}

#[test]
fn test_all_runs_has_no_run_info() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let data = gather_report_data(&ledger, &SummaryFilter::All).unwrap();
    assert!(data.run.is_none());
    assert_eq!(data.rows.len(), 4);
}

// ============================================================================
// Text Report Tests
// ============================================================================

#[test]
fn test_text_report_sections() {
    let (_temp_dir, ledger, run_id) = populated_ledger();
    let data = gather_report_data(&ledger, &SummaryFilter::Run(run_id.clone())).unwrap();
    let report = generate_text_report(&data);

    assert!(report.contains("CODETREE WALK SUMMARY"));
    assert!(report.contains(&run_id));
    assert!(report.contains("Total Paths: 4"));
    assert!(report.contains("[OK]   Surgery(S) > Bone > Joint(S001)"));
    assert!(report.contains("[FAIL] Exam(E) > Urine"));
    assert!(report.contains("FAILURES"));
    assert!(report.contains("Cause:        download_failed"));
    assert!(report.contains("Cause:        element_not_found"));
    assert!(report.contains("End of Report"));
}

#[test]
fn test_text_report_groups_by_major() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let data = gather_report_data(&ledger, &SummaryFilter::All).unwrap();
    let report = generate_text_report(&data);

    let surgery = report.find("\nSurgery(S)\n").unwrap();
    let exam = report.find("\nExam(E)\n").unwrap();
    assert!(surgery < exam);
    assert_eq!(report.matches("\nSurgery(S)\n").count(), 1);
}

// ============================================================================
// JSON Report Tests
// ============================================================================

#[test]
fn test_json_report_structure() {
    let (_temp_dir, ledger, run_id) = populated_ledger();
    let data = gather_report_data(&ledger, &SummaryFilter::Run(run_id.clone())).unwrap();
    let json = generate_json_report(&data).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    let report = &value["report"];
    assert_eq!(report["metadata"]["generator"], "codetree");
    assert_eq!(report["run"]["id"], run_id.as_str());
    assert_eq!(report["run"]["status"], "completed");
    assert_eq!(report["summary"]["total_paths"], 4);
    assert_eq!(report["summary"]["failed"], 2);
    assert_eq!(report["hierarchy"]["majors"], 2);
    assert_eq!(report["rows"].as_array().unwrap().len(), 4);
    assert_eq!(report["rows"][1]["status"], "failed");
}

// ============================================================================
// CSV Export Tests
// ============================================================================

#[test]
fn test_csv_has_bom_and_header() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let rows = ledger.export_summary(&SummaryFilter::All).unwrap();
    let csv = generate_csv_report(&rows);

    assert!(csv.starts_with('\u{feff}'));
    let first_line = csv.trim_start_matches('\u{feff}').lines().next().unwrap();
    assert_eq!(first_line, CSV_HEADER.join(","));
    assert_eq!(csv.lines().count(), 5);
}

#[test]
fn test_csv_splits_names_and_codes() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let rows = ledger.export_summary(&SummaryFilter::All).unwrap();
    let csv = generate_csv_report(&rows);
    let lines: Vec<&str> = csv.lines().collect();

    assert!(lines[1].starts_with(
        "Surgery(S) > Bone > Joint(S001),Surgery,S,Bone,,Joint,S001,success,"
    ));
    assert!(lines[1].contains("/out/a.xlsx"));
    // the comma in the label forces quoting
    assert!(lines[2].starts_with("\"Surgery(S) > Bone > Spine, upper\",Surgery,S,Bone,,\"Spine, upper\",,failed,"));
    assert!(lines[2].contains(",download_failed,"));
    assert!(lines[3].starts_with("Exam(E) > Blood > AB12 Count,Exam,E,Blood,,Count,AB12,success,"));
    assert!(lines[4].starts_with("Exam(E) > Urine,Exam,E,Urine,,,,failed,"));
}

#[test]
fn test_failed_only_export() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let rows = ledger.export_summary(&SummaryFilter::FailedOnly).unwrap();
    let csv = generate_csv_report(&rows);
    assert_eq!(csv.lines().count(), 3);
    assert!(!csv.contains("Joint"));
}

// ============================================================================
// Path List and Saving
// ============================================================================

#[test]
fn test_path_list() {
    let (_temp_dir, ledger, _run_id) = populated_ledger();
    let keys = ledger.discovered_paths(None).unwrap();
    let list = generate_path_list(&keys);
    assert_eq!(
        list,
        "Surgery(S) > Bone > Joint(S001)\nSurgery(S) > Bone > Spine, upper\nExam(E) > Blood > AB12 Count\n"
    );
}

#[test]
fn test_generate_and_save_report() {
    let (temp_dir, ledger, run_id) = populated_ledger();
    let data = gather_report_data(&ledger, &SummaryFilter::Run(run_id)).unwrap();

    for (format, name) in [
        (ReportFormat::Text, "report.txt"),
        (ReportFormat::Json, "report.json"),
        (ReportFormat::Csv, "report.csv"),
    ] {
        let content = generate_report(&data, format).unwrap();
        let target = temp_dir.path().join("reports").join(name);
        save_report(&content, &target).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), content);
    }
}
