// Summaries and exports built from the ledger

use crate::error::Result;
use crate::ledger::{Ledger, RunInfo, SummaryFilter, SummaryRow, VisitCounts};
use chrono::{DateTime, Utc};
use codetree_scanner::{LabelParts, VisitStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const HEAVY_RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";
const LIGHT_RULE: &str = "────────────────────────────────────────────────────────────────────────────────\n";

pub const CSV_HEADER: [&str; 12] = [
    "path",
    "major",
    "major_code",
    "mid",
    "mid_code",
    "minor",
    "minor_code",
    "status",
    "timestamp",
    "artifact",
    "error_kind",
    "error_detail",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "csv" => Some(ReportFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HierarchyStats {
    pub majors: usize,
    pub mids: usize,
    pub leaves: usize,
}

impl HierarchyStats {
    pub fn from_rows(rows: &[SummaryRow]) -> Self {
        let mut majors = HashSet::new();
        let mut mids = HashSet::new();
        let mut leaves = 0;
        for row in rows {
            if let Some(major) = &row.major {
                majors.insert(major.as_str());
                if let Some(mid) = &row.mid {
                    mids.insert((major.as_str(), mid.as_str()));
                }
            }
            if row.is_leaf() {
                leaves += 1;
            }
        }
        Self {
            majors: majors.len(),
            mids: mids.len(),
            leaves,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    /// Present when the report covers a single run.
    pub run: Option<RunInfo>,
    pub rows: Vec<SummaryRow>,
    pub counts: VisitCounts,
    pub hierarchy: HierarchyStats,
}

pub fn gather_report_data(ledger: &Ledger, filter: &SummaryFilter) -> Result<ReportData> {
    let run = match filter {
        SummaryFilter::Run(id) => ledger.run_info(id)?,
        _ => None,
    };
    let rows = ledger.export_summary(filter)?;
    Ok(ReportData {
        run,
        counts: VisitCounts::from_rows(&rows),
        hierarchy: HierarchyStats::from_rows(&rows),
        rows,
    })
}

pub fn generate_report(data: &ReportData, format: ReportFormat) -> Result<String> {
    Ok(match format {
        ReportFormat::Text => generate_text_report(data),
        ReportFormat::Json => generate_json_report(data)?,
        ReportFormat::Csv => generate_csv_report(&data.rows),
    })
}

fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn status_marker(status: VisitStatus) -> &'static str {
    match status {
        VisitStatus::Success => "[OK]  ",
        VisitStatus::Failed => "[FAIL]",
        VisitStatus::Skipped => "[SKIP]",
    }
}

pub fn generate_text_report(data: &ReportData) -> String {
    let mut report = String::new();

    // Header
    report.push_str(HEAVY_RULE);
    report.push_str("                        CODETREE WALK SUMMARY\n");
    report.push_str(HEAVY_RULE);
    report.push('\n');

    if let Some(run) = &data.run {
        report.push_str(&format!("Run ID:       {}\n", run.id));
        report.push_str(&format!("Status:       {}\n", run.status.as_str()));
        report.push_str(&format!("Started:      {}\n", format_timestamp(run.started_at)));
        if let Some(finished) = run.finished_at {
            report.push_str(&format!("Duration:     {} seconds\n", finished - run.started_at));
        }
        report.push_str(&format!("Portal:       {}\n", run.portal_url));
    } else {
        report.push_str("Scope:        all runs\n");
    }
    report.push_str(&format!("Majors:       {}\n", data.hierarchy.majors));
    report.push_str(&format!("Mids:         {}\n", data.hierarchy.mids));
    report.push_str(&format!("Leaves:       {}\n", data.hierarchy.leaves));
    report.push('\n');

    report.push_str(HEAVY_RULE);
    report.push_str("SUMMARY\n");
    report.push_str(HEAVY_RULE);
    report.push('\n');
    report.push_str(&format!("Total Paths: {}\n\n", data.counts.total()));
    report.push_str(&format!("  [OK]    {}  (downloaded)\n", data.counts.success));
    report.push_str(&format!("  [FAIL]  {}  (re-run to retry)\n", data.counts.failed));
    report.push_str(&format!("  [SKIP]  {}  (done in an earlier run)\n", data.counts.skipped));
    report.push('\n');

    if !data.rows.is_empty() {
        report.push_str(HEAVY_RULE);
        report.push_str("PATHS\n");
        report.push_str(HEAVY_RULE);

        let mut current_major: Option<&str> = None;
        for row in &data.rows {
            let major = row.major.as_deref().unwrap_or("");
            if current_major != Some(major) {
                report.push_str(&format!("\n{}\n", major));
                current_major = Some(major);
            }
            report.push_str(&format!("  {} {}\n", status_marker(row.status), row.path_key));
        }
        report.push('\n');
    }

    let failures: Vec<&SummaryRow> = data
        .rows
        .iter()
        .filter(|r| r.status == VisitStatus::Failed)
        .collect();
    if !failures.is_empty() {
        report.push_str(HEAVY_RULE);
        report.push_str("FAILURES\n");
        report.push_str(HEAVY_RULE);
        report.push('\n');

        for (idx, row) in failures.iter().enumerate() {
            report.push_str(&format!("[{}] {}\n", idx + 1, row.path_key));
            report.push_str(&format!(
                "Cause:        {}\n",
                row.error_kind.as_deref().unwrap_or("unknown")
            ));
            report.push_str(&format!(
                "When:         {}\n",
                row.recorded_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            if let Some(detail) = &row.error_detail {
                report.push_str("Detail:\n");
                report.push_str(&wrap_text(detail, 80, "  "));
                report.push('\n');
            }
            report.push_str(LIGHT_RULE);
            report.push('\n');
        }
    }

    // Footer
    report.push_str(HEAVY_RULE);
    report.push_str("                          End of Report\n");
    report.push_str(HEAVY_RULE);
    report.push_str(&format!(
        "\nGenerated by codetree {}\n",
        env!("CARGO_PKG_VERSION")
    ));

    report
}

pub fn generate_json_report(data: &ReportData) -> std::result::Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "codetree",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": Utc::now().to_rfc3339(),
                "format": "json"
            },
            "run": data.run.as_ref().map(|run| serde_json::json!({
                "id": run.id,
                "status": run.status.as_str(),
                "started_at": format_iso8601_timestamp(run.started_at),
                "finished_at": run.finished_at.map(format_iso8601_timestamp),
                "duration_seconds": run.finished_at.map(|end| end - run.started_at),
                "portal_url": run.portal_url
            })),
            "summary": {
                "total_paths": data.counts.total(),
                "success": data.counts.success,
                "failed": data.counts.failed,
                "skipped": data.counts.skipped
            },
            "hierarchy": data.hierarchy,
            "rows": data.rows
        }
    });

    serde_json::to_string_pretty(&json_report)
}

fn format_iso8601_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn push_csv_row<S: AsRef<str>>(out: &mut String, row: &[S]) {
    for (idx, cell) in row.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let cell = cell.as_ref();
        if needs_quotes(cell) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push_str("\r\n");
}

fn name_and_code(label: Option<&str>) -> (String, String) {
    match label {
        Some(label) => {
            let parts = LabelParts::parse(label);
            (parts.name, parts.code)
        }
        None => (String::new(), String::new()),
    }
}

/// CSV summary, UTF-8 with a byte order mark so spreadsheet tools pick the
/// right encoding for Korean labels.
pub fn generate_csv_report(rows: &[SummaryRow]) -> String {
    let mut out = String::from('\u{feff}');
    push_csv_row(&mut out, &CSV_HEADER);

    for row in rows {
        let (major, major_code) = name_and_code(row.major.as_deref());
        let (mid, mid_code) = name_and_code(row.mid.as_deref());
        let (minor, minor_code) = name_and_code(row.minor.as_deref());
        push_csv_row(
            &mut out,
            &[
                row.path_key.clone(),
                major,
                major_code,
                mid,
                mid_code,
                minor,
                minor_code,
                row.status.as_str().to_string(),
                row.recorded_at.to_rfc3339(),
                row.artifact_path.clone().unwrap_or_default(),
                row.error_kind.clone().unwrap_or_default(),
                row.error_detail.clone().unwrap_or_default(),
            ],
        );
    }
    out
}

/// Plain list of leaf keys, one per line.
pub fn generate_path_list(keys: &[String]) -> String {
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('\n');
    }
    out
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn wrap_text(text: &str, width: usize, indent: &str) -> String {
    let mut result = String::new();
    let mut current_line = String::new();

    for word in text.split_whitespace() {
        if current_line.chars().count() + word.chars().count() + 1 > width - indent.len()
            && !current_line.is_empty()
        {
            result.push_str(indent);
            result.push_str(&current_line);
            result.push('\n');
            current_line.clear();
        }
        if !current_line.is_empty() {
            current_line.push(' ');
        }
        current_line.push_str(word);
    }

    if !current_line.is_empty() {
        result.push_str(indent);
        result.push_str(&current_line);
        result.push('\n');
    }

    result
}
