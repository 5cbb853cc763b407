pub mod config;
pub mod error;
pub mod ledger;
pub mod report;
pub mod walk;

pub use config::WalkConfig;
pub use error::{CoreError, Result};
pub use ledger::{Ledger, MemorySink, RecordSink, RunInfo, RunStatus, SummaryFilter, SummaryRow, VisitCounts};
pub use report::ReportFormat;
pub use walk::{WalkEvent, WalkEventCallback, WalkOptions, WalkOutcome, execute_walk};
