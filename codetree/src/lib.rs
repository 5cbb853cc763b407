// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    WalkOverrides, dry_run_walk, initialize_config_dir, is_yes, resolve_ledger_path,
    summary_filter, walk_exit_code,
};

// Re-export walk functionality from codetree-core
pub use codetree_core::walk::{WalkEvent, WalkOptions, WalkOutcome, execute_walk};
