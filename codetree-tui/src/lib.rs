pub mod walk_monitor;

pub use walk_monitor::{LogLevel, WalkMonitor, create_monitor_channel, run_monitor};
