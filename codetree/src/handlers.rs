use anyhow::{Context, Result, anyhow, bail};
use clap::ArgMatches;
use codetree_core::WalkConfig;
use codetree_core::config::{
    CONFIG_FILE_NAME, LEDGER_FILE_NAME, default_config_path, expand_path,
};
use codetree_core::ledger::{Ledger, MemorySink, SummaryFilter};
use codetree_core::report::{
    ReportFormat, gather_report_data, generate_path_list, generate_report, save_report,
};
use codetree_core::walk::{WalkEvent, WalkEventCallback, WalkOptions, WalkOutcome, execute_walk};
use codetree_scanner::nexacro::run_download_dir;
use codetree_scanner::scripted::load_menu;
use codetree_scanner::{CategoryPath, NexacroPortal, ScriptedPortal, UiAdapter};
use codetree_tui::{create_monitor_channel, run_monitor};
use colored::Colorize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Startup failure: config, ledger, or classification root unreachable.
pub const EXIT_FATAL: i32 = 1;
/// Walk stopped by the user before the tree was exhausted.
pub const EXIT_CANCELLED: i32 = 130;

const BANNER: &str = r#"
                 _      _
  ___ ___   __| | ___| |_ _ __ ___  ___
 / __/ _ \ / _` |/ _ \ __| '__/ _ \/ _ \
| (__ (_) | (_| |  __/ |_| | |  __/  __/
 \___\___/ \__,_|\___|\__|_|  \___|\___|
"#;

pub fn print_banner() {
    println!("{}", BANNER.bright_green().bold());
    println!(
        "  {} {}\n",
        "resumable classification-tree walker".bright_white(),
        format!("v{}", env!("CARGO_PKG_VERSION")).cyan()
    );
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> String {
    print!("{} ", msg.bright_cyan().bold());
    let _ = io::stdout().flush();
    let mut response = String::new();
    if io::stdin().read_line(&mut response).is_err() {
        return String::new();
    }
    response.trim().to_lowercase()
}

pub fn is_yes(response: &str) -> bool {
    matches!(response.trim().to_lowercase().as_str(), "y" | "yes")
}

// ============================================================================
// Logging
// ============================================================================

/// Sends each formatted log line to the walk monitor instead of the terminal.
struct LogForwarder {
    tx: UnboundedSender<WalkEvent>,
    buffer: Vec<u8>,
}

impl Write for LogForwarder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogForwarder {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buffer);
        let line = line.trim_end();
        if !line.is_empty() {
            let _ = self.tx.send(WalkEvent::Log(line.to_string()));
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `-v`.
///
/// With a monitor sender, log lines go to the monitor's log panel; writing
/// to stderr would tear the full-screen display.
pub fn init_logging(verbosity: u8, monitor: Option<UnboundedSender<WalkEvent>>) {
    let verbosity = if monitor.is_some() {
        verbosity.max(1)
    } else {
        verbosity
    };
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,codetree={0},codetree_core={0},codetree_scanner={0}",
            level
        ))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // Already installed (tests, repeated calls) is fine
    let _ = match monitor {
        Some(tx) => builder
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_writer(move || LogForwarder {
                tx: tx.clone(),
                buffer: Vec::new(),
            })
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
}

// ============================================================================
// Init
// ============================================================================

/// Create `dir`, write a default `config.json` pointing at a ledger inside
/// `dir`, and create that ledger. Returns (config path, ledger path).
pub fn initialize_config_dir(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

    let config_path = dir.join(CONFIG_FILE_NAME);
    let ledger_path = dir.join(LEDGER_FILE_NAME);

    let config = WalkConfig {
        ledger_path: ledger_path.clone(),
        ..WalkConfig::default()
    };
    config
        .save(&config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    Ledger::open(&ledger_path)
        .with_context(|| format!("Failed to create ledger {}", ledger_path.display()))?;

    Ok((config_path, ledger_path))
}

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  CODETREE INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let target = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or("~/.config/codetree/");
    let force = args.get_flag("force");
    let config_dir = expand_path(target);
    let config_path = config_dir.join(CONFIG_FILE_NAME);
    let ledger_path = config_dir.join(LEDGER_FILE_NAME);

    println!("{} Parsed arguments", "✓".green().bold());
    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );
    println!();

    let config_exists = config_path.exists();
    let ledger_exists = Ledger::exists(&ledger_path);

    if (config_exists || ledger_exists) && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("An existing installation was found:");
        if config_exists {
            println!(
                "  {} {}",
                "•".yellow(),
                config_path.display().to_string().bright_white()
            );
        }
        if ledger_exists {
            println!(
                "  {} {}",
                "•".yellow(),
                ledger_path.display().to_string().bright_white()
            );
        }
        println!();
        println!(
            "{}",
            "This operation will overwrite them. Recorded visits will be lost and the next walk \
             starts from scratch."
                .yellow()
        );

        let response = print_prompt("Do you want to continue? [y/N]:");
        println!();

        if !is_yes(&response) {
            println!("{} Initialization cancelled.", "✗".red().bold());
            return Ok(());
        }
        println!("{} Proceeding with overwrite", "→".yellow().bold());
        println!();
    }

    if ledger_exists {
        println!("{} Deleting existing ledger", "→".yellow().bold());
        Ledger::remove(&ledger_path)?;
        println!("{} Existing ledger removed", "✓".green().bold());
        println!();
    }

    println!("{} Creating configuration...", "→".blue());
    let (config_path, ledger_path) = initialize_config_dir(&config_dir)?;

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!();
    println!(
        "{} Config: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );
    println!(
        "{} Ledger: {}",
        "✓".green().bold(),
        ledger_path.display().to_string().bright_white()
    );
    println!();
    Ok(())
}

// ============================================================================
// Walk
// ============================================================================

/// Command-line values that take precedence over `config.json`.
#[derive(Debug, Clone, Default)]
pub struct WalkOverrides {
    pub ledger: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub headless: Option<bool>,
    pub max_recoveries: Option<u32>,
    pub no_probe: bool,
}

impl WalkOverrides {
    pub fn from_matches(args: &ArgMatches) -> Self {
        let headless = if args.get_flag("headless") {
            Some(true)
        } else if args.get_flag("headed") {
            Some(false)
        } else {
            None
        };

        Self {
            ledger: args.get_one::<String>("ledger").map(|p| expand_path(p)),
            output: args.get_one::<String>("output").map(|p| expand_path(p)),
            headless,
            max_recoveries: args.get_one::<u32>("max-recoveries").copied(),
            no_probe: args.get_flag("no-probe"),
        }
    }

    pub fn apply(&self, config: &mut WalkConfig) {
        if let Some(ledger) = &self.ledger {
            config.ledger_path = ledger.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(headless) = self.headless {
            config.headless = headless;
        }
        if let Some(max_recoveries) = self.max_recoveries {
            config.max_recoveries = max_recoveries;
        }
        if self.no_probe {
            config.probe = false;
        }
    }
}

/// `None` for an absent or empty key, which means the whole tree.
pub fn parse_start_path(key: Option<&str>) -> Result<Option<CategoryPath>> {
    let Some(key) = key else {
        return Ok(None);
    };
    let path = CategoryPath::parse_key(key).with_context(|| format!("Invalid start path '{}'", key))?;
    Ok((path.depth() > 0).then_some(path))
}

pub fn walk_exit_code(outcome: &WalkOutcome) -> i32 {
    if outcome.cancelled { EXIT_CANCELLED } else { 0 }
}

/// Rehearse a walk against a menu file. Records stay in memory and exports
/// land in `<output>/dry-run`.
pub async fn dry_run_walk(
    mut options: WalkOptions,
    menu_path: &Path,
    event_callback: Option<WalkEventCallback>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<WalkOutcome> {
    let menu = load_menu(menu_path)
        .with_context(|| format!("Failed to load menu {}", menu_path.display()))?;

    options.config.probe = false;
    options.config.output_dir = options.config.output_dir.join("dry-run");
    let download_base = options.config.output_dir.clone();

    let mut sink = MemorySink::new();
    let outcome = execute_walk(
        options,
        move |run_id: &str| -> Box<dyn UiAdapter> {
            Box::new(ScriptedPortal::new(menu, run_download_dir(&download_base, run_id)))
        },
        &mut sink,
        event_callback,
        cancel,
    )
    .await
    .context("Dry run failed to start")?;

    Ok(outcome)
}

async fn live_walk(
    options: WalkOptions,
    event_callback: Option<WalkEventCallback>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<WalkOutcome> {
    let mut ledger = Ledger::open(&options.config.ledger_path).with_context(|| {
        format!(
            "Failed to open ledger {}",
            options.config.ledger_path.display()
        )
    })?;

    let config = options.config.clone();
    let outcome = execute_walk(
        options,
        move |run_id: &str| -> Box<dyn UiAdapter> {
            let download_dir = run_download_dir(&config.output_dir, run_id);
            Box::new(NexacroPortal::new(config.nexacro_options(download_dir)))
        },
        &mut ledger,
        event_callback,
        cancel,
    )
    .await
    .context("Walk failed to start")?;

    Ok(outcome)
}

fn print_walk_plan(config: &WalkConfig, start: Option<&CategoryPath>, dry_run: Option<&PathBuf>) {
    match dry_run {
        Some(menu) => println!(
            "{} Menu: {} {}",
            "→".blue(),
            menu.display().to_string().bright_white(),
            "(dry run)".yellow()
        ),
        None => {
            println!("{} Portal: {}", "→".blue(), config.portal_url.bright_white());
            println!(
                "{} Ledger: {}",
                "→".blue(),
                config.ledger_path.display().to_string().bright_white()
            );
            println!(
                "{} Browser: {}",
                "→".blue(),
                if config.headless { "headless" } else { "headed" }
            );
        }
    }
    println!(
        "{} Output: {}",
        "→".blue(),
        config.output_dir.display().to_string().bright_white()
    );
    println!(
        "{} Scope: {}",
        "→".blue(),
        start.map(|p| p.key()).unwrap_or_else(|| "entire tree".to_string())
    );
    println!(
        "{} Recovery budget: {} per node",
        "→".blue(),
        config.max_recoveries
    );
    println!();
}

fn print_walk_summary(outcome: &WalkOutcome, dry_run: bool) {
    println!();
    print_divider();
    let title = match (dry_run, outcome.cancelled) {
        (true, _) => "  DRY RUN COMPLETE".green().bold(),
        (false, true) => "  WALK CANCELLED".yellow().bold(),
        (false, false) => "  WALK COMPLETE".green().bold(),
    };
    println!("{}", title);
    print_divider();
    println!();
    println!("{} Run: {}", "✓".green().bold(), outcome.run_id.bright_white());
    println!(
        "{} Downloaded: {}",
        "✓".green().bold(),
        outcome.counts.success.to_string().cyan()
    );
    println!(
        "{} Skipped (already done): {}",
        "→".blue(),
        outcome.counts.skipped.to_string().cyan()
    );
    if outcome.counts.failed > 0 {
        println!(
            "{} Failed: {}",
            "✗".red().bold(),
            outcome.counts.failed.to_string().red()
        );
    }
    if !outcome.recoveries.is_empty() {
        println!(
            "{} Session recoveries: {}",
            "⚠".yellow().bold(),
            outcome.recoveries.len()
        );
    }
    println!(
        "{} Leaf paths discovered: {}",
        "→".blue(),
        outcome.discovered_paths.len()
    );
    println!();

    if dry_run {
        return;
    }
    if outcome.counts.failed > 0 {
        println!(
            "{} Inspect failures with: {}",
            "ℹ".blue(),
            "codetree failed".bright_white()
        );
    }
    if outcome.cancelled {
        println!(
            "{} Run {} again to continue where this one stopped",
            "ℹ".blue(),
            "codetree walk".bright_white()
        );
    }
    println!(
        "{} Summary: {}",
        "ℹ".blue(),
        format!("codetree report --run {}", outcome.run_id).bright_white()
    );
    println!();
}

pub async fn handle_walk(args: &ArgMatches, verbosity: u8) -> Result<i32> {
    let use_tui = args.get_flag("tui");
    let monitor_channel = use_tui.then(create_monitor_channel);
    init_logging(verbosity, monitor_channel.as_ref().map(|(tx, _)| tx.clone()));

    let config_path = args
        .get_one::<String>("config")
        .map(|p| expand_path(p))
        .unwrap_or_else(default_config_path);
    let mut config = WalkConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    WalkOverrides::from_matches(args).apply(&mut config);
    let start = parse_start_path(args.get_one::<String>("start").map(String::as_str))?;
    let dry_run = args.get_one::<PathBuf>("dry-run");

    print_walk_plan(&config, start.as_ref(), dry_run);
    info!("Using configuration {}", config_path.display());

    let mut options = WalkOptions::new(config);
    options.start = start;
    options.show_progress_bars = !use_tui;
    options.handle_ctrl_c = true;

    let cancel = Arc::new(AtomicBool::new(false));
    let (event_callback, monitor) = match monitor_channel {
        Some((tx, rx)) => {
            let should_exit = Arc::new(AtomicBool::new(false));
            let handle = {
                let cancel = cancel.clone();
                let should_exit = should_exit.clone();
                std::thread::spawn(move || run_monitor(rx, cancel, should_exit))
            };
            let callback: WalkEventCallback = Arc::new(move |event: WalkEvent| {
                let _ = tx.send(event);
            });
            (Some(callback), Some((should_exit, handle)))
        }
        None => (None, None),
    };

    let result = match dry_run {
        Some(menu_path) => dry_run_walk(options, menu_path, event_callback, Some(cancel)).await,
        None => live_walk(options, event_callback, Some(cancel)).await,
    };

    if let Some((should_exit, handle)) = monitor {
        // A finished walk stays on screen until the user leaves the monitor
        if result.is_err() {
            should_exit.store(true, Ordering::SeqCst);
        }
        match handle.join() {
            Ok(monitor_result) => monitor_result.context("Walk monitor failed")?,
            Err(_) => bail!("Walk monitor thread panicked"),
        }
    }

    let outcome = result?;
    print_walk_summary(&outcome, dry_run.is_some());
    Ok(walk_exit_code(&outcome))
}

// ============================================================================
// Ledger queries
// ============================================================================

/// `--ledger` if given, otherwise the ledger named by the default config.
pub fn resolve_ledger_path(arg: Option<&str>) -> Result<PathBuf> {
    match arg {
        Some(path) => Ok(expand_path(path)),
        None => {
            let config_path = default_config_path();
            let config = WalkConfig::load(&config_path).with_context(|| {
                format!("Failed to load configuration from {}", config_path.display())
            })?;
            Ok(config.ledger_path)
        }
    }
}

fn open_existing_ledger(path: &Path) -> Result<Ledger> {
    if !Ledger::exists(path) {
        bail!(
            "No ledger at {} (run `codetree init` or `codetree walk` first)",
            path.display()
        );
    }
    Ledger::open(path).with_context(|| format!("Failed to open ledger {}", path.display()))
}

/// `--run latest` resolves to the most recent run.
pub fn summary_filter(ledger: &Ledger, run: Option<&str>, failed_only: bool) -> Result<SummaryFilter> {
    match run {
        Some("latest") => {
            let latest = ledger
                .latest_run()?
                .ok_or_else(|| anyhow!("The ledger has no runs yet"))?;
            Ok(SummaryFilter::Run(latest.id))
        }
        Some(run_id) => {
            if ledger.run_info(run_id)?.is_none() {
                bail!("No run with id '{}' in the ledger", run_id);
            }
            Ok(SummaryFilter::Run(run_id.to_string()))
        }
        None if failed_only => Ok(SummaryFilter::FailedOnly),
        None => Ok(SummaryFilter::All),
    }
}

fn write_output(content: &str, output: Option<&PathBuf>, what: &str) -> Result<()> {
    match output {
        Some(path) => {
            save_report(content, path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} {} saved to: {}",
                "✓".green().bold(),
                what,
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", content),
    }
    Ok(())
}

pub fn handle_report(args: &ArgMatches) -> Result<()> {
    let ledger_path = resolve_ledger_path(args.get_one::<String>("ledger").map(String::as_str))?;
    let ledger = open_existing_ledger(&ledger_path)?;

    let filter = summary_filter(
        &ledger,
        args.get_one::<String>("run").map(String::as_str),
        args.get_flag("failed"),
    )?;
    let format_name = args
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("text");
    let format = ReportFormat::from_str(format_name)
        .ok_or_else(|| anyhow!("Unknown report format '{}'", format_name))?;

    let data = gather_report_data(&ledger, &filter)?;
    let report = generate_report(&data, format)?;
    write_output(&report, args.get_one::<PathBuf>("output"), "Report")
}

pub fn handle_paths(args: &ArgMatches) -> Result<()> {
    let ledger_path = resolve_ledger_path(args.get_one::<String>("ledger").map(String::as_str))?;
    let ledger = open_existing_ledger(&ledger_path)?;

    let keys = ledger.discovered_paths(None)?;
    if keys.is_empty() {
        println!("{} No leaf paths recorded yet", "→".blue());
        return Ok(());
    }
    write_output(&generate_path_list(&keys), args.get_one::<PathBuf>("output"), "Path list")
}

pub fn handle_failed(args: &ArgMatches) -> Result<()> {
    let ledger_path = resolve_ledger_path(args.get_one::<String>("ledger").map(String::as_str))?;
    let ledger = open_existing_ledger(&ledger_path)?;

    let rows = ledger.failed_paths()?;
    if rows.is_empty() {
        println!("{} No failed paths", "✓".green().bold());
        return Ok(());
    }

    print_divider();
    println!(
        "{}",
        format!("  FAILED PATHS ({})", rows.len()).bright_white().bold()
    );
    print_divider();
    println!();

    for row in &rows {
        println!("{} {}", "✗".red().bold(), row.path_key.bright_white());
        println!(
            "    {} {}",
            "Cause:".blue(),
            row.error_kind.as_deref().unwrap_or("unknown").yellow()
        );
        if let Some(detail) = &row.error_detail {
            println!("    {} {}", "Detail:".blue(), detail);
        }
        println!(
            "    {} {} (run {})",
            "When:".blue(),
            row.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
            row.run_id
        );
    }

    println!();
    println!(
        "{} {} retries every path that has not succeeded; {} narrows it to one subtree",
        "ℹ".blue(),
        "codetree walk".bright_white(),
        "--start \"<path>\"".bright_white()
    );
    println!();
    Ok(())
}
