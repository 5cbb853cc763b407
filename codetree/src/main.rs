use codetree::handlers::{
    EXIT_FATAL, handle_failed, handle_init, handle_paths, handle_report, handle_walk, init_logging,
    print_banner,
};
use colored::Colorize;
use commands::command_argument_builder;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    // -v is global, so count it wherever it was given
    let verbosity = chosen_command
        .subcommand()
        .map(|(_, sub)| sub.get_count("verbose"))
        .unwrap_or(0)
        .max(chosen_command.get_count("verbose"));

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    // walk installs its own subscriber so logs can be routed to the monitor
    if !matches!(chosen_command.subcommand_name(), Some("walk")) {
        init_logging(verbosity, None);
    }

    let result = match chosen_command.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command).map(|_| 0),
        Some(("walk", primary_command)) => handle_walk(primary_command, verbosity).await,
        Some(("report", primary_command)) => handle_report(primary_command).map(|_| 0),
        Some(("paths", primary_command)) => handle_paths(primary_command).map(|_| 0),
        Some(("failed", primary_command)) => handle_failed(primary_command).map(|_| 0),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(EXIT_FATAL);
        }
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
