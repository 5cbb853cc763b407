use crate::CLAP_STYLING;
use clap::{arg, command};
use std::path::PathBuf;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("codetree")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("codetree")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" ... "Increase log verbosity (-v info, -vv debug, -vvv trace)")
                .required(false)
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Initializes the codetree configuration and ledger on your filesystem")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory for config.json and the ledger")
                        .default_value("~/.config/codetree/"),
                )
                .arg(
                    arg!(-f - -"force")
                        .help(
                            "Forces the overwriting of any existing configuration and ledger at \
                        the specified location.",
                        )
                        .required(false),
                ),
        )
        .subcommand(
            command!("walk")
                .about(
                    "Walk the classification tree, downloading one export per leaf. Leaves already \
                downloaded according to the ledger are skipped.",
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("Configuration file (default: ~/.config/codetree/config.json)"),
                )
                .arg(
                    arg!(-l --"ledger" <PATH>)
                        .required(false)
                        .help("Ledger database (overrides the configuration)"),
                )
                .arg(
                    arg!(-o --"output" <DIR>)
                        .required(false)
                        .help("Directory that receives the downloaded exports"),
                )
                .arg(
                    arg!(-s --"start" <PATH_KEY>)
                        .required(false)
                        .help("Only walk the subtree below this path, e.g. \"Surgery > Bone\""),
                )
                .arg(
                    arg!(--"headless")
                        .required(false)
                        .help("Run the browser without a window")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("headed"),
                )
                .arg(
                    arg!(--"headed")
                        .required(false)
                        .help("Show the browser window")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("headless"),
                )
                .arg(
                    arg!(--"max-recoveries" <NUM>)
                        .required(false)
                        .help("Session recoveries allowed per node or leaf")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    arg!(--"no-probe")
                        .required(false)
                        .help("Skip the portal reachability check before opening the browser")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"dry-run" <MENU_JSON>)
                        .required(false)
                        .help(
                            "Rehearse the walk against a menu tree read from a JSON file instead \
                        of the live portal. Nothing is written to the ledger.",
                        )
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"tui")
                        .required(false)
                        .help("Follow the walk in a full-screen monitor")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("report")
                .about("Summarize recorded visits from the ledger")
                .arg(
                    arg!(-l --"ledger" <PATH>)
                        .required(false)
                        .help("Ledger database (default: ~/.config/codetree/ledger.db)"),
                )
                .arg(
                    arg!(-r --"run" <RUN_ID>)
                        .required(false)
                        .help("Only this run; 'latest' selects the most recent one")
                        .conflicts_with("failed"),
                )
                .arg(
                    arg!(--"failed")
                        .required(false)
                        .help("Only paths whose latest outcome is a failure")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, csv")
                        .value_parser(["text", "json", "csv"])
                        .default_value("text"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            command!("paths")
                .about("List every distinct leaf path discovered so far")
                .arg(
                    arg!(-l --"ledger" <PATH>)
                        .required(false)
                        .help("Ledger database (default: ~/.config/codetree/ledger.db)"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save the list to file (default: display to screen)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            command!("failed")
                .about("List failed paths with their causes, for targeted re-runs")
                .arg(
                    arg!(-l --"ledger" <PATH>)
                        .required(false)
                        .help("Ledger database (default: ~/.config/codetree/ledger.db)"),
                ),
        )
}
