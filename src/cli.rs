//! Demo-binary CLI parsing: the target command to launch, whether to
//! follow forked children, and the log verbosity `env_logger` should
//! default to.

use clap::{App, Arg};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Parsed demo-binary invocation: what to launch and how to trace it.
pub struct DemoArgs {
    pub command: String,
    pub command_args: Vec<String>,
    pub trace_children: bool,
    pub log_level: String,
}

pub fn parse_config() -> DemoArgs {
    let matches = App::new("synctrace-demo")
        .arg(
            Arg::with_name("no-follow-children")
                .long("no-follow-children")
                .help("Do not auto-attach to forked/cloned descendants."),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .help("env_logger level filter (error, warn, info, debug, trace).")
                .takes_value(true)
                .default_value(DEFAULT_LOG_LEVEL),
        )
        .arg(
            Arg::with_name("command")
                .help("Command to launch under tracing.")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let mut command_parts: Vec<String> = matches
        .values_of("command")
        .expect("command is required")
        .map(String::from)
        .collect();
    let command = command_parts.remove(0);

    DemoArgs {
        command,
        command_args: command_parts,
        trace_children: !matches.is_present("no-follow-children"),
        log_level: matches.value_of("log-level").unwrap_or(DEFAULT_LOG_LEVEL).to_string(),
    }
}
