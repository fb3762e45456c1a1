//! Demo binary: launches a command under tracing and logs every syscall
//! event until the target exits, using a single logging default hook.

use log::info;
use std::process::exit;
use synctrace::cli;
use synctrace::event::EventKind;
use synctrace::hooks::HookResult;
use synctrace::session::{Config, Session};

fn main() {
    let args = cli::parse_config();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = Config {
        trace_children: args.trace_children,
        ..Config::default()
    };
    let mut session = Session::new(config);

    session.hooks_mut().set_default_hook(|_session, event| {
        if let Some(nr) = event.syscall_number {
            info!("{}: syscall {}", event.pid, nr);
        }
        HookResult::Continue
    });

    let command_args: Vec<&str> = args.command_args.iter().map(String::as_str).collect();
    match session.fork_trace_exec(&args.command, &command_args) {
        Ok(pid) => info!("launched {} as pid {}", args.command, pid),
        Err(error) => {
            eprintln!("failed to launch {}: {}", args.command, error);
            exit(1);
        }
    }

    loop {
        let event = match session.wait_event() {
            Ok(event) => event,
            Err(error) => {
                eprintln!("event loop error: {}", error);
                exit(1);
            }
        };

        match event.kind {
            EventKind::Quit => break,
            EventKind::Syscall => {
                if let Some(pid) = session.registry().get(event.pid).map(|t| t.pid) {
                    let _ = session.continue_tracee(pid, None);
                }
            }
            _ => {
                if let Some(pid) = session.registry().get(event.pid).map(|t| t.pid) {
                    let _ = session.continue_tracee(pid, None);
                }
            }
        }
    }
}
