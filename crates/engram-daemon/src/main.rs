//! `engramd` — daemon control CLI.
//!
//! Subcommands: `start`, `stop`, `status`. Flags: `--socket <path>`,
//! `--verbose`, `--max-connections <n>`. Exit codes: 0 success, 1 generic
//! failure, 2 already running, 3 not running, 4 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use engram_daemon::server::{self, DaemonServer, DaemonState};
use engram_error::EngramError;
use engram_types::EngramConfig;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::Value;
use tracing::info;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;
const EXIT_NOT_RUNNING: u8 = 3;
const EXIT_CONFIG: u8 = 4;

struct CliArgs {
    command: String,
    socket: Option<PathBuf>,
    verbose: bool,
    max_connections: Option<usize>,
}

fn usage() {
    eprintln!("usage: engramd <start|stop|status> [--socket <path>] [--verbose] [--max-connections <n>]");
}

fn parse_args() -> Option<CliArgs> {
    let mut args = std::env::args().skip(1);
    let command = args.next()?;
    let mut parsed = CliArgs {
        command,
        socket: None,
        verbose: false,
        max_connections: None,
    };
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--socket" => parsed.socket = Some(PathBuf::from(args.next()?)),
            "--verbose" => parsed.verbose = true,
            "--max-connections" => {
                parsed.max_connections = Some(args.next()?.parse().ok()?);
            }
            _ => return None,
        }
    }
    Some(parsed)
}

fn report(err: &EngramError) {
    // Single line: category, then detail.
    eprintln!("error[{}]: {err}", err.category());
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn pidfile_path(config: &EngramConfig) -> PathBuf {
    config.data_dir.join("daemon.pid")
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn cmd_start(config: &EngramConfig) -> u8 {
    if DaemonServer::is_running(&config.socket_path) {
        eprintln!("daemon already running on {}", config.socket_path.display());
        return EXIT_ALREADY_RUNNING;
    }
    let state = Arc::new(DaemonState::new(config));
    let server = Arc::new(DaemonServer::new(
        config.socket_path.clone(),
        config.daemon.clone(),
        state,
    ));

    let pidfile = pidfile_path(config);
    if engram_fs::create_dir_all(&config.data_dir).is_err()
        || engram_fs::write_atomic(&pidfile, std::process::id().to_string().as_bytes()).is_err()
    {
        eprintln!("error[internal]: cannot write pidfile {}", pidfile.display());
        return EXIT_FAILURE;
    }
    {
        let pidfile = pidfile.clone();
        server.register_shutdown_handler(
            i32::MAX,
            Box::new(move || {
                let _ = engram_fs::remove_file(&pidfile);
            }),
        );
    }

    if let Err(err) = server.start() {
        report(&err);
        let _ = engram_fs::remove_file(&pidfile);
        return EXIT_FAILURE;
    }
    info!(socket = %config.socket_path.display(), "engramd started");
    server.run_until_shutdown();
    EXIT_OK
}

fn cmd_stop(config: &EngramConfig) -> u8 {
    match server::rpc_call(
        &config.socket_path,
        "shutdown",
        Value::Null,
        Duration::from_secs(5),
    ) {
        Ok(_) => {
            // Give the daemon a moment to drain and unlink its socket.
            for _ in 0..100 {
                if !config.socket_path.exists() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            println!("stopped");
            EXIT_OK
        }
        Err(EngramError::ServerNotRunning) => {
            let pidfile = pidfile_path(config);
            if let Ok(contents) = engram_fs::read_to_string(&pidfile) {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    if pid_alive(pid) {
                        eprintln!("daemon pid {pid} is alive but not answering on the socket");
                        return EXIT_FAILURE;
                    }
                }
                let _ = engram_fs::remove_file(&pidfile);
            }
            eprintln!("daemon is not running");
            EXIT_NOT_RUNNING
        }
        Err(err) => {
            report(&err);
            EXIT_FAILURE
        }
    }
}

fn cmd_status(config: &EngramConfig) -> u8 {
    match server::rpc_call(
        &config.socket_path,
        "status",
        Value::Null,
        Duration::from_secs(5),
    ) {
        Ok(status) => {
            println!("engramd: running on {}", config.socket_path.display());
            for (key, value) in server::status_map(&status) {
                println!("  {key}: {value}");
            }
            EXIT_OK
        }
        Err(EngramError::ServerNotRunning) => {
            println!("engramd: not running");
            EXIT_NOT_RUNNING
        }
        Err(err) => {
            report(&err);
            EXIT_FAILURE
        }
    }
}

fn main() -> ExitCode {
    let Some(args) = parse_args() else {
        usage();
        return ExitCode::from(EXIT_FAILURE);
    };
    init_tracing(args.verbose);

    let mut config = match EngramConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error[config]: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(max) = args.max_connections {
        if max == 0 {
            eprintln!("error[config]: --max-connections must be at least 1");
            return ExitCode::from(EXIT_CONFIG);
        }
        config.daemon.max_connections = max;
    }

    let code = match args.command.as_str() {
        "start" => cmd_start(&config),
        "stop" => cmd_stop(&config),
        "status" => cmd_status(&config),
        _ => {
            usage();
            EXIT_FAILURE
        }
    };
    ExitCode::from(code)
}
