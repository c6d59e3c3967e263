use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use focusfield::bus::topics;
use focusfield::config::Config;
use focusfield::messages::{LogEvent, LogLevel};
use focusfield::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "focusfield", version, about = "Acoustic lens for conferencing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the fusion core until stdin closes or a fault stops it
    Run {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file and print the effective config
    CheckConfig {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Run { config }) => run(config),
        Some(Commands::CheckConfig { config }) => check_config(config),
        None => {
            println!("focusfield - Acoustic lens for conferencing");
            println!("Run with --help for usage");
            0
        }
    };
    std::process::exit(code);
}

fn load_config(path: Option<PathBuf>) -> Result<Config, i32> {
    let path = path.unwrap_or_else(Config::default_path);
    match Config::load_or_default(&path).map(Config::with_env_overrides) {
        Ok(config) => Ok(config),
        Err(e) => {
            // Single structured event on stderr, then non-zero exit.
            let event = LogEvent::new(0, LogLevel::Fatal, "core.config", "validation_failed")
                .with("path", path.display().to_string())
                .with("error", e.to_string());
            eprintln!(
                "{}",
                serde_json::to_string(&event).unwrap_or_else(|_| e.to_string())
            );
            Err(2)
        }
    }
}

fn run(config_path: Option<PathBuf>) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("startup failed: {e}");
            return 2;
        }
    };
    let handle = match runtime.start() {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("startup failed: {e}");
            return 2;
        }
    };
    let bus = handle.bus();

    // Supervisor contract: run until stdin closes, a "quit" line arrives,
    // or a fault requests shutdown.
    let (stdin_tx, stdin_rx) = crossbeam_channel::bounded::<()>(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) if line.trim() == "quit" => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = stdin_tx.send(());
    });

    loop {
        match stdin_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !handle.is_running() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = bus.publish(
        &topics::LOG_EVENTS,
        LogEvent::new(0, LogLevel::Info, "runtime", "shutdown_requested"),
    );
    let report = handle.stop();
    for name in &report.stuck {
        log::warn!("stuck_on_stop: {name}");
    }
    if report.faulted {
        1
    } else {
        0
    }
}

fn check_config(config_path: Option<PathBuf>) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    match toml::to_string_pretty(&config) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            log::error!("failed to render config: {e}");
            1
        }
    }
}
