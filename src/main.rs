use std::{
    io::{self, BufRead, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use guaca_cli::{console::Stdio, setup_wifi, Config, Interrupter};

/// Administrative console for the Guacamayo appliance.
#[derive(Parser, Debug)]
#[command(name = "guaca-cli", version)]
struct Cli {
    /// Seconds to wait for any single D-Bus call before giving up.
    #[arg(long, value_name = "SECS", default_value_t = Config::DEFAULT_CALL_TIMEOUT.as_secs())]
    call_timeout: u64,

    /// Prefix for lines printed by the `wifi` command.
    #[arg(long, value_name = "TEXT", default_value = Config::DEFAULT_PROMPT)]
    prompt: String,

    /// Log more (`-v` for debug, `-vv` for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            prompt: self.prompt.clone(),
            ..Config::default()
        }
        .with_call_timeout(Duration::from_secs(self.call_timeout))
    }

    fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Wifi,
    Quit,
}

impl Command {
    const ALL: [(&'static str, Command, &'static str); 3] = [
        ("help", Command::Help, "print this help message"),
        ("wifi", Command::Wifi, "select and connect to a wireless network"),
        ("quit", Command::Quit, "quit client"),
    ];

    /// Parses a command line. Any unambiguous prefix of a command name is accepted.
    fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        if word == "?" {
            return Some(Self::Help);
        }

        let mut matches = Self::ALL
            .iter()
            .filter(|(name, _, _)| name.starts_with(word));
        match (matches.next(), matches.next()) {
            (Some((_, cmd, _)), None) => Some(*cmd),
            _ => None,
        }
    }
}

fn print_help() {
    println!("Available Commands:\n");
    for (name, _, help) in Command::ALL {
        println!("  {:>4}: {}", name, help);
    }
    println!("     ?: same as help");
}

/// The interrupter of the `wifi` command currently running, if any.
#[derive(Clone, Default)]
struct Running(Arc<Mutex<Option<Interrupter>>>);

impl Running {
    fn set(&self, interrupter: Option<Interrupter>) {
        match self.0.lock() {
            Ok(mut slot) => *slot = interrupter,
            Err(e) => *e.into_inner() = interrupter,
        }
    }

    /// Interrupts the running command. Returns `false` if nothing was running.
    fn interrupt(&self) -> bool {
        let slot = match self.0.lock() {
            Ok(slot) => slot,
            Err(e) => e.into_inner(),
        };
        match &*slot {
            Some(interrupter) => {
                interrupter.interrupt();
                true
            }
            None => false,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::builder()
        .filter_module(env!("CARGO_CRATE_NAME"), cli.log_level())
        .parse_default_env()
        .init();

    let config = cli.config();
    log::debug!("starting with {:?}", config);

    let running = Running::default();
    let handler = running.clone();
    let installed = ctrlc::set_handler(move || {
        if !handler.interrupt() {
            std::process::exit(130);
        }
    });
    if let Err(e) = installed {
        log::warn!("failed to install SIGINT handler: {}", e);
    }

    println!("Welcome to Guacamayo");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!(": ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::error!("failed to read command: {}", e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Some(Command::Help) => print_help(),
            Some(Command::Wifi) => {
                let console = Arc::new(Stdio::new(config.prompt.clone()));
                let ok = setup_wifi(config.clone(), console, |interrupter| {
                    running.set(Some(interrupter))
                });
                running.set(None);
                if !ok {
                    println!("wifi setup failed");
                }
            }
            Some(Command::Quit) => break,
            None => println!("unknown command, type 'help' for a list"),
        }
    }
}
