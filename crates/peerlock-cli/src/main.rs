//! Peerlock CLI - run and steer a mutual-exclusion simulation

use clap::Parser;
use peerlock_core::config::SimulationConfig;
use peerlock_core::message::PeerId;
use peerlock_core::simulation::{Simulation, SimulationStats};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "peerlock")]
#[command(author, version, about = "Decentralized mutual-exclusion simulator", long_about = None)]
struct Cli {
    /// Number of peers to start with (defaults to the available parallelism)
    #[arg(long)]
    initial_peers: Option<usize>,

    /// Upper bound in ms of the pause between a release and the next attempt
    #[arg(long, value_parser = parse_bound)]
    max_acquire_delay: Option<u32>,

    /// Upper bound in ms of how long a peer keeps the lock
    #[arg(long, value_parser = parse_bound)]
    max_lock_hold_time: Option<u32>,

    /// Seed for reproducible peer timing
    #[arg(long)]
    seed: Option<u64>,

    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for a signal or `quit`
    #[arg(short, long)]
    duration: Option<u64>,

    /// Output format (text or json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// A delay bound in milliseconds, strictly below `u32::MAX`
fn parse_bound(raw: &str) -> Result<u32, String> {
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{}' is not a millisecond count: {}", raw, e))?;
    if value == u32::MAX {
        return Err(format!("must be below {}", u32::MAX));
    }
    Ok(value)
}

/// Something the operator asked for, from stdin or a signal
#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Stats,
    Add,
    /// Remove the given peer, or the oldest one
    Remove(Option<PeerId>),
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Control> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    let control = match command {
        "stats" | "s" => Control::Stats,
        "add" | "a" => Control::Add,
        "remove" | "rm" => match words.next() {
            None => Control::Remove(None),
            Some(raw) => match raw.parse::<u32>() {
                Ok(id) if id != 0 => Control::Remove(Some(PeerId::new(id))),
                _ => Control::Unknown(line.trim().to_string()),
            },
        },
        "quit" | "q" | "exit" => Control::Quit,
        _ => Control::Unknown(line.trim().to_string()),
    };
    Some(control)
}

#[cfg(unix)]
struct ControlSignals {
    stats: tokio::signal::unix::Signal,
    add: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ControlSignals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            stats: signal(SignalKind::user_defined1())?,
            add: signal(SignalKind::user_defined2())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Control {
        tokio::select! {
            _ = self.stats.recv() => Control::Stats,
            _ = self.add.recv() => Control::Add,
            _ = self.terminate.recv() => Control::Quit,
            control = ctrl_c_quit() => control,
        }
    }
}

#[cfg(not(unix))]
struct ControlSignals;

#[cfg(not(unix))]
impl ControlSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Control {
        ctrl_c_quit().await
    }
}

async fn ctrl_c_quit() -> Control {
    quit_on(tokio::signal::ctrl_c().await).await
}

/// `Quit` once the interrupt arrived. A handler that could not be installed
/// never resolves, so stdin and the other signals keep control.
async fn quit_on(interrupted: std::io::Result<()>) -> Control {
    if let Err(e) = interrupted {
        warn!(error = %e, "Failed to listen for ctrl-c, use `quit` to stop");
        return std::future::pending().await;
    }
    Control::Quit
}

/// Read stdin on a plain thread so a pending read never holds up runtime
/// shutdown. The channel closes at end of input.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin, ignoring it from now on");
                    break;
                }
            }
        }
    });
    rx
}

fn build_config(cli: &Cli) -> anyhow::Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };

    if let Some(ms) = cli.max_acquire_delay {
        config = config.with_max_acquire_delay_ms(ms);
    }
    if let Some(ms) = cli.max_lock_hold_time {
        config = config.with_max_lock_hold_time_ms(ms);
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }
    config.validate()?;
    Ok(config)
}

fn print_stats(stats: &SimulationStats, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(stats)?);
        }
        OutputFormat::Text => {
            println!("Up {}s.", stats.uptime_ms / 1000);
            println!("[Lock Acquire Count]");
            for peer in &stats.peers {
                println!("{}: {} ({})", peer.id, peer.acquisitions, peer.state);
            }
            println!(
                "Total: {} acquisitions, {} violations, {} starvations",
                stats.total_acquisitions, stats.violations, stats.starvations
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerlock=info,peerlock_core=info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let initial_peers = cli.initial_peers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    let mut sim = Simulation::new(config)?;
    for _ in 0..initial_peers {
        sim.spawn_peer()?;
    }

    if !cli.quiet {
        eprintln!(
            "Started {} peers. Commands: stats, add, remove [ID], quit.",
            initial_peers
        );
    }
    info!(peers = initial_peers, "Simulation started");

    run(&mut sim, &cli).await?;

    let stats = sim.shutdown().await?;
    print_stats(&stats, cli.format)?;

    if !stats.is_clean() {
        anyhow::bail!(
            "{} mutual-exclusion violations and {} starvations detected",
            stats.violations,
            stats.starvations
        );
    }
    Ok(())
}

/// Serve operator commands until asked to stop
async fn run(sim: &mut Simulation, cli: &Cli) -> anyhow::Result<()> {
    let mut commands = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut signals = ControlSignals::new()?;

    let run_for = async {
        match cli.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(run_for);

    loop {
        let control = tokio::select! {
            _ = &mut run_for => Control::Quit,
            control = signals.recv() => control,
            line = commands.recv(), if stdin_open => match line {
                Some(line) => match parse_command(&line) {
                    Some(control) => control,
                    None => continue,
                },
                None => {
                    stdin_open = false;
                    continue;
                }
            },
        };

        match control {
            Control::Stats => print_stats(&sim.stats(), cli.format)?,
            Control::Add => {
                let id = sim.spawn_peer()?;
                if !cli.quiet {
                    eprintln!("Added peer {}.", id);
                }
            }
            Control::Remove(target) => {
                let removed = match target {
                    Some(id) => sim.remove_peer(id).await.map(|_| Some(id)),
                    None => sim.remove_oldest().await,
                };
                match removed {
                    Ok(Some(id)) if !cli.quiet => eprintln!("Removed peer {}.", id),
                    Ok(Some(_)) => {}
                    Ok(None) => eprintln!("No peer to remove."),
                    Err(e) => match e.suggestion() {
                        Some(hint) => eprintln!("Error [{}]: {} (try: {})", e.code(), e, hint),
                        None => eprintln!("Error [{}]: {}", e.code(), e),
                    },
                }
            }
            Control::Quit => {
                if !cli.quiet {
                    eprintln!("Stopping {} peers ...", sim.len());
                }
                return Ok(());
            }
            Control::Unknown(text) => {
                eprintln!("Unknown command '{}'. Commands: stats, add, remove [ID], quit.", text);
            }
        }
    }
}
