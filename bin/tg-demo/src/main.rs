//! Tollgate Demo Harness
//!
//! Runs the classic shared-resource scenarios against a ReservationService:
//! - `destinations`: seat booking on four tourist destinations
//! - `atm`: six clients sharing two cash machines
//! - `bank`: two tellers withdrawing from one balance
//! - `run`: counters and gates loaded from a TOML config file
//!
//! Outcomes are printed by a single consumer task draining a ChannelSink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tg_config::{AppConfig, ConfigLoader, WorkerConfig};
use tg_reserve::{
    ChannelSink, LogSink, OutcomeStatus, ReservationOutcome, ReservationService,
    ReservationServiceBuilder, ReserveError, SimulatedLatency,
};

const DESTINATIONS: [(&str, u32); 4] = [
    ("Ciudad Antigua", 10),
    ("Playas del Sol", 10),
    ("Montaña Escondida", 3),
    ("Mercado Local", 10),
];

/// Tollgate demo scenarios
#[derive(Parser, Debug)]
#[command(name = "tg-demo")]
#[command(about = "Tollgate - concurrent reservations against finite shared resources")]
struct Args {
    /// Worker pool size
    #[arg(long, env = "TOLLGATE_WORKER_POOL_SIZE", default_value = "8", global = true)]
    workers: usize,

    /// Milliseconds per simulated time unit
    #[arg(long, env = "TOLLGATE_TIME_UNIT_MS", default_value = "1000", global = true)]
    unit_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Book seats on the four destinations
    Destinations {
        /// Booking clicks per destination
        #[arg(long, default_value = "5")]
        clicks: u32,
    },
    /// Six clients, two cash machines
    Atm {
        #[arg(long, default_value = "6")]
        clients: u32,
        #[arg(long, default_value = "2")]
        machines: u32,
    },
    /// Two tellers withdrawing 90 and 50 from a balance of 90
    Bank {
        #[arg(long, default_value = "90")]
        balance: u32,
        #[arg(long, default_value = "3")]
        rounds: u32,
    },
    /// Load counters and gates from a config file and request one unit from each, repeatedly
    Run {
        /// Config file path (falls back to TOLLGATE_CONFIG and the standard search paths)
        #[arg(long, short)]
        config: Option<String>,
        /// Requests per resource
        #[arg(long, default_value = "5")]
        requests: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    tg_common::logging::init_logging("tg-demo");

    let args = Args::parse();
    let unit = Duration::from_millis(args.unit_ms);

    let (service, printer) = match args.command {
        Command::Destinations { clicks } => destinations(args.workers, unit, clicks).await?,
        Command::Atm { clients, machines } => atm(unit, clients, machines).await?,
        Command::Bank { balance, rounds } => bank(unit, balance, rounds).await?,
        Command::Run { config, requests } => run_config(config, requests).await?,
    };

    service.shutdown().await;
    let stats = service.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    // The sink sender lives in the service; dropping it ends the printer
    drop(service);
    printer.await.context("outcome printer task failed")?;
    Ok(())
}

/// Start the service with a channel sink and its single consumer.
/// `log_outcomes` also routes every outcome through tracing.
fn start(
    builder: ReservationServiceBuilder,
    log_outcomes: bool,
) -> Result<(ReservationService, JoinHandle<()>)> {
    let service = builder.build()?;
    let (sink, events) = ChannelSink::new();
    service.add_sink(Arc::new(sink));
    if log_outcomes {
        service.add_sink(Arc::new(LogSink));
    }
    Ok((service, tokio::spawn(print_outcomes(events))))
}

async fn print_outcomes(mut events: UnboundedReceiver<ReservationOutcome>) {
    while let Some(outcome) = events.recv().await {
        let level = outcome
            .level
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        let marker = match outcome.status {
            OutcomeStatus::Granted => "OK  ",
            OutcomeStatus::Denied => "FULL",
            OutcomeStatus::ServiceUnavailable => "ERR ",
            OutcomeStatus::Cancelled => "STOP",
        };
        println!(
            "[{}] {:<24} {:<18} x{:<3} level={:<4} {}ms  {}",
            marker,
            outcome.correlation_id.as_str(),
            outcome.resource,
            outcome.amount,
            level,
            outcome.elapsed_ms,
            outcome.message
        );
    }
}

/// Simulated step latency between `min_tenths` and `max_tenths` tenths of a time unit
fn latency(unit: Duration, min_tenths: u32, max_tenths: u32) -> WorkerConfig {
    WorkerConfig {
        latency_min_ms: unit.as_millis() as u64 * min_tenths as u64 / 10,
        latency_max_ms: unit.as_millis() as u64 * max_tenths as u64 / 10,
        ..WorkerConfig::default()
    }
}

async fn destinations(
    workers: usize,
    unit: Duration,
    clicks: u32,
) -> Result<(ReservationService, JoinHandle<()>)> {
    // Booking round trip between 0.1 and 1 unit
    let mut builder = ReservationService::builder()
        .worker_config(latency(unit, 1, 10))
        .pool_size(workers);
    for (name, seats) in DESTINATIONS {
        builder = builder.counter(name, seats);
    }
    let (service, printer) = start(builder, false)?;

    for click in 0..clicks {
        for (name, _) in DESTINATIONS {
            let id = format!("{}-{}", name.to_lowercase().replace(' ', "-"), click);
            if let Err(e) = service.submit(name, 1, id) {
                warn!(destination = name, error = %e, "Booking rejected");
            }
        }
    }

    wait_idle(&service).await;
    for (name, _) in DESTINATIONS {
        info!(destination = name, seats_left = service.level_of(name)?, "Destination settled");
    }
    Ok((service, printer))
}

async fn atm(unit: Duration, clients: u32, machines: u32) -> Result<(ReservationService, JoinHandle<()>)> {
    // Each client spends one to three units at the machine
    let builder = ReservationService::builder()
        .pool_size(clients.max(1) as usize)
        .gate("cajeros", machines)
        .external_step(Arc::new(SimulatedLatency::new(unit, unit * 3)));
    let (service, printer) = start(builder, false)?;

    let subscriptions = (1..=clients)
        .map(|i| service.submit_and_subscribe("cajeros", 1, format!("Cliente-{}", i)))
        .collect::<tg_reserve::Result<Vec<_>>>()?;
    for sub in subscriptions {
        sub.wait().await?;
    }

    if let Some(gate) = service.gate("cajeros") {
        info!(machines, high_water_mark = gate.high_water_mark(), "All clients served");
    }
    Ok((service, printer))
}

async fn bank(unit: Duration, balance: u32, rounds: u32) -> Result<(ReservationService, JoinHandle<()>)> {
    let builder = ReservationService::builder()
        .worker_config(latency(unit, 1, 5))
        .pool_size(2)
        .gate("cajeros", 2)
        .gated_counter("saldo", balance, balance, "cajeros");
    let (service, printer) = start(builder, false)?;
    let service = Arc::new(service);

    let tellers: Vec<_> = [("Hilo-1", 90u32), ("Hilo-2", 50u32)]
        .into_iter()
        .map(|(teller, amount)| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                for round in 0..rounds {
                    // Every attempt is a new request with its own handle
                    let id = format!("{}-retiro-{}", teller, round);
                    let outcome = service.submit_and_subscribe("saldo", amount, id)?.wait().await?;
                    if outcome.status == OutcomeStatus::Denied {
                        info!(teller, amount, balance = ?outcome.level, "Insufficient balance");
                    }
                    tokio::time::sleep(unit / 2).await;
                }
                Ok::<_, ReserveError>(())
            })
        })
        .collect();

    for teller in tellers {
        teller.await??;
    }

    info!(balance = service.level_of("saldo")?, "Final balance");
    let service = Arc::try_unwrap(service)
        .map_err(|_| anyhow::anyhow!("bank service still shared after tellers finished"))?;
    Ok((service, printer))
}

async fn run_config(
    path: Option<String>,
    requests: u32,
) -> Result<(ReservationService, JoinHandle<()>)> {
    let loader = match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config: AppConfig = loader.load().context("failed to load configuration")?;
    info!(
        counters = config.counters.len(),
        gates = config.gates.len(),
        pool_size = config.worker.pool_size,
        "Configuration loaded"
    );

    let (service, printer) = start(ReservationServiceBuilder::from_config(&config), config.dev_mode)?;

    let resources = config
        .counters
        .iter()
        .map(|c| c.name.as_str())
        .chain(config.gates.iter().map(|g| g.name.as_str()));
    for name in resources {
        for i in 0..requests {
            if let Err(e) = service.submit(name, 1, format!("{}-{}", name, i)) {
                warn!(resource = name, error = %e, "Request rejected");
            }
        }
    }

    wait_idle(&service).await;
    Ok((service, printer))
}

/// Poll until everything submitted has an outcome
async fn wait_idle(service: &ReservationService) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    loop {
        tick.tick().await;
        let stats = service.stats();
        if stats.completed() >= stats.submitted {
            break;
        }
    }
}
