//! CLI entry point for the bench broker.
//!
//! Operator tool for inspecting and exercising the bench pool:
//! - `status` — show the inventory with declared states
//! - `check` — run the pre-flight health check against one bench
//! - `request` — allocate a bench, print its report metadata, hold, release
//! - `lock` — hold the cross-process lock of a shared instrument
//!
//! Broker state is per-process; `request` therefore demonstrates a full
//! allocate/hold/release cycle within one invocation. The `lock` command is
//! different: its artifact lives on the filesystem, so two invocations on
//! hosts sharing the lock directory genuinely exclude each other.
//!
//! # Usage
//!
//! ```bash
//! bench_broker --config config/benches.toml status
//! bench_broker request radar_x_band --job-id JOB-17 --hold-sec 5
//! bench_broker --mock --fail BENCH-001:ping_uut request radar_x_band
//! bench_broker lock 192.168.10.3 --timeout-sec 30 --hold-sec 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bench_broker::logging::{self, LogFormat};
use bench_broker::{
    BenchBroker, BrokerConfig, HealthCheck, InstrumentLock, NetworkHealthChecker,
    ScriptedHealthChecker,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "bench_broker")]
#[command(about = "Allocation broker for shared radar test benches", long_about = None)]
struct Cli {
    /// Path to the broker configuration file
    #[arg(long, default_value = "config/benches.toml")]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Use the scripted health checker instead of real network checks
    #[arg(long)]
    mock: bool,

    /// Inject a mock failure, as BENCH-ID:check_name (repeatable, implies --mock)
    #[arg(long = "fail", value_name = "BENCH:CHECK")]
    failures: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show bench statuses
    Status {
        /// Show a single bench instead of the whole inventory
        #[arg(long)]
        bench: Option<String>,

        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Run the pre-flight health check against one bench
    Check {
        /// Bench id to check
        bench_id: String,
    },

    /// Allocate a bench, print its metadata, hold it, then release it
    Request {
        /// Hardware type to request (e.g. radar_x_band)
        hardware_type: String,

        /// Job identifier for tracking
        #[arg(long)]
        job_id: Option<String>,

        /// Skip the pre-flight health check
        #[arg(long)]
        skip_health_check: bool,

        /// Seconds to hold the bench before releasing it
        #[arg(long, default_value = "0")]
        hold_sec: u64,
    },

    /// Hold the cross-process lock of a shared instrument
    Lock {
        /// Instrument address the lock is keyed by (e.g. the PSU IP)
        instrument: String,

        /// Acquisition timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_sec: u64,

        /// Seconds to hold the lock before releasing it
        #[arg(long, default_value = "5")]
        hold_sec: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = logging::init(cli.log_format, "info") {
        eprintln!("warning: {err}");
    }

    let config = BrokerConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let checker = build_checker(&cli, &config)?;

    match cli.command {
        Commands::Status { bench, json } => show_status(config, checker, bench, json).await,
        Commands::Check { bench_id } => run_check(config, checker, &bench_id).await,
        Commands::Request {
            hardware_type,
            job_id,
            skip_health_check,
            hold_sec,
        } => run_request(
            config,
            checker,
            &hardware_type,
            job_id.as_deref(),
            skip_health_check,
            hold_sec,
        )
        .await,
        Commands::Lock {
            instrument,
            timeout_sec,
            hold_sec,
        } => hold_lock(config, &instrument, timeout_sec, hold_sec).await,
    }
}

/// Pick the production or scripted checker and apply injected failures.
fn build_checker(cli: &Cli, config: &BrokerConfig) -> Result<Arc<dyn HealthCheck>> {
    if !cli.mock && cli.failures.is_empty() {
        return Ok(Arc::new(NetworkHealthChecker::new(
            config.health_check.clone(),
        )));
    }

    let scripted = ScriptedHealthChecker::new();
    for spec in &cli.failures {
        let Some((bench_id, check)) = spec.split_once(':') else {
            bail!("--fail expects BENCH-ID:check_name, got '{spec}'");
        };
        scripted.fail_check(bench_id, check);
    }
    Ok(Arc::new(scripted))
}

async fn show_status(
    config: BrokerConfig,
    checker: Arc<dyn HealthCheck>,
    bench: Option<String>,
    json: bool,
) -> Result<()> {
    let broker = BenchBroker::new(config, checker)?;

    let statuses = match bench {
        Some(id) => {
            let Some(status) = broker.bench_status(&id).await else {
                bail!("bench '{id}' is not in the inventory");
            };
            vec![status]
        }
        None => broker.all_bench_statuses().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    for status in statuses {
        println!(
            "{:<12} {:<16} {:<12} {:<20} uut={}",
            status.bench_id,
            status.hardware_type,
            status.state,
            status.location,
            status.connection.uut_ip,
        );
    }
    Ok(())
}

async fn run_check(
    config: BrokerConfig,
    checker: Arc<dyn HealthCheck>,
    bench_id: &str,
) -> Result<()> {
    let Some(definition) = config.benches.iter().find(|b| b.bench_id == bench_id) else {
        bail!("bench '{bench_id}' is not in the inventory");
    };
    let (bench, _) = definition.clone().into_parts();

    let result = checker.check_bench(&bench).await;
    for (name, passed) in &result.checks {
        println!("{:<20} {}", name, if *passed { "✅ pass" } else { "❌ FAIL" });
    }
    println!();
    println!("{}", result.message);
    if !result.healthy {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_request(
    config: BrokerConfig,
    checker: Arc<dyn HealthCheck>,
    hardware_type: &str,
    job_id: Option<&str>,
    skip_health_check: bool,
    hold_sec: u64,
) -> Result<()> {
    let broker = BenchBroker::new(config, checker)?;

    let grant = broker
        .request_bench(hardware_type, job_id, skip_health_check)
        .await?;

    println!("✅ Bench allocated");
    for (key, value) in grant.report_fields() {
        println!("  {key:<22} {value}");
    }

    if hold_sec > 0 {
        println!("holding for {hold_sec}s ...");
        tokio::time::sleep(Duration::from_secs(hold_sec)).await;
    }

    broker.release_bench(&grant.bench_id).await;
    println!("bench {} released", grant.bench_id);
    Ok(())
}

async fn hold_lock(
    config: BrokerConfig,
    instrument: &str,
    timeout_sec: u64,
    hold_sec: u64,
) -> Result<()> {
    let lock = InstrumentLock::new(
        config.broker.lock_dir.clone(),
        instrument,
        Duration::from_secs(timeout_sec),
    )?;

    println!("acquiring lock for {instrument} (timeout {timeout_sec}s) ...");
    let guard = lock.acquire().await?;
    println!("🔒 lock held, artifact {}", lock.path().display());

    tokio::time::sleep(Duration::from_secs(hold_sec)).await;

    guard.release();
    println!("🔓 lock released");
    Ok(())
}
