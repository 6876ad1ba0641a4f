use softflip_core::campaign::{Campaign, CampaignBuilder, CampaignStatus, PhaseGoal, parse_rates};
use softflip_core::config::SoftflipSettings;
use softflip_core::injector::{InjectError, Injector};
use softflip_core::report::{CollectingReporter, Reporter};
use softflip_core::store::{CampaignStore, JsonFileStore};
use softflip_core::value::{Injectable, Value};

use clap::{Args, Parser, Subcommand, ValueEnum};
use num_bigint::BigUint;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Soft-error bit-flip fault injection", long_about = None)]
struct Cli {
    /// TOML settings file; `softflip.toml` in the working directory is used if present.
    #[clap(short, long, value_parser)]
    settings: Option<PathBuf>,
    /// Campaign JSON file, overriding `[store] path`.
    #[clap(long, value_parser)]
    store: Option<PathBuf>,
    /// Tracing filter such as `debug` or `softflip_core=trace`.
    #[clap(long)]
    log_level: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a new, not yet started campaign to the store.
    Configure(ConfigureArgs),
    /// Begin injecting at the first pending error rate.
    Start,
    /// End the campaign; injections pass through afterwards.
    Stop,
    /// Discard all progress and begin again from the first rate.
    Restart {
        /// Reset immediately instead of letting the next injection do it.
        #[clap(long)]
        now: bool,
    },
    /// Print the stored campaign.
    Status,
    /// Drive the stored campaign with random values and print the grouped records.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    #[clap(long, value_enum)]
    mode: ModeArg,
    /// Bits or values per rate, for `bits` and `variables` modes.
    #[clap(long)]
    target: Option<u64>,
    /// Seconds per rate, for `duration` mode.
    #[clap(long)]
    duration_secs: Option<u64>,
    /// Comma-separated error rates, e.g. `0.1,0.01,0.001`.
    #[clap(long)]
    rates: String,
    /// POST each iteration record to the collector.
    #[clap(long)]
    post: bool,
    #[clap(long)]
    endpoint: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Bits,
    Variables,
    Duration,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[clap(long, default_value_t = 1000)]
    calls: u64,
    #[clap(long, value_enum, default_value_t = ShapeArg::U32)]
    kind: ShapeArg,
    /// Seed for the generated values.
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShapeArg {
    U8,
    U16,
    U32,
    U64,
    U128,
    I32,
    I64,
    Big,
    Text,
    Bytes,
}

fn init_tracing(level: Option<&str>) -> Result<(), anyhow::Error> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", level, e))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<SoftflipSettings, anyhow::Error> {
    let mut settings = match &cli.settings {
        Some(path) => {
            info!(path = ?path, "loading settings");
            SoftflipSettings::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("softflip.toml");
            if default_path.exists() {
                info!(path = ?default_path, "loading default settings file");
                SoftflipSettings::load_from_file(&default_path)?
            } else {
                SoftflipSettings::default()
            }
        }
    };
    if let Some(store) = &cli.store {
        settings.store.path = store.clone();
    }
    Ok(settings)
}

fn build_campaign(args: &ConfigureArgs) -> Result<Campaign, anyhow::Error> {
    let phase = match args.mode {
        ModeArg::Bits => PhaseGoal::BitCount {
            target: args
                .target
                .ok_or_else(|| anyhow::anyhow!("--target is required for bits mode"))?,
        },
        ModeArg::Variables => PhaseGoal::VariableCount {
            target: args
                .target
                .ok_or_else(|| anyhow::anyhow!("--target is required for variables mode"))?,
        },
        ModeArg::Duration => PhaseGoal::Duration {
            span: Duration::from_secs(args.duration_secs.ok_or_else(|| {
                anyhow::anyhow!("--duration-secs is required for duration mode")
            })?),
        },
    };
    let mut builder = CampaignBuilder::new(phase).rates(parse_rates(&args.rates)?);
    if args.post || args.endpoint.is_some() {
        builder = match &args.endpoint {
            Some(endpoint) => builder.report_to(endpoint.clone()),
            None => builder.report_to(softflip_core::campaign::DEFAULT_REPORT_ENDPOINT),
        };
    }
    Ok(builder.build()?)
}

fn print_status(campaign: &Campaign) -> Result<(), anyhow::Error> {
    println!("Status: {}", campaign.status());
    if campaign.initialized {
        println!("Phase: {}", campaign.phase);
        match campaign.current_rate() {
            Some(rate) => println!(
                "Rate: {} ({}/{}), progress {}",
                rate,
                campaign.rate_index + 1,
                campaign.error_rates.len(),
                campaign.phase_counter
            ),
            None => println!("Rate: none"),
        }
    }
    println!("{}", serde_json::to_string_pretty(campaign)?);
    Ok(())
}

fn random_value(shape: ShapeArg, rng: &mut ChaCha8Rng) -> Value {
    match shape {
        ShapeArg::U8 => rng.random::<u8>().into_value(),
        ShapeArg::U16 => rng.random::<u16>().into_value(),
        ShapeArg::U32 => rng.random::<u32>().into_value(),
        ShapeArg::U64 => rng.random::<u64>().into_value(),
        ShapeArg::U128 => rng.random::<u128>().into_value(),
        ShapeArg::I32 => rng.random::<i32>().into_value(),
        ShapeArg::I64 => rng.random::<i64>().into_value(),
        ShapeArg::Big => BigUint::from_bytes_be(&rng.random::<[u8; 24]>()).into_value(),
        ShapeArg::Text => {
            let len = rng.random_range(1..=24);
            let text: String = (0..len)
                .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                .collect();
            Value::text(text)
        }
        ShapeArg::Bytes => {
            let mut buf = vec![0u8; 32];
            rng.fill(&mut buf[..]);
            Value::Bytes(buf)
        }
    }
}

fn simulate(settings: &SoftflipSettings, args: &SimulateArgs) -> Result<(), anyhow::Error> {
    let injector = Injector::from_settings(settings)?;
    let campaign = injector.campaign();
    if campaign.status() != CampaignStatus::Running && !campaign.restart_requested {
        anyhow::bail!(
            "Campaign is {}; run `softflip start` before simulating",
            campaign.status()
        );
    }

    let mut value_rng = match args.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::seed_from_u64(rand::rng().random()),
    };
    let mut collected = CollectingReporter::new();
    let start_time = Instant::now();
    let mut calls = 0u64;

    for _ in 0..args.calls {
        let injection = match injector.inject(random_value(args.kind, &mut value_rng)) {
            Ok(injection) => injection,
            Err(InjectError::Persistence { source, .. }) => {
                return Err(anyhow::anyhow!(
                    "Stopping simulation, campaign progress is not being saved: {}",
                    source
                ));
            }
        };
        calls += 1;
        if let Some(record) = &injection.record {
            collected.report(record, &campaign.report_sink)?;
        }
        if injection.status == CampaignStatus::Completed {
            info!(calls, "campaign completed during simulation");
            break;
        }
    }

    info!(
        calls,
        records = collected.total_records(),
        elapsed = ?start_time.elapsed(),
        "simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&collected.into_results())?);
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    let settings = load_settings(&cli)?;

    match &cli.command {
        Command::Configure(args) => {
            let store = JsonFileStore::new(settings.store.path.clone());
            match store.load() {
                Ok(previous) if previous.is_running() => {
                    warn!("replacing a running campaign; its progress is discarded")
                }
                _ => {}
            }
            let campaign = build_campaign(args)?;
            store.save(&campaign)?;
            println!("Campaign written to {:?}", store.path());
            print_status(&campaign)?;
        }
        Command::Start => {
            let injector = Injector::from_settings(&settings)?;
            injector.start()?;
            print_status(&injector.campaign())?;
        }
        Command::Stop => {
            let injector = Injector::from_settings(&settings)?;
            injector.stop()?;
            print_status(&injector.campaign())?;
        }
        Command::Restart { now } => {
            let injector = Injector::from_settings(&settings)?;
            if *now {
                injector.restart()?;
            } else {
                injector.request_restart()?;
                println!("Restart queued; the next injection applies it.");
            }
            print_status(&injector.campaign())?;
        }
        Command::Status => {
            let store = JsonFileStore::new(settings.store.path.clone());
            print_status(&store.load_or_default()?)?;
        }
        Command::Simulate(args) => simulate(&settings, args)?,
    }

    Ok(())
}
