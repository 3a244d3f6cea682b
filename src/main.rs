//! Command-line front end for scpi_daq.
//!
//! ```text
//! scpi_daq supply --supply COM21 --address 6 --voltage 12.5 --output on
//! scpi_daq sweep --meter COM3 --model 6485 --supply COM21 --address 6 \
//!     --stop 10 --step 0.5 --hold-ms 1000 --output sweep.csv
//! ```
//!
//! Ctrl-C stops a running poll, sweep or supply watch at its next wait.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use scpi_daq::bus::BusManager;
use scpi_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use scpi_daq::instrument::{CurrentMeter, CurrentRange, KeithleyPicoammeter, PicoammeterModel, ScpiConsole, TdkPowerSupply};
use scpi_daq::layout::{WindowGeometry, GEOMETRY_FILE};
use scpi_daq::measurement::{sample_channel, MeasurementStation, Probe, Sample, SampleLog};
use scpi_daq::scheduler::{
    spawn_poll, spawn_supply_session, spawn_sweep, JobHandle, JobOutcome, PollPlan, SessionPlan, SupplyTargets, SweepPlan,
    SweepTimings,
};
use scpi_daq::transport::{self, ConnectionDescriptor};
use scpi_daq::{logging, storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "scpi_daq")]
#[command(about = "SCPI control for TDK-Lambda supplies and Keithley picoammeters")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (overrides the configuration file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct MeterArgs {
    /// Picoammeter link: PORT[@BAUD], tcp://HOST:PORT or sim
    #[arg(long)]
    meter: ConnectionDescriptor,

    /// Picoammeter model (6485 or 6487)
    #[arg(long, default_value = "6485")]
    model: PicoammeterModel,
}

#[derive(Args, Debug, Clone)]
struct SupplyArgs {
    /// Power supply bus: PORT[@BAUD], tcp://HOST:PORT or sim
    #[arg(long)]
    supply: ConnectionDescriptor,

    /// Supply address on the multidrop bus
    #[arg(long, default_value = "6")]
    address: u8,
}

#[derive(Args, Debug, Clone)]
struct OptionalSupplyArgs {
    /// Power supply bus whose read-back voltage is recorded
    #[arg(long)]
    supply: Option<ConnectionDescriptor>,

    /// Supply address on the multidrop bus
    #[arg(long, default_value = "6")]
    address: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,

    /// Print the effective configuration
    Config,

    /// Send raw SCPI commands (interactive when no command is given)
    Console {
        /// Instrument link: PORT[@BAUD], tcp://HOST:PORT or sim
        port: ConnectionDescriptor,

        /// Prefix commands with this multidrop address (serial only)
        #[arg(long)]
        address: Option<u8>,

        /// Read a reply after sending
        #[arg(short, long)]
        query: bool,

        /// Command to send
        command: Vec<String>,
    },

    /// Set or read a power supply
    Supply {
        #[command(flatten)]
        supply: SupplyArgs,

        /// Voltage setpoint (V)
        #[arg(long)]
        voltage: Option<f64>,

        /// Current limit (A)
        #[arg(long)]
        current: Option<f64>,

        /// Output state: on or off
        #[arg(long)]
        output: Option<OnOff>,

        /// Send *RST first
        #[arg(long)]
        reset: bool,

        /// Print every setting and read-back value
        #[arg(long)]
        status: bool,

        /// Watch actual V, I and power until Ctrl-C, then switch the output
        /// off. With --voltage and --current the supply is reset, set and
        /// switched on first.
        #[arg(long, conflicts_with_all = ["output", "reset"])]
        watch: bool,

        /// Read-back interval in milliseconds for --watch
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Take one current measurement
    Measure {
        #[command(flatten)]
        meter: MeterArgs,

        #[command(flatten)]
        supply: OptionalSupplyArgs,

        /// Write the sample to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show or update the saved window geometry used by front ends
    Layout {
        /// Geometry file
        #[arg(long, default_value = GEOMETRY_FILE)]
        file: PathBuf,

        /// Left edge
        #[arg(long, allow_hyphen_values = true)]
        x: Option<i32>,

        /// Top edge
        #[arg(long, allow_hyphen_values = true)]
        y: Option<i32>,

        /// Width
        #[arg(long)]
        w: Option<u32>,

        /// Height
        #[arg(long)]
        h: Option<u32>,
    },

    /// Reset the picoammeter and send the preparation block
    Prepare {
        #[command(flatten)]
        meter: MeterArgs,

        /// Current range: auto or a value such as 2e-6
        #[arg(long, default_value = "auto")]
        range: CurrentRange,
    },

    /// Measure repeatedly at a fixed interval
    Poll {
        #[command(flatten)]
        meter: MeterArgs,

        #[command(flatten)]
        supply: OptionalSupplyArgs,

        /// Number of samples
        #[arg(long)]
        count: Option<u32>,

        /// Interval between samples in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Write samples to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Step the supply voltage and measure at each step
    Sweep {
        #[command(flatten)]
        meter: MeterArgs,

        #[command(flatten)]
        supply: SupplyArgs,

        /// First voltage (defaults to the supply's actual output)
        #[arg(long, allow_hyphen_values = true)]
        start: Option<f64>,

        /// Last voltage
        #[arg(long, allow_hyphen_values = true)]
        stop: f64,

        /// Signed step (V)
        #[arg(long, allow_hyphen_values = true)]
        step: f64,

        /// Hold time per step in milliseconds
        #[arg(long)]
        hold_ms: u64,

        /// Write samples to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum OnOff {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        settings.application.log_level = level.clone();
        settings.validate()?;
    }
    logging::init(&settings.application.log_level);

    match cli.command {
        Command::Ports => list_ports(),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Console {
            port,
            address,
            query,
            command,
        } => run_console(&settings, &port, address, query, command).await,
        Command::Supply {
            supply,
            voltage,
            current,
            output,
            reset,
            status,
            watch,
            interval_ms,
        } => {
            let actions = SupplyActions {
                voltage,
                current,
                output: output.map(|o| matches!(o, OnOff::On)),
                reset,
                status,
                watch,
                interval: interval_ms.map_or_else(|| settings.poll.interval(), Duration::from_millis),
            };
            run_supply(&settings, &supply, actions).await
        }
        Command::Measure {
            meter,
            supply,
            output,
        } => run_measure(&settings, &meter, &supply, output).await,
        Command::Layout { file, x, y, w, h } => run_layout(&file, x, y, w, h),
        Command::Prepare { meter, range } => {
            let meter = open_meter(&settings, &meter).await?;
            meter.prepare_measurement(range).await?;
            println!("Preparation commands sent (range {range:?})");
            meter.disconnect().await?;
            Ok(())
        }
        Command::Poll {
            meter,
            supply,
            count,
            interval_ms,
            output,
        } => {
            let plan = PollPlan::new(
                count.unwrap_or(settings.poll.count),
                interval_ms.map_or_else(|| settings.poll.interval(), Duration::from_millis),
            );
            run_poll(&settings, &meter, &supply, plan, output).await
        }
        Command::Sweep {
            meter,
            supply,
            start,
            stop,
            step,
            hold_ms,
            output,
        } => {
            let request = SweepRequest {
                start,
                stop,
                step,
                hold: Duration::from_millis(hold_ms),
            };
            run_sweep(&settings, &meter, &supply, request, output).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn run_console(
    settings: &Settings,
    descriptor: &ConnectionDescriptor,
    address: Option<u8>,
    query: bool,
    command: Vec<String>,
) -> Result<()> {
    let bus = BusManager::open(descriptor, settings).await?;
    let console = ScpiConsole::new(bus, descriptor, Duration::from_millis(settings.bus.read_timeout_ms))
        .with_address(address);

    if !command.is_empty() {
        let line = command.join(" ");
        if query {
            println!("{}", console.query(&line).await?);
        } else {
            console.send(&line).await?;
        }
        console.close().await?;
        return Ok(());
    }

    println!("Connected to {descriptor}. Commands ending in '?' are queried; empty line quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let result = if query || line.ends_with('?') {
            console.query(line).await.map(|reply| {
                if reply.is_empty() {
                    println!("(no response)");
                } else {
                    println!("{reply}");
                }
            })
        } else {
            console.send(line).await
        };
        if let Err(e) = result {
            println!("ERROR: {e}");
        }
    }
    console.close().await?;
    Ok(())
}

struct SupplyActions {
    voltage: Option<f64>,
    current: Option<f64>,
    output: Option<bool>,
    reset: bool,
    status: bool,
    watch: bool,
    interval: Duration,
}

async fn run_supply(settings: &Settings, args: &SupplyArgs, actions: SupplyActions) -> Result<()> {
    let targets = match (actions.watch, actions.voltage, actions.current) {
        (true, Some(voltage), Some(current)) => Some(SupplyTargets { voltage, current }),
        (true, None, None) | (false, _, _) => None,
        (true, _, _) => bail!("--watch needs both --voltage and --current, or neither"),
    };

    let bus = BusManager::open(&args.supply, settings).await?;
    let supply = Arc::new(bus.power_supply(args.address));

    if !supply.test_communication().await {
        warn!(address = args.address, "Supply did not answer, continuing anyway");
    }
    let result = if actions.watch {
        watch_supply(settings, &supply, targets, actions.interval).await
    } else {
        apply_supply_actions(&supply, &actions).await
    };

    supply.disconnect().await?;
    result
}

async fn watch_supply(
    settings: &Settings,
    supply: &Arc<TdkPowerSupply>,
    targets: Option<SupplyTargets>,
    interval: Duration,
) -> Result<()> {
    let plan = SessionPlan { targets, interval };
    let supply = Arc::clone(supply);
    let samples = collect(settings, |tx| Ok(spawn_supply_session(supply, plan, tx))).await?;
    print_samples(&samples);
    Ok(())
}

async fn apply_supply_actions(supply: &TdkPowerSupply, actions: &SupplyActions) -> Result<()> {
    if actions.reset && !supply.reset().await {
        bail!("reset was not delivered");
    }
    if let Some(volts) = actions.voltage {
        if !supply.set_voltage(volts).await {
            bail!("voltage setpoint was not delivered");
        }
    }
    if let Some(amps) = actions.current {
        if !supply.set_current(amps).await {
            bail!("current limit was not delivered");
        }
    }
    if let Some(enabled) = actions.output {
        if !supply.set_output(enabled).await {
            bail!("output command was not delivered");
        }
    }
    if actions.status {
        println!("{}", serde_json::to_string_pretty(&supply.status().await)?);
    }
    Ok(())
}

fn run_layout(file: &Path, x: Option<i32>, y: Option<i32>, w: Option<u32>, h: Option<u32>) -> Result<()> {
    let mut geometry = WindowGeometry::load_or_default(file);
    if x.is_some() || y.is_some() || w.is_some() || h.is_some() {
        geometry.x = x.unwrap_or(geometry.x);
        geometry.y = y.unwrap_or(geometry.y);
        geometry.w = w.unwrap_or(geometry.w);
        geometry.h = h.unwrap_or(geometry.h);
        geometry
            .save(file)
            .with_context(|| format!("Failed to save geometry to {}", file.display()))?;
    }
    println!("{}", serde_json::to_string(&geometry)?);
    Ok(())
}

async fn open_meter(settings: &Settings, args: &MeterArgs) -> Result<KeithleyPicoammeter> {
    KeithleyPicoammeter::open(&args.meter, args.model, settings)
        .await
        .with_context(|| format!("Failed to connect to picoammeter at {}", args.meter))
}

/// Open the supply, sharing the meter's bus when both use the same link.
async fn open_supply(
    settings: &Settings,
    meter: &MeterArgs,
    descriptor: &ConnectionDescriptor,
    address: u8,
    meter_bus: &BusManager,
) -> Result<TdkPowerSupply> {
    let bus = if *descriptor == meter.meter {
        meter_bus.clone()
    } else {
        BusManager::open(descriptor, settings).await?
    };
    Ok(bus.power_supply(address))
}

struct Bench {
    meter: Arc<KeithleyPicoammeter>,
    supply: Option<Arc<TdkPowerSupply>>,
    station: Arc<MeasurementStation>,
}

impl Bench {
    async fn open(
        settings: &Settings,
        meter_args: &MeterArgs,
        supply: Option<(&ConnectionDescriptor, u8)>,
    ) -> Result<Self> {
        let bus = BusManager::open(&meter_args.meter, settings).await?;
        let meter = KeithleyPicoammeter::new(
            bus.clone(),
            meter_args.model,
            (&settings.picoammeter).into(),
        );
        meter
            .connect()
            .await
            .with_context(|| format!("Failed to connect to picoammeter at {}", meter_args.meter))?;
        let meter = Arc::new(meter);

        let supply = match supply {
            Some((descriptor, address)) => Some(Arc::new(
                open_supply(settings, meter_args, descriptor, address, &bus).await?,
            )),
            None => None,
        };

        let as_meter: Arc<dyn CurrentMeter> = meter.clone();
        let mut station = MeasurementStation::new(as_meter);
        if let Some(supply) = &supply {
            station = station.with_source(supply.clone());
        }

        Ok(Self {
            meter,
            supply,
            station: Arc::new(station),
        })
    }

    async fn close(self) -> Result<()> {
        if let Some(supply) = &self.supply {
            supply.disconnect().await?;
        }
        self.meter.disconnect().await?;
        Ok(())
    }
}

async fn run_measure(
    settings: &Settings,
    meter: &MeterArgs,
    supply: &OptionalSupplyArgs,
    output: Option<PathBuf>,
) -> Result<()> {
    let bench = Bench::open(
        settings,
        meter,
        supply.supply.as_ref().map(|d| (d, supply.address)),
    )
    .await?;

    let log = SampleLog::new();
    let sample = bench.station.measure_once().await;
    let measured = sample.current.is_some();
    log.push(sample).await;
    bench.close().await?;

    if !measured {
        bail!("no current reading");
    }
    finish(&log.snapshot().await, output)
}

async fn run_poll(
    settings: &Settings,
    meter: &MeterArgs,
    supply: &OptionalSupplyArgs,
    plan: PollPlan,
    output: Option<PathBuf>,
) -> Result<()> {
    let bench = Bench::open(
        settings,
        meter,
        supply.supply.as_ref().map(|d| (d, supply.address)),
    )
    .await?;

    let probe: Arc<dyn Probe> = bench.station.clone();
    let samples = collect(settings, |tx| Ok(spawn_poll(probe, plan, tx))).await?;
    finish(&samples, output)?;
    bench.close().await
}

struct SweepRequest {
    start: Option<f64>,
    stop: f64,
    step: f64,
    hold: Duration,
}

async fn run_sweep(
    settings: &Settings,
    meter: &MeterArgs,
    supply: &SupplyArgs,
    request: SweepRequest,
    output: Option<PathBuf>,
) -> Result<()> {
    // An explicit start is checked before any instrument is opened
    if let Some(start) = request.start {
        SweepPlan::new(start, request.stop, request.step, request.hold)?;
    }
    let bench = Bench::open(settings, meter, Some((&supply.supply, supply.address))).await?;

    let start = match request.start {
        Some(start) => start,
        None => bench.station.read_voltage().await.unwrap_or_else(|| {
            warn!("Could not read the supply voltage, starting at 0 V");
            0.0
        }),
    };
    let plan = match SweepPlan::new(start, request.stop, request.step, request.hold) {
        Ok(plan) => plan,
        Err(e) => {
            bench.close().await?;
            return Err(e.into());
        }
    };
    info!(steps = plan.voltages().len(), "Sweep planned");

    let station = Arc::clone(&bench.station);
    let timings = SweepTimings::from(&settings.sweep);
    let samples = collect(settings, |tx| Ok(spawn_sweep(station, plan, timings, tx)?)).await?;
    finish(&samples, output)?;
    bench.close().await
}

/// Run a job into a fresh sample log, cancelling it on Ctrl-C.
async fn collect<F>(settings: &Settings, start: F) -> Result<Vec<Sample>>
where
    F: FnOnce(scpi_daq::measurement::SampleSender) -> Result<JobHandle>,
{
    let log = SampleLog::new();
    let (tx, rx) = sample_channel(settings.sweep.channel_capacity);
    let collector = log.spawn_collector(rx);

    let job = start(tx)?;
    let token = job.token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let outcome = job.join().await?;
    ctrl_c.abort();
    collector.await?;

    match &outcome {
        JobOutcome::Completed { samples } => info!(samples, "Job completed"),
        JobOutcome::Cancelled { samples } => info!(samples, "Job cancelled"),
        JobOutcome::Aborted { samples, reason } => warn!(samples, reason = %reason, "Job aborted"),
    }
    if log.is_empty().await {
        warn!("Job produced no samples");
    } else {
        info!(collected = log.len().await, "Samples collected");
    }
    Ok(log.snapshot().await)
}

fn print_samples(samples: &[Sample]) {
    println!("{:<28} {:>12} {:>14} {:>12}", "time", "voltage (V)", "current (A)", "power (W)");
    for sample in samples {
        println!(
            "{:<28} {:>12} {:>14} {:>12}",
            sample.timestamp.format(storage::TIME_FORMAT).to_string(),
            sample.voltage.map_or("-".to_string(), |v| format!("{v:.3}")),
            sample.current.map_or("-".to_string(), |i| format!("{i:.4e}")),
            sample.power().map_or("-".to_string(), |p| format!("{p:.4e}")),
        );
    }
}

fn finish(samples: &[Sample], output: Option<PathBuf>) -> Result<()> {
    print_samples(samples);
    if let Some(path) = output {
        if samples.is_empty() {
            warn!("No samples collected, nothing saved");
        } else {
            storage::write_csv(&path, samples)
                .with_context(|| format!("Failed to save samples to {}", path.display()))?;
            println!("Saved {} samples to {}", samples.len(), path.display());
        }
    }
    Ok(())
}
