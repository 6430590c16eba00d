//! ChunkVault storage node
//!
//! Formats, inspects and serves the storage units of one node.

use anyhow::{Context, Result, bail};
use chunkvault_common::{BlockSizeClass, Cid, Config, Distribution, Fid, Layout, Sid};
use chunkvault_dispatch::{Completion, DiskDispatcher, Operation};
use chunkvault_storage::{DeviceMonitor, FileRef, StorageRegistry, StorageUnit};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError, bounded};
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chunkvault-node")]
#[command(about = "ChunkVault storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/chunkvault/node.toml")]
    config: String,

    /// Log level
    #[arg(long, env = "CHUNKVAULT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Number of disk threads
    #[arg(long)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the directory tree and ownership marks of every device
    Format,
    /// Probe every device and print its state as JSON
    Status,
    /// Run the disk dispatcher and the device monitor until Ctrl-C
    ///
    /// Diagnostic commands are read from stdin, one per line.
    Serve,
    /// Drive writes then reads through the disk dispatcher
    Bench {
        /// Files written concurrently
        #[arg(long, default_value = "8")]
        files: usize,
        /// Operations per phase
        #[arg(long, default_value = "256")]
        ops: usize,
        /// Blocks per operation
        #[arg(long, default_value = "16")]
        blocks: u32,
    },
}

/// Read the configuration file, then apply command line overrides
fn load_config(args: &Args) -> Result<Config> {
    let path = Path::new(&args.config);
    let mut config: Config = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))?
    } else {
        Config::default()
    };

    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(threads) = args.threads {
        config.dispatcher.threads = threads;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Config file: {}", args.config);
    if config.storages.is_empty() {
        error!("No storage configured in {}", args.config);
        std::process::exit(1);
    }

    match args.command {
        Commands::Format => format(&config),
        Commands::Status => status(&config),
        Commands::Serve => serve(config).await,
        Commands::Bench { files, ops, blocks } => bench(&config, files, ops, blocks),
    }
}

fn format(config: &Config) -> Result<()> {
    for storage in &config.storages {
        StorageUnit::format(storage)
            .with_context(|| format!("cannot format storage {}/{}", storage.cid, storage.sid))?;
        info!(
            "Formatted storage {}/{} ({} devices under {})",
            storage.cid,
            storage.sid,
            storage.device_number,
            storage.root.display()
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let registry = StorageRegistry::open(&config.storages, &config.monitor)?;
    let units: Vec<serde_json::Value> = registry
        .iter()
        .map(|unit| {
            serde_json::json!({
                "cid": unit.cid(),
                "sid": unit.sid(),
                "root": unit.config().root,
                "stat": unit.stat(),
                "crc_errors": unit.crc_errors(),
                "devices": unit.device_info(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&units)?);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let registry = Arc::new(StorageRegistry::open(&config.storages, &config.monitor)?);
    let monitor = DeviceMonitor::start(
        registry.clone(),
        Duration::from_secs(config.monitor.period_secs),
    )?;

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (diag_tx, diag_rx) = bounded::<String>(16);
    let dispatcher = DiskDispatcher::<()>::start(registry, &config.dispatcher)?;
    let event_loop = thread::Builder::new()
        .name("disk-dispatch".to_string())
        .spawn(move || {
            let completed = run_event_loop(dispatcher, &stop_rx, &diag_rx);
            info!("Dispatch loop stopped after {} completions", completed);
        })
        .context("cannot spawn the dispatch loop")?;

    info!("Serving {} storage units, Ctrl-C to stop", config.storages.len());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("cannot listen for Ctrl-C")?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if diag_tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Cannot read diagnostic commands: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    info!("Shutting down");
    drop(stop_tx);
    if event_loop.join().is_err() {
        error!("Dispatch loop panicked");
    }
    monitor.shutdown();
    Ok(())
}

/// Serve completions and diagnostics until `stop` closes
///
/// Operations still outstanding at that point are completed before the
/// disk threads are joined. Returns the number of completions handled.
fn run_event_loop(
    mut dispatcher: DiskDispatcher<()>,
    stop: &Receiver<()>,
    diag: &Receiver<String>,
) -> usize {
    let mut completed = 0;
    loop {
        if dispatcher.outstanding() > 0 {
            // Completions wake the loop as soon as a disk thread answers
            completed += dispatcher.poll_timeout(Duration::from_millis(10), |(), completion| {
                log_completion(&completion);
            });
            if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            if let Ok(line) = diag.try_recv() {
                print!("{}", dispatcher.diag(&line));
            }
            continue;
        }
        completed += dispatcher.poll(|(), completion| log_completion(&completion));
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(diag) -> line => {
                if let Ok(line) = line {
                    print!("{}", dispatcher.diag(&line));
                }
            }
            default(Duration::from_millis(100)) => {}
        }
    }
    dispatcher.drain(|(), completion| {
        completed += 1;
        log_completion(&completion);
    });
    dispatcher.shutdown();
    completed
}

fn log_completion(completion: &Completion) {
    match &completion.status {
        Ok(_) => debug!(
            "{} on {} done in {:?}",
            completion.opcode, completion.fid, completion.latency
        ),
        Err(e) => warn!("{} on {} failed: {}", completion.opcode, completion.fid, e),
    }
}

fn bench(config: &Config, files: usize, ops: usize, blocks: u32) -> Result<()> {
    if files == 0 || ops == 0 || blocks == 0 {
        bail!("files, ops and blocks must be positive");
    }
    let registry = Arc::new(StorageRegistry::open(&config.storages, &config.monitor)?);
    let Some(unit) = registry.iter().next().cloned() else {
        bail!("no storage unit to run against");
    };
    let (cid, sid) = (unit.cid(), unit.sid());
    let mut dispatcher = DiskDispatcher::<usize>::start(registry, &config.dispatcher)?;
    dispatcher.stats().throughput().set_enabled(true);

    let files: Vec<FileRef> = (0..files)
        .map(|_| FileRef {
            fid: Fid::random(),
            spare: false,
            layout: Layout::L2_3_4,
            bsize: BlockSizeClass::B4K,
            distribution: Distribution::from_raw(&[sid.0]),
        })
        .collect();
    let op_bytes = files[0].projection_bytes() * u64::from(blocks);
    let mut payload = vec![0u8; usize::try_from(op_bytes)?];
    rand::thread_rng().fill_bytes(&mut payload);

    let write = run_phase(&mut dispatcher, cid, sid, ops, |i| {
        let file = &files[i % files.len()];
        Operation::Write {
            file: file.clone(),
            first_block: (i / files.len()) as u64 * u64::from(blocks),
            block_count: blocks,
            bins: payload.clone(),
        }
    });
    let read = run_phase(&mut dispatcher, cid, sid, ops, |i| {
        let file = &files[i % files.len()];
        Operation::Read {
            file: file.clone(),
            first_block: (i / files.len()) as u64 * u64::from(blocks),
            block_count: blocks,
        }
    });

    for (name, phase) in [("write", write), ("read", read)] {
        let secs = phase.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "{name}: {} ops, {} errors, {:.1} MB/s, {:.0} ops/s",
            phase.ops,
            phase.errors,
            phase.bytes as f64 / secs / 1024.0 / 1024.0,
            phase.ops as f64 / secs
        );
    }
    print!("{}", dispatcher.diag("stats"));

    for file in &files {
        dispatcher.submit(cid, sid, Operation::Remove { fid: file.fid }, 0);
    }
    dispatcher.drain(|_, completion| log_completion(&completion));
    dispatcher.shutdown();
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
struct Phase {
    ops: usize,
    errors: usize,
    bytes: u64,
    elapsed: Duration,
}

fn run_phase(
    dispatcher: &mut DiskDispatcher<usize>,
    cid: Cid,
    sid: Sid,
    ops: usize,
    mut make: impl FnMut(usize) -> Operation,
) -> Phase {
    let start = Instant::now();
    for i in 0..ops {
        dispatcher.submit(cid, sid, make(i), i);
    }
    let mut phase = Phase::default();
    dispatcher.drain(|_, completion| {
        phase.ops += 1;
        match &completion.status {
            Ok(reply) => phase.bytes += reply.bytes(),
            Err(_) => {
                phase.errors += 1;
                log_completion(&completion);
            }
        }
    });
    phase.elapsed = start.elapsed();
    phase
}
