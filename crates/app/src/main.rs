use std::{
    f32::consts::PI,
    io::BufRead,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use toybox_core::{
    flow_interval, AnalyserNode, AppConfig, AudioCapability, Fetcher, FlowScheduler, FlowState,
    MemoryHistory, MicrophoneState, ModuleResolver, Router, ToyCapabilities, ToyHost,
};
use tracing_subscriber::EnvFilter;

mod fetcher;
mod source;
mod timers;
mod toys;

use fetcher::{DistFetcher, OfflineFetcher};
use source::SweepSource;
use timers::TokioTimers;
use toys::{builtin_catalog, builtin_registry, TerminalContainer};

fn main() -> toybox_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Run {
            url,
            dist,
            base,
            cycles,
            speedup,
            no_mic,
        } => {
            if base.is_some() {
                config.resolver.base_url = base;
            }
            runtime.block_on(run_host(RunOptions {
                config,
                url,
                dist,
                cycles,
                speedup,
                no_mic,
            }))
        }
        Commands::Resolve { key, dist, base } => {
            if base.is_some() {
                config.resolver.base_url = base;
            }
            runtime.block_on(run_resolve(&config, &key, dist))
        }
        Commands::Interval { cycles, idle_secs } => {
            run_interval(&config, cycles, idle_secs);
            Ok(())
        }
        Commands::Analyse {
            fft_size,
            frequency,
            blocks,
        } => {
            if let Some(fft_size) = fft_size {
                config.analysis.fft_size = fft_size;
            }
            config.validate()?;
            run_analyse(&config, frequency, blocks)
        }
    }
}

struct RunOptions {
    config: AppConfig,
    url: String,
    dist: Option<PathBuf>,
    cycles: u32,
    speedup: f64,
    no_mic: bool,
}

async fn run_host(options: RunOptions) -> toybox_core::Result<()> {
    let RunOptions {
        config,
        url,
        dist,
        cycles,
        speedup,
        no_mic,
    } = options;
    tracing::info!(%url, cycles, "starting toybox host");

    let history = Arc::new(MemoryHistory::new(url));
    let resolver = Arc::new(
        ModuleResolver::from_config(make_fetcher(dist), &config.resolver)
            .with_location(history.clone()),
    );
    let catalog = builtin_catalog();
    let registry = builtin_registry(&resolver, &catalog).await;

    let permission = if no_mic {
        MicrophoneState::Denied
    } else {
        MicrophoneState::Granted
    };
    let source = Arc::new(SweepSource::new(config.analysis.sample_rate, permission));
    let host = Arc::new(
        ToyHost::new(
            catalog,
            resolver,
            Arc::new(registry),
            Arc::new(TerminalContainer::new("stage")),
        )
        .with_capabilities(ToyCapabilities {
            audio: Some(AudioCapability::new(source, config.analysis.clone())),
        }),
    );
    let router = Arc::new(Router::from_config(history.clone(), host.clone(), &config.router));
    router.init_navigation();

    if let Err(err) = router.load_from_query().await {
        tracing::error!(%err, "initial toy failed to load");
    }

    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<()>();
    let (touch_tx, mut touch_rx) = mpsc::unbounded_channel::<()>();
    watch_stdin(touch_tx);
    let mut scheduler = FlowScheduler::new(Some(Arc::new(TokioTimers::current())));
    let mut flow = FlowState::new(Instant::now());
    let speedup = speedup.max(f64::EPSILON);

    for _ in 0..cycles {
        let tx = wake_tx.clone();
        scheduler.schedule(
            || flow_interval(&flow, Instant::now(), &config.flow).div_f64(speedup),
            move || {
                let _ = tx.send(());
            },
        );
        let woke = loop {
            tokio::select! {
                wake = wake_rx.recv() => break wake.is_some(),
                Some(()) = touch_rx.recv() => {
                    flow.record_interaction(Instant::now());
                    tracing::debug!("interaction recorded");
                }
            }
        };
        if !woke {
            break;
        }
        flow.complete_cycle();

        let next = host
            .catalog()
            .next_after(host.active_slug().as_deref())
            .map(|entry| entry.slug.clone());
        let Some(next) = next else { break };
        router.push_toy_state(&next);
        if let Err(err) = router.load_from_query().await {
            tracing::error!(%err, "auto-advance failed");
        }
    }
    scheduler.clear();

    history.back().await;
    router.update_history_to_library_view();
    router.load_from_query().await?;

    for (index, entry) in history.entries().iter().enumerate() {
        tracing::info!(index, url = %entry, "history");
    }
    Ok(())
}

async fn run_resolve(
    config: &AppConfig,
    key: &str,
    dist: Option<PathBuf>,
) -> toybox_core::Result<()> {
    let resolver = ModuleResolver::from_config(make_fetcher(dist), &config.resolver);
    if let Some(base) = resolver.base_url() {
        tracing::info!(%base, "resolving against base url");
    }
    let manifest = resolver.fetch_manifest().await;
    tracing::info!(manifest = manifest.is_some(), "manifest lookup finished");
    println!("{}", resolver.resolve_module_path(key).await);
    Ok(())
}

fn run_interval(config: &AppConfig, cycles: u32, idle_secs: u64) {
    let now = Instant::now();
    let idle = Duration::from_secs(idle_secs);
    let state = FlowState {
        cycle_count: cycles,
        last_interaction_at: now.checked_sub(idle).unwrap_or(now),
    };
    let interval = flow_interval(&state, now, &config.flow);
    println!("{}", interval.as_millis());
}

fn run_analyse(config: &AppConfig, frequency: f32, blocks: usize) -> toybox_core::Result<()> {
    let analysis = &config.analysis;
    let node = AnalyserNode::spawn(analysis)?;
    let port = node.input_port();
    let rate = analysis.sample_rate.max(1) as f32;
    let block: Vec<f32> = (0..analysis.fft_size)
        .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / rate).sin())
        .collect();

    tracing::info!(fft_size = analysis.fft_size, frequency, blocks, "analysing synthetic tone");
    let mut received = 0;
    for _ in 0..blocks {
        // Wait for room rather than dropping quanta, this is an offline run.
        while !port.push(block.clone())? {
            std::thread::sleep(Duration::from_millis(1));
        }
        while let Some(frame) = node.recv_frame_timeout(Duration::from_millis(50))? {
            let bin_hz = rate / (2 * frame.bin_count()).max(1) as f32;
            let peak_hz = frame.peak_bin().map(|bin| bin as f32 * bin_hz);
            println!(
                "frame {:>4}  rms {:.4}  peak {}",
                frame.index,
                frame.rms,
                peak_hz.map_or_else(|| "-".to_string(), |hz| format!("{hz:.1} Hz"))
            );
            received += 1;
            node.recycler().recycle(frame);
            if received >= blocks {
                break;
            }
        }
    }
    tracing::info!(received, dropped = node.dropped_frames(), "analysis finished");
    Ok(())
}

/// Every line typed on stdin counts as the user interacting with the stage.
fn watch_stdin(touch: mpsc::UnboundedSender<()>) {
    let spawned = std::thread::Builder::new()
        .name("toybox-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() || touch.send(()).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "not watching stdin for interactions");
    }
}

fn make_fetcher(dist: Option<PathBuf>) -> Arc<dyn Fetcher> {
    match dist {
        Some(root) => Arc::new(DistFetcher::new(root)),
        None => Arc::new(OfflineFetcher),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Host for interchangeable audio-reactive toys", long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used without one.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the toy named in the URL, then auto-advance on the flow schedule.
    Run {
        /// Page URL, e.g. `http://localhost/?toy=spectrum`.
        #[arg(long, default_value = "http://localhost/")]
        url: String,
        /// Build output directory holding the manifest.
        #[arg(long)]
        dist: Option<PathBuf>,
        /// Base URL overriding the page location.
        #[arg(long)]
        base: Option<String>,
        /// Number of auto-advance cycles before returning to the library.
        #[arg(long, default_value_t = 2)]
        cycles: u32,
        /// Divides every flow interval, so demos need not wait minutes.
        #[arg(long, default_value_t = 1.0)]
        speedup: f64,
        /// Behave as if microphone access was denied.
        #[arg(long)]
        no_mic: bool,
    },
    /// Print the path a module key resolves to.
    Resolve {
        key: String,
        #[arg(long)]
        dist: Option<PathBuf>,
        #[arg(long)]
        base: Option<String>,
    },
    /// Print the flow interval in milliseconds for an engagement snapshot.
    Interval {
        #[arg(long, default_value_t = 0)]
        cycles: u32,
        #[arg(long, default_value_t = 0)]
        idle_secs: u64,
    },
    /// Run a synthetic tone through the off-thread analyser.
    Analyse {
        #[arg(long)]
        fft_size: Option<usize>,
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,
        #[arg(long, default_value_t = 8)]
        blocks: usize,
    },
}
