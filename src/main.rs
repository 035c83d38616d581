// src/main.rs
mod app;
mod config;
mod detect;
mod dispatch;
mod gesture;
mod overlay;
mod session;
mod tracking;
mod ui;
mod video;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ActuatorBackend, CasterConfig};
use crate::dispatch::ActionDispatcher;
use crate::overlay::{HeadlessSink, RenderSink};
use crate::session::{EpochTimer, SceneSession, SessionOutcome, Shutdown};
use crate::video::{CameraSource, FrameSource, ImageSequenceSource};

#[derive(Parser, Debug)]
#[command(name = "wand_caster", version, about = "Track an IR wand tip and turn gestures into GPIO actions")]
struct Cli {
    /// JSON config file (defaults to the per-user config location)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging for this crate (RUST_LOG still wins)
    #[arg(short, long)]
    verbose: bool,

    /// Run without a viewer window
    #[arg(long)]
    headless: bool,

    /// Camera index to open
    #[arg(long, value_name = "N")]
    camera: Option<u32>,

    /// Replay a directory of png/jpg frames instead of the camera
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// Drive GPIO through a pigpio daemon at this address
    #[arg(long, value_name = "ADDR")]
    pigpio: Option<String>,

    /// Print the cameras the system can see and exit
    #[arg(long)]
    list_cameras: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose))))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Without --verbose only casts and warnings reach the console.
fn log_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,wand_caster=debug"
    } else {
        "warn,wand_caster::dispatch=info"
    }
}

fn list_cameras() -> anyhow::Result<()> {
    let cameras = nokhwa::query(nokhwa::utils::ApiBackend::Auto).context("Failed to query cameras")?;
    println!("Found {} camera(s):", cameras.len());
    for camera in &cameras {
        println!("  [{}] {}", camera.index(), camera.human_name());
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.list_cameras {
        list_cameras()?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = CasterConfig::load(cli.config.as_deref())?;
    if let Some(index) = cli.camera {
        config.camera.index = index;
    }
    if let Some(address) = cli.pigpio {
        config.actuator.backend = ActuatorBackend::Pigpio;
        config.actuator.address = address;
    }

    tracing::info!(
        "wand_caster {} starting: {}ms epochs, {:?} actuator",
        env!("CARGO_PKG_VERSION"),
        config.session.epoch_ms,
        config.actuator.backend
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to start timer runtime")?;
    let shutdown = Shutdown::default();
    {
        let shutdown = shutdown.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, stopping");
                shutdown.trigger();
            }
        });
    }

    let dispatcher = ActionDispatcher::from_config(&config.actuator)?;
    let epoch = EpochTimer::new(runtime.handle().clone());
    let (sink, viewer): (Box<dyn RenderSink>, _) = if cli.headless {
        (Box::new(HeadlessSink::default()), None)
    } else {
        let (sink, rx) = app::channel();
        (Box::new(sink), Some(rx))
    };

    let scan = {
        let config = config.clone();
        let shutdown = shutdown.clone();
        let replay = cli.replay;
        std::thread::Builder::new()
            .name("scan".into())
            .spawn(move || -> anyhow::Result<SessionOutcome> {
                // The camera handle stays on this thread for its whole life.
                let source: Box<dyn FrameSource> = match replay {
                    Some(dir) => Box::new(ImageSequenceSource::open(
                        &dir,
                        Some(config.camera.fps),
                        config.camera.mirror,
                    )?),
                    None => Box::new(CameraSource::open(&config.camera)?),
                };
                let mut session =
                    SceneSession::new(&config, source, sink, dispatcher, Box::new(epoch), shutdown);
                Ok(session.run())
            })
            .context("Failed to spawn scan thread")?
    };

    let viewed = match viewer {
        Some(rx) => {
            let size = [config.camera.width as f32, config.camera.height as f32];
            let result = app::run_viewer(&config.session.window_title, size, rx, shutdown.clone());
            shutdown.trigger();
            result
        }
        None => Ok(()),
    };

    let outcome = scan.join().map_err(|_| anyhow!("scan thread panicked"))??;
    viewed?;

    match outcome {
        SessionOutcome::Faulted(fault) => {
            tracing::error!("scan stopped on tracking fault: {}", fault);
            Ok(ExitCode::FAILURE)
        }
        other => {
            tracing::info!("scan finished: {:?}", other);
            Ok(ExitCode::SUCCESS)
        }
    }
}
