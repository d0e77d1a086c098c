//! Room server entrypoint.

mod command_parser;
mod hub;
mod session;
mod shutdown;
mod startup;

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use shutdown::{log_shutdown_stage, ShutdownReason};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "room-server", version, about = "Room Simulation Kernel server")]
struct Args {
    /// Optional configuration file path (defaults to `room-server.toml` in the cwd).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Directory holding bundled default-layout JSON files (`{room_id}.json`).
    #[arg(long = "rooms-dir", default_value = "rooms")]
    pub rooms_dir: PathBuf,
    /// TCP address to listen on.
    #[arg(long = "listen", default_value = "127.0.0.1:7878")]
    pub listen: String,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn run(&mut self) -> Result<Args> {
        self.configure_logging()?;
        Self::install_panic_hook();
        info!(target: "room.server", "startup");
        let args = Args::parse();
        Ok(args)
    }

    fn configure_logging(&mut self) -> Result<()> {
        let log_dir = Path::new(".");
        let log_path = log_dir.join("room-server.log");
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }

        let file_appender = tracing_appender::rolling::never(log_dir, "room-server.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => self.log_guard = Some(guard),
            Err(_err) => {
                // Global subscriber already installed (e.g. under a test harness); drop the guard.
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "room.server.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut app = AppStartup::new();
    let args = app.run()?;

    let bootstrap = match startup::bootstrap(&args).await {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            error!(target: "room.server", error = %e, "fatal startup failure");
            std::process::exit(1);
        }
    };
    let tick_interval = bootstrap.tick_interval;
    let dt = tick_interval.as_secs_f64();
    let config = std::sync::Arc::new(bootstrap.config);

    let listener = TcpListener::bind(&args.listen).await?;
    info!(target: "room.server", addr = %args.listen, "listening");

    let hub = hub::SessionHub::new();
    let world = std::sync::Arc::new(tokio::sync::Mutex::new(bootstrap.world));
    let hub = std::sync::Arc::new(hub);

    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel::<WorldTick>(1);
    let mut tick_sources = room_events::EventSourceRegistry::new();
    tick_sources.register(room_events::TickEventSource::new(tick_interval, || WorldTick));
    let mut tick_source_handles = tick_sources.spawn_all(&tick_tx);

    let ticker_world = world.clone();
    let ticker_hub = hub.clone();
    let ticker = tokio::spawn(async move {
        while tick_rx.recv().await.is_some() {
            let routed = {
                let mut guard = ticker_world.lock().await;
                guard.tick_all(dt).await
            };
            ticker_hub.deliver(routed).await;
        }
    });

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::CtrlC,
        result = accept_loop(listener, world.clone(), hub.clone(), config.clone()) => {
            if let Err(e) = result {
                error!(target: "room.server", error = %e, "accept loop failed");
            }
            ShutdownReason::ListenerClosed
        }
    };

    log_shutdown_stage(reason, "begin");
    drop(tick_tx);
    for handle in tick_source_handles.drain(..) {
        handle.abort();
    }
    ticker.abort();
    log_shutdown_stage(reason, "complete");
    Ok(())
}

/// Marker event for the world-tick channel: carries no payload, the tick
/// driver only cares that an interval elapsed.
struct WorldTick;

async fn accept_loop(
    listener: TcpListener,
    world: std::sync::Arc<tokio::sync::Mutex<room_world::WorldDirector>>,
    hub: std::sync::Arc<hub::SessionHub>,
    config: std::sync::Arc<room_config::Config>,
) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!(target: "room.server", %peer, "connection accepted");
        let world = world.clone();
        let hub = hub.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = session::handle_connection(socket, world, hub, config).await {
                error!(target: "room.server.session", %peer, error = %e, "session ended with error");
            }
        });
    }
}
