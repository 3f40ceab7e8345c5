use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    connection::ConnectionState, settings::ControllerSettings, state::ScanPhase, ControllerClient,
    ControllerEvent,
};
use shared::{
    domain::SourceId,
    scan::{builtin_presets, find_preset, OperationMode, ScanConfig},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scanlink", about = "Drive camera sources and the scanning platform")]
struct Cli {
    /// Settings file. Without it `scanlink.toml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the server url from settings, e.g. ws://127.0.0.1:8765/ws
    #[arg(long)]
    server_url: Option<String>,
    /// Seconds to wait for the device to answer.
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List camera sources and their status.
    List,
    Start { source_id: String },
    Stop { source_id: String },
    /// Show a source's pipeline config, optionally merging a JSON patch first.
    Config {
        source_id: String,
        #[arg(long)]
        set: Option<String>,
    },
    Health { source_id: String },
    Metrics { source_id: String },
    /// Platform pose, remote task and system status.
    Status,
    /// Move the platform. Absolute and relative moves may be combined.
    Move {
        #[arg(long)]
        rotation: Option<f64>,
        #[arg(long)]
        tilt: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        rotate_by: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        tilt_by: Option<f64>,
    },
    /// Return the platform to rotation 0, tilt 0.
    Reset,
    /// Run a scan task until it completes or Ctrl-C stops it.
    Scan(ScanArgs),
    /// Print the built-in scan presets.
    Presets,
    /// Print controller events until Ctrl-C.
    Watch,
}

#[derive(clap::Args, Debug, Default)]
struct ScanArgs {
    /// Start from a built-in preset; explicit flags override its values.
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    vertical_angles: Option<u32>,
    #[arg(long)]
    horizontal_step: Option<u32>,
    /// Seconds to wait at each position.
    #[arg(long)]
    movement_delay: Option<f64>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    Sequential,
    Alternate,
}

impl From<ModeArg> for OperationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => OperationMode::Sequential,
            ModeArg::Alternate => OperationMode::Alternate,
        }
    }
}

impl ScanArgs {
    fn to_config(&self) -> Result<ScanConfig> {
        let mut config = match &self.preset {
            Some(id) => find_preset(id)
                .map(|preset| preset.config)
                .ok_or_else(|| anyhow!("unknown preset `{id}`"))?,
            None => ScanConfig::default(),
        };
        if let Some(v) = self.vertical_angles {
            config.vertical_angles = v;
        }
        if let Some(v) = self.horizontal_step {
            config.horizontal_step = v;
        }
        if let Some(v) = self.movement_delay {
            config.movement_delay = v;
        }
        if let Some(v) = self.mode {
            config.operation_mode = v.into();
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_settings(cli: &Cli) -> Result<ControllerSettings> {
    let mut settings = match &cli.config {
        Some(path) => ControllerSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ControllerSettings::load().context("loading settings")?,
    };
    if let Some(url) = &cli.server_url {
        settings.server_url = url.clone();
    }
    // Each subcommand issues exactly the requests it needs.
    settings.refresh_on_open = false;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Presets = cli.command {
        print_presets();
        return Ok(());
    }

    let settings = load_settings(&cli)?;
    let wait = Duration::from_secs(cli.wait_secs);
    let client = ControllerClient::connect(settings)?;
    let mut events = client.subscribe_events();

    let result = run(&cli.command, &client, &mut events, wait).await;
    client.shutdown().await;
    result
}

async fn run(
    command: &Command,
    client: &ControllerClient,
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
) -> Result<()> {
    if let Command::Watch = command {
        return watch(client, events).await;
    }

    await_connected(client, events, wait)
        .await
        .context("device unreachable")?;

    match command {
        Command::List => {
            client.list_sources()?;
            let event = next_event(events, wait, |event| {
                matches!(event, ControllerEvent::SourcesUpdated(_))
            })
            .await?;
            if let ControllerEvent::SourcesUpdated(sources) = event {
                for source in sources {
                    println!("{}\t{:?}\tclients={}", source.id, source.status, source.client_count);
                }
            }
        }
        Command::Start { source_id } => {
            let id = select(client, events, wait, source_id).await?;
            client.start_source(id)?;
            await_success(events, wait, "start").await?;
            println!("{source_id} started");
        }
        Command::Stop { source_id } => {
            let id = select(client, events, wait, source_id).await?;
            client.stop_source(id)?;
            await_success(events, wait, "stop").await?;
            println!("{source_id} stopped");
        }
        Command::Config { source_id, set } => {
            let id = select(client, events, wait, source_id).await?;
            if let Some(patch) = set {
                let patch: serde_json::Value =
                    serde_json::from_str(patch).context("--set expects a JSON object")?;
                client.update_config(id.clone(), patch)?;
                await_success(events, wait, "update_config").await?;
                client.get_config(id)?;
                next_event(events, wait, |event| {
                    matches!(event, ControllerEvent::ConfigReceived { .. })
                })
                .await?;
            }
            let config = client.state().read().await.selected.config.clone();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Health { source_id } => {
            let id = select(client, events, wait, source_id).await?;
            client.get_health(id)?;
            let event = next_outcome(events, wait, |event| {
                matches!(event, ControllerEvent::HealthReceived(_))
            })
            .await?;
            if let ControllerEvent::HealthReceived(health) = event {
                println!("{}", serde_json::to_string_pretty(&health)?);
            }
        }
        Command::Metrics { source_id } => {
            let id = select(client, events, wait, source_id).await?;
            client.get_metrics(id)?;
            let event = next_outcome(events, wait, |event| {
                matches!(event, ControllerEvent::MetricsReceived(_))
            })
            .await?;
            if let ControllerEvent::MetricsReceived(metrics) = event {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            }
        }
        Command::Status => {
            client.request_status()?;
            // The whole status reply is applied before its first event goes out.
            next_event(events, wait, |event| {
                matches!(
                    event,
                    ControllerEvent::PlatformChanged { .. }
                        | ControllerEvent::RemoteTaskChanged { .. }
                        | ControllerEvent::SystemStatusChanged(_)
                )
            })
            .await?;
            let state = client.state();
            let state = state.read().await;
            println!("rotation\t{:.1}", state.pose.rotation);
            println!("tilt\t{:.1}", state.pose.tilt);
            println!(
                "task\t{} ({}%)",
                if state.remote_task.running { "running" } else { "idle" },
                state.remote_task.progress
            );
            println!("system\t{}", state.system_status.as_deref().unwrap_or("unknown"));
        }
        Command::Move {
            rotation,
            tilt,
            rotate_by,
            tilt_by,
        } => {
            let mut moves = 0;
            if let Some(angle) = rotation {
                client.move_platform(*angle).await?;
                moves += 1;
            }
            if let Some(angle) = tilt {
                client.move_tilt(*angle).await?;
                moves += 1;
            }
            if let Some(delta) = rotate_by {
                client.rotate_by(*delta).await?;
                moves += 1;
            }
            if let Some(delta) = tilt_by {
                client.tilt_by(*delta).await?;
                moves += 1;
            }
            if moves == 0 {
                bail!("nothing to move; pass --rotation, --tilt, --rotate-by or --tilt-by");
            }
            await_moves(events, wait, moves).await?;
            let pose = client.state().read().await.pose;
            println!("rotation={:.1} tilt={:.1}", pose.rotation, pose.tilt);
        }
        Command::Reset => {
            client.reset_position().await?;
            // The local pose event, then one per move reply.
            await_moves(events, wait, 3).await?;
            println!("platform reset");
        }
        Command::Scan(args) => {
            scan(client, events, args.to_config()?).await?;
            await_remote_idle(client, wait).await?;
        }
        Command::Presets | Command::Watch => {}
    }
    Ok(())
}

/// The session may open before `events` subscribed. Connection state is
/// published before the `Connected` event, so checking it after subscribing
/// cannot miss both.
async fn await_connected(
    client: &ControllerClient,
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
) -> Result<()> {
    if client.state().read().await.connection == ConnectionState::Open {
        return Ok(());
    }
    next_event(events, wait, |event| matches!(event, ControllerEvent::Connected))
        .await
        .map(|_| ())
}

async fn select(
    client: &ControllerClient,
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
    source_id: &str,
) -> Result<SourceId> {
    let id = SourceId::new(source_id);
    client.select_source(Some(id.clone()))?;
    next_outcome(events, wait, |event| {
        matches!(event, ControllerEvent::ConfigReceived { .. })
    })
    .await
    .with_context(|| format!("selecting {source_id}"))?;
    Ok(id)
}

async fn await_success(
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
    action: &str,
) -> Result<()> {
    next_outcome(events, wait, |event| {
        matches!(event, ControllerEvent::CommandSucceeded { action: done, .. } if done == action)
    })
    .await
    .map(|_| ())
}

async fn await_moves(
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
    count: usize,
) -> Result<()> {
    for _ in 0..count {
        next_outcome(events, wait, |event| {
            matches!(event, ControllerEvent::PlatformChanged { .. })
        })
        .await?;
    }
    Ok(())
}

/// Moves queued by the scan loop may still be in flight once it finishes.
async fn await_remote_idle(client: &ControllerClient, wait: Duration) -> Result<()> {
    let state = client.state();
    tokio::time::timeout(wait, async {
        while state.read().await.remote_task.running {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("device still reports a running task after {}s", wait.as_secs()))
}

async fn scan(
    client: &ControllerClient,
    events: &mut broadcast::Receiver<ControllerEvent>,
    config: ScanConfig,
) -> Result<()> {
    let total = client.start_scan(config).await?;
    println!("scan started: {total} positions");

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ControllerEvent::ScanStep { position, total, progress_pct }) => {
                    println!(
                        "{:>3}%  rotation={:>5.1} tilt={:>4.1}  ({}/{total})",
                        progress_pct,
                        position.rotation,
                        position.tilt,
                        position.index
                    );
                }
                Ok(ControllerEvent::ScanStateChanged { phase: phase @ (ScanPhase::Completed | ScanPhase::Stopped), progress_pct }) => {
                    println!("scan {phase:?} at {progress_pct}%");
                    return Ok(());
                }
                Ok(ControllerEvent::Disconnected { reason, .. }) => {
                    tracing::warn!(%reason, "connection lost during scan");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("controller shut down"),
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                client.stop_scan().await?;
                println!("stopping scan");
            }
        }
    }
}

async fn watch(
    client: &ControllerClient,
    events: &mut broadcast::Receiver<ControllerEvent>,
) -> Result<()> {
    client.list_sources()?;
    client.request_status()?;
    let mut stream = BroadcastStream::new(events.resubscribe());
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => println!("{event:?}"),
                Some(Err(err)) => tracing::warn!(%err, "event stream lagged"),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Waits for the first event matching `want`.
async fn next_event(
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
    want: impl Fn(&ControllerEvent) -> bool,
) -> Result<ControllerEvent> {
    tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => bail!("controller shut down"),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no answer within {}s", wait.as_secs()))?
}

/// Like [`next_event`], but a command failure or a lost command ends the wait
/// with an error.
async fn next_outcome(
    events: &mut broadcast::Receiver<ControllerEvent>,
    wait: Duration,
    want: impl Fn(&ControllerEvent) -> bool,
) -> Result<ControllerEvent> {
    let event = next_event(events, wait, |event| {
        want(event)
            || matches!(
                event,
                ControllerEvent::CommandFailed(_)
                    | ControllerEvent::CommandLost { .. }
                    | ControllerEvent::CommandTimedOut { .. }
            )
    })
    .await?;
    match event {
        ControllerEvent::CommandFailed(failure) => Err(failure.into()),
        ControllerEvent::CommandLost { action, .. } => bail!("{action} lost: connection dropped"),
        ControllerEvent::CommandTimedOut { action, .. } => bail!("{action} timed out"),
        event => Ok(event),
    }
}

fn print_presets() {
    for preset in builtin_presets() {
        let config = preset.config;
        println!(
            "{:<24} {:>2} levels, {:>2}° steps, {:.1}s delay, {:?}  {}",
            preset.id,
            config.vertical_angles,
            config.horizontal_step,
            config.movement_delay,
            config.operation_mode,
            preset.description
        );
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
