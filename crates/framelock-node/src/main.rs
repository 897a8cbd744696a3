//! Framelock Node - runs one process of a synchronized session.
//!
//! Started without `--server` the node is the master: it reads the session
//! file, launches the slaves listed there and drives the frame loop. The
//! slaves are this same binary, started with `--server` and `--process`.

mod demo;

use anyhow::{bail, Context, Result};
use clap::Parser;
use demo::{decode_events, encode, DemoSlave, FrameTick, SceneInfo};
use framelock_core::{
    ClipPlanes, FrameState, LaunchOptions, LogLevel, MasterSession, Roster, ServerAddress,
    SessionConfig, SlaveMode, SlaveSession, Timeout,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "framelock-node")]
#[command(about = "Frame-synchronized master/slave node")]
struct Args {
    /// Server to connect to as a slave (e.g. `tcp,host,port`, `shmem,key`)
    #[arg(long)]
    server: Option<ServerAddress>,

    /// Index of this process in the session (0 = master)
    #[arg(long, default_value = "0")]
    process: usize,

    /// IPC timeout in milliseconds (-1 = wait forever)
    #[arg(long, allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Log level: fatal, warning, info, debug or firehose
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    log_level: LogLevel,

    /// Session file describing all processes
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames the master renders
    #[arg(long, default_value = "100")]
    frames: u64,

    /// Target frame time in milliseconds
    #[arg(long, default_value = "16")]
    frame_ms: u64,

    /// Scene name handed to the slaves
    #[arg(long, default_value = "demo")]
    scene: String,

    /// Slaves report an event every this many frames (0 = never)
    #[arg(long, default_value = "10")]
    event_interval: u64,
}

fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    s.parse::<LogLevel>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(args.log_level.tracing_level())
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.server.clone() {
        Some(server) => run_slave(&args, server).await,
        None => run_master(&args).await,
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading session file {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(ms) = args.timeout {
        config.timeout_ms = Timeout::from_millis(ms);
    }
    Ok(config)
}

async fn run_master(args: &Args) -> Result<()> {
    if args.process != 0 {
        bail!("process {} needs --server to connect to", args.process);
    }
    let config = load_config(args)?;
    info!(
        "Starting master with {} slave processes",
        config.process_count().saturating_sub(1)
    );

    let mut master = MasterSession::start(config).await?;
    if let Some(name) = master.server_name() {
        info!("Slaves connect to {}", name);
        let mut options = LaunchOptions::current_exe(name)?;
        options.timeout = master.timeout();
        options.log_level = args.log_level;
        options.config_path = match &args.config {
            Some(path) => Some(std::fs::canonicalize(path)?),
            None => None,
        };
        options.app_args = vec![format!("--scene={}", args.scene)];
        master.launch_slaves(&options)?;
    }

    let scene = SceneInfo {
        name: args.scene.clone(),
        event_interval: args.event_interval,
    };
    master.connect_slaves(&encode(&scene)?).await?;

    for reply in master.update_devices().await? {
        debug!(
            "Slave {} owns {} devices",
            reply.process_index, reply.batch.count
        );
    }

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.frame_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    for frame in 1..=args.frames {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Shutdown signal received, stopping after frame {}", frame - 1);
                break;
            }
        }

        let tick = FrameTick {
            frame,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let state = FrameState {
            clip: ClipPlanes::new(0.1, 1000.0),
            dynamic_data: encode(&tick)?,
            ..FrameState::default()
        };
        let report = master.run_frame(&state, async { Ok(()) }).await?;
        if !report.lagging.is_empty() {
            debug!("Frame {}: slaves {:?} lagging", report.frame, report.lagging);
        }

        while let Some(batch) = master.next_event() {
            for event in decode_events(&batch.batch)? {
                info!(
                    "Event from slave {} at frame {} (master frame {})",
                    event.process, event.frame, frame
                );
            }
        }
    }

    info!(
        "Rendered {} frames in {:.1}s",
        args.frames,
        started.elapsed().as_secs_f64()
    );
    if let Err(e) = master.shutdown().await {
        warn!("Shutdown incomplete: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run_slave(args: &Args, server: ServerAddress) -> Result<()> {
    if args.process == 0 {
        bail!("--server needs --process with a slave index");
    }
    let timeout = Timeout::from_millis(args.timeout.unwrap_or(-1));
    // Shared memory layout follows the session roster; sockets ignore it.
    let roster = match &args.config {
        Some(path) => Roster::from_config(
            &SessionConfig::load(path)
                .with_context(|| format!("loading session file {}", path.display()))?,
        ),
        None => Roster::new(vec![SlaveMode::Coupled; args.process]),
    };

    let session = SlaveSession::connect(
        &server,
        &roster,
        args.process,
        timeout,
        DemoSlave::new(args.process),
    )
    .await?;
    let slave = session.run().await?;
    debug!("Slave {} last tick: {:?}", args.process, slave.last_tick());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_command_line_parses() {
        let args = Args::try_parse_from([
            "framelock-node",
            "--server=tcp,head-node,4711",
            "--process=2",
            "--timeout=-1",
            "--log-level=debug",
            "--scene=lab",
        ])
        .unwrap();
        assert_eq!(
            args.server,
            Some(ServerAddress::Tcp {
                host: "head-node".to_string(),
                port: 4711
            })
        );
        assert_eq!(args.process, 2);
        assert_eq!(args.timeout, Some(-1));
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.scene, "lab");
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        assert!(Args::try_parse_from(["framelock-node", "--log-level=loud"]).is_err());
    }
}
