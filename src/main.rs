use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtc_session::media::loopback::LoopbackFactory;
use rtc_session::signaling::{MemoryHub, SignalingReceiver};
use rtc_session::stream::RemoteStream;
use rtc_session::{
    ChannelConfig, LocalStream, MediaFactory, MediaStream, P2PChannelObserver, PeerClient,
    StreamSource,
};

/// Log level for the demo
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Runs a P2P session between two in-process peers over the loopback engine
#[derive(Parser, Debug)]
#[command(name = "rtc-session")]
#[command(version, about = "Two-peer session demo on the loopback media engine", long_about = None)]
struct CliArgs {
    /// Id of the inviting peer
    #[arg(long, default_value = "alice")]
    local_id: String,

    /// Id of the invited peer
    #[arg(long, default_value = "bob")]
    remote_id: String,

    /// Channel configuration file (JSON)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Publish a camera stream once the session is up
    #[arg(long)]
    publish: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug)]
enum DemoEvent {
    Invited { by: String },
    Started { peer: String },
    StreamAdded { peer: String, stream_id: String },
    Data { from: String, message: String },
    Stopped { peer: String },
}

/// Forwards session events of one peer to the demo loop
struct Forwarder {
    name: String,
    tx: mpsc::UnboundedSender<DemoEvent>,
}

impl P2PChannelObserver for Forwarder {
    fn on_invited(&self, remote_id: &str) {
        let _ = self.tx.send(DemoEvent::Invited {
            by: remote_id.to_string(),
        });
    }

    fn on_started(&self, _remote_id: &str) {
        let _ = self.tx.send(DemoEvent::Started {
            peer: self.name.clone(),
        });
    }

    fn on_stream_added(&self, stream: &RemoteStream) {
        let _ = self.tx.send(DemoEvent::StreamAdded {
            peer: self.name.clone(),
            stream_id: stream.id().to_string(),
        });
    }

    fn on_data(&self, remote_id: &str, message: &str) {
        let _ = self.tx.send(DemoEvent::Data {
            from: remote_id.to_string(),
            message: message.to_string(),
        });
    }

    fn on_stopped(&self, _remote_id: &str) {
        let _ = self.tx.send(DemoEvent::Stopped {
            peer: self.name.clone(),
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rtc-session demo v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => ChannelConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ChannelConfig::default(),
    };

    let hub = MemoryHub::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let caller = spawn_peer(&hub, &args.local_id, &config, tx.clone())?;
    let callee = spawn_peer(&hub, &args.remote_id, &config, tx)?;

    caller.invite(&args.remote_id).await?;

    let mut started = 0;
    let mut stopped = 0;
    let mut stream_seen = !args.publish;
    let mut message_seen = false;
    let mut stopping = false;
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            event = rx.recv() => event.context("event stream closed")?,
            _ = &mut deadline => anyhow::bail!("session did not complete in time"),
        };
        tracing::debug!("Demo event: {:?}", event);

        match event {
            DemoEvent::Invited { by } => {
                tracing::info!("{} invited {}, accepting", by, args.remote_id);
                callee.accept(&by).await?;
            }
            DemoEvent::Started { peer } => {
                tracing::info!("{} is connected", peer);
                started += 1;
                if started == 2 {
                    if args.publish {
                        let camera = LocalStream::new(
                            MediaStream::audio_video(format!("{}-camera", args.local_id)),
                            StreamSource::Camera,
                        );
                        caller.publish(&args.remote_id, camera).await?;
                    }
                    caller
                        .send(&args.remote_id, format!("hello from {}", args.local_id))
                        .await?;
                }
            }
            DemoEvent::StreamAdded { peer, stream_id } => {
                tracing::info!("{} receives stream {}", peer, stream_id);
                stream_seen = true;
            }
            DemoEvent::Data { from, message } => {
                tracing::info!("Message from {}: {}", from, message);
                message_seen = true;
            }
            DemoEvent::Stopped { peer } => {
                tracing::info!("{} stopped", peer);
                stopped += 1;
                if stopped == 2 {
                    break;
                }
            }
        }

        if stream_seen && message_seen && !stopping {
            stopping = true;
            if args.publish {
                let stats = caller.get_connection_stats(&args.remote_id).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            caller.stop(&args.remote_id).await?;
        }
    }

    tracing::info!("Demo finished");
    Ok(())
}

fn spawn_peer(
    hub: &Arc<MemoryHub>,
    id: &str,
    config: &ChannelConfig,
    tx: mpsc::UnboundedSender<DemoEvent>,
) -> anyhow::Result<Arc<PeerClient>> {
    let factory = Arc::new(MediaFactory::new(Arc::new(LoopbackFactory::new())));
    factory.init()?;
    let client = PeerClient::new(id, config.clone(), factory, hub.sender(id));
    let receiver: Arc<dyn SignalingReceiver> = client.clone();
    hub.register(id, Arc::downgrade(&receiver));
    client.add_observer(Arc::new(Forwarder {
        name: id.to_string(),
        tx,
    }));
    Ok(client)
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtc_session=error",
        LogLevel::Warn => "rtc_session=warn",
        LogLevel::Info => "rtc_session=info",
        LogLevel::Verbose => "rtc_session=debug",
        LogLevel::Debug => "rtc_session=debug,rtc_session::media=trace",
        LogLevel::Trace => "rtc_session=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
