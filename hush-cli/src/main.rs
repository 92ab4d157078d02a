use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hush_core::{
    unix_millis, ConfessionPayload, ContentId, EventPayload, Identity, LiveEvent, VoteDirection,
};
use hush_sync::{
    ConnectionState, PushRelay, ReconnectPolicy, RelayConfig, StoreConfig, Subscriber,
    SyncConfig, SyncContext, TransportConfig, VoteWriter, WriteError,
};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "hush: live push sync for anonymous confessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a push endpoint and print incoming events.
    Listen {
        /// Push endpoint base URL.
        #[arg(long, default_value = "ws://127.0.0.1:8000")]
        endpoint: String,

        /// Wallet or account id; anonymous when omitted.
        #[arg(long)]
        identity: Option<String>,

        /// Keep votes, bookmarks and recent events in this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds between reconnection attempts.
        #[arg(long, default_value_t = 5)]
        reconnect_secs: u64,

        /// Back off exponentially up to this many seconds instead.
        #[arg(long)]
        backoff_max_secs: Option<u64>,
    },

    /// Run the reference push relay.
    Relay {
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: String,

        /// Frames buffered per connection.
        #[arg(long, default_value_t = 256)]
        capacity: usize,

        /// Broadcast a sample confession every N seconds.
        #[arg(long)]
        demo_every: Option<u64>,
    },
}

/// Prints each event the way the notification panel shows it.
struct PanelPrinter;

impl Subscriber for PanelPrinter {
    fn on_event(&mut self, event: &LiveEvent) {
        let note = event.notification();
        println!("[{}] {}: {}", event.id, note.title, note.body);
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        println!("-- {state:?}");
    }
}

/// The terminal has no content service; every vote is rolled back.
struct OfflineWriter;

#[async_trait]
impl VoteWriter for OfflineWriter {
    async fn write_vote(
        &self,
        _content_id: &ContentId,
        _direction: VoteDirection,
        _identity: &Identity,
    ) -> Result<(), WriteError> {
        Err(WriteError::Rejected {
            reason: "no content service configured".to_string(),
        })
    }
}

async fn listen(
    endpoint: String,
    identity: Option<String>,
    data_dir: Option<PathBuf>,
    reconnect: ReconnectPolicy,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig {
        transport: TransportConfig {
            endpoint,
            reconnect,
            ..TransportConfig::default()
        },
        storage: data_dir.map(|path| StoreConfig {
            path,
            ..StoreConfig::default()
        }),
        ..SyncConfig::default()
    };
    let ctx = SyncContext::new(config, Arc::new(OfflineWriter))?;

    let recent = ctx.recent_events().await;
    if !recent.is_empty() {
        println!("-- {} recent events", recent.len());
        let mut printer = PanelPrinter;
        for event in &recent {
            printer.on_event(event);
        }
    }
    ctx.subscribe(&[], Box::new(PanelPrinter)).await;

    let identity = Identity::resolve(identity.as_deref(), None);
    info!("Listening as {identity}");
    ctx.start(identity).await;

    tokio::signal::ctrl_c().await?;
    ctx.shutdown().await;
    Ok(())
}

async fn relay(
    bind: String,
    capacity: usize,
    demo_every: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let relay = PushRelay::new(RelayConfig {
        bind_addr: bind,
        broadcast_capacity: capacity,
    });

    if let Some(secs) = demo_every {
        let handle = relay.handle();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            let mut n: u64 = 0;
            loop {
                ticker.tick().await;
                n += 1;
                let payload = EventPayload::ContentCreated(ConfessionPayload {
                    id: format!("demo-{n}"),
                    tx_id: String::new(),
                    content: format!("demo confession #{n}"),
                    author: "relay".to_string(),
                    timestamp: unix_millis().to_string(),
                    upvotes: 0,
                    mood: None,
                    tags: Vec::new(),
                    verified: false,
                    gateway_url: None,
                });
                match handle.broadcast(&payload).await {
                    Ok(receivers) => info!("Demo confession {n} sent to {receivers} clients"),
                    Err(e) => log::error!("Demo broadcast failed: {e}"),
                }
            }
        });
    }

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Relay shutting down"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Listen {
            endpoint,
            identity,
            data_dir,
            reconnect_secs,
            backoff_max_secs,
        } => {
            let reconnect = match backoff_max_secs {
                Some(max) => ReconnectPolicy::Exponential {
                    initial: Duration::from_secs(reconnect_secs),
                    max: Duration::from_secs(max),
                },
                None => ReconnectPolicy::Fixed(Duration::from_secs(reconnect_secs)),
            };
            listen(endpoint, identity, data_dir, reconnect).await
        }
        Commands::Relay {
            bind,
            capacity,
            demo_every,
        } => relay(bind, capacity, demo_every).await,
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
