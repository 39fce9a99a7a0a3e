//! Peercall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peercall_core::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Conversation whose call topic is used
    #[arg(short, long, env = "PEERCALL_CONVERSATION", default_value = "demo")]
    conversation: String,

    /// JSON configuration file
    #[arg(long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full call between two in-process participants
    Demo {
        /// Calling participant
        #[arg(long, default_value = "alice")]
        caller: String,

        /// Called participant
        #[arg(long, default_value = "bob")]
        callee: String,

        /// Media transport
        #[arg(long, value_enum, default_value = "memory")]
        transport: TransportKind,

        /// Seconds to wait for each step
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    /// In-process loopback
    Memory,
    /// ICE/DTLS/SRTP over the webrtc crate
    Webrtc,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall_cli=info,peercall_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            transport,
            timeout,
        } => {
            let demo = Demo {
                conversation: ConversationId::new(cli.conversation),
                config,
                transports: transport_factory(transport)?,
                step_timeout: Duration::from_secs(timeout),
            };
            demo.run(&caller, &callee).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

fn transport_factory(kind: TransportKind) -> Result<Arc<dyn TransportFactory>> {
    match kind {
        TransportKind::Memory => Ok(Arc::new(MemoryTransportFactory::new())),
        #[cfg(feature = "webrtc-backend")]
        TransportKind::Webrtc => Ok(Arc::new(WebRtcTransportFactory::new())),
        #[cfg(not(feature = "webrtc-backend"))]
        TransportKind::Webrtc => bail!("built without the webrtc-backend feature"),
    }
}

struct Demo {
    conversation: ConversationId,
    config: CallConfig,
    transports: Arc<dyn TransportFactory>,
    step_timeout: Duration,
}

impl Demo {
    async fn participant(&self, user: &str, hub: &Arc<MemorySignalingHub>) -> Result<CallController> {
        let controller = CallController::builder(
            self.conversation.clone(),
            Arc::new(StaticIdentity::new(user)),
            hub.clone(),
            Arc::new(VirtualMediaDevices::new()),
        )
        .with_config(self.config.clone())
        .with_transports(self.transports.clone())
        .build()
        .await?;
        Ok(controller)
    }

    async fn run(&self, caller_id: &str, callee_id: &str) -> Result<()> {
        if caller_id == callee_id {
            bail!("caller and callee must differ");
        }
        let hub = Arc::new(MemorySignalingHub::new());
        let caller = self.participant(caller_id, &hub).await?;
        let callee = self.participant(callee_id, &hub).await?;
        println!(
            "📡 Conversation {} on topic {}:{}",
            self.conversation, self.config.topic_prefix, self.conversation
        );

        println!("📞 {caller_id} calls {callee_id}");
        caller.start_call(callee_id).await?;
        report(caller_id, &caller.snapshot());

        self.wait(&callee, "ringing", |s| s.is_call_incoming).await?;
        report(callee_id, &callee.snapshot());

        println!("✅ {callee_id} answers");
        callee.answer_call().await?;
        self.wait(&caller, "connected", |s| s.state == CallState::Active)
            .await?;
        self.wait(&caller, "remote media", |s| {
            s.remote_stream.as_ref().is_some_and(|r| r.track_count() > 0)
        })
        .await?;
        report(caller_id, &caller.snapshot());
        report(callee_id, &callee.snapshot());

        println!("🖥️  {caller_id} shares the screen");
        caller.start_screen_share().await?;
        report(caller_id, &caller.snapshot());
        let screen = caller
            .local_stream()
            .and_then(|s| s.video_track())
            .context("no outbound video while sharing")?;
        println!("🛑 Capture stopped from the system tray");
        screen.end();
        self.wait(&caller, "camera restored", |s| !s.is_screen_sharing)
            .await?;
        report(caller_id, &caller.snapshot());

        println!("📴 {callee_id} hangs up");
        callee.end_call().await;
        self.wait(&caller, "remote hang-up", |s| s.state == CallState::Ended)
            .await?;
        report(caller_id, &caller.snapshot());
        report(callee_id, &callee.snapshot());

        let topic = self.conversation.topic(&self.config.topic_prefix);
        let published = hub.published(&topic);
        println!("📨 {} signaling messages:", published.len());
        for message in &published {
            println!(
                "   {:<14} {} -> {}",
                message.event_name(),
                message.sender(),
                message.recipient()
            );
        }

        caller.shutdown().await;
        callee.shutdown().await;
        Ok(())
    }

    async fn wait(
        &self,
        controller: &CallController,
        what: &str,
        condition: impl Fn(&CallSnapshot) -> bool,
    ) -> Result<()> {
        let mut rx = controller.observe();
        let waited = tokio::time::timeout(self.step_timeout, rx.wait_for(|s| condition(s))).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => bail!("{} stopped publishing state", controller.local_user()),
            Err(_) => bail!(
                "timed out waiting for {what} at {}",
                controller.local_user()
            ),
        }
    }
}

fn report(user: &str, snapshot: &CallSnapshot) {
    let count = |s: &Option<MediaStream>| s.as_ref().map_or(0, MediaStream::track_count);
    println!(
        "   [{user}] state={} active={} incoming={} sharing={} local_tracks={} remote_tracks={}{}",
        snapshot.state,
        snapshot.is_call_active,
        snapshot.is_call_incoming,
        snapshot.is_screen_sharing,
        count(&snapshot.local_stream),
        count(&snapshot.remote_stream),
        snapshot
            .last_error
            .as_ref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default()
    );
}
