//! Peercall CLI application

use anyhow::Result;
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

type Mesh = QuicMeshTransport<PeerIdentityString>;
type Service = CallService<Mesh>;
type Event = CallEvent<PeerIdentityString>;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Four-word identity (e.g., "alice-bob-charlie-david")
    #[arg(short, long, env = "PEERCALL_IDENTITY")]
    identity: Option<String>,

    /// Local mesh endpoint to bind (OS-assigned port when omitted)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Mesh peers to join at startup
    #[arg(long)]
    join: Vec<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initiate a call
    Call {
        /// Peer to call (four-word address)
        peer: String,

        /// Conversation topic shared with the peer
        #[arg(long, default_value = "lobby")]
        conversation: String,

        /// Leave the camera off
        #[arg(long)]
        no_video: bool,

        /// Leave the microphone off
        #[arg(long)]
        no_audio: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Conversation topic to watch
        #[arg(long, default_value = "lobby")]
        conversation: String,

        /// Auto-accept incoming calls
        #[arg(long)]
        auto_accept: bool,
    },

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("peercall=info")
        .init();

    let cli = Cli::parse();

    let identity = cli.identity.unwrap_or_else(generate_random_identity);
    println!("🔗 Using identity: {identity}");

    match cli.command {
        Commands::Call {
            peer,
            conversation,
            no_video,
            no_audio,
        } => {
            handle_call(
                &identity,
                &peer,
                &conversation,
                !no_video,
                !no_audio,
                cli.bind,
                &cli.join,
            )
            .await?;
        }
        Commands::Listen {
            conversation,
            auto_accept,
        } => {
            handle_listen(&identity, &conversation, auto_accept, cli.bind, &cli.join).await?;
        }
        Commands::Status => {
            handle_status(cli.bind, &cli.join).await?;
        }
    }

    Ok(())
}

async fn build_service(
    identity: &str,
    bind: Option<SocketAddr>,
    join: &[SocketAddr],
) -> Result<Service> {
    let mesh = Arc::new(
        Mesh::bind(MeshConfig {
            bind_addr: bind,
            ..MeshConfig::default()
        })
        .await?,
    );
    println!("📡 Mesh endpoint: {}", mesh.local_addr()?);

    for addr in join {
        mesh.join_peer(*addr).await?;
        println!("🤝 Joined mesh peer at {addr}");
    }

    let service = CallService::builder(mesh, PeerIdentityString::new(identity))
        .with_backend(Arc::new(WebRtcBackend::new()))
        .build();
    println!("✅ Call service started");
    Ok(service)
}

async fn handle_call(
    identity: &str,
    peer: &str,
    conversation: &str,
    video: bool,
    audio: bool,
    bind: Option<SocketAddr>,
    join: &[SocketAddr],
) -> Result<()> {
    println!("📞 Calling {peer}...");
    println!("   Video: {video} | Audio: {audio} | Conversation: {conversation}");

    let service = build_service(identity, bind, join).await?;
    let conversation = ConversationId::new(conversation);

    let constraints = MediaConstraints {
        audio,
        video,
        screen_share: false,
    };

    let mut events = service.subscribe_events();
    let call_id = service
        .start_call(
            &conversation,
            PeerIdentityString::new(peer),
            Some(constraints),
        )
        .await?;
    println!("📞 Call {call_id} ringing...");

    run_call_loop(&service, &conversation, &mut events).await?;

    println!("📞 Call ended");
    service.shutdown().await;
    Ok(())
}

async fn handle_listen(
    identity: &str,
    conversation: &str,
    auto_accept: bool,
    bind: Option<SocketAddr>,
    join: &[SocketAddr],
) -> Result<()> {
    println!("👂 Listening for calls on '{conversation}'...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }

    let service = build_service(identity, bind, join).await?;
    let conversation = ConversationId::new(conversation);

    let mut events = service.subscribe_events();
    service.watch_conversation(&conversation).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::IncomingCall { from, .. }) => {
                    println!("📞 Incoming call from {from}");

                    let accept = auto_accept || prompt_accept().await?;
                    if accept {
                        println!("✅ Accepting call...");
                        service.accept_call(&conversation).await?;
                        run_call_loop(&service, &conversation, &mut events).await?;
                        println!("📞 Call ended, listening again...");
                    } else {
                        println!("❌ Rejecting call...");
                        service.reject_call(&conversation).await?;
                    }
                }
                Ok(event) => {
                    print_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn handle_status(bind: Option<SocketAddr>, join: &[SocketAddr]) -> Result<()> {
    println!("📊 Peercall Status");
    println!("==================");

    let mesh = Mesh::bind(MeshConfig {
        bind_addr: bind,
        ..MeshConfig::default()
    })
    .await?;
    println!("✅ Mesh endpoint: {}", mesh.local_addr()?);

    for addr in join {
        match mesh.join_peer(*addr).await {
            Ok(_) => println!("✅ Mesh peer reachable at {addr}"),
            Err(e) => println!("❌ Mesh peer unreachable at {addr}: {e}"),
        }
    }
    println!("✅ Signaling: ready");
    println!("✅ Negotiation driver: webrtc");
    println!();
    println!("Available commands:");
    println!("  peercall call <peer> [options]  - Initiate a call");
    println!("  peercall listen [options]       - Wait for calls");
    println!("  peercall status                 - Show this status");
    println!();
    println!("Use 'peercall --help' for detailed options");

    mesh.shutdown()?;
    Ok(())
}

/// Drive one call to completion, reacting to events and keyboard commands
async fn run_call_loop(
    service: &Service,
    conversation: &ConversationId,
    events: &mut broadcast::Receiver<Event>,
) -> Result<()> {
    println!("   Commands: m = toggle mute, c = switch camera, h = hang up");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::CallEnded { .. }) => break,
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                match line?.as_deref().map(str::trim) {
                    Some("m") => match service.toggle_mute(conversation).await {
                        Ok(true) => println!("🔇 Muted"),
                        Ok(false) => println!("🎤 Unmuted"),
                        Err(e) => println!("⚠️  {e}"),
                    },
                    Some("c") => match service.switch_camera(conversation).await {
                        Ok(device) => println!("📷 Switched to {device}"),
                        Err(e) => println!("⚠️  {e}"),
                    },
                    Some("h") | None => {
                        service.hang_up(conversation).await?;
                        break;
                    }
                    Some(_) => {
                        println!("   Commands: m = toggle mute, c = switch camera, h = hang up");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                service.hang_up(conversation).await?;
                break;
            }
        }
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::IncomingCall { from, .. } => println!("📞 Incoming call from {from}"),
        Event::OutgoingCall { to, .. } => println!("📞 Calling {to}..."),
        Event::RingReceived { from, .. } => println!("🔔 Ringing at {from}"),
        Event::PhaseChanged { phase, .. } => {
            if *phase == CallPhase::InCall {
                println!("✅ Connected, media flowing");
            } else {
                tracing::debug!(%phase, "Phase changed");
            }
        }
        Event::RemoteTrackAdded { media_type, .. } => {
            println!("🎬 Remote {media_type} track added");
        }
        Event::RemoteHangup { reason, .. } => println!("👋 Peer hung up ({reason})"),
        Event::CallEnded { .. } => println!("📞 Call ended"),
        Event::ConnectionFailed { error, .. } => println!("❌ Connection failed: {error}"),
        Event::MediaWarning { detail, .. } => println!("⚠️  {detail}"),
        Event::MuteChanged { muted, .. } => {
            println!("{}", if *muted { "🔇 Muted" } else { "🎤 Unmuted" });
        }
        Event::CameraSwitched { device_id, .. } => println!("📷 Switched to {device_id}"),
    }
}

async fn prompt_accept() -> Result<bool> {
    println!("   Accept? [y/n]");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    Ok(matches!(
        lines.next_line().await?.as_deref().map(str::trim),
        Some("y" | "Y" | "yes")
    ))
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu", "anchor", "breeze",
        "cedar", "dune", "ember", "fjord", "grove", "harbor", "inlet", "juniper", "kestrel",
        "lagoon", "meadow", "north", "osprey", "pebble", "quarry", "reef", "summit", "thistle",
        "umber", "willow",
    ];

    let mut rng = rand::thread_rng();
    let indices: Vec<usize> = (0..4).map(|_| rng.gen_range(0..WORDS.len())).collect();

    format!(
        "{}-{}-{}-{}",
        WORDS[indices[0]], WORDS[indices[1]], WORDS[indices[2]], WORDS[indices[3]]
    )
}
