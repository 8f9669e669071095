use anyhow::{anyhow, bail, Context, Result};
use peerroom::testing::{LoopbackNetwork, SyntheticCapture};
use peerroom::{MemoryRelay, PeerRoomConfig, RoomSession, SessionSnapshot};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: peerroom-cli <demo|config> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "demo" => cmd_demo(&args).await,
        "config" => cmd_config(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

async fn cmd_demo(args: &[String]) -> Result<()> {
    // Parse args: demo [--room <id>] [--json]
    let mut room = "42".to_string();
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--room" => {
                i += 1;
                room = args.get(i).cloned().ok_or_else(|| anyhow!("--room needs a value"))?;
            }
            "--json" => json = true,
            other => bail!("Unknown demo argument: {}", other),
        }
        i += 1;
    }

    let config = PeerRoomConfig::load_or_default();
    peerroom::init_logging_with(&config.logging.filter);

    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = RoomSession::new(
        config.clone(),
        Arc::new(SyntheticCapture::with_default_devices()),
        Arc::new(network.connector("alice")),
        Arc::new(relay.connect("alice")),
    );
    let bob = RoomSession::new(
        config,
        Arc::new(SyntheticCapture::with_default_devices()),
        Arc::new(network.connector("bob")),
        Arc::new(relay.connect("bob")),
    );

    alice.join(&room).await?;
    bob.join(&room).await?;

    let timeout = Duration::from_secs(5);
    let alice_state = wait_connected(alice.subscribe(), timeout)
        .await
        .context("alice did not connect")?;
    let bob_state = wait_connected(bob.subscribe(), timeout)
        .await
        .context("bob did not connect")?;

    report("alice", &alice_state, json)?;
    report("bob", &bob_state, json)?;

    alice.leave().await?;
    bob.leave().await?;
    if !json {
        println!("Both clients left room {}", room);
    }
    Ok(())
}

async fn wait_connected(
    mut state: watch::Receiver<SessionSnapshot>,
    timeout: Duration,
) -> Result<SessionSnapshot> {
    let snapshot = tokio::time::timeout(
        timeout,
        state.wait_for(|s| s.is_connected() && s.has_remote_video()),
    )
    .await
    .context("timed out waiting for the peer connection")?
    .context("session dropped")?;
    Ok(snapshot.clone())
}

fn report(name: &str, snapshot: &SessionSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    let stream_id = |s: Option<&peerroom::MediaStream>| {
        s.map_or_else(|| "-".to_string(), |s| s.id().to_string())
    };
    println!(
        "{}: room={} role={:?} connection={} ice={} big={} small={}",
        name,
        snapshot.room_id.as_deref().unwrap_or("-"),
        snapshot.role,
        snapshot.connection_state,
        snapshot.ice_state,
        stream_id(snapshot.routing.big_stream.as_ref()),
        stream_id(snapshot.routing.small_stream.as_ref()),
    );
    Ok(())
}

fn cmd_config(args: &[String]) -> Result<()> {
    let path = args
        .get(2)
        .map(Into::into)
        .unwrap_or_else(PeerRoomConfig::default_path);

    let config = PeerRoomConfig::load_from_file(&path)?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path.display(), e))?;

    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
