use std::env;

use anyhow::{Context, Result};
use rover_call::{
    engine::{loopback, LoopbackProvider, NativeProvider},
    signaling,
    util::init_log,
    RemoteDescription, SessionConfig, SessionContext,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    init_log();

    let args: Vec<String> = env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        Some("offer") => match load_config(args.get(2)) {
            Ok(config) => run_native(config, None).await,
            Err(e) => Err(e),
        },
        Some("signal") => match (args.get(2), load_config(args.get(3))) {
            (Some(url), Ok(config)) => run_native(config, Some(url.clone())).await,
            (None, _) => {
                print_usage();
                return;
            }
            (_, Err(e)) => Err(e),
        },
        Some("loopback") => run_loopback().await,
        Some("version") => {
            println!("rover-call {}", rover_call::version());
            Ok(())
        }
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error:\n{:?}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Rover Call {}", rover_call::version());
    println!("Usage:");
    println!("  rover-call offer [config.json]         - Print an offer, read the answer from stdin");
    println!("  rover-call signal <url> [config.json]  - Exchange offer/answer over HTTP");
    println!("  rover-call loopback                    - Run a session against the in-process backend");
    println!("  rover-call version                     - Print the version");
}

fn load_config(path: Option<&String>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::from_file(path).with_context(|| format!("loading {}", path)),
        None => Ok(SessionConfig::with_servers(["stun:stun.l.google.com:19302"])),
    }
}

async fn run_native(config: SessionConfig, signal_url: Option<String>) -> Result<()> {
    let ctx = SessionContext::new(NativeProvider::new());
    let session = ctx.open(config).await?;

    let answer = match signal_url {
        Some(url) => signaling::exchange(&url, session.local_description()).await?,
        None => {
            println!("=== SDP OFFER BEGIN ===");
            println!("{}", session.local_description());
            println!("=== SDP OFFER END ===\n");
            println!("Paste the SDP answer, then an empty line:");
            read_answer().await?
        }
    };

    if let Err(e) = ctx.negotiate(&session, answer).await {
        ctx.close(&session).await;
        return Err(e.into());
    }

    println!("Connected as {}. Press Ctrl-C to hang up.", session.id());

    let mut states = session.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = states.wait_for(|s| s.is_terminal()) => warn!("{} ended: {:?}", session.id(), session.info().close_reason),
    }

    ctx.close_with_reason(&session, Some("hangup".into())).await;

    let stats = session.stats().await;
    println!(
        "Sent {} packets ({} bytes), received {} packets ({} bytes)",
        stats.packets_sent, stats.bytes_sent, stats.packets_received, stats.bytes_received
    );
    Ok(())
}

/// Reads an SDP blob from stdin, up to the first empty line after content.
async fn read_answer() -> Result<RemoteDescription> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut sdp = String::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            if sdp.is_empty() {
                continue;
            }
            break;
        }
        sdp.push_str(line);
        sdp.push_str("\r\n");
    }

    Ok(RemoteDescription::new(sdp))
}

async fn run_loopback() -> Result<()> {
    let ctx = SessionContext::new(LoopbackProvider::new());

    match ctx.open(SessionConfig::default()).await {
        Ok(_) => warn!("Opening without endpoints unexpectedly succeeded"),
        Err(e) => println!("open without endpoints: {}", e),
    }

    let session = ctx.open(SessionConfig::with_servers(["stun:example"])).await?;
    println!("{} is {:?}", session.id(), session.state());

    let answer = loopback::answer_for(session.local_description())?;
    ctx.negotiate(&session, answer).await?;
    println!("{} is {:?}", session.id(), session.state());

    session.mute().await?;
    session.send_dtmf('5').await?;
    println!("media: {:?}", session.media_attributes());

    ctx.close(&session).await;
    ctx.close(&session).await;
    println!("{} is {:?}", session.id(), session.state());
    println!("active sessions: {}", ctx.active_sessions().len());

    Ok(())
}
