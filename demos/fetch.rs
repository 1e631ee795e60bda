//! Fetch a URL through the download pipeline
//!
//! Prints every event for the download, then where the file ended up.
//! A dangerous file is held until confirmed on stdin.
//!
//! Usage: cargo run --example fetch -- <url> [download-dir]

use dlpipe::{DownloadEngine, DownloadEvent, DownloadState, ManagerConfig, SafetyState};
use std::env;
use std::io::BufRead;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "https://httpbin.org/bytes/1024".to_string());

    let mut config = ManagerConfig::default();
    if let Some(dir) = args.next() {
        config = config.download_dir(dir);
    }
    let engine = DownloadEngine::new(config).await?;

    let mut events = engine.subscribe();
    let id = engine.download_url(&url).await?;
    println!("Downloading {url} as {id}");

    let mut asked = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(e) => {
                eprintln!("Event error: {e}");
                break;
            }
        };
        if event.id() != Some(id) {
            continue;
        }
        println!("{event:?}");

        let Some(status) = engine.status(id).await? else {
            break;
        };
        if status.state.is_terminal() {
            break;
        }
        if !asked && status.all_data_saved && status.safety_state == SafetyState::Dangerous {
            asked = true;
            println!("{} may be dangerous. Keep it? [y/N]", status.display_name());
            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            if answer.trim().eq_ignore_ascii_case("y") {
                engine.validate_dangerous(id).await?;
            } else {
                engine.discard(id).await?;
                println!("Discarded");
                break;
            }
        }
        if matches!(event, DownloadEvent::Removed { .. }) {
            break;
        }
    }

    if let Some(status) = engine.status(id).await? {
        match status.state {
            DownloadState::Complete => println!(
                "Saved {} bytes to {}",
                status.received_bytes,
                status.target_path.display()
            ),
            state => println!("Ended {state}: {:?}", status.last_reason),
        }
    }

    engine.shutdown().await?;
    Ok(())
}
