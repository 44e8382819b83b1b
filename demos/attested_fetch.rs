//! Fetch a URL through an attested, pinned session.
//!
//! ```text
//! cargo run --example attested_fetch -- attest.json https://api.example.com/items
//! ```
//!
//! `RUST_LOG=attested_session=debug` shows every audit decision.

use attested_session::session::TaskResult;
use attested_session::{AttestConfig, AttestedSession, TaskBody};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (config_path, url) = match (args.next(), args.next()) {
        (Some(config), Some(url)) => (config, url),
        _ => {
            eprintln!("usage: attested_fetch <config.json> <url>");
            std::process::exit(2);
        }
    };

    let config = AttestConfig::from_file(&config_path)?;
    let session = AttestedSession::builder(config).build()?;
    session.prefetch();

    let (tx, rx) = oneshot::channel();
    let task = session
        .data_task_with_url(
            &url,
            Some(Box::new(move |result: TaskResult| {
                let _ = tx.send(result);
            })),
        )
        .await?;
    println!("task {} -> {}", task.id(), task.url());

    let response = rx.await??;
    println!("status: {}", response.status);
    match response.body {
        TaskBody::Bytes(body) => println!("{}", String::from_utf8_lossy(&body)),
        TaskBody::File(path) => println!("saved to {}", path.display()),
    }

    session.finish_tasks_and_invalidate();
    Ok(())
}
