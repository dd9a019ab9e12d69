//! collab-demo: two participants editing one buffer through an in-process hub.
//!
//! Credentials for the first participant come from the environment
//! (`COLLAB_USERNAME`, `COLLAB_PASSWORD`, see [`Config::from_env`]) and
//! default to `alice`; the second one joins as `<first>-guest`.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use collab_client::{Config, CursorState, LocalHub, Session, Transport};

const WORKSPACE: &str = "demo";
const BUFFER: &str = "notes.txt";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_client=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let mut first = Config::from_env();
    if first.username.is_empty() {
        first = first.with_credentials("alice", "secret");
    }
    let guest = format!("{}-guest", first.username);
    let second = first.clone().with_credentials(guest, "secret");

    let hub = LocalHub::new();
    hub.register(&first.username, &first.password)?;
    hub.register(&second.username, &second.password)?;
    let transport: Arc<dyn Transport> = Arc::new(hub.clone());

    info!("collab-demo v{} against an in-process hub", env!("CARGO_PKG_VERSION"));

    let alice = Session::connect(first, Arc::clone(&transport)).await?;
    let bob = Session::connect(second, transport).await?;

    alice.create_workspace(WORKSPACE).await?;
    alice.invite(WORKSPACE, &bob.user().name).await?;

    let ws_a = alice.join(WORKSPACE).await?;
    let ws_b = bob.join(WORKSPACE).await?;

    let buf_a = ws_a.attach(BUFFER).await?;
    buf_a.edit(0..0, "ab")?;
    buf_a.drain(Duration::from_secs(2)).await?;

    let buf_b = ws_b.attach(BUFFER).await?;
    let mut changes = buf_b.subscribe();
    let mut seen = 0;

    // Concurrent inserts at the same offset
    buf_a.edit(0..0, "X")?;
    buf_b.edit(0..0, "Y")?;
    ws_a.cursor().publish(CursorState::caret(BUFFER, 1))?;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if buf_a.len() == 4 && buf_a.read()? == buf_b.read()? {
                return collab_client::Result::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("replicas did not converge")??;

    while changes.try_recv().is_some() {
        seen += 1;
    }
    info!("{} received {} remote changes", bob.user().name, seen);
    info!("{} sees {:?}", alice.user().name, buf_a.read()?);
    info!("{} sees {:?}", bob.user().name, buf_b.read()?);
    if let Some(cursor) = ws_b.cursor().get(&alice.user().id) {
        info!("{}'s cursor in {} at {:?}", alice.user().name, cursor.buffer, cursor.range());
    }

    println!("{}", serde_json::to_string_pretty(&ws_a.file_tree()?)?);
    println!("{}", serde_json::to_string_pretty(&hub.stats())?);

    bob.leave(WORKSPACE).await?;
    alice.leave(WORKSPACE).await?;
    bob.disconnect().await?;
    alice.disconnect().await?;

    Ok(())
}
