//! A small demo element: publishes a heartbeat stream while serving a
//! `say` command that echoes back whatever it is sent, loudly.
//!
//! Run a nucleus (`docker run --rm -p 6379:6379 redis:7`), then:
//!
//! ```console
//! $ cargo run --example atombot
//! ```

use atom::config::NucleusConfig;
use atom::{CancellationToken, Datum, Element, Response, Serialization, WriteOptions};
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let element = Element::connect("atombot", &NucleusConfig::default()).await?;

    element.command_add(
        "say",
        |data, _extras| async move {
            let heard = String::from_utf8(data.as_bytes().unwrap_or_default().to_vec())?;
            Ok(Response::ok(format!("{}!", heard.to_uppercase())))
        },
        1000,
        Serialization::None,
    )?;

    let publisher = element.clone();
    tokio::spawn(async move {
        let mut beat: u64 = 0;
        loop {
            let mut fields = BTreeMap::new();
            fields.insert("beat".to_string(), Datum::from(beat.to_string()));
            if let Err(error) = publisher
                .entry_write("heartbeat", &fields, &WriteOptions::default())
                .await
            {
                tracing::error!(%error, "heartbeat write failed");
            }
            beat += 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        on_ctrl_c.cancel();
    });

    element.command_loop(shutdown).await?;
    element.close().await?;
    Ok(())
}
