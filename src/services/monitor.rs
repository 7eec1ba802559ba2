use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Which providers the backend currently has loaded. The monitor channel
/// also carries host resource metrics; the core only reads this part.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProviderSnapshot {
    #[serde(default)]
    pub llm: Vec<String>,
    #[serde(default)]
    pub tts: Vec<String>,
}

impl ProviderSnapshot {
    /// Generation gating: before the first frame arrives the set is empty
    /// and gating stays open, so a missing monitor never blocks the user.
    pub fn allows_tts(&self, provider: &str) -> bool {
        self.tts.is_empty() || self.tts.iter().any(|p| p == provider)
    }
}

#[derive(Debug, Deserialize, Default)]
struct MonitorFrame {
    #[serde(default)]
    providers: ProviderSnapshot,
}

/// Reads the live status channel and keeps the latest provider snapshot in
/// a watch channel. Reconnects with a fixed delay; on connection loss the
/// last snapshot stays in effect.
pub struct StatusMonitor {
    rx: watch::Receiver<ProviderSnapshot>,
    handle: JoinHandle<()>,
}

impl StatusMonitor {
    pub fn connect(base_url: &str) -> Result<Self> {
        let ws_url = monitor_url(base_url)?;
        let (tx, rx) = watch::channel(ProviderSnapshot::default());

        let handle = tokio::spawn(async move {
            loop {
                match connect_async(ws_url.as_str()).await {
                    Ok((mut stream, _)) => {
                        debug!("monitor connected: {}", ws_url);
                        while let Some(msg) = stream.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<MonitorFrame>(&text) {
                                        Ok(frame) => {
                                            let _ = tx.send(frame.providers);
                                        }
                                        Err(e) => debug!("unparseable monitor frame: {}", e),
                                    }
                                }
                                Ok(Message::Close(_)) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("monitor stream error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("monitor connect failed: {}", e),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(Self { rx, handle })
    }

    pub fn providers(&self) -> watch::Receiver<ProviderSnapshot> {
        self.rx.clone()
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn monitor_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).context("Invalid server base_url")?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot derive ws scheme from {}", base_url))?;
    url.set_path("/ws/monitor");
    Ok(url)
}
