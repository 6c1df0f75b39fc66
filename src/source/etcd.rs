//! etcd v2 HTTP client: keyspace gets and long-poll watches.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{GetResponse, Node, SourceError, WatchEvent, WatchSource};

const ETCD_INDEX_HEADER: &str = "x-etcd-index";
const KEY_NOT_FOUND: u64 = 100;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHECK_ATTEMPTS: u32 = 100;
const CHECK_DELAY: Duration = Duration::from_millis(50);

pub struct EtcdClient {
    base: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    action: String,
    node: Option<Node>,
    prev_node: Option<Node>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    index: Option<u64>,
}

impl EtcdClient {
    pub fn new(endpoint: &str) -> Result<Self, SourceError> {
        // watches are bursty long polls; keep connections warm and never
        // time out an established poll
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(1))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|err| SourceError::Transport(err.to_string()))?;

        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Probes the source until it answers. A key-not-found answer counts as
    /// reachable; the probe gives up after a bounded number of attempts.
    pub async fn check(&self) -> Result<(), SourceError> {
        let mut attempt = 0;
        loop {
            match self.get("/", false, false).await {
                Ok(_) => return Ok(()),
                Err(SourceError::Api {
                    code: KEY_NOT_FOUND, ..
                }) => return Ok(()),
                Err(err) => {
                    if attempt > CHECK_ATTEMPTS {
                        return Err(SourceError::Transport(format!(
                            "could not reach etcd at {}: {err}",
                            self.base
                        )));
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(CHECK_DELAY).await;
        }
    }

    fn keys_url(&self, path: &str) -> String {
        format!("{}/v2/keys{}", self.base, path)
    }

    async fn request(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<(WireResponse, u64), SourceError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|err| SourceError::Transport(err.to_string()))?;

        let etcd_index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| SourceError::Transport(err.to_string()))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<WireError>(&body) {
                return Err(SourceError::Api {
                    code: err.error_code,
                    message: err.message,
                    index: err.index,
                });
            }
            return Err(SourceError::Transport(format!("etcd returned {status}")));
        }

        let wire: WireResponse = serde_json::from_slice(&body)
            .map_err(|err| SourceError::Transport(format!("undecodable etcd response: {err}")))?;
        Ok((wire, etcd_index))
    }
}

#[async_trait]
impl WatchSource for EtcdClient {
    async fn get(
        &self,
        path: &str,
        recursive: bool,
        sorted: bool,
    ) -> Result<GetResponse, SourceError> {
        let query = [
            ("recursive", recursive.to_string()),
            ("sorted", sorted.to_string()),
        ];
        let (wire, etcd_index) = self.request(&self.keys_url(path), &query).await?;
        Ok(GetResponse {
            node: wire.node,
            etcd_index,
        })
    }

    async fn watch(
        &self,
        path: &str,
        from_index: u64,
        recursive: bool,
        events: mpsc::Sender<WatchEvent>,
    ) -> Result<(), SourceError> {
        let url = self.keys_url(path);
        let mut wait_index = from_index;
        loop {
            let query = [
                ("wait", "true".to_string()),
                ("recursive", recursive.to_string()),
                ("waitIndex", wait_index.to_string()),
            ];
            let (wire, etcd_index) = self.request(&url, &query).await?;

            // the next poll resumes just past the event we were handed
            let seen = wire
                .node
                .as_ref()
                .map(|node| node.modified_index)
                .unwrap_or(etcd_index);
            wait_index = seen + 1;

            debug!("watch event {} at {}", wire.action, seen);
            let event = WatchEvent {
                action: wire.action,
                node: wire.node,
                prev_node: wire.prev_node,
                etcd_index,
            };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}
