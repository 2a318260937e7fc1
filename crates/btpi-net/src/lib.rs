//! Outbound HTTP for btpi: connectivity preflight and the API proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header;
use tracing::{info, warn};

pub mod proxy;
pub mod xml;

pub use proxy::{ProxyBases, ProxyError, ProxyTranslator};

pub const CRATE_NAME: &str = "btpi-net";

/// Sites with generally high uptime; reaching any one counts as online.
pub const DEFAULT_PROBE_HOSTS: [&str; 5] = [
    "https://google.com",
    "https://opendns.com/",
    "https://azure.microsoft.com/",
    "https://facebook.com/",
    "https://www.wikipedia.org/",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("btpi/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[async_trait]
pub trait Reachability: Send + Sync {
    /// True when `host` answered at all within `timeout`. Never errors.
    async fn reachable(&self, host: &str, timeout: Duration) -> bool;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct HttpReachability {
    client: reqwest::Client,
}

impl HttpReachability {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Reachability for HttpReachability {
    async fn reachable(&self, host: &str, timeout: Duration) -> bool {
        // Any HTTP response, whatever the status, proves the route out works.
        self.client
            .get(host)
            .header(header::CACHE_CONTROL, "no-cache")
            .timeout(timeout)
            .send()
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and counts calls.
#[derive(Debug, Default)]
pub struct NoopSleeper {
    calls: AtomicUsize,
}

impl NoopSleeper {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Best-effort check for outbound internet access.
#[derive(Clone)]
pub struct ConnectivityProber {
    hosts: Vec<String>,
    reachability: Arc<dyn Reachability>,
    sleeper: Arc<dyn Sleeper>,
}

impl ConnectivityProber {
    pub fn new(reachability: Arc<dyn Reachability>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            hosts: DEFAULT_PROBE_HOSTS.iter().map(|h| h.to_string()).collect(),
            reachability,
            sleeper,
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Tries hosts in order, one host per attempt, for at most
    /// `max_retries + 1` attempts. `max_retries` is clamped so no host is
    /// tried twice.
    pub async fn probe(&self, timeout: Duration, sleep_between: Duration, max_retries: usize) -> bool {
        if self.hosts.is_empty() {
            warn!("no connectivity probe hosts configured");
            return false;
        }
        let max_retries = max_retries.min(self.hosts.len() - 1);

        for (attempt, host) in self.hosts.iter().take(max_retries + 1).enumerate() {
            let connected = self.reachability.reachable(host, timeout).await;
            info!(site = %host, connected, "checking connectivity");
            if connected {
                return true;
            }
            if attempt < max_retries {
                warn!(
                    site = %host,
                    sleep_ms = sleep_between.as_millis() as u64,
                    "unable to access site, sleeping before next attempt"
                );
                self.sleeper.sleep(sleep_between).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedReachability {
        online_hosts: Vec<String>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedReachability {
        fn online(hosts: &[&str]) -> Self {
            Self {
                online_hosts: hosts.iter().map(|h| h.to_string()).collect(),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reachability for ScriptedReachability {
        async fn reachable(&self, host: &str, _timeout: Duration) -> bool {
            self.attempts.lock().unwrap().push(host.to_string());
            self.online_hosts.iter().any(|h| h == host)
        }
    }

    fn prober(reach: Arc<ScriptedReachability>, sleeper: Arc<NoopSleeper>) -> ConnectivityProber {
        ConnectivityProber::new(reach, sleeper)
    }

    #[tokio::test]
    async fn retries_are_clamped_to_the_host_list() {
        let reach = Arc::new(ScriptedReachability::online(&[]));
        let sleeper = Arc::new(NoopSleeper::default());
        let p = prober(reach.clone(), sleeper.clone());

        let connected = p
            .probe(Duration::from_millis(10), Duration::from_secs(3), 10)
            .await;

        assert!(!connected);
        assert_eq!(reach.attempts().len(), 5);
        assert_eq!(reach.attempts(), DEFAULT_PROBE_HOSTS.to_vec());
        assert_eq!(sleeper.calls(), 4);
    }

    #[tokio::test]
    async fn stops_at_first_reachable_host() {
        let reach = Arc::new(ScriptedReachability::online(&["https://azure.microsoft.com/"]));
        let sleeper = Arc::new(NoopSleeper::default());
        let p = prober(reach.clone(), sleeper.clone());

        assert!(p.probe(Duration::from_millis(10), Duration::ZERO, 4).await);
        assert_eq!(reach.attempts().len(), 3);
        assert_eq!(sleeper.calls(), 2);
    }

    #[tokio::test]
    async fn zero_retries_means_a_single_attempt() {
        let reach = Arc::new(ScriptedReachability::online(&["https://opendns.com/"]));
        let sleeper = Arc::new(NoopSleeper::default());
        let p = prober(reach.clone(), sleeper.clone());

        assert!(!p.probe(Duration::from_millis(10), Duration::ZERO, 0).await);
        assert_eq!(reach.attempts(), vec!["https://google.com".to_string()]);
        assert_eq!(sleeper.calls(), 0);
    }

    #[tokio::test]
    async fn empty_host_list_is_offline() {
        let reach = Arc::new(ScriptedReachability::default());
        let p = prober(reach.clone(), Arc::new(NoopSleeper::default())).with_hosts(vec![]);
        assert!(!p.probe(Duration::from_millis(10), Duration::ZERO, 3).await);
        assert!(reach.attempts().is_empty());
    }
}
