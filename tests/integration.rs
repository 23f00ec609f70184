//! End-to-end dispatch scenarios against scripted transports.
//!
//! The live test at the bottom is marked `#[ignore]` because it needs a real
//! proxy and network access.
//!
//! Run it with: `SERP_PROXY=user:pass@host:port cargo test --test integration -- --ignored`

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use serp_harvest::{
    Credentials, Dispatcher, FileSink, MemorySink, Outcome, ProxyConfig, ProxyPool, ProxyStatus,
    ResultSink, RetryPolicy, SerpTransport, TermResult, TermStatus, Worker,
};

/// Transport that answers by proxy port and records every call.
struct PortTransport {
    blocked_ports: Vec<u16>,
    outcome: fn() -> Outcome,
    delay: Duration,
    calls: Mutex<HashMap<String, Vec<u16>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl PortTransport {
    fn new(outcome: fn() -> Outcome) -> Self {
        Self {
            blocked_ports: Vec::new(),
            outcome,
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn blocking(mut self, port: u16) -> Self {
        self.blocked_ports.push(port);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls_for(&self, term: &str) -> Vec<u16> {
        self.calls
            .lock()
            .unwrap()
            .get(term)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SerpTransport for PortTransport {
    async fn call(&self, term: &str, _: &Credentials, proxy: &ProxyConfig) -> Outcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .entry(term.to_string())
            .or_default()
            .push(proxy.port);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.blocked_ports.contains(&proxy.port) {
            Outcome::Blocked { status: 403 }
        } else {
            (self.outcome)()
        }
    }
}

fn success() -> Outcome {
    Outcome::Success(json!({ "organic_results": [] }))
}

fn pool(ports: &[u16], cooldown: Duration) -> Arc<ProxyPool> {
    let proxies = ports
        .iter()
        .map(|port| ProxyConfig::new("127.0.0.1", *port))
        .collect();
    Arc::new(ProxyPool::with_proxies(proxies).unwrap().with_cooldown(cooldown))
}

fn dispatcher(
    pool: Arc<ProxyPool>,
    transport: Arc<PortTransport>,
    sink: Arc<dyn ResultSink>,
    max_attempts: u32,
    concurrency: usize,
) -> Dispatcher {
    let worker = Worker::new(
        pool,
        transport,
        sink,
        Arc::new(Credentials::new("id", "secret")),
        RetryPolicy::new(max_attempts).unwrap(),
    );
    Dispatcher::new(worker, concurrency).unwrap()
}

fn terms(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("nana{}", i)).collect()
}

#[tokio::test]
async fn blocked_proxy_is_benched_and_healthy_proxy_serves_every_term() {
    const A: u16 = 8001;
    const B: u16 = 8002;
    let pool = pool(&[A, B], Duration::from_secs(300));
    let transport = Arc::new(PortTransport::new(success).blocking(A));
    let sink = Arc::new(MemorySink::new());

    let summary = dispatcher(pool.clone(), transport.clone(), sink.clone(), 3, 3)
        .run(terms(3))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    for term in terms(3) {
        let calls = transport.calls_for(&term);
        assert_eq!(calls.last(), Some(&B), "{} must finish on B", term);
        assert!(calls.len() <= 2);
        assert!(sink.get(&term).unwrap().is_success());
    }

    let a = pool
        .snapshot()
        .into_iter()
        .find(|s| s.proxy.port == A)
        .unwrap();
    assert!(matches!(a.status, ProxyStatus::Banned { .. }));
}

#[tokio::test(start_paused = true)]
async fn captcha_on_only_proxy_fails_after_exactly_three_attempts() {
    let pool = pool(&[8001], Duration::from_secs(30));
    let transport = Arc::new(PortTransport::new(|| Outcome::CaptchaChallenge));
    let sink = Arc::new(MemorySink::new());

    let summary = dispatcher(pool, transport.clone(), sink.clone(), 3, 1)
        .run(vec!["nana0".to_string()])
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reports[0].status, TermStatus::Failed);
    assert_eq!(transport.calls_for("nana0").len(), 3);
    assert_eq!(
        sink.get("nana0"),
        Some(TermResult::Failed {
            reason: "captcha challenge".to_string(),
            attempts: 3,
        })
    );
}

#[tokio::test]
async fn rejected_credentials_fail_fast_and_leave_proxy_available() {
    let pool = pool(&[8001], Duration::from_secs(300));
    let transport = Arc::new(PortTransport::new(|| Outcome::AuthError { status: 401 }));
    let sink = Arc::new(MemorySink::new());

    let summary = dispatcher(pool.clone(), transport.clone(), sink.clone(), 10, 1)
        .run(vec!["nana0".to_string()])
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.auth_failures, 1);
    assert_eq!(summary.reports[0].status, TermStatus::CredentialsRejected);
    assert_eq!(transport.calls_for("nana0").len(), 1);
    assert_eq!(pool.snapshot()[0].status, ProxyStatus::Available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn twenty_terms_five_workers_each_term_processed_once() {
    let ports: Vec<u16> = (9000..9050).collect();
    let pool = pool(&ports, Duration::from_secs(300));
    let transport = Arc::new(PortTransport::new(success).with_delay(Duration::from_millis(20)));
    let sink = Arc::new(MemorySink::new());

    let summary = dispatcher(pool.clone(), transport.clone(), sink.clone(), 3, 5)
        .run(terms(20))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 20);
    assert_eq!(summary.reports.len(), 20);
    assert_eq!(sink.len(), 20);
    for term in terms(20) {
        assert_eq!(transport.calls_for(&term).len(), 1, "{} called more than once", term);
    }
    assert!(transport.peak.load(Ordering::SeqCst) <= 5);
    assert_eq!(pool.available_count(), 50);
}

#[tokio::test]
async fn file_sink_receives_one_artifact_per_term() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileSink::create(dir.path()).await.unwrap());
    let transport = Arc::new(PortTransport::new(success));

    let summary = dispatcher(pool(&[8001, 8002], Duration::from_secs(1)), transport, sink.clone(), 2, 4)
        .run(terms(6))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 6);
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 6);
    assert!(sink.path_for("nana3").exists());
}

#[tokio::test]
async fn long_non_ascii_term_is_saved_alongside_short_ones() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileSink::create(dir.path()).await.unwrap());
    let transport = Arc::new(PortTransport::new(success));
    let long_term = "東京都内のおすすめラーメン店".repeat(3);

    let summary = dispatcher(pool(&[8001], Duration::from_secs(1)), transport, sink.clone(), 2, 2)
        .run(vec!["rust".to_string(), long_term.clone()])
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert!(sink.path_for("rust").exists());
    assert!(sink.path_for(&long_term).exists());
}

#[tokio::test]
#[ignore]
async fn live_harvest_through_real_proxy() {
    use serp_harvest::{harvest, input::parse_proxy_line, HarvestConfig, ScriptAssetCredentials};

    let proxy = parse_proxy_line(&std::env::var("SERP_PROXY").unwrap()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let config = HarvestConfig {
        concurrency: 2,
        max_attempts: 3,
        output_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let credentials = ScriptAssetCredentials::default().with_proxies(vec![proxy.clone()]);

    let summary = harvest(&config, vec![proxy], &credentials, vec!["rust".to_string()])
        .await
        .unwrap();
    println!("live run: {:?}", summary);
    assert_eq!(summary.total(), 1);
}
