//! Stream liveness checks.
//!
//! Every URL is probed according to its scheme and collapsed into a
//! [`ChannelStatus`]. A run never fails as a whole: per-URL problems are
//! reported through [`ProbeResult::error`] and [`ProbeResult::stage`].

use crate::cache::ValidationCache;
use crate::channel::{Channel, ChannelStatus};
use crate::config::ValidatorSettings;
use crate::errors::{ProbeStage, Result, ValidationProgress};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Statuses that prove the server is serving the stream.
/// 403 is common for tokenised CDNs that reject probes but play fine.
const ACCEPTED_STATUSES: [u16; 3] = [200, 206, 403];

const RTSP_STATUS_PREFIX: &[u8] = b"RTSP/1.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub url: String,
    pub status: ChannelStatus,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub stage: Option<ProbeStage>,
    pub from_cache: bool,
}

impl ProbeResult {
    fn working(url: &str, http_status: Option<u16>, started: Instant) -> Self {
        Self {
            url: url.to_string(),
            status: ChannelStatus::Working,
            http_status,
            latency_ms: started.elapsed().as_millis() as u64,
            error: None,
            stage: None,
            from_cache: false,
        }
    }

    fn failed(
        url: &str,
        status: ChannelStatus,
        stage: ProbeStage,
        error: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            url: url.to_string(),
            status,
            http_status: None,
            latency_ms: started.elapsed().as_millis() as u64,
            error: Some(error.into()),
            stage: Some(stage),
            from_cache: false,
        }
    }

    fn with_http_status(mut self, code: Option<u16>) -> Self {
        self.http_status = code;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Sequential,
    /// Bounded number of probes in flight
    Concurrent(usize),
}

/// Shared stop switch for a running validation
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum ValidationEvent {
    Checked {
        index: usize,
        name: String,
        result: ProbeResult,
    },
    Progress(ValidationProgress),
    Finished {
        cancelled: bool,
    },
}

/// Outcome of a run. `results[i]` belongs to the i-th input channel and is
/// `None` when the run was cancelled before reaching it.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub results: Vec<Option<ProbeResult>>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ValidationReport {
    pub fn checked(&self) -> usize {
        self.results.iter().flatten().count()
    }

    pub fn count(&self, status: ChannelStatus) -> usize {
        self.results
            .iter()
            .flatten()
            .filter(|r| r.status == status)
            .count()
    }

    /// Copy statuses onto the channels that were checked
    pub fn apply(&self, channels: &mut [Channel]) -> usize {
        let mut updated = 0;
        for (ch, result) in channels.iter_mut().zip(&self.results) {
            if let Some(r) = result {
                ch.status = r.status;
                updated += 1;
            }
        }
        updated
    }
}

pub struct ChannelValidator {
    client: reqwest::Client,
    timeout: Duration,
    delay: Duration,
    workers: usize,
    user_agent: String,
    cache: Option<Arc<Mutex<ValidationCache>>>,
    cache_ttl_hours: u32,
}

impl ChannelValidator {
    pub fn new(settings: &ValidatorSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            timeout,
            delay: Duration::from_millis(settings.delay_ms),
            workers: settings.workers.max(1),
            user_agent: settings.user_agent.clone(),
            cache: None,
            cache_ttl_hours: settings.cache_ttl_hours,
        })
    }

    pub fn with_cache(mut self, cache: Arc<Mutex<ValidationCache>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Mode implied by the configured worker count
    pub fn default_mode(&self) -> RunMode {
        if self.workers <= 1 {
            RunMode::Sequential
        } else {
            RunMode::Concurrent(self.workers)
        }
    }

    /// Probe a single URL, consulting the cache first
    pub async fn check(&self, url: &str) -> ProbeResult {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get_fresh(url, self.cache_ttl_hours) {
                tracing::debug!(url, status = %hit.status, "validation cache hit");
                return ProbeResult {
                    url: url.to_string(),
                    status: hit.status,
                    http_status: hit.http_status,
                    latency_ms: 0,
                    error: None,
                    stage: None,
                    from_cache: true,
                };
            }
        }

        let result = self.probe(url).await;

        if let Some(cache) = &self.cache {
            cache.lock().record(url, result.status, result.http_status);
        }
        result
    }

    /// Probe a single URL, dispatching on its scheme
    pub async fn probe(&self, url: &str) -> ProbeResult {
        let started = Instant::now();
        let url = url.trim();
        let scheme = match url.split_once("://") {
            Some((scheme, _)) => scheme.to_ascii_lowercase(),
            None => {
                return ProbeResult::failed(
                    url,
                    ChannelStatus::Broken,
                    ProbeStage::UrlParsing,
                    "missing URL scheme",
                    started,
                )
            }
        };

        let result = match scheme.as_str() {
            "http" | "https" => self.probe_http(url, started).await,
            "rtmp" | "rtmps" | "rtsp" => self.probe_socket(url, &scheme, started).await,
            "file" => probe_file(url, started),
            other => ProbeResult::failed(
                url,
                ChannelStatus::Broken,
                ProbeStage::UnsupportedScheme,
                format!("unsupported scheme '{}'", other),
                started,
            ),
        };

        tracing::debug!(
            url,
            status = %result.status,
            latency_ms = result.latency_ms,
            error = result.error.as_deref().unwrap_or(""),
            "probed stream"
        );
        result
    }

    async fn probe_http(&self, url: &str, started: Instant) -> ProbeResult {
        let get = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-1023")
            .send()
            .await;

        let mut last_code = None;
        match get {
            Ok(resp) if is_accepted(resp.status()) => {
                return ProbeResult::working(url, Some(resp.status().as_u16()), started);
            }
            Ok(resp) => last_code = Some(resp.status().as_u16()),
            Err(e) if e.is_timeout() => {
                return ProbeResult::failed(
                    url,
                    ChannelStatus::Timeout,
                    ProbeStage::HttpRequest,
                    format!("timed out after {}s", self.timeout.as_secs()),
                    started,
                );
            }
            Err(e) => tracing::debug!(url, error = %e, "GET probe failed, retrying with HEAD"),
        }

        match self.client.head(url).send().await {
            Ok(resp) if is_accepted(resp.status()) => {
                ProbeResult::working(url, Some(resp.status().as_u16()), started)
            }
            Ok(resp) => {
                let code = resp.status().as_u16();
                ProbeResult::failed(
                    url,
                    ChannelStatus::Broken,
                    ProbeStage::HttpRequest,
                    format!("HTTP {}", code),
                    started,
                )
                .with_http_status(Some(code))
            }
            Err(e) if e.is_timeout() => ProbeResult::failed(
                url,
                ChannelStatus::Timeout,
                ProbeStage::HttpRequest,
                format!("timed out after {}s", self.timeout.as_secs()),
                started,
            )
            .with_http_status(last_code),
            Err(e) => {
                let stage = if e.is_connect() {
                    ProbeStage::TcpConnection
                } else {
                    ProbeStage::HttpRequest
                };
                ProbeResult::failed(url, ChannelStatus::Broken, stage, e.to_string(), started)
                    .with_http_status(last_code)
            }
        }
    }

    async fn probe_socket(&self, url: &str, scheme: &str, started: Instant) -> ProbeResult {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                return ProbeResult::failed(
                    url,
                    ChannelStatus::Broken,
                    ProbeStage::UrlParsing,
                    e.to_string(),
                    started,
                )
            }
        };
        let Some(host) = parsed.host_str().map(str::to_string) else {
            return ProbeResult::failed(
                url,
                ChannelStatus::Broken,
                ProbeStage::UrlParsing,
                "URL has no host",
                started,
            );
        };
        let port = parsed.port().unwrap_or(match scheme {
            "rtmp" => 1935,
            "rtmps" => 443,
            _ => 554,
        });

        let mut stream =
            match tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    return ProbeResult::failed(
                        url,
                        ChannelStatus::Broken,
                        ProbeStage::TcpConnection,
                        e.to_string(),
                        started,
                    )
                }
                Err(_) => {
                    return ProbeResult::failed(
                        url,
                        ChannelStatus::Timeout,
                        ProbeStage::TcpConnection,
                        format!("connect to {}:{} timed out", host, port),
                        started,
                    )
                }
            };

        if scheme != "rtsp" {
            return ProbeResult::working(url, None, started);
        }

        let request = format!(
            "OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: {}\r\n\r\n",
            url, self.user_agent
        );
        let handshake = async {
            stream.write_all(request.as_bytes()).await?;
            // The status line may arrive split across segments
            let mut reply = Vec::with_capacity(RTSP_STATUS_PREFIX.len());
            let mut buf = [0u8; 512];
            while reply.len() < RTSP_STATUS_PREFIX.len() {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                reply.extend_from_slice(&buf[..n]);
            }
            Ok::<_, std::io::Error>(reply)
        };

        match tokio::time::timeout(self.timeout, handshake).await {
            Ok(Ok(reply)) if reply.starts_with(RTSP_STATUS_PREFIX) => {
                ProbeResult::working(url, None, started)
            }
            Ok(Ok(_)) => ProbeResult::failed(
                url,
                ChannelStatus::Broken,
                ProbeStage::RtspHandshake,
                "server did not answer with an RTSP status line",
                started,
            ),
            Ok(Err(e)) => ProbeResult::failed(
                url,
                ChannelStatus::Broken,
                ProbeStage::RtspHandshake,
                e.to_string(),
                started,
            ),
            Err(_) => ProbeResult::failed(
                url,
                ChannelStatus::Timeout,
                ProbeStage::RtspHandshake,
                "RTSP OPTIONS timed out",
                started,
            ),
        }
    }

    /// Validate every channel's primary URL.
    ///
    /// Results come back in input order regardless of mode. The cancel flag is
    /// polled before each probe.
    pub async fn validate_channels(
        &self,
        channels: &[Channel],
        mode: RunMode,
        cancel: &CancelFlag,
        events: Option<mpsc::Sender<ValidationEvent>>,
    ) -> ValidationReport {
        let started = Instant::now();
        let total = channels.len();
        let mut results: Vec<Option<ProbeResult>> = vec![None; total];
        let mut checked = 0usize;
        let mut working = 0usize;

        tracing::info!(total, ?mode, "starting validation");

        match mode {
            RunMode::Sequential => {
                for (index, ch) in channels.iter().enumerate() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if index > 0 && !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    let result = self.check(&ch.url).await;
                    checked += 1;
                    if result.status == ChannelStatus::Working {
                        working += 1;
                    }
                    emit(&events, index, ch, &result, checked, total, working, started).await;
                    results[index] = Some(result);
                }
            }
            RunMode::Concurrent(limit) => {
                let mut in_flight = stream::iter(channels.iter().enumerate().map(|(index, ch)| async move {
                    if cancel.is_cancelled() {
                        return (index, None);
                    }
                    (index, Some(self.check(&ch.url).await))
                }))
                .buffer_unordered(limit.max(1));

                while let Some((index, result)) = in_flight.next().await {
                    let Some(result) = result else { continue };
                    checked += 1;
                    if result.status == ChannelStatus::Working {
                        working += 1;
                    }
                    emit(&events, index, &channels[index], &result, checked, total, working, started)
                        .await;
                    results[index] = Some(result);
                }
            }
        }

        let cancelled = cancel.is_cancelled() && checked < total;
        if let Some(tx) = &events {
            let _ = tx.send(ValidationEvent::Finished { cancelled }).await;
        }

        tracing::info!(checked, working, cancelled, elapsed_ms = started.elapsed().as_millis() as u64, "validation finished");

        ValidationReport {
            results,
            cancelled,
            elapsed: started.elapsed(),
        }
    }

    /// For each failed channel, probe its backups in order and swap the first
    /// working one into the primary slot. Returns how many channels were fixed.
    pub async fn promote_working_backups(&self, channels: &mut [Channel]) -> usize {
        let mut promoted = 0;
        for ch in channels.iter_mut().filter(|c| c.status.is_failure()) {
            for i in 0..ch.backups.len() {
                let result = self.check(&ch.backups[i]).await;
                if result.status == ChannelStatus::Working {
                    tracing::info!(channel = %ch.name, backup = %ch.backups[i], "promoting working backup");
                    ch.promote_backup(i);
                    ch.status = ChannelStatus::Working;
                    promoted += 1;
                    break;
                }
            }
        }
        promoted
    }
}

fn is_accepted(status: StatusCode) -> bool {
    ACCEPTED_STATUSES.contains(&status.as_u16())
}

fn probe_file(url: &str, started: Instant) -> ProbeResult {
    let path = url::Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .unwrap_or_else(|| {
            let raw = &url["file://".len().min(url.len())..];
            std::path::PathBuf::from(urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string()))
        });

    if path.exists() {
        ProbeResult::working(url, None, started)
    } else {
        ProbeResult::failed(
            url,
            ChannelStatus::Broken,
            ProbeStage::FileCheck,
            format!("{} does not exist", path.display()),
            started,
        )
    }
}

#[allow(clippy::too_many_arguments)]
async fn emit(
    events: &Option<mpsc::Sender<ValidationEvent>>,
    index: usize,
    channel: &Channel,
    result: &ProbeResult,
    checked: usize,
    total: usize,
    working: usize,
    started: Instant,
) {
    let Some(tx) = events else { return };

    let eta = (checked > 0 && checked < total).then(|| {
        let per_item = started.elapsed() / checked as u32;
        per_item * (total - checked) as u32
    });
    let mut progress = ValidationProgress::new(checked, total, working);
    if let Some(eta) = eta {
        progress = progress.with_eta(eta);
    }

    let _ = tx
        .send(ValidationEvent::Checked {
            index,
            name: channel.name.clone(),
            result: result.clone(),
        })
        .await;
    let _ = tx.send(ValidationEvent::Progress(progress)).await;
}
