//! Cloud log shipper
//!
//! Tails configured files and commands, frames records into bounded JSON
//! batches, and uploads them to the cloud log service with signed requests.
//! Batches respect event and byte high-water marks and a linger timer; the
//! outbound queue is bounded at four batches with an oldest-dropped policy.

pub mod tail;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::SharedConfig;
use crate::error::AgentError;
use crate::provision::Provisioner;
use crate::signer::{self, Credentials, SignRequest};
use tail::{CommandTail, FileTail, LineAssembler, TailSource, DEFAULT_CONTINUATION};

/// Cloud service hard limit on events per batch
pub const MAX_EVENTS: usize = 1000;
/// Cloud service batch size limit we stay under
pub const MAX_BATCH_SIZE: usize = 256 * 1024;
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);
pub const MAX_LINGER: Duration = Duration::from_secs(3600);
/// Outbound queue bound; overflow drops the oldest unsent batch
const MAX_QUEUE: usize = 4;

/// Events this far ahead of the wall clock are dropped
const FUTURE_LIMIT_MS: i64 = 2 * 3600 * 1000;
/// Events older than this are dropped (the service refuses ~14 days)
const PAST_LIMIT_MS: i64 = 14 * 86_400_000;

const LOGS_API_VERSION: &str = "Logs_20140328";

/// Framed batch buffer plus the bounded outbound queue for one source.
pub struct LogBatcher {
    group: String,
    stream: String,
    buf: String,
    events: usize,
    max_events: usize,
    events_hiw: usize,
    max_size: usize,
    size_hiw: usize,
    pub linger: Duration,
    sequence: Option<String>,
    queue: VecDeque<String>,
    pub dropped: u64,
}

impl LogBatcher {
    pub fn new(
        group: &str,
        stream: &str,
        max_events: Option<usize>,
        max_size: Option<usize>,
        linger: Option<Duration>,
    ) -> LogBatcher {
        let max_events = max_events.unwrap_or(MAX_EVENTS).clamp(1, MAX_EVENTS);
        let max_size = max_size.unwrap_or(MAX_BATCH_SIZE).clamp(1024, MAX_BATCH_SIZE);
        let linger = linger.unwrap_or(DEFAULT_LINGER).min(MAX_LINGER);
        let mut batcher = LogBatcher {
            group: group.to_string(),
            stream: stream.to_string(),
            buf: String::new(),
            events: 0,
            max_events,
            // High-water marks at 80% leave room to finalize before sending
            events_hiw: max_events * 80 / 100,
            max_size: max_size - 3,
            size_hiw: max_size * 80 / 100,
            linger,
            sequence: None,
            queue: VecDeque::new(),
            dropped: 0,
        };
        batcher.prepare();
        batcher
    }

    fn prepare(&mut self) {
        self.buf = String::from("{\"logEvents\":[");
        self.events = 0;
    }

    pub fn events(&self) -> usize {
        self.events
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn set_sequence(&mut self, token: Option<String>) {
        self.sequence = token;
    }

    /// Add one record with the current wall-clock timestamp.
    pub fn add(&mut self, message: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        self.add_at(now, message, now)
    }

    /// Add one record. Returns true when a high-water mark was crossed and
    /// the caller should flush. Out-of-range timestamps are dropped.
    pub fn add_at(&mut self, timestamp_ms: i64, message: &str, now_ms: i64) -> bool {
        if timestamp_ms > now_ms + FUTURE_LIMIT_MS
            || timestamp_ms < now_ms - PAST_LIMIT_MS + 3_600_000
        {
            trace!("Ignore out of range log event");
            return false;
        }
        let entry = format!(
            "{{\"timestamp\":{},\"message\":{}}},",
            timestamp_ms,
            json!(message)
        );
        // A full batch closes before the new event, which carries over into
        // the fresh buffer
        if self.events + 1 >= self.max_events || self.buf.len() + entry.len() > self.max_size {
            self.flush();
        }
        self.buf.push_str(&entry);
        self.events += 1;
        self.events >= self.events_hiw || self.buf.len() >= self.size_hiw
    }

    /// Finalize the current buffer into the outbound queue and start a new
    /// one. Overflow drops the oldest not-yet-sent batch.
    pub fn flush(&mut self) {
        if self.events == 0 {
            return;
        }
        let mut batch = std::mem::take(&mut self.buf);
        // Erase the trailing comma after the last event
        batch.pop();
        batch.push_str(&format!(
            "],\"logGroupName\":{},\"logStreamName\":{}",
            json!(self.group),
            json!(self.stream)
        ));
        if let Some(sequence) = &self.sequence {
            batch.push_str(&format!(",\"sequenceToken\":{}", json!(sequence)));
        }
        batch.push('}');
        self.prepare();

        self.queue.push_back(batch);
        if self.queue.len() > MAX_QUEUE {
            self.queue.pop_front();
            self.dropped += 1;
            warn!("Discarding log batch due to queue overflow");
        }
    }

    /// Take the oldest finalized batch for upload.
    pub fn next_batch(&mut self) -> Option<String> {
        self.queue.pop_front()
    }
}

/// Signed access to the cloud log service.
pub struct CloudLogClient {
    http: reqwest::Client,
    region: String,
    creds: Credentials,
}

/// Upload failure classification
pub enum LogServiceError {
    /// The sequence token is stale; re-probe the stream
    BadSequence,
    Other(AgentError),
}

impl CloudLogClient {
    pub fn new(http: reqwest::Client, creds: Credentials) -> CloudLogClient {
        CloudLogClient {
            http,
            region: creds.region.clone(),
            creds,
        }
    }

    async fn call(&self, target: &str, body: &str) -> Result<(u16, String), AgentError> {
        let request = SignRequest {
            region: &self.region,
            service: "logs",
            target: Some(target),
            method: "POST",
            path: "/",
            query: "",
            body: body.as_bytes(),
            content_type: None,
            host: None,
        };
        let headers = signer::sign(&request, &self.creds)?;
        let url = format!("https://logs.{}.amazonaws.com/", self.region);
        let mut req = self.http.post(&url).body(body.to_string());
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let response = req
            .send()
            .await
            .map_err(|e| AgentError::CantConnect(format!("log service: {}", e)))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    /// Upload one batch; returns the next sequence token.
    pub async fn put_events(&self, batch: &str) -> Result<Option<String>, LogServiceError> {
        let target = format!("{}.PutLogEvents", LOGS_API_VERSION);
        let (status, body) = self.call(&target, batch).await.map_err(LogServiceError::Other)?;
        if status != 200 {
            if body.contains("InvalidSequenceToken") || body.contains("Bad sequence") {
                return Err(LogServiceError::BadSequence);
            }
            return Err(LogServiceError::Other(AgentError::CantWrite(format!(
                "log service status {}: {}",
                status, body
            ))));
        }
        let parsed: Value = serde_json::from_str(&body).unwrap_or_else(|_| json!({}));
        Ok(parsed
            .get("nextSequenceToken")
            .and_then(|v| v.as_str())
            .map(String::from))
    }

    async fn exists_in_page(
        &self,
        target: &str,
        body: Value,
        list: &str,
        field: &str,
        wanted: &str,
    ) -> Result<(bool, Option<String>, Option<String>), AgentError> {
        let (status, text) = self.call(target, &body.to_string()).await?;
        if status != 200 {
            return Err(AgentError::CantRead(format!(
                "log service status {}: {}",
                status, text
            )));
        }
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::CantRead(format!("log service: {}", e)))?;
        let mut token = None;
        if let Some(entries) = parsed.get(list).and_then(|v| v.as_array()) {
            for entry in entries {
                if entry.get(field).and_then(|v| v.as_str()) == Some(wanted) {
                    token = entry
                        .get("uploadSequenceToken")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    return Ok((true, token, None));
                }
            }
        }
        let next = parsed.get("nextToken").and_then(|v| v.as_str()).map(String::from);
        Ok((false, token, next))
    }

    /// Ensure the log group exists, creating it on demand.
    pub async fn ensure_group(&self, group: &str, create: bool) -> Result<(), AgentError> {
        let target = format!("{}.DescribeLogGroups", LOGS_API_VERSION);
        let mut next: Option<String> = None;
        loop {
            let mut body = json!({ "logGroupNamePrefix": group });
            if let Some(token) = &next {
                body["nextToken"] = json!(token);
            }
            let (found, _, next_token) = self
                .exists_in_page(&target, body, "logGroups", "logGroupName", group)
                .await?;
            if found {
                return Ok(());
            }
            match next_token {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        if !create {
            return Err(AgentError::CantInitialize(format!(
                "cannot find log group {}",
                group
            )));
        }
        let target = format!("{}.CreateLogGroup", LOGS_API_VERSION);
        let (status, text) = self
            .call(&target, &json!({ "logGroupName": group }).to_string())
            .await?;
        if status != 200 {
            return Err(AgentError::CantInitialize(format!(
                "cannot create log group {}: {}",
                group, text
            )));
        }
        Ok(())
    }

    /// Ensure the log stream exists and return its sequence token.
    pub async fn ensure_stream(
        &self,
        group: &str,
        stream: &str,
        create: bool,
    ) -> Result<Option<String>, AgentError> {
        let target = format!("{}.DescribeLogStreams", LOGS_API_VERSION);
        let mut next: Option<String> = None;
        loop {
            let mut body = json!({ "logGroupName": group, "logStreamNamePrefix": stream });
            if let Some(token) = &next {
                body["nextToken"] = json!(token);
            }
            let (found, token, next_token) = self
                .exists_in_page(&target, body, "logStreams", "logStreamName", stream)
                .await?;
            if found {
                return Ok(token);
            }
            match next_token {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        if !create {
            return Err(AgentError::CantInitialize(format!(
                "cannot find log stream {}/{}",
                group, stream
            )));
        }
        let target = format!("{}.CreateLogStream", LOGS_API_VERSION);
        let (status, text) = self
            .call(
                &target,
                &json!({ "logGroupName": group, "logStreamName": stream }).to_string(),
            )
            .await?;
        if status != 200 {
            return Err(AgentError::CantInitialize(format!(
                "cannot create log stream {}: {}",
                stream, text
            )));
        }
        Ok(None)
    }
}

/// One configured log source.
pub struct SourceConfig {
    pub source: TailSource,
    pub continuation: String,
    pub group: String,
    pub stream: String,
    pub create: bool,
    pub max_events: Option<usize>,
    pub max_size: Option<usize>,
    pub linger: Option<Duration>,
}

/// Expand the `log.files` config into concrete sources. Wildcard paths are
/// expanded at startup.
pub fn source_configs(config: &crate::config::Config) -> Vec<SourceConfig> {
    let mut sources = Vec::new();
    let files = match config.get("log.files").and_then(|v| v.as_array()) {
        Some(files) => files.clone(),
        None => return sources,
    };
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    for entry in files {
        if !entry.get("enable").and_then(|v| v.as_bool()).unwrap_or(true) {
            continue;
        }
        let continuation = entry
            .get("continuation")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CONTINUATION)
            .to_string();
        let group = entry
            .get("group")
            .and_then(|v| v.as_str())
            .unwrap_or("agent")
            .to_string();
        let stream_template = entry
            .get("stream")
            .and_then(|v| v.as_str())
            .unwrap_or("${hostname}-${filename}")
            .to_string();
        let create = entry.get("create").and_then(|v| v.as_bool()).unwrap_or(true);
        let max_events = entry.get("maxEvents").and_then(|v| v.as_u64()).map(|n| n as usize);
        let max_size = entry.get("maxSize").and_then(|v| v.as_u64()).map(|n| n as usize);
        let linger = entry
            .get("linger")
            .map(|v| Duration::from_secs(crate::config::parse_duration(v, 5)));
        let tail_from_end = entry
            .get("position")
            .and_then(|v| v.as_str())
            .unwrap_or("end")
            == "end";

        let expand_stream = |filename: &str| {
            stream_template
                .replace("${hostname}", &host)
                .replace("${filename}", filename)
        };

        if let Some(command) = entry.get("command").and_then(|v| v.as_str()) {
            sources.push(SourceConfig {
                source: TailSource::Command(CommandTail::new(command.to_string())),
                continuation: continuation.clone(),
                group: group.clone(),
                stream: expand_stream("command"),
                create,
                max_events,
                max_size,
                linger,
            });
            continue;
        }
        let pattern = match entry.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => continue,
        };
        let paths: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(matches) => matches.filter_map(|m| m.ok()).collect(),
            Err(e) => {
                warn!("Bad log path pattern {}: {}", pattern, e);
                continue;
            }
        };
        // An exact path that does not exist yet is still watched
        let paths = if paths.is_empty() && !pattern.contains('*') {
            vec![PathBuf::from(&pattern)]
        } else {
            paths
        };
        for path in paths {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "log".to_string());
            sources.push(SourceConfig {
                source: TailSource::File(FileTail::new(path, tail_from_end)),
                continuation: continuation.clone(),
                group: group.clone(),
                stream: expand_stream(&filename),
                create,
                max_events,
                max_size,
                linger,
            });
        }
    }
    sources
}

/// Start the shipper: one task per configured source. Waits for cloud
/// credentials before going live.
pub async fn start(config: SharedConfig, provisioner: Arc<Provisioner>) -> Vec<JoinHandle<()>> {
    // Credentials arrive via the key refresh loop after provisioning
    let creds = loop {
        if let Some(creds) = provisioner.credentials().await {
            break creds;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    };
    let sources = {
        let cfg = config.read().await;
        source_configs(&cfg)
    };
    if sources.is_empty() {
        debug!("No log sources configured");
        return Vec::new();
    }
    info!("Cloud log capture enabled for {} sources", sources.len());
    let http = reqwest::Client::new();
    let mut handles = Vec::new();
    for source in sources {
        let provisioner = provisioner.clone();
        let http = http.clone();
        let creds = creds.clone();
        handles.push(tokio::spawn(async move {
            run_source(source, provisioner, http, creds).await;
        }));
    }
    handles
}

async fn upload_queue(
    batcher: &mut LogBatcher,
    provisioner: &Arc<Provisioner>,
    http: &reqwest::Client,
    group: &str,
    stream: &str,
) {
    while let Some(batch) = batcher.next_batch() {
        let creds = match provisioner.credentials().await {
            Some(c) => c,
            None => {
                error!("Cloud keys not configured for log capture");
                return;
            }
        };
        let client = CloudLogClient::new(http.clone(), creds);
        match client.put_events(&batch).await {
            Ok(token) => batcher.set_sequence(token),
            Err(LogServiceError::BadSequence) => {
                // Refresh the token by re-probing the stream; the batch is
                // gone, later batches use the fresh token
                match client.ensure_stream(group, stream, false).await {
                    Ok(token) => batcher.set_sequence(token),
                    Err(e) => error!("log: {}", e),
                }
            }
            Err(LogServiceError::Other(e)) => error!("log: {}", e),
        }
    }
}

async fn run_source(
    source: SourceConfig,
    provisioner: Arc<Provisioner>,
    http: reqwest::Client,
    creds: Credentials,
) {
    let mut batcher = LogBatcher::new(
        &source.group,
        &source.stream,
        source.max_events,
        source.max_size,
        source.linger,
    );
    // Group and stream are created on demand
    let client = CloudLogClient::new(http.clone(), creds);
    match client.ensure_group(&source.group, source.create).await {
        Ok(()) => match client.ensure_stream(&source.group, &source.stream, source.create).await {
            Ok(token) => batcher.set_sequence(token),
            Err(e) => error!("log: {}", e),
        },
        Err(e) => error!("log: {}", e),
    }
    let mut assembler = LineAssembler::new(&source.continuation);

    match source.source {
        TailSource::File(tail) => {
            run_file_source(tail, &mut assembler, &mut batcher, &provisioner, &http, &source.group, &source.stream)
                .await;
        }
        TailSource::Command(tail) => {
            run_command_source(tail, &mut assembler, &mut batcher, &provisioner, &http, &source.group, &source.stream)
                .await;
        }
    }
}

async fn run_file_source(
    mut tail: FileTail,
    assembler: &mut LineAssembler,
    batcher: &mut LogBatcher,
    provisioner: &Arc<Provisioner>,
    http: &reqwest::Client,
    group: &str,
    stream: &str,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let watched = tail.path.clone();
    let target = tail.path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|p| p.ends_with(&target) || *p == target) {
                let _ = event_tx.send(());
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            error!("Cannot watch {}: {}", watched.display(), e);
            return;
        }
    };
    // Watch the parent directory so rotation (remove + recreate) is seen
    let watch_dir = watched
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("Cannot watch {}: {}", watch_dir.display(), e);
        return;
    }

    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                if event.is_none() {
                    break;
                }
                // The file is opened lazily, on the first modification
                tail.check_rotation();
                if let Err(e) = tail.open() {
                    trace_open_failure(&tail.path, e);
                    continue;
                }
                match tail.read_available() {
                    Ok(data) if !data.is_empty() => {
                        let mut flush_now = false;
                        for record in assembler.push(&data) {
                            flush_now |= batcher.add(&record);
                        }
                        if flush_now {
                            batcher.flush();
                            upload_queue(batcher, provisioner, http, group, stream).await;
                            deadline = None;
                        } else if batcher.events() > 0 && deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + batcher.linger);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Cannot read {}: {}", tail.path.display(), e);
                        tail.close();
                    }
                }
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                batcher.flush();
                upload_queue(batcher, provisioner, http, group, stream).await;
                deadline = None;
            }
        }
    }
}

fn trace_open_failure(path: &std::path::Path, e: std::io::Error) {
    trace!("Cannot open \"{}\": {}", path.display(), e);
}

async fn run_command_source(
    mut tail: CommandTail,
    assembler: &mut LineAssembler,
    batcher: &mut LogBatcher,
    provisioner: &Arc<Provisioner>,
    http: &reqwest::Client,
    group: &str,
    stream: &str,
) {
    let mut stdout = match tail.open() {
        Ok(out) => out,
        Err(e) => {
            error!("Cannot open command \"{}\": {}", tail.command, e);
            return;
        }
    };
    let mut chunk = vec![0u8; 4096];
    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut flush_now = false;
                        for record in assembler.push(&chunk[..n]) {
                            flush_now |= batcher.add(&record);
                        }
                        if flush_now {
                            batcher.flush();
                            upload_queue(batcher, provisioner, http, group, stream).await;
                            deadline = None;
                        } else if batcher.events() > 0 && deadline.is_none() {
                            deadline = Some(tokio::time::Instant::now() + batcher.linger);
                        }
                    }
                    Err(e) => {
                        error!("Cannot read command \"{}\": {}", tail.command, e);
                        break;
                    }
                }
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                batcher.flush();
                upload_queue(batcher, provisioner, http, group, stream).await;
                deadline = None;
            }
        }
    }
    // Drain the partial record at end of stream
    if let Some(rest) = assembler.take_remainder() {
        batcher.add(&rest);
    }
    batcher.flush();
    upload_queue(batcher, provisioner, http, group, stream).await;
    tail.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_envelope_shape() {
        let mut batcher = LogBatcher::new("app", "host-app.log", None, None, None);
        batcher.add_at(1_700_000_000_000, "hello", 1_700_000_000_000);
        batcher.flush();
        let batch = batcher.next_batch().unwrap();
        let parsed: Value = serde_json::from_str(&batch).unwrap();
        assert_eq!(parsed["logGroupName"], json!("app"));
        assert_eq!(parsed["logStreamName"], json!("host-app.log"));
        let events = parsed["logEvents"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["timestamp"], json!(1_700_000_000_000i64));
        assert_eq!(events[0]["message"], json!("hello"));
        assert!(parsed.get("sequenceToken").is_none());
    }

    #[test]
    fn test_sequence_token_included_when_set() {
        let mut batcher = LogBatcher::new("app", "s", None, None, None);
        batcher.set_sequence(Some("tok-123".to_string()));
        batcher.add_at(1_700_000_000_000, "x", 1_700_000_000_000);
        batcher.flush();
        let parsed: Value = serde_json::from_str(&batcher.next_batch().unwrap()).unwrap();
        assert_eq!(parsed["sequenceToken"], json!("tok-123"));
    }

    #[test]
    fn test_message_is_json_escaped() {
        let mut batcher = LogBatcher::new("app", "s", None, None, None);
        batcher.add_at(
            1_700_000_000_000,
            "say \"hi\"\nnewline\ttab",
            1_700_000_000_000,
        );
        batcher.flush();
        let parsed: Value = serde_json::from_str(&batcher.next_batch().unwrap()).unwrap();
        assert_eq!(
            parsed["logEvents"][0]["message"],
            json!("say \"hi\"\nnewline\ttab")
        );
    }

    #[test]
    fn test_event_count_boundary() {
        let now = 1_700_000_000_000i64;
        let mut batcher = LogBatcher::new("app", "s", Some(1000), None, None);
        for _ in 0..999 {
            batcher.add_at(now, "e", now);
        }
        assert_eq!(batcher.queue_len(), 0);
        assert_eq!(batcher.events(), 999);
        // The 1000th event closes the batch and lands in the next one
        batcher.add_at(now, "overflow", now);
        assert_eq!(batcher.queue_len(), 1);
        assert_eq!(batcher.events(), 1);
        let first: Value = serde_json::from_str(&batcher.next_batch().unwrap()).unwrap();
        assert_eq!(first["logEvents"].as_array().unwrap().len(), 999);
        batcher.flush();
        let second: Value = serde_json::from_str(&batcher.next_batch().unwrap()).unwrap();
        assert_eq!(
            second["logEvents"][0]["message"],
            json!("overflow")
        );
    }

    #[test]
    fn test_high_water_mark_requests_flush() {
        let now = 1_700_000_000_000i64;
        let mut batcher = LogBatcher::new("app", "s", Some(10), None, None);
        // hiw = 8 events
        for i in 0..7 {
            assert!(!batcher.add_at(now, &format!("e{}", i), now));
        }
        assert!(batcher.add_at(now, "e7", now));
    }

    #[test]
    fn test_timestamp_bounds_enforced() {
        let now = 1_700_000_000_000i64;
        let mut batcher = LogBatcher::new("app", "s", None, None, None);
        // 3 hours in the future: dropped
        batcher.add_at(now + 3 * 3600 * 1000, "future", now);
        assert_eq!(batcher.events(), 0);
        // 15 days in the past: dropped
        batcher.add_at(now - 15 * 86_400_000, "ancient", now);
        assert_eq!(batcher.events(), 0);
        // 1 hour ago: kept
        batcher.add_at(now - 3_600_000, "recent", now);
        assert_eq!(batcher.events(), 1);
    }

    #[test]
    fn test_queue_bounded_at_four_drops_oldest() {
        let now = 1_700_000_000_000i64;
        let mut batcher = LogBatcher::new("app", "s", None, None, None);
        for i in 0..6 {
            batcher.add_at(now, &format!("batch-{}", i), now);
            batcher.flush();
        }
        assert_eq!(batcher.queue_len(), 4);
        assert_eq!(batcher.dropped, 2);
        // The two oldest batches were dropped
        let first: Value = serde_json::from_str(&batcher.next_batch().unwrap()).unwrap();
        assert_eq!(first["logEvents"][0]["message"], json!("batch-2"));
    }

    #[test]
    fn test_linger_is_clamped() {
        let batcher = LogBatcher::new("app", "s", None, None, Some(Duration::from_secs(86_400)));
        assert_eq!(batcher.linger, MAX_LINGER);
        let batcher = LogBatcher::new("app", "s", None, None, None);
        assert_eq!(batcher.linger, DEFAULT_LINGER);
    }
}
