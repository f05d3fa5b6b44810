//! Per-request progress/log event streams.
//!
//! Every dispatch appends `LogEvent`s to a stream keyed by request id (or
//! build-version id for standalone builds). Within a stream, events carry a
//! channel key identifying the logical sub-stream: `local`, `image`, or a
//! host id. Appends are atomic per event and ordering within one channel
//! key is preserved; consumers poll by offset and treat exhaustion as "no
//! data yet".

use crate::context::EnvContext;
use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tracing::debug;

pub const LOCAL_KEY: &str = "local";
pub const IMAGE_KEY: &str = "image";

const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Default)]
struct Stream {
    /// Offset of the first retained event.
    base: usize,
    events: VecDeque<LogEvent>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
    finished: bool,
}

/// Process-scoped log store, passed explicitly into every component that
/// appends to it.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<Mutex<HashMap<String, Stream>>>,
    retention: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, stream_key: &str, event: LogEvent) {
        let mut streams = self.lock();
        let stream = streams.entry(stream_key.to_string()).or_default();
        stream.events.push_back(event);
        while stream.events.len() > self.retention {
            stream.events.pop_front();
            stream.base += 1;
        }
    }

    /// Poll a stream from `offset`. `next_offset` is where the next poll
    /// should resume.
    pub fn read_from(&self, stream_key: &str, offset: usize) -> LogRead {
        let streams = self.lock();
        match streams.get(stream_key) {
            Some(stream) => {
                let start = offset.max(stream.base);
                let events: Vec<LogEvent> = stream
                    .events
                    .iter()
                    .skip(start - stream.base)
                    .cloned()
                    .collect();
                LogRead {
                    next_offset: start + events.len(),
                    events,
                    finished: stream.finished,
                }
            }
            None => LogRead {
                events: Vec::new(),
                next_offset: offset,
                finished: false,
            },
        }
    }

    /// Reassemble one channel's text from the retained events. `None` means
    /// nothing is retained for that channel, not an error.
    pub fn assemble(&self, stream_key: &str, channel_key: &str) -> Option<ChannelView> {
        let read = self.read_from(stream_key, 0);
        let mut view = ChannelView::default();
        let mut seen = false;
        for event in read.events.iter().filter(|e| e.key == channel_key) {
            seen = true;
            if let Some(data) = &event.data {
                view.data.push_str(data);
            }
            if let Some(step) = event.step {
                view.step = step;
            }
            if let Some(status) = &event.status {
                view.status = Some(status.clone());
            }
        }
        seen.then_some(view)
    }
}

#[derive(Debug, Clone)]
pub struct LogRead {
    pub events: Vec<LogEvent>,
    pub next_offset: usize,
    pub finished: bool,
}

/// Text reassembled for one channel key.
#[derive(Debug, Clone, Default)]
pub struct ChannelView {
    pub data: String,
    pub step: u32,
    pub status: Option<String>,
}

/// Append handle bound to one stream; the writing side used by executors,
/// builders and strategies.
#[derive(Clone)]
pub struct Helper {
    hub: LogHub,
    key: String,
}

impl Helper {
    pub fn new(hub: LogHub, stream_key: impl Into<String>) -> Self {
        Self {
            hub,
            key: stream_key.into(),
        }
    }

    /// Retry attach: keeps the stream but drops retained events for the
    /// hosts being retried, so their consoles start clean.
    pub fn for_retry(hub: LogHub, stream_key: impl Into<String>, retry_host_ids: &[i64]) -> Self {
        let key = stream_key.into();
        let drop_keys: HashSet<String> = retry_host_ids.iter().map(|h| h.to_string()).collect();
        {
            let mut streams = hub.lock();
            if let Some(stream) = streams.get_mut(&key) {
                stream.events.retain(|e| !drop_keys.contains(&e.key));
                stream.finished = false;
            }
        }
        Self { hub, key }
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn stream_key(&self) -> &str {
        &self.key
    }

    pub fn send_info(&self, channel: &str, data: impl Into<String>) {
        self.hub.append(
            &self.key,
            LogEvent {
                key: channel.to_string(),
                data: Some(data.into()),
                step: None,
                status: None,
            },
        );
    }

    pub fn send_step(&self, channel: &str, step: u32, data: impl Into<String>) {
        self.hub.append(
            &self.key,
            LogEvent {
                key: channel.to_string(),
                data: Some(data.into()),
                step: Some(step),
                status: None,
            },
        );
    }

    /// Append an error chunk and hand back the abort error the caller
    /// returns with `?`. The returned error is marked already-reported.
    #[must_use = "send_error only logs; return the error to abort the stage"]
    pub fn send_error(&self, channel: &str, data: impl Into<String>) -> DeployError {
        let data = data.into();
        self.hub.append(
            &self.key,
            LogEvent {
                key: channel.to_string(),
                data: Some(format!("{data}\r\n")),
                step: None,
                status: Some("error".to_string()),
            },
        );
        DeployError::Aborted(data)
    }

    /// Transfer progress hook, mapped to percentage step updates.
    pub fn progress_callback(&self, channel: impl Into<String>) -> impl Fn(u64, u64) + Send + Sync {
        let helper = self.clone();
        let channel = channel.into();
        move |done, total| {
            let percent = if total == 0 {
                100
            } else {
                ((done * 100) / total) as u32
            };
            helper.send_step(&channel, percent.min(100), format!("\r  {percent}% "));
        }
    }

    /// Run a local shell command, streaming its combined output to the
    /// `local` channel. Nonzero exit aborts with the output already logged.
    pub async fn local(&self, command: &str, env: Option<&EnvContext>) -> Result<()> {
        debug!(command, "running local command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = env {
            for (k, v) in env.iter() {
                cmd.env(k, v);
            }
        }
        let output = cmd.output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !text.is_empty() {
            self.send_info(LOCAL_KEY, text.clone());
        }
        if output.status.success() {
            Ok(())
        } else {
            Err(self.send_error(
                LOCAL_KEY,
                format!("local command failed: {command}\r\n{text}"),
            ))
        }
    }

    /// Filter-rule list: split on `sep`, trim, drop empties and `#`
    /// comments, render each entry through the env.
    pub fn parse_filter_rule(&self, rule: &str, sep: &str, env: &EnvContext) -> Vec<String> {
        rule.split(sep)
            .flat_map(|chunk| chunk.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| env.render_or_empty(line))
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Register a cleanup action executed once at `clear`, regardless of
    /// outcome.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut streams = self.hub.lock();
        let stream = streams.entry(self.key.clone()).or_default();
        stream.callbacks.push(Box::new(callback));
    }

    /// Finalize the stream and run registered cleanup callbacks.
    pub fn clear(&self) {
        let callbacks = {
            let mut streams = self.hub.lock();
            let stream = streams.entry(self.key.clone()).or_default();
            stream.finished = true;
            std::mem::take(&mut stream.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn appends_are_readable_by_offset() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        helper.send_info("7", "ready\r\n");
        helper.send_step("7", 3, "deploying");

        let read = hub.read_from("request:1", 0);
        assert_eq!(read.events.len(), 2);
        assert_eq!(read.next_offset, 2);
        assert!(!read.finished);

        let rest = hub.read_from("request:1", read.next_offset);
        assert!(rest.events.is_empty());
        assert_eq!(rest.next_offset, 2);
    }

    #[test]
    fn ordering_within_one_channel_is_preserved() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        for i in 0..5 {
            helper.send_info("9", format!("{i};"));
        }
        let view = hub.assemble("request:1", "9").unwrap();
        assert_eq!(view.data, "0;1;2;3;4;");
    }

    #[test]
    fn retention_drops_oldest_events() {
        let hub = LogHub::with_retention(3);
        let helper = Helper::new(hub.clone(), "request:1");
        for i in 0..5 {
            helper.send_info(LOCAL_KEY, format!("{i}"));
        }
        let read = hub.read_from("request:1", 0);
        assert_eq!(read.events.len(), 3);
        assert_eq!(read.events[0].data.as_deref(), Some("2"));
        assert_eq!(read.next_offset, 5);
    }

    #[test]
    fn exhausted_stream_is_no_data_not_error() {
        let hub = LogHub::new();
        assert!(hub.assemble("request:404", LOCAL_KEY).is_none());
        let read = hub.read_from("request:404", 0);
        assert!(read.events.is_empty());
    }

    #[test]
    fn send_error_marks_reported_and_sets_status() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let err = helper.send_error("3", "no such host");
        assert!(err.is_reported());
        let view = hub.assemble("request:1", "3").unwrap();
        assert_eq!(view.status.as_deref(), Some("error"));
        assert!(view.data.contains("no such host"));
    }

    #[test]
    fn callbacks_run_once_at_clear() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        helper.add_callback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        helper.clear();
        helper.clear();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hub.read_from("request:1", 0).finished);
    }

    #[test]
    fn retry_attach_drops_only_retried_hosts() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        helper.send_info("1", "host one ok\r\n");
        helper.send_info("2", "host two failed\r\n");
        helper.send_info(LOCAL_KEY, "build log\r\n");

        let retry = Helper::for_retry(hub.clone(), "request:1", &[2]);
        retry.send_info("2", "retrying\r\n");

        assert!(hub.assemble("request:1", "1").is_some());
        assert_eq!(hub.assemble("request:1", "2").unwrap().data, "retrying\r\n");
        assert!(hub.assemble("request:1", LOCAL_KEY).is_some());
    }

    #[test]
    fn filter_rules_are_trimmed_rendered_and_commented() {
        let hub = LogHub::new();
        let helper = Helper::new(hub, "request:1");
        let mut env = EnvContext::new();
        env.set("SPUG_ENV_KEY", "prod");
        let rules = helper.parse_filter_rule(" static ,# skipped ,logs/{{SPUG_ENV_KEY}}", ",", &env);
        assert_eq!(rules, vec!["static".to_string(), "logs/prod".to_string()]);
    }

    #[tokio::test]
    async fn local_command_streams_and_aborts_on_failure() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        helper.local("echo hello", None).await.unwrap();
        assert!(hub.assemble("request:1", LOCAL_KEY).unwrap().data.contains("hello"));

        let err = helper.local("exit 3", None).await.unwrap_err();
        assert!(err.is_reported());
        let view = hub.assemble("request:1", LOCAL_KEY).unwrap();
        assert_eq!(view.status.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn local_command_sees_the_env() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let mut env = EnvContext::new();
        env.set("SPUG_VERSION", "v9");
        helper.local("echo $SPUG_VERSION", Some(&env)).await.unwrap();
        assert!(hub.assemble("request:1", LOCAL_KEY).unwrap().data.contains("v9"));
    }
}
