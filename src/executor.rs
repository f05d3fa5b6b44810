//! Host-level remote execution.
//!
//! A `RemoteSession` owns one connection to one host and is never shared
//! across workers. The default implementation shells out to `ssh`/`scp`;
//! tests substitute scripted sessions through the same trait.

use crate::channel::Helper;
use crate::context::EnvContext;
use crate::error::{DeployError, Result};
use crate::types::HostRecord;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

pub type OutputSink<'a> = &'a (dyn Fn(&str) + Send + Sync);
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run without streaming; returns the exit code and combined output.
    /// Nonzero exit is not an error here.
    async fn exec_raw(&self, command: &str) -> Result<(i32, String)>;

    /// Run with realtime output delivered line-by-line to `sink`; returns
    /// the exit code.
    async fn exec_streamed(&self, command: &str, sink: OutputSink<'_>) -> Result<i32>;

    /// Copy a local file to the host, reporting `(bytes_so_far, total)`.
    async fn put_file(&self, local: &Path, remote: &str, progress: ProgressFn<'_>) -> Result<()>;
}

/// Scoped acquisition of a session for one host; release happens on drop on
/// every exit path.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, host: &HostRecord, env: &EnvContext) -> Result<Arc<dyn RemoteSession>>;
}

/// `ssh`/`scp` backed session. The deploy env travels as exported shell
/// variables ahead of every command.
pub struct SshSession {
    host: HostRecord,
    env: Vec<(String, String)>,
}

impl SshSession {
    pub fn new(host: HostRecord, env: &EnvContext) -> Self {
        Self {
            host,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.host.username, self.host.hostname)
    }

    fn script_for(&self, command: &str) -> String {
        let mut script = String::new();
        for (k, v) in &self.env {
            let quoted = v.replace('\'', r"'\''");
            script.push_str(&format!("export {k}='{quoted}'; "));
        }
        script.push_str(command);
        script
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-p")
            .arg(self.host.port.to_string())
            .arg(self.target());
        cmd
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec_raw(&self, command: &str) -> Result<(i32, String)> {
        debug!(host = %self.host.name, command, "exec_raw");
        let output = self
            .ssh_command()
            .arg(self.script_for(command))
            .output()
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), text))
    }

    async fn exec_streamed(&self, command: &str, sink: OutputSink<'_>) -> Result<i32> {
        debug!(host = %self.host.name, command, "exec_streamed");
        let mut child = self
            .ssh_command()
            .arg(self.script_for(command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drain_out = async {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                }
            }
        };
        let drain_err = async {
            if let Some(err) = stderr {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                }
            }
        };
        tokio::join!(drain_out, drain_err);

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn put_file(&self, local: &Path, remote: &str, progress: ProgressFn<'_>) -> Result<()> {
        let total = tokio::fs::metadata(local).await?.len();
        progress(0, total);

        let output = Command::new("scp")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-P")
            .arg(self.host.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", self.target(), remote))
            .output()
            .await
            .map_err(|e| DeployError::Transfer {
                host: self.host.name.clone(),
                reason: format!("failed to spawn scp: {e}"),
            })?;
        if !output.status.success() {
            return Err(DeployError::Transfer {
                host: self.host.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        progress(total, total);
        Ok(())
    }
}

pub struct SshSessionFactory;

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(&self, host: &HostRecord, env: &EnvContext) -> Result<Arc<dyn RemoteSession>> {
        Ok(Arc::new(SshSession::new(host.clone(), env)))
    }
}

/// One host's executor: raw probes, streamed commands and file transfer,
/// all reporting under that host's channel key.
pub struct HostExecutor {
    channel: String,
    host: HostRecord,
    session: Arc<dyn RemoteSession>,
    helper: Helper,
}

impl HostExecutor {
    pub fn new(
        helper: Helper,
        channel: impl Into<String>,
        host: HostRecord,
        session: Arc<dyn RemoteSession>,
    ) -> Self {
        Self {
            channel: channel.into(),
            host,
            session,
            helper,
        }
    }

    pub fn host(&self) -> &HostRecord {
        &self.host
    }

    /// Precondition probe; nonzero exit is an answer, not a failure.
    pub async fn probe(&self, command: &str) -> Result<i32> {
        let (code, _) = self.session.exec_raw(command).await?;
        Ok(code)
    }

    /// Run with realtime output streamed to this host's channel; nonzero
    /// exit aborts the host's task.
    pub async fn run(&self, command: &str) -> Result<()> {
        let helper = self.helper.clone();
        let channel = self.channel.clone();
        let sink = move |line: &str| helper.send_info(&channel, format!("{line}\r\n"));
        let code = self.session.exec_streamed(command, &sink).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(DeployError::RemoteExecution {
                host: self.host.name.clone(),
                command: command.to_string(),
                code,
            })
        }
    }

    /// Run without streaming; on nonzero exit the output is written to the
    /// channel and the host's task aborts.
    pub async fn run_quiet(&self, command: &str) -> Result<()> {
        let (code, output) = self.session.exec_raw(command).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(self
                .helper
                .send_error(&self.channel, format!("exit code: {code}, {output}")))
        }
    }

    /// Copy a file with progress mapped to percentage step updates.
    pub async fn transfer(&self, local: &Path, remote: &str) -> Result<()> {
        let progress = self.helper.progress_callback(self.channel.clone());
        self.session.put_file(local, remote, &progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LogHub;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted session: maps command substrings to (exit code, output).
    pub(crate) struct ScriptedSession {
        pub responses: Mutex<HashMap<String, (i32, String)>>,
        pub default_code: i32,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn exec_raw(&self, command: &str) -> Result<(i32, String)> {
            let responses = self.responses.lock().unwrap();
            for (needle, reply) in responses.iter() {
                if command.contains(needle.as_str()) {
                    return Ok(reply.clone());
                }
            }
            Ok((self.default_code, String::new()))
        }

        async fn exec_streamed(&self, command: &str, sink: OutputSink<'_>) -> Result<i32> {
            let (code, output) = self.exec_raw(command).await?;
            for line in output.lines() {
                sink(line);
            }
            Ok(code)
        }

        async fn put_file(
            &self,
            _local: &Path,
            _remote: &str,
            progress: ProgressFn<'_>,
        ) -> Result<()> {
            progress(512, 1024);
            progress(1024, 1024);
            Ok(())
        }
    }

    fn host() -> HostRecord {
        HostRecord {
            id: 7,
            name: "web-1".into(),
            hostname: "10.0.0.7".into(),
            port: 22,
            username: "deploy".into(),
        }
    }

    #[tokio::test]
    async fn probe_reports_exit_code_without_failing() {
        let hub = LogHub::new();
        let helper = Helper::new(hub, "request:1");
        let session = Arc::new(ScriptedSession {
            responses: Mutex::new(HashMap::from([("[ -e /www ]".to_string(), (1, String::new()))])),
            default_code: 0,
        });
        let exec = HostExecutor::new(helper, "7", host(), session);
        assert_eq!(exec.probe("[ -e /www ] && [ ! -L /www ]").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_streams_output_and_raises_on_nonzero() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let session = Arc::new(ScriptedSession {
            responses: Mutex::new(HashMap::from([(
                "migrate".to_string(),
                (1, "applying...\nfailed".to_string()),
            )])),
            default_code: 0,
        });
        let exec = HostExecutor::new(helper, "7", host(), session);

        exec.run("echo ok").await.unwrap();
        let err = exec.run("./migrate").await.unwrap_err();
        match err {
            DeployError::RemoteExecution { host, code, .. } => {
                assert_eq!(host, "web-1");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        let view = hub.assemble("request:1", "7").unwrap();
        assert!(view.data.contains("applying...\r\n"));
        assert!(view.data.contains("failed\r\n"));
    }

    #[tokio::test]
    async fn run_quiet_logs_output_only_on_failure() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let session = Arc::new(ScriptedSession {
            responses: Mutex::new(HashMap::from([(
                "xargs rm -rf".to_string(),
                (2, "permission denied".to_string()),
            )])),
            default_code: 0,
        });
        let exec = HostExecutor::new(helper, "7", host(), session);

        exec.run_quiet("ln -sfn /repo/1_2024 /www").await.unwrap();
        assert!(hub.assemble("request:1", "7").is_none());

        let err = exec.run_quiet("cd /repo && ls | xargs rm -rf").await.unwrap_err();
        assert!(err.is_reported());
        assert!(hub
            .assemble("request:1", "7")
            .unwrap()
            .data
            .contains("permission denied"));
    }

    #[tokio::test]
    async fn transfer_reports_percentage_steps() {
        let hub = LogHub::new();
        let helper = Helper::new(hub.clone(), "request:1");
        let session = Arc::new(ScriptedSession {
            responses: Mutex::new(HashMap::new()),
            default_code: 0,
        });
        let exec = HostExecutor::new(helper, "7", host(), session);
        exec.transfer(Path::new("/tmp/x.tar.gz"), "/repo/x.tar.gz")
            .await
            .unwrap();
        let view = hub.assemble("request:1", "7").unwrap();
        assert_eq!(view.step, 100);
        assert!(view.data.contains("50%"));
    }
}
