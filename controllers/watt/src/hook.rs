//! Watch hooks.
//!
//! A watch hook receives the current snapshot and answers with the watch set
//! the agent should be running. The default implementation runs shell
//! commands: the snapshot goes to stdin, a `WatchSet` JSON document is read
//! from stdout, stderr is logged line by line. A failing or unparseable hook
//! yields an empty watch set.

use anyhow::Context;
use std::fmt::Debug;
use std::process::Stdio;
use supervisor::Process;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use watt_api::WatchSet;

#[async_trait::async_trait]
pub trait WatchHook: Send + Sync + Debug {
    /// Watch set for `snapshot`. Never fails; problems yield an empty set.
    async fn watches(&self, p: &Process, snapshot: &str) -> WatchSet;
}

/// Runs each configured command through `sh -c` and concatenates their answers.
#[derive(Debug, Clone, Default)]
pub struct ExecWatchHook {
    commands: Vec<String>,
}

impl ExecWatchHook {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    async fn invoke(&self, p: &Process, command: &str, snapshot: &str) -> anyhow::Result<WatchSet> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting watch hook {command:?}"))?;

        let mut stdin = child.stdin.take().context("watch hook stdin")?;
        let mut stdout = child.stdout.take().context("watch hook stdout")?;
        let stderr = child.stderr.take().context("watch hook stderr")?;
        let input = snapshot.as_bytes().to_vec();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let run = async move {
            let write = async move {
                // Hooks are free to ignore stdin.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("watch hook did not read the snapshot: {e}");
                }
                drop(stdin);
            };
            let read = async move {
                let mut output = Vec::new();
                stdout.read_to_end(&mut output).await.map(|_| output)
            };
            let log = async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(hook = %command, "{line}");
                }
            };

            let io = async { tokio::join!(write, read, log).1 };
            let output = tokio::select! {
                output = io => output.context("reading watch hook output")?,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    anyhow::bail!("watch hook {command:?} killed on shutdown");
                }
            };

            let status = child.wait().await.context("waiting for watch hook")?;
            if !status.success() {
                anyhow::bail!("watch hook {command:?} exited with {status}");
            }
            decode(&output).with_context(|| format!("decoding output of watch hook {command:?}"))
        };

        p.do_clean(run, async move {
            let _ = kill_tx.send(());
            Ok(())
        })
        .await
    }
}

/// Decodes the first JSON document on a hook's stdout.
fn decode(output: &[u8]) -> anyhow::Result<WatchSet> {
    let mut documents = serde_json::Deserializer::from_slice(output).into_iter::<WatchSet>();
    match documents.next() {
        Some(Ok(watches)) => Ok(watches),
        Some(Err(e)) => {
            for line in String::from_utf8_lossy(output).lines() {
                debug!("watch hook stdout: {line}");
            }
            Err(e.into())
        }
        None => anyhow::bail!("no output"),
    }
}

#[async_trait::async_trait]
impl WatchHook for ExecWatchHook {
    async fn watches(&self, p: &Process, snapshot: &str) -> WatchSet {
        let mut combined = WatchSet::default();
        for command in &self.commands {
            match self.invoke(p, command, snapshot).await {
                Ok(watches) => combined.extend(watches),
                Err(e) => warn!(hook = %command, "watch hook failed, using an empty watch set: {e:#}"),
            }
        }
        combined
    }
}
