//! Child-process sandbox contexts speaking newline-delimited JSON over stdio.
//!
//! The first line written to the child's stdin is the launch record
//! `{bootstrapDocument, sandboxFlags, instanceId, contextId}`; every later line
//! in either direction is one envelope.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::context::{
    ContextId, SandboxContext, SandboxContextLauncher, SandboxContextSpec, SandboxMessageBus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Launch settings for [`ProcessSandboxLauncher`].
pub struct ProcessSandboxConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Names of host environment variables passed through to the child. The
    /// child environment is otherwise empty.
    pub env_allowlist: Vec<String>,
}

impl ProcessSandboxConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_allowlist: Vec::new(),
        }
    }
}

pub struct ProcessSandboxLauncher {
    config: ProcessSandboxConfig,
}

impl ProcessSandboxLauncher {
    pub fn new(config: ProcessSandboxConfig) -> Result<Self> {
        if config.program.as_os_str().is_empty() {
            return Err(anyhow!("sandbox program path must not be empty"));
        }
        if config
            .env_allowlist
            .iter()
            .any(|name| name.trim().is_empty() || name.contains('='))
        {
            return Err(anyhow!(
                "sandbox env_allowlist entries must be non-empty variable names"
            ));
        }
        Ok(Self { config })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args);
        command.env_clear();
        for name in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        command.kill_on_drop(true);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());
        command
    }
}

struct ProcessSandboxContext {
    id: ContextId,
    outbound: mpsc::UnboundedSender<Value>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

#[async_trait]
impl SandboxContext for ProcessSandboxContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post_message(&self, message: Value) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(anyhow!("sandbox process {} was torn down", self.id));
        }
        self.outbound
            .send(message)
            .map_err(|_| anyhow!("sandbox process {} stdin is closed", self.id))
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(error) = child.kill().await {
                debug!(context_id = %self.id, %error, "sandbox process already exited");
            }
        }
    }
}

#[async_trait]
impl SandboxContextLauncher for ProcessSandboxLauncher {
    async fn launch(
        &self,
        spec: SandboxContextSpec,
        bus: SandboxMessageBus,
    ) -> Result<Arc<dyn SandboxContext>> {
        let mut child = self.command().spawn().with_context(|| {
            format!(
                "failed to spawn sandbox process {}",
                self.config.program.display()
            )
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("sandbox process stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("sandbox process stdout was not captured"))?;

        let launch_record = json!({
            "bootstrapDocument": spec.bootstrap_document,
            "sandboxFlags": spec.sandbox_flags,
            "instanceId": spec.bootstrap.instance_id,
            "contextId": spec.context_id.to_string(),
        });
        write_json_line(&mut stdin, &launch_record)
            .await
            .context("failed to send sandbox launch record")?;

        let context_id = spec.context_id;
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(error) = write_json_line(&mut stdin, &message).await {
                    warn!(context_id = %context_id, %error, "sandbox process write failed");
                    break;
                }
            }
        });
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match stdout.read_until(b'\n', &mut line).await {
                    Ok(0) => {
                        debug!(context_id = %context_id, "sandbox process closed stdout");
                        break;
                    }
                    Ok(_) => {
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        match serde_json::from_slice::<Value>(&line) {
                            Ok(data) => bus.post(context_id, data),
                            Err(error) => debug!(
                                context_id = %context_id,
                                %error,
                                "dropping undecodable sandbox process line"
                            ),
                        }
                    }
                    Err(error) => {
                        warn!(context_id = %context_id, %error, "sandbox process read failed");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(ProcessSandboxContext {
            id: context_id,
            outbound,
            child: tokio::sync::Mutex::new(Some(child)),
            tasks: Mutex::new(vec![writer, reader]),
            torn_down: AtomicBool::new(false),
        }))
    }
}

async fn write_json_line(stdin: &mut tokio::process::ChildStdin, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await?;
    Ok(())
}
