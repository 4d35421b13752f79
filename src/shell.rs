//! Interactive shells into running jobs.
//!
//! A [`Terminal`] lives on the node serving the user; the [`Shell`] it talks
//! to lives on the node running the job. [`WebShell`] forwards input to the
//! job node and [`RemoteTerminal`] carries output back, both as cluster
//! tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterTask, Dispatcher};
use crate::error::{MeshError, Result};
use crate::model::{BuildId, NodeId};
use crate::node::JobManager;

#[async_trait]
pub trait Shell: Send + Sync {
    async fn send_input(&self, input: &str) -> Result<()>;

    async fn resize(&self, rows: u16, cols: u16) -> Result<()>;

    async fn exit(&self) -> Result<()>;
}

/// User-side end of a shell session.
pub trait Terminal: Send + Sync {
    fn session_id(&self) -> &str;

    fn send_output(&self, output: &str);

    fn close(&self);
}

/// Shell whose process runs on another (or the same) node.
pub struct WebShell {
    session_id: String,
    node: NodeId,
    dispatcher: Dispatcher,
}

impl WebShell {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Node running the job behind this shell.
    pub fn node(&self) -> NodeId {
        self.node
    }

    async fn forward(&self, task: ClusterTask) -> Result<()> {
        self.dispatcher
            .run_on_node(self.node, task, &CancellationToken::new())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Shell for WebShell {
    async fn send_input(&self, input: &str) -> Result<()> {
        self.forward(ClusterTask::ShellInput {
            session_id: self.session_id.clone(),
            input: input.to_string(),
        })
        .await
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.forward(ClusterTask::ShellResize {
            session_id: self.session_id.clone(),
            rows,
            cols,
        })
        .await
    }

    async fn exit(&self) -> Result<()> {
        self.forward(ClusterTask::ShellExit {
            session_id: self.session_id.clone(),
        })
        .await
    }
}

/// Job-side stand-in for a terminal on the origin node. Output is delivered
/// in order by a single forwarding task.
pub struct RemoteTerminal {
    session_id: String,
    tx: mpsc::UnboundedSender<(String, bool)>,
}

impl RemoteTerminal {
    pub fn new(session_id: impl Into<String>, origin: NodeId, dispatcher: Dispatcher) -> Self {
        let session_id = session_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, bool)>();
        let forwarded = session_id.clone();
        tokio::spawn(async move {
            while let Some((output, closed)) = rx.recv().await {
                let task = ClusterTask::TerminalOutput {
                    session_id: forwarded.clone(),
                    output,
                    closed,
                };
                if let Err(e) = dispatcher.submit_to_node(origin, task).wait().await {
                    tracing::debug!(session_id = %forwarded, error = %e, "Unable to deliver terminal output");
                }
                if closed {
                    break;
                }
            }
        });
        Self { session_id, tx }
    }

    fn send(&self, output: String, closed: bool) {
        // Forwarder is gone once the session closed
        let _ = self.tx.send((output, closed));
    }
}

impl Terminal for RemoteTerminal {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send_output(&self, output: &str) {
        self.send(output.to_string(), false);
    }

    fn close(&self) {
        self.send(String::new(), true);
    }
}

impl JobManager {
    /// Opens a shell into the running job of `build_id`.
    pub async fn open_shell(
        &self,
        build_id: BuildId,
        terminal: Arc<dyn Terminal>,
        is_admin: bool,
    ) -> Result<WebShell> {
        let ctx = self
            .get_job_context_by_build(build_id)
            .await?
            .ok_or(MeshError::ShellNotReady)?;
        let node = self
            .job_servers
            .get(&ctx.job_token)
            .await?
            .ok_or(MeshError::ShellNotReady)?;
        if !is_admin && !ctx.executor.shell_access_enabled {
            return Err(MeshError::Unauthorized(format!(
                "Shell access is not enabled for executor '{}'",
                ctx.executor.name
            )));
        }

        let session_id = terminal.session_id().to_string();
        self.terminals.lock().insert(session_id.clone(), terminal);
        let task = ClusterTask::OpenShell {
            job_token: ctx.job_token.clone(),
            session_id: session_id.clone(),
            origin: self.local_node(),
        };
        if let Err(e) = self
            .dispatcher
            .run_on_node(node, task, &CancellationToken::new())
            .await
        {
            self.terminals.lock().remove(&session_id);
            return Err(e);
        }
        tracing::info!(build_id = %build_id, session_id = %session_id, node = %node, "Opened job shell");
        Ok(WebShell {
            session_id,
            node,
            dispatcher: self.dispatcher.clone(),
        })
    }

    pub(crate) async fn open_shell_local(&self, job_token: &str, session_id: &str, origin: NodeId) -> Result<()> {
        let runnable = self
            .job_runnables
            .lock()
            .get(job_token)
            .cloned()
            .ok_or(MeshError::ShellNotReady)?;
        let ctx = self
            .get_job_context(job_token, false)
            .await?
            .ok_or(MeshError::ShellNotReady)?;
        let terminal = Arc::new(RemoteTerminal::new(session_id, origin, self.dispatcher.clone()));
        let shell = runnable.open_shell(&ctx, terminal).await?;
        self.shells.lock().insert(session_id.to_string(), shell);
        Ok(())
    }

    pub(crate) fn local_shell(&self, session_id: &str) -> Result<Arc<dyn Shell>> {
        self.shells
            .lock()
            .get(session_id)
            .cloned()
            .ok_or(MeshError::ShellNotReady)
    }

    pub(crate) fn terminal_output(&self, session_id: &str, output: &str, closed: bool) {
        let terminal = if closed {
            self.terminals.lock().remove(session_id)
        } else {
            self.terminals.lock().get(session_id).cloned()
        };
        match terminal {
            Some(terminal) if closed => {
                if !output.is_empty() {
                    terminal.send_output(output);
                }
                terminal.close();
            }
            Some(terminal) => terminal.send_output(output),
            None => tracing::debug!(session_id = %session_id, "Output for unknown terminal dropped"),
        }
    }
}
