use std::{future::Future, path::Path, process::Stdio, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
};

use crate::launch::LaunchSpec;

const ATTACHED_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TERMINATE_WAIT: Duration = Duration::from_secs(10);

/// `None` while running, then `Some(exit code)`; the code is `None` when killed by a
/// signal or when the process was not ours to reap.
type ExitState = Option<Option<i32>>;

/// A running engine server, either spawned here or adopted after a supervisor restart.
#[derive(Debug)]
pub struct EngineProcess {
    pid: u32,
    exit: watch::Receiver<ExitState>,
}

pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

impl EngineProcess {
    /// Starts the server in its own session so it outlives the supervisor. Output is
    /// forwarded to tracing when `capture_output` is set.
    pub fn spawn(spec: &LaunchSpec, cwd: &Path, capture_output: bool) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&spec.exec);
        cmd.args(&spec.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} (cwd {})", spec.exec.display(), cwd.display()))?;
        let pid = child.id().context("spawned engine has no pid")?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "engine", pid, stream = "stdout", "{line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "engine", pid, stream = "stderr", "{line}");
                }
            });
        }

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "waiting on engine process failed");
                    None
                }
            };
            tracing::info!(pid, ?code, "engine process exited");
            tx.send_replace(Some(code));
        });

        Ok(Self { pid, exit: rx })
    }

    /// Adopts a process started by an earlier supervisor. Exit is detected by polling.
    pub fn attach(pid: u32) -> anyhow::Result<Self> {
        if !process_exists(pid) {
            anyhow::bail!("process {pid} does not exist");
        }

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ATTACHED_POLL_INTERVAL).await;
                if tx.is_closed() {
                    return;
                }
                if !process_exists(pid) {
                    tracing::info!(pid, "attached engine process exited");
                    tx.send_replace(Some(None));
                    return;
                }
            }
        });

        Ok(Self { pid, exit: rx })
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves when the process exits, with its exit code when known.
    pub async fn lifetime(&self) -> Option<i32> {
        self.wait_exit().await
    }

    /// Like [`lifetime`](Self::lifetime), but not tied to `self`.
    pub fn wait_exit(&self) -> impl Future<Output = Option<i32>> + Send + 'static {
        let mut rx = self.exit.clone();
        async move {
            match rx.wait_for(|s| s.is_some()).await {
                Ok(state) => (*state).flatten(),
                Err(_) => None,
            }
        }
    }

    /// Sends SIGKILL to the process group (the whole server), falling back to the pid
    /// alone. Does not wait.
    pub fn kill_now(&self) {
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        if let Ok(pid) = i32::try_from(self.pid) {
            unsafe {
                if libc::kill(-pid, libc::SIGKILL) == -1 {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    pub async fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        self.kill_now();

        if tokio::time::timeout(TERMINATE_WAIT, self.lifetime())
            .await
            .is_err()
        {
            tracing::warn!(pid = self.pid, "engine process did not exit after SIGKILL");
        }
    }
}
