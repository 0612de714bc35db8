//! Ownership of one pseudo-terminal master and its child process.
//!
//! Reads happen on a dedicated OS thread (PTY reads are blocking I/O) that
//! feeds an async channel; EOF or EIO on the master means the child closed
//! its side. Writes may be issued from any task and are serialized through a
//! mutex. The child leads its own session and process group with the PTY
//! slave as controlling terminal, so it is never tied to the lifetime of the
//! RPC that spawned it, and teardown signals reach every process it forked.

use crate::adapter::CommandSpec;
use crate::error::{CoreError, Result};
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Invoked exactly once per handle with (exit_code, signal).
pub type ExitCallback = Box<dyn FnOnce(Option<i32>, Option<i32>) + Send>;

const READ_CHUNK: usize = 16 * 1024;
/// Buffer between the reader thread and the session's reader task.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Acquire a mutex, recovering from poisoned state.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A spawned child on its pseudo-terminal.
pub struct PtyProcess {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    exited: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Creates the master/slave pair, spawns the child and starts the reader
    /// thread plus the exit watcher. Returns the handle and the output
    /// channel; the channel closes when the child closes its terminal.
    pub fn spawn(
        spec: &CommandSpec,
        rows: u16,
        cols: u16,
        on_exit: ExitCallback,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Bytes>)> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Resource(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(spec.binary.as_os_str());
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        // The child inherits the adapter-assembled environment, nothing ambient.
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| CoreError::Resource(format!("spawn {} failed: {e}", spec.binary.display())))?;
        let pid = child.process_id();
        // The slave stays with the child; holding it here would mask EOF.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CoreError::Resource(format!("clone pty reader failed: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CoreError::Resource(format!("take pty writer failed: {e}")))?;

        let (tx, rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name(format!("pty-read-{}", pid.unwrap_or(0)))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        // EOF or EIO both mean the child closed its terminal.
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|e| CoreError::Resource(format!("spawn pty reader thread failed: {e}")))?;

        let child = Arc::new(Mutex::new(Some(child)));
        let exited = Arc::new(AtomicBool::new(false));
        Self::watch_exit(child.clone(), exited.clone(), on_exit);

        let process = Arc::new(PtyProcess {
            pid,
            writer: Mutex::new(writer),
            master: Mutex::new(Some(pair.master)),
            child,
            exited,
        });
        Ok((process, rx))
    }

    /// Polls the child until it is gone, then fires the callback exactly once.
    fn watch_exit(
        child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
        exited: Arc<AtomicBool>,
        on_exit: ExitCallback,
    ) {
        tokio::spawn(async move {
            let status = loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                let polled = {
                    let mut guard = lock(&child);
                    match guard.as_mut() {
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                guard.take();
                                Some(Some(status))
                            }
                            Ok(None) => None,
                            Err(error) => {
                                tracing::warn!(?error, "pty child wait failed");
                                guard.take();
                                Some(None)
                            }
                        },
                        None => Some(None),
                    }
                };
                if let Some(status) = polled {
                    break status;
                }
            };
            exited.store(true, Ordering::SeqCst);
            let (code, signal) = match status {
                Some(status) => split_exit_code(status.exit_code() as i32),
                None => (None, None),
            };
            on_exit(code, signal);
        });
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Forwards user keystrokes. Serialized internally; safe from any task.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Issues the window-change ioctl. Safe from any component.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = lock(&self.master);
        let Some(master) = master.as_ref() else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CoreError::Resource(format!("pty resize failed: {e}")))
    }

    /// SIGTERM to the child's process group, then a group-wide SIGKILL after
    /// the grace window. Helper processes the game forked die with it. Closes
    /// the master so the reader thread unblocks. Idempotent.
    pub async fn close(&self, grace: Duration) {
        if !self.exited.load(Ordering::SeqCst) {
            self.signal_group(SIGTERM);
            let deadline = tokio::time::Instant::now() + grace;
            while !self.exited.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if !self.exited.load(Ordering::SeqCst) {
                tracing::warn!(pid = ?self.pid, "pty child survived grace window, killing");
                self.signal_group(SIGKILL);
                let mut guard = lock(&self.child);
                if let Some(child) = guard.as_mut() {
                    let _ = child.kill();
                }
            }
        }
        // Wait for the watcher to observe the exit so the callback has fired
        // before close returns.
        while !self.exited.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        lock(&self.master).take();
    }

    /// The child is the leader of its own process group, so the negative pid
    /// reaches every process the game forked, not just the leader.
    #[cfg(unix)]
    fn signal_group(&self, signal: i32) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: i32) {}
}

/// Shells report signal deaths as 128 + signal number.
fn split_exit_code(code: i32) -> (Option<i32>, Option<i32>) {
    if code > 128 {
        (None, Some(code - 128))
    } else {
        (Some(code), None)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell_spec(script: &str, cwd: &std::path::Path) -> CommandSpec {
        CommandSpec {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_owned(), script.to_owned()],
            env: vec![("TERM".to_owned(), "dumb".to_owned())],
            cwd: cwd.to_path_buf(),
        }
    }

    async fn collect_until(
        rx: &mut mpsc::Receiver<Bytes>,
        needle: &[u8],
        patience: Duration,
    ) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + patience;
        while !crate::stream::contains_bytes(&collected, needle) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                _ => break,
            }
        }
        collected
    }

    #[tokio::test]
    async fn spawn_echo_write_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let spec = shell_spec("echo ready; cat", dir.path());
        let (pty, mut rx) = PtyProcess::spawn(
            &spec,
            24,
            80,
            Box::new(move |code, signal| {
                let _ = exit_tx.send((code, signal));
            }),
        )
        .unwrap();

        assert!(pty.pid().is_some());
        let output = collect_until(&mut rx, b"ready", Duration::from_secs(5)).await;
        assert!(
            crate::stream::contains_bytes(&output, b"ready"),
            "missing banner in {output:?}"
        );

        pty.write(b"ping\n").unwrap();
        let echoed = collect_until(&mut rx, b"ping", Duration::from_secs(5)).await;
        assert!(crate::stream::contains_bytes(&echoed, b"ping"));

        pty.resize(132, 43).unwrap();

        pty.close(Duration::from_secs(2)).await;
        assert!(!pty.is_running());
        let (_code, _signal) = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("exit callback not fired")
            .unwrap();
    }

    #[tokio::test]
    async fn natural_exit_fires_callback_and_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let spec = shell_spec("exit 3", dir.path());
        let (_pty, mut rx) = PtyProcess::spawn(
            &spec,
            24,
            80,
            Box::new(move |code, signal| {
                let _ = exit_tx.send((code, signal));
            }),
        )
        .unwrap();

        let (code, signal) = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("exit callback not fired")
            .unwrap();
        assert_eq!(code, Some(3));
        assert_eq!(signal, None);

        // Channel drains to closure once the child is gone.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
