//! Local PTY transport
//!
//! Spawns the configured shell under a pseudo-terminal (portable-pty).
//! Output is read on a blocking thread and pushed into the bounded output
//! queue; when the queue is full the thread blocks, which stops reading from
//! the PTY. Input goes through a blocking write pump so callers never block
//! the runtime on a slow PTY.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::{TransportError, TransportEvent};
use crate::config::LocalShellConfig;

const READ_BUFFER_SIZE: usize = 8192;
const INPUT_QUEUE: usize = 256;

pub struct LocalPty {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl LocalPty {
    /// Spawn the shell and start the read thread and write pump
    pub fn spawn(
        shell: &LocalShellConfig,
        cols: u16,
        rows: u16,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::Io(format!("failed to open pty: {}", e)))?;

        let (program, args) = resolve_shell(shell);
        let mut cmd = CommandBuilder::new(&program);
        for arg in &args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &shell.cwd {
            cmd.cwd(cwd);
        } else if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::Io(format!("failed to spawn {}: {}", program, e)))?;
        // The slave end belongs to the child now; keeping it open would hide EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        info!("Spawned local shell {} (pid {:?}, {}x{})", program, pid, cols, rows);

        let child = Arc::new(Mutex::new(child));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        tokio::task::spawn_blocking({
            let child = child.clone();
            move || read_pump(reader, out_tx, child)
        });
        tokio::task::spawn_blocking(move || write_pump(writer, input_rx));

        Ok((
            Self {
                master: Arc::new(Mutex::new(pair.master)),
                child,
                input_tx: Mutex::new(Some(input_tx)),
                pid,
                closed: AtomicBool::new(false),
            },
            out_rx,
        ))
    }

    pub async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        let tx = self.input_tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::Io(format!("resize failed: {}", e)))
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input_tx.lock().take();

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGHUP);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = killpg(group, Signal::SIGKILL);
        }

        if let Err(e) = self.child.lock().kill() {
            debug!("Local shell already gone: {}", e);
        }
        info!("Closed local shell (pid {:?})", self.pid);
    }
}

impl Drop for LocalPty {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = self.child.lock().kill();
    }
}

/// `$SHELL --login`, or `/bin/bash --login` when unset
fn resolve_shell(shell: &LocalShellConfig) -> (String, Vec<String>) {
    match &shell.program {
        Some(program) => (program.clone(), shell.args.clone()),
        None => {
            let program = std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/bash".to_string());
            let args = if shell.args.is_empty() {
                vec!["--login".to_string()]
            } else {
                shell.args.clone()
            };
            (program, args)
        }
    }
}

fn read_pump(
    mut reader: Box<dyn Read + Send>,
    out_tx: mpsc::Sender<TransportEvent>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let boundary = find_utf8_safe_boundary(&pending);
                if boundary == 0 {
                    continue;
                }
                let chunk = Bytes::copy_from_slice(&pending[..boundary]);
                pending.drain(..boundary);
                if out_tx.blocking_send(TransportEvent::Data(chunk)).is_err() {
                    debug!("Local shell output receiver dropped");
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a PTY whose child has exited.
            Err(e) => {
                debug!("Local shell read ended: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = out_tx.blocking_send(TransportEvent::Data(Bytes::from(pending)));
    }

    let code = match child.lock().try_wait() {
        Ok(Some(status)) => Some(status.exit_code()),
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to collect local shell status: {}", e);
            None
        }
    };
    let _ = out_tx.blocking_send(TransportEvent::Exited(code));
}

fn write_pump(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!("Local shell write failed: {}", e);
            break;
        }
    }
}

/// Length of the longest prefix of `buf` that does not end inside a UTF-8
/// sequence. Invalid bytes count as boundaries so garbage never stalls output.
fn find_utf8_safe_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    let mut i = len;

    while i > 0 && i > len.saturating_sub(4) {
        let byte = buf[i - 1];

        if byte & 0x80 == 0 {
            return i;
        }
        if byte & 0xC0 == 0x80 {
            i -= 1;
            continue;
        }

        let char_len = if byte & 0xF8 == 0xF0 {
            4
        } else if byte & 0xF0 == 0xE0 {
            3
        } else if byte & 0xE0 == 0xC0 {
            2
        } else {
            return len;
        };

        let start = i - 1;
        return if len - start >= char_len { len } else { start };
    }

    // Only continuation bytes in the window: not valid UTF-8, pass it through.
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_ascii() {
        assert_eq!(find_utf8_safe_boundary(b"hello"), 5);
        assert_eq!(find_utf8_safe_boundary(b""), 0);
    }

    #[test]
    fn test_boundary_complete_multibyte() {
        let s = "ls 中文".as_bytes();
        assert_eq!(find_utf8_safe_boundary(s), s.len());

        let emoji = "ok 🚀".as_bytes();
        assert_eq!(find_utf8_safe_boundary(emoji), emoji.len());
    }

    #[test]
    fn test_boundary_cuts_incomplete_sequence() {
        let full = "a中".as_bytes(); // 'a' + 3-byte char
        assert_eq!(find_utf8_safe_boundary(&full[..2]), 1);
        assert_eq!(find_utf8_safe_boundary(&full[..3]), 1);

        let emoji = "x🚀".as_bytes(); // 'x' + 4-byte char
        assert_eq!(find_utf8_safe_boundary(&emoji[..4]), 1);
    }

    #[test]
    fn test_boundary_passes_invalid_bytes() {
        assert_eq!(find_utf8_safe_boundary(&[0x80, 0x80, 0x80, 0x80, 0x80]), 5);
        assert_eq!(find_utf8_safe_boundary(&[b'a', 0xFF]), 2);
    }

    #[test]
    fn test_resolve_shell_defaults_to_login() {
        let (_, args) = resolve_shell(&LocalShellConfig::default());
        assert_eq!(args, vec!["--login".to_string()]);

        let custom = LocalShellConfig {
            program: Some("/bin/sh".into()),
            ..Default::default()
        };
        let (program, args) = resolve_shell(&custom);
        assert_eq!(program, "/bin/sh");
        assert!(args.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_shell_echo_and_exit() {
        let shell = LocalShellConfig {
            program: Some("/bin/sh".into()),
            ..Default::default()
        };
        let (pty, mut rx) = LocalPty::spawn(&shell, 80, 24, 16).unwrap();
        pty.write(Bytes::from_static(b"echo marker-$((40+2))\nexit 3\n"))
            .await
            .unwrap();

        let mut output = Vec::new();
        let mut exit = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            match event {
                TransportEvent::Data(chunk) => output.extend_from_slice(&chunk),
                TransportEvent::Exited(code) => {
                    exit = Some(code);
                    break;
                }
                TransportEvent::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }

        assert!(String::from_utf8_lossy(&output).contains("marker-42"));
        assert!(exit.is_some());
        pty.close().await;
        pty.close().await;
    }
}
