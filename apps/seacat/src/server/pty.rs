//! PTY lifecycle for hosted sessions: allocate, spawn the shell with the
//! connection environment exported, resize on geometry updates, and tear
//! down.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::ProcessError;
use crate::protocol::Mode;

/// Environment exported into the spawned shell, consumed by external
/// shell-startup scripts (the transport does not interpret it).
pub const ENV_PEER_ADDR: &str = "SEACAT_PEERADDR";
pub const ENV_PEER_PORT: &str = "SEACAT_PEERPORT";
pub const ENV_LOCAL_PORT: &str = "SEACAT_SOCKPORT";
pub const ENV_MODE: &str = "SEACAT_MODE";

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub peer_addr: String,
    pub peer_port: u16,
    pub local_port: u16,
    pub mode: Mode,
    /// Sourced by the default shell before it goes interactive, when present.
    pub rcfile: Option<PathBuf>,
    /// Replaces the default interactive bash (used by hosts that share a
    /// specific program, and by tests).
    pub command: Option<Vec<String>>,
    pub rows: u16,
    pub cols: u16,
}

pub struct PtySession {
    // The master handle is not Sync on its own; the lock makes the session
    // shareable across the bridge tasks.
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl PtySession {
    /// Allocate a PTY and spawn the requested shell on its slave side.
    /// Returns the session handle plus the master's reader and writer for
    /// the copy loops.
    pub fn spawn(
        request: &ShellRequest,
    ) -> Result<(Self, Box<dyn Read + Send>, Box<dyn Write + Send>), ProcessError> {
        let cmd = build_command(request)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ProcessError::Open(err.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| ProcessError::Spawn(err.to_string()))?;
        // Drop our slave handle so the master sees EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| ProcessError::Open(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| ProcessError::Open(err.to_string()))?;

        Ok((
            Self {
                master: Mutex::new(pair.master),
                child: Arc::new(Mutex::new(child)),
            },
            reader,
            writer,
        ))
    }

    /// Apply a geometry update and notify the child with SIGWINCH, matching
    /// what a local terminal would deliver.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ProcessError::Resize(err.to_string()))?;

        if let Some(pid) = self.child.lock().unwrap().process_id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGWINCH);
            }
        }
        Ok(())
    }

    pub fn size(&self) -> Result<PtySize, ProcessError> {
        self.master
            .lock()
            .unwrap()
            .get_size()
            .map_err(|err| ProcessError::Resize(err.to_string()))
    }

    /// True once the child has exited (or its handle is gone).
    pub fn has_exited(&self) -> bool {
        match self.child.lock().unwrap().try_wait() {
            Ok(status) => status.is_some(),
            Err(_) => true,
        }
    }

    /// Kill the child and reap it. Idempotent; also closes the slave side so
    /// blocked PTY reads unblock.
    pub fn shutdown(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_command(request: &ShellRequest) -> Result<CommandBuilder, ProcessError> {
    let mut cmd = match &request.command {
        Some(argv) => {
            let program = argv
                .first()
                .ok_or_else(|| ProcessError::Spawn("empty command".into()))?;
            let mut cmd = CommandBuilder::new(program);
            cmd.args(&argv[1..]);
            cmd
        }
        None => match &request.rcfile {
            Some(rcfile) => {
                let rc = rcfile.display();
                let script = format!(
                    "if [[ -f \"{rc}\" ]]; then source \"{rc}\"; \
                     else echo \"Warning: rc file not found at {rc}\" >&2; fi; \
                     exec /bin/bash -i"
                );
                let mut cmd = CommandBuilder::new("/bin/bash");
                cmd.args(["-c", script.as_str()]);
                cmd
            }
            None => {
                let mut cmd = CommandBuilder::new("/bin/bash");
                cmd.arg("-i");
                cmd
            }
        },
    };

    cmd.env("TERM", "xterm-256color");
    cmd.env(ENV_PEER_ADDR, &request.peer_addr);
    cmd.env(ENV_PEER_PORT, request.peer_port.to_string());
    cmd.env(ENV_LOCAL_PORT, request.local_port.to_string());
    cmd.env(ENV_MODE, request.mode.as_str());
    Ok(cmd)
}
