//! Console program on a pseudo-terminal
//!
//! Each client session gets its own child process, launched on a fresh pty
//! with the client's callsign as the last argument.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProgramConfig;

/// Size reported to the console program
const COLS: u16 = 80;
const ROWS: u16 = 24;

const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] anyhow::Error),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to get PTY handle: {0}")]
    Handle(#[source] anyhow::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to kill console program: {0}")]
    Kill(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// A running console program and the master side of its pty
pub struct ConsolePty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl ConsolePty {
    /// Launch the configured program for `callsign`
    pub fn spawn(program: &ProgramConfig, callsign: &str) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: ROWS,
                cols: COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Open)?;

        let child = pair
            .slave
            .spawn_command(build_command(program, callsign))
            .map_err(|source| PtyError::Spawn {
                command: program.command.clone(),
                source,
            })?;
        // The reader only sees end-of-file once no slave handle is left open
        drop(pair.slave);

        info!(
            pid = ?child.process_id(),
            command = %program.command,
            callsign,
            "Console program started"
        );

        Ok(Self {
            master: pair.master,
            child,
        })
    }

    /// Blocking reader for the program's output
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master.try_clone_reader().map_err(PtyError::Handle)
    }

    /// Writer for the program's input. Can only be taken once.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master.take_writer().map_err(PtyError::Handle)
    }

    /// Handle that can kill the program from another thread
    pub fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        self.child.clone_killer()
    }

    /// Check if the program is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code, once the program has exited
    pub fn exit_code(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Wait up to `grace` for the program to exit. Returns false if it is
    /// still running afterwards.
    pub fn wait_exit(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(code = status.exit_code(), "Console program exited");
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "Console program wait failed");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Kill the program and wait up to `grace` for it to exit
    pub fn terminate(&mut self, grace: Duration) -> bool {
        if self.is_running() {
            if let Err(e) = self.child.kill() {
                debug!("{}", PtyError::Kill(e));
            }
        }
        self.wait_exit(grace)
    }
}

fn build_command(program: &ProgramConfig, callsign: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&program.command);
    cmd.args(&program.args);
    cmd.arg(callsign);
    if let Some(cwd) = &program.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in std::env::vars_os() {
        cmd.env(key, value);
    }
    cmd.env("TERM", &program.term);
    cmd
}
