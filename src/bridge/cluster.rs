//! Logged-in console connection used to post spots
//!
//! Connects like any other user: wait for the login prompt, send the bridge
//! callsign, then switch off paging, beeps and ANSI output so the session is
//! plain line traffic.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::api::ClusterSpot;
use super::{BridgeError, Result};
use crate::config::BridgeConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_MARKER: &[u8] = b"login:";
/// Bytes read while waiting for the login prompt before giving up
const PROMPT_LIMIT: usize = 4096;

/// How long to swallow output after logging in
const WELCOME_WINDOW: Duration = Duration::from_secs(1);
/// ... after each setup command
const COMMAND_WINDOW: Duration = Duration::from_millis(500);
/// ... after each spot
const SPOT_WINDOW: Duration = Duration::from_millis(200);

const SETUP_COMMANDS: [&str; 3] = ["unset/page", "set/nobeep", "unset/ansi"];

pub struct ClusterConnection {
    addr: String,
    callsign: String,
    retries: u32,
    retry_delay: Duration,
    stream: Option<TcpStream>,
}

impl ClusterConnection {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.cluster_host, config.cluster_port),
            callsign: config.callsign.clone(),
            retries: config.connect_retries.max(1),
            retry_delay: config.retry_delay(),
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect and log in, retrying up to the configured number of attempts
    pub fn connect(&mut self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.login() {
                Ok(stream) => {
                    info!(addr = %self.addr, callsign = %self.callsign, "Connected to cluster");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if attempt < self.retries => {
                    warn!(attempt, "{}", e);
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Post one spot, connecting first if needed. A failed write drops the
    /// connection so the next spot reconnects.
    pub fn send_spot(&mut self, spot: &ClusterSpot) -> Result<()> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(BridgeError::Send(ErrorKind::NotConnected.into()));
        };

        let sent = stream
            .write_all(spot.command().as_bytes())
            .and_then(|_| stream.flush())
            .and_then(|_| drain(stream, SPOT_WINDOW).map(|_| ()));
        if let Err(e) = sent {
            self.close();
            return Err(BridgeError::Send(e));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(addr = %self.addr, "Cluster connection closed");
        }
    }

    fn login(&self) -> Result<TcpStream> {
        let mut stream = self.open()?;
        stream
            .set_write_timeout(Some(CONNECT_TIMEOUT))
            .map_err(BridgeError::Send)?;
        wait_for_prompt(&mut stream)?;

        let mut send = |line: &str, window: Duration| -> io::Result<()> {
            stream.write_all(format!("{}\n", line).as_bytes())?;
            stream.flush()?;
            let swallowed = drain(&mut stream, window)?;
            debug!(line, swallowed, "Cluster command sent");
            Ok(())
        };
        send(&self.callsign, WELCOME_WINDOW).map_err(BridgeError::Send)?;
        for command in SETUP_COMMANDS {
            send(command, COMMAND_WINDOW).map_err(BridgeError::Send)?;
        }
        Ok(stream)
    }

    fn open(&self) -> Result<TcpStream> {
        let connect_error = |source| BridgeError::Connect {
            addr: self.addr.clone(),
            source,
        };

        let mut last_error = io::Error::new(ErrorKind::NotFound, "address did not resolve");
        for addr in self.addr.to_socket_addrs().map_err(connect_error)? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e,
            }
        }
        Err(connect_error(last_error))
    }
}

impl Drop for ClusterConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_for_prompt(stream: &mut TcpStream) -> Result<()> {
    stream
        .set_read_timeout(Some(CONNECT_TIMEOUT))
        .map_err(BridgeError::Send)?;

    let mut seen = Vec::new();
    let mut buffer = [0u8; 1024];
    while seen.len() < PROMPT_LIMIT {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                seen.extend_from_slice(&buffer[..n]);
                if seen.windows(LOGIN_MARKER.len()).any(|w| w == LOGIN_MARKER) {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    Err(BridgeError::NoPrompt)
}

/// Read and discard whatever arrives within `window`. Returns the number of
/// bytes discarded.
fn drain(stream: &mut TcpStream, window: Duration) -> io::Result<usize> {
    let deadline = Instant::now() + window;
    let mut buffer = [0u8; 4096];
    let mut total = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(total);
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::ConnectionAborted,
                    "cluster closed the connection",
                ))
            }
            Ok(n) => total += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(total)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}
