//! Client-facing listener
//!
//! Accepts telnet-style connections, asks for a callsign and hands each
//! authenticated client to its own session thread. A failure in one session
//! never touches the others.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::core::session::Session;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Login timed out")]
    Timeout,

    #[error("No callsign provided")]
    Empty,

    #[error("Client disconnected during login")]
    Disconnected,

    #[error("Login I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl LoginError {
    /// Line sent to the client before the connection is dropped
    pub fn reply(&self) -> Option<&'static str> {
        match self {
            LoginError::Timeout => Some("Login timeout\r\n"),
            LoginError::Empty => Some("No callsign provided\r\n"),
            LoginError::Disconnected | LoginError::Io(_) => None,
        }
    }
}

/// Prompt for a callsign and read it back.
///
/// The read timeout only applies to the handshake and is removed again
/// before the session starts.
pub fn login(stream: &mut TcpStream, config: &ServerConfig) -> Result<String, LoginError> {
    stream.write_all(config.login_prompt.as_bytes())?;
    stream.flush()?;

    let timeout = config.login_timeout();
    stream.set_read_timeout((!timeout.is_zero()).then_some(timeout))?;
    let callsign = read_callsign(stream, config.max_callsign_len)?;
    stream.set_read_timeout(None)?;

    if callsign.is_empty() {
        return Err(LoginError::Empty);
    }
    Ok(callsign)
}

/// Read up to `max_len` bytes or a line terminator; nothing is echoed.
/// Non-ASCII bytes are dropped and the result is trimmed and uppercased.
fn read_callsign<R: Read>(reader: &mut R, max_len: usize) -> Result<String, LoginError> {
    let mut raw = Vec::with_capacity(max_len);
    let mut byte = [0u8; 1];

    while raw.len() < max_len {
        match reader.read(&mut byte) {
            Ok(0) if raw.is_empty() => return Err(LoginError::Disconnected),
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\r' || byte[0] == b'\n' {
                    break;
                }
                raw.push(byte[0]);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(LoginError::Timeout);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if is_disconnect(&e) => return Err(LoginError::Disconnected),
            Err(e) => return Err(e.into()),
        }
    }

    let callsign: String = raw
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect();
    Ok(callsign.trim().to_uppercase())
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

/// Telnet front end for the console program
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
}

impl Server {
    pub fn bind(config: Config) -> Result<Self> {
        let addr = format!("{}:{}", config.server.bind, config.server.port);
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("Failed to listen on {}", addr))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept clients forever, one thread each
    pub fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Server listening");

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let config = self.config.clone();
                    let spawned = thread::Builder::new()
                        .name("client".to_string())
                        .spawn(move || handle_client(stream, &config));
                    if let Err(e) = spawned {
                        error!("Failed to start client thread: {}", e);
                    }
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
        Ok(())
    }
}

fn handle_client(mut stream: TcpStream, config: &Config) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(peer = %peer, "Connection accepted");

    let callsign = match login(&mut stream, &config.server) {
        Ok(callsign) => callsign,
        Err(e) => {
            info!(peer = %peer, "{}", e);
            if let Some(reply) = e.reply() {
                let _ = stream.write_all(reply.as_bytes());
            }
            return;
        }
    };
    info!(peer = %peer, callsign = %callsign, "User logging in");

    if let Err(e) = Session::start(stream, &callsign, config).and_then(Session::run) {
        error!(peer = %peer, callsign = %callsign, "Session failed: {:#}", e);
    }
    info!(peer = %peer, "Connection closed");
}
