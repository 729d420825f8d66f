//! Session management
//!
//! Proxies one client connection to one console program. The output relay
//! runs on the calling thread; the pty reader and the input relay get their
//! own threads. All three share a running flag and a close-once teardown.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::ChildKiller;
use tracing::{debug, info, warn};

use super::pipeline::Reprocessor;
use super::pty::{ConsolePty, PtyError};
use crate::config::Config;

const CLIENT_READ_CHUNK: usize = 1024;

/// Releases the session's shared handles exactly once, from whichever
/// direction ends first
struct Teardown {
    closed: AtomicBool,
    running: Arc<AtomicBool>,
    peer: String,
    client: TcpStream,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl Teardown {
    fn close(&self, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(peer = %self.peer, reason, "Tearing down session");
        if let Err(e) = self.client.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %e, "Client socket already closed");
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = killer.kill() {
            debug!(peer = %self.peer, "{}", PtyError::Kill(e));
        }
    }
}

/// A client connected to its console program
pub struct Session {
    peer: String,
    callsign: String,
    client: TcpStream,
    pty: ConsolePty,
    reprocessor: Reprocessor,
    poll_interval: Duration,
    read_chunk: usize,
    kill_grace: Duration,
    running: Arc<AtomicBool>,
    teardown: Arc<Teardown>,
}

impl Session {
    /// Launch the console program for an authenticated client
    pub fn start(client: TcpStream, callsign: &str, config: &Config) -> Result<Self> {
        let peer = client
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let reprocessor =
            Reprocessor::new(&config.normalizer).context("Invalid normalizer settings")?;
        let teardown_client = client
            .try_clone()
            .context("Failed to clone client socket")?;

        // Last fallible step: nothing below can leave the child running
        let pty = ConsolePty::spawn(&config.program, callsign)?;

        let running = Arc::new(AtomicBool::new(true));
        let teardown = Arc::new(Teardown {
            closed: AtomicBool::new(false),
            running: running.clone(),
            peer: peer.clone(),
            client: teardown_client,
            killer: Mutex::new(pty.killer()),
        });

        Ok(Self {
            peer,
            callsign: callsign.to_string(),
            client,
            pty,
            reprocessor,
            poll_interval: config.program.poll_interval(),
            read_chunk: config.program.read_chunk.max(1),
            kill_grace: config.program.kill_grace(),
            running,
            teardown,
        })
    }

    /// Check if session is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Relay both directions until either side ends, then tear down
    pub fn run(mut self) -> Result<()> {
        info!(peer = %self.peer, callsign = %self.callsign, "Session started");

        let setup = self.spawn_relays();
        let (pty_thread, input_thread, rx) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                self.teardown.close("relay setup failed");
                self.pty.terminate(self.kill_grace);
                return Err(e);
            }
        };

        self.relay_output(rx);
        self.teardown.close("console output ended");

        if input_thread.join().is_err() {
            warn!(peer = %self.peer, "Input relay panicked");
        }

        if !self.pty.wait_exit(self.kill_grace) {
            warn!(
                peer = %self.peer,
                grace = ?self.kill_grace,
                "Console program did not exit; abandoning it"
            );
        }
        // A grandchild can keep the pty open; the reader then ends on its own
        if pty_thread.is_finished() && pty_thread.join().is_err() {
            warn!(peer = %self.peer, "PTY reader panicked");
        }

        info!(
            peer = %self.peer,
            callsign = %self.callsign,
            exit_code = ?self.pty.exit_code(),
            "Session closed"
        );
        Ok(())
    }

    fn spawn_relays(&self) -> Result<(JoinHandle<()>, JoinHandle<()>, Receiver<Vec<u8>>)> {
        let reader = self.pty.reader()?;
        let writer = self.pty.writer()?;
        let client = self
            .client
            .try_clone()
            .context("Failed to clone client socket")?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let pty_thread = spawn_pty_reader(reader, tx, self.read_chunk, self.running.clone());
        let input_thread = spawn_input_relay(client, writer, self.teardown.clone());
        Ok((pty_thread, input_thread, rx))
    }

    /// Console -> client, through the reprocessing pipeline
    fn relay_output(&mut self, rx: Receiver<Vec<u8>>) {
        while self.is_running() {
            match rx.recv_timeout(self.poll_interval) {
                Ok(chunk) => {
                    let out = self.reprocessor.process(&chunk);
                    if let Err(e) = write_client(&self.client, &out) {
                        debug!(peer = %self.peer, error = %e, "Client write failed");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let out = self.reprocessor.finish();
                    if let Err(e) = write_client(&self.client, &out) {
                        debug!(peer = %self.peer, error = %e, "Client write failed");
                    }
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown.close("session dropped");
    }
}

fn write_client(mut client: &TcpStream, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    client.write_all(data)?;
    client.flush()
}

/// Blocking pty reads forwarded as chunks
fn spawn_pty_reader(
    mut reader: Box<dyn Read + Send>,
    tx: Sender<Vec<u8>>,
    chunk: usize,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = vec![0u8; chunk];

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    // EIO here is the normal end of a pty on Linux
                    debug!("{}", PtyError::Read(e));
                    break;
                }
            }
        }
    })
}

/// Client -> console, bytes passed through untouched
fn spawn_input_relay(
    mut client: TcpStream,
    mut writer: Box<dyn Write + Send>,
    teardown: Arc<Teardown>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; CLIENT_READ_CHUNK];

        while teardown.running.load(Ordering::SeqCst) {
            match client.read(&mut buffer) {
                Ok(0) => {
                    debug!(peer = %teardown.peer, "Client closed connection");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buffer[..n]).and_then(|_| writer.flush()) {
                        debug!(peer = %teardown.peer, "{}", PtyError::Write(e));
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %teardown.peer, error = %e, "Client read failed");
                    break;
                }
            }
        }

        teardown.close("client input ended");
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ProgramConfig;
    use std::net::TcpListener;
    use std::time::Instant;

    fn shell_config(script: &str) -> Config {
        let mut config = Config::default();
        config.program = ProgramConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            cwd: None,
            ..ProgramConfig::default()
        };
        config
    }

    /// Start a session for `script` and return the client end plus the
    /// thread running the session
    fn connect(script: &str) -> (TcpStream, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = shell_config(script);

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Session::start(stream, "N0CALL", &config)?.run()
        });

        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        (client, server)
    }

    fn read_to_end(client: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let _ = client.read_to_end(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_output_relayed_and_closed_on_exit() {
        let (mut client, server) = connect("echo \"hello $1\"");
        assert_eq!(read_to_end(&mut client), "hello N0CALL\r\n");
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_output_is_reprocessed() {
        let (mut client, server) =
            connect("printf 'DX de W1AW: 14.250 AB1CD FN-0042 1234Z\\n'");
        assert_eq!(
            read_to_end(&mut client),
            "DX de W1AW:    14.250  AB1CD         FN-0042                        1234Z\r\n"
        );
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_input_relayed_to_console() {
        let (mut client, server) = connect("read line; echo \"got:$line\"");
        client.write_all(b"sh/dx\n").unwrap();
        assert!(read_to_end(&mut client).contains("got:sh/dx"));
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_failed_start_releases_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = Config::default();
        config.program.command = "/nonexistent/console.pl".to_string();
        config.program.cwd = None;

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Session::start(stream, "N0CALL", &config).map(|_| ())
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        assert!(server.join().unwrap().is_err());
        // Every handle on the socket is gone, so the client sees EOF
        assert_eq!(read_to_end(&mut client), "");
    }

    #[test]
    fn test_client_disconnect_stops_console() {
        let (client, server) = connect("sleep 30");
        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        drop(client);
        server.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
