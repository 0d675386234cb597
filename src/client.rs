//! Protocol client for the UR controller
//!
//! Owns the two TCP sessions to one robot: the dashboard server, a
//! line-oriented request/response channel used for status queries and hard
//! stops, and the secondary client port that accepts raw URScript uploads.

use crate::config::DEFAULT_COMMAND_TIMEOUT;
use crate::program::DigitalOutputCommand;
use crate::{CellError, Result};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of a single "is a program running" query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramPoll {
    Running,
    Stopped,
    /// The link failed while (or before) asking; says nothing about the program
    LinkLost,
}

struct DashboardChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Connection to a single robot controller
pub struct RobotClient {
    host: String,
    dashboard_port: u16,
    script_port: u16,
    /// Held across a whole write + read so replies never cross callers
    dashboard: Mutex<Option<DashboardChannel>>,
    script: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    /// Deadline for each dashboard write, reply and script upload
    command_timeout: Duration,
    running_pattern: Regex,
}

impl RobotClient {
    /// Open the dashboard session, discard its greeting, then open the script session
    pub async fn connect(
        host: &str,
        dashboard_port: u16,
        script_port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        info!("Connecting to dashboard at {}:{}", host, dashboard_port);
        let dashboard = open_socket(host, dashboard_port, timeout).await?;
        let (read_half, writer) = dashboard.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        let read = reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| CellError::Connect(format!("Failed to read dashboard greeting: {}", e)))?;
        if read == 0 {
            return Err(CellError::Connect(
                "Dashboard closed the connection before greeting".to_string(),
            ));
        }
        debug!("Dashboard greeting: {}", greeting.trim());

        info!("Connecting to script channel at {}:{}", host, script_port);
        let script = open_socket(host, script_port, timeout).await?;

        let running_pattern = Regex::new(r"(?i)true")
            .map_err(|e| CellError::Protocol(format!("Invalid reply pattern: {}", e)))?;

        info!("Connected to {} (dashboard={}, script={})", host, dashboard_port, script_port);
        Ok(Self {
            host: host.to_string(),
            dashboard_port,
            script_port,
            dashboard: Mutex::new(Some(DashboardChannel { reader, writer })),
            script: Mutex::new(Some(script)),
            connected: AtomicBool::new(true),
            command_timeout: Duration::from_secs_f64(DEFAULT_COMMAND_TIMEOUT),
            running_pattern,
        })
    }

    /// Replace the per-exchange deadline; a controller that misses it is
    /// treated as a lost link
    pub fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = limit;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> (u16, u16) {
        (self.dashboard_port, self.script_port)
    }

    /// Both sessions open and no transport failure observed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mark_lost(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Robot link to {} lost: {}", self.host, reason);
        }
    }

    /// Send one dashboard command and read exactly one reply line
    pub async fn send_control_command(&self, command: &str) -> Result<String> {
        let mut guard = self.dashboard.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| CellError::Protocol("Dashboard not connected".to_string()))?;

        let line = format!("{}\n", command.trim_end());
        match timeout(self.command_timeout, channel.writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_lost(&e.to_string());
                return Err(CellError::Protocol(format!("Failed to send dashboard command: {}", e)));
            }
            Err(_) => {
                self.mark_lost("dashboard write timed out");
                return Err(CellError::Protocol(format!(
                    "Timed out sending dashboard command '{}'",
                    command.trim()
                )));
            }
        }

        let mut reply = String::new();
        match timeout(self.command_timeout, channel.reader.read_line(&mut reply)).await {
            Ok(Ok(0)) => {
                self.mark_lost("dashboard closed by peer");
                Err(CellError::Protocol("Dashboard closed the connection".to_string()))
            }
            Ok(Ok(_)) => Ok(reply.trim().to_string()),
            Ok(Err(e)) => {
                self.mark_lost(&e.to_string());
                Err(CellError::Protocol(format!("Failed to read dashboard response: {}", e)))
            }
            Err(_) => {
                // a late reply would be read as the answer to the next command
                self.mark_lost("no dashboard reply before the deadline");
                Err(CellError::Protocol(format!(
                    "No reply to '{}' within {:?}",
                    command.trim(),
                    self.command_timeout
                )))
            }
        }
    }

    /// Upload a program on the script channel; the controller runs it on receipt
    pub async fn upload_program(&self, source: &str) -> Result<()> {
        let mut guard = self.script.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| CellError::Protocol("Script channel not connected".to_string()))?;

        let program = if source.ends_with('\n') {
            source.to_string()
        } else {
            format!("{}\n", source)
        };

        let written = timeout(self.command_timeout, async {
            stream.write_all(program.as_bytes()).await?;
            stream.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_lost(&e.to_string());
                Err(CellError::Protocol(format!("Failed to upload program: {}", e)))
            }
            Err(_) => {
                self.mark_lost("script upload timed out");
                Err(CellError::Protocol("Timed out uploading program".to_string()))
            }
        }
    }

    /// Set a standard digital output without replacing the running main program
    pub async fn set_digital_output(&self, index: u8, level: bool) -> Result<()> {
        debug!("Setting digital output {} to {}", index, level);
        self.upload_program(&DigitalOutputCommand::new(index, level).to_urscript())
            .await
    }

    /// Ask the dashboard whether a program is running, keeping link loss distinct
    pub async fn poll_program(&self) -> ProgramPoll {
        if !self.is_connected() {
            return ProgramPoll::LinkLost;
        }
        match self.send_control_command("running").await {
            Ok(reply) if self.running_pattern.is_match(&reply) => ProgramPoll::Running,
            Ok(_) => ProgramPoll::Stopped,
            Err(e) => {
                debug!("Running query failed: {}", e);
                if self.is_connected() {
                    ProgramPoll::Stopped
                } else {
                    ProgramPoll::LinkLost
                }
            }
        }
    }

    /// Any failure counts as "not running" so pollers terminate
    pub async fn is_program_running(&self) -> bool {
        self.poll_program().await == ProgramPoll::Running
    }

    /// Hard stop through the dashboard; never fails from the caller's view
    pub async fn emergency_stop(&self) {
        if !self.is_connected() {
            return;
        }
        match self.send_control_command("stop").await {
            Ok(reply) => info!("Dashboard stop acknowledged: {}", reply),
            Err(e) => warn!("Dashboard stop failed: {}", e),
        }
    }

    /// Close both sessions; safe to call repeatedly
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut channel) = self.dashboard.lock().await.take() {
            let _ = channel.writer.shutdown().await;
        }
        if let Some(mut stream) = self.script.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        debug!("Disconnected from {}", self.host);
    }
}

async fn open_socket(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            CellError::Connect(format!("Timed out connecting to {}:{}", host, port))
        })?,
        None => connect.await,
    };
    result.map_err(|e| CellError::Connect(format!("Failed to connect to {}:{}: {}", host, port, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_connect_fails_without_dashboard() {
        let (unused, port) = listener().await;
        drop(unused);
        let result = RobotClient::connect("127.0.0.1", port, port, None).await;
        assert!(matches!(result, Err(CellError::Connect(_))));
    }

    #[tokio::test]
    async fn test_poll_reports_link_lost_when_dashboard_drops() {
        let (dashboard, dashboard_port) = listener().await;
        let (script, script_port) = listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = dashboard.accept().await.unwrap();
            socket.write_all(b"Connected: Universal Robots Dashboard Server\n").await.unwrap();
            let (_keep, _) = script.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            drop(socket);
            _keep
        });

        let client = RobotClient::connect("127.0.0.1", dashboard_port, script_port, None)
            .await
            .unwrap();
        assert!(client.is_connected());

        assert_eq!(client.poll_program().await, ProgramPoll::LinkLost);
        assert!(!client.is_program_running().await);
        assert!(!client.is_connected());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_appends_newline() {
        let (dashboard, dashboard_port) = listener().await;
        let (script, script_port) = listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = dashboard.accept().await.unwrap();
            socket.write_all(b"hello\n").await.unwrap();
            let (mut upload, _) = script.accept().await.unwrap();
            let mut received = String::new();
            upload.read_to_string(&mut received).await.unwrap();
            received
        });

        let client = RobotClient::connect("127.0.0.1", dashboard_port, script_port, None)
            .await
            .unwrap();
        client.upload_program("popup(\"hi\")").await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(server.await.unwrap(), "popup(\"hi\")\n");
    }
}
