//! Fake robot controller for integration tests
//!
//! Serves a dashboard port and a script port on localhost. Uploaded main
//! programs "run" for a fixed number of `running` polls; asserting the stop
//! output or sending `stop` halts them early.

#![allow(dead_code)]

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use urcell::Config;

pub const STOP_OUTPUT: u8 = 6;
pub const CONVEYOR_OUTPUT: u8 = 7;

/// Polls a program keeps reporting "running" when nothing halts it
pub const ENDLESS: usize = usize::MAX;

const PROGRAM_MARKER: &str = "def sort_program():";

const TEMPLATE: &str = "def sort_program():\n  max_cycles = {{MAX_CYCLES}}\n  textmsg(max_cycles)\nend\n";

struct FakeState {
    script_text: Mutex<String>,
    scanned: AtomicUsize,
    outputs: Mutex<Vec<(u8, bool)>>,
    programs: AtomicUsize,
    dashboard_log: Mutex<Vec<String>>,
    running_polls: AtomicUsize,
    replies: AtomicUsize,
    silent_after: AtomicUsize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            script_text: Mutex::default(),
            scanned: AtomicUsize::new(0),
            outputs: Mutex::default(),
            programs: AtomicUsize::new(0),
            dashboard_log: Mutex::default(),
            running_polls: AtomicUsize::new(0),
            replies: AtomicUsize::new(0),
            silent_after: AtomicUsize::new(usize::MAX),
        }
    }
}

pub struct FakeRobot {
    pub dashboard_port: u16,
    pub script_port: u16,
    polls_per_program: usize,
    state: Arc<FakeState>,
    drop_dashboard: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeRobot {
    /// Start a fake whose programs run for `polls_per_program` polls
    pub async fn start(polls_per_program: usize) -> Self {
        let dashboard = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let script = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dashboard_port = dashboard.local_addr().unwrap().port();
        let script_port = script.local_addr().unwrap().port();

        let state = Arc::new(FakeState::default());
        let drop_dashboard = Arc::new(Notify::new());

        let tasks = vec![
            tokio::spawn(serve_dashboard(dashboard, state.clone(), drop_dashboard.clone())),
            tokio::spawn(serve_script(script, state.clone(), polls_per_program)),
        ];

        Self {
            dashboard_port,
            script_port,
            polls_per_program,
            state,
            drop_dashboard,
            tasks,
        }
    }

    /// Close the dashboard session from the robot side
    pub fn drop_dashboard(&self) {
        self.drop_dashboard.notify_one();
    }

    /// Keep reading dashboard commands but stop answering them
    pub fn go_silent(&self) {
        let replies = self.state.replies.load(Ordering::SeqCst);
        self.state.silent_after.store(replies, Ordering::SeqCst);
    }

    /// Most recent level written to output `index`
    pub fn last_output(&self, index: u8) -> Option<bool> {
        self.state
            .outputs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, level)| *level)
    }

    /// Every `set_standard_digital_out` seen so far, in order
    pub fn outputs(&self) -> Vec<(u8, bool)> {
        self.state.outputs.lock().unwrap().clone()
    }

    pub fn script_text(&self) -> String {
        self.state.script_text.lock().unwrap().clone()
    }

    pub fn programs_started(&self) -> usize {
        self.state.programs.load(Ordering::SeqCst)
    }

    pub fn dashboard_log(&self) -> Vec<String> {
        self.state.dashboard_log.lock().unwrap().clone()
    }

    pub fn polls_per_program(&self) -> usize {
        self.polls_per_program
    }
}

impl Drop for FakeRobot {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_dashboard(listener: TcpListener, state: Arc<FakeState>, drop_signal: Arc<Notify>) {
    while let Ok((socket, _)) = listener.accept().await {
        let state = state.clone();
        let drop_signal = drop_signal.clone();
        tokio::spawn(async move {
            let (read_half, mut writer) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if writer
                .write_all(b"Connected: Universal Robots Dashboard Server\n")
                .await
                .is_err()
            {
                return;
            }

            loop {
                let line = tokio::select! {
                    biased;
                    _ = drop_signal.notified() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    },
                };

                let command = line.trim().to_string();
                state.dashboard_log.lock().unwrap().push(command.clone());
                if state.replies.load(Ordering::SeqCst) >= state.silent_after.load(Ordering::SeqCst) {
                    continue;
                }
                state.replies.fetch_add(1, Ordering::SeqCst);
                let reply = match command.as_str() {
                    "running" => {
                        let remaining = state.running_polls.load(Ordering::SeqCst);
                        if remaining > 0 {
                            if remaining != ENDLESS {
                                state.running_polls.store(remaining - 1, Ordering::SeqCst);
                            }
                            "Program running: true"
                        } else {
                            "Program running: false"
                        }
                    }
                    "stop" => {
                        state.running_polls.store(0, Ordering::SeqCst);
                        "Stopped"
                    }
                    _ => "OK",
                };
                if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn serve_script(listener: TcpListener, state: Arc<FakeState>, polls_per_program: usize) {
    let statement = Regex::new(r"def sort_program\(\):|set_standard_digital_out\((\d+), (True|False)\)").unwrap();

    while let Ok((mut socket, _)) = listener.accept().await {
        let state = state.clone();
        let statement = statement.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                let read = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut text = state.script_text.lock().unwrap();
                text.push_str(&String::from_utf8_lossy(&chunk[..read]));

                let start = state.scanned.load(Ordering::SeqCst);
                let mut scanned = start;
                for caps in statement.captures_iter(&text[start..]) {
                    let whole = caps.get(0).unwrap();
                    scanned = start + whole.end();
                    if whole.as_str() == PROGRAM_MARKER {
                        state.programs.fetch_add(1, Ordering::SeqCst);
                        state.running_polls.store(polls_per_program, Ordering::SeqCst);
                        continue;
                    }
                    let index: u8 = caps[1].parse().unwrap();
                    let level = &caps[2] == "True";
                    state.outputs.lock().unwrap().push((index, level));
                    if index == STOP_OUTPUT && level {
                        // the program halts at the end of its cycle
                        state.running_polls.store(0, Ordering::SeqCst);
                    }
                }
                state.scanned.store(scanned, Ordering::SeqCst);
            }
        });
    }
}

/// Write the cell program template into `dir`
pub fn write_template(dir: &Path) -> PathBuf {
    let path = dir.join("robot.script");
    std::fs::write(&path, TEMPLATE).unwrap();
    path
}

/// Config pointing at `robot` with short poll and dwell periods
pub fn test_config(robot: &FakeRobot, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.robot.ports.dashboard = robot.dashboard_port;
    config.robot.ports.script = robot.script_port;
    config.robot.connect_timeout = Some(2.0);
    config.batch.poll_interval = 0.02;
    config.batch.safety_dwell = 0.2;
    config.program.template_path = Some(write_template(dir.path()));
    config.events.enabled = false;
    config
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn connect_raw(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}
