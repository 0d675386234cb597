//! Operator console
//!
//! Reads one command per line from stdin and drives the cell. Ctrl+C is the
//! emergency stop button; it never exits the console and is honoured while a
//! command is still in flight.

use crate::json_output::output_event;
use crate::service::CellService;
use crate::{CellError, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 20;

const HELP: &str = "\
Commands:
  connect [ip]       connect to the robot (defaults to robot.host)
  start              run the program until stopped
  batch <n>          run n cycles, then the safety dwell
  stop               halt after the current cycle
  estop              emergency stop (also Ctrl+C)
  conveyor           toggle the conveyor output
  status             show the cell state
  counter            show sorted item totals
  runs [n]           latest batch runs (admin)
  emergencies [n]    emergency stop log (admin)
  operator [name]    set or clear the operator
  disconnect         drop the robot link
  quit               leave the console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Start,
    Batch(i64),
    Stop,
    Emergency,
    Conveyor,
    Status,
    Counter,
    Runs(usize),
    Emergencies(usize),
    Operator(Option<String>),
    Disconnect,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line; blank lines and `#` comments yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let arg = words.next();

        let command = match verb.as_str() {
            "connect" => ConsoleCommand::Connect(arg.map(str::to_string)),
            "start" | "manual" => ConsoleCommand::Start,
            "batch" => {
                let cycles = arg
                    .and_then(|a| a.parse::<i64>().ok())
                    .ok_or_else(|| CellError::Validation("Write a valid number (>=1).".to_string()))?;
                ConsoleCommand::Batch(cycles)
            }
            "stop" => ConsoleCommand::Stop,
            "estop" | "emergency" => ConsoleCommand::Emergency,
            "conveyor" => ConsoleCommand::Conveyor,
            "status" => ConsoleCommand::Status,
            "counter" => ConsoleCommand::Counter,
            "runs" => ConsoleCommand::Runs(parse_limit(arg)?),
            "emergencies" => ConsoleCommand::Emergencies(parse_limit(arg)?),
            "operator" => {
                let name = line[verb.len()..].trim();
                ConsoleCommand::Operator((!name.is_empty()).then(|| name.to_string()))
            }
            "disconnect" => ConsoleCommand::Disconnect,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => {
                return Err(CellError::Validation(format!(
                    "Unknown command '{}' (try 'help')",
                    other
                )))
            }
        };
        Ok(Some(command))
    }
}

fn parse_limit(arg: Option<&str>) -> Result<usize> {
    match arg {
        None => Ok(DEFAULT_HISTORY_LIMIT),
        Some(a) => a
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| CellError::Validation(format!("Invalid row count '{}'", a))),
    }
}

pub struct Console {
    service: Arc<CellService>,
    json: bool,
    interrupt: Arc<Notify>,
}

impl Console {
    pub fn new(service: Arc<CellService>, json: bool) -> Self {
        Self {
            service,
            json,
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Main loop over stdin. Ctrl+C is watched by its own task, so it fires
    /// the emergency stop even while a command or an EOF wait is pending.
    pub async fn run(&self) -> Result<()> {
        info!("Console ready - type 'help' for commands, Ctrl+C for emergency stop");

        let service = Arc::clone(&self.service);
        let interrupt = Arc::clone(&self.interrupt);
        let watcher = tokio::spawn(async move {
            loop {
                if let Err(e) = signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                warn!("Ctrl+C received - emergency stop");
                service.orchestrator().emergency_stop().await;
                interrupt.notify_waiters();
            }
        });

        let outcome = self.run_with(BufReader::new(io::stdin())).await;
        watcher.abort();
        outcome
    }

    /// Command loop over any line source; returns on `quit`, on a read error,
    /// or at end of input once no batch is being monitored
    pub async fn run_with<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    return Ok(());
                }
            };
            let command = match ConsoleCommand::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if command == ConsoleCommand::Quit {
                return Ok(());
            }
            // not cancelled on interrupt: every start re-checks the
            // emergency counter and backs out on its own
            if let Err(e) = self.execute(command).await {
                debug!("Command failed: {}", e);
            }
        }

        info!("End of input; waiting for any batch in progress");
        tokio::select! {
            joined = self.service.orchestrator().join_monitor() => joined?,
            _ = self.interrupt.notified() => {
                info!("Interrupted while waiting for the batch");
            }
        }
        Ok(())
    }

    /// Emergency stop from outside the command stream, as Ctrl+C does
    pub async fn interrupt(&self) {
        self.service.orchestrator().emergency_stop().await;
        self.interrupt.notify_waiters();
    }

    /// Run one command against the cell
    pub async fn execute(&self, command: ConsoleCommand) -> Result<()> {
        let cell = self.service.orchestrator();
        match command {
            ConsoleCommand::Connect(address) => {
                let address = address
                    .or_else(|| self.service.config().robot.host.clone())
                    .unwrap_or_default();
                cell.connect(&address).await
            }
            ConsoleCommand::Start => cell.start_manual().await,
            ConsoleCommand::Batch(cycles) => cell.start_batch(cycles).await,
            ConsoleCommand::Stop => cell.stop().await,
            ConsoleCommand::Emergency => {
                cell.emergency_stop().await;
                Ok(())
            }
            ConsoleCommand::Conveyor => cell.toggle_conveyor().await.map(|_| ()),
            ConsoleCommand::Status => {
                let snapshot = cell.snapshot().await;
                if self.json {
                    output_event(&snapshot);
                } else {
                    println!(
                        "state={} connected={} conveyor={} batch_active={} monitor_active={} target={} operator={}",
                        snapshot.state,
                        snapshot.connected,
                        if snapshot.conveyor_on { "on" } else { "off" },
                        snapshot.batch_active,
                        snapshot.monitor_active,
                        snapshot.target_cycles,
                        snapshot.operator.as_deref().unwrap_or("-"),
                    );
                }
                Ok(())
            }
            ConsoleCommand::Counter => {
                let counter = self.service.store().counter().await?;
                if self.json {
                    output_event(&counter);
                } else {
                    println!(
                        "sorted={} accepted={} rejected={}",
                        counter.sorted, counter.accepted, counter.rejected
                    );
                }
                Ok(())
            }
            ConsoleCommand::Runs(limit) => self.show_runs(limit).await,
            ConsoleCommand::Emergencies(limit) => self.show_emergencies(limit).await,
            ConsoleCommand::Operator(name) => {
                cell.set_operator(name).await;
                match cell.operator().await {
                    Some(name) => info!("Operator set to {}", name),
                    None => info!("Operator cleared"),
                }
                Ok(())
            }
            ConsoleCommand::Disconnect => {
                cell.disconnect().await;
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => Ok(()),
        }
    }

    async fn caller(&self) -> String {
        self.service.orchestrator().operator().await.unwrap_or_default()
    }

    async fn show_runs(&self, limit: usize) -> Result<()> {
        let caller = self.caller().await;
        let records = self
            .service
            .history()
            .batch_runs(&caller, limit)
            .await
            .inspect_err(|e| warn!("{}", e))?;

        if records.is_empty() && !self.json {
            println!("No batch runs recorded");
        }
        for record in records {
            let meta = &record.meta;
            if self.json {
                output_event(&json!({
                    "ended_at": record.ended_at,
                    "operator": meta.operator,
                    "target_cycles": meta.target_cycles,
                    "dwell_started": meta.dwell_started,
                    "dwell_ended": meta.dwell_ended,
                    "link_lost": meta.link_lost,
                }));
            } else {
                println!(
                    "{}  {:>5} cycles  {}  dwell {} -> {}{}",
                    record.ended_at.format("%Y-%m-%d %H:%M:%S"),
                    meta.target_cycles,
                    meta.operator,
                    meta.dwell_started.format("%H:%M:%S"),
                    meta.dwell_ended.format("%H:%M:%S"),
                    if meta.link_lost { "  (link lost)" } else { "" },
                );
            }
        }
        Ok(())
    }

    async fn show_emergencies(&self, limit: usize) -> Result<()> {
        let caller = self.caller().await;
        let records = self
            .service
            .history()
            .emergency_log(&caller, limit)
            .await
            .inspect_err(|e| warn!("{}", e))?;

        if records.is_empty() && !self.json {
            println!("No emergency stops recorded");
        }
        for record in records {
            if self.json {
                output_event(&json!({
                    "pressed_at": record.pressed_at,
                    "operator": record.operator,
                }));
            } else {
                println!(
                    "{}  {}",
                    record.pressed_at.format("%Y-%m-%d %H:%M:%S"),
                    record.operator
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(
            ConsoleCommand::parse("connect 10.0.0.5").unwrap(),
            Some(ConsoleCommand::Connect(Some("10.0.0.5".to_string())))
        );
        assert_eq!(
            ConsoleCommand::parse("connect").unwrap(),
            Some(ConsoleCommand::Connect(None))
        );
        assert_eq!(ConsoleCommand::parse("  BATCH 12 ").unwrap(), Some(ConsoleCommand::Batch(12)));
        assert_eq!(ConsoleCommand::parse("estop").unwrap(), Some(ConsoleCommand::Emergency));
        assert_eq!(ConsoleCommand::parse("emergency").unwrap(), Some(ConsoleCommand::Emergency));
        assert_eq!(ConsoleCommand::parse("runs").unwrap(), Some(ConsoleCommand::Runs(20)));
        assert_eq!(ConsoleCommand::parse("emergencies 5").unwrap(), Some(ConsoleCommand::Emergencies(5)));
    }

    #[test]
    fn test_parse_skips_blank_and_comments() {
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("# connect 1.2.3.4").unwrap(), None);
    }

    #[test]
    fn test_batch_needs_a_number() {
        assert!(matches!(ConsoleCommand::parse("batch"), Err(CellError::Validation(_))));
        assert!(matches!(ConsoleCommand::parse("batch ten"), Err(CellError::Validation(_))));
        // range is checked by the orchestrator
        assert_eq!(ConsoleCommand::parse("batch 0").unwrap(), Some(ConsoleCommand::Batch(0)));
    }

    #[test]
    fn test_operator_keeps_full_name() {
        assert_eq!(
            ConsoleCommand::parse("operator Ana Lopez").unwrap(),
            Some(ConsoleCommand::Operator(Some("Ana Lopez".to_string())))
        );
        assert_eq!(ConsoleCommand::parse("operator").unwrap(), Some(ConsoleCommand::Operator(None)));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(matches!(ConsoleCommand::parse("dance"), Err(CellError::Validation(_))));
        assert!(matches!(ConsoleCommand::parse("runs zero"), Err(CellError::Validation(_))));
    }
}
