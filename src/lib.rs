//! urcell - sorting cell controller for Universal Robots arms
//!
//! Talks to the robot over its two plain-text TCP channels (dashboard for
//! control queries, secondary client for program uploads), listens for the
//! item notifications the robot program sends back, and drives manual and
//! batch runs including the post-batch safety dwell.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use urcell::{CellService, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = CellService::new(Config::load_from_path("config/urcell.yaml")?);
//!     let cell = service.orchestrator();
//!
//!     cell.connect("192.168.0.10").await?;
//!     cell.start_batch(12).await?;
//!     cell.join_monitor().await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **RobotClient**: dashboard and script channels of one robot
//! - **EventListener**: inbound line-oriented notifications from the robot
//! - **CellOrchestrator**: run state machine, batch monitor and safety dwell
//! - **RunStore / OperatorDirectory**: persistence collaborators
//! - **CellService**: owns and wires all of the above

pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod history;
pub mod json_output;
mod monitor;
pub mod orchestrator;
pub mod outcome;
pub mod persistence;
pub mod program;
pub mod service;

pub use client::{ProgramPoll, RobotClient};
pub use config::Config;
pub use error::{CellError, Result};
pub use events::{EventListener, ItemToken, ListenerEvent};
pub use history::{BatchRecord, EmergencyRecord, RunHistory};
pub use json_output::{CellEvent, NoticeLevel};
pub use orchestrator::{CellOrchestrator, CellSnapshot, CellState};
pub use outcome::{RunMode, RunOutcome, RunRequest, StoredRun};
pub use persistence::{Counter, JsonlStore, MemoryStore, OperatorDirectory, RunStore, StaticDirectory};
pub use program::{DigitalOutputCommand, ProgramTemplate};
pub use service::CellService;
