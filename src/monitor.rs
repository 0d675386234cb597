//! Batch monitor and post-batch safety dwell
//!
//! One monitor runs per batch. It polls the dashboard until the program is no
//! longer running, then holds the safety output high for the dwell period and
//! records the run. Everything it does is tied to the batch generation it was
//! started with.

use crate::client::ProgramPoll;
use crate::json_output::NoticeLevel;
use crate::orchestrator::{CellShared, CellState};
use crate::outcome::RunOutcome;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Why the poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Dashboard reported the program stopped
    Completed,
    /// The link dropped; completion is not proven
    LinkLost,
    /// The configured maximum wait elapsed
    TimedOut,
    /// Emergency stop, disconnect or a newer batch took over
    Superseded,
}

pub(crate) async fn run_batch_monitor(shared: Arc<CellShared>, generation: u64, target: u32) {
    let exit = poll_until_finished(&shared, generation).await;
    debug!("Batch monitor {} exited: {:?}", generation, exit);

    match exit {
        MonitorExit::Superseded => {}
        MonitorExit::TimedOut => {
            shared.notify(
                NoticeLevel::Error,
                format!("Batch of {} cycles exceeded the maximum wait; halting", target),
            );
            shared.set_output_logged(shared.config.outputs.stop, true).await;
            if shared.set_state_if_current(generation, CellState::Ready).await {
                shared.release_monitor(generation);
            }
        }
        MonitorExit::Completed | MonitorExit::LinkLost => {
            let link_lost = exit == MonitorExit::LinkLost;
            if link_lost {
                shared.notify(
                    NoticeLevel::Warning,
                    "Robot link lost while monitoring the batch; completion not confirmed",
                );
            }

            if shared.batch_active.load(Ordering::SeqCst) {
                run_safety_dwell(&shared, generation, target, link_lost).await;
            } else if shared.set_state_if_current(generation, CellState::Ready).await {
                shared.release_monitor(generation);
                shared.notify(NoticeLevel::Info, "Batch stopped before completion");
            }
        }
    }
}

async fn poll_until_finished(shared: &CellShared, generation: u64) -> MonitorExit {
    let poll_interval = shared.config.batch.poll_interval();
    let max_wait = shared.config.batch.max_wait();
    let started = Instant::now();

    loop {
        sleep(poll_interval).await;

        if !shared.is_current(generation) {
            return MonitorExit::Superseded;
        }

        let Some(client) = shared.client().await else {
            return MonitorExit::LinkLost;
        };

        match client.poll_program().await {
            ProgramPoll::Running => {}
            ProgramPoll::Stopped => return MonitorExit::Completed,
            ProgramPoll::LinkLost => return MonitorExit::LinkLost,
        }

        if !shared.is_current(generation) {
            return MonitorExit::Superseded;
        }
        if matches!(max_wait, Some(limit) if started.elapsed() >= limit) {
            return MonitorExit::TimedOut;
        }
    }
}

/// Hold the safety output for the dwell period, then record the batch.
/// `stop` cannot shorten it; an emergency stop can, and the output is
/// released either way.
async fn run_safety_dwell(shared: &CellShared, generation: u64, target: u32, link_lost: bool) {
    let mut emergency = shared.emergency_signal();
    if !shared
        .set_state_if_current(generation, CellState::SafetyDwell)
        .await
    {
        return;
    }

    let dwell = shared.config.batch.safety_dwell();
    let safety_output = shared.config.outputs.safety;
    shared.notify(
        NoticeLevel::Info,
        format!("Security time started ({}s).", dwell.as_secs_f64()),
    );

    shared.set_output_logged(safety_output, true).await;
    if safety_output == shared.config.outputs.conveyor {
        shared.conveyor_on.store(true, Ordering::SeqCst);
    }

    let dwell_started = Utc::now();
    let clock = Instant::now();
    let interrupted = tokio::select! {
        _ = sleep(dwell) => false,
        _ = emergency.changed() => true,
    };
    let elapsed = clock.elapsed();

    shared.set_output_logged(safety_output, false).await;
    if safety_output == shared.config.outputs.conveyor {
        shared.conveyor_on.store(false, Ordering::SeqCst);
    }

    if interrupted || !shared.is_current(generation) {
        shared.notify(NoticeLevel::Warning, "Security time cut short by emergency stop");
        return;
    }

    let dwell_ended = dwell_started
        + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
    shared.notify(NoticeLevel::Info, "Security time finished.");

    let operator = shared.operator_name().await;
    let outcome = RunOutcome::batch(&operator, target, dwell_started, dwell_ended, link_lost);
    info!("Recording batch run: {}", outcome.encode_meta());
    shared.record(outcome).await;

    if shared.set_state_if_current(generation, CellState::Ready).await {
        shared.release_monitor(generation);
    }
    shared.notify(
        NoticeLevel::Info,
        format!("Batch finished: {} cycles. (saved)", target),
    );
}
