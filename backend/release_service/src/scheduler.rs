//! Background task that keeps time-driven protocol work moving: payout
//! retries whose back-off has elapsed, attempts interrupted by a restart,
//! and review leases that have expired.

use std::sync::Arc;
use std::time::Duration;

use escrow_protocol::{DisbursementResult, EscrowProtocol};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct SchedulerState {
    pub protocol: Arc<EscrowProtocol>,
    pub interval: Duration,
    pub shutdown: CancellationToken,
}

/// Run the scheduler loop until `shutdown` is cancelled.
pub async fn run(state: Arc<SchedulerState>) {
    info!("Scheduler starting, interval {:?}", state.interval);

    loop {
        tick(&state.protocol).await;

        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(state.interval) => {}
        }
    }
}

/// One pass over leases and due disbursements.
async fn tick(protocol: &EscrowProtocol) {
    match protocol.sweep_expired_leases().await {
        Ok(0) => {}
        Ok(n) => warn!("Returned {n} expired review leases to the queue"),
        Err(e) => error!("Lease sweep error: {e}"),
    }

    match protocol.resume_due_disbursements().await {
        Ok(results) if !results.is_empty() => {
            let released = results
                .iter()
                .filter(|r| matches!(r, DisbursementResult::Released { .. }))
                .count();
            info!(
                "Resumed {} disbursements, {released} released",
                results.len()
            );
        }
        Ok(_) => {}
        Err(e) => error!("Disbursement resume error: {e}"),
    }
}
