use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use crate::time_key::{local_time, TimeKeyError};
use crate::worker::{Worker, WorkerError};

/// Runs refreshes at the configured local hours until cancelled.
///
/// On start, a refresh runs immediately if today's samples or, past the publication cutoff,
/// tomorrow's prices are missing. Failing runs are logged and retried at the next run hour.
///
/// # Arguments
///
/// * 'worker' - the orchestrator to run
/// * 'run_hours' - local hours of day to run at
/// * 'tz' - market timezone
/// * 'cancel' - token to stop the loop
pub async fn run(worker: &Worker, run_hours: &[u32], tz: Tz, cancel: CancellationToken) -> Result<(), WorkerError> {
    info!("scheduler started, run hours {:?} in {}", run_hours, tz);

    match worker.needs_refresh(Utc::now()).await {
        Ok(true) => {
            info!("missing data detected at startup, refreshing now");
            refresh(worker, &cancel).await;
        },
        Ok(false) => info!("stored data is current"),
        Err(e) => warn!("could not check stored data at startup: {}", e),
    }

    loop {
        let now = Utc::now();
        let next = next_run(now, run_hours, tz)?;
        info!("next refresh at {}", next.with_timezone(&tz));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler stopped");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                refresh(worker, &cancel).await;
            }
        }
    }

    Ok(())
}

async fn refresh(worker: &Worker, cancel: &CancellationToken) {
    match worker.refresh_all(Utc::now(), cancel).await {
        Ok(summary) if summary.rate_limited => warn!("refresh stopped by rate limit after {} users", summary.success_count),
        Ok(_) => {},
        Err(e) => error!("refresh failed: {}", e),
    }
}

/// Returns the first configured local run hour strictly after `now`.
/// Hours that do not exist on a day, due to a DST switch, are skipped for that day.
///
/// # Arguments
///
/// * 'now' - current time
/// * 'run_hours' - local hours of day to run at
/// * 'tz' - market timezone
pub fn next_run(now: DateTime<Utc>, run_hours: &[u32], tz: Tz) -> Result<DateTime<Utc>, TimeKeyError> {
    let today = now.with_timezone(&tz).date_naive();

    let mut candidates = Vec::new();
    for date in today.iter_days().take(3) {
        for hour in run_hours {
            let Some(time) = NaiveTime::from_hms_opt(*hour, 0, 0) else { continue };
            if let Ok(local) = local_time(date.and_time(time), tz) {
                candidates.push(local.with_timezone(&Utc));
            }
        }
    }

    candidates
        .into_iter()
        .filter(|c| *c > now)
        .min()
        .ok_or_else(|| TimeKeyError::MalformedTimestamp(format!("no run hour after {} in {:?}", now, run_hours)))
}
