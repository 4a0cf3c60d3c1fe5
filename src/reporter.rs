//! Periodic stat delivery to the controller.
//!
//! The reporter owns the receiving end of the stat channel.  Records
//! accumulate between ticks; every report interval the pending batch is
//! shipped in one POST of `{"data_list": [...]}`.  Delivery is best-effort
//! by design: a failed batch is logged and discarded, never retried and
//! never allowed to block traffic generation.
//!
//! When the engine shuts down it drops the sending half of the channel; the
//! reporter then flushes whatever queued after the last tick and exits, so
//! the tail of a run is not lost.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::stats::StatRecord;

/// Body shape the controller expects.
#[derive(Serialize)]
struct StatReport<'a> {
    data_list: &'a [StatRecord],
}

/// Hard cap on how long one delivery attempt may take.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the reporter until the stat channel closes.
///
/// Spawned by the engine alongside the send loop.
pub async fn run(
    controller_url: String,
    report_interval: Duration,
    mut records: mpsc::UnboundedReceiver<StatRecord>,
) {
    log::info!("stat reporter started; posting to {controller_url} every {report_interval:?}");
    let client = match reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            log::error!("stat reporter could not build HTTP client: {e}");
            // Keep draining so the engine never blocks on a full queue.
            while records.recv().await.is_some() {}
            return;
        }
    };

    let mut pending: Vec<StatRecord> = Vec::new();
    let mut ticker = tokio::time::interval(report_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&client, &controller_url, &mut pending).await;
            }
            maybe = records.recv() => {
                match maybe {
                    Some(record) => pending.push(record),
                    None => {
                        // Engine shut down: one final flush for the tail.
                        flush(&client, &controller_url, &mut pending).await;
                        break;
                    }
                }
            }
        }
    }
    log::info!("stat reporter stopped");
}

/// Deliver the pending batch, discarding it whether or not the POST lands.
async fn flush(client: &reqwest::Client, url: &str, pending: &mut Vec<StatRecord>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    log::debug!("posting {} stat record(s)", batch.len());
    match client.post(url).json(&StatReport { data_list: &batch }).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            log::error!(
                "controller rejected stat batch ({}); {} record(s) discarded",
                response.status(),
                batch.len()
            );
        }
        Err(e) => {
            log::error!("stat delivery failed: {e}; {} record(s) discarded", batch.len());
        }
    }
}
