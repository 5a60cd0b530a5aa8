//! Completion detection independent of the queue's own notifications: poll the
//! result table until a row for the job shows up.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::models::job::JobId;
use crate::models::result::ResultRecord;
use crate::services::storage::{ResultTable, StorageError};

/// Poll `table` every `poll_interval` until a row for `job_id` exists or
/// `timeout` elapses. `Ok(None)` means the deadline passed without a row.
pub async fn wait_for_result(
    table: &dyn ResultTable,
    job_id: JobId,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Option<ResultRecord>, StorageError> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(record) = table.find_by_job(job_id).await? {
            return Ok(Some(record));
        }

        if Instant::now() + poll_interval > deadline {
            tracing::debug!(job_id = %job_id, "No result row before deadline");
            return Ok(None);
        }

        sleep(poll_interval).await;
    }
}
