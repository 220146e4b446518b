//! Batch progress derived from page rows.
//!
//! Nothing here touches the database: [`derive_progress`] is a pure function
//! of the batch row and its pages, so the stored progress columns can always
//! be rebuilt and never drift from the pages.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::batch_repo::{BatchProgress, BatchRow};
use crate::db::page_repo::PageRow;
use crate::db::stats_repo::StatusCounts;
use crate::db::{BatchStatus, PageStatus};

pub fn count_pages(pages: &[PageRow]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for page in pages {
        counts.add(page.status, 1);
    }
    counts
}

/// Batch status from page counts. An empty batch is complete.
pub fn derive_status(counts: &StatusCounts) -> BatchStatus {
    if counts.completed == counts.total {
        BatchStatus::Completed
    } else if counts.processing > 0 {
        BatchStatus::Processing
    } else if counts.error > 0 {
        BatchStatus::Error
    } else if counts.paused > 0 {
        BatchStatus::Paused
    } else if counts.pending == counts.total {
        BatchStatus::Pending
    } else {
        // Some pages done, the rest waiting for a worker.
        BatchStatus::Processing
    }
}

/// Completed share in percent, rounded to one decimal.
pub fn percentage(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (processed as f64 / total as f64 * 1000.0).round() / 10.0
}

fn idle_label(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "Queued",
        BatchStatus::Processing => "Waiting",
        BatchStatus::Completed => "Completed",
        BatchStatus::Error => "Failed",
        BatchStatus::Paused => "Paused",
    }
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Average time per completed page, extrapolated over the remaining pages.
fn estimate_completion(
    started_at: &str,
    processed: u64,
    remaining: u64,
    now: DateTime<Utc>,
) -> Option<String> {
    if processed == 0 || remaining == 0 {
        return None;
    }
    let elapsed = now.signed_duration_since(parse_ts(started_at)?);
    if elapsed <= chrono::Duration::zero() {
        return None;
    }
    let per_page = elapsed / i32::try_from(processed).ok()?;
    let remaining_time = per_page * i32::try_from(remaining).ok()?;
    Some(format_ts(now + remaining_time))
}

/// Rebuilds the progress columns of `batch` from `pages`.
pub fn derive_progress(batch: &BatchRow, pages: &[PageRow], now: DateTime<Utc>) -> BatchProgress {
    let counts = count_pages(pages);
    let status = derive_status(&counts);

    let active = pages
        .iter()
        .filter(|p| p.status == PageStatus::Processing)
        .max_by_key(|p| {
            (
                p.processing_phase.map(|ph| ph.rank()).unwrap_or(0),
                std::cmp::Reverse(p.page_number),
            )
        });
    let current_stage = match active {
        Some(page) => page.next_phase().label().to_string(),
        None => idle_label(status).to_string(),
    };

    let first_claim = pages.iter().filter_map(|p| p.started_at.as_deref()).min();
    let started_at = batch
        .started_at
        .clone()
        .or_else(|| first_claim.map(str::to_string));

    let completed_at = if status == BatchStatus::Completed {
        batch.completed_at.clone().or_else(|| Some(format_ts(now)))
    } else {
        None
    };

    let remaining = counts.total - counts.completed;
    let estimated_completion = match (status, started_at.as_deref()) {
        (BatchStatus::Processing, Some(started)) => {
            estimate_completion(started, counts.completed, remaining, now)
        }
        _ => None,
    };

    let error_message = if counts.error > 0 {
        let first = pages
            .iter()
            .filter(|p| p.status == PageStatus::Error)
            .min_by_key(|p| p.page_number)
            .and_then(|p| p.error_message.as_deref())
            .unwrap_or("unknown error");
        Some(format!("{} page(s) failed: {}", counts.error, first))
    } else {
        None
    };

    BatchProgress {
        processed_pages: counts.completed as i64,
        percentage: percentage(counts.completed, counts.total),
        status,
        current_stage: Some(current_stage),
        current_file: None,
        current_page: active.map(|p| p.page_number),
        started_at,
        completed_at,
        estimated_completion,
        error_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProcessingPhase;

    const T0: &str = "2026-01-01T00:00:00.000000Z";

    fn batch(total: i64) -> BatchRow {
        BatchRow::new_pending("b1", "src", "Batch", total, T0)
    }

    fn page(n: i64, status: PageStatus) -> PageRow {
        let mut p = PageRow::new_pending(&format!("p{n}"), "b1", n, T0);
        p.status = status;
        p
    }

    fn at(secs: i64) -> DateTime<Utc> {
        parse_ts(T0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_all_pending_is_pending() {
        let pages = vec![page(1, PageStatus::Pending), page(2, PageStatus::Pending)];
        let progress = derive_progress(&batch(2), &pages, at(0));
        assert_eq!(progress.status, BatchStatus::Pending);
        assert_eq!(progress.current_stage.as_deref(), Some("Queued"));
        assert_eq!(progress.percentage, 0.0);
    }

    #[test]
    fn test_error_with_siblings_done() {
        let mut failed = page(2, PageStatus::Error);
        failed.error_message = Some("image unreachable (not found)".into());
        let pages = vec![page(1, PageStatus::Completed), failed, page(3, PageStatus::Completed)];
        let progress = derive_progress(&batch(3), &pages, at(10));
        assert_eq!(progress.status, BatchStatus::Error);
        assert_eq!(progress.processed_pages, 2);
        assert_eq!(progress.percentage, 66.7);
        assert_eq!(
            progress.error_message.as_deref(),
            Some("1 page(s) failed: image unreachable (not found)")
        );
        assert!(progress.completed_at.is_none());
    }

    #[test]
    fn test_completed_iff_all_pages_completed() {
        let pages = vec![page(1, PageStatus::Completed), page(2, PageStatus::Completed)];
        let progress = derive_progress(&batch(2), &pages, at(5));
        assert_eq!(progress.status, BatchStatus::Completed);
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(progress.completed_at.as_deref(), Some(format_ts(at(5)).as_str()));
        assert!(progress.error_message.is_none());
    }

    #[test]
    fn test_active_page_drives_stage_label() {
        let mut running = page(2, PageStatus::Processing);
        running.processing_phase = Some(ProcessingPhase::Translation);
        running.phase1_completed_at = Some(T0.into());
        running.started_at = Some(T0.into());
        let pages = vec![page(1, PageStatus::Completed), running, page(3, PageStatus::Pending)];
        let progress = derive_progress(&batch(3), &pages, at(30));
        assert_eq!(progress.status, BatchStatus::Processing);
        assert_eq!(progress.current_page, Some(2));
        assert_eq!(progress.current_stage.as_deref(), Some("Translating"));
        assert_eq!(progress.started_at.as_deref(), Some(T0));
        // One page took 30s, two remain.
        assert_eq!(progress.estimated_completion.as_deref(), Some(format_ts(at(90)).as_str()));
    }

    #[test]
    fn test_mixed_pending_and_completed_is_processing() {
        let pages = vec![page(1, PageStatus::Completed), page(2, PageStatus::Pending)];
        assert_eq!(derive_status(&count_pages(&pages)), BatchStatus::Processing);
    }

    #[test]
    fn test_percentage_rounding() {
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(0, 0), 100.0);
    }
}
