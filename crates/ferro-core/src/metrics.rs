//! Derived statistics over the task collection. Everything here is a pure
//! function of a task snapshot; callers recompute on read.

use crate::{Task, TaskStatus};
use chrono::NaiveDate;

pub const TREND_DAYS: usize = 7;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub avg_progress: f64,
    /// completed / total, as a percentage. 0 for an empty collection.
    pub success_rate: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendBucket {
    pub day: NaiveDate,
    pub total: usize,
    pub completed: usize,
}

pub fn task_stats(tasks: &[Task]) -> TaskStats {
    let mut stats = TaskStats {
        total: tasks.len(),
        ..TaskStats::default()
    };
    let mut progress_sum = 0.0;
    for task in tasks {
        match task.status {
            TaskStatus::Pending => stats.pending += 1,
            TaskStatus::Processing => stats.processing += 1,
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Error => stats.error += 1,
        }
        progress_sum += task.progress_clamped();
    }
    if stats.total > 0 {
        let total = stats.total as f64;
        stats.avg_progress = progress_sum / total;
        stats.success_rate = stats.completed as f64 / total * 100.0;
        stats.error_rate = stats.error as f64 / total * 100.0;
    }
    stats
}

/// Activity per calendar day of `updated_at` over the rolling week ending
/// at `today`: chronological, missing days zero-filled, exactly
/// `TREND_DAYS` buckets.
pub fn weekly_trend(tasks: &[Task], today: NaiveDate) -> Vec<TrendBucket> {
    let mut buckets: Vec<TrendBucket> = (0..TREND_DAYS)
        .rev()
        .filter_map(|offset| today.checked_sub_days(chrono::Days::new(offset as u64)))
        .map(|day| TrendBucket {
            day,
            total: 0,
            completed: 0,
        })
        .collect();
    for task in tasks {
        let day = task.updated_at.date_naive();
        if let Some(bucket) = buckets.iter_mut().find(|bucket| bucket.day == day) {
            bucket.total += 1;
            if task.status == TaskStatus::Completed {
                bucket.completed += 1;
            }
        }
    }
    buckets
}
