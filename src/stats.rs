//! Derived progress statistics and natural-key upserts
//!
//! `stats` and `streaks` on a [`UserProgress`] are always recomputed from its
//! task statuses; nothing else writes them.

use chrono::{DateTime, NaiveDate};
use std::collections::HashMap;

use crate::models::{JournalEntry, ProgressStats, Sprint, Streaks, TaskStatus, UserProgress};

/// Share of a day's tasks that must be done for the day to count as completed
pub const DAY_COMPLETION_THRESHOLD_PERCENT: usize = 80;

/// Insert or replace a task status by `(day_id, task_type, task_index)`
pub fn upsert_task_status(statuses: &mut Vec<TaskStatus>, status: TaskStatus) {
    match statuses.iter_mut().find(|s| s.same_key(&status)) {
        Some(existing) => *existing = status,
        None => statuses.push(status),
    }
}

/// Insert or replace a journal entry by `day_id`
pub fn upsert_journal_entry(entries: &mut Vec<JournalEntry>, entry: JournalEntry) {
    match entries.iter_mut().find(|e| e.day_id == entry.day_id) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

/// Recompute `stats` and `streaks` of `progress` against `sprint`
pub fn recompute(sprint: &Sprint, progress: &mut UserProgress, today: NaiveDate) {
    let completed_per_day = completed_per_day(sprint, &progress.task_statuses);
    let total_tasks = sprint.total_tasks();
    let total_completed: usize = completed_per_day.values().sum();

    let day_done: Vec<bool> = sprint
        .days
        .iter()
        .map(|day| {
            let tasks = day.task_count();
            let done = completed_per_day.get(day.day.as_str()).copied().unwrap_or(0);
            tasks > 0 && done * 100 >= tasks * DAY_COMPLETION_THRESHOLD_PERCENT
        })
        .collect();

    let completion_percentage = if total_tasks == 0 {
        0
    } else {
        ((total_completed as f64 / total_tasks as f64) * 100.0).round() as u32
    };

    progress.stats = ProgressStats {
        total_tasks_completed: total_completed as u32,
        total_days_completed: day_done.iter().filter(|d| **d).count() as u32,
        completion_percentage,
    };

    progress.streaks = Streaks {
        current_streak: current_streak(sprint, &day_done, today),
        longest_streak: longest_streak(&day_done),
        last_active_date: last_active_date(&progress.task_statuses),
    };
}

/// Completed statuses per day label, ignoring keys that point outside the sprint
fn completed_per_day<'a>(sprint: &'a Sprint, statuses: &[TaskStatus]) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for status in statuses.iter().filter(|s| s.completed) {
        let Some(day) = sprint.day(&status.day_id) else {
            continue;
        };
        if status.task_index < day.task_count_of(status.task_type) {
            *counts.entry(day.day.as_str()).or_insert(0) += 1;
        }
    }
    counts
}

fn longest_streak(day_done: &[bool]) -> u32 {
    let mut longest = 0;
    let mut run = 0;
    for done in day_done {
        run = if *done { run + 1 } else { 0 };
        longest = longest.max(run);
    }
    longest
}

fn current_streak(sprint: &Sprint, day_done: &[bool], today: NaiveDate) -> u32 {
    // Last day of the sprint that is not in the future
    let Some((mut idx, date)) = sprint
        .days
        .iter()
        .enumerate()
        .filter_map(|(i, d)| {
            NaiveDate::parse_from_str(&d.date, "%Y-%m-%d")
                .ok()
                .map(|date| (i, date))
        })
        .filter(|(_, date)| *date <= today)
        .last()
    else {
        return 0;
    };

    if !day_done[idx] {
        // Today is still open; a past incomplete day ends the streak
        if date < today || idx == 0 {
            return 0;
        }
        idx -= 1;
    }

    day_done[..=idx].iter().rev().take_while(|d| **d).count() as u32
}

fn last_active_date(statuses: &[TaskStatus]) -> Option<String> {
    statuses
        .iter()
        .filter(|s| s.completed)
        .filter_map(|s| s.completed_at.as_deref())
        .filter_map(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .max()
        .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}
