//! Cron schedules.
//!
//! Connections carry standard 5-field expressions (`min hour dom month dow`,
//! Sunday = 0 or 7). The `cron` crate wants a leading seconds field and counts
//! weekdays from Sunday = 1, so 5-field input is rewritten before parsing.
//! Expressions with 6 or 7 fields keep the `cron` crate's weekday numbering.
//!
//! When both day-of-month and day-of-week are restricted a time matches if
//! either does, as in standard cron. `cron` requires both, so such an
//! expression is split into one schedule per day field.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;

const DAY_OF_MONTH: usize = 3;
const DAY_OF_WEEK: usize = 5;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> FlowResult<Self> {
        let invalid = |reason: String| Error::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };
        let schedules = normalize(expr)?
            .iter()
            .map(|normalized| Schedule::from_str(normalized).map_err(|e| invalid(e.to_string())))
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(Self {
            expr: expr.to_string(),
            schedules,
        })
    }

    /// First fire time strictly after `anchor`.
    pub fn next_after(&self, anchor: DateTime<Utc>) -> FlowResult<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&anchor).next())
            .min()
            .ok_or_else(|| Error::InvalidSchedule {
                expr: self.expr.clone(),
                reason: "schedule never fires again".to_string(),
            })
    }
}

/// Parse `expr` and return its next fire time after `anchor`.
pub fn next_fire(expr: &str, anchor: DateTime<Utc>) -> FlowResult<DateTime<Utc>> {
    CronSchedule::parse(expr)?.next_after(anchor)
}

/// Rewrite `expr` into one or two expressions the `cron` crate reads with
/// standard semantics.
fn normalize(expr: &str) -> FlowResult<Vec<String>> {
    let trimmed = expr.trim();
    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }
    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => {
            fields[4] = day_of_week(&fields[4]);
            fields.insert(0, "0".to_string());
        }
        6 | 7 => {}
        n => {
            return Err(Error::InvalidSchedule {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, found {n}"),
            })
        }
    }

    if !restricted(&fields[DAY_OF_MONTH]) || !restricted(&fields[DAY_OF_WEEK]) {
        return Ok(vec![fields.join(" ")]);
    }
    let mut by_month_day = fields.clone();
    by_month_day[DAY_OF_WEEK] = "*".to_string();
    let mut by_weekday = fields;
    by_weekday[DAY_OF_MONTH] = "*".to_string();
    Ok(vec![by_month_day.join(" "), by_weekday.join(" ")])
}

/// A day field starting with `*` or `?` matches every day.
fn restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

/// Shift numeric weekdays from Sunday = 0 to Sunday = 1.
fn day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            if let Some(step) = step {
                if let Some(days) = stepped_days(base, step) {
                    return days;
                }
                return format!("{}/{step}", shift_days(base));
            }
            shift_days(base)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_days(base: &str) -> String {
    match base.split_once('-') {
        Some((from, to)) => match (from.parse::<u8>(), to.parse::<u8>()) {
            (Ok(0), Ok(7)) => "1-7".to_string(),
            (Ok(from), Ok(7)) if from > 0 => format!("{}-7,1", from + 1),
            (Ok(from), Ok(to)) => format!("{}-{}", from + 1, to + 1),
            _ => base.to_string(),
        },
        None => match base.parse::<u8>() {
            Ok(7) => "1".to_string(),
            Ok(n) => (n + 1).to_string(),
            Err(_) => base.to_string(),
        },
    }
}

/// Expand a numeric stepped range (`1-7/2`, `3/2`) into explicit shifted
/// days, since a range ending on Sunday = 7 wraps around in `cron` numbering.
fn stepped_days(base: &str, step: &str) -> Option<String> {
    let step = step.parse::<u8>().ok().filter(|s| *s > 0)?;
    let (from, to) = match base.split_once('-') {
        Some((from, to)) => (from.parse::<u8>().ok()?, to.parse::<u8>().ok()?),
        None => (base.parse::<u8>().ok()?, 7),
    };
    if from > to || to > 7 {
        return None;
    }
    let days: BTreeSet<u8> = (from..=to)
        .step_by(step as usize)
        .map(|day| if day == 7 { 1 } else { day + 1 })
        .collect();
    Some(days.iter().map(u8::to_string).collect::<Vec<_>>().join(","))
}
