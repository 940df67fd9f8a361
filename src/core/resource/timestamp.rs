// src/core/resource/timestamp.rs

use super::{
    Acquire, HolderId, LockRequest, LockResource, ResourceKind, TIMESTAMP_NAME, Wakeup,
    bracketed_quantity, defer, drain_waiters, forget_waiter,
};
use crate::core::FlomError;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;
use tracing::warn;

const MAX_FRACTION_DIGITS: usize = 6;

/// Hands out formatted timestamps that are unique at the resolution of the
/// format, with at most `N` outstanding at once.
///
/// The format follows strftime, plus `#f` .. `#ffffff` for one to six digits
/// of fractions of a second. A requester that arrives while the current
/// timestamp is already taken waits for the clock to move on.
#[derive(Debug)]
pub struct TimestampResource {
    name: String,
    total: u32,
    stamper: Stamper,
    holders: Vec<HolderId>,
    waiters: VecDeque<(HolderId, ())>,
}

/// Issues timestamps and remembers the last one it issued.
#[derive(Debug)]
struct Stamper {
    format: String,
    /// Smallest step the format can show, in whole seconds or in microseconds.
    interval_secs: i64,
    interval_micros: u32,
    last_secs: i64,
    last_micros: u32,
}

impl Stamper {
    fn new(name: &str, format: &str) -> Result<Self, FlomError> {
        let reason = |reason: &str| FlomError::ResourceInit {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if StrftimeItems::new(&expand_fractions(format, 0))
            .any(|item| matches!(item, Item::Error))
        {
            return Err(reason("invalid timestamp format"));
        }

        let (interval_secs, interval_micros) = match fraction_digits(format) {
            Some(digits) => (0, 10u32.pow((MAX_FRACTION_DIGITS - digits) as u32)),
            None if ["%c", "%r", "%s", "%S", "%T", "%X"]
                .iter()
                .any(|s| format.contains(s)) =>
            {
                (1, 0)
            }
            None if ["%M", "%R"].iter().any(|s| format.contains(s)) => (60, 0),
            None if ["%H", "%I"].iter().any(|s| format.contains(s)) => (3600, 0),
            None => {
                return Err(reason("format must change at least once per hour"));
            }
        };
        Ok(Self {
            format: format.to_string(),
            interval_secs,
            interval_micros,
            last_secs: 0,
            last_micros: 0,
        })
    }

    /// Whether `now` falls in a later step than the last issued timestamp.
    fn can_issue(&self, now: &DateTime<Local>) -> bool {
        let (secs, micros) = (now.timestamp(), now.timestamp_subsec_micros());
        if self.interval_micros > 0 {
            secs > self.last_secs
                || micros / self.interval_micros > self.last_micros / self.interval_micros
        } else {
            secs / self.interval_secs > self.last_secs / self.interval_secs
        }
    }

    fn issue(&mut self, now: &DateTime<Local>) -> Option<String> {
        self.last_secs = now.timestamp();
        self.last_micros = now.timestamp_subsec_micros();

        let pattern = expand_fractions(&self.format, self.last_micros);
        let mut out = String::new();
        match write!(out, "{}", now.format(&pattern)) {
            Ok(()) => Some(out),
            Err(_) => {
                warn!("Failed to format timestamp with '{}'", self.format);
                None
            }
        }
    }

    /// When the next step begins, as seconds and microseconds since the epoch.
    fn next_step(&self) -> (i64, u32) {
        let mut secs = if self.interval_secs > 0 {
            (self.last_secs / self.interval_secs + 1) * self.interval_secs
        } else {
            self.last_secs
        };
        let mut micros = if self.interval_micros > 0 {
            (self.last_micros / self.interval_micros + 1) * self.interval_micros
        } else {
            0
        };
        if micros >= 1_000_000 {
            secs += 1;
            micros -= 1_000_000;
        }
        (secs, micros)
    }
}

/// The number of fraction digits the format asks for, longest marker first.
fn fraction_digits(format: &str) -> Option<usize> {
    (1..=MAX_FRACTION_DIGITS)
        .rev()
        .find(|&digits| format.contains(&fraction_marker(digits)))
}

fn fraction_marker(digits: usize) -> String {
    format!("#{}", "f".repeat(digits))
}

/// Replaces every fraction marker with a dot and the leading digits of `micros`.
fn expand_fractions(format: &str, micros: u32) -> String {
    let value = format!("{micros:06}");
    let mut expanded = format.to_string();
    for digits in (1..=MAX_FRACTION_DIGITS).rev() {
        expanded = expanded.replace(&fraction_marker(digits), &format!(".{}", &value[..digits]));
    }
    expanded
}

impl TimestampResource {
    pub fn new(name: &str) -> Result<Self, FlomError> {
        let total = bracketed_quantity(name, &TIMESTAMP_NAME, 2)?;
        let format = TIMESTAMP_NAME
            .captures(name)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        Ok(Self {
            name: name.to_string(),
            total,
            stamper: Stamper::new(name, &format)?,
            holders: Vec::new(),
            waiters: VecDeque::new(),
        })
    }

    pub fn acquire_at(
        &mut self,
        holder: HolderId,
        request: &LockRequest,
        now: DateTime<Local>,
    ) -> Acquire {
        if self.holders.contains(&holder) {
            return Acquire::Impossible;
        }
        if self.waiters.is_empty()
            && self.holders.len() < self.total as usize
            && self.stamper.can_issue(&now)
        {
            self.holders.push(holder);
            return Acquire::Granted {
                element: self.stamper.issue(&now),
            };
        }
        defer(&mut self.waiters, holder, request.wait, ())
    }

    pub fn release_at(&mut self, holder: HolderId, now: DateTime<Local>) -> Vec<Wakeup> {
        if let Some(pos) = self.holders.iter().position(|h| *h == holder) {
            self.holders.swap_remove(pos);
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }
        self.serve(now)
    }

    /// Serves waiters the clock now allows; at most one per step.
    pub fn serve(&mut self, now: DateTime<Local>) -> Vec<Wakeup> {
        let total = self.total as usize;
        let stamper = &mut self.stamper;
        let holders = &mut self.holders;
        drain_waiters(&mut self.waiters, |waiter, _| {
            if holders.len() < total && stamper.can_issue(&now) {
                holders.push(waiter);
                Some(stamper.issue(&now))
            } else {
                None
            }
        })
    }

    /// How long until the next waiter may be served. `None` when nobody waits
    /// or every slot is taken, since only a release can help then.
    pub fn deadline_from(&self, now: DateTime<Local>) -> Option<Duration> {
        if self.waiters.is_empty() || self.holders.len() >= self.total as usize {
            return None;
        }
        let (secs, micros) = self.stamper.next_step();
        let step = secs * 1_000_000 + micros as i64;
        let current = now.timestamp() * 1_000_000 + now.timestamp_subsec_micros() as i64;
        Some(Duration::from_micros(step.saturating_sub(current).max(0) as u64))
    }
}

impl LockResource for TimestampResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Timestamp
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        self.acquire_at(holder, request, Local::now())
    }

    fn release(&mut self, holder: HolderId, _rollback: bool) -> Vec<Wakeup> {
        self.release_at(holder, Local::now())
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.deadline_from(Local::now())
    }

    fn on_deadline(&mut self) -> Vec<Wakeup> {
        self.serve(Local::now())
    }

    fn holder_count(&self) -> usize {
        self.holders.len()
    }

    fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
