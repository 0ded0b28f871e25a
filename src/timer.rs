use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::trace;

/// First instant of the form `anchor + k * period` strictly after `after` (or `anchor` itself if
/// that is still ahead). Computing from the anchor each time keeps firings in phase however
/// late a wakeup is. `None` if the period is zero or the result is unrepresentable.
pub fn next_fire_after(anchor: DateTime<Utc>, period: Duration, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if after < anchor {
        return Some(anchor);
    }
    let period_ns = i128::try_from(period.as_nanos()).ok().filter(|p| *p > 0)?;
    let elapsed_ns = i128::from((after - anchor).num_nanoseconds()?);
    let periods = elapsed_ns / period_ns + 1;
    let offset = i64::try_from(periods.checked_mul(period_ns)?).ok()?;
    anchor.checked_add_signed(TimeDelta::nanoseconds(offset))
}

/// Owns one recurring timer thread. Cancelled when dropped; an event already delivered is not
/// recalled.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}
impl TimerHandle {
    pub fn cancel(self) {
        drop(self);
    }
}
impl Drop for TimerHandle {
    fn drop(&mut self) {
        // Disconnecting wakes the timer thread, which then exits.
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Send `event` to `events` at every `anchor + k * period` from now on, until the returned
/// handle is dropped or `events` is disconnected.
pub fn schedule_recurring<E>(
    name: String,
    anchor: DateTime<Utc>,
    period: Duration,
    event: E,
    events: Sender<E>,
) -> anyhow::Result<TimerHandle>
where
    E: Clone + Send + 'static,
{
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let thread = std::thread::Builder::new()
        .name(format!("timer {}", name))
        .spawn(move || {
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = Utc::now();
                // Never fire the same instant twice, even if woken early.
                let after = last_fired.map_or(now, |last| last.max(now));
                let Some(next) = next_fire_after(anchor, period, after) else {
                    // Nothing to do but wait to be cancelled.
                    let _ = cancel_rx.recv();
                    return;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                match cancel_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        trace!("timer {} fired for {}", name, next);
                        last_fired = Some(next);
                        if events.send(event.clone()).is_err() {
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .context("failed to spawn timer thread")?;
    Ok(TimerHandle {
        cancel: Some(cancel_tx),
        thread: Some(thread),
    })
}
