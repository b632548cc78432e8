#[cfg(test)]
mod timer_test;

pub(crate) mod rto_manager;

use std::time::{Duration, Instant};

const TIMER_COUNT: usize = 6;

/// Identifies one scheduled expiry handed out by a [`TimerService`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        TimerHandle(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The clock and timer facility an association runs on.
///
/// An association never sleeps: it asks for a one-shot expiry with
/// `schedule_after` and expects the owner to call
/// [`Association::handle_timeout`](crate::Association::handle_timeout) with
/// the returned handle once the delay has elapsed. A cancelled handle must
/// not be delivered, but delivering one anyway is harmless.
pub trait TimerService {
    fn now(&self) -> Instant;
    fn schedule_after(&mut self, delay: Duration) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum Timer {
    T1Init = 0,
    T1Cookie = 1,
    T2Shutdown = 2,
    T3Rtx = 3,
    Ack = 4,
    Heartbeat = 5,
}

impl Timer {
    pub(crate) const VALUES: [Self; TIMER_COUNT] = [
        Timer::T1Init,
        Timer::T1Cookie,
        Timer::T2Shutdown,
        Timer::T3Rtx,
        Timer::Ack,
        Timer::Heartbeat,
    ];
}

/// The running handle and the consecutive expiry count of each distinct kind
/// of `Timer`.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    handles: [Option<TimerHandle>; TIMER_COUNT],
    retrans: [u32; TIMER_COUNT],
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        TimerTable::default()
    }

    /// Arms `timer`, replacing (and cancelling) a previous expiry of the same
    /// kind. The retransmission count is left untouched.
    pub(crate) fn start(&mut self, timer: Timer, service: &mut dyn TimerService, after: Duration) {
        if let Some(old) = self.handles[timer as usize].take() {
            service.cancel(old);
        }
        self.handles[timer as usize] = Some(service.schedule_after(after));
    }

    /// Disarms `timer` and clears its retransmission count.
    pub(crate) fn stop(&mut self, timer: Timer, service: &mut dyn TimerService) {
        if let Some(old) = self.handles[timer as usize].take() {
            service.cancel(old);
        }
        self.retrans[timer as usize] = 0;
    }

    pub(crate) fn stop_all(&mut self, service: &mut dyn TimerService) {
        for timer in Timer::VALUES {
            self.stop(timer, service);
        }
    }

    pub(crate) fn is_running(&self, timer: Timer) -> bool {
        self.handles[timer as usize].is_some()
    }

    /// Resolves a fired handle to the timer it belongs to and marks that
    /// timer as no longer running. Handles that were replaced or cancelled
    /// resolve to `None`.
    pub(crate) fn expire(&mut self, handle: TimerHandle) -> Option<Timer> {
        let timer = Timer::VALUES
            .into_iter()
            .find(|t| self.handles[*t as usize] == Some(handle))?;
        self.handles[timer as usize] = None;
        Some(timer)
    }

    /// Counts one more consecutive expiry of `timer` and returns the new count.
    pub(crate) fn bump_retrans(&mut self, timer: Timer) -> u32 {
        self.retrans[timer as usize] += 1;
        self.retrans[timer as usize]
    }

    #[cfg(test)]
    pub(crate) fn retrans(&self, timer: Timer) -> u32 {
        self.retrans[timer as usize]
    }

    pub(crate) fn reset_retrans(&mut self, timer: Timer) {
        self.retrans[timer as usize] = 0;
    }
}
