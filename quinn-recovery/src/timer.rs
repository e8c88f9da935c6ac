use crate::Instant;

/// Kinds of timeouts needed to run the recovery logic
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to send an ACK for received ack-eliciting application data packets
    MaxAckDelay = 1,
    /// When to try raising the PMTU again after discovery completed
    PmtuRaise = 2,
}

impl Timer {
    pub(crate) const VALUES: [Self; 3] = [Self::LossDetection, Self::MaxAckDelay, Self::PmtuRaise];
}

/// Keeps track of the nearest timeout for each `Timer`
///
/// Every timer is one-shot: setting an armed timer replaces its deadline, and stopping a timer
/// that is not armed does nothing.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; Timer::VALUES.len()],
}

impl TimerTable {
    /// Arms `timer`, replacing any previous deadline
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self, timer: Timer) -> bool {
        self.data[timer as usize].is_some()
    }

    /// Get the next queued timeout
    pub(crate) fn peek(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Remove the earliest timer that expires at or before `now`
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<(Timer, Instant)> {
        let (timer, time) = Timer::VALUES
            .iter()
            .filter_map(|&timer| Some((timer, self.data[timer as usize]?)))
            .filter(|&(_, time)| time <= now)
            .min_by_key(|&(_, time)| time)?;
        self.stop(timer);
        Some((timer, time))
    }
}
