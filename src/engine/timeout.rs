//! Per-operation timeouts and the supervisor that tracks active deadlines.

use std::time::Duration;

use tokio::time::Instant;

use super::queue::OpKind;

/// Timeout requested for a single operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Use the socket's default timeout at the moment the operation becomes active.
    #[default]
    Default,
    /// No deadline.
    Never,
    /// Fail the operation if it is still active after this long.
    After(Duration),
}

impl Timeout {
    /// Seconds-based constructor. Negative (or non-finite) seconds mean [`Timeout::Never`].
    pub fn from_secs_f64(secs: f64) -> Self {
        match secs_to_duration(secs) {
            Some(d) => Timeout::After(d),
            None => Timeout::Never,
        }
    }

    /// Resolve against the socket default.
    pub fn resolve(self, socket_default: Option<Duration>) -> Option<Duration> {
        match self {
            Timeout::Default => socket_default,
            Timeout::Never => None,
            Timeout::After(d) => Some(d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Timeout::Never, Timeout::After)
    }
}

/// Map seconds to an optional duration; negative means "no timeout".
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Deadline slot for the active operation of one kind.
#[derive(Debug, Clone, Copy)]
struct Armed {
    deadline: Option<Instant>,
}

/// Tracks the deadline of the active read and the active write.
///
/// A slot is "armed" from the moment its operation becomes active until it
/// completes, even when the operation has no deadline; that is how the
/// engine knows a head has already been activated and must not pick up a
/// later change of the socket default.
#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    read: Option<Armed>,
    write: Option<Armed>,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: OpKind) -> &mut Option<Armed> {
        match kind {
            OpKind::Read => &mut self.read,
            OpKind::Write => &mut self.write,
        }
    }

    /// Arm the slot for a newly active operation.
    pub fn arm(&mut self, kind: OpKind, deadline: Option<Instant>) {
        *self.slot(kind) = Some(Armed { deadline });
    }

    /// Clear the slot after its operation completed or was cancelled.
    pub fn disarm(&mut self, kind: OpKind) {
        *self.slot(kind) = None;
    }

    pub fn is_armed(&self, kind: OpKind) -> bool {
        match kind {
            OpKind::Read => self.read.is_some(),
            OpKind::Write => self.write.is_some(),
        }
    }

    /// Deadline of the active operation of `kind`, if it has one.
    pub fn deadline(&self, kind: OpKind) -> Option<Instant> {
        match kind {
            OpKind::Read => self.read.and_then(|a| a.deadline),
            OpKind::Write => self.write.and_then(|a| a.deadline),
        }
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.deadline(OpKind::Read), self.deadline(OpKind::Write)) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Kind whose deadline has passed at `now`. Reads are reported first.
    pub fn expired(&self, now: Instant) -> Option<OpKind> {
        [OpKind::Read, OpKind::Write]
            .into_iter()
            .find(|kind| self.deadline(*kind).is_some_and(|d| d <= now))
    }

    pub fn clear(&mut self) {
        self.read = None;
        self.write = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_seconds_mean_never() {
        assert_eq!(Timeout::from_secs_f64(-1.0), Timeout::Never);
        assert_eq!(Timeout::from_secs_f64(f64::NAN), Timeout::Never);
        assert_eq!(
            Timeout::from_secs_f64(1.5),
            Timeout::After(Duration::from_millis(1500))
        );
        assert_eq!(secs_to_duration(-0.5), None);
        assert_eq!(secs_to_duration(0.0), Some(Duration::ZERO));
    }

    #[test]
    fn test_resolve() {
        let default = Some(Duration::from_secs(3));
        assert_eq!(Timeout::Default.resolve(default), default);
        assert_eq!(Timeout::Default.resolve(None), None);
        assert_eq!(Timeout::Never.resolve(default), None);
        assert_eq!(
            Timeout::After(Duration::from_secs(1)).resolve(None),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_arm_and_expire() {
        let now = Instant::now();
        let mut supervisor = TimeoutSupervisor::new();

        supervisor.arm(OpKind::Read, Some(now + Duration::from_secs(2)));
        supervisor.arm(OpKind::Write, Some(now + Duration::from_secs(1)));

        assert_eq!(supervisor.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(supervisor.expired(now), None);
        assert_eq!(
            supervisor.expired(now + Duration::from_secs(1)),
            Some(OpKind::Write)
        );
        assert_eq!(
            supervisor.expired(now + Duration::from_secs(5)),
            Some(OpKind::Read)
        );
    }

    #[test]
    fn test_armed_without_deadline() {
        let mut supervisor = TimeoutSupervisor::new();
        supervisor.arm(OpKind::Read, None);

        assert!(supervisor.is_armed(OpKind::Read));
        assert_eq!(supervisor.next_deadline(), None);
        assert_eq!(supervisor.expired(Instant::now()), None);

        supervisor.disarm(OpKind::Read);
        assert!(!supervisor.is_armed(OpKind::Read));
    }
}
