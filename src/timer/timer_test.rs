use std::time::{Duration, Instant};

use super::rto_manager::*;
use super::*;

#[derive(Debug)]
struct RecordingTimers {
    now: Instant,
    next_id: u64,
    scheduled: Vec<(TimerHandle, Duration)>,
    cancelled: Vec<TimerHandle>,
}

impl RecordingTimers {
    fn new() -> Self {
        RecordingTimers {
            now: Instant::now(),
            next_id: 0,
            scheduled: vec![],
            cancelled: vec![],
        }
    }
}

impl TimerService for RecordingTimers {
    fn now(&self) -> Instant {
        self.now
    }

    fn schedule_after(&mut self, delay: Duration) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle::new(self.next_id);
        self.scheduled.push((handle, delay));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.push(handle);
    }
}

mod test_rto_manager {
    use super::*;

    fn default_manager() -> RtoManager {
        RtoManager::new(3000, 1000, 60000)
    }

    #[test]
    fn test_rto_manager_initial_values() {
        let m = default_manager();
        assert_eq!(m.rto, 3000, "should be rtoInitial");
        assert_eq!(m.get_rto(), 3000, "should be rtoInitial");
        assert_eq!(m.srtt, 0, "should be 0");
        assert_eq!(m.rttvar, 0.0, "should be 0.0");
    }

    #[test]
    fn test_rto_manager_rto_calculation_small_rtt() {
        let mut m = default_manager();
        let exp = [
            1800, 1500, 1275, 1106, 1000, // capped at RTO.Min
        ];

        for (i, expected) in exp.iter().enumerate() {
            m.set_new_rtt(600);
            assert_eq!(m.get_rto(), *expected, "should be equal: {i}");
        }
    }

    #[test]
    fn test_rto_manager_rto_calculation_large_rtt() {
        let mut m = default_manager();
        let exp = [
            60000, // capped at RTO.Max
            60000, // capped at RTO.Max
            60000, // capped at RTO.Max
            55312, 48984,
        ];

        for (i, expected) in exp.iter().enumerate() {
            m.set_new_rtt(30000);
            assert_eq!(m.get_rto(), *expected, "should be equal: {i}");
        }
    }

    #[test]
    fn test_rto_manager_calculate_next_timeout() {
        let tests = [
            (0, 1),
            (1, 2),
            (2, 4),
            (30, 60000),
            (63, 60000),
            (64, 60000),
        ];
        for (n_rtos, expected) in tests {
            assert_eq!(
                calculate_next_timeout(1, n_rtos, 60000),
                expected,
                "after {n_rtos} expiries"
            );
        }
    }

    #[test]
    fn test_rto_manager_backoff_uses_configured_max() {
        let m = RtoManager::new(1000, 100, 5000);
        assert_eq!(m.backoff(0), 1000);
        assert_eq!(m.backoff(2), 4000);
        assert_eq!(m.backoff(3), 5000);
    }
}

mod test_timer_table {
    use super::*;

    #[test]
    fn test_timer_table_start_and_expire() {
        let mut svc = RecordingTimers::new();
        let mut table = TimerTable::new();

        table.start(Timer::T3Rtx, &mut svc, Duration::from_secs(3));
        assert!(table.is_running(Timer::T3Rtx));
        let (handle, delay) = svc.scheduled[0];
        assert_eq!(delay, Duration::from_secs(3));

        assert_eq!(table.expire(handle), Some(Timer::T3Rtx));
        assert!(!table.is_running(Timer::T3Rtx));
        assert_eq!(table.expire(handle), None, "a handle fires only once");
    }

    #[test]
    fn test_timer_table_restart_makes_old_handle_stale() {
        let mut svc = RecordingTimers::new();
        let mut table = TimerTable::new();

        table.start(Timer::Ack, &mut svc, Duration::from_millis(200));
        table.start(Timer::Ack, &mut svc, Duration::from_millis(200));
        let stale = svc.scheduled[0].0;
        let current = svc.scheduled[1].0;

        assert_eq!(svc.cancelled, vec![stale]);
        assert_eq!(table.expire(stale), None);
        assert_eq!(table.expire(current), Some(Timer::Ack));
    }

    #[test]
    fn test_timer_table_stop_resets_retrans() {
        let mut svc = RecordingTimers::new();
        let mut table = TimerTable::new();

        table.start(Timer::T1Init, &mut svc, Duration::from_secs(1));
        assert_eq!(table.bump_retrans(Timer::T1Init), 1);
        assert_eq!(table.bump_retrans(Timer::T1Init), 2);
        assert_eq!(table.retrans(Timer::T1Init), 2);
        assert_eq!(table.retrans(Timer::T1Cookie), 0);

        table.stop(Timer::T1Init, &mut svc);
        assert!(!table.is_running(Timer::T1Init));
        assert_eq!(table.retrans(Timer::T1Init), 0);
        assert_eq!(svc.cancelled.len(), 1);

        // stopping an idle timer cancels nothing
        table.stop(Timer::T1Init, &mut svc);
        assert_eq!(svc.cancelled.len(), 1);
    }

    #[test]
    fn test_timer_table_stop_all() {
        let mut svc = RecordingTimers::new();
        let mut table = TimerTable::new();

        for timer in Timer::VALUES {
            table.start(timer, &mut svc, Duration::from_secs(1));
        }
        table.stop_all(&mut svc);

        assert_eq!(svc.cancelled.len(), Timer::VALUES.len());
        for (handle, _) in svc.scheduled.clone() {
            assert_eq!(table.expire(handle), None);
        }
    }
}
