use std::collections::VecDeque;

use rand::Rng;

use super::*;

const MTU: u32 = 1200;

#[test]
fn test_initial_window() {
    let tests = [(1200, 4380), (1228, 4380), (1000, 4000), (3000, 6000), (500, 2000)];
    for (mtu, cwnd) in tests {
        let cc = CongestionControl::new(mtu, 65536);
        assert_eq!(cc.cwnd, cwnd, "mtu={mtu}");
        assert_eq!(cc.ssthresh, 65536);
        assert_eq!(cc.rwnd, 65536);
        assert_eq!(cc.inflight, 0);
    }
}

#[test]
fn test_can_send_respects_cwnd_and_rwnd() {
    let mut cc = CongestionControl::new(MTU, 100_000);
    cc.on_sent(4000);
    assert!(cc.can_send(380));
    assert!(!cc.can_send(381), "cwnd of 4380 exceeded");

    cc.set_rwnd(4200);
    assert!(cc.can_send(200));
    assert!(!cc.can_send(201), "rwnd of 4200 exceeded");
}

#[test]
fn test_zero_window_lets_one_chunk_through() {
    let mut cc = CongestionControl::new(MTU, 0);
    assert!(cc.can_send(MTU), "one chunk may go out into a closed window");

    cc.on_sent(MTU);
    assert!(!cc.can_send(1), "only while nothing is in flight");

    cc.on_acked(MTU);
    assert!(cc.can_send(MTU));
}

#[test]
fn test_slow_start_growth() {
    let mut cc = CongestionControl::new(MTU, 100_000);
    for _ in 0..3 {
        cc.on_sent(MTU);
    }

    cc.on_acked(MTU);
    cc.on_sack(MTU, 1, true, true);
    assert_eq!(cc.cwnd, 4380 + MTU);

    // growth per SACK is bounded by cwnd itself
    cc.on_sack(100_000, 2, true, true);
    assert_eq!(cc.cwnd, 2 * (4380 + MTU));
}

#[test]
fn test_slow_start_needs_utilized_window_and_advance() {
    let mut cc = CongestionControl::new(MTU, 100_000);

    cc.on_sack(MTU, 1, true, false);
    assert_eq!(cc.cwnd, 4380, "window was not fully used");

    cc.on_sack(MTU, 1, false, true);
    assert_eq!(cc.cwnd, 4380, "cumulative ack did not advance");
}

#[test]
fn test_congestion_avoidance_growth() {
    let mut cc = CongestionControl::new(MTU, 100_000);
    cc.cwnd = 10_000;
    cc.ssthresh = 5000;

    cc.on_sack(6000, 1, true, true);
    assert_eq!(cc.cwnd, 10_000);
    assert_eq!(cc.partial_bytes_acked, 6000);

    cc.on_sack(6000, 2, true, true);
    assert_eq!(cc.cwnd, 10_000 + MTU);
    assert_eq!(cc.partial_bytes_acked, 2000);
}

#[test]
fn test_retransmission_timeout_collapses_window() {
    let mut cc = CongestionControl::new(MTU, 100_000);
    cc.cwnd = 10_000;
    cc.partial_bytes_acked = 700;
    cc.on_retransmission_timeout();
    assert_eq!(cc.ssthresh, 5000);
    assert_eq!(cc.cwnd, MTU);
    assert_eq!(cc.partial_bytes_acked, 0);

    cc.cwnd = 3000;
    cc.on_retransmission_timeout();
    assert_eq!(cc.ssthresh, 2 * MTU, "ssthresh never drops below two MTUs");
}

#[test]
fn test_fast_retransmit_once_per_window() {
    let mut cc = CongestionControl::new(MTU, 100_000);
    cc.cwnd = 10_000;

    assert!(cc.on_fast_retransmit(20));
    assert!(cc.in_fast_recovery);
    assert_eq!(cc.fast_recover_exit_point, 20);
    assert_eq!(cc.ssthresh, 5000);
    assert_eq!(cc.cwnd, 5000);

    assert!(!cc.on_fast_retransmit(25), "already in fast recovery");
    assert_eq!(cc.cwnd, 5000);
    assert_eq!(cc.fast_recover_exit_point, 20);

    cc.on_sack(MTU, 19, true, true);
    assert!(cc.in_fast_recovery);
    assert_eq!(cc.cwnd, 5000, "no growth while recovering");

    cc.on_sack(MTU, 20, true, true);
    assert!(!cc.in_fast_recovery);
    assert!(cc.on_fast_retransmit(30), "a new loss window may enter again");
}

#[test]
fn test_window_gate_holds_over_random_traffic() {
    let mut rng = rand::thread_rng();

    for _ in 0..50 {
        let mut cc = CongestionControl::new(MTU, rng.gen_range(0..200_000));
        let mut outstanding: VecDeque<u32> = VecDeque::new();
        let mut cum_tsn = 0u32;

        for _ in 0..500 {
            match rng.gen_range(0..10) {
                0..=5 => {
                    let len = rng.gen_range(1..=MTU);
                    let before = cc.inflight;
                    if cc.can_send(len) {
                        assert!(
                            before == 0 || before + len <= std::cmp::min(cc.cwnd, cc.rwnd),
                            "inflight={before} len={len} cwnd={} rwnd={}",
                            cc.cwnd,
                            cc.rwnd
                        );
                        cc.on_sent(len);
                        outstanding.push_back(len);
                    }
                }
                6..=7 => {
                    let n = rng.gen_range(0..=outstanding.len());
                    let acked: u32 = outstanding.drain(..n).sum();
                    cum_tsn = cum_tsn.wrapping_add(n as u32);
                    cc.on_acked(acked);
                    cc.on_sack(acked, cum_tsn, n > 0, rng.gen());
                    cc.set_rwnd(rng.gen_range(0..200_000));
                }
                8 => cc.on_retransmission_timeout(),
                _ => {
                    cc.on_fast_retransmit(cum_tsn.wrapping_add(outstanding.len() as u32));
                }
            }

            assert_eq!(cc.inflight, outstanding.iter().sum::<u32>());
            assert!(cc.cwnd >= MTU);
        }
    }
}
