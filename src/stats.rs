//! 엔진 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 엔진 전체 카운터 (처리기와 링크 루프가 공유)
#[derive(Debug)]
pub struct LtpStats {
    start_time: Instant,

    pub segments_sent: AtomicU64,
    pub segments_received: AtomicU64,
    pub data_segments_sent: AtomicU64,
    pub data_segments_received: AtomicU64,
    pub checkpoints_sent: AtomicU64,

    /// 재전송 (리포트 응답, 체크포인트 타이머)
    pub retransmissions: AtomicU64,

    pub reports_sent: AtomicU64,
    pub reports_received: AtomicU64,
    pub report_acks_sent: AtomicU64,
    pub report_acks_received: AtomicU64,
    pub cancels_sent: AtomicU64,
    pub cancels_received: AtomicU64,

    pub blocks_sent: AtomicU64,
    pub blocks_received: AtomicU64,
    pub blocks_cancelled: AtomicU64,

    /// 형식 오류로 버린 데이터그램
    pub decode_errors: AtomicU64,

    pub miscolored: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    /// 송신 실패
    pub send_errors: AtomicU64,
}

impl Default for LtpStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LtpStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            segments_sent: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            data_segments_sent: AtomicU64::new(0),
            data_segments_received: AtomicU64::new(0),
            checkpoints_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            reports_sent: AtomicU64::new(0),
            reports_received: AtomicU64::new(0),
            report_acks_sent: AtomicU64::new(0),
            report_acks_received: AtomicU64::new(0),
            cancels_sent: AtomicU64::new(0),
            cancels_received: AtomicU64::new(0),
            blocks_sent: AtomicU64::new(0),
            blocks_received: AtomicU64::new(0),
            blocks_cancelled: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            miscolored: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    /// 카운터 1 증가
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            elapsed: self.elapsed(),
            segments_sent: load(&self.segments_sent),
            segments_received: load(&self.segments_received),
            data_segments_sent: load(&self.data_segments_sent),
            data_segments_received: load(&self.data_segments_received),
            checkpoints_sent: load(&self.checkpoints_sent),
            retransmissions: load(&self.retransmissions),
            reports_sent: load(&self.reports_sent),
            reports_received: load(&self.reports_received),
            report_acks_sent: load(&self.report_acks_sent),
            report_acks_received: load(&self.report_acks_received),
            cancels_sent: load(&self.cancels_sent),
            cancels_received: load(&self.cancels_received),
            blocks_sent: load(&self.blocks_sent),
            blocks_received: load(&self.blocks_received),
            blocks_cancelled: load(&self.blocks_cancelled),
            decode_errors: load(&self.decode_errors),
            miscolored: load(&self.miscolored),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            send_errors: load(&self.send_errors),
        }
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub segments_sent: u64,
    pub segments_received: u64,
    pub data_segments_sent: u64,
    pub data_segments_received: u64,
    pub checkpoints_sent: u64,
    pub retransmissions: u64,
    pub reports_sent: u64,
    pub reports_received: u64,
    pub report_acks_sent: u64,
    pub report_acks_received: u64,
    pub cancels_sent: u64,
    pub cancels_received: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
    pub blocks_cancelled: u64,
    pub decode_errors: u64,
    pub miscolored: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
}

impl StatsSnapshot {
    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 데이터 세그먼트 대비 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.data_segments_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.data_segments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Blocks: sent {} / recv {} / cancelled {} | Segments: {} out, {} in | Retrans: {:.2}% | Reports: {}/{} | Throughput: {:.2} MB/s",
            self.elapsed.as_secs_f64(),
            self.blocks_sent,
            self.blocks_received,
            self.blocks_cancelled,
            self.segments_sent,
            self.segments_received,
            self.retransmission_rate() * 100.0,
            self.reports_sent,
            self.reports_received,
            self.send_throughput() / 1_000_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = LtpStats::new();
        LtpStats::incr(&stats.data_segments_sent);
        LtpStats::incr(&stats.data_segments_sent);
        LtpStats::incr(&stats.data_segments_sent);
        LtpStats::incr(&stats.data_segments_sent);
        LtpStats::incr(&stats.retransmissions);
        LtpStats::add(&stats.bytes_sent, 4000);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.data_segments_sent, 4);
        assert_eq!(snapshot.bytes_sent, 4000);
        assert!((snapshot.retransmission_rate() - 0.25).abs() < 1e-9);
        assert!(snapshot.summary().contains("Retrans: 25.00%"));
    }

    #[test]
    fn test_empty_rates() {
        let snapshot = StatsSnapshot::default();
        assert_eq!(snapshot.retransmission_rate(), 0.0);
        assert_eq!(snapshot.send_throughput(), 0.0);
    }
}
