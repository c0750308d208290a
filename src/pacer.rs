//! 이웃별 송신 페이싱과 세그먼트 큐
//!
//! 토큰 버킷이 필요한 만큼 지연 요소를 큐에 끼워 넣고, 링크 드레인 루프는
//! 큐를 순서대로 비우면서 지연을 지킨다. 별도 스케줄러 스레드가 없다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ids::{ReportSerial, SessionId};

/// 세션 유효성 토큰
///
/// 세션이 닫히면 무효화되고, 큐에 남은 그 세션의 세그먼트는 보내지 않고 버린다.
#[derive(Debug, Clone)]
pub struct SessionToken(Arc<AtomicBool>);

impl SessionToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

/// 큐에 넣은 세그먼트가 실제로 송신될 때 알릴 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitTag {
    /// 송신 블록의 데이터 세그먼트 (블록 내 인덱스)
    Data { session_id: SessionId, index: usize },

    /// 수신측 리포트
    Report {
        session_id: SessionId,
        serial: ReportSerial,
    },

    CancelFromSender { session_id: SessionId },
    CancelFromReceiver { session_id: SessionId },

    /// 알림 불필요 (리포트 확인, 취소 확인)
    Untracked,
}

impl TransmitTag {
    /// 송신측 처리기로 보내야 하는지
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            TransmitTag::Data { .. } | TransmitTag::CancelFromSender { .. }
        )
    }

    /// 수신측 처리기로 보내야 하는지
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            TransmitTag::Report { .. } | TransmitTag::CancelFromReceiver { .. }
        )
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            TransmitTag::Data { session_id, .. }
            | TransmitTag::Report { session_id, .. }
            | TransmitTag::CancelFromSender { session_id }
            | TransmitTag::CancelFromReceiver { session_id } => Some(session_id),
            TransmitTag::Untracked => None,
        }
    }
}

/// 인코딩이 끝난 송신 대기 세그먼트
#[derive(Debug, Clone)]
pub struct QueuedSegment {
    pub bytes: Bytes,
    pub tag: TransmitTag,

    /// 세션 토큰 (없으면 항상 유효)
    pub token: Option<SessionToken>,
}

impl QueuedSegment {
    pub fn new(bytes: Bytes, tag: TransmitTag, token: Option<SessionToken>) -> Self {
        Self { bytes, tag, token }
    }

    pub fn is_valid(&self) -> bool {
        self.token.as_ref().map_or(true, SessionToken::is_valid)
    }
}

/// 큐 요소
#[derive(Debug, Clone)]
pub enum QueueElement {
    /// 드레인 루프가 이만큼 쉰 뒤 다음 요소로 진행
    Delay(Duration),
    Segment(QueuedSegment),
}

/// 토큰 버킷 페이서
///
/// 크레딧이 음수면 쌓인 여유분, 양수면 초과분이다. 초과분만큼 지연을 넣고
/// 그 지연 동안 흐를 크레딧을 미리 돌려받는다.
#[derive(Debug)]
pub struct TokenBucket {
    /// 초당 세그먼트 수
    rate_limit: f64,

    /// 최대 저축 크레딧
    burst_size: f64,

    credit: f64,
    last_ts: Instant,
}

impl TokenBucket {
    pub fn new(rate_limit: u32, burst_size: u32) -> Self {
        Self {
            rate_limit: rate_limit.max(1) as f64,
            burst_size: burst_size as f64,
            credit: -(burst_size as f64),
            last_ts: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate_limit: u32, burst_size: u32) {
        self.rate_limit = rate_limit.max(1) as f64;
        self.burst_size = burst_size as f64;
    }

    /// 세그먼트 한 개 송신 전에 필요한 지연 (처음에는 버스트만큼 저축된 상태)
    pub fn admit(&mut self, now: Instant) -> Option<Duration> {
        let slot_secs = 1.0 / self.rate_limit;
        let elapsed = now.saturating_duration_since(self.last_ts).as_secs_f64();
        self.last_ts = now;

        self.credit = (self.credit - elapsed / slot_secs).max(-self.burst_size);
        self.credit += 1.0;

        if self.credit <= 0.0 {
            return None;
        }
        let delay_ms = (self.credit * 1000.0 / self.rate_limit).ceil().max(1.0);
        self.credit -= delay_ms * self.rate_limit / 1000.0;
        Some(Duration::from_millis(delay_ms as u64))
    }

    pub fn credit(&self) -> f64 {
        self.credit
    }
}

/// 드레인 결과
#[derive(Debug)]
pub enum Dequeued {
    Segment(QueuedSegment),

    /// 지연 중, 이 시각 이후 다시 시도
    NotReady(Instant),

    Empty,
}

#[derive(Debug)]
struct QueueInner {
    elements: VecDeque<QueueElement>,
    ready_at: Option<Instant>,
    pacer: TokenBucket,
}

/// 이웃 하나의 송신 큐
///
/// 큐 자체 잠금만 사용하며, 외부에는 enqueue/dequeue만 노출한다.
#[derive(Debug)]
pub struct SegmentQueue {
    inner: Mutex<QueueInner>,
    notify: Arc<Notify>,
}

impl SegmentQueue {
    /// `notify`는 링크 드레인 루프를 깨우는 공유 신호
    pub fn new(rate_limit: u32, burst_size: u32, notify: Arc<Notify>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                elements: VecDeque::new(),
                ready_at: None,
                pacer: TokenBucket::new(rate_limit, burst_size),
            }),
            notify,
        }
    }

    /// 페이서를 거쳐 세그먼트 추가
    pub fn push(&self, segment: QueuedSegment) {
        {
            let mut inner = self.inner.lock();
            if let Some(delay) = inner.pacer.admit(Instant::now()) {
                inner.elements.push_back(QueueElement::Delay(delay));
            }
            inner.elements.push_back(QueueElement::Segment(segment));
        }
        self.notify.notify_one();
    }

    /// 다음 세그먼트 꺼내기
    ///
    /// 앞쪽 지연 요소는 준비 시각으로 바꾸고, 무효 세그먼트는 버린다.
    pub fn pop(&self, now: Instant) -> Dequeued {
        let mut inner = self.inner.lock();
        loop {
            if let Some(ready_at) = inner.ready_at {
                if ready_at > now {
                    return Dequeued::NotReady(ready_at);
                }
                inner.ready_at = None;
            }
            match inner.elements.pop_front() {
                Some(QueueElement::Delay(delay)) => {
                    inner.ready_at = Some(now + delay);
                }
                Some(QueueElement::Segment(segment)) => {
                    if segment.is_valid() {
                        return Dequeued::Segment(segment);
                    }
                }
                None => return Dequeued::Empty,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().elements.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.elements.clear();
        inner.ready_at = None;
    }

    pub fn set_rate(&self, rate_limit: u32, burst_size: u32) {
        self.inner.lock().pacer.set_rate(rate_limit, burst_size);
    }
}
