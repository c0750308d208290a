//! 수신 처리기 (RFC 5326 §8.2 수신측 상태 기계)
//!
//! 수신 세션 상태는 이 처리기 하나만 변경한다.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::block::{
    InboundBlock, OutstandingCancel, OutstandingReport, ReceivedSegment, ReceiverState,
};
use crate::engine::EngineShared;
use crate::ids::{EngineId, ReportSerial, SessionId};
use crate::listener::{LtpListener, ReceivedBlock};
use crate::neighbor::Neighbor;
use crate::pacer::{QueuedSegment, SessionToken, TransmitTag};
use crate::payload::Payload;
use crate::report::ReportSegment;
use crate::segment::{CancelReason, DataKind, DataSegment, Segment, SegmentBody};
use crate::stats::LtpStats;
use crate::timer::TimerManager;

/// 수신측 타이머 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InboundTimer {
    Report(SessionId, ReportSerial),
    Cancel(SessionId),
}

impl InboundTimer {
    pub fn session_id(&self) -> &SessionId {
        match self {
            InboundTimer::Report(session_id, _) | InboundTimer::Cancel(session_id) => session_id,
        }
    }
}

/// 닫힌 세션 기억 개수
const CLOSED_SESSION_HISTORY: usize = 4096;

/// 최근 닫힌 세션 (늦게 도착한 중복 세그먼트가 세션을 되살리지 않도록)
#[derive(Debug, Default)]
struct ClosedSessions {
    order: VecDeque<SessionId>,
    set: HashSet<SessionId>,
}

impl ClosedSessions {
    fn insert(&mut self, session_id: SessionId) {
        if !self.set.insert(session_id.clone()) {
            return;
        }
        self.order.push_back(session_id);
        if self.order.len() > CLOSED_SESSION_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, session_id: &SessionId) -> bool {
        self.set.contains(session_id)
    }
}

/// 수신 처리기 명령
#[derive(Debug)]
pub enum InboundCmd {
    /// 송신측이 보낸 세그먼트 (데이터, 리포트 확인, 송신측 취소, 취소 확인)
    Received { segment: Segment, from: SocketAddr },

    TransmitStarted(TransmitTag),

    TimerExpired(InboundTimer, u64),

    NeighborScheduled { engine_id: EngineId, up: bool },

    Stop,
}

/// 수신 처리기
pub struct InboundProcessor {
    shared: EngineShared,
    blocks: HashMap<SessionId, InboundBlock>,
    closed: ClosedSessions,
    timers: TimerManager<InboundTimer, InboundCmd>,
}

impl InboundProcessor {
    pub fn new(shared: EngineShared, tx: mpsc::Sender<InboundCmd>) -> Self {
        let timers = TimerManager::new(tx, InboundCmd::TimerExpired)
            .with_enqueue_timeout(shared.config.queue_full_timeout());
        Self {
            shared,
            blocks: HashMap::new(),
            closed: ClosedSessions::default(),
            timers,
        }
    }

    /// 명령 큐 소비 루프
    pub async fn run(mut self, mut rx: mpsc::Receiver<InboundCmd>) {
        debug!("수신 처리기 시작");
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        self.close_all();
        debug!("수신 처리기 종료");
    }

    /// 명령 하나 처리. `Stop`이면 false.
    pub fn handle(&mut self, cmd: InboundCmd) -> bool {
        match cmd {
            InboundCmd::Received { segment, from } => self.on_segment(segment, from),
            InboundCmd::TransmitStarted(tag) => self.on_transmit_started(tag),
            InboundCmd::TimerExpired(key, generation) => {
                if self.timers.expired(&key, generation) {
                    match key {
                        InboundTimer::Report(session_id, serial) => {
                            self.on_report_expired(&session_id, serial)
                        }
                        InboundTimer::Cancel(session_id) => self.on_cancel_expired(&session_id),
                    }
                }
            }
            InboundCmd::NeighborScheduled { engine_id, up } => {
                if up {
                    self.timers.resume_neighbor(&engine_id);
                } else {
                    self.timers.suspend_neighbor(&engine_id);
                }
            }
            InboundCmd::Stop => return false,
        }
        true
    }

    pub fn session_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn state(&self, session_id: &SessionId) -> Option<ReceiverState> {
        self.blocks.get(session_id).map(|b| b.state)
    }

    pub fn block(&self, session_id: &SessionId) -> Option<&InboundBlock> {
        self.blocks.get(session_id)
    }

    fn listener(&self, block: &InboundBlock) -> Option<Arc<dyn LtpListener>> {
        self.shared.listeners.get(&block.service_id)
    }

    fn transmit_control(
        &self,
        neighbor: &Neighbor,
        segment: Segment,
        tag: TransmitTag,
        token: Option<SessionToken>,
    ) {
        match segment.to_bytes() {
            Ok(bytes) => neighbor.transmit(QueuedSegment::new(bytes, tag, token)),
            Err(e) => error!("제어 세그먼트 인코딩 실패 {}: {}", segment, e),
        }
    }

    /// 세션을 시작한 송신 엔진
    fn sender_neighbor(&self, session_id: &SessionId, from: SocketAddr) -> Option<Arc<Neighbor>> {
        self.shared
            .neighbors
            .get(&session_id.originator)
            .or_else(|| self.shared.neighbors.by_addr(from))
    }

    fn on_segment(&mut self, segment: Segment, from: SocketAddr) {
        let session_id = segment.session_id;
        match segment.body {
            SegmentBody::Data(ds) => self.on_data(session_id, ds, from),
            SegmentBody::ReportAck(serial) => self.on_report_ack(&session_id, serial),
            SegmentBody::CancelFromSender(reason) => {
                self.on_cancel_from_sender(session_id, reason, from)
            }
            SegmentBody::CancelAckToReceiver => self.on_cancel_ack(&session_id),
            other => warn!("수신 처리기로 잘못 전달된 세그먼트: {:?}", other),
        }
    }

    fn on_data(&mut self, session_id: SessionId, ds: DataSegment, from: SocketAddr) {
        LtpStats::incr(&self.shared.stats.data_segments_received);
        LtpStats::add(&self.shared.stats.bytes_received, ds.length());

        let neighbor = match self.sender_neighbor(&session_id, from) {
            Some(neighbor) => neighbor,
            None => {
                warn!("알 수 없는 송신 엔진의 데이터 무시: {} from {}", session_id, from);
                return;
            }
        };

        if !self.shared.listeners.is_registered(&ds.service_id) {
            warn!(
                "등록되지 않은 서비스 {}: session={} 수신측 취소",
                ds.service_id, session_id
            );
            self.transmit_control(
                &neighbor,
                Segment::new(
                    session_id,
                    SegmentBody::CancelFromReceiver(CancelReason::SystemCancelled),
                ),
                TransmitTag::Untracked,
                None,
            );
            LtpStats::incr(&self.shared.stats.cancels_sent);
            return;
        }

        let mut block = match self.blocks.remove(&session_id) {
            Some(block) => block,
            None if ds.is_resend() => {
                debug!("닫힌 세션의 재전송 세그먼트 무시: {}", session_id);
                return;
            }
            None if self.closed.contains(&session_id) => {
                debug!("이미 닫힌 세션의 세그먼트 무시: {}", session_id);
                return;
            }
            None => {
                let mut block = InboundBlock::new(
                    session_id.clone(),
                    neighbor.engine_id.clone(),
                    ds.service_id.clone(),
                );
                block.state = ReceiverState::DsRec;
                debug!("수신 세션 시작: {} (service {})", session_id, ds.service_id);
                if let Some(listener) = self.listener(&block) {
                    listener.on_session_started(&block.info());
                }
                block
            }
        };

        if block.state == ReceiverState::CrSent {
            trace!("취소 중인 세션의 데이터 무시: {}", session_id);
            self.blocks.insert(session_id, block);
            return;
        }

        if block.is_miscolored(ds.kind, ds.offset) {
            warn!(
                "색상 순서 위반: session={} {:?} @{}",
                session_id, ds.kind, ds.offset
            );
            LtpStats::incr(&self.shared.stats.miscolored);
            self.start_cancel(block, CancelReason::Miscolored);
            return;
        }

        let payload = if ds.length() > self.shared.config.segment_length_file_threshold {
            match self.shared.blobs.store(&ds.data) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("세그먼트 블롭 저장 실패: session={}: {}", session_id, e);
                    self.shared.listeners.system_error(
                        Some(&block.service_id),
                        &e.to_string(),
                        Some(&session_id),
                    );
                    self.blocks.insert(session_id, block);
                    return;
                }
            }
        } else {
            Payload::Memory(ds.data.clone())
        };

        if let Some(replaced) = block.insert(ReceivedSegment::new(ds.kind, ds.offset, payload.clone())) {
            self.shared.blobs.release(&replaced);
        }

        if ds.kind.is_green() {
            if let Some(listener) = self.listener(&block) {
                listener.on_green_segment_received(&block.info(), ds.offset, &payload);
            }
        }

        if ds.kind.is_checkpoint() {
            if block.reception_problems >= self.shared.config.reception_problems_limit {
                warn!(
                    "수신 문제 한도 초과: session={}, {}회",
                    session_id, block.reception_problems
                );
                self.start_cancel(block, CancelReason::RetransLimitExceeded);
                return;
            }
            if ds.is_resend() {
                block.reception_problems += 1;
            }
            if block.is_all_red_received() && !block.red_part_notified {
                block.red_part_notified = true;
                if let Some(listener) = self.listener(&block) {
                    listener.on_red_part_received(&block.info());
                }
            }
            self.send_reports(&mut block, &ds, &neighbor);
        }

        match (block.state, ds.kind) {
            (ReceiverState::DsRec, DataKind::RedCheckpointEorpEob) => {
                block.state = ReceiverState::WaitRpRec;
            }
            (ReceiverState::DsRec, DataKind::GreenEob) => {
                block.state = ReceiverState::WaitRpRec;
                self.check_delivery(block);
                return;
            }
            (ReceiverState::WaitRpRec, kind) if kind.is_green() => {
                self.check_delivery(block);
                return;
            }
            _ => {}
        }
        self.blocks.insert(session_id, block);
    }

    /// 체크포인트에 대한 리포트 생성 및 송신
    fn send_reports(&self, block: &mut InboundBlock, checkpoint: &DataSegment, neighbor: &Neighbor) {
        let ranges: Vec<(u64, u64)> = block.red_ranges().collect();
        let reports = match ReportSegment::generate(
            ranges,
            checkpoint.end(),
            checkpoint.checkpoint_serial,
            &mut block.report_serials,
            self.shared.config.max_claims_per_report,
        ) {
            Ok(reports) => reports,
            Err(e) => {
                warn!("리포트 생성 실패: session={}: {}", block.session_id, e);
                return;
            }
        };

        for report in reports {
            let serial = report.report_serial;
            debug!(
                "리포트 송신: session={} {} ({} claims, {}..{})",
                block.session_id,
                serial,
                report.claims.len(),
                report.lower_bound,
                report.upper_bound
            );
            block.outstanding_reports.insert(
                serial,
                OutstandingReport {
                    report: report.clone(),
                    transmit_enqueues: 1,
                },
            );
            self.transmit_report(block, report, neighbor);
        }
    }

    fn transmit_report(&self, block: &InboundBlock, report: ReportSegment, neighbor: &Neighbor) {
        let serial = report.report_serial;
        self.transmit_control(
            neighbor,
            Segment::new(block.session_id.clone(), SegmentBody::Report(report)),
            TransmitTag::Report {
                session_id: block.session_id.clone(),
                serial,
            },
            Some(block.token.clone()),
        );
        LtpStats::incr(&self.shared.stats.reports_sent);
    }

    fn on_report_ack(&mut self, session_id: &SessionId, serial: ReportSerial) {
        LtpStats::incr(&self.shared.stats.report_acks_received);
        let mut block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        let outstanding = match block.outstanding_reports.remove(&serial) {
            Some(outstanding) if block.state != ReceiverState::CrSent => outstanding,
            _ => {
                trace!("알 수 없는 리포트 확인 무시: {} {}", session_id, serial);
                self.blocks.insert(session_id.clone(), block);
                return;
            }
        };
        self.timers
            .stop(&InboundTimer::Report(session_id.clone(), serial));
        let acked = block.mark_acked(&outstanding.report);
        trace!("리포트 확인: session={} {} ({} 세그먼트)", session_id, serial, acked);

        if block.state == ReceiverState::WaitRpRec {
            self.check_delivery(block);
            return;
        }
        self.blocks.insert(session_id.clone(), block);
    }

    /// 블록 끝 이후 전달 가능 여부 판정
    ///
    /// 레드 파트 확인이 끝났는데 그린 파트에 빈 곳이 있으면 복구할 방법이 없으므로 취소한다.
    fn check_delivery(&mut self, block: InboundBlock) {
        if !block.is_red_settled() || !block.is_eob_received() {
            self.blocks.insert(block.session_id.clone(), block);
            return;
        }
        if block.is_all_green_received() {
            self.deliver(block);
        } else {
            warn!("그린 파트 누락, 세션 취소: {}", block.session_id);
            self.start_cancel(block, CancelReason::SystemCancelled);
        }
    }

    fn deliver(&mut self, mut block: InboundBlock) {
        let payload = match block.gather(
            &self.shared.blobs,
            self.shared.config.block_length_file_threshold,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                error!("블록 조립 실패: session={}: {}", block.session_id, e);
                self.shared.listeners.system_error(
                    Some(&block.service_id),
                    &e.to_string(),
                    Some(&block.session_id),
                );
                self.start_cancel(block, CancelReason::SystemCancelled);
                return;
            }
        };

        let info = block.info();
        self.close(&mut block);
        LtpStats::incr(&self.shared.stats.blocks_received);
        info!(
            "블록 수신 완료: session={}, {} bytes (red {}), {:.2}s",
            info.session_id,
            info.length,
            info.red_length,
            block.created_at.elapsed().as_secs_f64()
        );
        match self.listener(&block) {
            Some(listener) => listener.on_block_received(&ReceivedBlock { info, payload }),
            None => {
                warn!("전달할 리스너 없음: service={}", block.service_id);
                self.shared.blobs.release(&payload);
            }
        }
    }

    fn on_transmit_started(&mut self, tag: TransmitTag) {
        match tag {
            TransmitTag::Report { session_id, serial } => {
                if let Some(block) = self.blocks.get(&session_id) {
                    if block.state != ReceiverState::CrSent
                        && block.outstanding_reports.contains_key(&serial)
                    {
                        self.timers.start(
                            InboundTimer::Report(session_id, serial),
                            &block.neighbor,
                            self.shared.config.report_timeout(),
                        );
                    }
                }
            }
            TransmitTag::CancelFromReceiver { session_id } => {
                if let Some(block) = self.blocks.get(&session_id) {
                    if block.state == ReceiverState::CrSent {
                        self.timers.start(
                            InboundTimer::Cancel(session_id),
                            &block.neighbor,
                            self.shared.config.cancel_timeout(),
                        );
                    }
                }
            }
            other => trace!("수신 처리기와 무관한 송신 알림: {:?}", other),
        }
    }

    fn on_report_expired(&mut self, session_id: &SessionId, serial: ReportSerial) {
        let mut block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        if block.state == ReceiverState::CrSent {
            self.blocks.insert(session_id.clone(), block);
            return;
        }
        let (report, enqueues) = match block.outstanding_reports.get_mut(&serial) {
            Some(outstanding) => (outstanding.report.clone(), outstanding.transmit_enqueues),
            None => {
                self.blocks.insert(session_id.clone(), block);
                return;
            }
        };

        if enqueues > self.shared.config.max_report_retransmits {
            warn!(
                "리포트 재전송 한도 초과: session={} {}, {}회",
                session_id, serial, enqueues
            );
            self.start_cancel(block, CancelReason::RetransLimitExceeded);
            return;
        }
        if let Some(outstanding) = block.outstanding_reports.get_mut(&serial) {
            outstanding.transmit_enqueues += 1;
        }

        debug!("리포트 타이머 만료, 재전송: session={} {}", session_id, serial);
        LtpStats::incr(&self.shared.stats.retransmissions);
        match self.shared.neighbors.get(&block.neighbor) {
            Some(neighbor) => self.transmit_report(&block, report, &neighbor),
            None => warn!("이웃 {} 없음, 리포트 재전송 불가", block.neighbor),
        }
        self.blocks.insert(session_id.clone(), block);
    }

    /// CR_SENT로 전환하고 수신측 취소 송신
    fn start_cancel(&mut self, mut block: InboundBlock, reason: CancelReason) {
        let session_id = block.session_id.clone();
        self.timers.stop_where(|k| k.session_id() == &session_id);

        block.token.invalidate();
        block.token = SessionToken::new();
        block.state = ReceiverState::CrSent;
        block.cancel = Some(OutstandingCancel::new(reason));
        block.outstanding_reports.clear();
        block.release_segments(&self.shared.blobs);

        self.transmit_cancel(&mut block);
        self.blocks.insert(session_id, block);
    }

    fn transmit_cancel(&self, block: &mut InboundBlock) {
        let cancel = match block.cancel.as_mut() {
            Some(cancel) => cancel,
            None => return,
        };
        cancel.transmit_enqueues += 1;
        let reason = cancel.reason;
        match self.shared.neighbors.get(&block.neighbor) {
            Some(neighbor) => {
                self.transmit_control(
                    &neighbor,
                    Segment::new(
                        block.session_id.clone(),
                        SegmentBody::CancelFromReceiver(reason),
                    ),
                    TransmitTag::CancelFromReceiver {
                        session_id: block.session_id.clone(),
                    },
                    Some(block.token.clone()),
                );
                LtpStats::incr(&self.shared.stats.cancels_sent);
            }
            None => warn!("이웃 {} 없음, 수신측 취소 송신 불가", block.neighbor),
        }
    }

    fn on_cancel_expired(&mut self, session_id: &SessionId) {
        let mut block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        let cancel = match (block.state, block.cancel) {
            (ReceiverState::CrSent, Some(cancel)) => cancel,
            _ => {
                self.blocks.insert(session_id.clone(), block);
                return;
            }
        };
        if cancel.transmit_enqueues > self.shared.config.max_cancel_retransmits {
            warn!(
                "수신측 취소 재전송 한도 초과, 강제 종료: session={} ({})",
                session_id, cancel.reason
            );
            self.close_cancelled(block, cancel.reason);
            return;
        }
        debug!("수신측 취소 타이머 만료, 재전송: session={}", session_id);
        self.transmit_cancel(&mut block);
        self.blocks.insert(session_id.clone(), block);
    }

    fn on_cancel_ack(&mut self, session_id: &SessionId) {
        let block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        match (block.state, block.cancel) {
            (ReceiverState::CrSent, Some(cancel)) => {
                debug!("수신측 취소 확인: session={}", session_id);
                self.close_cancelled(block, cancel.reason);
            }
            _ => {
                self.blocks.insert(session_id.clone(), block);
            }
        }
    }

    fn on_cancel_from_sender(&mut self, session_id: SessionId, reason: CancelReason, from: SocketAddr) {
        LtpStats::incr(&self.shared.stats.cancels_received);
        let neighbor = self.sender_neighbor(&session_id, from);

        if let Some(block) = self.blocks.remove(&session_id) {
            info!("송신측 취소: session={} ({})", session_id, reason);
            self.close_cancelled(block, reason);
        }

        match neighbor {
            Some(neighbor) => self.transmit_control(
                &neighbor,
                Segment::new(session_id, SegmentBody::CancelAckToSender),
                TransmitTag::Untracked,
                None,
            ),
            None => warn!("송신측 취소 송신자를 알 수 없음: {}", from),
        }
    }

    /// 세션 정리 (타이머 정지, 큐 무효화, 블롭 삭제)
    fn close(&mut self, block: &mut InboundBlock) {
        let session_id = block.session_id.clone();
        self.timers.stop_where(|k| k.session_id() == &session_id);
        block.token.invalidate();
        block.outstanding_reports.clear();
        block.release_segments(&self.shared.blobs);
        block.state = ReceiverState::Closed;
        self.closed.insert(session_id);
    }

    fn close_cancelled(&mut self, mut block: InboundBlock, reason: CancelReason) {
        let info = block.info();
        self.close(&mut block);
        LtpStats::incr(&self.shared.stats.blocks_cancelled);
        if let Some(listener) = self.listener(&block) {
            listener.on_block_receive_cancelled(&info, reason);
        }
    }

    fn close_all(&mut self) {
        let sessions: Vec<SessionId> = self.blocks.keys().cloned().collect();
        for session_id in sessions {
            if let Some(block) = self.blocks.remove(&session_id) {
                debug!("종료로 수신 세션 닫음: {}", session_id);
                self.close_cancelled(block, CancelReason::SystemCancelled);
            }
        }
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CheckpointSerial, ServiceId};
    use crate::listener::{ChannelListener, LtpEvent};
    use crate::pacer::Dequeued;
    use crate::report::ReceptionClaim;
    use crate::Config;
    use bytes::Bytes;
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    const PEER_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 5113);

    struct Harness {
        processor: InboundProcessor,
        timer_rx: mpsc::Receiver<InboundCmd>,
        neighbor: Arc<Neighbor>,
        events: Receiver<LtpEvent>,
        _blob_dir: tempfile::TempDir,
    }

    fn peer() -> EngineId {
        EngineId::from(2)
    }

    fn service() -> ServiceId {
        ServiceId::from(1)
    }

    fn session() -> SessionId {
        SessionId::new(peer(), 77)
    }

    fn harness(mut config: Config) -> Harness {
        let blob_dir = tempfile::tempdir().unwrap();
        config.blob_dir = blob_dir.path().to_path_buf();
        config.segment_rate_limit = 1_000_000.0;
        config.burst_size = 10_000;

        let shared = EngineShared::for_test(config);
        let neighbor = shared.neighbors.add(peer(), SocketAddr::from(PEER_ADDR));
        let (listener, events) = ChannelListener::new();
        shared
            .listeners
            .register(service(), Arc::new(listener))
            .unwrap();

        let (tx, timer_rx) = mpsc::channel(64);
        Harness {
            processor: InboundProcessor::new(shared, tx),
            timer_rx,
            neighbor,
            events,
            _blob_dir: blob_dir,
        }
    }

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.block_length_file_threshold = 1 << 30;
        config.segment_length_file_threshold = 1 << 30;
        config
    }

    fn ds(kind: DataKind, offset: u64, len: usize, cp: u32, rs: u32) -> DataSegment {
        DataSegment {
            kind,
            service_id: service(),
            offset,
            checkpoint_serial: CheckpointSerial(cp),
            report_serial: ReportSerial(rs),
            data: Bytes::from(vec![(offset / 100) as u8; len]),
        }
    }

    impl Harness {
        fn receive(&mut self, body: SegmentBody) {
            self.processor.handle(InboundCmd::Received {
                segment: Segment::new(session(), body),
                from: SocketAddr::from(PEER_ADDR),
            });
        }

        fn data(&mut self, segment: DataSegment) {
            self.receive(SegmentBody::Data(segment));
        }

        fn drain(&mut self) -> Vec<Segment> {
            let mut out = Vec::new();
            loop {
                match self.neighbor.queue().pop(Instant::now()) {
                    Dequeued::Segment(queued) => {
                        out.push(Segment::decode(queued.bytes.clone()).unwrap());
                        self.processor
                            .handle(InboundCmd::TransmitStarted(queued.tag));
                    }
                    Dequeued::NotReady(_) => panic!("테스트 페이서는 지연이 없어야 함"),
                    Dequeued::Empty => return out,
                }
            }
        }

        fn reports(&mut self) -> Vec<ReportSegment> {
            self.drain()
                .into_iter()
                .map(|s| match s.body {
                    SegmentBody::Report(rs) => rs,
                    other => panic!("리포트가 아님: {:?}", other),
                })
                .collect()
        }

        async fn fire_timer(&mut self) {
            let cmd = self.timer_rx.recv().await.unwrap();
            self.processor.handle(cmd);
        }

        fn events(&self) -> Vec<LtpEvent> {
            self.events.try_iter().collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_red_block_delivered_after_report_ack() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Red, 0, 1000, 0, 0));
        h.data(ds(DataKind::Red, 1000, 1000, 0, 0));
        h.data(ds(DataKind::RedCheckpointEorpEob, 2000, 1000, 5, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::WaitRpRec));

        let reports = h.reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.checkpoint_serial, CheckpointSerial(5));
        assert_eq!(report.upper_bound, 3000);
        assert_eq!(report.claims, vec![ReceptionClaim::new(0, 3000)]);
        assert!(h
            .processor
            .timers
            .is_running(&InboundTimer::Report(session(), report.report_serial)));

        let events = h.events();
        assert!(matches!(events[0], LtpEvent::SessionStarted(_)));
        assert!(matches!(events[1], LtpEvent::RedPartReceived(_)));

        h.receive(SegmentBody::ReportAck(report.report_serial));
        assert_eq!(h.processor.session_count(), 0);
        assert!(h.processor.timers.is_empty());
        match &h.events()[..] {
            [LtpEvent::BlockReceived(block)] => {
                assert_eq!(block.info.length, 3000);
                assert_eq!(block.info.red_length, 3000);
                let bytes = block.payload.to_bytes().unwrap();
                assert_eq!(bytes[0], 0);
                assert_eq!(bytes[1500], 10);
                assert_eq!(bytes[2999], 20);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_report_and_resent_checkpoint() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Red, 0, 1000, 0, 0));
        h.data(ds(DataKind::RedCheckpointEorpEob, 2000, 1000, 5, 0));
        let first = h.reports().remove(0);
        assert_eq!(
            first.claims,
            vec![ReceptionClaim::new(0, 1000), ReceptionClaim::new(2000, 1000)]
        );

        // 송신측이 빈 구간을 체크포인트로 재전송
        h.data(ds(DataKind::RedCheckpoint, 1000, 1000, 6, first.report_serial.0));
        let second = h.reports().remove(0);
        assert_eq!(second.upper_bound, 2000);
        assert_eq!(second.claims, vec![ReceptionClaim::new(0, 2000)]);
        assert_eq!(
            h.processor.block(&session()).unwrap().reception_problems,
            1
        );

        h.receive(SegmentBody::ReportAck(first.report_serial));
        assert_eq!(h.processor.session_count(), 1);
        h.receive(SegmentBody::ReportAck(second.report_serial));
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(h.events().last(), Some(LtpEvent::BlockReceived(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miscolored_segment_cancels() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Green, 100, 10, 0, 0));
        h.data(ds(DataKind::Red, 150, 10, 0, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::CrSent));

        let out = h.drain();
        assert_eq!(
            out[0].body,
            SegmentBody::CancelFromReceiver(CancelReason::Miscolored)
        );
        assert!(h.processor.timers.is_running(&InboundTimer::Cancel(session())));

        // 취소 중에는 데이터 무시
        h.data(ds(DataKind::Green, 200, 10, 0, 0));
        assert!(h.drain().is_empty());

        h.receive(SegmentBody::CancelAckToReceiver);
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(
            h.events().last(),
            Some(LtpEvent::BlockReceiveCancelled(_, CancelReason::Miscolored))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_red_before_green_is_not_miscolored() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Green, 100, 10, 0, 0));
        h.data(ds(DataKind::Red, 50, 10, 0, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::DsRec));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_service_cancelled_without_session() {
        let mut h = harness(memory_config());
        let mut segment = ds(DataKind::RedCheckpointEorpEob, 0, 10, 1, 0);
        segment.service_id = ServiceId::from(99);
        h.data(segment);

        assert_eq!(h.processor.session_count(), 0);
        let out = h.drain();
        assert_eq!(
            out[0].body,
            SegmentBody::CancelFromReceiver(CancelReason::SystemCancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resent_segment_for_closed_session_discarded() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::RedCheckpoint, 0, 10, 3, 9));
        assert_eq!(h.processor.session_count(), 0);
        assert!(h.drain().is_empty());
        assert!(h.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_segment_after_delivery_discarded() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::RedCheckpointEorpEob, 0, 1000, 1, 0));
        let report = h.reports().remove(0);
        h.receive(SegmentBody::ReportAck(report.report_serial));
        assert_eq!(h.processor.session_count(), 0);
        h.events();

        // 늦게 도착한 원본 세그먼트 중복
        h.data(ds(DataKind::Red, 0, 1000, 0, 0));
        h.data(ds(DataKind::RedCheckpointEorpEob, 0, 1000, 1, 0));
        assert_eq!(h.processor.session_count(), 0);
        assert!(h.drain().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_closed_session_history_is_bounded() {
        let mut closed = ClosedSessions::default();
        let first = SessionId::new(EngineId::from(2), 0);
        for number in 0..=CLOSED_SESSION_HISTORY as u64 {
            closed.insert(SessionId::new(EngineId::from(2), number));
        }
        closed.insert(SessionId::new(EngineId::from(2), 5));
        assert_eq!(closed.order.len(), CLOSED_SESSION_HISTORY);
        assert_eq!(closed.set.len(), CLOSED_SESSION_HISTORY);
        assert!(!closed.contains(&first));
        assert!(closed.contains(&SessionId::new(EngineId::from(2), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_retransmit_limit() {
        let mut config = memory_config();
        config.max_report_retransmits = 1;
        config.report_timeout_ms = 100;
        let mut h = harness(config);
        h.data(ds(DataKind::RedCheckpointEorpEob, 0, 10, 1, 0));
        let report = h.reports().remove(0);

        h.fire_timer().await;
        let resent = h.reports();
        assert_eq!(resent, vec![report]);

        h.fire_timer().await;
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::CrSent));
        let out = h.drain();
        assert_eq!(
            out[0].body,
            SegmentBody::CancelFromReceiver(CancelReason::RetransLimitExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_green_block_with_lost_tail() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Green, 0, 100, 0, 0));
        h.data(ds(DataKind::Green, 100, 100, 0, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::DsRec));
        assert!(!h.processor.block(&session()).unwrap().is_complete());
        assert!(h.drain().is_empty());

        h.data(ds(DataKind::GreenEob, 200, 100, 0, 0));
        assert_eq!(h.processor.session_count(), 0);
        let events = h.events();
        let greens = events
            .iter()
            .filter(|e| matches!(e, LtpEvent::GreenSegmentReceived { .. }))
            .count();
        assert_eq!(greens, 3);
        assert!(matches!(events.last(), Some(LtpEvent::BlockReceived(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_green_gap_at_eob_cancels() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Green, 0, 100, 0, 0));
        h.data(ds(DataKind::GreenEob, 200, 100, 0, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::CrSent));
        assert_eq!(
            h.drain()[0].body,
            SegmentBody::CancelFromReceiver(CancelReason::SystemCancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_block_waits_for_red_ack() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::RedCheckpointEorp, 0, 100, 1, 0));
        let report = h.reports().remove(0);
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::DsRec));

        h.data(ds(DataKind::GreenEob, 100, 50, 0, 0));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::WaitRpRec));

        h.receive(SegmentBody::ReportAck(report.report_serial));
        assert_eq!(h.processor.session_count(), 0);
        match h.events().last() {
            Some(LtpEvent::BlockReceived(block)) => {
                assert_eq!(block.info.length, 150);
                assert_eq!(block.info.red_length, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_sender() {
        let mut h = harness(memory_config());
        h.data(ds(DataKind::Red, 0, 100, 0, 0));
        h.receive(SegmentBody::CancelFromSender(CancelReason::UserCancelled));

        assert_eq!(h.processor.session_count(), 0);
        assert_eq!(h.drain()[0].body, SegmentBody::CancelAckToSender);
        assert!(matches!(
            h.events().last(),
            Some(LtpEvent::BlockReceiveCancelled(_, CancelReason::UserCancelled))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reception_problem_limit() {
        let mut config = memory_config();
        config.reception_problems_limit = 1;
        let mut h = harness(config);
        h.data(ds(DataKind::RedCheckpointEorpEob, 1000, 100, 1, 0));
        h.reports();

        h.data(ds(DataKind::RedCheckpoint, 0, 100, 2, 7));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::WaitRpRec));
        h.reports();

        h.data(ds(DataKind::RedCheckpoint, 500, 100, 3, 8));
        assert_eq!(h.processor.state(&session()), Some(ReceiverState::CrSent));
        assert_eq!(
            h.drain()[0].body,
            SegmentBody::CancelFromReceiver(CancelReason::RetransLimitExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_block_spills_to_blob() {
        let mut config = Config::default();
        config.segment_length_file_threshold = 50;
        config.block_length_file_threshold = 150;
        let mut h = harness(config);
        let blob_dir = h._blob_dir.path().to_path_buf();

        h.data(ds(DataKind::Red, 0, 100, 0, 0));
        h.data(ds(DataKind::RedCheckpointEorpEob, 100, 100, 1, 0));
        assert_eq!(std::fs::read_dir(&blob_dir).unwrap().count(), 2);

        let report = h.reports().remove(0);
        h.receive(SegmentBody::ReportAck(report.report_serial));
        match h.events().last() {
            Some(LtpEvent::BlockReceived(block)) => {
                assert!(block.payload.is_file());
                let bytes = block.payload.to_bytes().unwrap();
                assert_eq!(bytes.len(), 200);
                assert_eq!(bytes[150], 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        // 세그먼트 블롭은 지워지고 전달된 블록 파일만 남음
        assert_eq!(std::fs::read_dir(&blob_dir).unwrap().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neighbor_down_suspends_report_timer() {
        let mut config = memory_config();
        config.report_timeout_ms = 100;
        let mut h = harness(config);
        h.data(ds(DataKind::RedCheckpointEorpEob, 0, 10, 1, 0));
        let report = h.reports().remove(0);
        let key = InboundTimer::Report(session(), report.report_serial);

        h.processor.handle(InboundCmd::NeighborScheduled {
            engine_id: peer(),
            up: false,
        });
        assert!(h.processor.timers.is_suspended(&key));
        h.processor.handle(InboundCmd::NeighborScheduled {
            engine_id: peer(),
            up: true,
        });
        assert!(h.processor.timers.is_running(&key));
    }
}
