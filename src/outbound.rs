//! 송신 처리기 (RFC 5326 §8.1 송신측 상태 기계)
//!
//! 송신 세션 상태는 이 처리기 하나만 변경한다. 링크 루프, 타이머, API는 모두
//! `OutboundCmd`를 큐에 넣는 방식으로만 상호작용한다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::block::{BlockOptions, OutboundBlock, OutstandingCancel, SenderState};
use crate::engine::EngineShared;
use crate::ids::{CheckpointSerial, EngineId, SessionId};
use crate::listener::LtpListener;
use crate::neighbor::Neighbor;
use crate::pacer::{QueuedSegment, SessionToken, TransmitTag};
use crate::payload::Payload;
use crate::report::ReportSegment;
use crate::segment::{CancelReason, DataKind, Segment, SegmentBody};
use crate::stats::LtpStats;
use crate::timer::TimerManager;
use crate::{Error, Result};

/// 송신측 타이머 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutboundTimer {
    /// 체크포인트 세그먼트 (블록 내 인덱스)
    Checkpoint(SessionId, usize),
    Cancel(SessionId),
}

impl OutboundTimer {
    pub fn session_id(&self) -> &SessionId {
        match self {
            OutboundTimer::Checkpoint(session_id, _) | OutboundTimer::Cancel(session_id) => {
                session_id
            }
        }
    }
}

/// 송신 처리기 명령
#[derive(Debug)]
pub enum OutboundCmd {
    /// 새 블록 송신
    Send {
        destination: EngineId,
        payload: Payload,
        options: BlockOptions,
        reply: oneshot::Sender<Result<SessionId>>,
    },

    /// 사용자 취소
    Cancel {
        session_id: SessionId,
        reason: CancelReason,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 수신측이 보낸 세그먼트 (리포트, 수신측 취소, 취소 확인)
    Received { segment: Segment, from: SocketAddr },

    /// 본문이 잘못된 리포트
    InvalidReport { session_id: SessionId },

    /// 큐에서 꺼내져 실제로 송신됨
    TransmitStarted(TransmitTag),

    TimerExpired(OutboundTimer, u64),

    /// 이웃 스케줄 변경
    NeighborScheduled { engine_id: EngineId, up: bool },

    /// 모든 세션을 닫고 종료
    Stop,
}

/// 송신 처리기
pub struct OutboundProcessor {
    shared: EngineShared,
    blocks: HashMap<SessionId, OutboundBlock>,
    timers: TimerManager<OutboundTimer, OutboundCmd>,
}

impl OutboundProcessor {
    /// `tx`는 이 처리기의 명령 큐 (타이머 만료용)
    pub fn new(shared: EngineShared, tx: mpsc::Sender<OutboundCmd>) -> Self {
        let timers = TimerManager::new(tx, OutboundCmd::TimerExpired)
            .with_enqueue_timeout(shared.config.queue_full_timeout());
        Self {
            shared,
            blocks: HashMap::new(),
            timers,
        }
    }

    /// 명령 큐 소비 루프
    pub async fn run(mut self, mut rx: mpsc::Receiver<OutboundCmd>) {
        debug!("송신 처리기 시작");
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        self.close_all();
        debug!("송신 처리기 종료");
    }

    /// 명령 하나 처리. `Stop`이면 false.
    pub fn handle(&mut self, cmd: OutboundCmd) -> bool {
        match cmd {
            OutboundCmd::Send {
                destination,
                payload,
                options,
                reply,
            } => {
                let result = self.start_block(destination, payload, options);
                if let Err(e) = &result {
                    warn!("블록 송신 시작 실패: {}", e);
                }
                let _ = reply.send(result);
            }
            OutboundCmd::Cancel {
                session_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.user_cancel(&session_id, reason));
            }
            OutboundCmd::Received { segment, from } => self.on_segment(segment, from),
            OutboundCmd::InvalidReport { session_id } => self.on_invalid_report(&session_id),
            OutboundCmd::TransmitStarted(tag) => self.on_transmit_started(tag),
            OutboundCmd::TimerExpired(key, generation) => {
                if self.timers.expired(&key, generation) {
                    match key {
                        OutboundTimer::Checkpoint(session_id, index) => {
                            self.on_checkpoint_expired(&session_id, index)
                        }
                        OutboundTimer::Cancel(session_id) => self.on_cancel_expired(&session_id),
                    }
                }
            }
            OutboundCmd::NeighborScheduled { engine_id, up } => {
                if up {
                    self.timers.resume_neighbor(&engine_id);
                } else {
                    self.timers.suspend_neighbor(&engine_id);
                }
            }
            OutboundCmd::Stop => return false,
        }
        true
    }

    pub fn session_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn state(&self, session_id: &SessionId) -> Option<SenderState> {
        self.blocks.get(session_id).map(|b| b.state)
    }

    pub fn block(&self, session_id: &SessionId) -> Option<&OutboundBlock> {
        self.blocks.get(session_id)
    }

    fn listener(&self, block: &OutboundBlock) -> Option<Arc<dyn LtpListener>> {
        self.shared.listeners.get(&block.options.service_id)
    }

    fn start_block(
        &mut self,
        destination: EngineId,
        payload: Payload,
        options: BlockOptions,
    ) -> Result<SessionId> {
        let neighbor = self.shared.neighbors.require(&destination)?;

        let mut session_id = SessionId::generate(self.shared.config.engine_id.clone());
        while self.blocks.contains_key(&session_id) {
            session_id = SessionId::generate(self.shared.config.engine_id.clone());
        }

        let mut block = OutboundBlock::new(
            session_id.clone(),
            destination,
            payload,
            options,
            self.shared.config.mtu,
        )?;

        let targets: Vec<usize> = if block.is_all_green() {
            block.state = SenderState::FgXmit;
            (0..block.segments.len()).collect()
        } else {
            block.state = SenderState::RpXmit;
            block
                .segments
                .iter()
                .enumerate()
                .filter(|(_, s)| s.kind.is_red())
                .map(|(i, _)| i)
                .collect()
        };

        info!(
            "블록 송신 시작: session={} -> {}, {} bytes (red {}), {:?}",
            session_id,
            neighbor.engine_id,
            block.length(),
            block.red_length(),
            block.state
        );
        if let Some(listener) = self.listener(&block) {
            listener.on_session_started(&block.info());
        }

        for index in targets {
            self.transmit_data(&mut block, index, &neighbor);
        }
        self.blocks.insert(session_id.clone(), block);
        Ok(session_id)
    }

    /// 데이터 세그먼트 하나를 이웃 큐에 넣기
    fn transmit_data(&self, block: &mut OutboundBlock, index: usize, neighbor: &Neighbor) {
        let bytes = match block.wire_segment(index).and_then(|s| s.to_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("데이터 세그먼트 인코딩 실패: session={}: {}", block.session_id, e);
                if let Some(listener) = self.listener(block) {
                    listener.on_system_error(&e.to_string(), Some(&block.session_id));
                }
                return;
            }
        };
        let segment = &mut block.segments[index];
        segment.transmit_enqueues += 1;
        if segment.transmit_enqueues > 1 {
            LtpStats::incr(&self.shared.stats.retransmissions);
        }
        trace!(
            "DS 큐 투입: session={} [{}..{}) {:?}",
            block.session_id,
            segment.offset,
            segment.end(),
            segment.kind
        );
        neighbor.transmit(QueuedSegment::new(
            bytes,
            TransmitTag::Data {
                session_id: block.session_id.clone(),
                index,
            },
            Some(block.token.clone()),
        ));
    }

    /// 제어 세그먼트 송신
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

    fn on_segment(&mut self, segment: Segment, from: SocketAddr) {
        let session_id = segment.session_id;
        match segment.body {
            SegmentBody::Report(report) => self.on_report(session_id, report, from),
            SegmentBody::CancelFromReceiver(reason) => {
                self.on_cancel_from_receiver(session_id, reason, from)
            }
            SegmentBody::CancelAckToSender => self.on_cancel_ack(&session_id),
            other => warn!("송신 처리기로 잘못 전달된 세그먼트: {:?}", other),
        }
    }

    /// 리포트를 보낸 이웃: 세션이 있으면 블록의 목적지, 없으면 주소로 찾음
    fn reply_neighbor(&self, session_id: &SessionId, from: SocketAddr) -> Option<Arc<Neighbor>> {
        self.blocks
            .get(session_id)
            .and_then(|b| self.shared.neighbors.get(&b.neighbor))
            .or_else(|| self.shared.neighbors.by_addr(from))
    }

    fn on_report(&mut self, session_id: SessionId, report: ReportSegment, from: SocketAddr) {
        LtpStats::incr(&self.shared.stats.reports_received);
        if report.claims.is_empty() {
            warn!("클레임 없는 리포트 무시: session={} {}", session_id, report.report_serial);
            return;
        }

        // 세션 상태와 무관하게 항상 확인 응답
        match self.reply_neighbor(&session_id, from) {
            Some(neighbor) => {
                self.transmit_control(
                    &neighbor,
                    Segment::new(
                        session_id.clone(),
                        SegmentBody::ReportAck(report.report_serial),
                    ),
                    TransmitTag::Untracked,
                    None,
                );
                LtpStats::incr(&self.shared.stats.report_acks_sent);
            }
            None => warn!("리포트 송신자를 알 수 없음: {} from {}", session_id, from),
        }

        let mut block = match self.blocks.remove(&session_id) {
            Some(block) => block,
            None => {
                debug!("닫힌 세션의 리포트: {}", session_id);
                return;
            }
        };
        if !matches!(
            block.state,
            SenderState::RpXmit | SenderState::GpXmit | SenderState::WaitRpAck
        ) {
            debug!("상태 {:?}에서 리포트 무시: {}", block.state, session_id);
            self.blocks.insert(session_id, block);
            return;
        }

        // 포함된 세그먼트 확인 처리, 체크포인트 타이머 정지
        for (index, seg) in block.segments.iter_mut().enumerate() {
            if seg.kind.is_red() && !seg.acked && report.covers(seg.offset, seg.length) {
                seg.acked = true;
                if seg.kind.is_checkpoint() {
                    self.timers
                        .stop(&OutboundTimer::Checkpoint(session_id.clone(), index));
                }
            }
        }

        let resend: Vec<usize> = block
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| report.is_resend_required(s.offset, s.length, s.kind.is_red(), s.acked))
            .map(|(i, _)| i)
            .collect();

        if resend.is_empty() {
            if block.state == SenderState::WaitRpAck && block.is_complete() {
                self.finish(block);
                return;
            }
            self.blocks.insert(session_id, block);
            return;
        }

        let neighbor = match self.shared.neighbors.get(&block.neighbor) {
            Some(neighbor) => neighbor,
            None => {
                warn!("이웃 {} 없음, 재전송 불가: {}", block.neighbor, session_id);
                self.blocks.insert(session_id, block);
                return;
            }
        };

        debug!(
            "리포트 {} 응답 재전송: session={}, {} 세그먼트",
            report.report_serial,
            session_id,
            resend.len()
        );
        let last = resend.len() - 1;
        for (n, &index) in resend.iter().enumerate() {
            let seg = &mut block.segments[index];
            // 배치의 마지막 세그먼트는 반드시 체크포인트
            if n == last && seg.kind == DataKind::Red {
                seg.kind = DataKind::RedCheckpoint;
            }
            if seg.kind.is_checkpoint() {
                seg.checkpoint_serial = CheckpointSerial(block.checkpoint_serials.next_serial());
                seg.report_serial = report.report_serial;
            }
            self.transmit_data(&mut block, index, &neighbor);
        }
        self.blocks.insert(session_id, block);
    }

    fn on_transmit_started(&mut self, tag: TransmitTag) {
        match tag {
            TransmitTag::Data { session_id, index } => self.on_data_transmitted(session_id, index),
            TransmitTag::CancelFromSender { session_id } => {
                if let Some(block) = self.blocks.get(&session_id) {
                    if block.state == SenderState::CsSent {
                        self.timers.start(
                            OutboundTimer::Cancel(session_id),
                            &block.neighbor,
                            self.shared.config.cancel_timeout(),
                        );
                    }
                }
            }
            other => trace!("송신 처리기와 무관한 송신 알림: {:?}", other),
        }
    }

    fn on_data_transmitted(&mut self, session_id: SessionId, index: usize) {
        let mut block = match self.blocks.remove(&session_id) {
            Some(block) => block,
            None => return,
        };
        let (kind, acked) = match block.segments.get_mut(index) {
            Some(seg) => {
                seg.sent = true;
                (seg.kind, seg.acked)
            }
            None => {
                self.blocks.insert(session_id, block);
                return;
            }
        };
        LtpStats::incr(&self.shared.stats.data_segments_sent);

        let active = matches!(
            block.state,
            SenderState::RpXmit | SenderState::GpXmit | SenderState::WaitRpAck
        );
        if active && kind.is_checkpoint() && !acked {
            LtpStats::incr(&self.shared.stats.checkpoints_sent);
            self.timers.start(
                OutboundTimer::Checkpoint(session_id.clone(), index),
                &block.neighbor,
                self.shared.config.checkpoint_timeout(),
            );
        }

        match (block.state, kind) {
            (SenderState::FgXmit, DataKind::GreenEob) => {
                if let Some(listener) = self.listener(&block) {
                    listener.on_segments_transmitted(&block.info());
                }
                self.finish(block);
                return;
            }
            (SenderState::RpXmit, DataKind::RedCheckpointEorp) => {
                block.state = SenderState::GpXmit;
                match self.shared.neighbors.get(&block.neighbor) {
                    Some(neighbor) => {
                        let greens: Vec<usize> = block
                            .segments
                            .iter()
                            .enumerate()
                            .filter(|(_, s)| s.kind.is_green())
                            .map(|(i, _)| i)
                            .collect();
                        for green in greens {
                            self.transmit_data(&mut block, green, &neighbor);
                        }
                    }
                    None => warn!("이웃 {} 없음, 그린 파트 송신 불가", block.neighbor),
                }
            }
            (SenderState::RpXmit, DataKind::RedCheckpointEorpEob) => {
                block.state = SenderState::WaitRpAck;
                if let Some(listener) = self.listener(&block) {
                    listener.on_segments_transmitted(&block.info());
                }
            }
            (SenderState::GpXmit, DataKind::GreenEob) => {
                block.state = SenderState::WaitRpAck;
                if let Some(listener) = self.listener(&block) {
                    listener.on_segments_transmitted(&block.info());
                }
                if block.is_complete() {
                    self.finish(block);
                    return;
                }
            }
            _ => {}
        }
        self.blocks.insert(session_id, block);
    }

    fn on_checkpoint_expired(&mut self, session_id: &SessionId, index: usize) {
        let mut block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        let active = matches!(
            block.state,
            SenderState::RpXmit | SenderState::GpXmit | SenderState::WaitRpAck
        );
        let enqueues = match block.segments.get(index) {
            Some(seg) if active && !seg.acked => seg.transmit_enqueues,
            _ => {
                self.blocks.insert(session_id.clone(), block);
                return;
            }
        };

        if enqueues > self.shared.config.max_retransmits {
            warn!(
                "체크포인트 재전송 한도 초과: session={}, {}회",
                session_id, enqueues
            );
            self.start_cancel(block, CancelReason::RetransLimitExceeded);
            return;
        }

        debug!("체크포인트 타이머 만료, 재전송: session={} #{}", session_id, index);
        match self.shared.neighbors.get(&block.neighbor) {
            Some(neighbor) => self.transmit_data(&mut block, index, &neighbor),
            None => warn!("이웃 {} 없음, 체크포인트 재전송 불가", block.neighbor),
        }
        self.blocks.insert(session_id.clone(), block);
    }

    fn user_cancel(&mut self, session_id: &SessionId, reason: CancelReason) -> Result<()> {
        let block = self
            .blocks
            .remove(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.clone()))?;
        if block.state == SenderState::CsSent {
            self.blocks.insert(session_id.clone(), block);
            return Ok(());
        }
        info!("사용자 송신 취소: session={} ({})", session_id, reason);
        self.start_cancel(block, reason);
        Ok(())
    }

    fn on_invalid_report(&mut self, session_id: &SessionId) {
        if let Some(block) = self.blocks.remove(session_id) {
            if block.state == SenderState::CsSent {
                self.blocks.insert(session_id.clone(), block);
                return;
            }
            warn!("잘못된 리포트로 세션 취소: {}", session_id);
            self.start_cancel(block, CancelReason::SystemCancelled);
        }
    }

    /// CS_SENT로 전환하고 송신측 취소 송신
    fn start_cancel(&mut self, mut block: OutboundBlock, reason: CancelReason) {
        let session_id = block.session_id.clone();
        self.timers.stop_where(|k| k.session_id() == &session_id);

        // 큐에 남은 데이터 세그먼트는 버리고 취소 세그먼트용 토큰으로 교체
        block.token.invalidate();
        block.token = SessionToken::new();
        block.state = SenderState::CsSent;
        block.cancel = Some(OutstandingCancel::new(reason));

        self.transmit_cancel(&mut block);
        self.blocks.insert(session_id, block);
    }

    fn transmit_cancel(&self, block: &mut OutboundBlock) {
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
                        SegmentBody::CancelFromSender(reason),
                    ),
                    TransmitTag::CancelFromSender {
                        session_id: block.session_id.clone(),
                    },
                    Some(block.token.clone()),
                );
                LtpStats::incr(&self.shared.stats.cancels_sent);
            }
            None => warn!("이웃 {} 없음, 취소 송신 불가", block.neighbor),
        }
    }

    fn on_cancel_expired(&mut self, session_id: &SessionId) {
        let mut block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        let cancel = match (block.state, block.cancel) {
            (SenderState::CsSent, Some(cancel)) => cancel,
            _ => {
                self.blocks.insert(session_id.clone(), block);
                return;
            }
        };
        if cancel.transmit_enqueues > self.shared.config.max_cancel_retransmits {
            warn!(
                "취소 재전송 한도 초과, 강제 종료: session={} ({})",
                session_id, cancel.reason
            );
            self.close_cancelled(block, cancel.reason);
            return;
        }
        debug!("취소 타이머 만료, 재전송: session={}", session_id);
        self.transmit_cancel(&mut block);
        self.blocks.insert(session_id.clone(), block);
    }

    fn on_cancel_ack(&mut self, session_id: &SessionId) {
        let block = match self.blocks.remove(session_id) {
            Some(block) => block,
            None => return,
        };
        match (block.state, block.cancel) {
            (SenderState::CsSent, Some(cancel)) => {
                debug!("취소 확인 수신: session={}", session_id);
                self.close_cancelled(block, cancel.reason);
            }
            _ => {
                debug!("예상치 못한 취소 확인 무시: session={}", session_id);
                self.blocks.insert(session_id.clone(), block);
            }
        }
    }

    fn on_cancel_from_receiver(
        &mut self,
        session_id: SessionId,
        reason: CancelReason,
        from: SocketAddr,
    ) {
        LtpStats::incr(&self.shared.stats.cancels_received);
        let neighbor = self.reply_neighbor(&session_id, from);

        if let Some(block) = self.blocks.remove(&session_id) {
            info!("수신측 취소: session={} ({})", session_id, reason);
            self.close_cancelled(block, reason);
        }

        // 세션이 이미 닫혔어도 확인 응답
        match neighbor {
            Some(neighbor) => self.transmit_control(
                &neighbor,
                Segment::new(session_id, SegmentBody::CancelAckToReceiver),
                TransmitTag::Untracked,
                None,
            ),
            None => warn!("수신측 취소 송신자를 알 수 없음: {}", from),
        }
    }

    /// 세션 정리 (타이머 정지, 큐 무효화)
    fn close(&mut self, block: &mut OutboundBlock) {
        let session_id = block.session_id.clone();
        self.timers.stop_where(|k| k.session_id() == &session_id);
        block.token.invalidate();
        block.state = SenderState::Closed;
    }

    /// 정상 완료
    fn finish(&mut self, mut block: OutboundBlock) {
        self.close(&mut block);
        LtpStats::incr(&self.shared.stats.blocks_sent);
        LtpStats::add(&self.shared.stats.bytes_sent, block.length());
        info!(
            "블록 송신 완료: session={}, {} bytes, {:.2}s",
            block.session_id,
            block.length(),
            block.created_at.elapsed().as_secs_f64()
        );
        if let Some(listener) = self.listener(&block) {
            listener.on_block_sent(&block.info());
        }
    }

    fn close_cancelled(&mut self, mut block: OutboundBlock, reason: CancelReason) {
        self.close(&mut block);
        LtpStats::incr(&self.shared.stats.blocks_cancelled);
        if let Some(listener) = self.listener(&block) {
            listener.on_block_transmit_cancelled(&block.info(), reason);
        }
    }

    /// 종료 시 열린 세션 모두 닫기
    fn close_all(&mut self) {
        let sessions: Vec<SessionId> = self.blocks.keys().cloned().collect();
        for session_id in sessions {
            if let Some(block) = self.blocks.remove(&session_id) {
                debug!("종료로 세션 닫음: {}", session_id);
                self.close_cancelled(block, CancelReason::SystemCancelled);
            }
        }
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CheckpointPolicy;
    use crate::ids::{ReportSerial, ServiceId};
    use crate::listener::{ChannelListener, LtpEvent};
    use crate::pacer::Dequeued;
    use crate::report::ReceptionClaim;
    use crate::segment::estimate_data_header_len;
    use crate::Config;
    use bytes::Bytes;
    use crossbeam_channel::Receiver;
    use std::time::{Duration, Instant};

    const PEER_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 4556);

    struct Harness {
        processor: OutboundProcessor,
        timer_rx: mpsc::Receiver<OutboundCmd>,
        neighbor: Arc<Neighbor>,
        events: Receiver<LtpEvent>,
    }

    fn peer() -> EngineId {
        EngineId::from(2)
    }

    fn service() -> ServiceId {
        ServiceId::from(1)
    }

    /// 데이터 1000바이트 세그먼트가 되도록 MTU를 맞춤
    fn harness(config: Config) -> Harness {
        let mut config = config;
        let probe = SessionId::new(config.engine_id.clone(), i32::MAX as u64);
        config.mtu = 1000 + estimate_data_header_len(&probe, &service(), &[], &[]);
        config.segment_rate_limit = 1_000_000.0;
        config.burst_size = 10_000;

        let shared = EngineShared::for_test(config);
        let neighbor = shared
            .neighbors
            .add(peer(), SocketAddr::from(PEER_ADDR));
        let (listener, events) = ChannelListener::new();
        shared
            .listeners
            .register(service(), Arc::new(listener))
            .unwrap();

        let (tx, timer_rx) = mpsc::channel(64);
        Harness {
            processor: OutboundProcessor::new(shared, tx),
            timer_rx,
            neighbor,
            events,
        }
    }

    impl Harness {
        fn send(&mut self, len: usize, options: BlockOptions) -> SessionId {
            let (reply, mut rx) = oneshot::channel();
            self.processor.handle(OutboundCmd::Send {
                destination: peer(),
                payload: Payload::Memory(Bytes::from(vec![7u8; len])),
                options,
                reply,
            });
            rx.try_recv().unwrap().unwrap()
        }

        /// 큐를 비우며 각 세그먼트의 송신 시작을 처리기에 알림
        fn drain(&mut self) -> Vec<Segment> {
            let mut out = Vec::new();
            loop {
                match self.neighbor.queue().pop(Instant::now()) {
                    Dequeued::Segment(queued) => {
                        out.push(Segment::decode(queued.bytes.clone()).unwrap());
                        self.processor
                            .handle(OutboundCmd::TransmitStarted(queued.tag));
                    }
                    Dequeued::NotReady(_) => panic!("테스트 페이서는 지연이 없어야 함"),
                    Dequeued::Empty => return out,
                }
            }
        }

        fn receive(&mut self, session_id: &SessionId, body: SegmentBody) {
            self.processor.handle(OutboundCmd::Received {
                segment: Segment::new(session_id.clone(), body),
                from: SocketAddr::from(PEER_ADDR),
            });
        }

        fn report(&mut self, session_id: &SessionId, serial: u32, upper: u64, claims: &[(u64, u64)]) {
            self.receive(
                session_id,
                SegmentBody::Report(ReportSegment {
                    report_serial: ReportSerial(serial),
                    checkpoint_serial: CheckpointSerial(1),
                    upper_bound: upper,
                    lower_bound: 0,
                    claims: claims
                        .iter()
                        .map(|&(o, l)| ReceptionClaim::new(o, l))
                        .collect(),
                }),
            );
        }

        /// 타이머 만료 명령 하나를 받아 처리
        async fn fire_timer(&mut self) {
            let cmd = self.timer_rx.recv().await.unwrap();
            self.processor.handle(cmd);
        }

        fn events(&self) -> Vec<LtpEvent> {
            self.events.try_iter().collect()
        }
    }

    fn data(segment: &Segment) -> &crate::segment::DataSegment {
        match &segment.body {
            SegmentBody::Data(ds) => ds,
            other => panic!("데이터 세그먼트가 아님: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_red_block_completes_on_full_report() {
        let mut h = harness(Config::default());
        let session = h.send(3000, BlockOptions::all_red(service()));
        assert_eq!(h.processor.state(&session), Some(SenderState::RpXmit));

        let sent = h.drain();
        assert_eq!(sent.len(), 3);
        assert_eq!(data(&sent[2]).kind, DataKind::RedCheckpointEorpEob);
        assert_eq!(h.processor.state(&session), Some(SenderState::WaitRpAck));
        assert!(h
            .processor
            .timers
            .is_running(&OutboundTimer::Checkpoint(session.clone(), 2)));
        match &h.events()[..] {
            [LtpEvent::SessionStarted(info), LtpEvent::SegmentsTransmitted(_)] => {
                assert_eq!(info.session_id, session);
                assert_eq!(info.red_length, 3000);
            }
            other => panic!("unexpected {:?}", other),
        }

        h.report(&session, 40, 3000, &[(0, 3000)]);
        let acks = h.drain();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].body, SegmentBody::ReportAck(ReportSerial(40)));

        assert_eq!(h.processor.session_count(), 0);
        assert!(h.processor.timers.is_empty());
        assert!(matches!(h.events()[..], [LtpEvent::BlockSent(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_gap_resends_with_forced_checkpoint() {
        let mut h = harness(Config::default());
        let session = h.send(4000, BlockOptions::all_red(service()));
        h.drain();
        h.events();

        // 1000..3000 손실
        h.report(&session, 50, 4000, &[(0, 1000), (3000, 1000)]);
        let out = h.drain();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].body, SegmentBody::ReportAck(ReportSerial(50)));

        let first = data(&out[1]);
        let second = data(&out[2]);
        assert_eq!((first.offset, first.kind), (1000, DataKind::Red));
        assert_eq!((second.offset, second.kind), (2000, DataKind::RedCheckpoint));
        assert_eq!(second.report_serial, ReportSerial(50));
        assert!(!second.checkpoint_serial.is_zero());
        assert!(h
            .processor
            .timers
            .is_running(&OutboundTimer::Checkpoint(session.clone(), 2)));
        assert_eq!(h.processor.state(&session), Some(SenderState::WaitRpAck));

        h.report(&session, 51, 3000, &[(1000, 2000)]);
        h.drain();
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(h.events()[..], [LtpEvent::BlockSent(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_without_claims_ignored() {
        let mut h = harness(Config::default());
        let session = h.send(1000, BlockOptions::all_red(service()));
        h.drain();
        h.report(&session, 60, 1000, &[]);
        assert!(h.drain().is_empty());
        assert_eq!(h.processor.state(&session), Some(SenderState::WaitRpAck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_for_unknown_session_still_acked() {
        let mut h = harness(Config::default());
        let stale = SessionId::new(EngineId::from(1), 5);
        h.report(&stale, 70, 100, &[(0, 100)]);
        let out = h.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, SegmentBody::ReportAck(ReportSerial(70)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_green_block() {
        let mut h = harness(Config::default());
        let session = h.send(2500, BlockOptions::all_green(service()));
        assert_eq!(h.processor.state(&session), Some(SenderState::FgXmit));

        let sent = h.drain();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| data(s).kind.is_green()));
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(
            h.events()[..],
            [
                LtpEvent::SessionStarted(_),
                LtpEvent::SegmentsTransmitted(_),
                LtpEvent::BlockSent(_)
            ]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_block_sends_green_after_eorp() {
        let mut h = harness(Config::default());
        let session = h.send(5000, BlockOptions::mixed(service(), 3000));

        // 레드 3개 송신 후 EORP 송신 시점에 그린 2개가 큐에 들어감
        let sent = h.drain();
        let kinds: Vec<DataKind> = sent.iter().map(|s| data(s).kind).collect();
        assert_eq!(
            kinds,
            vec![
                DataKind::Red,
                DataKind::Red,
                DataKind::RedCheckpointEorp,
                DataKind::Green,
                DataKind::GreenEob,
            ]
        );
        assert_eq!(h.processor.state(&session), Some(SenderState::WaitRpAck));
        assert!(matches!(
            h.events()[..],
            [LtpEvent::SessionStarted(_), LtpEvent::SegmentsTransmitted(_)]
        ));

        h.report(&session, 80, 3000, &[(0, 3000)]);
        h.drain();
        assert!(matches!(h.events()[..], [LtpEvent::BlockSent(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_retransmit_limit_cancels() {
        let mut config = Config::default();
        config.max_retransmits = 2;
        config.checkpoint_timeout_ms = 100;
        let mut h = harness(config);
        let session = h.send(500, BlockOptions::all_red(service()));
        h.drain();

        // 1회 송신 + 2회 재전송 후 한도 초과
        for _ in 0..2 {
            h.fire_timer().await;
            let resent = h.drain();
            assert_eq!(resent.len(), 1);
            assert!(data(&resent[0]).kind.is_checkpoint());
        }
        h.fire_timer().await;
        assert_eq!(h.processor.state(&session), Some(SenderState::CsSent));
        let out = h.drain();
        assert_eq!(
            out[0].body,
            SegmentBody::CancelFromSender(CancelReason::RetransLimitExceeded)
        );

        h.receive(&session, SegmentBody::CancelAckToSender);
        assert_eq!(h.processor.session_count(), 0);
        let events = h.events();
        assert!(matches!(
            events.last(),
            Some(LtpEvent::BlockTransmitCancelled(_, CancelReason::RetransLimitExceeded))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_retransmit_limit_force_closes() {
        let mut config = Config::default();
        config.max_cancel_retransmits = 1;
        config.cancel_timeout_ms = 50;
        let mut h = harness(config);
        let session = h.send(500, BlockOptions::all_red(service()));
        h.drain();
        h.events();

        let (reply, mut rx) = oneshot::channel();
        h.processor.handle(OutboundCmd::Cancel {
            session_id: session.clone(),
            reason: CancelReason::UserCancelled,
            reply,
        });
        rx.try_recv().unwrap().unwrap();
        assert_eq!(h.drain().len(), 1);

        h.fire_timer().await;
        assert_eq!(h.drain().len(), 1);
        h.fire_timer().await;
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(
            h.events()[..],
            [LtpEvent::BlockTransmitCancelled(_, CancelReason::UserCancelled)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_receiver() {
        let mut h = harness(Config::default());
        let session = h.send(3000, BlockOptions::all_red(service()));
        h.drain();
        h.events();

        h.receive(
            &session,
            SegmentBody::CancelFromReceiver(CancelReason::Miscolored),
        );
        let out = h.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, SegmentBody::CancelAckToReceiver);
        assert_eq!(h.processor.session_count(), 0);
        assert!(h.processor.timers.is_empty());
        assert!(matches!(
            h.events()[..],
            [LtpEvent::BlockTransmitCancelled(_, CancelReason::Miscolored)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_queued_data() {
        let mut h = harness(Config::default());
        let session = h.send(3000, BlockOptions::all_red(service()));

        let (reply, _rx) = oneshot::channel();
        h.processor.handle(OutboundCmd::Cancel {
            session_id: session.clone(),
            reason: CancelReason::UserCancelled,
            reply,
        });
        let out = h.drain();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].body, SegmentBody::CancelFromSender(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_report_cancels_session() {
        let mut h = harness(Config::default());
        let session = h.send(1000, BlockOptions::all_red(service()));
        h.drain();
        h.processor.handle(OutboundCmd::InvalidReport {
            session_id: session.clone(),
        });
        assert_eq!(h.processor.state(&session), Some(SenderState::CsSent));
        let out = h.drain();
        assert_eq!(
            out[0].body,
            SegmentBody::CancelFromSender(CancelReason::SystemCancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_neighbor_down_suspends_checkpoint_timer() {
        let mut config = Config::default();
        config.checkpoint_timeout_ms = 100;
        let mut h = harness(config);
        let session = h.send(1000, BlockOptions::all_red(service()));
        h.drain();

        h.processor.handle(OutboundCmd::NeighborScheduled {
            engine_id: peer(),
            up: false,
        });
        let key = OutboundTimer::Checkpoint(session.clone(), 0);
        assert!(h.processor.timers.is_suspended(&key));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.timer_rx.try_recv().is_err());

        h.processor.handle(OutboundCmd::NeighborScheduled {
            engine_id: peer(),
            up: true,
        });
        assert!(h.processor.timers.is_running(&key));
        h.fire_timer().await;
        assert_eq!(h.drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_destination_rejected() {
        let mut h = harness(Config::default());
        let (reply, mut rx) = oneshot::channel();
        h.processor.handle(OutboundCmd::Send {
            destination: EngineId::from(99),
            payload: Payload::Memory(Bytes::from_static(b"x")),
            options: BlockOptions::all_red(service()).with_policy(CheckpointPolicy::All),
            reply,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::UnknownNeighbor(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_open_sessions() {
        let mut h = harness(Config::default());
        h.send(1000, BlockOptions::all_red(service()));
        h.drain();
        h.events();

        assert!(!h.processor.handle(OutboundCmd::Stop));
        h.processor.close_all();
        assert_eq!(h.processor.session_count(), 0);
        assert!(matches!(
            h.events()[..],
            [LtpEvent::BlockTransmitCancelled(_, CancelReason::SystemCancelled)]
        ));
    }
}
