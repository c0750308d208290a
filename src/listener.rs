//! 상위 계층 콜백
//!
//! 서비스 ID마다 리스너 하나를 등록한다. 콜백은 처리기 태스크에서 바로 호출되므로
//! 오래 걸리는 작업은 `ChannelListener`로 넘겨 다른 스레드에서 처리한다.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::debug;

use crate::block::BlockInfo;
use crate::ids::{ServiceId, SessionId};
use crate::payload::Payload;
use crate::segment::CancelReason;
use crate::{Error, Result};

/// 완성된 수신 블록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    pub info: BlockInfo,
    pub payload: Payload,
}

/// 상위 계층 리스너 (모든 메서드 기본 구현은 아무 일도 하지 않음)
pub trait LtpListener: Send + Sync {
    /// 새 세션 시작 (송신 블록 수락 또는 수신측 첫 세그먼트)
    fn on_session_started(&self, _info: &BlockInfo) {}

    /// 송신 블록의 모든 세그먼트가 한 번 이상 송신됨
    fn on_segments_transmitted(&self, _info: &BlockInfo) {}

    /// 송신 블록 완료 (레드 전부 확인, 그린 전부 송신)
    fn on_block_sent(&self, _info: &BlockInfo) {}

    fn on_block_transmit_cancelled(&self, _info: &BlockInfo, _reason: CancelReason) {}

    fn on_block_receive_cancelled(&self, _info: &BlockInfo, _reason: CancelReason) {}

    fn on_block_received(&self, _block: &ReceivedBlock) {}

    /// 레드 파트 전체 수신
    fn on_red_part_received(&self, _info: &BlockInfo) {}

    fn on_green_segment_received(&self, _info: &BlockInfo, _offset: u64, _data: &Payload) {}

    fn on_system_error(&self, _description: &str, _session: Option<&SessionId>) {}
}

/// 서비스 ID별 리스너 등록부
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<ServiceId, Arc<dyn LtpListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 등록 (서비스당 하나)
    pub fn register(&self, service_id: ServiceId, listener: Arc<dyn LtpListener>) -> Result<()> {
        let mut listeners = self.listeners.write();
        if listeners.contains_key(&service_id) {
            return Err(Error::ServiceAlreadyRegistered(service_id));
        }
        debug!("리스너 등록: service={}", service_id);
        listeners.insert(service_id, listener);
        Ok(())
    }

    pub fn unregister(&self, service_id: &ServiceId) -> Option<Arc<dyn LtpListener>> {
        self.listeners.write().remove(service_id)
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<dyn LtpListener>> {
        self.listeners.read().get(service_id).cloned()
    }

    pub fn is_registered(&self, service_id: &ServiceId) -> bool {
        self.listeners.read().contains_key(service_id)
    }

    pub fn all(&self) -> Vec<Arc<dyn LtpListener>> {
        self.listeners.read().values().cloned().collect()
    }

    /// 시스템 에러 알림: 서비스가 정해져 있으면 그 리스너, 아니면 전체
    pub fn system_error(
        &self,
        service_id: Option<&ServiceId>,
        description: &str,
        session: Option<&SessionId>,
    ) {
        let targets = match service_id.and_then(|s| self.get(s)) {
            Some(listener) => vec![listener],
            None => self.all(),
        };
        for listener in targets {
            listener.on_system_error(description, session);
        }
    }
}

/// 리스너 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LtpEvent {
    SessionStarted(BlockInfo),
    SegmentsTransmitted(BlockInfo),
    BlockSent(BlockInfo),
    BlockTransmitCancelled(BlockInfo, CancelReason),
    BlockReceiveCancelled(BlockInfo, CancelReason),
    BlockReceived(ReceivedBlock),
    RedPartReceived(BlockInfo),
    GreenSegmentReceived {
        info: BlockInfo,
        offset: u64,
        data: Payload,
    },
    SystemError {
        description: String,
        session: Option<SessionId>,
    },
}

/// 콜백을 crossbeam 채널 이벤트로 바꾸는 리스너
pub struct ChannelListener {
    tx: Sender<LtpEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<LtpEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn emit(&self, event: LtpEvent) {
        // 수신측이 사라졌으면 버림
        let _ = self.tx.send(event);
    }
}

impl LtpListener for ChannelListener {
    fn on_session_started(&self, info: &BlockInfo) {
        self.emit(LtpEvent::SessionStarted(info.clone()));
    }

    fn on_segments_transmitted(&self, info: &BlockInfo) {
        self.emit(LtpEvent::SegmentsTransmitted(info.clone()));
    }

    fn on_block_sent(&self, info: &BlockInfo) {
        self.emit(LtpEvent::BlockSent(info.clone()));
    }

    fn on_block_transmit_cancelled(&self, info: &BlockInfo, reason: CancelReason) {
        self.emit(LtpEvent::BlockTransmitCancelled(info.clone(), reason));
    }

    fn on_block_receive_cancelled(&self, info: &BlockInfo, reason: CancelReason) {
        self.emit(LtpEvent::BlockReceiveCancelled(info.clone(), reason));
    }

    fn on_block_received(&self, block: &ReceivedBlock) {
        self.emit(LtpEvent::BlockReceived(block.clone()));
    }

    fn on_red_part_received(&self, info: &BlockInfo) {
        self.emit(LtpEvent::RedPartReceived(info.clone()));
    }

    fn on_green_segment_received(&self, info: &BlockInfo, offset: u64, data: &Payload) {
        self.emit(LtpEvent::GreenSegmentReceived {
            info: info.clone(),
            offset,
            data: data.clone(),
        });
    }

    fn on_system_error(&self, description: &str, session: Option<&SessionId>) {
        self.emit(LtpEvent::SystemError {
            description: description.to_string(),
            session: session.cloned(),
        });
    }
}
