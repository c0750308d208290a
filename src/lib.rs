//! # LTP (Licklider Transmission Protocol)
//!
//! RFC 5326 기반 UDP 블록 전송 엔진
//!
//! ## 핵심 특징
//! - **레드/그린 파트**: 블록 앞부분(레드)은 리포트/재전송으로 신뢰 전송, 뒷부분(그린)은 최선 전송
//! - **체크포인트/리포트**: 수신측 리포트로 빠진 구간만 재전송
//! - **방향별 단일 처리기**: 송신/수신 세션 상태는 각각 한 태스크만 변경
//! - **이웃별 페이싱**: 토큰 버킷으로 송신 속도 제한
//! - **대용량 블록**: 임계값을 넘는 세그먼트/블록은 블롭 파일로 보관

pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod inbound;
pub mod link;
pub mod listener;
pub mod neighbor;
pub mod outbound;
pub mod pacer;
pub mod payload;
pub mod report;
pub mod sdnv;
pub mod segment;
pub mod stats;
pub mod timer;

pub use block::{BlockInfo, BlockOptions, CheckpointPolicy, ReceiverState, SenderState};
pub use config::Config;
pub use engine::LtpEngine;
pub use error::{Error, Result};
pub use ids::{CheckpointSerial, EngineId, ReportSerial, ServiceId, SessionId};
pub use link::{LinkState, Transport, UdpTransport};
pub use listener::{ChannelListener, LtpEvent, LtpListener, ReceivedBlock};
pub use payload::{BlobStore, Payload};
pub use report::{ReceptionClaim, ReportSegment};
pub use segment::{CancelReason, DataKind, DataSegment, Extension, Segment, SegmentBody, SegmentType};
pub use stats::{LtpStats, StatsSnapshot};

/// LTP 기본 UDP 포트
pub const LTP_UDP_PORT: u16 = 1113;

/// 기본 최대 프레임 크기 (바이트)
pub const DEFAULT_MTU: usize = 1400;

#[cfg(test)]
mod test_logging {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
