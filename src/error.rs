//! 에러 타입 정의

use thiserror::Error;

use crate::ids::{EngineId, ServiceId, SessionId};

/// LTP 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("유효하지 않은 세그먼트 타입: {0:#x}")]
    InvalidSegmentType(u8),

    #[error("SDNV 값이 중간에 끊김")]
    SdnvTruncated,

    #[error("SDNV 값이 {max_bits}비트를 초과")]
    SdnvOverflow { max_bits: u32 },

    #[error("세그먼트 길이 부족: {needed} bytes 필요, {remaining} bytes 남음")]
    Truncated { needed: u64, remaining: usize },

    #[error("확장 필드 수 초과: {count}개 (최대 15)")]
    TooManyExtensions { count: usize },

    #[error("유효하지 않은 리포트: {0}")]
    InvalidReport(String),

    #[error("리포트에 클레임이 없음")]
    NoClaims,

    #[error("잘못된 색상의 세그먼트: session={0}")]
    Miscolored(SessionId),

    #[error("알 수 없는 이웃 엔진: {0}")]
    UnknownNeighbor(EngineId),

    #[error("알 수 없는 세션: {0}")]
    UnknownSession(SessionId),

    #[error("이웃 엔진이 동작 중이 아님: {0}")]
    NeighborNotOperational(EngineId),

    #[error("서비스 ID에 이미 리스너가 등록됨: {0}")]
    ServiceAlreadyRegistered(ServiceId),

    #[error("유효하지 않은 블록 옵션: {0}")]
    InvalidBlockOptions(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("유효하지 않은 엔진 ID: {0}")]
    InvalidEngineId(String),

    #[error("블롭 없음: {0}")]
    BlobNotFound(String),

    #[error("엔진이 시작되지 않음")]
    NotStarted,

    #[error("작업 큐가 가득 참 ({timeout_ms}ms 대기 후)")]
    QueueFull { timeout_ms: u64 },

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("알 수 없는 에러: {0}")]
    Unknown(String),
}

impl Error {
    /// 수신 데이터그램의 형식 오류 여부 (세션 상태를 건드리지 않고 버려야 함)
    pub fn is_wire_format(&self) -> bool {
        matches!(
            self,
            Error::InvalidVersion { .. }
                | Error::InvalidSegmentType(_)
                | Error::SdnvTruncated
                | Error::SdnvOverflow { .. }
                | Error::Truncated { .. }
                | Error::TooManyExtensions { .. }
        )
    }

    /// 세션을 취소해야 하는 프로토콜 위반 여부
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidReport(_) | Error::NoClaims | Error::Miscolored(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
