//! 엔진 설정

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{EngineId, ServiceId, SessionId};
use crate::segment::estimate_data_header_len;
use crate::{Error, Result, DEFAULT_MTU, LTP_UDP_PORT};

/// LTP 엔진 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// 로컬 엔진 ID
    pub engine_id: EngineId,

    /// UDP 바인드 주소
    pub bind_addr: SocketAddr,

    /// 링크 최대 프레임 크기 (바이트)
    pub mtu: usize,

    /// 리포트 하나에 담을 최대 클레임 수
    pub max_claims_per_report: usize,

    /// 체크포인트 타이머 (밀리초)
    pub checkpoint_timeout_ms: u64,

    /// 리포트 타이머 (밀리초)
    pub report_timeout_ms: u64,

    /// 취소 타이머 (밀리초)
    pub cancel_timeout_ms: u64,

    /// 체크포인트 최대 재전송 횟수 (1~64)
    pub max_retransmits: u32,

    /// 리포트 최대 재전송 횟수
    pub max_report_retransmits: u32,

    /// 취소 세그먼트 최대 재전송 횟수
    pub max_cancel_retransmits: u32,

    /// 세션당 수신 문제(재전송 체크포인트) 한도
    pub reception_problems_limit: u32,

    /// 이 길이를 넘는 수신 블록은 파일로 전달
    pub block_length_file_threshold: u64,

    /// 이 길이를 넘는 수신 세그먼트는 도착 즉시 블롭에 저장
    pub segment_length_file_threshold: u64,

    /// 블롭 저장 디렉터리
    pub blob_dir: PathBuf,

    /// 송신 처리기 작업 큐 크기
    pub outbound_queue_size: usize,

    /// 수신 처리기 작업 큐 크기
    pub inbound_queue_size: usize,

    /// 큐가 가득 찼을 때 최대 대기 시간 (밀리초)
    pub queue_full_timeout_ms: u64,

    /// 이웃별 송신 속도 (세그먼트/초)
    pub segment_rate_limit: f64,

    /// 이웃별 버스트 크기 (세그먼트)
    pub burst_size: u32,

    /// 수신 소켓 버퍼 크기
    pub recv_buffer_size: usize,

    /// 링크 상태 점검 주기 (밀리초)
    pub link_monitor_interval_ms: u64,

    /// 종료 시 루프 join 대기 시간 (밀리초)
    pub join_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_id: EngineId::default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], LTP_UDP_PORT)),
            mtu: DEFAULT_MTU,
            max_claims_per_report: 150,
            checkpoint_timeout_ms: 60_000,
            report_timeout_ms: 60_000,
            cancel_timeout_ms: 2_000,
            max_retransmits: 60,
            max_report_retransmits: 8,
            max_cancel_retransmits: 8,
            reception_problems_limit: 10,
            block_length_file_threshold: 1000,
            segment_length_file_threshold: 1000,
            blob_dir: std::env::temp_dir().join("ltp-blobs"),
            outbound_queue_size: 1000,
            inbound_queue_size: 1300,
            queue_full_timeout_ms: 2_000,
            segment_rate_limit: 4000.0,
            burst_size: 120,
            recv_buffer_size: 2_000_000,
            link_monitor_interval_ms: 1_000,
            join_timeout_ms: 2_000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 엔진 ID와 바인드 주소만 지정
    pub fn with_engine(engine_id: EngineId, bind_addr: SocketAddr) -> Self {
        Self {
            engine_id,
            bind_addr,
            ..Self::default()
        }
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn queue_full_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_full_timeout_ms)
    }

    pub fn link_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.link_monitor_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// 정수 속도 (페이서 입력)
    pub fn rate_limit(&self) -> u32 {
        self.segment_rate_limit.round().max(1.0) as u32
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            mtu: 1200,
            max_claims_per_report: 50,
            outbound_queue_size: 200,
            inbound_queue_size: 300,
            segment_rate_limit: 1000.0,
            burst_size: 30,
            recv_buffer_size: 512 * 1024,
            link_monitor_interval_ms: 2_000,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            mtu: 8900,
            max_claims_per_report: 300,
            checkpoint_timeout_ms: 5_000,
            report_timeout_ms: 5_000,
            cancel_timeout_ms: 1_000,
            block_length_file_threshold: 64 * 1024 * 1024,
            segment_length_file_threshold: 1024 * 1024,
            outbound_queue_size: 4000,
            inbound_queue_size: 5000,
            segment_rate_limit: 50_000.0,
            burst_size: 1000,
            recv_buffer_size: 8 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// 장거리 링크용 설정 (긴 왕복 지연, 낮은 속도)
    pub fn long_haul() -> Self {
        Self {
            checkpoint_timeout_ms: 20 * 60_000,
            report_timeout_ms: 20 * 60_000,
            cancel_timeout_ms: 10 * 60_000,
            max_retransmits: 64,
            max_report_retransmits: 16,
            max_cancel_retransmits: 16,
            segment_rate_limit: 200.0,
            burst_size: 20,
            link_monitor_interval_ms: 10_000,
            ..Self::default()
        }
    }

    /// 범위 검사
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.max_retransmits) {
            return Err(Error::InvalidConfig(format!(
                "max_retransmits {} (1~64)",
                self.max_retransmits
            )));
        }
        if !(1..=64).contains(&self.max_report_retransmits) {
            return Err(Error::InvalidConfig(format!(
                "max_report_retransmits {} (1~64)",
                self.max_report_retransmits
            )));
        }
        if self.max_cancel_retransmits == 0 {
            return Err(Error::InvalidConfig("max_cancel_retransmits는 0일 수 없음".into()));
        }
        if self.max_claims_per_report == 0 {
            return Err(Error::InvalidConfig("max_claims_per_report는 0일 수 없음".into()));
        }
        if !(self.segment_rate_limit > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "segment_rate_limit {}",
                self.segment_rate_limit
            )));
        }
        if self.outbound_queue_size == 0 || self.inbound_queue_size == 0 {
            return Err(Error::InvalidConfig("작업 큐 크기는 0일 수 없음".into()));
        }
        let probe = SessionId::new(self.engine_id.clone(), u32::MAX as u64);
        let header = estimate_data_header_len(&probe, &ServiceId::new(vec![0xff; 8]), &[], &[]);
        if self.mtu <= header {
            return Err(Error::InvalidConfig(format!(
                "mtu {}가 데이터 헤더 {}보다 작음",
                self.mtu, header
            )));
        }
        Ok(())
    }

    /// bincode 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 파일로 저장
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// 파일에서 읽고 검증
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::from_bytes(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 1113);
        assert_eq!(config.max_retransmits, 60);
        assert_eq!(config.max_claims_per_report, 150);
        assert_eq!(config.rate_limit(), 4000);
        assert_eq!(config.cancel_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        for config in [
            Config::low_spec(),
            Config::high_performance(),
            Config::long_haul(),
        ] {
            assert!(config.validate().is_ok(), "{:?}", config);
        }
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.max_retransmits = 65;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.mtu = 20;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.segment_rate_limit = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ltp.conf");

        let mut config = Config::long_haul();
        config.engine_id = "10.0.0.7".parse().unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(Config::from_bytes(&config.to_bytes().unwrap()).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");
        let mut config = Config::default();
        config.max_report_retransmits = 0;
        config.save(&path).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
