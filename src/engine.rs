//! LTP 엔진
//!
//! 송신/수신 처리기 태스크와 링크를 묶어 상위 계층 API를 제공한다.
//!
//! ```no_run
//! # async fn run() -> ltp::Result<()> {
//! use ltp::{BlockOptions, Config, EngineId, LtpEngine, ServiceId};
//!
//! let engine = LtpEngine::start(Config::default()).await?;
//! engine.add_neighbor(EngineId::from(2), "10.0.0.2:1113".parse().unwrap());
//! let session = engine
//!     .send(EngineId::from(2), bytes::Bytes::from_static(b"hello"), BlockOptions::all_red(ServiceId::from(1)))
//!     .await?;
//! # let _ = session;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::block::BlockOptions;
use crate::ids::{EngineId, ServiceId, SessionId};
use crate::inbound::{InboundCmd, InboundProcessor};
use crate::link::{Link, LinkState, Transport, UdpTransport};
use crate::listener::{ListenerRegistry, LtpListener};
use crate::neighbor::NeighborTable;
use crate::outbound::{OutboundCmd, OutboundProcessor};
use crate::payload::{BlobStore, Payload};
use crate::segment::CancelReason;
use crate::stats::{LtpStats, StatsSnapshot};
use crate::{Config, Error, Result};

/// 처리기와 링크 루프가 함께 쓰는 엔진 자원
#[derive(Clone)]
pub struct EngineShared {
    pub config: Arc<Config>,
    pub neighbors: Arc<NeighborTable>,
    pub listeners: Arc<ListenerRegistry>,
    pub stats: Arc<LtpStats>,
    pub blobs: Arc<BlobStore>,
}

impl EngineShared {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let blobs = BlobStore::open(&config.blob_dir)?;
        Ok(Self::with_blobs(config, blobs))
    }

    fn with_blobs(config: Config, blobs: BlobStore) -> Self {
        Self {
            neighbors: Arc::new(NeighborTable::new(config.rate_limit(), config.burst_size)),
            listeners: Arc::new(ListenerRegistry::new()),
            stats: Arc::new(LtpStats::new()),
            blobs: Arc::new(blobs),
            config: Arc::new(config),
        }
    }

    /// 검증 없이 생성 (테스트용 MTU/속도 조정 허용)
    #[cfg(test)]
    pub(crate) fn for_test(config: Config) -> Self {
        let blobs = BlobStore::open(&config.blob_dir).unwrap();
        Self::with_blobs(config, blobs)
    }
}

/// 처리기 큐에 명령 넣기. 큐가 `timeout` 동안 가득 차 있으면 `QueueFull`.
pub(crate) async fn enqueue<C>(tx: &mpsc::Sender<C>, cmd: C, timeout: Duration) -> Result<()> {
    match tx.send_timeout(cmd, timeout).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(SendTimeoutError::Closed(_)) => Err(Error::ChannelError),
    }
}

/// LTP 엔진 핸들
pub struct LtpEngine {
    shared: EngineShared,
    outbound_tx: mpsc::Sender<OutboundCmd>,
    inbound_tx: mpsc::Sender<InboundCmd>,
    link: Link,
    processors: Vec<JoinHandle<()>>,
}

impl LtpEngine {
    /// `config.bind_addr`에 UDP 링크를 열고 시작
    pub async fn start(config: Config) -> Result<Self> {
        let transport = UdpTransport::bind(config.bind_addr, config.recv_buffer_size).await?;
        Self::start_with_transport(config, Arc::new(transport)).await
    }

    /// 주어진 전송 계층으로 시작
    pub async fn start_with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let shared = EngineShared::new(config)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.outbound_queue_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.inbound_queue_size);

        let outbound = OutboundProcessor::new(shared.clone(), outbound_tx.clone());
        let inbound = InboundProcessor::new(shared.clone(), inbound_tx.clone());
        let processors = vec![
            tokio::spawn(outbound.run(outbound_rx)),
            tokio::spawn(inbound.run(inbound_rx)),
        ];

        let link = Link::start(
            transport,
            shared.clone(),
            outbound_tx.clone(),
            inbound_tx.clone(),
        );

        info!(
            "LTP 엔진 시작: engine={} addr={:?} mtu={}",
            shared.config.engine_id,
            link.local_addr().ok(),
            shared.config.mtu
        );

        Ok(Self {
            shared,
            outbound_tx,
            inbound_tx,
            link,
            processors,
        })
    }

    pub fn engine_id(&self) -> &EngineId {
        &self.shared.config.engine_id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.link.local_addr()
    }

    pub fn link_state(&self) -> Arc<LinkState> {
        self.link.state()
    }

    /// 이웃 추가 (이미 있으면 주소 갱신)
    pub fn add_neighbor(&self, engine_id: EngineId, addr: SocketAddr) {
        self.shared.neighbors.add(engine_id, addr);
    }

    pub fn remove_neighbor(&self, engine_id: &EngineId) -> bool {
        self.shared.neighbors.remove(engine_id).is_some()
    }

    /// 이웃 스케줄 변경
    ///
    /// 꺼지면 그 이웃으로 가는 송신을 멈추고 관련 타이머를 모두 중지한다. 켜지면 타이머를
    /// 처음부터 다시 시작하고 쌓인 큐를 흘려보낸다.
    pub async fn set_neighbor_scheduled(&self, engine_id: &EngineId, up: bool) -> Result<()> {
        let neighbor = self.shared.neighbors.require(engine_id)?;
        if !neighbor.set_scheduled(up) {
            return Ok(());
        }
        info!("이웃 {} 스케줄 {}", engine_id, if up { "시작" } else { "중지" });

        let timeout = self.shared.config.queue_full_timeout();
        enqueue(
            &self.outbound_tx,
            OutboundCmd::NeighborScheduled {
                engine_id: engine_id.clone(),
                up,
            },
            timeout,
        )
        .await?;
        enqueue(
            &self.inbound_tx,
            InboundCmd::NeighborScheduled {
                engine_id: engine_id.clone(),
                up,
            },
            timeout,
        )
        .await?;
        if up {
            self.shared.neighbors.notify().notify_one();
        }
        Ok(())
    }

    /// 서비스 리스너 등록 (서비스당 하나)
    pub fn register_listener(
        &self,
        service_id: ServiceId,
        listener: Arc<dyn LtpListener>,
    ) -> Result<()> {
        self.shared.listeners.register(service_id, listener)
    }

    pub fn unregister_listener(&self, service_id: &ServiceId) -> bool {
        self.shared.listeners.unregister(service_id).is_some()
    }

    /// 메모리 데이터를 블록 하나로 송신
    pub async fn send(
        &self,
        destination: EngineId,
        data: Bytes,
        options: BlockOptions,
    ) -> Result<SessionId> {
        self.send_payload(destination, Payload::Memory(data), options)
            .await
    }

    /// 파일 전체를 블록 하나로 송신 (세그먼트 인코딩 시 구간별로 읽음)
    pub async fn send_file(
        &self,
        destination: EngineId,
        path: impl AsRef<Path>,
        options: BlockOptions,
    ) -> Result<SessionId> {
        let payload = Payload::file(path.as_ref())?;
        self.send_payload(destination, payload, options).await
    }

    async fn send_payload(
        &self,
        destination: EngineId,
        payload: Payload,
        options: BlockOptions,
    ) -> Result<SessionId> {
        if let Some(neighbor) = self.shared.neighbors.get(&destination) {
            if !neighbor.is_scheduled() || !self.link.state().is_operational() {
                return Err(Error::NeighborNotOperational(destination));
            }
        }

        let (reply, rx) = oneshot::channel();
        enqueue(
            &self.outbound_tx,
            OutboundCmd::Send {
                destination,
                payload,
                options,
                reply,
            },
            self.shared.config.queue_full_timeout(),
        )
        .await?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    /// 송신 중인 블록 취소
    pub async fn cancel_sent_block(
        &self,
        session_id: SessionId,
        reason: CancelReason,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        enqueue(
            &self.outbound_tx,
            OutboundCmd::Cancel {
                session_id,
                reason,
                reply,
            },
            self.shared.config.queue_full_timeout(),
        )
        .await?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// 정지
    ///
    /// 두 처리기가 열린 세션을 모두 닫은 뒤 링크 루프를 멈춘다.
    pub async fn stop(self) {
        let join_timeout = self.shared.config.join_timeout();
        if self.outbound_tx.send(OutboundCmd::Stop).await.is_err() {
            debug!("송신 처리기가 이미 종료됨");
        }
        if self.inbound_tx.send(InboundCmd::Stop).await.is_err() {
            debug!("수신 처리기가 이미 종료됨");
        }
        for task in self.processors {
            let abort = task.abort_handle();
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                warn!("처리기가 {:?} 안에 끝나지 않음, 강제 종료", join_timeout);
                abort.abort();
            }
        }
        self.link.stop(join_timeout).await;
        info!("LTP 엔진 정지: {}", self.shared.stats.snapshot().summary());
    }
}
