//! 전송 링크
//!
//! 링크 하나가 세 루프를 돌린다.
//! - 수신 루프: 데이터그램 디코딩 후 방향별 처리기 큐로 전달
//! - 송신 루프: 이웃 큐에서 준비된 세그먼트를 꺼내 송신하고 송신 시작을 알림
//! - 감시 루프: 링크 동작 여부와 송신 비트레이트 갱신
//!
//! 루프는 처리기 상태를 직접 건드리지 않고 명령 큐로만 통신한다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{self, EngineShared};
use crate::ids::SessionId;
use crate::inbound::InboundCmd;
use crate::outbound::OutboundCmd;
use crate::pacer::QueuedSegment;
use crate::segment::{Segment, SegmentType};
use crate::stats::LtpStats;
use crate::{Error, Result};

/// UDP 데이터그램 최대 크기
const MAX_DATAGRAM: usize = 65535;

/// 데이터그램 전송 계층
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> std::io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// 링크가 데이터를 보낼 수 있는 상태인지
    fn is_operational(&self) -> bool;
}

/// UDP 소켓 전송 계층
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// 바인드 후 커널 송수신 버퍼 크기 설정
    pub async fn bind(addr: SocketAddr, buffer_size: usize) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            warn!("수신 버퍼 크기 설정 실패 ({} bytes): {}", buffer_size, e);
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            warn!("송신 버퍼 크기 설정 실패 ({} bytes): {}", buffer_size, e);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!("UDP 바인드: {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.socket.send_to(datagram, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn is_operational(&self) -> bool {
        self.socket.local_addr().is_ok()
    }
}

/// 링크 상태 (감시 루프가 갱신)
#[derive(Debug)]
pub struct LinkState {
    operational: AtomicBool,
    bytes_since_tick: AtomicU64,
    current_bit_rate: AtomicU64,
    max_bit_rate: AtomicU64,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            operational: AtomicBool::new(true),
            bytes_since_tick: AtomicU64::new(0),
            current_bit_rate: AtomicU64::new(0),
            max_bit_rate: AtomicU64::new(0),
        }
    }

    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    /// 상태가 바뀌었으면 true
    pub fn set_operational(&self, up: bool) -> bool {
        self.operational.swap(up, Ordering::SeqCst) != up
    }

    /// 현재 송신 비트레이트 (bits/sec)
    pub fn current_bit_rate(&self) -> u64 {
        self.current_bit_rate.load(Ordering::Relaxed)
    }

    pub fn max_bit_rate(&self) -> u64 {
        self.max_bit_rate.load(Ordering::Relaxed)
    }

    fn record_sent(&self, bytes: usize) {
        self.bytes_since_tick
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 지난 틱 이후 송신량으로 비트레이트 갱신
    fn tick(&self, elapsed: Duration) {
        let bytes = self.bytes_since_tick.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let rate = (bytes as f64 * 8.0 / secs) as u64;
        self.current_bit_rate.store(rate, Ordering::Relaxed);
        self.max_bit_rate.fetch_max(rate, Ordering::Relaxed);
    }
}

/// 실행 중인 링크
pub struct Link {
    transport: Arc<dyn Transport>,
    state: Arc<LinkState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    /// 세 루프 시작
    pub fn start(
        transport: Arc<dyn Transport>,
        shared: EngineShared,
        outbound_tx: mpsc::Sender<OutboundCmd>,
        inbound_tx: mpsc::Sender<InboundCmd>,
    ) -> Self {
        let state = Arc::new(LinkState::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let monitor_interval = shared.config.link_monitor_interval();

        let tasks = vec![
            tokio::spawn(receive_loop(
                transport.clone(),
                shared.clone(),
                outbound_tx.clone(),
                inbound_tx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(drain_loop(
                transport.clone(),
                shared.clone(),
                state.clone(),
                outbound_tx,
                inbound_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(monitor_loop(
                transport.clone(),
                shared,
                state.clone(),
                monitor_interval,
                shutdown_rx,
            )),
        ];

        Self {
            transport,
            state,
            shutdown,
            tasks,
        }
    }

    pub fn state(&self) -> Arc<LinkState> {
        self.state.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// 루프 정지 후 `join_timeout` 안에 끝나지 않으면 강제 종료
    pub async fn stop(self, join_timeout: Duration) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                warn!("링크 태스크가 {:?} 안에 끝나지 않음, 강제 종료", join_timeout);
                abort.abort();
            }
        }
        debug!("링크 정지");
    }
}

async fn receive_loop(
    transport: Arc<dyn Transport>,
    shared: EngineShared,
    outbound_tx: mpsc::Sender<OutboundCmd>,
    inbound_tx: mpsc::Sender<InboundCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            result = transport.recv_from(&mut buf) => result,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable 등은 다음 데이터그램에 영향 없음
                debug!("수신 에러: {}", e);
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
        };
        if !dispatch(&buf[..len], from, &shared, &outbound_tx, &inbound_tx).await {
            break;
        }
    }
    debug!("수신 루프 종료");
}

/// 데이터그램 하나를 디코딩해 처리기로 전달. 처리기가 닫혔으면 false.
async fn dispatch(
    datagram: &[u8],
    from: SocketAddr,
    shared: &EngineShared,
    outbound_tx: &mpsc::Sender<OutboundCmd>,
    inbound_tx: &mpsc::Sender<InboundCmd>,
) -> bool {
    LtpStats::incr(&shared.stats.segments_received);
    match Segment::decode(Bytes::copy_from_slice(datagram)) {
        Ok(segment) => {
            trace!("수신 {} from {}", segment, from);
            if segment.is_for_sender() {
                forward_received(outbound_tx, OutboundCmd::Received { segment, from }, shared).await
            } else {
                forward_received(inbound_tx, InboundCmd::Received { segment, from }, shared).await
            }
        }
        Err(e) => {
            LtpStats::incr(&shared.stats.decode_errors);
            if e.is_protocol_violation() {
                if let Some((SegmentType::Report, session_id)) = Segment::peek_session(datagram) {
                    warn!("잘못된 리포트: session={} from {}: {}", session_id, from, e);
                    return forward_received(
                        outbound_tx,
                        OutboundCmd::InvalidReport { session_id },
                        shared,
                    )
                    .await;
                }
            }
            debug!("형식 오류 데이터그램 버림 ({} bytes from {}): {}", datagram.len(), from, e);
            true
        }
    }
}

/// 수신 세그먼트를 처리기 큐에 넣기. 처리기가 닫혔으면 false.
///
/// 큐가 `queue_full_timeout` 동안 가득 차 있으면 데이터그램 손실과 같이 버린다.
async fn forward_received<C>(tx: &mpsc::Sender<C>, cmd: C, shared: &EngineShared) -> bool {
    match engine::enqueue(tx, cmd, shared.config.queue_full_timeout()).await {
        Ok(()) => true,
        Err(Error::QueueFull { timeout_ms }) => {
            warn!("처리기 큐 가득 참 ({}ms), 수신 세그먼트 버림", timeout_ms);
            true
        }
        Err(_) => false,
    }
}

/// 송신 시작 알림을 처리기 큐에 넣기. 처리기가 닫혔거나 링크 정지 중이면 false.
///
/// 알림이 없으면 재전송 타이머가 시작되지 않으므로 버리지 않는다.
/// 시간 초과마다 시스템 에러로 알리고 다시 시도한다.
async fn forward_transmit_started<C>(
    tx: &mpsc::Sender<C>,
    mut cmd: C,
    session_id: Option<&SessionId>,
    shared: &EngineShared,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    let timeout = shared.config.queue_full_timeout();
    loop {
        match tx.send_timeout(cmd, timeout).await {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if *shutdown.borrow() {
                    return false;
                }
                error!("처리기 큐 가득 참 ({}ms), 송신 시작 알림 재시도", timeout.as_millis());
                shared.listeners.system_error(
                    None,
                    &format!("처리기 큐 가득 참 ({}ms)", timeout.as_millis()),
                    session_id,
                );
                cmd = returned;
            }
            Err(SendTimeoutError::Closed(_)) => return false,
        }
    }
}

async fn drain_loop(
    transport: Arc<dyn Transport>,
    shared: EngineShared,
    state: Arc<LinkState>,
    outbound_tx: mpsc::Sender<OutboundCmd>,
    inbound_tx: mpsc::Sender<InboundCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let notify = shared.neighbors.notify();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = match shared.neighbors.next_ready(Instant::now()) {
            Ok((neighbor, segment)) => {
                if !segment.is_valid() {
                    trace!("닫힌 세션의 세그먼트 버림: {:?}", segment.tag);
                    continue;
                }
                let QueuedSegment { bytes, tag, .. } = segment;
                match transport.send_to(&bytes, neighbor.addr()).await {
                    Ok(_) => {
                        LtpStats::incr(&shared.stats.segments_sent);
                        state.record_sent(bytes.len());
                    }
                    Err(e) => {
                        LtpStats::incr(&shared.stats.send_errors);
                        error!("송신 실패 {} ({}): {}", neighbor.engine_id, neighbor.addr(), e);
                        shared.listeners.system_error(
                            None,
                            &format!("송신 실패 {}: {}", neighbor.engine_id, e),
                            tag.session_id(),
                        );
                    }
                }

                // 송신 실패여도 타이머는 시작해야 재전송으로 복구됨
                let session_id = tag.session_id().cloned();
                let delivered = if tag.is_outbound() {
                    forward_transmit_started(
                        &outbound_tx,
                        OutboundCmd::TransmitStarted(tag),
                        session_id.as_ref(),
                        &shared,
                        &shutdown,
                    )
                    .await
                } else if tag.is_inbound() {
                    forward_transmit_started(
                        &inbound_tx,
                        InboundCmd::TransmitStarted(tag),
                        session_id.as_ref(),
                        &shared,
                        &shutdown,
                    )
                    .await
                } else {
                    true
                };
                if !delivered {
                    break;
                }
                continue;
            }
            Err(next) => next,
        };

        let ready = async {
            match next {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = notify.notified() => {}
            _ = ready => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("송신 루프 종료");
}

async fn monitor_loop(
    transport: Arc<dyn Transport>,
    shared: EngineShared,
    state: Arc<LinkState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = Instant::now();
        state.tick(now.duration_since(last));
        last = now;

        let up = transport.is_operational();
        if state.set_operational(up) {
            if up {
                info!("링크 동작 재개");
            } else {
                warn!("링크 동작 중단");
                shared.listeners.system_error(None, "링크 동작 중단", None);
            }
        }
        trace!(
            "링크 비트레이트: {} bps (최대 {} bps)",
            state.current_bit_rate(),
            state.max_bit_rate()
        );
    }
    debug!("감시 루프 종료");
}
