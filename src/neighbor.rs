//! 이웃 엔진 관리

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::ids::EngineId;
use crate::pacer::{Dequeued, QueuedSegment, SegmentQueue};
use crate::{Error, Result};

/// 이웃 엔진
#[derive(Debug)]
pub struct Neighbor {
    pub engine_id: EngineId,

    /// 대상 주소
    addr: RwLock<SocketAddr>,

    /// 외부 스케줄 상태 (링크 가용 여부)
    scheduled: AtomicBool,

    /// 페이서 포함 송신 큐
    queue: SegmentQueue,

    pub added_at: Instant,
}

impl Neighbor {
    pub fn new(
        engine_id: EngineId,
        addr: SocketAddr,
        rate_limit: u32,
        burst_size: u32,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            engine_id,
            addr: RwLock::new(addr),
            scheduled: AtomicBool::new(true),
            queue: SegmentQueue::new(rate_limit, burst_size, notify),
            added_at: Instant::now(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.read()
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        *self.addr.write() = addr;
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// 상태가 바뀌었으면 true
    pub fn set_scheduled(&self, up: bool) -> bool {
        self.scheduled.swap(up, Ordering::SeqCst) != up
    }

    /// 페이서를 거쳐 송신 큐에 추가
    pub fn transmit(&self, segment: QueuedSegment) {
        self.queue.push(segment);
    }

    pub fn queue(&self) -> &SegmentQueue {
        &self.queue
    }
}

/// 이웃 테이블
///
/// 처리기, 링크 루프, API가 공유한다.
#[derive(Debug)]
pub struct NeighborTable {
    neighbors: DashMap<EngineId, Arc<Neighbor>>,

    /// 어느 큐에든 세그먼트가 들어오면 드레인 루프를 깨움
    notify: Arc<Notify>,

    rate_limit: u32,
    burst_size: u32,
}

impl NeighborTable {
    pub fn new(rate_limit: u32, burst_size: u32) -> Self {
        Self {
            neighbors: DashMap::new(),
            notify: Arc::new(Notify::new()),
            rate_limit,
            burst_size,
        }
    }

    /// 이웃 추가 (이미 있으면 주소만 갱신)
    pub fn add(&self, engine_id: EngineId, addr: SocketAddr) -> Arc<Neighbor> {
        if let Some(existing) = self.neighbors.get(&engine_id) {
            existing.set_addr(addr);
            return existing.clone();
        }
        info!("이웃 추가: {} @ {}", engine_id, addr);
        let neighbor = Arc::new(Neighbor::new(
            engine_id.clone(),
            addr,
            self.rate_limit,
            self.burst_size,
            self.notify.clone(),
        ));
        self.neighbors.insert(engine_id, neighbor.clone());
        neighbor
    }

    pub fn remove(&self, engine_id: &EngineId) -> Option<Arc<Neighbor>> {
        let removed = self.neighbors.remove(engine_id).map(|(_, n)| n);
        if let Some(neighbor) = &removed {
            neighbor.queue().clear();
            debug!("이웃 제거: {}", engine_id);
        }
        removed
    }

    pub fn get(&self, engine_id: &EngineId) -> Option<Arc<Neighbor>> {
        self.neighbors.get(engine_id).map(|n| n.clone())
    }

    /// 이웃 조회, 없으면 에러
    pub fn require(&self, engine_id: &EngineId) -> Result<Arc<Neighbor>> {
        self.get(engine_id)
            .ok_or_else(|| Error::UnknownNeighbor(engine_id.clone()))
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<Arc<Neighbor>> {
        self.neighbors
            .iter()
            .find(|n| n.addr() == addr)
            .map(|n| n.clone())
    }

    pub fn all(&self) -> Vec<Arc<Neighbor>> {
        self.neighbors.iter().map(|n| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// 준비된 세그먼트 하나 꺼내기
    ///
    /// 스케줄이 켜진 이웃 큐를 돌며 처음 준비된 세그먼트를 돌려준다. 없으면 가장
    /// 이른 준비 시각 (모두 비었으면 None).
    pub fn next_ready(
        &self,
        now: Instant,
    ) -> std::result::Result<(Arc<Neighbor>, QueuedSegment), Option<Instant>> {
        let mut earliest: Option<Instant> = None;
        for neighbor in self.all().into_iter().filter(|n| n.is_scheduled()) {
            match neighbor.queue().pop(now) {
                Dequeued::Segment(segment) => return Ok((neighbor, segment)),
                Dequeued::NotReady(at) => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                Dequeued::Empty => {}
            }
        }
        Err(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::TransmitTag;
    use bytes::Bytes;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_and_lookup() {
        let table = NeighborTable::new(1000, 100);
        let id = EngineId::from(5);
        table.add(id.clone(), addr(2000));
        assert_eq!(table.len(), 1);
        assert_eq!(table.require(&id).unwrap().addr(), addr(2000));

        table.add(id.clone(), addr(2001));
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_addr(addr(2001)).unwrap().engine_id, id);
        assert!(table.by_addr(addr(2000)).is_none());

        assert!(matches!(
            table.require(&EngineId::from(6)),
            Err(Error::UnknownNeighbor(_))
        ));
        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_schedule_toggle() {
        let table = NeighborTable::new(1000, 100);
        let neighbor = table.add(EngineId::from(5), addr(2000));
        assert!(neighbor.is_scheduled());
        assert!(neighbor.set_scheduled(false));
        assert!(!neighbor.set_scheduled(false));
        assert!(!neighbor.is_scheduled());
    }

    #[test]
    fn test_next_ready_across_neighbors() {
        let table = NeighborTable::new(1_000_000, 1000);
        let a = table.add(EngineId::from(1), addr(3000));
        let b = table.add(EngineId::from(2), addr(3001));
        assert!(matches!(table.next_ready(Instant::now()), Err(None)));

        b.transmit(QueuedSegment::new(
            Bytes::from_static(b"b"),
            TransmitTag::Untracked,
            None,
        ));
        let (from, segment) = table.next_ready(Instant::now()).unwrap();
        assert_eq!(from.engine_id, b.engine_id);
        assert_eq!(&segment.bytes[..], b"b");

        a.transmit(QueuedSegment::new(
            Bytes::from_static(b"a"),
            TransmitTag::Untracked,
            None,
        ));
        let (from, _) = table.next_ready(Instant::now()).unwrap();
        assert_eq!(from.engine_id, a.engine_id);
    }

    #[test]
    fn test_unscheduled_neighbor_holds_queue() {
        let table = NeighborTable::new(1_000_000, 1000);
        let a = table.add(EngineId::from(1), addr(3000));
        a.transmit(QueuedSegment::new(
            Bytes::from_static(b"a"),
            TransmitTag::Untracked,
            None,
        ));
        a.set_scheduled(false);
        assert!(matches!(table.next_ready(Instant::now()), Err(None)));
        assert_eq!(a.queue().len(), 1);

        a.set_scheduled(true);
        assert!(table.next_ready(Instant::now()).is_ok());
    }
}
