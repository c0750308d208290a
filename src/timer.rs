//! 재전송 타이머 관리
//!
//! 타이머는 만료 시 처리기 큐에 만료 명령을 넣는 것 외에는 아무것도 하지 않는다.
//! 세대 번호로 이미 멈추거나 다시 시작된 타이머의 늦은 만료를 걸러낸다.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::ids::EngineId;

const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

struct TimerEntry {
    neighbor: EngineId,
    duration: Duration,
    generation: u64,

    /// 실행 중이면 Some, 이웃 다운으로 보류 중이면 None
    handle: Option<AbortHandle>,
}

/// 키별 단발 타이머 모음
///
/// 처리기 하나가 소유한다. 만료 시 `wrap(key, generation)`으로 만든 명령을 보낸다.
pub struct TimerManager<K, C> {
    entries: HashMap<K, TimerEntry>,
    down_neighbors: HashSet<EngineId>,
    next_generation: u64,
    tx: mpsc::Sender<C>,
    wrap: fn(K, u64) -> C,
    enqueue_timeout: Duration,
}

impl<K, C> TimerManager<K, C>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
    C: Send + 'static,
{
    pub fn new(tx: mpsc::Sender<C>, wrap: fn(K, u64) -> C) -> Self {
        Self {
            entries: HashMap::new(),
            down_neighbors: HashSet::new(),
            next_generation: 1,
            tx,
            wrap,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }

    /// 만료 명령을 넣을 때 큐가 가득 찬 경우의 대기 한도
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// 타이머 시작 (같은 키가 있으면 교체)
    ///
    /// 이웃이 다운 상태면 보류로 등록하고 이웃이 올라올 때 새로 시작한다.
    pub fn start(&mut self, key: K, neighbor: &EngineId, duration: Duration) {
        self.stop(&key);
        let generation = self.next_generation;
        self.next_generation += 1;

        let handle = if self.down_neighbors.contains(neighbor) {
            trace!("타이머 보류: {:?} (이웃 {} 다운)", key, neighbor);
            None
        } else {
            Some(self.spawn(key.clone(), generation, duration))
        };
        self.entries.insert(
            key,
            TimerEntry {
                neighbor: neighbor.clone(),
                duration,
                generation,
                handle,
            },
        );
    }

    fn spawn(&self, key: K, generation: u64, duration: Duration) -> AbortHandle {
        let tx = self.tx.clone();
        let enqueue_timeout = self.enqueue_timeout;
        let mut command = (self.wrap)(key.clone(), generation);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            loop {
                match tx.send_timeout(command, enqueue_timeout).await {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(returned)) => {
                        warn!(
                            "처리기 큐 가득 참, 타이머 만료 재시도: {:?} ({}ms)",
                            key,
                            enqueue_timeout.as_millis()
                        );
                        command = returned;
                    }
                    // 처리기가 종료되었으면 무시
                    Err(SendTimeoutError::Closed(_)) => break,
                }
            }
        })
        .abort_handle()
    }

    /// 타이머 정지. 있었으면 true.
    pub fn stop(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// 조건에 맞는 타이머 전부 정지
    pub fn stop_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if predicate(key) {
                if let Some(handle) = entry.handle.take() {
                    handle.abort();
                }
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// 만료 명령 수신 처리
    ///
    /// 현재 세대의 만료면 항목을 제거하고 true. 늦게 도착한 만료는 false.
    pub fn expired(&mut self, key: &K, generation: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation && entry.handle.is_some() => {
                self.entries.remove(key);
                true
            }
            _ => {
                debug!("오래된 타이머 만료 무시: {:?}", key);
                false
            }
        }
    }

    /// 이웃 다운: 해당 이웃의 타이머를 모두 보류
    pub fn suspend_neighbor(&mut self, neighbor: &EngineId) {
        self.down_neighbors.insert(neighbor.clone());
        for entry in self.entries.values_mut().filter(|e| &e.neighbor == neighbor) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
        }
    }

    /// 이웃 업: 보류 중인 타이머를 처음부터 다시 시작
    pub fn resume_neighbor(&mut self, neighbor: &EngineId) {
        self.down_neighbors.remove(neighbor);
        let suspended: Vec<(K, Duration)> = self
            .entries
            .iter()
            .filter(|(_, e)| &e.neighbor == neighbor && e.handle.is_none())
            .map(|(k, e)| (k.clone(), e.duration))
            .collect();
        for (key, duration) in suspended {
            self.start(key, neighbor, duration);
        }
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.entries.get(key).map_or(false, |e| e.handle.is_some())
    }

    pub fn is_suspended(&self, key: &K) -> bool {
        self.entries.get(key).map_or(false, |e| e.handle.is_none())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 모든 타이머 정지
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
    }
}

impl<K, C> Drop for TimerManager<K, C> {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            if let Some(handle) = &entry.handle {
                handle.abort();
            }
        }
    }
}
