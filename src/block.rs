//! 블록 모델
//!
//! - OutboundBlock: 송신 페이로드를 레드/그린 세그먼트로 분할, 송신 상태
//! - InboundBlock: 수신 세그먼트를 오프셋 순으로 조립, 수신 상태
//!
//! 블록은 방향별 처리 태스크 하나만 소유하고 변경한다.

use std::collections::HashMap;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::ids::{CheckpointSerial, EngineId, ReportSerial, SerialCounter, ServiceId, SessionId};
use crate::pacer::SessionToken;
use crate::payload::{BlobStore, Payload};
use crate::report::ReportSegment;
use crate::segment::{
    estimate_data_header_len, CancelReason, DataKind, DataSegment, Extension, Segment,
    SegmentBody,
};
use crate::{Error, Result};

/// 체크포인트 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// 체크포인트 없음 (레드 데이터 불가, 전체 그린으로 보정)
    None,
    /// 레드 파트 마지막 세그먼트만
    LastOnly,
    /// 모든 레드 세그먼트
    All,
}

/// 블록 송신 옵션
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOptions {
    /// 수신측 서비스 ID
    pub service_id: ServiceId,

    /// 레드 파트 길이 (앞쪽부터)
    pub red_length: u64,

    pub checkpoint_policy: CheckpointPolicy,

    /// 모든 데이터 세그먼트에 붙일 헤더 확장
    pub header_extensions: Vec<Extension>,

    /// 모든 데이터 세그먼트에 붙일 트레일러 확장
    pub trailer_extensions: Vec<Extension>,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            service_id: ServiceId::default(),
            red_length: u64::MAX,
            checkpoint_policy: CheckpointPolicy::LastOnly,
            header_extensions: Vec::new(),
            trailer_extensions: Vec::new(),
        }
    }
}

impl BlockOptions {
    /// 전체 레드 블록
    pub fn all_red(service_id: ServiceId) -> Self {
        Self {
            service_id,
            ..Self::default()
        }
    }

    /// 전체 그린 블록
    pub fn all_green(service_id: ServiceId) -> Self {
        Self {
            service_id,
            red_length: 0,
            checkpoint_policy: CheckpointPolicy::None,
            ..Self::default()
        }
    }

    /// 앞쪽 `red_length` 바이트만 레드
    pub fn mixed(service_id: ServiceId, red_length: u64) -> Self {
        Self {
            service_id,
            red_length,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    /// 블록 길이에 맞춰 보정된 레드 길이
    ///
    /// 체크포인트 없이는 레드 데이터를 확인할 수 없으므로 `None` 정책이면 0.
    pub fn effective_red_length(&self, block_length: u64) -> u64 {
        if self.checkpoint_policy == CheckpointPolicy::None {
            return 0;
        }
        self.red_length.min(block_length)
    }
}

/// 송신측 상태 (RFC 5326 §8.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Closed,
    /// 전체 그린 블록 송신 중
    FgXmit,
    /// 레드 파트 송신 중
    RpXmit,
    /// 그린 파트 송신 중
    GpXmit,
    /// 레드 데이터 전체 확인 대기
    WaitRpAck,
    /// 취소 송신, 취소 확인 대기
    CsSent,
}

/// 수신측 상태 (RFC 5326 §8.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Closed,
    /// 데이터 수신 중
    DsRec,
    /// 블록 끝 수신, 리포트 확인 대기
    WaitRpRec,
    /// 취소 송신, 취소 확인 대기
    CrSent,
}

/// 리스너에 전달하는 블록 요약
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub session_id: SessionId,
    pub service_id: ServiceId,

    /// 상대 엔진
    pub neighbor: EngineId,

    pub length: u64,
    pub red_length: u64,
}

/// 진행 중인 취소
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingCancel {
    pub reason: CancelReason,
    pub transmit_enqueues: u32,
}

impl OutstandingCancel {
    pub fn new(reason: CancelReason) -> Self {
        Self {
            reason,
            transmit_enqueues: 0,
        }
    }
}

/// 송신 블록의 데이터 세그먼트 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSegment {
    pub kind: DataKind,
    pub offset: u64,
    pub length: u64,
    pub checkpoint_serial: CheckpointSerial,
    pub report_serial: ReportSerial,

    /// 리포트가 수신을 확인함
    pub acked: bool,

    /// 실제로 송신됨 (큐에서 꺼내짐)
    pub sent: bool,

    /// 송신 큐 투입 횟수 (재전송 한도 판정용)
    pub transmit_enqueues: u32,
}

impl OutboundSegment {
    fn new(kind: DataKind, offset: u64, length: u64) -> Self {
        Self {
            kind,
            offset,
            length,
            checkpoint_serial: CheckpointSerial(0),
            report_serial: ReportSerial(0),
            acked: false,
            sent: false,
            transmit_enqueues: 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 송신 블록
#[derive(Debug)]
pub struct OutboundBlock {
    pub session_id: SessionId,
    pub neighbor: EngineId,
    pub options: BlockOptions,
    pub payload: Payload,

    /// 오프셋 순 데이터 세그먼트
    pub segments: Vec<OutboundSegment>,

    pub state: SenderState,
    pub cancel: Option<OutstandingCancel>,
    pub checkpoint_serials: SerialCounter,
    pub token: SessionToken,
    pub created_at: Instant,

    red_length: u64,
}

impl OutboundBlock {
    /// 블록 생성 및 세그먼트 분할
    pub fn new(
        session_id: SessionId,
        neighbor: EngineId,
        payload: Payload,
        options: BlockOptions,
        mtu: usize,
    ) -> Result<Self> {
        Self::with_serials(
            session_id,
            neighbor,
            payload,
            options,
            mtu,
            SerialCounter::random(),
        )
    }

    /// 체크포인트 시리얼 생성기를 지정해 생성
    pub fn with_serials(
        session_id: SessionId,
        neighbor: EngineId,
        payload: Payload,
        options: BlockOptions,
        mtu: usize,
        mut checkpoint_serials: SerialCounter,
    ) -> Result<Self> {
        let length = payload.len();
        if length == 0 {
            return Err(Error::InvalidBlockOptions("빈 블록은 보낼 수 없음".into()));
        }
        if options.red_length > 0
            && options.red_length != u64::MAX
            && options.checkpoint_policy == CheckpointPolicy::None
        {
            warn!(
                "체크포인트 없는 레드 데이터 요청: session={}, 전체 그린으로 보정",
                session_id
            );
        }
        let red_length = options.effective_red_length(length);

        let header = estimate_data_header_len(
            &session_id,
            &options.service_id,
            &options.header_extensions,
            &options.trailer_extensions,
        );
        if mtu <= header {
            return Err(Error::InvalidBlockOptions(format!(
                "MTU {}가 헤더 추정치 {}보다 작음",
                mtu, header
            )));
        }
        let max_payload = (mtu - header) as u64;

        let segments = segment_ranges(
            length,
            red_length,
            max_payload,
            options.checkpoint_policy,
            &mut checkpoint_serials,
        );

        debug!(
            "블록 분할: session={}, {} bytes (red {}), {} 세그먼트",
            session_id,
            length,
            red_length,
            segments.len()
        );

        Ok(Self {
            session_id,
            neighbor,
            options,
            payload,
            segments,
            state: SenderState::Closed,
            cancel: None,
            checkpoint_serials,
            token: SessionToken::new(),
            created_at: Instant::now(),
            red_length,
        })
    }

    pub fn length(&self) -> u64 {
        self.payload.len()
    }

    pub fn red_length(&self) -> u64 {
        self.red_length
    }

    pub fn is_all_green(&self) -> bool {
        self.red_length == 0
    }

    /// 모든 레드 세그먼트 확인 + 모든 그린 세그먼트 송신
    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| {
            if s.kind.is_red() {
                s.acked
            } else {
                s.sent
            }
        })
    }

    /// 인덱스의 세그먼트를 와이어 세그먼트로 구성 (페이로드 읽기 포함)
    pub fn wire_segment(&self, index: usize) -> Result<Segment> {
        let seg = self
            .segments
            .get(index)
            .ok_or_else(|| Error::Unknown(format!("세그먼트 인덱스 {} 없음", index)))?;
        let data = self.payload.read_range(seg.offset, seg.length)?;
        Ok(Segment {
            session_id: self.session_id.clone(),
            header_extensions: self.options.header_extensions.clone(),
            trailer_extensions: self.options.trailer_extensions.clone(),
            body: SegmentBody::Data(DataSegment {
                kind: seg.kind,
                service_id: self.options.service_id.clone(),
                offset: seg.offset,
                checkpoint_serial: seg.checkpoint_serial,
                report_serial: seg.report_serial,
                data,
            }),
        })
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            session_id: self.session_id.clone(),
            service_id: self.options.service_id.clone(),
            neighbor: self.neighbor.clone(),
            length: self.length(),
            red_length: self.red_length,
        }
    }
}

/// 페이로드를 레드 -> 그린 순서로 분할
///
/// 각 세그먼트는 먼저 "마지막 아님"으로 만든 뒤, 색상별 마지막 세그먼트를 고친다.
fn segment_ranges(
    length: u64,
    red_length: u64,
    max_payload: u64,
    policy: CheckpointPolicy,
    serials: &mut SerialCounter,
) -> Vec<OutboundSegment> {
    let mut segments = Vec::with_capacity((length / max_payload + 2) as usize);
    let provisional_red = if policy == CheckpointPolicy::All {
        DataKind::RedCheckpoint
    } else {
        DataKind::Red
    };

    let mut offset = 0;
    while offset < red_length {
        let len = (red_length - offset).min(max_payload);
        segments.push(OutboundSegment::new(provisional_red, offset, len));
        offset += len;
    }
    if let Some(last) = segments.last_mut() {
        last.kind = if red_length < length {
            DataKind::RedCheckpointEorp
        } else {
            DataKind::RedCheckpointEorpEob
        };
    }

    while offset < length {
        let len = (length - offset).min(max_payload);
        segments.push(OutboundSegment::new(DataKind::Green, offset, len));
        offset += len;
    }
    if let Some(last) = segments.last_mut() {
        if last.kind.is_green() {
            last.kind = DataKind::GreenEob;
        }
    }

    for seg in segments.iter_mut().filter(|s| s.kind.is_checkpoint()) {
        seg.checkpoint_serial = CheckpointSerial(serials.next_serial());
    }
    segments
}

/// 수신 블록의 세그먼트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedSegment {
    pub kind: DataKind,
    pub offset: u64,
    pub length: u64,
    pub payload: Payload,

    /// 확인된 리포트가 이 세그먼트를 포함함
    pub acked: bool,
}

impl ReceivedSegment {
    pub fn new(kind: DataKind, offset: u64, payload: Payload) -> Self {
        Self {
            kind,
            offset,
            length: payload.len(),
            payload,
            acked: false,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 확인 대기 중인 리포트
#[derive(Debug, Clone)]
pub struct OutstandingReport {
    pub report: ReportSegment,
    pub transmit_enqueues: u32,
}

/// 수신 블록
#[derive(Debug)]
pub struct InboundBlock {
    pub session_id: SessionId,
    pub neighbor: EngineId,
    pub service_id: ServiceId,

    /// 오프셋 순 수신 세그먼트 (빈 구간 허용)
    pub segments: Vec<ReceivedSegment>,

    /// 지금까지 본 가장 큰 끝 오프셋
    pub data_length: u64,

    /// 지금까지 본 레드 세그먼트의 가장 큰 끝 오프셋
    pub red_length: u64,

    pub outstanding_reports: HashMap<ReportSerial, OutstandingReport>,
    pub report_serials: SerialCounter,
    pub reception_problems: u32,
    pub state: ReceiverState,
    pub cancel: Option<OutstandingCancel>,
    pub token: SessionToken,
    pub red_part_notified: bool,
    pub created_at: Instant,
}

impl InboundBlock {
    pub fn new(session_id: SessionId, neighbor: EngineId, service_id: ServiceId) -> Self {
        Self::with_serials(session_id, neighbor, service_id, SerialCounter::random())
    }

    pub fn with_serials(
        session_id: SessionId,
        neighbor: EngineId,
        service_id: ServiceId,
        report_serials: SerialCounter,
    ) -> Self {
        Self {
            session_id,
            neighbor,
            service_id,
            segments: Vec::new(),
            data_length: 0,
            red_length: 0,
            outstanding_reports: HashMap::new(),
            report_serials,
            reception_problems: 0,
            state: ReceiverState::Closed,
            cancel: None,
            token: SessionToken::new(),
            red_part_notified: false,
            created_at: Instant::now(),
        }
    }

    /// 세그먼트 삽입
    ///
    /// 같은 (offset, length)면 교체하고 이전 페이로드를 돌려준다 (확인 여부는 유지).
    /// 아니면 오프셋이 더 큰 첫 세그먼트 앞에 넣는다.
    pub fn insert(&mut self, mut segment: ReceivedSegment) -> Option<Payload> {
        let end = segment.end();
        self.data_length = self.data_length.max(end);
        if segment.kind.is_red() {
            self.red_length = self.red_length.max(end);
        }

        let mut position = self.segments.len();
        for (i, existing) in self.segments.iter_mut().enumerate() {
            if existing.offset == segment.offset && existing.length == segment.length {
                segment.acked |= existing.acked;
                let old = std::mem::replace(existing, segment);
                return Some(old.payload);
            }
            if existing.offset > segment.offset {
                position = i;
                break;
            }
        }
        self.segments.insert(position, segment);
        None
    }

    /// 레드/그린 순서 위반 여부
    ///
    /// 레드 세그먼트가 어떤 그린 세그먼트보다 뒤에 있거나, 그린 세그먼트가 어떤 레드
    /// 세그먼트보다 앞에 있으면 위반이다.
    pub fn is_miscolored(&self, kind: DataKind, offset: u64) -> bool {
        if kind.is_red() {
            self.segments
                .iter()
                .any(|s| s.kind.is_green() && offset > s.offset)
        } else {
            self.segments
                .iter()
                .any(|s| s.kind.is_red() && offset < s.offset)
        }
    }

    fn eorp_end(&self) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| s.kind.is_eorp())
            .map(ReceivedSegment::end)
    }

    fn eob_end(&self) -> Option<u64> {
        self.segments
            .iter()
            .find(|s| s.kind.is_eob())
            .map(ReceivedSegment::end)
    }

    pub fn is_eob_received(&self) -> bool {
        self.eob_end().is_some()
    }

    /// 색상별 세그먼트가 `start`부터 빈틈 없이 이어진 끝 오프셋
    fn contiguous_end(&self, red: bool, start: u64) -> Option<u64> {
        let mut expected = start;
        for seg in self.segments.iter().filter(|s| s.kind.is_red() == red) {
            if seg.offset > expected {
                return None;
            }
            expected = expected.max(seg.end());
        }
        Some(expected)
    }

    /// EORP 수신 + 레드 파트 빈틈 없음
    pub fn is_all_red_received(&self) -> bool {
        match self.eorp_end() {
            Some(eorp_end) => self.contiguous_end(true, 0) == Some(eorp_end),
            None => false,
        }
    }

    /// 레드 파트 전체 수신 + 모든 레드 세그먼트 확인됨
    pub fn is_red_complete(&self) -> bool {
        self.is_all_red_received() && self.segments.iter().filter(|s| s.kind.is_red()).all(|s| s.acked)
    }

    /// EOB 수신 + 그린 파트 빈틈 없음 (그린 데이터가 없으면 EOB만 확인)
    pub fn is_all_green_received(&self) -> bool {
        let eob_end = match self.eob_end() {
            Some(end) => end,
            None => return false,
        };
        if !self.segments.iter().any(|s| s.kind.is_green()) {
            return true;
        }
        let green_start = self.eorp_end().unwrap_or(0);
        self.contiguous_end(false, green_start) == Some(eob_end)
    }

    /// 레드 데이터가 모두 확인되어 더 기다릴 리포트가 없는지
    ///
    /// 레드 세그먼트를 하나도 받지 못했으면 참이다. 레드 파트를 통째로 잃은 혼합
    /// 블록은 그린 EOB 시점에 그린 파트 앞쪽 빈틈으로 판정된다.
    pub fn is_red_settled(&self) -> bool {
        if !self.outstanding_reports.is_empty() {
            return false;
        }
        let has_red = self.segments.iter().any(|s| s.kind.is_red());
        !has_red || self.is_red_complete()
    }

    /// 전체 블록 수신 완료
    pub fn is_complete(&self) -> bool {
        self.is_red_settled() && self.is_eob_received() && self.is_all_green_received()
    }

    /// `[lower, upper)` 범위에서 리포트가 포함하는 세그먼트를 확인 처리
    pub fn mark_acked(&mut self, report: &ReportSegment) -> usize {
        let mut count = 0;
        for seg in self.segments.iter_mut().filter(|s| s.kind.is_red()) {
            if !seg.acked && report.covers(seg.offset, seg.length) {
                seg.acked = true;
                count += 1;
            }
        }
        count
    }

    /// 리포트 생성용 레드 세그먼트 구간
    pub fn red_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.segments
            .iter()
            .filter(|s| s.kind.is_red())
            .map(|s| (s.offset, s.length))
    }

    /// 세그먼트 페이로드를 하나로 모음
    ///
    /// 총 길이가 임계값을 넘으면 블롭 파일 하나에, 아니면 메모리에 모은다.
    /// 모은 뒤 세그먼트별 저장소는 해제한다.
    pub fn gather(&mut self, store: &BlobStore, file_threshold: u64) -> Result<Payload> {
        let total = self.data_length;
        let result = if total > file_threshold {
            let path = store.create()?;
            let mut written = 0u64;
            for seg in &self.segments {
                if seg.end() <= written {
                    continue;
                }
                let skip = written.saturating_sub(seg.offset);
                let data = seg.payload.read_range(skip, seg.length - skip)?;
                store.write_at(&path, seg.offset + skip, &data)?;
                written = seg.end();
            }
            Payload::File {
                path,
                offset: 0,
                length: total,
            }
        } else {
            let mut buf = BytesMut::with_capacity(total as usize);
            for seg in &self.segments {
                if seg.end() <= buf.len() as u64 {
                    continue;
                }
                let skip = (buf.len() as u64).saturating_sub(seg.offset);
                let data = seg.payload.read_range(skip, seg.length - skip)?;
                buf.extend_from_slice(&data);
            }
            Payload::Memory(buf.freeze())
        };

        self.release_segments(store);
        Ok(result)
    }

    /// 세그먼트별 저장소 해제
    pub fn release_segments(&mut self, store: &BlobStore) {
        for seg in self.segments.drain(..) {
            store.release(&seg.payload);
        }
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            session_id: self.session_id.clone(),
            service_id: self.service_id.clone(),
            neighbor: self.neighbor.clone(),
            length: self.data_length,
            red_length: self.red_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ReportSerial;
    use crate::report::ReceptionClaim;
    use bytes::Bytes;

    fn session() -> SessionId {
        SessionId::new(EngineId::from(7), 1234)
    }

    fn outbound(len: usize, options: BlockOptions, mtu: usize) -> OutboundBlock {
        OutboundBlock::with_serials(
            session(),
            EngineId::from(9),
            Payload::Memory(Bytes::from(vec![0u8; len])),
            options,
            mtu,
            SerialCounter::starting_at(100),
        )
        .unwrap()
    }

    fn header_len(options: &BlockOptions) -> usize {
        estimate_data_header_len(
            &session(),
            &options.service_id,
            &options.header_extensions,
            &options.trailer_extensions,
        )
    }

    fn assert_exact_cover(block: &OutboundBlock) {
        let mut expected = 0;
        for seg in &block.segments {
            assert_eq!(seg.offset, expected);
            assert!(seg.length > 0);
            expected = seg.end();
        }
        assert_eq!(expected, block.length());
    }

    #[test]
    fn test_mixed_block_last_only() {
        let options = BlockOptions::mixed(ServiceId::from(1), 3000);
        let mtu = 1000 + header_len(&options);
        let block = outbound(5000, options, mtu);

        assert_exact_cover(&block);
        let kinds: Vec<DataKind> = block.segments.iter().map(|s| s.kind).collect();
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
        let checkpoints: Vec<&OutboundSegment> =
            block.segments.iter().filter(|s| s.kind.is_checkpoint()).collect();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].end(), 3000);
        assert_eq!(checkpoints[0].checkpoint_serial, CheckpointSerial(100));
        assert_eq!(block.red_length(), 3000);
    }

    #[test]
    fn test_checkpoint_all_serials() {
        let options =
            BlockOptions::all_red(ServiceId::from(1)).with_policy(CheckpointPolicy::All);
        let mtu = 100 + header_len(&options);
        let block = outbound(350, options, mtu);

        assert_exact_cover(&block);
        assert_eq!(block.segments.len(), 4);
        assert!(block.segments.iter().all(|s| s.kind.is_checkpoint()));
        assert_eq!(block.segments[3].kind, DataKind::RedCheckpointEorpEob);
        let serials: Vec<u32> = block
            .segments
            .iter()
            .map(|s| s.checkpoint_serial.0)
            .collect();
        assert_eq!(serials, vec![100, 101, 102, 103]);
    }

    #[test]
    fn test_no_checkpoint_forces_green() {
        let options =
            BlockOptions::mixed(ServiceId::from(1), 500).with_policy(CheckpointPolicy::None);
        let mtu = 200 + header_len(&options);
        let block = outbound(1000, options, mtu);

        assert_exact_cover(&block);
        assert_eq!(block.red_length(), 0);
        assert!(block.is_all_green());
        assert!(block.segments.iter().all(|s| s.kind.is_green()));
        assert_eq!(block.segments.last().unwrap().kind, DataKind::GreenEob);
    }

    #[test]
    fn test_single_segment_blocks() {
        let options = BlockOptions::all_red(ServiceId::from(1));
        let block = outbound(10, options, 1400);
        assert_eq!(block.segments.len(), 1);
        assert_eq!(block.segments[0].kind, DataKind::RedCheckpointEorpEob);

        let green = outbound(10, BlockOptions::all_green(ServiceId::from(1)), 1400);
        assert_eq!(green.segments.len(), 1);
        assert_eq!(green.segments[0].kind, DataKind::GreenEob);
    }

    #[test]
    fn test_invalid_blocks() {
        let empty = OutboundBlock::new(
            session(),
            EngineId::from(9),
            Payload::Memory(Bytes::new()),
            BlockOptions::default(),
            1400,
        );
        assert!(matches!(empty, Err(Error::InvalidBlockOptions(_))));

        let tiny_mtu = OutboundBlock::new(
            session(),
            EngineId::from(9),
            Payload::Memory(Bytes::from_static(b"abc")),
            BlockOptions::default(),
            10,
        );
        assert!(matches!(tiny_mtu, Err(Error::InvalidBlockOptions(_))));
    }

    #[test]
    fn test_wire_segment_fits_mtu() {
        let options = BlockOptions::mixed(ServiceId::from(300), 2500);
        let mtu = 700;
        let block = outbound(4000, options, mtu);
        for i in 0..block.segments.len() {
            let bytes = block.wire_segment(i).unwrap().to_bytes().unwrap();
            assert!(bytes.len() <= mtu);
        }
    }

    #[test]
    fn test_outbound_completion() {
        let options = BlockOptions::mixed(ServiceId::from(1), 100);
        let mtu = 100 + header_len(&options);
        let mut block = outbound(300, options, mtu);
        assert!(!block.is_complete());

        block.segments[0].acked = true;
        assert!(!block.is_complete());
        block.segments[1].sent = true;
        block.segments[2].sent = true;
        assert!(block.is_complete());
    }

    fn inbound() -> InboundBlock {
        InboundBlock::with_serials(
            session(),
            EngineId::from(7),
            ServiceId::from(1),
            SerialCounter::starting_at(1),
        )
    }

    fn seg(kind: DataKind, offset: u64, len: usize) -> ReceivedSegment {
        ReceivedSegment::new(
            kind,
            offset,
            Payload::Memory(Bytes::from(vec![(offset % 251) as u8; len])),
        )
    }

    #[test]
    fn test_insert_orders_and_replaces() {
        let mut block = inbound();
        assert!(block.insert(seg(DataKind::Red, 200, 100)).is_none());
        assert!(block.insert(seg(DataKind::Red, 0, 100)).is_none());
        assert!(block.insert(seg(DataKind::Red, 100, 100)).is_none());
        let offsets: Vec<u64> = block.segments.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);

        block.segments[1].acked = true;
        assert!(block.insert(seg(DataKind::Red, 100, 100)).is_some());
        assert_eq!(block.segments.len(), 3);
        assert!(block.segments[1].acked);
        assert_eq!(block.data_length, 300);
        assert_eq!(block.red_length, 300);
    }

    #[test]
    fn test_miscolor_detection() {
        let mut block = inbound();
        block.insert(seg(DataKind::Green, 100, 10));
        assert!(block.is_miscolored(DataKind::Red, 150));
        assert!(!block.is_miscolored(DataKind::Red, 50));

        let mut block = inbound();
        block.insert(seg(DataKind::Red, 500, 10));
        assert!(block.is_miscolored(DataKind::Green, 100));
        assert!(!block.is_miscolored(DataKind::Green, 600));
    }

    #[test]
    fn test_red_completion() {
        let mut block = inbound();
        block.insert(seg(DataKind::Red, 0, 100));
        block.insert(seg(DataKind::RedCheckpointEorpEob, 200, 100));
        assert!(!block.is_all_red_received());

        block.insert(seg(DataKind::Red, 100, 100));
        assert!(block.is_all_red_received());
        assert!(!block.is_red_complete());

        let report = ReportSegment {
            report_serial: ReportSerial(1),
            checkpoint_serial: CheckpointSerial(1),
            upper_bound: 300,
            lower_bound: 0,
            claims: vec![ReceptionClaim::new(0, 300)],
        };
        assert_eq!(block.mark_acked(&report), 3);
        assert!(block.is_red_complete());
        assert!(block.is_complete());
    }

    #[test]
    fn test_outstanding_report_blocks_completion() {
        let mut block = inbound();
        let mut s = seg(DataKind::RedCheckpointEorpEob, 0, 100);
        s.acked = true;
        block.insert(s);
        assert!(block.is_complete());

        block.outstanding_reports.insert(
            ReportSerial(5),
            OutstandingReport {
                report: ReportSegment {
                    report_serial: ReportSerial(5),
                    checkpoint_serial: CheckpointSerial(1),
                    upper_bound: 100,
                    lower_bound: 0,
                    claims: vec![ReceptionClaim::new(0, 100)],
                },
                transmit_enqueues: 1,
            },
        );
        assert!(!block.is_complete());
    }

    #[test]
    fn test_green_tail_lost_until_retransmitted() {
        let mut block = inbound();
        block.insert(seg(DataKind::Green, 0, 100));
        block.insert(seg(DataKind::Green, 100, 100));
        assert!(!block.is_complete());
        assert!(!block.is_all_green_received());

        block.insert(seg(DataKind::GreenEob, 200, 100));
        assert!(block.is_all_green_received());
        assert!(block.is_complete());
    }

    #[test]
    fn test_green_gap_detected() {
        let mut block = inbound();
        let mut red = seg(DataKind::RedCheckpointEorp, 0, 100);
        red.acked = true;
        block.insert(red);
        block.insert(seg(DataKind::GreenEob, 200, 100));
        assert!(!block.is_all_green_received());

        block.insert(seg(DataKind::Green, 100, 100));
        assert!(block.is_all_green_received());
        assert!(block.is_complete());
    }

    #[test]
    fn test_lost_red_part_judged_as_green_gap() {
        let mut block = inbound();
        block.insert(seg(DataKind::Green, 100, 100));
        block.insert(seg(DataKind::GreenEob, 200, 100));
        assert!(block.is_red_settled());
        assert!(block.is_eob_received());
        assert!(!block.is_all_green_received());
        assert!(!block.is_complete());
    }

    #[test]
    fn test_gather_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut block = inbound();
        block.insert(seg(DataKind::Red, 0, 10));
        block.insert(seg(DataKind::Red, 10, 10));
        block.insert(seg(DataKind::GreenEob, 20, 5));
        let payload = block.gather(&store, 1000).unwrap();
        let bytes = payload.to_bytes().unwrap();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[10], 10);
        assert_eq!(bytes[24], 20);
        assert!(block.segments.is_empty());

        let mut block = inbound();
        let spilled = store.store(&vec![3u8; 40]).unwrap();
        let spilled_path = match &spilled {
            Payload::File { path, .. } => path.clone(),
            Payload::Memory(_) => unreachable!(),
        };
        block.insert(ReceivedSegment::new(DataKind::Red, 0, spilled));
        block.insert(seg(DataKind::RedCheckpointEorpEob, 40, 20));
        let payload = block.gather(&store, 50).unwrap();
        assert!(payload.is_file());
        let bytes = payload.to_bytes().unwrap();
        assert_eq!(bytes.len(), 60);
        assert_eq!(bytes[39], 3);
        assert_eq!(bytes[40], 40);
        assert!(!spilled_path.exists());
    }
}
