//! LTP 세그먼트와 와이어 코덱
//!
//! 세그먼트 = 고정 헤더 + 헤더 확장 + 타입별 본문 + 트레일러 확장
//!
//! ```text
//! +--------+--------+------------+----------+--------+-----------+
//! |ver|type|  session id (SDNVs)  |hext|text| h.ext  | body | t.ext
//! +--------+--------+------------+----------+--------+-----------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ids::{CheckpointSerial, ReportSerial, ServiceId, SessionId};
use crate::report::ReportSegment;
use crate::{sdnv, Error, Result};

/// LTP 프로토콜 버전 (RFC 5326)
pub const LTP_VERSION: u8 = 0;

/// 한 방향 확장 필드 최대 개수 (4비트)
pub const MAX_EXTENSIONS: usize = 15;

/// 인증 확장 태그
pub const EXT_AUTHENTICATION: u8 = 0x00;

/// 쿠키 확장 태그
pub const EXT_COOKIE: u8 = 0x01;

/// 세그먼트 타입 플래그 (4비트)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    RedData = 0x0,
    RedCheckpoint = 0x1,
    RedCheckpointEorp = 0x2,
    RedCheckpointEorpEob = 0x3,
    GreenData = 0x4,
    GreenEob = 0x7,
    Report = 0x8,
    ReportAck = 0x9,
    CancelFromSender = 0xc,
    CancelAckToSender = 0xd,
    CancelFromReceiver = 0xe,
    CancelAckToReceiver = 0xf,
}

/// 타입 니블 -> 세그먼트 타입 (5, 6, 10, 11은 미정의)
const TYPE_TABLE: [Option<SegmentType>; 16] = [
    Some(SegmentType::RedData),
    Some(SegmentType::RedCheckpoint),
    Some(SegmentType::RedCheckpointEorp),
    Some(SegmentType::RedCheckpointEorpEob),
    Some(SegmentType::GreenData),
    None,
    None,
    Some(SegmentType::GreenEob),
    Some(SegmentType::Report),
    Some(SegmentType::ReportAck),
    None,
    None,
    Some(SegmentType::CancelFromSender),
    Some(SegmentType::CancelAckToSender),
    Some(SegmentType::CancelFromReceiver),
    Some(SegmentType::CancelAckToReceiver),
];

impl TryFrom<u8> for SegmentType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        TYPE_TABLE
            .get(value as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidSegmentType(value))
    }
}

/// 데이터 세그먼트 종류 (색상 + 체크포인트/EORP/EOB 조합)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// 레드, 체크포인트 아님
    Red,
    /// 레드 체크포인트, 레드 파트 끝 아님
    RedCheckpoint,
    /// 레드 파트의 끝 (블록 끝 아님)
    RedCheckpointEorp,
    /// 레드 파트 끝이자 블록 끝
    RedCheckpointEorpEob,
    /// 그린, 블록 끝 아님
    Green,
    /// 그린 블록 끝
    GreenEob,
}

impl DataKind {
    pub fn is_red(self) -> bool {
        !self.is_green()
    }

    pub fn is_green(self) -> bool {
        matches!(self, DataKind::Green | DataKind::GreenEob)
    }

    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            DataKind::RedCheckpoint | DataKind::RedCheckpointEorp | DataKind::RedCheckpointEorpEob
        )
    }

    pub fn is_eorp(self) -> bool {
        matches!(
            self,
            DataKind::RedCheckpointEorp | DataKind::RedCheckpointEorpEob
        )
    }

    pub fn is_eob(self) -> bool {
        matches!(self, DataKind::RedCheckpointEorpEob | DataKind::GreenEob)
    }

    pub fn segment_type(self) -> SegmentType {
        match self {
            DataKind::Red => SegmentType::RedData,
            DataKind::RedCheckpoint => SegmentType::RedCheckpoint,
            DataKind::RedCheckpointEorp => SegmentType::RedCheckpointEorp,
            DataKind::RedCheckpointEorpEob => SegmentType::RedCheckpointEorpEob,
            DataKind::Green => SegmentType::GreenData,
            DataKind::GreenEob => SegmentType::GreenEob,
        }
    }

    fn from_segment_type(t: SegmentType) -> Option<Self> {
        match t {
            SegmentType::RedData => Some(DataKind::Red),
            SegmentType::RedCheckpoint => Some(DataKind::RedCheckpoint),
            SegmentType::RedCheckpointEorp => Some(DataKind::RedCheckpointEorp),
            SegmentType::RedCheckpointEorpEob => Some(DataKind::RedCheckpointEorpEob),
            SegmentType::GreenData => Some(DataKind::Green),
            SegmentType::GreenEob => Some(DataKind::GreenEob),
            _ => None,
        }
    }
}

/// 취소 사유 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// USR_CNCLD: 사용자 요청
    UserCancelled,
    /// UNREACH: 수신 서비스 도달 불가
    Unreachable,
    /// RLEXC: 재전송 한도 초과
    RetransLimitExceeded,
    /// MISCOLORED: 레드/그린 순서 위반
    Miscolored,
    /// SYS_CNCLD: 시스템 오류
    SystemCancelled,
    /// RXMTCYCEXC: 재전송 사이클 한도 초과
    RetransCyclesExceeded,
    /// 예약된 코드 (그대로 보존)
    Reserved(u8),
}

impl CancelReason {
    pub fn code(self) -> u8 {
        match self {
            CancelReason::UserCancelled => 0,
            CancelReason::Unreachable => 1,
            CancelReason::RetransLimitExceeded => 2,
            CancelReason::Miscolored => 3,
            CancelReason::SystemCancelled => 4,
            CancelReason::RetransCyclesExceeded => 5,
            CancelReason::Reserved(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CancelReason::UserCancelled,
            1 => CancelReason::Unreachable,
            2 => CancelReason::RetransLimitExceeded,
            3 => CancelReason::Miscolored,
            4 => CancelReason::SystemCancelled,
            5 => CancelReason::RetransCyclesExceeded,
            other => CancelReason::Reserved(other),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserCancelled => f.write_str("USR_CNCLD"),
            CancelReason::Unreachable => f.write_str("UNREACH"),
            CancelReason::RetransLimitExceeded => f.write_str("RLEXC"),
            CancelReason::Miscolored => f.write_str("MISCOLORED"),
            CancelReason::SystemCancelled => f.write_str("SYS_CNCLD"),
            CancelReason::RetransCyclesExceeded => f.write_str("RXMTCYCEXC"),
            CancelReason::Reserved(code) => write!(f, "RESERVED({})", code),
        }
    }
}

/// 헤더/트레일러 확장 필드 (엔진은 내용을 해석하지 않음)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub tag: u8,
    pub value: Bytes,
}

impl Extension {
    pub fn new(tag: u8, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + sdnv::encoded_len(self.value.len() as u64) + self.value.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        sdnv::put_u64(buf, self.value.len() as u64);
        buf.put_slice(&self.value);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let tag = buf.get_u8();
        let len = sdnv::get_u64(buf)?;
        take(buf, len).map(|value| Self { tag, value })
    }
}

/// 데이터 세그먼트 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub kind: DataKind,

    /// 수신측 클라이언트 서비스 ID
    pub service_id: ServiceId,

    /// 블록 내 오프셋
    pub offset: u64,

    /// 체크포인트 시리얼 (체크포인트가 아니면 0)
    pub checkpoint_serial: CheckpointSerial,

    /// 이 체크포인트를 유발한 리포트 시리얼 (0이 아니면 재전송분)
    pub report_serial: ReportSerial,

    /// 클라이언트 데이터
    pub data: Bytes,
}

impl DataSegment {
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    /// 블록 내 끝 오프셋 (exclusive)
    pub fn end(&self) -> u64 {
        self.offset + self.length()
    }

    /// 리포트에 대한 응답으로 재전송된 체크포인트인지
    pub fn is_resend(&self) -> bool {
        self.kind.is_checkpoint() && !self.report_serial.is_zero()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.service_id.encode(buf);
        sdnv::put_u64(buf, self.offset);
        sdnv::put_u64(buf, self.length());
        if self.kind.is_checkpoint() {
            sdnv::put_u64(buf, self.checkpoint_serial.0 as u64);
            sdnv::put_u64(buf, self.report_serial.0 as u64);
        }
        buf.put_slice(&self.data);
    }

    fn decode(kind: DataKind, buf: &mut Bytes) -> Result<Self> {
        let service_id = ServiceId::decode(buf)?;
        let offset = sdnv::get_u64(buf)?;
        let length = sdnv::get_u64(buf)?;
        let (checkpoint_serial, report_serial) = if kind.is_checkpoint() {
            (
                CheckpointSerial(sdnv::get_u32(buf)?),
                ReportSerial(sdnv::get_u32(buf)?),
            )
        } else {
            (CheckpointSerial(0), ReportSerial(0))
        };
        let data = take(buf, length)?;
        Ok(Self {
            kind,
            service_id,
            offset,
            checkpoint_serial,
            report_serial,
            data,
        })
    }
}

/// 타입별 세그먼트 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBody {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck(ReportSerial),
    CancelFromSender(CancelReason),
    CancelAckToSender,
    CancelFromReceiver(CancelReason),
    CancelAckToReceiver,
}

/// LTP 세그먼트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub session_id: SessionId,
    pub header_extensions: Vec<Extension>,
    pub trailer_extensions: Vec<Extension>,
    pub body: SegmentBody,
}

impl Segment {
    /// 확장 필드 없는 세그먼트 생성
    pub fn new(session_id: SessionId, body: SegmentBody) -> Self {
        Self {
            session_id,
            header_extensions: Vec::new(),
            trailer_extensions: Vec::new(),
            body,
        }
    }

    pub fn segment_type(&self) -> SegmentType {
        match &self.body {
            SegmentBody::Data(ds) => ds.kind.segment_type(),
            SegmentBody::Report(_) => SegmentType::Report,
            SegmentBody::ReportAck(_) => SegmentType::ReportAck,
            SegmentBody::CancelFromSender(_) => SegmentType::CancelFromSender,
            SegmentBody::CancelAckToSender => SegmentType::CancelAckToSender,
            SegmentBody::CancelFromReceiver(_) => SegmentType::CancelFromReceiver,
            SegmentBody::CancelAckToReceiver => SegmentType::CancelAckToReceiver,
        }
    }

    /// 송신 엔진이 처리할 세그먼트인지 (수신측이 보낸 세그먼트)
    pub fn is_for_sender(&self) -> bool {
        matches!(
            self.body,
            SegmentBody::Report(_)
                | SegmentBody::CancelFromReceiver(_)
                | SegmentBody::CancelAckToSender
        )
    }

    /// 와이어 인코딩
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let hext = self.header_extensions.len();
        let text = self.trailer_extensions.len();
        if hext > MAX_EXTENSIONS || text > MAX_EXTENSIONS {
            return Err(Error::TooManyExtensions {
                count: hext.max(text),
            });
        }

        buf.put_u8((LTP_VERSION << 4) | self.segment_type() as u8);
        self.session_id.encode(buf);
        buf.put_u8(((hext as u8) << 4) | text as u8);
        for ext in &self.header_extensions {
            ext.encode(buf);
        }

        match &self.body {
            SegmentBody::Data(ds) => ds.encode(buf),
            SegmentBody::Report(rs) => rs.encode(buf),
            SegmentBody::ReportAck(serial) => sdnv::put_u64(buf, serial.0 as u64),
            SegmentBody::CancelFromSender(reason) | SegmentBody::CancelFromReceiver(reason) => {
                buf.put_u8(reason.code())
            }
            SegmentBody::CancelAckToSender | SegmentBody::CancelAckToReceiver => {}
        }

        for ext in &self.trailer_extensions {
            ext.encode(buf);
        }
        Ok(())
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.estimated_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// 와이어 디코딩
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let first = buf.get_u8();
        let version = first >> 4;
        if version != LTP_VERSION {
            return Err(Error::InvalidVersion {
                expected: LTP_VERSION,
                got: version,
            });
        }
        let segment_type = SegmentType::try_from(first & 0x0f)?;
        let session_id = SessionId::decode(&mut buf)?;

        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let counts = buf.get_u8();
        let hext = (counts >> 4) as usize;
        let text = (counts & 0x0f) as usize;

        let mut header_extensions = Vec::with_capacity(hext);
        for _ in 0..hext {
            header_extensions.push(Extension::decode(&mut buf)?);
        }

        let body = match segment_type {
            SegmentType::Report => SegmentBody::Report(ReportSegment::decode(&mut buf)?),
            SegmentType::ReportAck => SegmentBody::ReportAck(ReportSerial(sdnv::get_u32(&mut buf)?)),
            SegmentType::CancelFromSender => {
                SegmentBody::CancelFromSender(decode_reason(&mut buf)?)
            }
            SegmentType::CancelFromReceiver => {
                SegmentBody::CancelFromReceiver(decode_reason(&mut buf)?)
            }
            SegmentType::CancelAckToSender => SegmentBody::CancelAckToSender,
            SegmentType::CancelAckToReceiver => SegmentBody::CancelAckToReceiver,
            data_type => {
                let kind = DataKind::from_segment_type(data_type)
                    .ok_or(Error::InvalidSegmentType(data_type as u8))?;
                SegmentBody::Data(DataSegment::decode(kind, &mut buf)?)
            }
        };

        let mut trailer_extensions = Vec::with_capacity(text);
        for _ in 0..text {
            trailer_extensions.push(Extension::decode(&mut buf)?);
        }

        Ok(Self {
            session_id,
            header_extensions,
            trailer_extensions,
            body,
        })
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(Bytes::copy_from_slice(bytes))
    }

    /// 본문 디코딩에 실패한 리포트의 세션과 타입만 읽기
    pub fn peek_session(bytes: &[u8]) -> Option<(SegmentType, SessionId)> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.get_u8();
        if first >> 4 != LTP_VERSION {
            return None;
        }
        let segment_type = SegmentType::try_from(first & 0x0f).ok()?;
        let session_id = SessionId::decode(&mut buf).ok()?;
        Some((segment_type, session_id))
    }

    /// 버퍼 용량 예약용 대략적 길이
    fn estimated_len(&self) -> usize {
        let ext: usize = self
            .header_extensions
            .iter()
            .chain(self.trailer_extensions.iter())
            .map(Extension::encoded_len)
            .sum();
        let body = match &self.body {
            SegmentBody::Data(ds) => ds.data.len() + 48,
            SegmentBody::Report(rs) => rs.claims.len() * 20 + 48,
            _ => 8,
        };
        2 + self.session_id.encoded_len() + ext + body
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            SegmentBody::Data(ds) => write!(
                f,
                "DS[{} {:?} {}+{}]",
                self.session_id,
                ds.kind,
                ds.offset,
                ds.data.len()
            ),
            SegmentBody::Report(rs) => write!(
                f,
                "RS[{} {} {} {}..{} claims={}]",
                self.session_id,
                rs.report_serial,
                rs.checkpoint_serial,
                rs.lower_bound,
                rs.upper_bound,
                rs.claims.len()
            ),
            SegmentBody::ReportAck(serial) => write!(f, "RA[{} {}]", self.session_id, serial),
            SegmentBody::CancelFromSender(reason) => {
                write!(f, "CS[{} {}]", self.session_id, reason)
            }
            SegmentBody::CancelAckToSender => write!(f, "CAS[{}]", self.session_id),
            SegmentBody::CancelFromReceiver(reason) => {
                write!(f, "CR[{} {}]", self.session_id, reason)
            }
            SegmentBody::CancelAckToReceiver => write!(f, "CAR[{}]", self.session_id),
        }
    }
}

/// 데이터 세그먼트 헤더 길이 상한 추정
///
/// 세션 번호, 오프셋, 길이, 시리얼 모두 최대 폭으로 가정한다. 실제 헤더는 항상 이 값 이하.
pub fn estimate_data_header_len(
    session_id: &SessionId,
    service_id: &ServiceId,
    header_extensions: &[Extension],
    trailer_extensions: &[Extension],
) -> usize {
    let ext: usize = header_extensions
        .iter()
        .chain(trailer_extensions.iter())
        .map(Extension::encoded_len)
        .sum();
    1 + session_id.originator.encoded_len()
        + sdnv::encoded_len(u32::MAX as u64)
        + 1
        + ext
        + service_id.encoded_len()
        + sdnv::encoded_len(u64::MAX)
        + sdnv::encoded_len(u64::MAX)
        + 2 * sdnv::encoded_len(u32::MAX as u64)
}

fn decode_reason(buf: &mut Bytes) -> Result<CancelReason> {
    if !buf.has_remaining() {
        return Err(Error::Truncated {
            needed: 1,
            remaining: 0,
        });
    }
    Ok(CancelReason::from_code(buf.get_u8()))
}

/// 길이 검사 후 앞쪽 `len` 바이트를 잘라냄
pub(crate) fn take(buf: &mut Bytes, len: u64) -> Result<Bytes> {
    if len > buf.remaining() as u64 {
        return Err(Error::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(len as usize))
}
