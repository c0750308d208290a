//! 식별자 타입
//!
//! - EngineId: LTP 노드 식별자 (SDNV 바이트열)
//! - SessionId: (발신 엔진, 세션 번호)
//! - ServiceId: 상위 계층 클라이언트 식별자
//! - CheckpointSerial / ReportSerial: 세션 범위 32비트 시리얼

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{sdnv, Error, Result};

/// 앞쪽 0 바이트를 제외한 유효 바이트 (최소 1바이트)
fn significant(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0);
    match first {
        Some(i) => &bytes[i..],
        None if bytes.is_empty() => bytes,
        None => &bytes[bytes.len() - 1..],
    }
}

fn parse_dotted(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() {
        return Err(Error::InvalidEngineId(s.to_string()));
    }
    s.split('.')
        .map(|word| {
            word.parse::<u8>()
                .map_err(|_| Error::InvalidEngineId(s.to_string()))
        })
        .collect()
}

fn write_dotted(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            f.write_str(".")?;
        }
        write!(f, "{}", b)?;
    }
    Ok(())
}

/// 엔진 ID
///
/// 문자열 형식은 바이트별 10진수를 점으로 구분 (`"0.0.0.1"`).
/// 비교는 SDNV로 디코딩한 수치 기준이므로 앞쪽 0 바이트는 무시된다.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct EngineId(Vec<u8>);

/// 빈 바이트열은 0으로 정규화
fn non_empty(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.is_empty() {
        vec![0]
    } else {
        bytes
    }
}

impl EngineId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(non_empty(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        sdnv::put_bytes(buf, &self.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self(sdnv::get_bytes(buf)?))
    }

    pub fn encoded_len(&self) -> usize {
        sdnv::bytes_encoded_len(&self.0)
    }
}

impl Default for EngineId {
    fn default() -> Self {
        Self(vec![0, 0, 0, 1])
    }
}

impl From<u64> for EngineId {
    fn from(value: u64) -> Self {
        Self(significant(&value.to_be_bytes()).to_vec())
    }
}

impl FromStr for EngineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(parse_dotted(s)?))
    }
}

impl PartialEq for EngineId {
    fn eq(&self, other: &Self) -> bool {
        significant(&self.0) == significant(&other.0)
    }
}

impl Hash for EngineId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        significant(&self.0).hash(state);
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dotted(f, &self.0)
    }
}

/// 서비스 ID (블록을 전달받을 상위 계층 클라이언트)
#[derive(Debug, Clone, Eq)]
pub struct ServiceId(Vec<u8>);

impl ServiceId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(non_empty(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 기본 소비자로 전달되는 서비스 ID
    pub fn is_default(&self) -> bool {
        significant(&self.0) == [0]
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        sdnv::put_bytes(buf, &self.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self(sdnv::get_bytes(buf)?))
    }

    pub fn encoded_len(&self) -> usize {
        sdnv::bytes_encoded_len(&self.0)
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self(vec![0])
    }
}

impl From<u64> for ServiceId {
    fn from(value: u64) -> Self {
        Self(significant(&value.to_be_bytes()).to_vec())
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(parse_dotted(s)?))
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        significant(&self.0) == significant(&other.0)
    }
}

impl Hash for ServiceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        significant(&self.0).hash(state);
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dotted(f, &self.0)
    }
}

/// 세션 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// 세션을 시작한 (블록을 보낸) 엔진
    pub originator: EngineId,

    /// 발신 엔진이 무작위로 고른 세션 번호
    pub number: u64,
}

impl SessionId {
    pub fn new(originator: EngineId, number: u64) -> Self {
        Self { originator, number }
    }

    /// 무작위 세션 번호로 새 세션 ID 생성
    pub fn generate(originator: EngineId) -> Self {
        let number = rand::thread_rng().gen_range(1..=i32::MAX as u64);
        Self { originator, number }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.originator.encode(buf);
        sdnv::put_u64(buf, self.number);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let originator = EngineId::decode(buf)?;
        let number = sdnv::get_u64(buf)?;
        Ok(Self { originator, number })
    }

    pub fn encoded_len(&self) -> usize {
        self.originator.encoded_len() + sdnv::encoded_len(self.number)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.originator, self.number)
    }
}

/// 체크포인트 시리얼 번호
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CheckpointSerial(pub u32);

/// 리포트 시리얼 번호 (0은 "없음")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReportSerial(pub u32);

impl CheckpointSerial {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl ReportSerial {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CheckpointSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CP#{}", self.0)
    }
}

impl fmt::Display for ReportSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS#{}", self.0)
    }
}

/// 세션 범위 시리얼 생성기
///
/// 무작위 값에서 시작해 1씩 증가한다. 0은 건너뛴다.
#[derive(Debug, Clone)]
pub struct SerialCounter {
    next: u32,
}

impl SerialCounter {
    /// 무작위 시작값
    pub fn random() -> Self {
        Self {
            next: rand::thread_rng().gen_range(1..=(i32::MAX as u32) / 2),
        }
    }

    /// 지정한 시작값 (테스트용)
    pub fn starting_at(first: u32) -> Self {
        Self { next: first.max(1) }
    }

    /// 현재 값을 반환하고 다음 값으로 진행
    pub fn next_serial(&mut self) -> u32 {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        current
    }

    /// 다음에 반환할 값 (진행하지 않음)
    pub fn peek(&self) -> u32 {
        self.next
    }
}
