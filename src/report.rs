//! 수신 리포트 (Reception Report)
//!
//! - 수신측 레드 세그먼트 목록에서 클레임 생성 (연속 구간 병합)
//! - 링크 MTU에 맞춰 여러 리포트로 분할
//! - 송신측에서 covers / is_resend_required 판정

use bytes::{Buf, Bytes, BytesMut};

use crate::ids::{CheckpointSerial, ReportSerial, SerialCounter};
use crate::{sdnv, Error, Result};

/// 수신 클레임: 리포트 하한 기준 상대 오프셋과 길이
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

impl ReceptionClaim {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 리포트 세그먼트 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub report_serial: ReportSerial,

    /// 이 리포트를 유발한 체크포인트 (비동기 리포트면 0)
    pub checkpoint_serial: CheckpointSerial,

    /// 리포트 범위 상한 (exclusive)
    pub upper_bound: u64,

    /// 리포트 범위 하한
    pub lower_bound: u64,

    /// 오프셋 순으로 정렬된 겹치지 않는 클레임
    pub claims: Vec<ReceptionClaim>,
}

impl ReportSegment {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        sdnv::put_u64(buf, self.report_serial.0 as u64);
        sdnv::put_u64(buf, self.checkpoint_serial.0 as u64);
        sdnv::put_u64(buf, self.upper_bound);
        sdnv::put_u64(buf, self.lower_bound);
        sdnv::put_u64(buf, self.claims.len() as u64);
        for claim in &self.claims {
            sdnv::put_u64(buf, claim.offset);
            sdnv::put_u64(buf, claim.length);
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        let report_serial = ReportSerial(sdnv::get_u32(buf)?);
        let checkpoint_serial = CheckpointSerial(sdnv::get_u32(buf)?);
        let upper_bound = sdnv::get_u64(buf)?;
        let lower_bound = sdnv::get_u64(buf)?;
        let claim_count = sdnv::get_u64(buf)?;

        if lower_bound > upper_bound {
            return Err(Error::InvalidReport(format!(
                "lower bound {} > upper bound {}",
                lower_bound, upper_bound
            )));
        }

        // 클레임 하나는 최소 2바이트
        let capacity = (claim_count as usize).min(buf.remaining() / 2);
        let mut claims: Vec<ReceptionClaim> = Vec::with_capacity(capacity);
        for _ in 0..claim_count {
            let claim = ReceptionClaim::new(sdnv::get_u64(buf)?, sdnv::get_u64(buf)?);
            let span = upper_bound - lower_bound;
            if claim.length < 1 || claim.length > span {
                return Err(Error::InvalidReport(format!(
                    "claim length {} outside 1..={}",
                    claim.length, span
                )));
            }
            if let Some(prev) = claims.last() {
                if claim.offset < prev.end() {
                    return Err(Error::InvalidReport(format!(
                        "claim offset {} overlaps previous claim ending at {}",
                        claim.offset,
                        prev.end()
                    )));
                }
            }
            let end = claim
                .offset
                .checked_add(claim.length)
                .and_then(|end| end.checked_add(lower_bound))
                .filter(|&end| end <= upper_bound);
            if end.is_none() {
                return Err(Error::InvalidReport(format!(
                    "claim {}+{} exceeds upper bound {}",
                    claim.offset, claim.length, upper_bound
                )));
            }
            claims.push(claim);
        }

        Ok(Self {
            report_serial,
            checkpoint_serial,
            upper_bound,
            lower_bound,
            claims,
        })
    }

    /// 클레임 하나가 `[offset, offset+length)`를 완전히 포함하는지
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        let end = offset + length;
        if offset < self.lower_bound || end > self.upper_bound {
            return false;
        }
        self.claims.iter().any(|claim| {
            let claim_start = self.lower_bound + claim.offset;
            let claim_end = claim_start + claim.length;
            offset >= claim_start && end <= claim_end
        })
    }

    /// 리포트 범위 안에 있는데 아직 확인되지 않은 레드 세그먼트인지
    pub fn is_resend_required(&self, offset: u64, length: u64, red: bool, acked: bool) -> bool {
        red && !acked && offset >= self.lower_bound && offset + length <= self.upper_bound
    }

    /// 클레임이 주장하는 총 바이트 수
    pub fn claimed_bytes(&self) -> u64 {
        self.claims.iter().map(|c| c.length).sum()
    }

    /// 수신 리포트 생성
    ///
    /// `ranges`는 수신한 레드 세그먼트의 `(offset, length)`를 오프셋 순으로 준다.
    /// 하한 0, 상한 `upper_bound`로 하나의 논리 리포트를 만들고 클레임 수가
    /// `max_claims`를 넘으면 여러 리포트로 나눈다. 리포트마다 새 시리얼을 받는다.
    pub fn generate<I>(
        ranges: I,
        upper_bound: u64,
        checkpoint_serial: CheckpointSerial,
        serials: &mut SerialCounter,
        max_claims: usize,
    ) -> Result<Vec<ReportSegment>>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let lower_bound = 0;
        let mut claims: Vec<ReceptionClaim> = Vec::new();

        for (offset, length) in ranges {
            if length == 0 {
                continue;
            }
            let end = offset + length;
            if end > upper_bound {
                break;
            }
            match claims.last_mut() {
                Some(last) if offset <= last.end() => {
                    if end > last.end() {
                        last.length = end - last.offset;
                    }
                }
                _ => claims.push(ReceptionClaim::new(offset - lower_bound, length)),
            }
        }

        if claims.is_empty() {
            return Err(Error::NoClaims);
        }

        let report = ReportSegment {
            report_serial: ReportSerial(0),
            checkpoint_serial,
            upper_bound,
            lower_bound,
            claims,
        };
        Ok(report.fragment(max_claims, serials))
    }

    /// 클레임 수 기준 분할. 분할 없으면 자신 하나.
    pub fn fragment(self, max_claims: usize, serials: &mut SerialCounter) -> Vec<ReportSegment> {
        let max_claims = max_claims.max(1);
        if self.claims.len() <= max_claims {
            return vec![ReportSegment {
                report_serial: ReportSerial(serials.next_serial()),
                ..self
            }];
        }

        // 조각들의 범위는 빈틈 없이 이어져 원래 [lower, upper)를 덮는다.
        let chunks: Vec<&[ReceptionClaim]> = self.claims.chunks(max_claims).collect();
        let count = chunks.len();
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let lower_bound = if i == 0 {
                    self.lower_bound
                } else {
                    self.lower_bound + chunk[0].offset
                };
                let upper_bound = if i + 1 == count {
                    self.upper_bound
                } else {
                    self.lower_bound + chunks[i + 1][0].offset
                };
                let base = lower_bound - self.lower_bound;
                let claims = chunk
                    .iter()
                    .map(|c| ReceptionClaim::new(c.offset - base, c.length))
                    .collect();
                ReportSegment {
                    report_serial: ReportSerial(serials.next_serial()),
                    checkpoint_serial: self.checkpoint_serial,
                    upper_bound,
                    lower_bound,
                    claims,
                }
            })
            .collect()
    }

    /// 바이트 길이 (시리얼/경계 포함)
    pub fn encoded_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.len()
    }
}

/// MTU 안에 들어가는 리포트당 최대 클레임 수
///
/// 클레임 하나를 (오프셋, 길이) 최대 폭으로 잡고 헤더 여유분을 뺀다.
pub fn max_claims_for_mtu(mtu: usize, header_overhead: usize) -> usize {
    let per_claim = 2 * sdnv::MAX_U64_LEN;
    let fixed = header_overhead + 2 * 5 + 3 * sdnv::MAX_U64_LEN;
    (mtu.saturating_sub(fixed) / per_claim).max(1)
}
