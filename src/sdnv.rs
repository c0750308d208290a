//! SDNV (Self-Delimiting Numeric Value) 인코딩
//!
//! 바이트마다 하위 7비트가 값, 최상위 비트가 "다음 바이트 있음" 플래그.
//! 빅엔디언 순서로 기록한다.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// u64 SDNV 최대 인코딩 길이
pub const MAX_U64_LEN: usize = 10;

/// 바이트열 SDNV 최대 인코딩 길이 (엔진/서비스 ID 용)
pub const MAX_BYTES_LEN: usize = 64;

const CONTINUATION: u8 = 0x80;
const VALUE_MASK: u8 = 0x7f;

/// 인코딩 길이 계산
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// u64 값 인코딩
pub fn put_u64(buf: &mut impl BufMut, value: u64) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (i * 7)) as u8) & VALUE_MASK;
        if i > 0 {
            buf.put_u8(group | CONTINUATION);
        } else {
            buf.put_u8(group);
        }
    }
}

/// u64 값 디코딩
pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(Error::SdnvTruncated);
        }
        let byte = buf.get_u8();
        if value > (u64::MAX >> 7) {
            return Err(Error::SdnvOverflow { max_bits: 64 });
        }
        value = (value << 7) | (byte & VALUE_MASK) as u64;
        if byte & CONTINUATION == 0 {
            return Ok(value);
        }
    }
}

/// u32 값 디코딩 (시리얼 번호 등)
pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    let value = get_u64(buf)?;
    u32::try_from(value).map_err(|_| Error::SdnvOverflow { max_bits: 32 })
}

/// 빅엔디언 정수 바이트열을 SDNV로 인코딩
///
/// 앞쪽의 0 그룹은 생략되므로 `[0, 0, 1]`과 `[1]`은 같은 인코딩이 된다.
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    let mut groups: Vec<u8> = Vec::with_capacity(bytes.len() * 8 / 7 + 1);
    let mut acc: u32 = 0;
    let mut nbits = 0;

    for &b in bytes.iter().rev() {
        acc |= (b as u32) << nbits;
        nbits += 8;
        while nbits >= 7 {
            groups.push((acc as u8) & VALUE_MASK);
            acc >>= 7;
            nbits -= 7;
        }
    }
    if nbits > 0 {
        groups.push((acc as u8) & VALUE_MASK);
    }

    while groups.len() > 1 && groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        groups.push(0);
    }

    for (i, group) in groups.iter().enumerate().rev() {
        if i > 0 {
            buf.put_u8(group | CONTINUATION);
        } else {
            buf.put_u8(*group);
        }
    }
}

/// SDNV를 최소 길이 빅엔디언 바이트열로 디코딩 (최소 1바이트)
pub fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let mut groups: Vec<u8> = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(Error::SdnvTruncated);
        }
        if groups.len() >= MAX_BYTES_LEN {
            return Err(Error::SdnvOverflow {
                max_bits: (MAX_BYTES_LEN * 7) as u32,
            });
        }
        let byte = buf.get_u8();
        groups.push(byte & VALUE_MASK);
        if byte & CONTINUATION == 0 {
            break;
        }
    }

    let mut out: Vec<u8> = Vec::with_capacity(groups.len());
    let mut acc: u32 = 0;
    let mut nbits = 0;
    for &group in groups.iter().rev() {
        acc |= (group as u32) << nbits;
        nbits += 7;
        if nbits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            nbits -= 8;
        }
    }
    if acc != 0 {
        out.push(acc as u8);
    }

    while out.len() > 1 && out.last() == Some(&0) {
        out.pop();
    }
    if out.is_empty() {
        out.push(0);
    }
    out.reverse();
    Ok(out)
}

/// 바이트열의 SDNV 인코딩 길이
pub fn bytes_encoded_len(bytes: &[u8]) -> usize {
    let mut tmp = Vec::with_capacity(bytes.len() + 2);
    put_bytes(&mut tmp, bytes);
    tmp.len()
}
