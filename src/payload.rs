//! 페이로드 저장소
//!
//! 작은 데이터는 메모리(`Bytes`), 설정 임계값보다 크면 블롭 파일로 보관한다.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{Error, Result};

/// 블록/세그먼트 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// 메모리 버퍼
    Memory(Bytes),

    /// 파일의 일부 구간
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl Payload {
    /// 파일 전체를 가리키는 페이로드
    pub fn file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let length = fs::metadata(&path)?.len();
        Ok(Payload::File {
            path,
            offset: 0,
            length,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(bytes) => bytes.len() as u64,
            Payload::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Payload::File { .. })
    }

    /// 페이로드 내 `[offset, offset+len)` 읽기
    pub fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        if offset + len > self.len() {
            return Err(Error::Truncated {
                needed: offset + len,
                remaining: self.len() as usize,
            });
        }
        match self {
            Payload::Memory(bytes) => Ok(bytes.slice(offset as usize..(offset + len) as usize)),
            Payload::File {
                path,
                offset: base,
                ..
            } => read_file_range(path, base + offset, len as usize),
        }
    }

    /// 전체 내용을 메모리로 읽기
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.read_range(0, self.len())
    }
}

fn read_file_range(path: &Path, offset: u64, len: usize) -> Result<Bytes> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// 디렉터리 기반 블롭 저장소
///
/// 수신 중 큰 세그먼트와 완성된 큰 블록을 파일로 보관한다.
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
    next_id: AtomicU64,
}

impl BlobStore {
    /// 저장소 디렉터리 생성 (없으면 만듦)
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 새 빈 블롭 파일 할당
    pub fn create(&self) -> Result<PathBuf> {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let path = self
                .dir
                .join(format!("ltp-{}-{}.blob", std::process::id(), id));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("블롭 생성: {:?}", path);
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 지정 오프셋에 쓰기
    pub fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        if !path.exists() {
            return Err(Error::BlobNotFound(path.display().to_string()));
        }
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// 지정 구간 읽기
    pub fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes> {
        if !path.exists() {
            return Err(Error::BlobNotFound(path.display().to_string()));
        }
        read_file_range(path, offset, len)
    }

    /// 블롭 삭제 (없으면 무시)
    pub fn delete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("블롭 삭제 실패 {:?}: {}", path, e);
            }
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// 데이터를 새 블롭에 저장하고 파일 페이로드로 반환
    pub fn store(&self, data: &[u8]) -> Result<Payload> {
        let path = self.create()?;
        self.write_at(&path, 0, data)?;
        Ok(Payload::File {
            path,
            offset: 0,
            length: data.len() as u64,
        })
    }

    /// 블롭 소유 페이로드 해제 (메모리 페이로드는 아무 일도 안 함)
    pub fn release(&self, payload: &Payload) {
        if let Payload::File { path, .. } = payload {
            if path.starts_with(&self.dir) {
                self.delete(path);
            }
        }
    }
}
