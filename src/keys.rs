//! 基于系统安全随机源的标识符生成

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, RttError};

/// 用系统随机源填充 `buf`
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| RttError::Resource("system random source unavailable".into()))
}

pub fn random_u16() -> Result<u16> {
    let mut bytes = [0u8; 2];
    fill_random(&mut bytes)?;
    Ok(u16::from_be_bytes(bytes))
}

pub fn random_u32() -> Result<u32> {
    let mut bytes = [0u8; 4];
    fill_random(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

/// 为新流生成同步源标识（SSRC）
pub fn generate_ssrc() -> Result<u32> {
    random_u32()
}

/// 按注册顺序分配贡献源标识（CSRC）
///
/// 流被移除后，其标识也不会再次分配。
#[derive(Debug, Clone)]
pub struct CsrcAllocator {
    next: u32,
}

impl CsrcAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for CsrcAllocator {
    fn default() -> Self {
        Self::new()
    }
}
