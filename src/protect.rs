//! 加密边界
//!
//! 传输层自己不做加密，每个发出的 RTP 包和 FEC 包都交给注入的
//! [`ProtectSession`]（通常是 SRTP 上下文）。本模块管理配置该会话的密钥材料。
//!
//! # 密钥材料
//! 128 位主密钥加 112 位主盐，随机生成或由口令派生:
//! `PBKDF2-HMAC-SHA256(passphrase, kdf_salt)` 得到 30 字节，
//! 按 `[key (16)][salt (14)]` 切分。

use std::fmt;
use std::num::NonZeroU32;

use ring::pbkdf2;
use thiserror::Error;

use crate::error::{Result, RttError};
use crate::keys;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
pub const MIN_KDF_SALT_LEN: usize = 16;
const KEY_MATERIAL_LEN: usize = MASTER_KEY_LEN + MASTER_SALT_LEN;
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("session initialisation failed: {0}")]
    Init(String),

    #[error("protect failed: {0}")]
    Protect(String),
}

/// 已配置好的包保护上下文
pub trait ProtectSession {
    fn protect(&mut self, packet: &[u8]) -> std::result::Result<Vec<u8>, ProtectError>;
}

impl<F> ProtectSession for F
where
    F: FnMut(&[u8]) -> std::result::Result<Vec<u8>, ProtectError>,
{
    fn protect(&mut self, packet: &[u8]) -> std::result::Result<Vec<u8>, ProtectError> {
        self(packet)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; MASTER_KEY_LEN],
    pub salt: [u8; MASTER_SALT_LEN],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// 随机生成密钥和盐
    pub fn generate() -> Result<Self> {
        let mut block = [0u8; KEY_MATERIAL_LEN];
        keys::fill_random(&mut block)?;
        Ok(Self::split(&block))
    }

    /// 从原始字节构建，长度不符时拒绝
    pub fn from_slices(key: &[u8], salt: &[u8]) -> Result<Self> {
        let key: [u8; MASTER_KEY_LEN] = key.try_into().map_err(|_| {
            RttError::invalid_config(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_LEN,
                key.len()
            ))
        })?;
        let salt: [u8; MASTER_SALT_LEN] = salt.try_into().map_err(|_| {
            RttError::invalid_config(format!(
                "master salt must be {} bytes, got {}",
                MASTER_SALT_LEN,
                salt.len()
            ))
        })?;
        Ok(Self { key, salt })
    }

    /// 由口令派生。`kdf_salt` 至少 16 字节，可用 [`new_kdf_salt`] 生成，
    /// 需与对端共享。
    pub fn from_passphrase(passphrase: &str, kdf_salt: &[u8]) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(RttError::invalid_config("passphrase must not be empty"));
        }
        if kdf_salt.len() < MIN_KDF_SALT_LEN {
            return Err(RttError::invalid_config(format!(
                "KDF salt must be at least {} bytes, got {}",
                MIN_KDF_SALT_LEN,
                kdf_salt.len()
            )));
        }

        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| RttError::invalid_config("PBKDF2 iteration count is zero"))?;
        let mut block = [0u8; KEY_MATERIAL_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            kdf_salt,
            passphrase.as_bytes(),
            &mut block,
        );
        Ok(Self::split(&block))
    }

    fn split(block: &[u8; KEY_MATERIAL_LEN]) -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        let mut salt = [0u8; MASTER_SALT_LEN];
        key.copy_from_slice(&block[..MASTER_KEY_LEN]);
        salt.copy_from_slice(&block[MASTER_KEY_LEN..]);
        Self { key, salt }
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn salt_hex(&self) -> String {
        hex::encode(self.salt)
    }
}

/// [`KeyMaterial::from_passphrase`] 使用的随机盐
pub fn new_kdf_salt() -> Result<[u8; MIN_KDF_SALT_LEN]> {
    let mut salt = [0u8; MIN_KDF_SALT_LEN];
    keys::fill_random(&mut salt)?;
    Ok(salt)
}

/// 由密钥材料构建保护会话
pub type SessionFactory =
    dyn Fn(&KeyMaterial) -> std::result::Result<Box<dyn ProtectSession>, ProtectError>;

/// 用 `material` 调用 `factory`，初始化失败映射为 [`RttError::Encryption`]
pub fn open_session(material: &KeyMaterial, factory: &SessionFactory) -> Result<Box<dyn ProtectSession>> {
    Ok(factory(material)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_passphrase_is_deterministic() {
        let salt = [7u8; 16];
        let a = KeyMaterial::from_passphrase("correct horse", &salt).unwrap();
        let b = KeyMaterial::from_passphrase("correct horse", &salt).unwrap();
        let c = KeyMaterial::from_passphrase("correct horse", &[8u8; 16]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.key_hex().len(), 32);
        assert_eq!(a.salt_hex().len(), 28);
    }

    #[test]
    fn test_short_kdf_salt_rejected() {
        let err = KeyMaterial::from_passphrase("pw", &[1u8; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_from_slices_lengths() {
        assert!(KeyMaterial::from_slices(&[0u8; 16], &[0u8; 14]).is_ok());
        let err = KeyMaterial::from_slices(&[0u8; 15], &[0u8; 14]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        let err = KeyMaterial::from_slices(&[0u8; 16], &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_generated_material_differs() {
        let a = KeyMaterial::generate().unwrap();
        let b = KeyMaterial::generate().unwrap();
        assert_ne!(a, b);
        assert!(!format!("{a:?}").contains(&a.key_hex()));
    }

    #[test]
    fn test_session_factory_errors_map_to_encryption() {
        let material = KeyMaterial::generate().unwrap();
        let factory: Box<SessionFactory> = Box::new(
            |_: &KeyMaterial| -> std::result::Result<Box<dyn ProtectSession>, ProtectError> {
                Err(ProtectError::Init("bad suite".into()))
            },
        );
        let err = open_session(&material, &*factory).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Encryption);

        let factory: Box<SessionFactory> = Box::new(|m: &KeyMaterial| {
            let key = m.key;
            let session = move |packet: &[u8]| -> std::result::Result<Vec<u8>, ProtectError> {
                Ok(packet.iter().zip(key.iter().cycle()).map(|(p, k)| p ^ k).collect())
            };
            Ok(Box::new(session) as Box<dyn ProtectSession>)
        });
        let mut session = open_session(&material, &*factory).unwrap();
        assert_eq!(session.protect(b"abc").unwrap().len(), 3);
    }
}
