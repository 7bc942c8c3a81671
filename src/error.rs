//! 传输各层共用的错误分类
//!
//! 包级错误（网络、加密、FEC）以事件上报，出错的那次发送被放弃。
//! 配置错误由引起它的调用同步返回。

use std::fmt;
use thiserror::Error;

/// 错误的粗分类，以事件上报时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Encryption,
    Fec,
    InvalidConfig,
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Encryption => "ENCRYPTION",
            ErrorKind::Fec => "FEC",
            ErrorKind::InvalidConfig => "INVALID_CONFIG",
            ErrorKind::Resource => "RESOURCE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RttError {
    #[error("sink transmission failed: {0}")]
    Network(#[from] crate::sink::SinkError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] crate::protect::ProtectError),

    #[error("FEC group rejected: {0}")]
    Fec(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cleanup failed: {0}")]
    Resource(String),
}

impl RttError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RttError::Network(_) => ErrorKind::Network,
            RttError::Encryption(_) => ErrorKind::Encryption,
            RttError::Fec(_) => ErrorKind::Fec,
            RttError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            RttError::Resource(_) => ErrorKind::Resource,
        }
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        RttError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = RttError::invalid_config("duplicate stream id");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(err.kind().to_string(), "INVALID_CONFIG");

        let err = RttError::Fec("empty group".into());
        assert_eq!(err.kind(), ErrorKind::Fec);
        assert!(err.to_string().contains("empty group"));
    }
}
