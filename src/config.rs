//! 传输配置

use std::time::Duration;

use crate::error::{Result, RttError};
use crate::framing::STREAM_DELIMITER;

/// T.140 文本通常协商为此范围内的动态负载类型
pub const DEFAULT_PAYLOAD_TYPE: u8 = 98;
pub const DEFAULT_RED_PAYLOAD_TYPE: u8 = 99;
pub const DEFAULT_FEC_PAYLOAD_TYPE: u8 = 100;
pub const DEFAULT_FEC_GROUP_SIZE: usize = 5;
pub const DEFAULT_REDUNDANCY_LEVEL: usize = 2;
pub const DEFAULT_CHAR_RATE_LIMIT: u32 = 30;
pub const DEFAULT_TIMESTAMP_INCREMENT: u32 = 160;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// 保护掩码为 32 位
pub const MAX_FEC_GROUP_SIZE: usize = 32;
pub const MAX_CSRC_COUNT: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub payload_type: u8,
    /// `None` 时在打开传输时随机生成 SSRC
    pub ssrc: Option<u32>,
    pub initial_sequence_number: Option<u16>,
    pub initial_timestamp: Option<u32>,
    pub timestamp_increment: u32,

    pub fec_enabled: bool,
    pub fec_payload_type: u8,
    pub fec_group_size: usize,

    pub red_enabled: bool,
    pub red_payload_type: u8,
    pub redundancy_level: usize,

    /// 每秒字符数；0 表示收到即发送
    pub char_rate_limit: u32,
    pub tick_interval: Duration,
    pub process_backspaces: bool,

    pub multiplex_enabled: bool,
    /// 用 CSRC 列表而不是负载前缀标识流
    pub use_id_for_stream_id: bool,
    pub stream_identifier: Option<String>,
    pub id_list: Vec<u32>,

    pub handle_metadata: bool,
    pub metadata_payload_type: Option<u8>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: None,
            initial_sequence_number: None,
            initial_timestamp: None,
            timestamp_increment: DEFAULT_TIMESTAMP_INCREMENT,
            fec_enabled: false,
            fec_payload_type: DEFAULT_FEC_PAYLOAD_TYPE,
            fec_group_size: DEFAULT_FEC_GROUP_SIZE,
            red_enabled: false,
            red_payload_type: DEFAULT_RED_PAYLOAD_TYPE,
            redundancy_level: DEFAULT_REDUNDANCY_LEVEL,
            char_rate_limit: DEFAULT_CHAR_RATE_LIMIT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            process_backspaces: true,
            multiplex_enabled: false,
            use_id_for_stream_id: false,
            stream_identifier: None,
            id_list: Vec::new(),
            handle_metadata: false,
            metadata_payload_type: None,
        }
    }
}

impl TransportConfig {
    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    pub fn with_initial_sequence_number(mut self, seq: u16) -> Self {
        self.initial_sequence_number = Some(seq);
        self
    }

    pub fn with_initial_timestamp(mut self, timestamp: u32) -> Self {
        self.initial_timestamp = Some(timestamp);
        self
    }

    pub fn with_timestamp_increment(mut self, increment: u32) -> Self {
        self.timestamp_increment = increment;
        self
    }

    pub fn with_fec(mut self, group_size: usize) -> Self {
        self.fec_enabled = true;
        self.fec_group_size = group_size;
        self
    }

    pub fn with_red(mut self, redundancy_level: usize) -> Self {
        self.red_enabled = true;
        self.redundancy_level = redundancy_level;
        self
    }

    pub fn with_char_rate_limit(mut self, chars_per_sec: u32) -> Self {
        self.char_rate_limit = chars_per_sec;
        self
    }

    pub fn with_process_backspaces(mut self, enabled: bool) -> Self {
        self.process_backspaces = enabled;
        self
    }

    /// 每个包以 `stream_id` 作为负载前缀
    pub fn with_stream_prefix(mut self, stream_id: impl Into<String>) -> Self {
        self.multiplex_enabled = true;
        self.use_id_for_stream_id = false;
        self.stream_identifier = Some(stream_id.into());
        self
    }

    /// 每个包通过 CSRC 列表标识
    pub fn with_csrc_ids(mut self, ids: Vec<u32>) -> Self {
        self.multiplex_enabled = true;
        self.use_id_for_stream_id = true;
        self.id_list = ids;
        self
    }

    pub fn with_metadata(mut self, payload_type: Option<u8>) -> Self {
        self.handle_metadata = true;
        self.metadata_payload_type = payload_type;
        self
    }

    pub fn rate_limited(&self) -> bool {
        self.char_rate_limit > 0
    }

    pub fn validate(&self) -> Result<()> {
        check_payload_type("payload_type", self.payload_type)?;
        check_payload_type("fec_payload_type", self.fec_payload_type)?;
        check_payload_type("red_payload_type", self.red_payload_type)?;
        if let Some(pt) = self.metadata_payload_type {
            check_payload_type("metadata_payload_type", pt)?;
        }

        if self.fec_enabled && !(1..=MAX_FEC_GROUP_SIZE).contains(&self.fec_group_size) {
            return Err(RttError::invalid_config(format!(
                "fec_group_size must be within 1..={}, got {}",
                MAX_FEC_GROUP_SIZE, self.fec_group_size
            )));
        }
        if self.fec_enabled && self.fec_payload_type == self.payload_type {
            return Err(RttError::invalid_config(
                "fec_payload_type must differ from payload_type",
            ));
        }
        if self.red_enabled && self.redundancy_level == 0 {
            return Err(RttError::invalid_config("redundancy_level must be at least 1"));
        }
        if self.red_enabled && self.red_payload_type == self.payload_type {
            return Err(RttError::invalid_config(
                "red_payload_type must differ from payload_type",
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(RttError::invalid_config("tick_interval must be non-zero"));
        }
        if self.id_list.len() > MAX_CSRC_COUNT {
            return Err(RttError::invalid_config(format!(
                "at most {} CSRC identifiers, got {}",
                MAX_CSRC_COUNT,
                self.id_list.len()
            )));
        }
        if let Some(id) = &self.stream_identifier {
            validate_stream_id(id)?;
        }
        Ok(())
    }
}

fn check_payload_type(name: &str, pt: u8) -> Result<()> {
    if pt > 0x7F {
        return Err(RttError::invalid_config(format!(
            "{name} must fit in 7 bits, got {pt}"
        )));
    }
    Ok(())
}

/// 流 ID 不能为空，也不能包含前缀分隔符
pub fn validate_stream_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(RttError::invalid_config("stream id must not be empty"));
    }
    if id.contains(STREAM_DELIMITER) {
        return Err(RttError::invalid_config(format!(
            "stream id {id:?} contains the reserved delimiter"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fec_group_size, 5);
        assert_eq!(config.redundancy_level, 2);
        assert_eq!(config.char_rate_limit, 30);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            TransportConfig::default().with_payload_type(200),
            TransportConfig::default().with_fec(0),
            TransportConfig::default().with_fec(33),
            TransportConfig::default().with_red(0),
            TransportConfig::default().with_csrc_ids((0..16).collect()),
            TransportConfig::default().with_stream_prefix(""),
            TransportConfig::default().with_stream_prefix(format!("a{STREAM_DELIMITER}b")),
        ];
        for config in bad {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        }
    }
}
