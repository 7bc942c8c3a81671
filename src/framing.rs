//! 实时文本的 RTP 分帧
//!
//! 构建和解析固定 RTP 头（RFC 3550），并对其后的文本负载分帧。
//!
//! 头部: `[V P X CC][M PT][seq 16][timestamp 32][ssrc 32][csrc 32 * CC]`
//!
//! 负载按优先级:
//! - 元数据包: `META:` 后接 protobuf 编码的信封
//! - 带前缀的流: `<流 ID><U+001F><UTF-8 文本>`
//! - 其他情况为原始 UTF-8 文本

use std::ops::Range;

use crate::error::Result;
use crate::keys;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
const RTP_SEQNUM_RANGE: Range<usize> = 2..4;
const RTP_TIMESTAMP_RANGE: Range<usize> = 4..8;
const RTP_SSRC_RANGE: Range<usize> = 8..12;

/// 分隔流 ID 与文本（ASCII 单元分隔符）
pub const STREAM_DELIMITER: char = '\u{001F}';
/// 带外元数据负载的固定前缀
pub const METADATA_PREFIX: &[u8] = b"META:";

/// 头部解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("packet too short: {current} bytes, need {needed}")]
    TooShort { current: usize, needed: usize },

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
        }
    }

    pub fn csrc_count(&self) -> u8 {
        // 列表由调用方校验，字段本身只有 4 位
        (self.csrcs.len().min(15)) as u8
    }

    /// 序列化长度: 12 + 4 * CC
    pub fn len(&self) -> usize {
        RTP_HEADER_LEN + 4 * self.csrc_count() as usize
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let mut b0 = (self.version & 0b11) << 6;
        if self.padding {
            b0 |= 0b0010_0000;
        }
        if self.extension {
            b0 |= 0b0001_0000;
        }
        b0 |= self.csrc_count() & 0b0000_1111;

        let mut b1 = self.payload_type & 0b0111_1111;
        if self.marker {
            b1 |= 0b1000_0000;
        }

        buf.push(b0);
        buf.push(b1);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in self.csrcs.iter().take(self.csrc_count() as usize) {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
    }

    /// 解析 `packet` 开头的头部
    ///
    /// 返回头部和负载起始偏移。
    pub fn parse(packet: &[u8]) -> std::result::Result<(RtpHeader, usize), CodecError> {
        if packet.len() < RTP_HEADER_LEN {
            return Err(CodecError::TooShort {
                current: packet.len(),
                needed: RTP_HEADER_LEN,
            });
        }

        let b0 = packet[0];
        let b1 = packet[1];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let csrc_count = (b0 & 0b0000_1111) as usize;
        let header_len = RTP_HEADER_LEN + 4 * csrc_count;
        if packet.len() < header_len {
            return Err(CodecError::TooShort {
                current: packet.len(),
                needed: header_len,
            });
        }

        let csrcs = packet[RTP_HEADER_LEN..header_len]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let seq = &packet[RTP_SEQNUM_RANGE];
        let ts = &packet[RTP_TIMESTAMP_RANGE];
        let ssrc = &packet[RTP_SSRC_RANGE];

        Ok((
            RtpHeader {
                version,
                padding: b0 & 0b0010_0000 != 0,
                extension: b0 & 0b0001_0000 != 0,
                marker: b1 & 0b1000_0000 != 0,
                payload_type: b1 & 0b0111_1111,
                sequence_number: u16::from_be_bytes([seq[0], seq[1]]),
                timestamp: u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]),
                ssrc: u32::from_be_bytes([ssrc[0], ssrc[1], ssrc[2], ssrc[3]]),
                csrcs,
            },
            header_len,
        ))
    }
}

/// 拼接头部和已分帧的负载
pub fn build_packet(header: &RtpHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.len() + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(body);
    buf
}

/// 文本分帧，可选带流 ID 前缀
pub fn frame_text(text: &str, stream_prefix: Option<&str>) -> Vec<u8> {
    match stream_prefix {
        Some(id) => {
            let mut body = Vec::with_capacity(id.len() + 1 + text.len());
            body.extend_from_slice(id.as_bytes());
            let mut delim = [0u8; 4];
            body.extend_from_slice(STREAM_DELIMITER.encode_utf8(&mut delim).as_bytes());
            body.extend_from_slice(text.as_bytes());
            body
        }
        None => text.as_bytes().to_vec(),
    }
}

/// 元数据信封分帧
pub fn frame_metadata(encoded: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(METADATA_PREFIX.len() + encoded.len());
    body.extend_from_slice(METADATA_PREFIX);
    body.extend_from_slice(encoded);
    body
}

/// 单个包携带的内容
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Text(&'a str),
    /// 已编码的元数据信封（不含前缀）
    Metadata(&'a [u8]),
    /// RED 包装后的文本负载
    Redundant(&'a [u8]),
}

impl Payload<'_> {
    /// 元数据包置位 marker
    pub fn is_metadata(&self) -> bool {
        matches!(self, Payload::Metadata(_))
    }

    /// 头部之后的负载字节
    pub fn frame(&self, opts: &EncodeOptions<'_>) -> Vec<u8> {
        match *self {
            Payload::Text(text) => {
                let prefix = if opts.csrcs.is_empty() { opts.stream_prefix } else { None };
                frame_text(text, prefix)
            }
            Payload::Metadata(encoded) => frame_metadata(encoded),
            Payload::Redundant(body) => body.to_vec(),
        }
    }

    /// 元数据用元数据负载类型（未配置时退回媒体类型），RED 用 RED 类型
    pub fn payload_type(&self, opts: &EncodeOptions<'_>) -> u8 {
        match self {
            Payload::Text(_) => opts.payload_type,
            Payload::Metadata(_) => opts.metadata_payload_type.unwrap_or(opts.payload_type),
            Payload::Redundant(_) => opts.red_payload_type,
        }
    }
}

/// 每个包的编码选项
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions<'a> {
    pub payload_type: u8,
    pub metadata_payload_type: Option<u8>,
    pub red_payload_type: u8,
    /// `None` 时生成新的随机 SSRC
    pub ssrc: Option<u32>,
    pub csrcs: &'a [u32],
    /// 流 ID 前缀，仅在不使用 CSRC 标识时生效
    pub stream_prefix: Option<&'a str>,
}

/// 为一个负载构建完整的 RTP 包
pub fn encode(seq: u16, timestamp: u32, payload: Payload<'_>, opts: &EncodeOptions<'_>) -> Result<Vec<u8>> {
    let ssrc = match opts.ssrc {
        Some(ssrc) => ssrc,
        None => keys::generate_ssrc()?,
    };

    let mut header = RtpHeader::new(payload.payload_type(opts), seq, timestamp, ssrc);
    header.marker = payload.is_metadata();
    header.csrcs = opts.csrcs.to_vec();

    Ok(build_packet(&header, &payload.frame(opts)))
}
