//! 多路复用的接收端：输入报文字节，输出按流划分的事件
//!
//! 流的解析顺序，先匹配者优先:
//! 1. CSRC 列表非空时取 `csrc:<第一个 ID>`
//! 2. marker 置位且以 `META:` 开头的负载，流 ID 在信封内
//! 3. `id<US>` 前缀取 `id`
//! 4. 其余归入 `default` 流

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::fec::RedPacket;
use crate::framing::{CodecError, METADATA_PREFIX, RtpHeader, STREAM_DELIMITER};
use crate::grapheme::GraphemeBuffer;
use crate::metadata::{self, Metadata, MetadataError};
use crate::transport::DEFAULT_STREAM_ID;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("bad RTP header: {0}")]
    Codec(#[from] CodecError),

    #[error("bad metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("text payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed RED payload")]
    Red,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// 某个 ID 的第一个包，每个 ID 只触发一次
    NewStream(String),
    /// 收到的原始文本，包含退格
    Text { stream_id: String, text: String },
    Metadata { stream_id: String, metadata: Metadata },
}

/// 接收端单个流的句柄
#[derive(Debug, Clone)]
pub struct DemuxStream {
    id: String,
    display: GraphemeBuffer,
    packets: u64,
    last_sequence: Option<u16>,
}

impl DemuxStream {
    fn new(id: String) -> Self {
        Self {
            id,
            display: GraphemeBuffer::new(),
            packets: 0,
            last_sequence: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 应用全部退格后的当前显示内容
    pub fn text(&self) -> &str {
        self.display.text()
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }
}

#[derive(Debug, Default, Clone)]
pub struct DemuxStats {
    pub packets: u64,
    pub fec_skipped: u64,
    pub red_unwrapped: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct Demultiplexer {
    red_payload_type: Option<u8>,
    fec_payload_type: Option<u8>,
    streams: HashMap<String, DemuxStream>,
    order: Vec<String>,
    stats: DemuxStats,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 `config` 启用的 RED 和 FEC 负载类型识别报文
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            red_payload_type: config.red_enabled.then_some(config.red_payload_type),
            fec_payload_type: config.fec_enabled.then_some(config.fec_payload_type),
            ..Self::default()
        }
    }

    pub fn with_red_payload_type(mut self, payload_type: u8) -> Self {
        self.red_payload_type = Some(payload_type);
        self
    }

    pub fn with_fec_payload_type(mut self, payload_type: u8) -> Self {
        self.fec_payload_type = Some(payload_type);
        self
    }

    pub fn stream(&self, id: &str) -> Option<&DemuxStream> {
        self.streams.get(id)
    }

    /// 按首次出现顺序排列的流 ID
    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.clone()
    }

    /// 解码一个报文
    ///
    /// FEC 报文不产生事件，RED 报文只取主块。
    pub fn process(&mut self, packet: &[u8]) -> Result<Vec<DemuxEvent>, DemuxError> {
        let result = self.process_inner(packet);
        if result.is_err() {
            self.stats.errors += 1;
        }
        result
    }

    fn process_inner(&mut self, packet: &[u8]) -> Result<Vec<DemuxEvent>, DemuxError> {
        let (header, offset) = RtpHeader::parse(packet)?;
        self.stats.packets += 1;

        if Some(header.payload_type) == self.fec_payload_type {
            self.stats.fec_skipped += 1;
            debug!("demux: skipping FEC packet seq={}", header.sequence_number);
            return Ok(Vec::new());
        }

        let mut payload = &packet[offset..];
        if Some(header.payload_type) == self.red_payload_type {
            payload = RedPacket::parse(payload).ok_or(DemuxError::Red)?.primary;
            self.stats.red_unwrapped += 1;
        }

        let csrc_id = header.csrcs.first().map(|id| format!("csrc:{id}"));

        // 只有 marker 置位的包才是元数据，普通文本也可能以 META: 开头
        if let Some(encoded) = payload.strip_prefix(METADATA_PREFIX).filter(|_| header.marker) {
            let (envelope_id, metadata) = metadata::decode(encoded)?;
            let stream_id = csrc_id.unwrap_or(envelope_id);
            let mut events = Vec::with_capacity(2);
            self.touch(&stream_id, header.sequence_number, &mut events);
            events.push(DemuxEvent::Metadata { stream_id, metadata });
            return Ok(events);
        }

        let body = std::str::from_utf8(payload)?;
        let (stream_id, text) = match csrc_id {
            Some(id) => (id, body),
            None => match body.split_once(STREAM_DELIMITER) {
                Some((id, text)) => (id.to_string(), text),
                None => (DEFAULT_STREAM_ID.to_string(), body),
            },
        };

        let mut events = Vec::with_capacity(2);
        let stream = self.touch(&stream_id, header.sequence_number, &mut events);
        stream.display.push(text);
        events.push(DemuxEvent::Text {
            stream_id,
            text: text.to_string(),
        });
        Ok(events)
    }

    /// 查找 `id` 对应的句柄，不存在时创建
    fn touch(&mut self, id: &str, seq: u16, events: &mut Vec<DemuxEvent>) -> &mut DemuxStream {
        if !self.streams.contains_key(id) {
            info!("demux: new stream {:?}", id);
            self.order.push(id.to_string());
            events.push(DemuxEvent::NewStream(id.to_string()));
        }
        let stream = self
            .streams
            .entry(id.to_string())
            .or_insert_with(|| DemuxStream::new(id.to_string()));
        stream.packets += 1;
        stream.last_sequence = Some(seq);
        stream
    }
}
