//! RTP 上的单个实时文本流
//!
//! 传输持有序列号和时间戳状态，每次发送都经过同一流水线:
//!
//! 1. 负载分帧（原始文本、`id<US>` 前缀或 `META:` 信封）
//! 2. 启用且有历史时用 RED 包装
//! 3. 加上 RTP 头
//! 4. 配置了加密会话时加密
//! 5. 交给出口
//! 6. 更新 RED 历史和 FEC 分组，分组满时发送恢复包
//!
//! 包级错误作为 [`TransportEvent`] 排队，不会关闭传输。
//! 时间由外部通过 [`Transport::tick`] 驱动。

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::{ErrorKind, Result, RttError};
use crate::fec::{FecEncoder, FecPacket, RedEncoder};
use crate::framing::{self, EncodeOptions, Payload, RTP_HEADER_LEN};
use crate::grapheme::GraphemeBuffer;
use crate::keys;
use crate::metadata::Metadata;
use crate::protect::{self, KeyMaterial, ProtectSession, SessionFactory};
use crate::sink::PacketSink;
use crate::source::{Chunk, SourceEvent, Upstream};
use crate::stream::rate_limit::Pacer;

/// 未配置时元数据信封使用的流 ID
pub const DEFAULT_STREAM_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 包级或清理错误，相关发送已放弃
    Error { kind: ErrorKind, message: String },
    /// 上游生产者出错，多路复用时带 `stream_id`
    SourceError {
        stream_id: Option<String>,
        message: String,
    },
    /// 多路复用的流结束并已移除
    StreamRemoved { stream_id: String },
    Closed,
}

/// 传输统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub red_packets_sent: u64,
    pub fec_packets_sent: u64,
    pub metadata_packets_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
}

/// 单个流的序列号、时间戳和源标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// 单次发送的标识覆盖，供多路复用使用
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions<'a> {
    pub csrcs: &'a [u32],
    pub stream_prefix: Option<&'a str>,
}

pub type MetadataCallback = Box<dyn FnMut(&Metadata)>;

pub struct Transport {
    session_id: Uuid,
    config: TransportConfig,
    state: StreamState,
    red: Option<RedEncoder>,
    fec: Option<FecEncoder>,
    session: Option<Box<dyn ProtectSession>>,
    sink: Box<dyn PacketSink>,
    pacer: Option<Pacer>,
    edits: GraphemeBuffer,
    metadata_callback: Option<MetadataCallback>,
    events: VecDeque<TransportEvent>,
    stats: TransportStats,
    closed: bool,
}

impl Transport {
    /// 打开传输，`char_rate_limit > 0` 时启用限速
    pub fn new(config: TransportConfig, sink: Box<dyn PacketSink>, now: Instant) -> Result<Self> {
        let paced = config.rate_limited();
        Self::build(config, sink, now, paced)
    }

    /// 打开不带限速器的传输，由调用方决定发送时机
    pub(crate) fn unpaced(config: TransportConfig, sink: Box<dyn PacketSink>, now: Instant) -> Result<Self> {
        Self::build(config, sink, now, false)
    }

    fn build(config: TransportConfig, sink: Box<dyn PacketSink>, now: Instant, paced: bool) -> Result<Self> {
        config.validate()?;

        let state = StreamState {
            sequence_number: match config.initial_sequence_number {
                Some(seq) => seq,
                None => keys::random_u16()?,
            },
            timestamp: match config.initial_timestamp {
                Some(ts) => ts,
                None => keys::random_u32()?,
            },
            ssrc: match config.ssrc {
                Some(ssrc) => ssrc,
                None => keys::generate_ssrc()?,
            },
        };

        let red = config.red_enabled.then(|| RedEncoder::new(config.redundancy_level));
        let fec = if config.fec_enabled {
            Some(FecEncoder::new(config.fec_group_size, config.fec_payload_type, config.payload_type)?)
        } else {
            None
        };
        let pacer = paced.then(|| Pacer::new(config.char_rate_limit, now));

        let session_id = Uuid::new_v4();
        info!(
            "transport {} opened: ssrc={:08x} seq={} pt={} fec={} red={} rate={}/s",
            session_id,
            state.ssrc,
            state.sequence_number,
            config.payload_type,
            config.fec_enabled,
            config.red_enabled,
            config.char_rate_limit
        );

        Ok(Self {
            session_id,
            config,
            state,
            red,
            fec,
            session: None,
            sink,
            pacer,
            edits: GraphemeBuffer::new(),
            metadata_callback: None,
            events: VecDeque::new(),
            stats: TransportStats::default(),
            closed: false,
        })
    }

    /// 用 `session` 保护每个发出的包
    pub fn with_protection(mut self, session: Box<dyn ProtectSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// 由密钥材料构建保护会话
    pub fn with_key_material(self, material: &KeyMaterial, factory: &SessionFactory) -> Result<Self> {
        let session = protect::open_session(material, factory)?;
        Ok(self.with_protection(session))
    }

    /// 发送前观察每条元数据
    pub fn with_metadata_callback(mut self, callback: impl FnMut(&Metadata) + 'static) -> Self {
        self.metadata_callback = Some(Box::new(callback));
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn sequence_number(&self) -> u16 {
        self.state.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.state.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.state.ssrc
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 等待令牌的字符数
    pub fn queued(&self) -> usize {
        self.pacer.as_ref().map_or(0, Pacer::queued)
    }

    /// 对端当前的显示内容
    pub fn displayed_text(&self) -> &str {
        self.edits.text()
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    /// 接收上游的文本块
    ///
    /// 先在显示缓冲上处理退格，结果进入限速队列，未限速时立即发送。
    pub fn push_text(&mut self, chunk: &str) {
        if self.closed {
            warn!("transport {}: text after close dropped", self.session_id);
            return;
        }
        let output = if self.config.process_backspaces {
            self.edits.push(chunk)
        } else {
            chunk.to_string()
        };
        if output.is_empty() {
            return;
        }
        match self.pacer.as_mut() {
            Some(pacer) => pacer.push_text(&output),
            None => {
                self.send_text(&output);
            }
        }
    }

    /// 接收上游的元数据，未启用元数据处理时忽略
    pub fn push_metadata(&mut self, metadata: &Metadata) {
        if self.closed || !self.config.handle_metadata {
            debug!("transport {}: metadata ignored", self.session_id);
            return;
        }
        self.observe_metadata(metadata);
        let stream_id = self.own_stream_id();
        let opts = self.own_options();
        let csrcs = opts.csrcs.to_vec();
        self.send_metadata_with(metadata, &stream_id, &SendOptions {
            csrcs: &csrcs,
            stream_prefix: None,
        });
    }

    pub(crate) fn observe_metadata(&mut self, metadata: &Metadata) {
        if let Some(callback) = self.metadata_callback.as_mut() {
            callback(metadata);
        }
    }

    /// 定时回调：释放限速队列中的文本
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        let release = self.pacer.as_mut().and_then(|pacer| pacer.tick(now));
        if let Some(release) = release {
            debug!(
                "transport {}: tick released {} chars (budget {:.2})",
                self.session_id, release.chars, release.budget
            );
            self.send_text(&release.text);
        }
    }

    /// 以本传输自己的标识立即发送文本
    pub fn send_text(&mut self, text: &str) -> bool {
        let own = self.own_options();
        let stream_prefix = own.stream_prefix.map(str::to_string);
        let csrcs = own.csrcs.to_vec();
        let opts = SendOptions {
            csrcs: &csrcs,
            stream_prefix: stream_prefix.as_deref(),
        };
        self.send_text_with(text, &opts)
    }

    /// 以指定标识发送文本，CSRC 优先于负载前缀
    pub fn send_text_with(&mut self, text: &str, opts: &SendOptions<'_>) -> bool {
        self.send_payload(Payload::Text(text), opts)
    }

    /// 发送带 `stream_id` 的元数据包（marker 置位）
    pub fn send_metadata_with(&mut self, metadata: &Metadata, stream_id: &str, opts: &SendOptions<'_>) -> bool {
        let encoded = metadata.encode(stream_id);
        self.send_payload(Payload::Metadata(&encoded), opts)
    }

    fn own_options(&self) -> SendOptions<'_> {
        if self.config.multiplex_enabled && self.config.use_id_for_stream_id {
            SendOptions {
                csrcs: &self.config.id_list,
                stream_prefix: None,
            }
        } else if self.config.multiplex_enabled {
            SendOptions {
                csrcs: &[],
                stream_prefix: self.config.stream_identifier.as_deref(),
            }
        } else {
            SendOptions::default()
        }
    }

    fn own_stream_id(&self) -> String {
        match (self.config.use_id_for_stream_id, self.config.id_list.first()) {
            (true, Some(id)) if self.config.multiplex_enabled => format!("csrc:{id}"),
            _ => self
                .config
                .stream_identifier
                .clone()
                .unwrap_or_else(|| DEFAULT_STREAM_ID.to_string()),
        }
    }

    fn send_payload(&mut self, payload: Payload<'_>, opts: &SendOptions<'_>) -> bool {
        if self.closed {
            warn!("transport {}: send after close rejected", self.session_id);
            return false;
        }

        let StreamState {
            sequence_number: seq,
            timestamp: ts,
            ssrc,
        } = self.state;
        let media_pt = self.config.payload_type;
        let marker = payload.is_metadata();
        let encode_opts = EncodeOptions {
            payload_type: media_pt,
            metadata_payload_type: self.config.metadata_payload_type,
            red_payload_type: self.config.red_payload_type,
            ssrc: Some(ssrc),
            csrcs: opts.csrcs,
            stream_prefix: opts.stream_prefix,
        };

        // RED 历史和 FEC 都作用于分帧后的负载
        let body = payload.frame(&encode_opts);
        let red_body = if marker {
            None
        } else {
            self.red.as_ref().and_then(|red| red.encode(&body, media_pt, ts))
        };
        let wire = match &red_body {
            Some(red_body) => Payload::Redundant(red_body),
            None => payload,
        };
        let wire_payload = red_body.as_deref().unwrap_or(&body);

        let packet = match framing::encode(seq, ts, wire, &encode_opts) {
            Ok(packet) => packet,
            Err(e) => {
                self.report(e);
                return false;
            }
        };
        let header_len = RTP_HEADER_LEN + 4 * opts.csrcs.len().min(15);
        let payload_type = wire.payload_type(&encode_opts);

        let Some(packet) = self.protect(packet) else {
            return false;
        };

        let delivered = match self.sink.send(&packet) {
            Ok(()) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += packet.len() as u64;
                if red_body.is_some() {
                    self.stats.red_packets_sent += 1;
                }
                if marker {
                    self.stats.metadata_packets_sent += 1;
                }
                true
            }
            Err(e) => {
                self.report(RttError::from(e));
                false
            }
        };
        debug!(
            "transport {}: seq={} ts={} pt={} len={} header={}",
            self.session_id,
            seq,
            ts,
            payload_type,
            packet.len(),
            hex::encode(&packet[..header_len.min(packet.len())])
        );

        // 报文已组装并发出，无论出口是否接受都占用这个序列号
        if !marker {
            if let Some(red) = self.red.as_mut() {
                red.record(&body, media_pt, ts);
            }
        }
        let fec_packet = self
            .fec
            .as_mut()
            .and_then(|fec| fec.push(wire_payload, seq, ts, ssrc));

        self.state.sequence_number = seq.wrapping_add(1);
        self.state.timestamp = ts.wrapping_add(self.config.timestamp_increment);

        if let Some(fec_packet) = fec_packet {
            self.dispatch_fec(fec_packet);
        }
        delivered
    }

    fn dispatch_fec(&mut self, fec_packet: Result<FecPacket>) {
        let fec_packet = match fec_packet {
            Ok(packet) => packet,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        let Some(bytes) = self.protect(fec_packet.to_bytes()) else {
            return;
        };
        match self.sink.send(&bytes) {
            Ok(()) => {
                self.stats.fec_packets_sent += 1;
                self.stats.bytes_sent += bytes.len() as u64;
                debug!(
                    "transport {}: FEC seq={} mask={:#x}",
                    self.session_id, fec_packet.header.sequence_number, fec_packet.fec_header.mask
                );
            }
            Err(e) => self.report(RttError::from(e)),
        }
    }

    /// 不会退回明文，加密失败时丢弃该包
    fn protect(&mut self, packet: Vec<u8>) -> Option<Vec<u8>> {
        let Some(session) = self.session.as_mut() else {
            return Some(packet);
        };
        match session.protect(&packet) {
            Ok(protected) => Some(protected),
            Err(e) => {
                self.report(RttError::from(e));
                None
            }
        }
    }

    pub(crate) fn report(&mut self, err: RttError) {
        warn!("transport {}: {} error: {}", self.session_id, err.kind(), err);
        self.stats.errors += 1;
        self.events.push_back(TransportEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// 冲刷限速文本和未满的 FEC 分组，然后关闭出口
    ///
    /// 可重复调用。出口关闭失败时返回错误并上报。
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let remaining = self.pacer.as_mut().and_then(Pacer::flush);
        if let Some(release) = remaining {
            info!("transport {}: flushing {} queued chars", self.session_id, release.chars);
            self.send_text(&release.text);
        }
        self.flush_fec();

        self.closed = true;
        let result = self
            .sink
            .close()
            .map_err(|e| RttError::Resource(format!("sink close failed: {e}")));
        if let Err(e) = &result {
            warn!("transport {}: {}", self.session_id, e);
            self.stats.errors += 1;
            self.events.push_back(TransportEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        self.events.push_back(TransportEvent::Closed);
        info!("transport {} closed: {:?}", self.session_id, self.stats);
        result
    }

    /// 为 FEC 分组中已有的包输出恢复包
    pub(crate) fn flush_fec(&mut self) {
        let ssrc = self.state.ssrc;
        let pending = self.fec.as_mut().and_then(|fec| fec.flush(ssrc));
        if let Some(fec_packet) = pending {
            self.dispatch_fec(fec_packet);
        }
    }
}

impl Upstream for Transport {
    fn deliver(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Chunk(Chunk::Text(text)) => self.push_text(&text),
            SourceEvent::Chunk(Chunk::Metadata(metadata)) => self.push_metadata(&metadata),
            SourceEvent::End => {
                let _ = self.close();
            }
            SourceEvent::Error(message) => {
                warn!("transport {}: upstream error: {}", self.session_id, message);
                self.events.push_back(TransportEvent::SourceError {
                    stream_id: None,
                    message,
                });
                let _ = self.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::{FEC_HEADER_LEN, FecHeader, RedPacket, xor_payloads};
    use crate::framing::RtpHeader;
    use crate::protect::ProtectError;
    use crate::sink::{MemorySink, SinkError};
    use std::time::Duration;

    fn base_config() -> TransportConfig {
        TransportConfig::default()
            .with_ssrc(0x1234_5678)
            .with_initial_sequence_number(100)
            .with_initial_timestamp(1000)
            .with_char_rate_limit(0)
    }

    fn open(config: TransportConfig) -> (Transport, MemorySink) {
        let sink = MemorySink::new();
        let transport = Transport::new(config, Box::new(sink.clone()), Instant::now()).unwrap();
        (transport, sink)
    }

    fn parse(packet: &[u8]) -> (RtpHeader, Vec<u8>) {
        let (header, offset) = RtpHeader::parse(packet).unwrap();
        (header, packet[offset..].to_vec())
    }

    struct FailingSink;

    impl PacketSink for FailingSink {
        fn send(&mut self, _packet: &[u8]) -> std::result::Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        fn close(&mut self) -> std::result::Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    #[test]
    fn test_plain_send_sequence_and_timestamp() {
        let (mut transport, sink) = open(base_config());
        assert!(transport.send_text("he"));
        assert!(transport.send_text("llo"));

        let packets = sink.packets();
        let (h0, p0) = parse(&packets[0]);
        let (h1, p1) = parse(&packets[1]);
        assert_eq!((h0.sequence_number, h0.timestamp), (100, 1000));
        assert_eq!((h1.sequence_number, h1.timestamp), (101, 1160));
        assert_eq!(h0.ssrc, 0x1234_5678);
        assert_eq!(h0.payload_type, 98);
        assert_eq!(p0, b"he");
        assert_eq!(p1, b"llo");
    }

    #[test]
    fn test_stream_identifier_unprefixed_without_multiplex() {
        let mut config = base_config();
        config.stream_identifier = Some("x".into());
        assert!(!config.multiplex_enabled);
        let (mut transport, sink) = open(config);
        transport.send_text("hi");
        transport.push_text("!");
        let packets = sink.packets();
        assert_eq!(parse(&packets[0]).1, b"hi");
        assert_eq!(parse(&packets[1]).1, b"!");
    }

    #[test]
    fn test_stream_prefix_with_multiplex() {
        let (mut transport, sink) = open(base_config().with_stream_prefix("x"));
        transport.send_text("hi");
        assert_eq!(parse(&sink.packets()[0]).1, "x\u{1f}hi".as_bytes());
    }

    #[test]
    fn test_sequence_wraps_after_65536_sends() {
        let config = base_config()
            .with_initial_sequence_number(65000)
            .with_initial_timestamp(u32::MAX - 100);
        let sink = MemorySink::new();
        let mut transport = Transport::new(config, Box::new(sink.clone()), Instant::now()).unwrap();
        for _ in 0..65536u32 {
            transport.send_text("x");
        }
        assert_eq!(transport.sequence_number(), 65000);
        let expected_ts = (u32::MAX - 100).wrapping_add(160u32.wrapping_mul(65536));
        assert_eq!(transport.timestamp(), expected_ts);
        assert_eq!(sink.len(), 65536);
    }

    #[test]
    fn test_fec_groups_and_close_flush() {
        let (mut transport, sink) = open(base_config().with_fec(3));
        for i in 0..7 {
            transport.send_text(&format!("m{i}"));
        }
        let fec_during: Vec<_> = sink
            .packets()
            .iter()
            .map(|p| parse(p).0)
            .filter(|h| h.payload_type == 100)
            .collect();
        assert_eq!(fec_during.len(), 2);
        assert_eq!(fec_during[0].sequence_number, 103);
        assert_eq!(fec_during[1].sequence_number, 106);
        // FEC 不占用媒体序列号
        assert_eq!(transport.sequence_number(), 107);

        transport.close().unwrap();
        let packets = sink.packets();
        assert_eq!(packets.len(), 7 + 3);
        let (last, body) = parse(packets.last().unwrap());
        assert_eq!(last.payload_type, 100);
        assert_eq!(last.sequence_number, 107);
        let fec_header = FecHeader::parse(&body).unwrap();
        assert_eq!(fec_header.mask, 0b1);
        assert_eq!(fec_header.base_sequence, 106);
        assert_eq!(&body[FEC_HEADER_LEN..], b"m6");
        assert!(sink.is_closed());
        assert_eq!(transport.stats().fec_packets_sent, 3);
    }

    #[test]
    fn test_fec_payload_recovers_lost_packet() {
        let (mut transport, sink) = open(base_config().with_fec(3));
        for text in ["abc", "def", "ghi"] {
            transport.send_text(text);
        }
        let packets = sink.packets();
        let (_, fec_body) = parse(&packets[3]);
        let recovery = &fec_body[FEC_HEADER_LEN..];

        let p0 = parse(&packets[0]).1;
        let p2 = parse(&packets[2]).1;
        let recovered = xor_payloads(&[p0.as_slice(), p2.as_slice(), recovery]);
        assert_eq!(recovered, b"def");
    }

    #[test]
    fn test_red_wraps_history() {
        let (mut transport, sink) = open(base_config().with_red(2));
        for text in ["a", "b", "c", "d"] {
            transport.send_text(text);
        }
        let packets = sink.packets();
        let (h0, p0) = parse(&packets[0]);
        assert_eq!(h0.payload_type, 98);
        assert_eq!(p0, b"a");

        let expected_blocks = [2usize, 3, 3];
        for (packet, blocks) in packets[1..].iter().zip(expected_blocks) {
            let (header, body) = parse(packet);
            assert_eq!(header.payload_type, 99);
            let red = RedPacket::parse(&body).unwrap();
            assert_eq!(red.block_count(), blocks);
            for block in &red.redundant {
                assert_eq!(block.data.len(), 1);
                assert_eq!(block.timestamp_offset % 160, 0);
            }
        }
        let (_, last) = parse(&packets[3]);
        let red = RedPacket::parse(&last).unwrap();
        assert_eq!(red.primary, b"d");
        assert_eq!(red.redundant[0].data, b"c");
        assert_eq!(red.redundant[1].data, b"b");
        assert_eq!(transport.stats().red_packets_sent, 3);
    }

    #[test]
    fn test_encryption_failure_drops_packet_without_state_change() {
        let (transport, sink) = open(base_config().with_fec(2));
        let mut calls = 0;
        let session = move |packet: &[u8]| -> std::result::Result<Vec<u8>, ProtectError> {
            calls += 1;
            if calls == 2 {
                Err(ProtectError::Protect("key expired".into()))
            } else {
                Ok(packet.iter().map(|b| b ^ 0xFF).collect())
            }
        };
        let mut transport = transport.with_protection(Box::new(session));

        assert!(transport.send_text("one"));
        assert!(!transport.send_text("two"));
        assert_eq!(transport.sequence_number(), 101);
        assert_eq!(sink.len(), 1);

        let events = transport.drain_events();
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::Error { kind: ErrorKind::Encryption, .. }]
        ));

        // 没有明文发出
        for packet in sink.packets() {
            assert_ne!(packet[0] >> 6, 2);
        }
    }

    #[test]
    fn test_network_failure_reported_and_transport_survives() {
        let mut transport = Transport::new(base_config(), Box::new(FailingSink), Instant::now()).unwrap();
        assert!(!transport.send_text("x"));
        assert!(!transport.send_text("y"));
        assert_eq!(transport.sequence_number(), 102);
        assert!(!transport.is_closed());

        let err = transport.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        let kinds: Vec<_> = transport
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![ErrorKind::Network, ErrorKind::Network, ErrorKind::Resource]);
    }

    #[test]
    fn test_rate_limited_ticks_and_close_flush() {
        let start = Instant::now();
        let sink = MemorySink::new();
        let config = base_config().with_char_rate_limit(10);
        let mut transport = Transport::new(config, Box::new(sink.clone()), start).unwrap();

        transport.push_text("hello world, this is paced");
        assert_eq!(sink.len(), 0);

        transport.tick(start + Duration::from_millis(100));
        assert_eq!(parse(&sink.packets()[0]).1, b"hello worl");

        transport.tick(start + Duration::from_millis(200));
        assert_eq!(parse(&sink.packets()[1]).1, b"d");

        transport.close().unwrap();
        let rest = parse(sink.packets().last().unwrap()).1;
        assert_eq!(rest, b", this is paced");
        assert_eq!(transport.queued(), 0);

        transport.push_text("late");
        transport.tick(start + Duration::from_secs(5));
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_backspaces_resolved_before_send() {
        let (mut transport, sink) = open(base_config());
        transport.push_text("ab");
        transport.push_text("\u{8}\u{8}\u{8}");
        transport.push_text("\u{8}");
        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(parse(&packets[1]).1, b"\x08\x08");
        assert_eq!(transport.displayed_text(), "");
    }

    #[test]
    fn test_metadata_packets() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let observer = seen.clone();
        let (transport, sink) = open(base_config().with_metadata(Some(101)).with_stream_prefix("A"));
        let mut transport = transport.with_metadata_callback(move |m| observer.borrow_mut().push(m.clone()));

        let meta = Metadata::Reasoning { text: "plan".into() };
        transport.push_metadata(&meta);

        let (header, body) = parse(&sink.packets()[0]);
        assert!(header.marker);
        assert_eq!(header.payload_type, 101);
        assert!(body.starts_with(framing::METADATA_PREFIX));
        let (stream_id, decoded) = crate::metadata::decode(&body[framing::METADATA_PREFIX.len()..]).unwrap();
        assert_eq!(stream_id, "A");
        assert_eq!(decoded, meta);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_metadata_ignored_when_disabled() {
        let (mut transport, sink) = open(base_config());
        transport.push_metadata(&Metadata::Reasoning { text: "x".into() });
        assert!(sink.is_empty());
    }

    #[test]
    fn test_upstream_error_closes_and_flushes() {
        let (mut transport, sink) = open(base_config().with_fec(4));
        transport.deliver(SourceEvent::Chunk("hi".into()));
        transport.deliver(SourceEvent::Error("connection reset".into()));

        assert!(transport.is_closed());
        assert_eq!(sink.len(), 2);
        let events = transport.drain_events();
        assert_eq!(
            events,
            vec![
                TransportEvent::SourceError {
                    stream_id: None,
                    message: "connection reset".into()
                },
                TransportEvent::Closed
            ]
        );
    }
}
