use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{TransportConfig, validate_stream_id};
use crate::error::{Result, RttError};
use crate::grapheme::GraphemeBuffer;
use crate::keys::CsrcAllocator;
use crate::metadata::Metadata;
use crate::protect::ProtectSession;
use crate::sink::PacketSink;
use crate::source::{Chunk, SourceEvent, Upstream};
use crate::stream::rate_limit::{CharQueue, TokenBucket};
use crate::stream::scheduler::{RoundRobinScheduler, SchedulerStats};
use crate::transport::{SendOptions, Transport, TransportEvent, TransportStats};

/// 复用器中的一个逻辑流
struct MuxStream {
    id: String,
    /// CSRC 标识模式下按注册顺序分配
    csrc: Option<u32>,
    edits: GraphemeBuffer,
    queue: CharQueue,
}

impl MuxStream {
    fn options(&self) -> SendOptions<'_> {
        match &self.csrc {
            Some(csrc) => SendOptions {
                csrcs: std::slice::from_ref(csrc),
                stream_prefix: None,
            },
            None => SendOptions {
                csrcs: &[],
                stream_prefix: Some(self.id.as_str()),
            },
        }
    }
}

/// 复用器统计信息
#[derive(Debug, Default, Clone)]
pub struct MultiplexerStats {
    pub streams_added: u64,
    pub streams_removed: u64,
    pub active_streams: usize,
    pub queued_chars: usize,
    pub scheduler: SchedulerStats,
    pub transport: TransportStats,
}

/// 多个逻辑流共享一个 [`Transport`] 和一个令牌预算
///
/// 按 `use_id_for_stream_id` 选择用顺序分配的 CSRC 或 `id<US>` 负载前缀标识流。
/// 序列号和时间戳属于共享的传输。
pub struct Multiplexer {
    /// 共享的传输层（自身不限速）
    transport: Transport,

    /// 所有流共用的令牌桶；`None` 表示不限速
    bucket: Option<TokenBucket>,

    scheduler: RoundRobinScheduler,

    /// 按注册顺序排列
    streams: Vec<MuxStream>,

    csrcs: CsrcAllocator,

    use_csrc: bool,
    process_backspaces: bool,
    handle_metadata: bool,

    streams_added: u64,
    streams_removed: u64,
    closed: bool,
}

impl Multiplexer {
    pub fn new(config: TransportConfig, sink: Box<dyn PacketSink>, now: Instant) -> Result<Self> {
        let bucket = config
            .rate_limited()
            .then(|| TokenBucket::new(config.char_rate_limit, now));
        let use_csrc = config.use_id_for_stream_id;
        let process_backspaces = config.process_backspaces;
        let handle_metadata = config.handle_metadata;
        let transport = Transport::unpaced(config, sink, now)?;

        info!(
            "multiplexer on transport {}: {} identification",
            transport.session_id(),
            if use_csrc { "CSRC" } else { "prefix" }
        );

        Ok(Self {
            transport,
            bucket,
            scheduler: RoundRobinScheduler::new(),
            streams: Vec::new(),
            csrcs: CsrcAllocator::new(),
            use_csrc,
            process_backspaces,
            handle_metadata,
            streams_added: 0,
            streams_removed: 0,
            closed: false,
        })
    }

    pub fn with_protection(mut self, session: Box<dyn ProtectSession>) -> Self {
        self.transport = self.transport.with_protection(session);
        self
    }

    pub fn with_metadata_callback(mut self, callback: impl FnMut(&Metadata) + 'static) -> Self {
        self.transport = self.transport.with_metadata_callback(callback);
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// 注册流，CSRC 模式下返回分配的 CSRC
    ///
    /// 重复的 ID 被拒绝，已有状态不变
    pub fn add_stream(&mut self, id: &str) -> Result<Option<u32>> {
        if self.closed {
            return Err(RttError::invalid_config(format!("cannot add stream {id:?}: multiplexer closed")));
        }
        validate_stream_id(id)?;
        if self.position(id).is_some() {
            return Err(RttError::invalid_config(format!("duplicate stream id {id:?}")));
        }

        let csrc = self.use_csrc.then(|| self.csrcs.allocate());
        self.streams.push(MuxStream {
            id: id.to_string(),
            csrc,
            edits: GraphemeBuffer::new(),
            queue: CharQueue::new(),
        });
        self.streams_added += 1;
        info!("stream {:?} added (csrc {:?}), {} active", id, csrc, self.streams.len());
        Ok(csrc)
    }

    /// 冲刷并移除流，未知 ID 返回 `false`
    pub fn remove_stream(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.finish_stream(idx);
                true
            }
            None => false,
        }
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|s| s.id.as_str())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn csrc_of(&self, id: &str) -> Option<u32> {
        self.position(id).and_then(|idx| self.streams[idx].csrc)
    }

    pub fn queued(&self, id: &str) -> Option<usize> {
        self.position(id).map(|idx| self.streams[idx].queue.len())
    }

    /// `id` 对端当前的显示内容
    pub fn displayed_text(&self, id: &str) -> Option<&str> {
        self.position(id).map(|idx| self.streams[idx].edits.text())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.id == id)
    }

    fn require(&self, id: &str) -> Result<usize> {
        self.position(id)
            .ok_or_else(|| RttError::invalid_config(format!("unknown stream id {id:?}")))
    }

    /// 为 `id` 排队文本，不限速时立即发送
    pub fn push_text(&mut self, id: &str, chunk: &str) -> Result<()> {
        let idx = self.require(id)?;
        if self.closed {
            warn!("stream {:?}: text after close dropped", id);
            return Ok(());
        }
        let stream = &mut self.streams[idx];
        let output = if self.process_backspaces {
            stream.edits.push(chunk)
        } else {
            chunk.to_string()
        };
        if output.is_empty() {
            return Ok(());
        }

        if self.bucket.is_some() {
            stream.queue.push_text(&output);
        } else {
            self.transport.send_text_with(&output, &stream.options());
        }
        Ok(())
    }

    /// 立即为 `id` 发送元数据，元数据不限速
    pub fn push_metadata(&mut self, id: &str, metadata: &Metadata) -> Result<()> {
        let idx = self.require(id)?;
        if self.closed || !self.handle_metadata {
            debug!("stream {:?}: metadata ignored", id);
            return Ok(());
        }
        self.transport.observe_metadata(metadata);
        let stream = &self.streams[idx];
        self.transport.send_metadata_with(metadata, &stream.id, &stream.options());
        Ok(())
    }

    /// 把一个上游事件路由到 `id`
    ///
    /// `End` 和 `Error` 会冲刷并移除该流，错误只作为该流的
    /// [`TransportEvent::SourceError`] 上报。
    pub fn deliver(&mut self, id: &str, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Chunk(Chunk::Text(text)) => self.push_text(id, &text),
            SourceEvent::Chunk(Chunk::Metadata(metadata)) => self.push_metadata(id, &metadata),
            SourceEvent::End => {
                let idx = self.require(id)?;
                debug!("stream {:?}: upstream ended", id);
                self.finish_stream(idx);
                Ok(())
            }
            SourceEvent::Error(message) => {
                let idx = self.require(id)?;
                warn!("stream {:?}: upstream error: {}", id, message);
                self.transport.push_event(TransportEvent::SourceError {
                    stream_id: Some(id.to_string()),
                    message,
                });
                self.finish_stream(idx);
                Ok(())
            }
        }
    }

    /// 单个流的推送接口视图，可由 [`PullSource`](crate::source::PullSource) 驱动
    pub fn upstream<'a>(&'a mut self, id: &'a str) -> StreamUpstream<'a> {
        StreamUpstream { mux: self, id }
    }

    /// 定时回调：轮询划分共享预算并发送
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        let Some(bucket) = self.bucket.as_mut() else {
            return;
        };
        bucket.refill(now);
        let tokens = bucket.available();

        let queued: Vec<usize> = self.streams.iter().map(|s| s.queue.len()).collect();
        let grants = self.scheduler.plan(tokens, &queued);

        for grant in grants {
            let stream = &mut self.streams[grant.slot];
            let (text, chars) = stream.queue.take(grant.chars);
            if chars == 0 {
                continue;
            }
            self.transport.send_text_with(&text, &stream.options());
            if let Some(bucket) = self.bucket.as_mut() {
                bucket.consume(chars);
            }
        }
    }

    fn flush_stream(&mut self, idx: usize) {
        let stream = &mut self.streams[idx];
        let (text, chars) = stream.queue.drain_all();
        if chars > 0 {
            debug!("stream {:?}: flushing {} queued chars", stream.id, chars);
            self.transport.send_text_with(&text, &stream.options());
        }
    }

    fn finish_stream(&mut self, idx: usize) {
        self.flush_stream(idx);
        let stream = self.streams.remove(idx);
        self.streams_removed += 1;
        info!("stream {:?} removed, {} active", stream.id, self.streams.len());
        self.transport
            .push_event(TransportEvent::StreamRemoved { stream_id: stream.id });
    }

    /// 冲刷所有流后关闭共享传输，可重复调用
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for idx in 0..self.streams.len() {
            self.flush_stream(idx);
        }
        self.closed = true;
        self.transport.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.transport.poll_event()
    }

    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.transport.drain_events()
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            streams_added: self.streams_added,
            streams_removed: self.streams_removed,
            active_streams: self.streams.len(),
            queued_chars: self.streams.iter().map(|s| s.queue.len()).sum(),
            scheduler: self.scheduler.stats(),
            transport: self.transport.stats(),
        }
    }
}

/// 作为 [`Upstream`] 的 [`Multiplexer`] 单个流
pub struct StreamUpstream<'a> {
    mux: &'a mut Multiplexer,
    id: &'a str,
}

impl Upstream for StreamUpstream<'_> {
    fn deliver(&mut self, event: SourceEvent) {
        if let Err(e) = self.mux.deliver(self.id, event) {
            warn!("stream {:?}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::framing::RtpHeader;
    use crate::sink::MemorySink;
    use crate::source::PullSource;
    use std::time::Duration;

    fn config() -> TransportConfig {
        TransportConfig::default()
            .with_ssrc(7)
            .with_initial_sequence_number(0)
            .with_initial_timestamp(0)
    }

    fn open(config: TransportConfig) -> (Multiplexer, MemorySink, Instant) {
        let sink = MemorySink::new();
        let now = Instant::now();
        let mux = Multiplexer::new(config, Box::new(sink.clone()), now).unwrap();
        (mux, sink, now)
    }

    fn bodies(sink: &MemorySink) -> Vec<(RtpHeader, Vec<u8>)> {
        sink.packets()
            .iter()
            .map(|p| {
                let (header, offset) = RtpHeader::parse(p).unwrap();
                (header, p[offset..].to_vec())
            })
            .collect()
    }

    #[test]
    fn test_duplicate_stream_rejected_without_mutation() {
        let (mut mux, _, _) = open(config().with_csrc_ids(Vec::new()));
        assert_eq!(mux.add_stream("A").unwrap(), Some(1));
        let err = mux.add_stream("A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(mux.stream_count(), 1);
        assert_eq!(mux.add_stream("B").unwrap(), Some(2));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (mut mux, _, _) = open(config());
        assert!(!mux.remove_stream("ghost"));
        mux.add_stream("A").unwrap();
        assert!(mux.remove_stream("A"));
        assert!(!mux.has_stream("A"));
    }

    #[test]
    fn test_csrcs_never_reused() {
        let (mut mux, _, _) = open(config().with_csrc_ids(Vec::new()));
        mux.add_stream("A").unwrap();
        mux.remove_stream("A");
        assert_eq!(mux.add_stream("A").unwrap(), Some(2));
    }

    #[test]
    fn test_prefix_mode_tags_payloads() {
        let (mut mux, sink, _) = open(config().with_stream_prefix("unused").with_char_rate_limit(0));
        mux.add_stream("A").unwrap();
        mux.add_stream("B").unwrap();
        mux.push_text("A", "hi").unwrap();
        mux.push_text("B", "yo").unwrap();

        let packets = bodies(&sink);
        assert_eq!(packets[0].1, "A\u{1F}hi".as_bytes());
        assert_eq!(packets[1].1, "B\u{1F}yo".as_bytes());
        assert_eq!(packets[0].0.sequence_number, 0);
        assert_eq!(packets[1].0.sequence_number, 1);
        assert!(packets[0].0.csrcs.is_empty());
    }

    #[test]
    fn test_round_robin_shares_budget() {
        let (mut mux, sink, start) = open(config().with_csrc_ids(Vec::new()).with_char_rate_limit(10));
        mux.add_stream("A").unwrap();
        mux.add_stream("B").unwrap();
        mux.push_text("A", "aaaaaaaaaaaa").unwrap();
        mux.push_text("B", "bb").unwrap();

        mux.tick(start);
        let packets = bodies(&sink);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0.csrcs, vec![1]);
        assert_eq!(packets[0].1, b"aaaaa");
        assert_eq!(packets[1].0.csrcs, vec![2]);
        assert_eq!(packets[1].1, b"bb");
        // B 未用完的份额留在桶里
        assert_eq!(mux.queued("A"), Some(7));

        mux.tick(start + Duration::from_millis(100));
        let packets = bodies(&sink);
        // 剩余 3 个加补充 1 个，全部给唯一活跃的流
        assert_eq!(packets[2].1, b"aaaa");
    }

    #[test]
    fn test_source_error_isolated_to_stream() {
        let (mut mux, sink, start) = open(config().with_stream_prefix("x"));
        mux.add_stream("A").unwrap();
        mux.add_stream("B").unwrap();
        mux.push_text("A", "queued").unwrap();
        mux.deliver("A", SourceEvent::Error("boom".into())).unwrap();

        assert!(!mux.has_stream("A"));
        assert!(mux.has_stream("B"));
        assert_eq!(bodies(&sink)[0].1, "A\u{1F}queued".as_bytes());

        let events = mux.drain_events();
        assert_eq!(
            events,
            vec![
                TransportEvent::SourceError {
                    stream_id: Some("A".into()),
                    message: "boom".into()
                },
                TransportEvent::StreamRemoved { stream_id: "A".into() },
            ]
        );

        mux.push_text("B", "ok").unwrap();
        mux.tick(start + Duration::from_millis(100));
        assert!(!mux.is_closed());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_pull_source_drives_stream() {
        let (mut mux, sink, _) = open(config().with_stream_prefix("x").with_char_rate_limit(0));
        mux.add_stream("A").unwrap();
        let chunks: Vec<std::result::Result<Chunk, String>> = vec![Ok("he".into()), Ok("y".into())];
        let mut source = PullSource::new(chunks.into_iter());
        source.pump_all(&mut mux.upstream("A"));

        assert_eq!(sink.len(), 2);
        assert!(!mux.has_stream("A"));
    }

    #[test]
    fn test_close_flushes_all_queues() {
        let (mut mux, sink, _) = open(config().with_stream_prefix("x").with_char_rate_limit(1));
        mux.add_stream("A").unwrap();
        mux.add_stream("B").unwrap();
        mux.push_text("A", "long text").unwrap();
        mux.push_text("B", "more").unwrap();
        mux.close().unwrap();

        let packets = bodies(&sink);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].1, "A\u{1F}long text".as_bytes());
        assert!(sink.is_closed());
        assert!(mux.add_stream("C").is_err());
    }
}
