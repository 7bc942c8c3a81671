//! 按字素簇的令牌桶限速
//!
//! 一个令牌就是一个字符：桶每秒补充 `capacity` 个令牌，最多存 `capacity` 个。
//! 时间由调用方显式传入，由外部定时器驱动。

use std::collections::VecDeque;
use std::time::Instant;

use crate::grapheme;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 创建满桶
    pub fn new(chars_per_sec: u32, now: Instant) -> Self {
        let capacity = f64::from(chars_per_sec);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// 补充 `elapsed_ms * capacity / 1000` 个令牌，不超过容量
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.capacity / 1000.0).min(self.capacity);
        self.last_refill = now;
    }

    /// 当前可用的整数令牌数
    pub fn available(&self) -> usize {
        if self.tokens < 1.0 { 0 } else { self.tokens.floor() as usize }
    }

    pub fn consume(&mut self, amount: usize) {
        self.tokens -= amount as f64;
    }
}

/// 等待令牌的字素簇队列（先进先出）
#[derive(Debug, Clone, Default)]
pub struct CharQueue {
    clusters: VecDeque<String>,
}

impl CharQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切分 `text` 并逐簇入队
    ///
    /// 队尾的簇可能与新文本组成同一个字符（例如 ZWJ 序列跨块到达），
    /// 所以先取出队尾，与新文本拼接后重新切分。
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut joined = self.clusters.pop_back().unwrap_or_default();
        joined.push_str(text);
        self.clusters.extend(grapheme::clusters(&joined).map(str::to_string));
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// 出队最多 `max` 个簇，拼成一个字符串
    pub fn take(&mut self, max: usize) -> (String, usize) {
        let count = max.min(self.clusters.len());
        let text: String = self.clusters.drain(..count).collect();
        (text, count)
    }

    pub fn drain_all(&mut self) -> (String, usize) {
        self.take(self.clusters.len())
    }
}

/// 一次 tick 释放的内容
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub text: String,
    pub chars: usize,
    /// 本次释放时的令牌余额
    pub budget: f64,
}

/// 单个流的限速器：令牌桶 + 队列
#[derive(Debug, Clone)]
pub struct Pacer {
    bucket: TokenBucket,
    queue: CharQueue,
}

impl Pacer {
    pub fn new(chars_per_sec: u32, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(chars_per_sec, now),
            queue: CharQueue::new(),
        }
    }

    pub fn push_text(&mut self, text: &str) {
        self.queue.push_text(text);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// 先补充令牌，再把 `floor(tokens)` 个簇（队列不足时全部）作为一个整体释放
    pub fn tick(&mut self, now: Instant) -> Option<Release> {
        self.bucket.refill(now);
        let budget = self.bucket.tokens();
        let allowed = self.bucket.available();
        if self.queue.is_empty() || allowed == 0 {
            return None;
        }
        let (text, chars) = self.queue.take(allowed);
        self.bucket.consume(chars);
        Some(Release { text, chars, budget })
    }

    /// 不看令牌，释放全部排队内容
    pub fn flush(&mut self) -> Option<Release> {
        if self.queue.is_empty() {
            return None;
        }
        let budget = self.bucket.tokens();
        let (text, chars) = self.queue.drain_all();
        Some(Release { text, chars, budget })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_refill_capped() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(30, start);
        bucket.consume(30);
        bucket.refill(start + Duration::from_millis(100));
        assert!((bucket.tokens() - 3.0).abs() < 1e-6);
        bucket.refill(start + Duration::from_secs(10));
        assert_eq!(bucket.tokens(), 30.0);
    }

    #[test]
    fn test_never_splits_clusters() {
        let mut queue = CharQueue::new();
        queue.push_text("a👨\u{200D}👩\u{200D}👧b");
        assert_eq!(queue.len(), 3);
        let (text, n) = queue.take(2);
        assert_eq!(n, 2);
        assert_eq!(text, "a👨\u{200D}👩\u{200D}👧");
    }

    #[test]
    fn test_burst_delivered_in_order_within_budget() {
        let start = Instant::now();
        let mut pacer = Pacer::new(30, start);
        let input: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        pacer.push_text(&input);

        let mut delivered = String::new();
        let mut now = start;
        for _ in 0..50 {
            now += Duration::from_millis(100);
            if let Some(release) = pacer.tick(now) {
                assert!(release.chars as f64 <= release.budget);
                delivered.push_str(&release.text);
            }
        }
        assert!(delivered.len() < input.len());

        if let Some(rest) = pacer.flush() {
            delivered.push_str(&rest.text);
        }
        assert_eq!(delivered, input);
        assert_eq!(pacer.queued(), 0);
    }

    #[test]
    fn test_fractional_tokens_accumulate() {
        let start = Instant::now();
        let mut pacer = Pacer::new(5, start);
        pacer.push_text("0123456789");
        // 初始满桶
        assert_eq!(pacer.tick(start).map(|r| r.chars), Some(5));
        // 5/s 下 100 ms 只有半个令牌
        assert!(pacer.tick(start + Duration::from_millis(100)).is_none());
        assert_eq!(pacer.tick(start + Duration::from_millis(200)).map(|r| r.chars), Some(1));
    }

    #[test]
    fn test_cluster_split_across_chunks_stays_whole() {
        let mut queue = CharQueue::new();
        queue.push_text("👨");
        queue.push_text("\u{200D}👩");
        assert_eq!(queue.len(), 1);
        queue.push_text("e");
        queue.push_text("\u{301}x");
        assert_eq!(queue.len(), 3);
        let (text, n) = queue.drain_all();
        assert_eq!(n, 3);
        assert_eq!(text, "👨\u{200D}👩e\u{301}x");
    }

    #[test]
    fn test_pacer_sends_joined_cluster_once() {
        let start = Instant::now();
        let mut pacer = Pacer::new(1, start);
        pacer.push_text("👨");
        pacer.push_text("\u{200D}👩");

        let sends: Vec<String> = (0..3)
            .filter_map(|i| pacer.tick(start + Duration::from_secs(i)))
            .map(|r| r.text)
            .collect();
        assert_eq!(sends, vec!["👨\u{200D}👩".to_string()]);
    }
}
