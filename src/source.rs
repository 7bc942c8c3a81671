//! 上游输入
//!
//! 传输层消费的一切都以 [`SourceEvent`] 推入 [`Upstream`]。
//! 拉取式的生产者（块迭代器）通过 [`PullSource`] 转为推送。

use std::fmt;

use crate::metadata::Metadata;

/// 统一后的一段上游输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Metadata(Metadata),
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::Text(text.to_string())
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text(text)
    }
}

impl From<Metadata> for Chunk {
    fn from(metadata: Metadata) -> Self {
        Chunk::Metadata(metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Chunk(Chunk),
    End,
    /// 生产者出错，流被冲刷并关闭
    Error(String),
}

/// 接收上游事件的推送接口
pub trait Upstream {
    fn deliver(&mut self, event: SourceEvent);
}

/// 把块迭代器适配为推送事件
pub struct PullSource<I> {
    iter: I,
    finished: bool,
}

impl<I, E> PullSource<I>
where
    I: Iterator<Item = Result<Chunk, E>>,
    E: fmt::Display,
{
    pub fn new(iter: I) -> Self {
        Self { iter, finished: false }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 最多拉取 `max` 项推入 `target`
    ///
    /// 迭代结束时推送 [`SourceEvent::End`]，出错时推送 [`SourceEvent::Error`]，
    /// 两者只推送一次。返回是否已结束。
    pub fn pump<U: Upstream + ?Sized>(&mut self, target: &mut U, max: usize) -> bool {
        if self.finished {
            return true;
        }
        for _ in 0..max {
            match self.iter.next() {
                Some(Ok(chunk)) => target.deliver(SourceEvent::Chunk(chunk)),
                Some(Err(e)) => {
                    self.finished = true;
                    target.deliver(SourceEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    self.finished = true;
                    target.deliver(SourceEvent::End);
                    break;
                }
            }
        }
        self.finished
    }

    /// 拉取全部
    pub fn pump_all<U: Upstream + ?Sized>(&mut self, target: &mut U) {
        while !self.pump(target, usize::MAX) {}
    }
}
