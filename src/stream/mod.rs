//! 流模块：限速、轮询调度、多路复用与解复用

/// 令牌桶限速
pub mod rate_limit;

/// 轮询调度器
pub mod scheduler;

/// 多路复用器
pub mod multiplexer;

/// 解复用器
pub mod demultiplexer;

// 重新导出公共类型
pub use demultiplexer::{DemuxError, DemuxEvent, DemuxStats, DemuxStream, Demultiplexer};
pub use multiplexer::{Multiplexer, MultiplexerStats, StreamUpstream};
pub use rate_limit::{CharQueue, Pacer, Release, TokenBucket};
pub use scheduler::{Grant, RoundRobinScheduler, SchedulerStats};
