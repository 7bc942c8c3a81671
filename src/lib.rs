//! rtt-stream - 基于 RTP 的实时文本传输核心库
//!
//! 把增量生成的文本作为会话式实时文本发送。
//! 按字素簇处理退格，用 XOR FEC 和 RED 抗丢包，按速率发送，
//! 并在一条 RTP 流上复用多个逻辑流。

/// 传输配置
pub mod config;

/// 错误类型
pub mod error;

/// FEC（前向纠错）与 RED 冗余
pub mod fec;

/// RTP 报文编解码
pub mod framing;

/// 字素缓冲区（退格处理）
pub mod grapheme;

/// 标识符生成
pub mod keys;

/// 元数据通道
pub mod metadata;

/// 加密边界
pub mod protect;

/// 报文出口
pub mod sink;

/// 上游输入
pub mod source;

/// 流管理模块
pub mod stream;

/// 单流传输
pub mod transport;

// 日志系统
pub mod logging;

/// 重新导出常用类型
pub use config::TransportConfig;
pub use error::{ErrorKind, Result, RttError};
pub use metadata::Metadata;
pub use protect::{KeyMaterial, ProtectSession};
pub use sink::{MemorySink, PacketSink, open_sink};
pub use source::{Chunk, PullSource, SourceEvent, Upstream};
pub use stream::{DemuxEvent, Demultiplexer, Multiplexer};
pub use transport::{Transport, TransportEvent, TransportStats};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
