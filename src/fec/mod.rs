//! FEC（前向纠错）模块
//!
//! XOR 奇偶校验（RFC 5109 风格）与 RED 冗余编码（RFC 2198 风格）

mod encoder;
mod frame;
pub mod red;

// 重新导出
pub use encoder::{FecEncoder, FecGroup, FecPacket, build_fec_packet, xor_payloads};
pub use frame::{FEC_HEADER_LEN, FecHeader, protection_mask};
pub use red::{RedEncoder, RedPacket};

/// 按 16 位序列号顺序（RFC 1982）`a` 晚于 `b`
pub fn seq_is_newer(a: u16, b: u16) -> bool {
    a != b && (a.wrapping_sub(b) as i16) > 0
}

/// 按 32 位序列号顺序 `a` 晚于 `b`
pub fn timestamp_is_newer(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) as i32) > 0
}
