//! 最近文本负载的冗余编码（RED）
//!
//! ```text
//! redundant block header (4 bytes):  |1| PT |  timestamp offset (16) | length (8) |
//! primary block header   (1 byte):   |0| PT |
//! ```
//! 先是由新到旧的块头，再是由新到旧的冗余负载，最后是主负载。

use std::collections::VecDeque;

const RED_BLOCK_HEADER_LEN: usize = 4;
const RED_PRIMARY_HEADER_LEN: usize = 1;
const RED_MAX_BLOCK_LEN: usize = u8::MAX as usize;
const RED_MORE_BLOCKS: u8 = 0b1000_0000;

#[derive(Debug, Clone)]
struct HistoryEntry {
    payload: Vec<u8>,
    payload_type: u8,
    timestamp: u32,
}

/// 保存单个流最近 `redundancy_level` 个主负载
#[derive(Debug, Clone)]
pub struct RedEncoder {
    redundancy_level: usize,
    history: VecDeque<HistoryEntry>,
}

impl RedEncoder {
    pub fn new(redundancy_level: usize) -> Self {
        Self {
            redundancy_level,
            history: VecDeque::with_capacity(redundancy_level + 1),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// 用历史负载包装 `primary`，尚无历史时返回 `None`
    pub fn encode(&self, primary: &[u8], payload_type: u8, timestamp: u32) -> Option<Vec<u8>> {
        if self.history.is_empty() {
            return None;
        }

        let blocks: Vec<(&HistoryEntry, &[u8])> = self
            .history
            .iter()
            .rev()
            .map(|entry| {
                let len = entry.payload.len().min(RED_MAX_BLOCK_LEN);
                (entry, &entry.payload[..len])
            })
            .collect();

        let body_len = blocks.iter().map(|(_, data)| RED_BLOCK_HEADER_LEN + data.len()).sum::<usize>()
            + RED_PRIMARY_HEADER_LEN
            + primary.len();
        let mut body = Vec::with_capacity(body_len);

        for (entry, data) in &blocks {
            let offset = (timestamp.wrapping_sub(entry.timestamp) & 0xFFFF) as u16;
            body.push(RED_MORE_BLOCKS | (entry.payload_type & 0x7F));
            body.extend_from_slice(&offset.to_be_bytes());
            body.push(data.len() as u8);
        }
        body.push(payload_type & 0x7F);

        for (_, data) in &blocks {
            body.extend_from_slice(data);
        }
        body.extend_from_slice(primary);

        Some(body)
    }

    /// 记录已发送的主负载，超出冗余级别时淘汰最旧的
    pub fn record(&mut self, primary: &[u8], payload_type: u8, timestamp: u32) {
        if self.redundancy_level == 0 {
            return;
        }
        self.history.push_back(HistoryEntry {
            payload: primary.to_vec(),
            payload_type,
            timestamp,
        });
        while self.history.len() > self.redundancy_level {
            self.history.pop_front();
        }
    }
}

/// 解析出的一个冗余块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedBlock<'a> {
    pub payload_type: u8,
    pub timestamp_offset: u16,
    pub data: &'a [u8],
}

/// RED 负载的借用视图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedPacket<'a> {
    /// 由新到旧，与发送顺序一致
    pub redundant: Vec<RedBlock<'a>>,
    pub primary_payload_type: u8,
    pub primary: &'a [u8],
}

impl<'a> RedPacket<'a> {
    pub fn parse(body: &'a [u8]) -> Option<RedPacket<'a>> {
        let mut headers = Vec::new();
        let mut pos = 0;
        let primary_payload_type = loop {
            let b0 = *body.get(pos)?;
            if b0 & RED_MORE_BLOCKS == 0 {
                pos += RED_PRIMARY_HEADER_LEN;
                break b0 & 0x7F;
            }
            let header = body.get(pos..pos + RED_BLOCK_HEADER_LEN)?;
            headers.push((b0 & 0x7F, u16::from_be_bytes([header[1], header[2]]), header[3] as usize));
            pos += RED_BLOCK_HEADER_LEN;
        };

        let mut redundant = Vec::with_capacity(headers.len());
        for (payload_type, timestamp_offset, len) in headers {
            let data = body.get(pos..pos + len)?;
            redundant.push(RedBlock {
                payload_type,
                timestamp_offset,
                data,
            });
            pos += len;
        }

        Some(RedPacket {
            redundant,
            primary_payload_type,
            primary: &body[pos..],
        })
    }

    /// 块数（含主块）
    pub fn block_count(&self) -> usize {
        self.redundant.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history_sends_plain() {
        let red = RedEncoder::new(2);
        assert!(red.encode(b"a", 98, 0).is_none());
    }

    #[test]
    fn test_layout_newest_first() {
        let mut red = RedEncoder::new(2);
        red.record(b"one", 98, 1000);
        red.record(b"two", 98, 1160);

        let body = red.encode(b"three", 98, 1320).unwrap();
        assert_eq!(body[0], 0x80 | 98);
        assert_eq!(&body[1..3], &160u16.to_be_bytes());
        assert_eq!(body[3], 3);
        assert_eq!(body[4], 0x80 | 98);
        assert_eq!(&body[5..7], &320u16.to_be_bytes());
        assert_eq!(body[8], 98);
        assert_eq!(&body[9..], b"twoonethree");

        let parsed = RedPacket::parse(&body).unwrap();
        assert_eq!(parsed.block_count(), 3);
        assert_eq!(parsed.redundant[0].data, b"two");
        assert_eq!(parsed.redundant[1].data, b"one");
        assert_eq!(parsed.primary, b"three");
    }

    #[test]
    fn test_history_capped() {
        let mut red = RedEncoder::new(2);
        for (i, text) in ["a", "b", "c", "d"].iter().enumerate() {
            red.record(text.as_bytes(), 98, i as u32);
        }
        assert_eq!(red.history_len(), 2);
        let parsed_body = red.encode(b"e", 98, 4).unwrap();
        let parsed = RedPacket::parse(&parsed_body).unwrap();
        assert_eq!(parsed.redundant[0].data, b"d");
        assert_eq!(parsed.redundant[1].data, b"c");
    }

    #[test]
    fn test_long_block_truncated_and_offset_wraps() {
        let mut red = RedEncoder::new(1);
        let long = vec![b'x'; 300];
        red.record(&long, 98, u32::MAX - 9);

        let body = red.encode(b"p", 98, 70_000).unwrap();
        let parsed = RedPacket::parse(&body).unwrap();
        assert_eq!(parsed.redundant[0].data.len(), 255);
        assert_eq!(body[3], 255);
        // (70000 - (2^32 - 10)) mod 2^16
        assert_eq!(parsed.redundant[0].timestamp_offset, 70_010u32 as u16);
        assert_eq!(parsed.primary, b"p");
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(RedPacket::parse(&[0x80 | 98, 0, 1]).is_none());
        assert!(RedPacket::parse(&[0x80 | 98, 0, 1, 5, 98, b'a']).is_none());
    }
}
