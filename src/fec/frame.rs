/// FEC 头部块（16字节），紧跟在 RTP 头之后
///
/// ```text
///  0        1        2        3
/// +--------+--------+--------+--------+
/// |reserved| orig PT|  base sequence  |
/// +--------+--------+--------+--------+
/// |          base timestamp           |
/// +--------+--------+--------+--------+
/// |  first length   |    reserved     |
/// +--------+--------+--------+--------+
/// |          protection mask          |
/// +--------+--------+--------+--------+
/// ```
pub const FEC_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    pub original_payload_type: u8,
    pub base_sequence: u16,
    pub base_timestamp: u32,
    /// 第一个受保护包的负载长度
    pub length: u16,
    /// 第 `i` 位置位表示 `base_sequence + i` 受保护
    pub mask: u32,
}

impl FecHeader {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        buf.push(self.original_payload_type & 0x7F);
        buf.extend_from_slice(&self.base_sequence.to_be_bytes());
        buf.extend_from_slice(&self.base_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.mask.to_be_bytes());
    }

    pub fn parse(data: &[u8]) -> Option<FecHeader> {
        if data.len() < FEC_HEADER_LEN {
            return None;
        }
        Some(FecHeader {
            original_payload_type: data[1] & 0x7F,
            base_sequence: u16::from_be_bytes([data[2], data[3]]),
            base_timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            length: u16::from_be_bytes([data[8], data[9]]),
            mask: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    /// 掩码覆盖的序列号
    pub fn protected_sequences(&self) -> Vec<u16> {
        (0..32u16)
            .filter(|i| self.mask & (1u32 << i) != 0)
            .map(|i| self.base_sequence.wrapping_add(i))
            .collect()
    }
}

/// 计算保护位掩码：连续 N 个包时为 2^N - 1
pub fn protection_mask(base: u16, seqs: &[u16]) -> u32 {
    seqs.iter()
        .map(|seq| seq.wrapping_sub(base))
        .filter(|offset| *offset < 32)
        .fold(0u32, |mask, offset| mask | (1u32 << offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_mask() {
        assert_eq!(protection_mask(10, &[10, 11, 12]), 0b111);
        assert_eq!(protection_mask(65534, &[65534, 65535, 0, 1, 2]), 0b1_1111);
        assert_eq!(protection_mask(5, &[5, 7]), 0b101);
    }

    #[test]
    fn test_header_layout() {
        let header = FecHeader {
            original_payload_type: 98,
            base_sequence: 0x0102,
            base_timestamp: 0x0A0B0C0D,
            length: 7,
            mask: 0b111,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf);

        assert_eq!(buf.len(), FEC_HEADER_LEN);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 98);
        assert_eq!(&buf[2..4], &[1, 2]);
        assert_eq!(&buf[8..10], &[0, 7]);
        assert_eq!(FecHeader::parse(&buf), Some(header));
        assert_eq!(header.protected_sequences(), vec![0x0102, 0x0103, 0x0104]);
    }
}
