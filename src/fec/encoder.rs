use tracing::{debug, info};

use crate::error::{Result, RttError};
use crate::fec::frame::{FEC_HEADER_LEN, FecHeader, protection_mask};
use crate::fec::{seq_is_newer, timestamp_is_newer};
use crate::framing::RtpHeader;

/// 等待生成恢复包的一组媒体包
#[derive(Debug, Default, Clone)]
pub struct FecGroup {
    pub payloads: Vec<Vec<u8>>,
    pub sequence_numbers: Vec<u16>,
    pub timestamps: Vec<u32>,
}

impl FecGroup {
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn clear(&mut self) {
        self.payloads.clear();
        self.sequence_numbers.clear();
        self.timestamps.clear();
    }
}

/// 构建好的恢复包
#[derive(Debug, Clone)]
pub struct FecPacket {
    pub header: RtpHeader,
    pub fec_header: FecHeader,
    pub payload: Vec<u8>,
}

impl FecPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header.len() + FEC_HEADER_LEN + self.payload.len());
        self.header.write_to(&mut buf);
        self.fec_header.write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// 逐字节异或，较短的负载视为补零
pub fn xor_payloads<P: AsRef<[u8]>>(payloads: &[P]) -> Vec<u8> {
    let longest = payloads.iter().map(|p| p.as_ref().len()).max().unwrap_or(0);
    let mut out = vec![0u8; longest];
    for payload in payloads {
        for (acc, byte) in out.iter_mut().zip(payload.as_ref()) {
            *acc ^= byte;
        }
    }
    out
}

/// 构建保护 `payloads` 的恢复包
///
/// 三个切片一一对应，第 `i` 项描述同一个受保护的包。
/// 分组为空或长度不一致时返回错误。
pub fn build_fec_packet(
    payloads: &[Vec<u8>],
    sequence_numbers: &[u16],
    timestamps: &[u32],
    fec_payload_type: u8,
    media_payload_type: u8,
    ssrc: u32,
) -> Result<FecPacket> {
    if payloads.is_empty() {
        return Err(RttError::Fec("no packets to protect".into()));
    }
    if payloads.len() != sequence_numbers.len() || payloads.len() != timestamps.len() {
        return Err(RttError::Fec(format!(
            "mismatched group: {} payloads, {} sequence numbers, {} timestamps",
            payloads.len(),
            sequence_numbers.len(),
            timestamps.len()
        )));
    }

    let mut newest_seq = sequence_numbers[0];
    let mut base_idx = 0;
    for (i, &seq) in sequence_numbers.iter().enumerate() {
        if seq_is_newer(seq, newest_seq) {
            newest_seq = seq;
        }
        if seq_is_newer(sequence_numbers[base_idx], seq) {
            base_idx = i;
        }
    }
    let newest_ts = timestamps
        .iter()
        .copied()
        .fold(timestamps[0], |acc, ts| if timestamp_is_newer(ts, acc) { ts } else { acc });

    let base_sequence = sequence_numbers[base_idx];
    let fec_header = FecHeader {
        original_payload_type: media_payload_type,
        base_sequence,
        base_timestamp: timestamps[base_idx],
        length: payloads[0].len().min(u16::MAX as usize) as u16,
        mask: protection_mask(base_sequence, sequence_numbers),
    };

    let header = RtpHeader::new(fec_payload_type, newest_seq.wrapping_add(1), newest_ts, ssrc);

    Ok(FecPacket {
        header,
        fec_header,
        payload: xor_payloads(payloads),
    })
}

/// FEC编码器：累积 `group_size` 个包后生成一个 XOR 恢复包
pub struct FecEncoder {
    group_size: usize,
    fec_payload_type: u8,
    media_payload_type: u8,
    group: FecGroup,
}

impl FecEncoder {
    pub fn new(group_size: usize, fec_payload_type: u8, media_payload_type: u8) -> Result<Self> {
        if group_size == 0 {
            return Err(RttError::invalid_config("FEC group size must be greater than 0"));
        }
        Ok(Self {
            group_size,
            fec_payload_type,
            media_payload_type,
            group: FecGroup::default(),
        })
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn pending(&self) -> usize {
        self.group.len()
    }

    /// 加入一个已发送的包，分组满时返回恢复包
    pub fn push(&mut self, payload: &[u8], seq: u16, timestamp: u32, ssrc: u32) -> Option<Result<FecPacket>> {
        self.group.payloads.push(payload.to_vec());
        self.group.sequence_numbers.push(seq);
        self.group.timestamps.push(timestamp);

        if self.group.len() < self.group_size {
            return None;
        }
        Some(self.emit(ssrc))
    }

    /// 输出待处理的内容，分组未满也输出
    pub fn flush(&mut self, ssrc: u32) -> Option<Result<FecPacket>> {
        if self.group.is_empty() {
            return None;
        }
        info!("FEC flush: partial group of {}/{}", self.group.len(), self.group_size);
        Some(self.emit(ssrc))
    }

    fn emit(&mut self, ssrc: u32) -> Result<FecPacket> {
        let result = build_fec_packet(
            &self.group.payloads,
            &self.group.sequence_numbers,
            &self.group.timestamps,
            self.fec_payload_type,
            self.media_payload_type,
            ssrc,
        );
        if let Ok(packet) = &result {
            debug!(
                "FEC packet seq={} protects {} packets from base {}",
                packet.header.sequence_number,
                self.group.len(),
                packet.fec_header.base_sequence
            );
        }
        self.group.clear();
        result
    }
}
