//! 带外元数据通道
//!
//! 上游把各家的数据形态统一成 [`Metadata`]，传输层把它编码为 protobuf
//! [`MetadataEnvelope`]，加上 `META:` 前缀后放在 marker 包里发送。

use prost::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        content: String,
    },
    Reasoning {
        text: String,
    },
    Custom {
        name: String,
        content: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetadataKind {
    Unspecified = 0,
    ToolCall = 1,
    ToolResult = 2,
    Reasoning = 3,
    Custom = 4,
}

/// 元数据包携带的线上消息
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataEnvelope {
    #[prost(string, tag = "1")]
    pub stream_id: String,
    #[prost(enumeration = "MetadataKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub id: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "5")]
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("metadata envelope has no stream id")]
    MissingStreamId,

    #[error("unknown metadata kind {0}")]
    UnknownKind(i32),
}

impl Metadata {
    pub fn kind(&self) -> MetadataKind {
        match self {
            Metadata::ToolCall { .. } => MetadataKind::ToolCall,
            Metadata::ToolResult { .. } => MetadataKind::ToolResult,
            Metadata::Reasoning { .. } => MetadataKind::Reasoning,
            Metadata::Custom { .. } => MetadataKind::Custom,
        }
    }

    pub fn to_envelope(&self, stream_id: &str) -> MetadataEnvelope {
        let mut envelope = MetadataEnvelope {
            stream_id: stream_id.to_string(),
            ..Default::default()
        };
        envelope.set_kind(self.kind());
        match self {
            Metadata::ToolCall { id, name, arguments } => {
                envelope.id = id.clone();
                envelope.name = name.clone();
                envelope.content = arguments.clone();
            }
            Metadata::ToolResult { id, content } => {
                envelope.id = id.clone();
                envelope.content = content.clone();
            }
            Metadata::Reasoning { text } => {
                envelope.content = text.clone();
            }
            Metadata::Custom { name, content } => {
                envelope.name = name.clone();
                envelope.content = content.clone();
            }
        }
        envelope
    }

    /// 序列化为元数据包负载（不含前缀）
    pub fn encode(&self, stream_id: &str) -> Vec<u8> {
        self.to_envelope(stream_id).encode_to_vec()
    }
}

impl MetadataEnvelope {
    pub fn into_metadata(self) -> Result<(String, Metadata), MetadataError> {
        if self.stream_id.is_empty() {
            return Err(MetadataError::MissingStreamId);
        }
        let kind = MetadataKind::try_from(self.kind).map_err(|_| MetadataError::UnknownKind(self.kind))?;
        let metadata = match kind {
            MetadataKind::ToolCall => Metadata::ToolCall {
                id: self.id,
                name: self.name,
                arguments: self.content,
            },
            MetadataKind::ToolResult => Metadata::ToolResult {
                id: self.id,
                content: self.content,
            },
            MetadataKind::Reasoning => Metadata::Reasoning { text: self.content },
            MetadataKind::Custom => Metadata::Custom {
                name: self.name,
                content: self.content,
            },
            MetadataKind::Unspecified => return Err(MetadataError::UnknownKind(self.kind)),
        };
        Ok((self.stream_id, metadata))
    }
}

/// 解码信封（前缀已去掉）
pub fn decode(encoded: &[u8]) -> Result<(String, Metadata), MetadataError> {
    MetadataEnvelope::decode(encoded)?.into_metadata()
}
