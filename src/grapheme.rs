//! 按字素簇编辑的显示缓冲
//!
//! 记录对端当前显示的内容，把输入块转换成能重现它的字素簇和退格序列。
//! 接收端运行同一算法，两端保持一致。

use unicode_segmentation::UnicodeSegmentation;

/// 退格控制符（U+0008）
pub const BACKSPACE: char = '\u{0008}';
pub const BACKSPACE_STR: &str = "\u{0008}";

/// 一个输入块的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Applied {
    /// 需要发送的内容
    pub output: String,
    /// 处理后接收端显示的内容
    pub buffer: String,
}

/// 在 `buffer` 之上应用 `chunk`，返回新的缓冲和输出
///
/// 按扩展字素簇依次处理：退格删除缓冲的最后一个簇并转发，
/// 缓冲为空时丢弃；其他簇同时追加到缓冲和输出。
pub fn apply(chunk: &str, buffer: &str) -> Applied {
    let mut display = buffer.to_string();
    let output = apply_in_place(chunk, &mut display);
    Applied {
        output,
        buffer: display,
    }
}

/// 原地修改 `display`，返回需要发送的内容
fn apply_in_place(chunk: &str, display: &mut String) -> String {
    // 不含退格时直接追加，无需切分
    if !chunk.contains(BACKSPACE) {
        display.push_str(chunk);
        return chunk.to_string();
    }

    let mut output = String::with_capacity(chunk.len());
    for cluster in chunk.graphemes(true) {
        if cluster == BACKSPACE_STR {
            if let Some((idx, _)) = display.grapheme_indices(true).next_back() {
                display.truncate(idx);
                output.push(BACKSPACE);
            }
        } else {
            display.push_str(cluster);
            output.push_str(cluster);
        }
    }
    output
}

/// 把文本切分成字素簇，限速队列以此为单位
pub fn clusters(text: &str) -> impl Iterator<Item = &str> {
    text.graphemes(true)
}

/// 一次会话的有状态编辑缓冲
#[derive(Debug, Clone, Default)]
pub struct GraphemeBuffer {
    display: String,
}

impl GraphemeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一个输入块，返回需要发送的内容
    pub fn push(&mut self, chunk: &str) -> String {
        apply_in_place(chunk, &mut self.display)
    }

    /// 当前显示内容
    pub fn text(&self) -> &str {
        &self.display
    }
}
