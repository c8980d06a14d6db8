use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::stream::StreamSink;

static PAUSE_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.,!?;:]\s*$").expect("punctuation regex"));

/**
 * \brief 模拟流式输出的节奏参数。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorOptions {
    /** \brief 每个分片的字符数 */
    pub chunk_size: usize,
    /** \brief 分片之间的间隔 */
    pub delay: Duration,
    /** \brief 以标点结尾的分片额外停顿 */
    pub punctuation_pause: Duration,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4,
            delay: Duration::from_millis(8),
            punctuation_pause: Duration::from_millis(3),
        }
    }
}

/** \brief 按字符切分，分片边界永远落在完整字符上。 */
fn split_fragments(text: &str, chunk_size: usize) -> Vec<&str> {
    let size = chunk_size.max(1);
    let mut fragments = Vec::new();
    let mut start = 0;
    for (count, (idx, _)) in text.char_indices().enumerate() {
        if count > 0 && count % size == 0 {
            fragments.push(&text[start..idx]);
            start = idx;
        }
    }
    if start < text.len() {
        fragments.push(&text[start..]);
    }
    fragments
}

/**
 * \brief 把完整文本按固定节奏重放为 chunk 事件，最后发送 done。
 *
 * 空白文本直接发送 done。最后一个分片之后不再等待。
 * \return 原文本
 */
pub async fn simulate_streaming(text: &str, sink: &StreamSink, options: SimulatorOptions) -> String {
    if text.trim().is_empty() {
        sink.done(text);
        return text.to_string();
    }

    let fragments = split_fragments(text, options.chunk_size);
    let last = fragments.len().saturating_sub(1);
    for (i, fragment) in fragments.iter().enumerate() {
        sink.chunk(fragment);
        if i < last {
            let pause = if PAUSE_AFTER.is_match(fragment) {
                options.delay + options.punctuation_pause
            } else {
                options.delay
            };
            tokio::time::sleep(pause).await;
        }
    }

    sink.done(text);
    text.to_string()
}
