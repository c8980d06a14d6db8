use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::AiError;

/**
 * \brief 流式事件。零或多个 chunk 之后恰好一个 done 或 error。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk {
        chunk: String,
    },
    Done {
        #[serde(rename = "finalContent")]
        final_content: String,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

/**
 * \brief 事件通道的发送端。
 *
 * 第一个终止事件之后的所有事件都会被丢弃，保证事件序列合法。
 * 克隆共享同一个终止标记。
 */
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    finished: Arc<AtomicBool>,
    emitted: Arc<AtomicBool>,
}

impl StreamSink {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
            emitted: Arc::new(AtomicBool::new(false)),
        }
    }

    /** \brief 创建一对 (发送端, 接收端)。 */
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /** \brief 发送增量；空串与终止之后的调用被忽略。 */
    pub fn chunk(&self, chunk: &str) -> bool {
        if chunk.is_empty() || self.is_finished() {
            return false;
        }
        self.emitted.store(true, Ordering::SeqCst);
        // 接收端已关闭时静默丢弃
        let _ = self.tx.send(StreamEvent::Chunk {
            chunk: chunk.to_string(),
        });
        true
    }

    pub fn done(&self, final_content: &str) -> bool {
        self.terminate(StreamEvent::Done {
            final_content: final_content.to_string(),
        })
    }

    pub fn error(&self, message: &str) -> bool {
        self.terminate(StreamEvent::Error {
            error: message.to_string(),
        })
    }

    fn terminate(&self, event: StreamEvent) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emitted.store(true, Ordering::SeqCst);
        let _ = self.tx.send(event);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /** \brief 是否已经向调用方发出过任何事件。 */
    pub fn has_emitted(&self) -> bool {
        self.emitted.load(Ordering::SeqCst)
    }
}

/**
 * \brief 一行 SSE 数据。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(Value),
    Done,
}

/**
 * \brief 按行切分 `data: <json>` 事件，跨网络分包缓存半行。
 *
 * 非 JSON 行、注释行与其他字段一律忽略。
 */
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buf: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /** \brief 处理最后一段没有换行结尾的数据。 */
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(line);
    let data = text.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    match serde_json::from_str(data) {
        Ok(value) => Some(SseFrame::Data(value)),
        Err(_) => {
            tracing::trace!(line = %data.chars().take(100).collect::<String>(), "skip non-JSON SSE line");
            None
        }
    }
}

static OPEN_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(think|redacted_reasoning)(?:\s[^>]*)?>").expect("open tag regex")
});
static CLOSE_THINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</think\s*>").expect("think close regex"));
static CLOSE_REDACTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</redacted_reasoning\s*>").expect("redacted close regex"));

const TAG_NAMES: &[&str] = &["think", "redacted_reasoning"];

/**
 * \brief 推理过滤器状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingState {
    Passthrough,
    Suppressed,
}

/**
 * \brief 去除 `<think>` / `<redacted_reasoning>` 推理片段。
 *
 * 每次都对完整累积内容重新清洗，只输出比上次多出来的部分，
 * 因此标签被任意切分在多个分片中也能正确识别。
 * 流式过程中，末尾可能是半个开标签的内容暂不输出。
 */
#[derive(Debug)]
pub struct ThinkingFilter {
    raw: String,
    forwarded: usize,
    state: ThinkingState,
}

impl Default for ThinkingFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingFilter {
    pub fn new() -> Self {
        Self {
            raw: String::new(),
            forwarded: 0,
            state: ThinkingState::Passthrough,
        }
    }

    /** \brief 追加一个分片，返回可以转发的新增可见文本。 */
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.raw.push_str(fragment);
        self.advance(true)
    }

    /** \brief 流结束：释放未成形的半个标签，丢弃未闭合的推理内容。 */
    pub fn finish(&mut self) -> Option<String> {
        self.advance(false)
    }

    pub fn state(&self) -> ThinkingState {
        self.state
    }

    #[cfg(test)]
    fn visible(&self) -> String {
        let (clean, _) = clean(&self.raw, true);
        clean.get(..self.forwarded).unwrap_or_default().to_string()
    }

    fn advance(&mut self, holdback: bool) -> Option<String> {
        let (clean, state) = clean(&self.raw, holdback);
        self.state = state;
        let delta = clean.get(self.forwarded..).filter(|d| !d.is_empty())?.to_string();
        self.forwarded = clean.len();
        Some(delta)
    }
}

/** \brief 一次性清洗完整文本。 */
pub fn strip_thinking(raw: &str) -> String {
    clean(raw, false).0
}

fn clean(raw: &str, holdback: bool) -> (String, ThinkingState) {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let Some(caps) = OPEN_TAG.captures(rest) else {
            let keep = if holdback {
                partial_open_start(rest)
            } else {
                rest.len()
            };
            out.push_str(&rest[..keep]);
            return (out, ThinkingState::Passthrough);
        };
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            return (out, ThinkingState::Passthrough);
        };
        out.push_str(&rest[..whole.start()]);
        let closer: &Regex = if name.as_str().eq_ignore_ascii_case("think") {
            &CLOSE_THINK
        } else {
            &CLOSE_REDACTED
        };
        let after_open = &rest[whole.end()..];
        match closer.find(after_open) {
            Some(close) => rest = &after_open[close.end()..],
            None => return (out, ThinkingState::Suppressed),
        }
    }
}

/** \brief 可能未写完的开标签起始位置，没有则为 text.len()。 */
fn partial_open_start(text: &str) -> usize {
    let Some(idx) = text.rfind('<') else {
        return text.len();
    };
    let tail = &text[idx + 1..];
    if tail.contains('>') {
        return text.len();
    }
    let lower = tail.to_ascii_lowercase();
    let pending = TAG_NAMES.iter().any(|name| {
        name.starts_with(lower.as_str())
            || lower
                .strip_prefix(name)
                .and_then(|after| after.chars().next())
                .is_some_and(char::is_whitespace)
    });
    if pending {
        idx
    } else {
        text.len()
    }
}

/**
 * \brief 消费 SSE 字节流，逐个转发过滤后的增量。
 *
 * `extract` 从每个 JSON 事件中取出增量文本；返回 Err 时立即中止。
 * 终止事件由调用方发送。
 * \return 过滤后的完整可见内容
 */
pub async fn decode_stream<S, B, E, F>(
    mut body: S,
    mut extract: F,
    sink: Option<&StreamSink>,
) -> Result<String, AiError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<AiError>,
    F: FnMut(&Value) -> Result<Option<String>, AiError>,
{
    let mut decoder = SseLineDecoder::new();
    let mut filter = ThinkingFilter::new();
    let mut content = String::new();

    let mut forward = |frames: Vec<SseFrame>, content: &mut String| -> Result<bool, AiError> {
        for frame in frames {
            let value = match frame {
                SseFrame::Done => return Ok(true),
                SseFrame::Data(value) => value,
            };
            if let Some(delta) = extract(&value)?.and_then(|fragment| filter.push(&fragment)) {
                content.push_str(&delta);
                if let Some(sink) = sink {
                    sink.chunk(&delta);
                }
            }
        }
        Ok(false)
    };

    let mut finished = false;
    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(Into::into)?;
        if forward(decoder.push(bytes.as_ref()), &mut content)? {
            finished = true;
            break;
        }
    }
    if !finished {
        forward(decoder.finish(), &mut content)?;
    }

    if let Some(tail) = filter.finish() {
        content.push_str(&tail);
        if let Some(sink) = sink {
            sink.chunk(&tail);
        }
    }
    if filter.state() == ThinkingState::Suppressed {
        tracing::debug!("stream ended inside an unterminated reasoning span");
    }
    Ok(content)
}

#[cfg(test)]
pub(crate) fn drain_events(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
