#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use modelrace_core_sdk::prelude::*;
use modelrace_core_sdk::simulator::SimulatorOptions;

/// OpenAI-compatible provider whose endpoint lives on a mock server.
pub fn openai(id: &str, endpoint: String) -> ProviderConfig {
    ProviderConfig {
        provider_id: id.to_string(),
        name: format!("{id} provider"),
        provider_type: ProviderType::OpenaiCompatible,
        api_key: Some("sk-test".to_string()),
        base_url: endpoint,
        default_base_url: String::new(),
        temperature: None,
        max_tokens: None,
        models: vec![ModelDescriptor {
            id: "m1".to_string(),
            display_name: "Model One".to_string(),
        }],
    }
}

pub fn engine(providers: Vec<ProviderConfig>) -> Engine {
    Engine::new(Arc::new(InMemoryRegistry::new(providers)), Arc::new(DefaultLang)).with_simulator(
        SimulatorOptions {
            chunk_size: 4,
            delay: Duration::ZERO,
            punctuation_pause: Duration::ZERO,
        },
    )
}

pub fn completion(content: &str) -> Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

pub fn sse(frames: &[Value]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&format!("data: {frame}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn delta(text: &str) -> Value {
    json!({ "choices": [{ "delta": { "content": text } }] })
}

pub fn drain(rx: &mut UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn chunks(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}
