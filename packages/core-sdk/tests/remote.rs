mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use modelrace_core_sdk::prelude::*;

fn remote_config(server_url: String, fallback_to_local: bool) -> RemoteConfig {
    RemoteConfig {
        enabled: true,
        server_url,
        timeout_ms: 2_000,
        retry_attempts: 3,
        retry_delay_ms: 10,
        fallback_to_local,
    }
}

fn remote_dispatcher(engine: Engine, config: RemoteConfig) -> Dispatcher {
    Dispatcher::new(engine, Arc::new(StaticRemoteConfig(config)))
}

fn single(model: &str) -> ExecutionRequest {
    ExecutionRequest::new(
        ExecutionMode::Single,
        vec![Message::user("hi")],
        ExecutionConfig::with_models([model]),
    )
}

#[tokio::test]
async fn remote_execute_retries_server_errors() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&remote)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .and(body_partial_json(json!({"mode": "single", "config": {"models": ["p/m"]}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "content": "from server",
            "providerId": "p",
            "fullModelId": "p/m",
        })))
        .expect(1)
        .mount(&remote)
        .await;

    let dispatcher = remote_dispatcher(engine(vec![]), remote_config(remote.uri(), false));
    let result = dispatcher
        .dispatch(single("p/m"))
        .await
        .and_then(DispatchOutput::into_completion)
        .expect("completion");
    assert_eq!(result.content, "from server");
    assert_eq!(result.full_model_id, "p/m");
    assert!(!result.streamed);
}

#[tokio::test]
async fn remote_attempts_time_out_individually() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"content": "too late"}))
                .set_delay(Duration::from_millis(800)),
        )
        .expect(3)
        .mount(&remote)
        .await;

    let config = RemoteConfig {
        timeout_ms: 200,
        retry_attempts: 3,
        retry_delay_ms: 50,
        ..remote_config(remote.uri(), false)
    };
    let dispatcher = remote_dispatcher(engine(vec![]), config);
    let started = Instant::now();
    let err = dispatcher.dispatch(single("p/m")).await.expect_err("timed out");
    let elapsed = started.elapsed();

    assert_eq!(err, AiError::Network("timeout".into()));
    // three 200ms windows plus 50ms and 100ms of backoff
    assert!(elapsed >= Duration::from_millis(750), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_400), "{elapsed:?}");
}

#[tokio::test]
async fn remote_cancel_during_backoff_stops_retrying() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&remote)
        .await;

    let config = RemoteConfig {
        retry_attempts: 3,
        retry_delay_ms: 5_000,
        ..remote_config(remote.uri(), true)
    };
    let dispatcher = remote_dispatcher(engine(vec![]), config);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = dispatcher
        .dispatch(single("p/m").with_cancel(cancel))
        .await
        .expect_err("cancelled");

    assert_eq!(err, AiError::Cancelled("Request cancelled".into()));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn remote_auth_failure_is_not_retried() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&remote)
        .await;

    let dispatcher = remote_dispatcher(engine(vec![]), remote_config(remote.uri(), false));
    let err = dispatcher.dispatch(single("p/m")).await.expect_err("unauthorized");
    assert_eq!(
        err,
        AiError::Auth {
            message: "Unauthorized - Check server authentication".into(),
            provider: "Server".into()
        }
    );
}

#[tokio::test]
async fn remote_failure_falls_back_to_local() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/stream"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&remote)
        .await;
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("local answer")))
        .expect(1)
        .mount(&provider)
        .await;

    let engine = engine(vec![openai("p1", format!("{}/chat", provider.uri()))]);
    let dispatcher = remote_dispatcher(engine, remote_config(remote.uri(), true));
    let (sink, mut rx) = StreamSink::channel();
    let result = dispatcher
        .dispatch(single("p1/m1").with_stream(sink))
        .await
        .and_then(DispatchOutput::into_completion)
        .expect("local fallback");

    assert_eq!(result.full_model_id, "p1/m1");
    let events = drain(&mut rx);
    assert_eq!(chunks(&events), "local answer");
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn remote_failure_without_fallback_propagates() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ai/execute"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&remote)
        .await;

    let config = RemoteConfig {
        retry_attempts: 1,
        ..remote_config(remote.uri(), false)
    };
    let dispatcher = remote_dispatcher(engine(vec![]), config);
    let err = dispatcher.dispatch(single("p1/m1")).await.expect_err("no fallback");
    assert_eq!(err.status_code(), Some(502));
    assert_eq!(err.provider(), Some("Server"));
}

#[tokio::test]
async fn remote_stream_forwards_chunks() {
    let remote = MockServer::start().await;
    let body = "data: {\"chunk\":\"Hi\"}\n\ndata: {\"chunk\":\" there\"}\n\ndata: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/api/ai/stream"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&remote)
        .await;

    let dispatcher = remote_dispatcher(engine(vec![]), remote_config(remote.uri(), false));
    let (sink, mut rx) = StreamSink::channel();
    let result = dispatcher
        .dispatch(single("p/m").with_stream(sink))
        .await
        .and_then(DispatchOutput::into_completion)
        .expect("stream");

    assert_eq!(result.content, "Hi there");
    assert!(result.streamed);
    assert_eq!(
        drain(&mut rx),
        vec![
            StreamEvent::Chunk { chunk: "Hi".into() },
            StreamEvent::Chunk {
                chunk: " there".into()
            },
            StreamEvent::Done {
                final_content: "Hi there".into()
            },
        ]
    );
}

#[tokio::test]
async fn remote_stream_error_event_is_not_replayed_locally() {
    let remote = MockServer::start().await;
    let body = "data: {\"chunk\":\"par\"}\n\ndata: {\"error\":\"quota\",\"statusCode\":429}\n\n";
    Mock::given(method("POST"))
        .and(path("/api/ai/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&remote)
        .await;

    let dispatcher = remote_dispatcher(engine(vec![]), remote_config(remote.uri(), true));
    let (sink, mut rx) = StreamSink::channel();
    let err = dispatcher
        .dispatch(single("p/m").with_stream(sink))
        .await
        .expect_err("stream error");
    assert!(matches!(err, AiError::RateLimit { .. }));
    assert_eq!(
        drain(&mut rx),
        vec![
            StreamEvent::Chunk { chunk: "par".into() },
            StreamEvent::Error {
                error: "quota".into()
            },
        ]
    );
}

#[tokio::test]
async fn execution_server_roundtrip() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("served locally")))
        .mount(&provider)
        .await;

    let server_engine = engine(vec![openai("p1", format!("{}/chat", provider.uri()))]);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(server::serve(
        listener,
        Arc::new(Dispatcher::local_only(server_engine)),
    ));

    let client = RemoteClient::new(&remote_config(format!("http://{addr}"), false));
    client.health_check().await.expect("healthy");

    let dispatcher = remote_dispatcher(engine(vec![]), remote_config(format!("http://{addr}"), false));
    let result = dispatcher
        .dispatch(single("p1/m1"))
        .await
        .and_then(DispatchOutput::into_completion)
        .expect("execute");
    assert_eq!(result.content, "served locally");
    assert_eq!(result.full_model_id, "p1/m1");

    let (sink, mut rx) = StreamSink::channel();
    let streamed = dispatcher
        .dispatch(single("p1/m1").with_stream(sink))
        .await
        .and_then(DispatchOutput::into_completion)
        .expect("stream");
    assert_eq!(streamed.content, "served locally");
    assert_eq!(chunks(&drain(&mut rx)), "served locally");

    let report = dispatcher
        .dispatch(ExecutionRequest::new(
            ExecutionMode::TestRace,
            vec![Message::user("ping")],
            ExecutionConfig::with_models(["p1/m1", "nope/m"]),
        ))
        .await
        .and_then(DispatchOutput::into_race_report)
        .expect("report");
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].status, RaceStatus::Ok);
    assert_eq!(report[1].status, RaceStatus::Error(404));
}
