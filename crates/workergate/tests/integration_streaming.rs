//! Integration tests for streamed chat completions
//!
//! Drives scripted worker turns through the SSE stream driver and checks
//! the chunk sequence a client would see

mod common;

use common::{eventually, fast_config, setup};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;
use workergate::testing::{TurnScript, collect_sse, sse_json, streamed_content};
use workergate::{ChatTurn, StopAfterTools, StreamConfig, StreamOptions, stream_chat_completion};

fn options(config: StreamConfig) -> StreamOptions {
    StreamOptions::new("gpt-test")
        .with_completion_id("chatcmpl-test")
        .with_config(config.with_keepalive(None))
}

fn finish_reasons(chunks: &[Value]) -> Vec<String> {
    chunks
        .iter()
        .filter_map(|c| c.pointer("/choices/0/finish_reason").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_plain_text_stream() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(TurnScript::new().delta("Hello").complete(Some("stop")));

    let turn = transport.create_chat_request(ChatTurn::new("hi")).await.unwrap();
    let payloads = collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await;

    assert_eq!(payloads.len(), 4);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let chunks = sse_json(&payloads);
    assert_eq!(chunks[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(chunks[1]["choices"][0]["delta"], json!({"content": "Hello"}));
    assert_eq!(chunks[2]["choices"][0]["delta"], json!({}));
    assert_eq!(finish_reasons(&chunks), vec!["stop"]);
    for chunk in &chunks {
        assert_eq!(chunk["id"], "chatcmpl-test");
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "gpt-test");
    }
}

#[tokio::test]
async fn test_tool_call_deltas_are_cumulative() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .event(json!({"type": "tool_call_delta", "call_id": "call_1", "name": "lookup", "delta": "{\"id\":"}))
            .event(json!({"type": "tool_call_delta", "call_id": "call_1", "delta": "\"42\"}"}))
            .complete(Some("tool_calls")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let payloads = collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await;
    let chunks = sse_json(&payloads);

    assert_eq!(chunks.len(), 4);
    let first = &chunks[1]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(first["id"], "call_1");
    assert_eq!(first["type"], "function");
    assert_eq!(first["function"]["name"], "lookup");
    assert_eq!(first["function"]["arguments"], "{\"id\":");
    let second = &chunks[2]["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(second["function"]["arguments"], "{\"id\":\"42\"}");
    assert_eq!(finish_reasons(&chunks), vec!["tool_calls"]);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn test_worker_exit_after_output_finishes_with_length() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(TurnScript::new().delta("partial answer").crash());

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let payloads = collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await;
    let chunks = sse_json(&payloads);

    assert_eq!(streamed_content(&chunks), "partial answer");
    assert_eq!(finish_reasons(&chunks), vec!["length"]);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(transport.active_turns(), 0);
}

#[tokio::test]
async fn test_worker_exit_before_output_sends_error_chunk() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(TurnScript::new().crash());

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let payloads = collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await;
    let chunks = sse_json(&payloads);

    let error = chunks.last().unwrap();
    assert_eq!(error["error"]["code"], "worker_exited");
    assert_eq!(error["error"]["retryable"], true);
    assert!(finish_reasons(&chunks).is_empty());
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn test_stop_after_first_tool_block() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .delta("Run:<use_tool>{\"a\":1}</use_tool><use_tool>{\"b\":2}</use_tool>")
            .delta(" trailing")
            .complete(Some("stop")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let config = StreamConfig::new().with_stop_after_tools(StopAfterTools::First);
    let payloads = collect_sse(stream_chat_completion(turn, options(config))).await;
    let chunks = sse_json(&payloads);

    assert_eq!(streamed_content(&chunks), "Run:<use_tool>{\"a\":1}</use_tool>");
    assert!(payloads.iter().all(|p| !p.contains("\\\"b\\\"")));
    assert_eq!(finish_reasons(&chunks), vec!["tool_calls"]);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert!(eventually(Duration::from_secs(1), || transport.active_turns() == 0).await);
}

#[tokio::test]
async fn test_partial_open_tag_is_withheld_across_deltas() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .delta("abc<use")
            .delta("_tool>x</use_tool>def")
            .complete(Some("stop")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let payloads = collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await;
    let chunks = sse_json(&payloads);

    let contents: Vec<&str> = chunks
        .iter()
        .filter_map(|c| c.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .collect();
    assert_eq!(contents, vec!["abc", "<use_tool>x</use_tool>def"]);
    assert_eq!(finish_reasons(&chunks), vec!["tool_calls"]);
}

#[tokio::test]
async fn test_burst_cutoff_after_quiet_period() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .delta("<use_tool>1</use_tool>")
            .sleep(Duration::from_millis(10))
            .delta("<use_tool>2</use_tool>")
            .delta("tail text"),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let config = StreamConfig::new().with_stop_after_tools(StopAfterTools::Burst {
        grace: Duration::from_millis(100),
    });
    let payloads = collect_sse(stream_chat_completion(turn, options(config))).await;
    let chunks = sse_json(&payloads);

    assert_eq!(
        streamed_content(&chunks),
        "<use_tool>1</use_tool><use_tool>2</use_tool>"
    );
    assert_eq!(finish_reasons(&chunks), vec!["tool_calls"]);
    assert!(eventually(Duration::from_secs(1), || transport.active_turns() == 0).await);
}

#[tokio::test]
async fn test_usage_chunk_when_requested() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .delta("hi")
            .usage(3, 2)
            .message("hi")
            .complete(Some("stop")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let stream = stream_chat_completion(
        turn,
        options(StreamConfig::new()).with_include_usage(true),
    );
    let chunks = sse_json(&collect_sse(stream).await);

    let usage = chunks.last().unwrap();
    assert_eq!(usage["choices"], json!([]));
    assert_eq!(usage["usage"]["prompt_tokens"], 3);
    assert_eq!(usage["usage"]["completion_tokens"], 2);
    assert_eq!(usage["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn test_idle_timeout_ends_stream_with_error() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(TurnScript::new());

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let config = StreamConfig::new().with_idle_timeout(Duration::from_millis(50));
    let payloads = collect_sse(stream_chat_completion(turn, options(config))).await;
    let chunks = sse_json(&payloads);

    assert_eq!(chunks.last().unwrap()["error"]["code"], "stream_idle_timeout");
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(transport.active_turns(), 0);
}

#[tokio::test]
async fn test_keepalive_comments_while_waiting() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .sleep(Duration::from_millis(120))
            .delta("late")
            .complete(Some("stop")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let stream = stream_chat_completion(
        turn,
        StreamOptions::new("gpt-test")
            .with_config(StreamConfig::new().with_keepalive(Some(Duration::from_millis(25)))),
    );
    let frames: Vec<String> = stream
        .map(|frame| String::from_utf8_lossy(&frame).into_owned())
        .collect()
        .await;

    assert!(frames.iter().any(|f| f == ": keepalive\n\n"));
    assert_eq!(frames.last().map(String::as_str), Some("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_dropping_stream_cancels_turn() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(TurnScript::new().delta("started"));

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let mut stream = stream_chat_completion(turn, options(StreamConfig::new()));
    let first = stream.next().await.unwrap();
    assert!(String::from_utf8_lossy(&first).contains("\"role\":\"assistant\""));
    drop(stream);

    assert!(eventually(Duration::from_secs(1), || transport.active_turns() == 0).await);
    assert!(
        eventually(Duration::from_secs(1), || {
            !worker.requests_for("removeConversationListener").is_empty()
        })
        .await
    );
}

#[tokio::test]
async fn test_final_message_fills_missing_tail() {
    let (worker, transport) = setup(fast_config());
    worker.push_script(
        TurnScript::new()
            .delta("Hel")
            .message("Hello there")
            .complete(Some("stop")),
    );

    let turn = transport.create_chat_request(ChatTurn::new("x")).await.unwrap();
    let chunks = sse_json(&collect_sse(stream_chat_completion(turn, options(StreamConfig::new()))).await);
    assert_eq!(streamed_content(&chunks), "Hello there");
    assert_eq!(finish_reasons(&chunks), vec!["stop"]);
}
