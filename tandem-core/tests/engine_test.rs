mod common;

use std::time::Duration;

use common::ScriptedEvaluator;
use futures::StreamExt;
use tandem_core::*;

fn arithmetic_engine() -> Engine {
    let evaluator = ScriptedEvaluator::with_chars("2+=4")
        .then("=", "4")
        .then("4", "");
    Engine::new(evaluator, EngineConfig::default()).expect("engine starts")
}

#[tokio::test]
async fn test_prompt_collects_text() {
    let engine = arithmetic_engine();

    let mut generation = engine
        .prompt(vec![Message::user("2+2=")], &SamplingOptions::greedy())
        .expect("submit");
    let text = generation.collect_text().await;

    assert_eq!(text, "4");
    let metrics = generation.metrics().expect("metrics");
    assert!(!metrics.cancelled);
    assert_eq!(metrics.stop_reason, StopReason::EndOfSequence);
}

#[tokio::test]
async fn test_invalid_options_rejected_before_queueing() {
    let engine = arithmetic_engine();
    let options = SamplingOptions {
        top_k: Some(-3),
        ..Default::default()
    };

    let result = engine.prompt(vec![Message::user("2+2=")], &options);
    assert!(matches!(result, Err(Error::Config(ConfigError::NegativeTopK(-3)))));
    assert_eq!(engine.stats().queued_requests, 0);
}

#[tokio::test]
async fn test_text_stream_reassembles_split_characters() {
    // "é" arrives as two tokens carrying one byte each
    let mut evaluator = ScriptedEvaluator::with_chars("x");
    let lead = evaluator.add_piece(&[0xC3]);
    let tail = evaluator.add_piece(&[0xA9]);
    let x = evaluator.id("x");
    let evaluator = evaluator
        .then_token(x, lead)
        .then_token(lead, tail)
        .then_token(tail, common::EOS);
    let engine = Engine::new(evaluator, EngineConfig::default()).expect("engine starts");

    let generation = engine
        .prompt(vec![Message::user("x")], &SamplingOptions::greedy())
        .expect("submit");
    let mut stream = generation.text_stream();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    assert_eq!(chunks, vec!["é".to_string()]);
    assert_eq!(stream.metrics().map(|m| m.generated_tokens), Some(2));
}

#[tokio::test]
async fn test_many_parallel_prompts_complete() {
    let engine = arithmetic_engine();

    let handles: Vec<Generation> = (0..12)
        .map(|_| {
            engine
                .prompt(vec![Message::user("2+2=")], &SamplingOptions::greedy())
                .expect("submit")
        })
        .collect();

    let texts = futures::future::join_all(handles.into_iter().map(|mut g| async move {
        g.collect_text().await
    }))
    .await;

    assert!(texts.iter().all(|t| t == "4"));
    let stats = engine.stats();
    assert_eq!(stats.completed_requests, 12);
    assert_eq!(stats.active_slots, 0);
}

#[tokio::test]
async fn test_cancel_handle_stops_endless_generation() {
    let evaluator = ScriptedEvaluator::with_chars("ab")
        .then("a", "b")
        .then("b", "a");
    let engine = Engine::new(evaluator.context(1 << 20), EngineConfig::default())
        .expect("engine starts");

    let mut generation = engine
        .prompt(vec![Message::user("a")], &SamplingOptions::greedy())
        .expect("submit");
    let cancel = generation.cancel_handle();

    let first = generation.next_fragment().await;
    assert_eq!(first, Some(b"b".to_vec()));
    cancel.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(5), generation.collect_text())
        .await
        .expect("generation stops after cancel");
    assert!(rest.len() < 1 << 20);

    let metrics = generation.metrics().expect("metrics");
    assert!(metrics.cancelled);
    assert_eq!(metrics.stop_reason, StopReason::Cancelled);
}

#[tokio::test]
async fn test_dropping_engine_cancels_outstanding_work() {
    let evaluator = ScriptedEvaluator::with_chars("ab")
        .then("a", "b")
        .then("b", "a")
        .context(1 << 20);
    let engine = Engine::new(evaluator, EngineConfig::with_max_parallel(1)).expect("engine starts");

    let mut running = engine
        .prompt(vec![Message::user("a")], &SamplingOptions::greedy())
        .expect("submit");
    let mut queued = engine
        .prompt(vec![Message::user("b")], &SamplingOptions::greedy())
        .expect("submit");

    assert!(running.next_fragment().await.is_some());
    drop(engine);

    running.collect_text().await;
    assert!(running.metrics().map_or(false, |m| m.cancelled));

    let text = queued.collect_text().await;
    assert!(text.is_empty());
    assert!(queued.metrics().map_or(false, |m| m.cancelled));
}

#[tokio::test]
async fn test_nan_logits_fail_only_that_request() {
    let evaluator = ScriptedEvaluator::with_chars("abc")
        .then("b", "c")
        .then("c", "")
        .nan_after("a");
    let engine = Engine::new(evaluator, EngineConfig::default()).expect("engine starts");

    let mut poisoned = engine
        .prompt(vec![Message::user("a")], &SamplingOptions::default())
        .expect("submit");
    let mut healthy = engine
        .prompt(vec![Message::user("b")], &SamplingOptions::greedy())
        .expect("submit");

    assert_eq!(poisoned.collect_text().await, "");
    let metrics = poisoned.metrics().expect("metrics");
    assert!(matches!(&metrics.stop_reason, StopReason::Failed(msg) if msg.contains("NaN")));
    assert!(!metrics.cancelled);

    assert_eq!(healthy.collect_text().await, "c");

    // The decode thread is still serving
    let mut later = engine
        .prompt(vec![Message::user("b")], &SamplingOptions::greedy())
        .expect("submit");
    assert_eq!(later.collect_text().await, "c");
}

#[tokio::test]
async fn test_decode_thread_panic_stops_engine() {
    let evaluator = ScriptedEvaluator::with_chars("ab")
        .then("b", "")
        .crash_after("a");
    let engine = Engine::new(evaluator, EngineConfig::default()).expect("engine starts");

    let mut doomed = engine
        .prompt(vec![Message::user("a")], &SamplingOptions::greedy())
        .expect("submit");
    let text = tokio::time::timeout(Duration::from_secs(5), doomed.collect_text())
        .await
        .expect("request finishes after the panic");
    assert!(text.is_empty());
    assert!(matches!(
        doomed.metrics().map(|m| &m.stop_reason),
        Some(StopReason::Failed(_))
    ));

    let result = engine.prompt(vec![Message::user("b")], &SamplingOptions::greedy());
    assert!(matches!(result, Err(Error::EngineStopped)));
}

#[tokio::test]
async fn test_engine_reports_model_and_tokenizes_conversations() {
    let evaluator = ScriptedEvaluator::with_chars("2+=4\n").context(32);
    let engine = Engine::new(evaluator, EngineConfig::default()).expect("engine starts");

    let info = engine.model_info();
    assert_eq!(engine.context_length(), 32);
    assert_eq!(info.training_context_length, 32);
    assert_eq!(info.layer_count, 2);
    assert_eq!(info.chat_template, ChatTemplate::Raw);

    // Raw template joins contents with newlines, one token per character
    let messages = vec![Message::system("2+2="), Message::user("4")];
    let tokens = engine.tokenize(&messages).expect("tokenize");
    assert_eq!(tokens.len(), "2+2=\n4".len());

    assert!(matches!(
        engine.tokenize(&[Message::user("x")]),
        Err(Error::Tokenization(_))
    ));
}
