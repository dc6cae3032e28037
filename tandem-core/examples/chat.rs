//! Example: Interactive chat over the tandem engine
//!
//! Streams single prompts as they decode. `/load "a.txt" "b.txt"` submits
//! several files at once and prints each reply when it completes; a single
//! quoted file is used as the next prompt. Ctrl+C cancels the running
//! generation, an empty line quits.
//!
//! Run with:
//!   cargo run --example chat -- HuggingFaceTB/SmolLM2-135M-Instruct
//!   cargo run --release --features cuda --example chat -- /models/llama 99 4096

use std::io::Write;

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tandem_core::{
    Engine, EngineConfig, Generation, LlamaEvaluator, Message, ModelOptions, Role,
    SamplingOptions,
};

/// Quoted file names following `/load`.
fn parse_load(line: &str) -> Option<Vec<String>> {
    let rest = line.trim().strip_prefix("/load")?;
    let names: Vec<String> = rest
        .split('"')
        .skip(1)
        .step_by(2)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

fn print_speeds(generation: &Generation) {
    if let Some(metrics) = generation.metrics() {
        println!(
            "Prompting {:.2} t/s | Sampling {:.2} t/s",
            metrics.prompting_speed, metrics.sampling_speed
        );
    }
}

async fn run_parallel(engine: &Engine, files: &[String]) -> Result<()> {
    let mut generations = Vec::new();
    for file in files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let options = SamplingOptions {
                    temperature: Some(0.5),
                    ..Default::default()
                };
                generations.push(engine.prompt(vec![Message::user(content)], &options)?);
            }
            Err(_) => println!("File \"{}\" not found.", file),
        }
    }

    let cancels: Vec<_> = generations.iter().map(Generation::cancel_handle).collect();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancels.iter().for_each(|c| c.cancel());
        }
    });

    // Non-streaming: collect raw bytes and decode once at the end
    let mut pending: FuturesUnordered<_> = generations
        .into_iter()
        .map(|mut generation| async move {
            let text = generation.collect_text().await;
            (generation, text)
        })
        .collect();

    while let Some((generation, text)) = pending.next().await {
        println!("{}", "=".repeat(80));
        print!("Request {} | ", generation.id());
        print_speeds(&generation);
        println!("{}", "-".repeat(80));
        let cancelled = generation.metrics().map_or(false, |m| m.cancelled);
        println!("{}{}", text, if cancelled { " [Cancelled]" } else { "" });
        println!("{}", "=".repeat(80));
    }

    watcher.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(model_path) = args.get(1) else {
        println!("Usage: chat <ModelPath> [GpuLayers] [CtxLength]");
        return Ok(());
    };
    let options = ModelOptions {
        gpu_layers: args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(0),
        context_length: args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(0),
        thread_count: 8,
        batch_thread_count: 8,
        use_flash_attention: true,
        ..Default::default()
    };

    println!("Loading model...");
    let evaluator = LlamaEvaluator::load(model_path, options).context("loading model")?;
    let engine = Engine::new(evaluator, EngineConfig::default())?;

    let info = engine.model_info();
    println!();
    println!("Model context length: {}", info.context_length);
    println!("Model training context length: {}", info.training_context_length);
    println!("Model layer count: {}", info.layer_count);
    println!();
    println!("Press <Ctrl+C> to cancel or press <Enter> with an empty input to quit.");

    let mut messages = vec![Message::system("You are a helpful assistant.")];
    let stdin = std::io::stdin();

    loop {
        let used = engine.tokenize(&messages)?.len();
        print!("[{}/{}]> ", used, engine.context_length());
        std::io::stdout().flush()?;

        let mut line = String::new();
        stdin.read_line(&mut line)?;
        let mut prompt = line.trim_end().replace("\\n", "\n");
        if prompt.trim().is_empty() {
            break;
        }

        if let Some(files) = parse_load(&prompt) {
            if files.len() > 1 {
                run_parallel(&engine, &files).await?;
                continue;
            }
            match std::fs::read_to_string(&files[0]) {
                Ok(content) => prompt = content,
                Err(_) => {
                    println!("File \"{}\" not found.", files[0]);
                    continue;
                }
            }
        }

        messages.push(Message::user(prompt));
        let options = SamplingOptions {
            top_k: Some(50),
            top_p: Some(0.95),
            temperature: Some(0.7),
            ..Default::default()
        };
        let generation = engine.prompt(messages.clone(), &options)?;
        let id = generation.id();
        let mut stream = generation.text_stream();
        let cancel = stream.cancel_handle();

        // Streaming: the text stream reassembles multi-byte characters
        let mut reply = String::new();
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(text) => {
                        print!("{}", text);
                        std::io::stdout().flush()?;
                        reply.push_str(&text);
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
            }
        }

        let cancelled = stream.metrics().map_or(false, |m| m.cancelled);
        println!("{}", if cancelled { " [Cancelled]" } else { "" });
        if let Some(metrics) = stream.metrics() {
            println!(
                "\nRequest {} | Prompting {:.2} t/s | Sampling {:.2} t/s",
                id, metrics.prompting_speed, metrics.sampling_speed
            );
        }
        if !reply.is_empty() {
            messages.push(Message::new(Role::Assistant, reply));
        }
    }

    println!("Bye.");
    Ok(())
}
