// civbot -- the municipal portal chatbot's intent engine.
//
// Commands:
//   civbot train [--dir PATH]       Train a replacement model bundle
//   civbot ask <text> [--dir PATH]  Classify one query and print the result
//   civbot serve [--dir PATH]       Persistent stdin/stdout chat loop
//
// The bundle lives under --dir (default "model_store") as three artifacts:
// model/topology, model/weights, model/metadata.

use std::io::{self, BufRead, Write};

use anyhow::Result;
use candle_core::Device;

use civbot::engine::IntentEngine;
use civbot::store::FsBundleStore;
use civbot::training::{train, TrainConfig};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (dir, rest) = parse_dir(&args);

    match rest.first().map(String::as_str) {
        Some("train") => cmd_train(&dir),
        Some("ask") if rest.len() > 1 => cmd_ask(&dir, &rest[1..].join(" ")),
        Some("serve") => cmd_serve(&dir),
        _ => {
            eprintln!("usage: civbot <train|ask <text>|serve> [--dir PATH]");
            Ok(())
        }
    }
}

/// Pull `--dir PATH` out of the args, returning (dir, remaining args).
fn parse_dir(args: &[String]) -> (String, Vec<String>) {
    let mut dir = "model_store".to_string();
    let mut rest = Vec::new();
    let mut skip_next = false;

    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--dir" {
            if let Some(next) = args.get(i + 1) {
                dir = next.clone();
                skip_next = true;
                continue;
            }
        }
        rest.push(arg.clone());
    }
    (dir, rest)
}

fn cmd_train(dir: &str) -> Result<()> {
    let store = FsBundleStore::new(dir);
    let report = train(&store, &TrainConfig::full(), &Device::Cpu, &mut |status| {
        println!("[{:>3}%] {}", status.progress_percent, status.status);
    })?;
    println!(
        "done: {} epochs, best_loss={:.4}{}",
        report.epochs_run,
        report.best_loss,
        if report.stopped_early {
            " (early stop)"
        } else {
            ""
        }
    );
    Ok(())
}

fn cmd_ask(dir: &str, text: &str) -> Result<()> {
    let store = FsBundleStore::new(dir);
    let engine = IntentEngine::new(store, Device::Cpu);
    let prediction = engine.predict(text)?;

    println!(
        "intent: {} (confidence {:.3})",
        prediction.intent, prediction.confidence
    );
    println!("response: {}", prediction.response);

    // Display ranking is a caller concern; the engine reports model order.
    let mut ranked = prediction.all_probabilities;
    ranked.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for score in ranked {
        println!("  {:<20} {:.4}", score.intent, score.probability);
    }
    Ok(())
}

fn cmd_serve(dir: &str) -> Result<()> {
    let store = FsBundleStore::new(dir);
    let engine = IntentEngine::new(store, Device::Cpu);
    if let Err(err) = engine.preload() {
        eprintln!("[serve] model not ready: {err}");
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    println!("civbot ready. Type a question, or 'quit' to exit.");
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        writeln!(stdout, "{}", engine.respond(line))?;
        stdout.flush()?;
    }
    Ok(())
}
