//! `via demo` - generate demo log traffic
//!
//! Emits a realistic mix of steady templates plus an error burst near the
//! end, either as JSONL on stdout or posted in batches to a running
//! ingest endpoint.

use std::process::ExitCode;

use chrono::Utc;
use clap::Args;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use tracing::{error, info};

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Number of events to generate
    #[arg(long, default_value_t = 500)]
    events: usize,

    /// Seconds of history to spread events over
    #[arg(long, default_value_t = 600)]
    span_sec: i64,

    /// Ingest endpoint; prints JSONL to stdout when omitted
    #[arg(long)]
    url: Option<String>,

    /// Events per posted batch
    #[arg(long, default_value_t = 50)]
    batch_size: usize,
}

const SERVICES: [&str; 4] = ["gateway", "billing", "auth", "search"];

fn steady_event(ts: i64, rng: &mut impl Rng) -> serde_json::Value {
    let service = *SERVICES.choose(rng).unwrap();
    let (level, message) = match rng.gen_range(0..4) {
        0 => (
            "INFO",
            format!(
                "connection established from 10.{}.{}.{}:{}",
                rng.gen_range(0..255),
                rng.gen_range(0..255),
                rng.gen_range(1..255),
                rng.gen_range(1024..65000)
            ),
        ),
        1 => (
            "INFO",
            format!("request {:08x} completed in {}ms", rng.gen::<u32>(), rng.gen_range(1..900)),
        ),
        2 => (
            "DEBUG",
            format!("cache lookup for key 'user:{}' hit", rng.gen_range(1..10_000)),
        ),
        _ => (
            "WARN",
            format!("slow query took {}ms on shard {}", rng.gen_range(900..3000), rng.gen_range(0..16)),
        ),
    };
    json!({"ts": ts, "service": service, "level": level, "message": message})
}

fn burst_event(ts: i64, rng: &mut impl Rng) -> serde_json::Value {
    json!({
        "ts": ts,
        "service": "gateway",
        "level": "ERROR",
        "message": format!("assertion failed at /app/src/router.c:{}", rng.gen_range(100..400)),
    })
}

pub async fn run(args: DemoArgs) -> ExitCode {
    let now = Utc::now().timestamp();
    let mut rng = rand::thread_rng();
    let burst = (args.events / 20).max(5);
    let steady = args.events.saturating_sub(burst);

    let mut events = Vec::with_capacity(args.events);
    for i in 0..steady {
        let ts = now - args.span_sec + (i as i64 * args.span_sec / steady.max(1) as i64);
        events.push(steady_event(ts, &mut rng));
    }
    for _ in 0..burst {
        events.push(burst_event(now - rng.gen_range(0..55), &mut rng));
    }

    match args.url {
        None => {
            for event in &events {
                println!("{event}");
            }
            ExitCode::SUCCESS
        }
        Some(url) => post_batches(&url, events, args.batch_size.max(1)).await,
    }
}

async fn post_batches(url: &str, events: Vec<serde_json::Value>, batch_size: usize) -> ExitCode {
    let client = reqwest::Client::new();
    let mut sent = 0usize;
    for chunk in events.chunks(batch_size) {
        let body = json!({"events": chunk});
        match client.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => sent += chunk.len(),
            Ok(response) => {
                error!(status = %response.status(), "ingest endpoint rejected batch");
                return ExitCode::from(3);
            }
            Err(err) => {
                error!(%err, "failed to reach ingest endpoint");
                return ExitCode::from(2);
            }
        }
    }
    info!(sent, "demo traffic delivered");
    ExitCode::SUCCESS
}
