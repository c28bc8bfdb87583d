use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nano_serve::engine::ModelExecutor;
use nano_serve::{
    AsyncEngine, EngineConfig, GenerationRequest, LLMEngine, Result, SyntheticExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Run a synthetic workload through the continuous-batching engine")]
struct Args {
    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short, long, default_value = "32")]
    num_requests: usize,

    /// Maximum prompt length in tokens
    #[arg(long, default_value = "128")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Chance that a sequence stops on any step
    #[arg(long, default_value = "0.02")]
    finish_probability: f64,

    /// Simulated execution time per iteration, in milliseconds
    #[arg(long, default_value = "0")]
    step_delay_ms: u64,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    info!(version = env!("CARGO_PKG_VERSION"), ?config, "starting nano-serve");

    let mut executor = SyntheticExecutor::new(args.seed, 32_000)
        .with_finish_probability(args.finish_probability);
    if args.step_delay_ms > 0 {
        executor = executor.with_step_delay(Duration::from_millis(args.step_delay_ms));
    }
    let executor: Box<dyn ModelExecutor> = Box::new(executor);

    let engine = AsyncEngine::new(LLMEngine::new(config, executor)?);
    engine.start_background_loop()?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut streams = Vec::with_capacity(args.num_requests);
    for i in 0..args.num_requests {
        let prompt_len = rng.gen_range(1..=args.prompt_len.max(1));
        let prompt: Vec<u32> = (0..prompt_len).map(|_| rng.gen_range(0..32_000)).collect();
        let request = GenerationRequest::new(format!("req-{i}"), prompt).max_tokens(args.max_tokens);
        streams.push(engine.generate(request)?);
    }

    let start = Instant::now();
    let results = join_all(streams.into_iter().map(|s| s.collect_final())).await;
    let elapsed = start.elapsed();

    let mut generated = 0;
    let mut by_reason = BTreeMap::new();
    for result in results {
        let output = result?;
        generated += output.outputs.iter().map(|o| o.token_ids.len()).sum::<usize>();
        let reason = output.finish_reason.map_or("none", |r| r.as_str());
        *by_reason.entry(reason).or_insert(0usize) += 1;
    }

    let summary = engine.engine().lock().await;
    let bm = summary.scheduler().block_manager();
    println!("requests:         {}", args.num_requests);
    println!("generated tokens: {}", generated);
    println!("elapsed:          {:.2?}", elapsed);
    println!(
        "throughput:       {:.1} tok/s",
        generated as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    for (reason, count) in &by_reason {
        println!("finished ({reason}): {count}");
    }
    println!(
        "free blocks:      gpu {}/{} cpu {}/{}",
        bm.num_free_gpu_blocks(),
        bm.num_total_gpu_blocks(),
        bm.num_free_cpu_blocks(),
        bm.num_total_cpu_blocks()
    );
    drop(summary);

    engine.shutdown().await;
    Ok(())
}
