//! Integration tests for AsyncEngine and its request streams.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use nano_serve::config::{CacheConfig, EngineConfig, SchedulerConfig};
use nano_serve::core::sequence::FinishReason;
use nano_serve::engine::{ExecuteModelRequest, ModelExecutor, SequenceOutput};
use nano_serve::{AsyncEngine, Error, GenerationRequest, LLMEngine, Result, SyntheticExecutor};

/// Fails on the given call, succeeds with a constant token otherwise.
struct FlakyExecutor {
    calls: usize,
    fail_on: usize,
}

#[async_trait]
impl ModelExecutor for FlakyExecutor {
    async fn execute_model(&mut self, request: ExecuteModelRequest) -> Result<Vec<SequenceOutput>> {
        self.calls += 1;
        if self.calls == self.fail_on {
            return Err(Error::Execution("device lost".to_string()));
        }
        Ok(request
            .seq_group_metadata_list
            .iter()
            .flat_map(|m| m.seq_data.keys())
            .map(|&seq_id| SequenceOutput {
                seq_id,
                token_ids: vec![7],
                finished: false,
            })
            .collect())
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        scheduler: SchedulerConfig {
            max_num_batched_tokens: 64,
            max_num_seqs: 8,
            max_model_len: 64,
            ..Default::default()
        },
        cache: CacheConfig {
            block_size: 4,
            num_gpu_blocks: 32,
            num_cpu_blocks: 8,
            sliding_window: None,
        },
        ..Default::default()
    }
}

fn started<E: ModelExecutor + 'static>(executor: E) -> AsyncEngine<E> {
    let engine = AsyncEngine::new(LLMEngine::new(engine_config(), executor).unwrap());
    engine.start_background_loop().unwrap();
    engine
}

async fn wait_until_idle<E: ModelExecutor + 'static>(engine: &AsyncEngine<E>) {
    for _ in 0..400 {
        if !engine.engine().lock().await.has_unfinished_requests() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine did not become idle");
}

#[tokio::test]
async fn test_stream_delivers_outputs_in_order() {
    let engine = started(SyntheticExecutor::new(3, 100));
    let mut stream = engine
        .generate(GenerationRequest::new("r", vec![1, 2, 3]).max_tokens(4))
        .unwrap();

    let mut lengths = Vec::new();
    while let Some(output) = stream.next_output().await {
        let output = output.unwrap();
        lengths.push(output.output_token_ids().len());
        assert_eq!(output.finished(), lengths.len() == 4);
    }

    assert_eq!(lengths, vec![1, 2, 3, 4]);
    assert!(stream.is_finished());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_all_finish() {
    let engine = started(SyntheticExecutor::new(11, 100));
    let streams: Vec<_> = (0..5u32)
        .map(|i| {
            engine
                .generate(GenerationRequest::new(format!("r{i}"), vec![i; 3]).max_tokens(3 + i as usize))
                .unwrap()
        })
        .collect();

    for (i, stream) in streams.into_iter().enumerate() {
        let outputs: Vec<_> = stream.collect().await;
        let last = outputs.last().unwrap().as_ref().unwrap();
        assert_eq!(last.request_id, format!("r{i}"));
        assert_eq!(last.output_token_ids().len(), 3 + i);
        assert_eq!(last.finish_reason, Some(FinishReason::Length));
        assert!(outputs.iter().all(|o| o.is_ok()));
    }
    wait_until_idle(&engine).await;
    let guard = engine.engine().lock().await;
    assert_eq!(guard.scheduler().block_manager().num_free_gpu_blocks(), 32);
}

#[tokio::test]
async fn test_ignored_prompt_completes_stream() {
    let engine = started(SyntheticExecutor::new(0, 100));
    let stream = engine
        .generate(GenerationRequest::new("big", vec![0; 100]))
        .unwrap();

    let output = stream.collect_final().await.unwrap();
    assert_eq!(output.finish_reason, Some(FinishReason::Ignored));
    assert!(output.output_token_ids().is_empty());
}

#[tokio::test]
async fn test_abort_unblocks_consumer_and_releases_blocks() {
    let engine = started(SyntheticExecutor::new(5, 100).with_step_delay(Duration::from_millis(2)));
    let mut stream = engine
        .generate(GenerationRequest::new("r", vec![1, 2, 3]).max_tokens(10_000))
        .unwrap();

    let first = stream.next_output().await.unwrap().unwrap();
    assert!(!first.finished());

    engine.abort("r");
    engine.abort("r");
    engine.abort("never-submitted");

    let mut last = None;
    while let Some(output) = stream.next_output().await {
        last = Some(output.unwrap());
    }
    assert_eq!(last.unwrap().finish_reason, Some(FinishReason::Aborted));

    wait_until_idle(&engine).await;
    let guard = engine.engine().lock().await;
    assert_eq!(guard.scheduler().block_manager().num_free_gpu_blocks(), 32);
}

#[tokio::test]
async fn test_dropping_stream_aborts_request() {
    let engine = started(SyntheticExecutor::new(5, 100).with_step_delay(Duration::from_millis(2)));
    let mut stream = engine
        .generate(GenerationRequest::new("r", vec![1, 2, 3]).max_tokens(10_000))
        .unwrap();
    stream.next_output().await.unwrap().unwrap();
    drop(stream);

    wait_until_idle(&engine).await;
    assert_eq!(engine.tracker().num_open_streams(), 0);
}

#[tokio::test]
async fn test_dropping_stale_stream_keeps_reused_id() {
    let engine = started(SyntheticExecutor::new(5, 100));
    let first = engine
        .generate(GenerationRequest::new("x", vec![1, 2]).max_tokens(1))
        .unwrap();

    // Finished on the engine side, but never read
    wait_until_idle(&engine).await;
    for _ in 0..400 {
        if engine.tracker().num_open_streams() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.tracker().num_open_streams(), 0);

    let second = engine
        .generate(GenerationRequest::new("x", vec![1, 2]).max_tokens(5))
        .unwrap();
    drop(first);

    let output = second.collect_final().await.unwrap();
    assert_eq!(output.finish_reason, Some(FinishReason::Length));
    assert_eq!(output.output_token_ids().len(), 5);
}

#[tokio::test]
async fn test_cancel_before_admission() {
    let engine = started(SyntheticExecutor::new(5, 100));
    let stream = engine
        .generate(GenerationRequest::new("r", vec![1, 2, 3]).max_tokens(10_000))
        .unwrap();
    engine.abort("r");

    let output = stream.collect_final().await.unwrap();
    assert_eq!(output.finish_reason, Some(FinishReason::Aborted));
    assert!(output.output_token_ids().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.engine().lock().await.get_num_unfinished_requests(), 0);
}

#[tokio::test]
async fn test_duplicate_request_id_rejected() {
    let engine = started(SyntheticExecutor::new(5, 100).with_step_delay(Duration::from_millis(2)));
    let _stream = engine
        .generate(GenerationRequest::new("r", vec![1]).max_tokens(10_000))
        .unwrap();

    assert!(matches!(
        engine.generate(GenerationRequest::new("r", vec![2])),
        Err(Error::DuplicateRequest(_))
    ));
    assert!(engine.is_running());
}

#[tokio::test]
async fn test_not_started_rejects_requests() {
    let engine = AsyncEngine::new(LLMEngine::new(engine_config(), SyntheticExecutor::new(0, 10)).unwrap());
    assert!(!engine.is_running());
    assert!(!engine.is_dead());
    assert!(matches!(
        engine.generate(GenerationRequest::new("r", vec![1])),
        Err(Error::EngineDead(_))
    ));
}

#[tokio::test]
async fn test_start_engine_loop_on_first_request() {
    let config = EngineConfig {
        start_engine_loop: true,
        ..engine_config()
    };
    let engine = AsyncEngine::new(LLMEngine::new(config, SyntheticExecutor::new(0, 10)).unwrap());

    let stream = engine
        .generate(GenerationRequest::new("r", vec![1]).max_tokens(2))
        .unwrap();
    assert!(engine.is_running());
    assert!(matches!(
        engine.start_background_loop(),
        Err(Error::LoopAlreadyRunning)
    ));

    let output = stream.collect_final().await.unwrap();
    assert_eq!(output.output_token_ids().len(), 2);
}

#[tokio::test]
async fn test_loop_failure_reaches_every_stream_once() {
    let engine = started(FlakyExecutor { calls: 0, fail_on: 1 });
    let mut a = engine.generate(GenerationRequest::new("a", vec![1])).unwrap();
    let mut b = engine.generate(GenerationRequest::new("b", vec![2])).unwrap();

    for stream in [&mut a, &mut b] {
        assert!(matches!(
            stream.next_output().await,
            Some(Err(Error::EngineDead(_)))
        ));
        assert!(stream.next_output().await.is_none());
    }

    assert!(engine.is_dead());
    assert!(matches!(
        engine.generate(GenerationRequest::new("c", vec![3])),
        Err(Error::EngineDead(_))
    ));

    // An explicit restart accepts requests again, ids included
    engine.start_background_loop().unwrap();
    let output = engine
        .generate(GenerationRequest::new("a", vec![1]).max_tokens(3))
        .unwrap()
        .collect_final()
        .await
        .unwrap();
    assert_eq!(output.output_token_ids(), &[7, 7, 7]);
    assert_eq!(output.finish_reason, Some(FinishReason::Length));
}

#[tokio::test]
async fn test_shutdown_aborts_open_streams() {
    let engine = started(SyntheticExecutor::new(5, 100).with_step_delay(Duration::from_millis(2)));
    let mut stream = engine
        .generate(GenerationRequest::new("r", vec![1, 2]).max_tokens(10_000))
        .unwrap();
    stream.next_output().await.unwrap().unwrap();

    engine.shutdown().await;
    assert!(!engine.is_running());

    let mut last = None;
    while let Some(output) = stream.next_output().await {
        last = Some(output.unwrap());
    }
    assert_eq!(last.unwrap().finish_reason, Some(FinishReason::Aborted));
    assert!(matches!(
        engine.generate(GenerationRequest::new("s", vec![1])),
        Err(Error::EngineDead(_))
    ));

    engine.start_background_loop().unwrap();
    let output = engine
        .generate(GenerationRequest::new("s", vec![1]).max_tokens(1))
        .unwrap()
        .collect_final()
        .await
        .unwrap();
    assert_eq!(output.finish_reason, Some(FinishReason::Length));
}
