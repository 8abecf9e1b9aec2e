use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use script_rewriter::transcription::Device;
use script_rewriter::{
    CancellationToken, Coordinator, ExtractedAudio, ExtractionRequest, PipelineEvent, PipelineOutcome,
    PipelineRequest, ProgressReporter, RewriteOutput, RewriteRequest, ShutdownPolicy, Stage, StageResult,
    StopOutcome, TranscriptionOutput, TranscriptionRequest,
};

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Hang,
}

struct FakeExtractor {
    behaviour: Behaviour,
    runs: AtomicUsize,
}

struct FakeTranscriber {
    behaviour: Behaviour,
    runs: AtomicUsize,
}

struct FakeRewriter {
    behaviour: Behaviour,
    runs: AtomicUsize,
}

/// Report a little progress, then behave as configured
async fn act<T>(
    behaviour: Behaviour,
    token: &CancellationToken,
    progress: &ProgressReporter,
    value: impl FnOnce() -> T,
) -> StageResult<T> {
    for percent in [10, 50, 100] {
        if progress.report(percent, "working").is_err() {
            return StageResult::Cancelled;
        }
    }
    match behaviour {
        Behaviour::Succeed => StageResult::Success(value()),
        Behaviour::Fail => StageResult::Failure("service unavailable".to_string()),
        Behaviour::Hang => match token.sleep(Duration::from_secs(30)).await {
            Ok(()) => StageResult::Success(value()),
            Err(_) => StageResult::Cancelled,
        },
    }
}

#[async_trait]
impl Stage for FakeExtractor {
    type Input = ExtractionRequest;
    type Output = ExtractedAudio;

    fn name(&self) -> &'static str {
        "extraction"
    }

    async fn run(
        &self,
        input: ExtractionRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<ExtractedAudio> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        act(self.behaviour, token, progress, || ExtractedAudio {
            audio_path: input.video_path.with_extension("wav"),
            duration: Some(12.0),
        })
        .await
    }
}

#[async_trait]
impl Stage for FakeTranscriber {
    type Input = TranscriptionRequest;
    type Output = TranscriptionOutput;

    fn name(&self) -> &'static str {
        "transcription"
    }

    async fn run(
        &self,
        input: TranscriptionRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<TranscriptionOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        assert_eq!(input.audio_path, PathBuf::from("clip.wav"));
        act(self.behaviour, token, progress, || TranscriptionOutput {
            text: "你好，今天天气不错。".to_string(),
            language: Some("zh".to_string()),
            duration: Some(12.0),
            word_count: 10,
            model_used: input.model.unwrap_or_else(|| "small".to_string()),
            device_used: Device::Cpu,
            attempt: 1,
        })
        .await
    }
}

#[async_trait]
impl Stage for FakeRewriter {
    type Input = RewriteRequest;
    type Output = RewriteOutput;

    fn name(&self) -> &'static str {
        "rewrite"
    }

    async fn run(
        &self,
        input: RewriteRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<RewriteOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        act(self.behaviour, token, progress, || RewriteOutput {
            rewritten_text: format!("{}快来试试吧！", input.text),
            original_text: input.text.clone(),
            model_used: input.model.clone().unwrap_or_else(|| "deepseek-r1:8b".to_string()),
            original_length: input.text.chars().count(),
            rewritten_length: input.text.chars().count() + 6,
            processing_time: 0.1,
        })
        .await
    }
}

struct Harness {
    extractor: Arc<FakeExtractor>,
    transcriber: Arc<FakeTranscriber>,
    rewriter: Arc<FakeRewriter>,
    coordinator: Arc<Coordinator<FakeExtractor, FakeTranscriber, FakeRewriter>>,
}

fn harness(extraction: Behaviour, transcription: Behaviour, rewrite: Behaviour) -> Harness {
    let extractor = Arc::new(FakeExtractor {
        behaviour: extraction,
        runs: AtomicUsize::new(0),
    });
    let transcriber = Arc::new(FakeTranscriber {
        behaviour: transcription,
        runs: AtomicUsize::new(0),
    });
    let rewriter = Arc::new(FakeRewriter {
        behaviour: rewrite,
        runs: AtomicUsize::new(0),
    });
    let policy = ShutdownPolicy {
        step: Duration::from_millis(50),
        ceiling: Duration::from_secs(2),
    };
    let coordinator = Arc::new(Coordinator::new(
        extractor.clone(),
        transcriber.clone(),
        rewriter.clone(),
        policy,
    ));
    Harness {
        extractor,
        transcriber,
        rewriter,
        coordinator,
    }
}

fn request() -> PipelineRequest {
    PipelineRequest {
        video_path: PathBuf::from("clip.mp4"),
        ..Default::default()
    }
}

async fn run(harness: &Harness, request: PipelineRequest) -> (PipelineOutcome, Vec<PipelineEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = harness.coordinator.process(request, tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn started(events: &[PipelineEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StageStarted(stage) => Some(*stage),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_full_pipeline_runs_in_order() {
    let h = harness(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    let (outcome, events) = run(&h, request()).await;

    let report = match outcome {
        PipelineOutcome::Completed(report) => report,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(report.audio.audio_path, PathBuf::from("clip.wav"));
    assert_eq!(report.transcription.text, "你好，今天天气不错。");
    assert_eq!(report.final_text(), "你好，今天天气不错。快来试试吧！");

    assert_eq!(started(&events), vec!["extraction", "transcription", "rewrite"]);

    // Progress for a stage only appears after that stage started, and never decreases.
    let mut current = None;
    let mut last_percent = 0;
    for event in &events {
        match event {
            PipelineEvent::StageStarted(stage) => {
                current = Some(*stage);
                last_percent = 0;
            }
            PipelineEvent::Progress { stage, percent, .. } => {
                assert_eq!(Some(*stage), current);
                assert!(*percent >= last_percent);
                last_percent = *percent;
            }
            PipelineEvent::Status { .. } => {}
        }
    }
    assert!(!h.coordinator.is_busy());
}

#[tokio::test]
async fn test_skip_rewrite() {
    let h = harness(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    let request = PipelineRequest {
        skip_rewrite: true,
        whisper_model: Some("tiny".to_string()),
        ..request()
    };
    let (outcome, events) = run(&h, request).await;

    match outcome {
        PipelineOutcome::Completed(report) => {
            assert!(report.rewrite.is_none());
            assert_eq!(report.transcription.model_used, "tiny");
            assert_eq!(report.final_text(), "你好，今天天气不错。");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(started(&events), vec!["extraction", "transcription"]);
    assert_eq!(h.rewriter.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failure_stops_the_pipeline() {
    let h = harness(Behaviour::Fail, Behaviour::Succeed, Behaviour::Succeed);
    let (outcome, events) = run(&h, request()).await;

    match outcome {
        PipelineOutcome::Failed { stage, message } => {
            assert_eq!(stage, "extraction");
            assert_eq!(message, "service unavailable");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(started(&events), vec!["extraction"]);
    assert_eq!(h.extractor.runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.transcriber.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.rewriter.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rewrite_failure_is_attributed_to_rewrite() {
    let h = harness(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Fail);
    let (outcome, _) = run(&h, request()).await;
    assert!(matches!(outcome, PipelineOutcome::Failed { stage: "rewrite", .. }));
}

#[tokio::test]
async fn test_stop_during_transcription() {
    let h = harness(Behaviour::Succeed, Behaviour::Hang, Behaviour::Succeed);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move { coordinator.process(request(), tx).await });

    // Wait until transcription is underway.
    while let Some(event) = rx.recv().await {
        if event == PipelineEvent::StageStarted("transcription") {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.coordinator.is_busy());

    assert_eq!(h.coordinator.stop().await, StopOutcome::Stopped);
    let outcome = run.await.unwrap();

    assert!(outcome.is_cancelled());
    assert!(matches!(outcome, PipelineOutcome::Cancelled { stage: "transcription" }));
    assert_eq!(h.rewriter.runs.load(Ordering::SeqCst), 0);
    assert!(!h.coordinator.is_busy());
}

#[tokio::test]
async fn test_stop_before_first_poll_is_honoured() {
    let h = harness(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let run = h.coordinator.process(request(), tx);
    assert_eq!(h.coordinator.stop().await, StopOutcome::Stopped);
    let outcome = run.await;

    assert!(matches!(outcome, PipelineOutcome::Cancelled { stage: "extraction" }));
    assert_eq!(h.extractor.runs.load(Ordering::SeqCst), 0);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_stop_when_idle() {
    let h = harness(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    assert_eq!(h.coordinator.stop().await, StopOutcome::Stopped);

    // A stop before a run does not poison the next run.
    let (outcome, _) = run(&h, request()).await;
    assert!(outcome.is_completed());
}
