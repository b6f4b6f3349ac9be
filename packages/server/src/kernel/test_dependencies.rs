// TestDependencies - mock stage executors for testing
//
// Each mock replays scripted outcomes in order, then falls back to a canned
// success. Calls are recorded so tests can assert on attempts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::deps::StageExecutors;
use super::traits::{
    AudioRef, BaseAudioExtractor, BaseDownloader, BaseTranscriber, DownloadedMedia, ExtractedAudio,
    FailureKind, MediaRef, StageContext, StageFailure, Transcription,
};
use crate::kernel::jobs::{ModelSize, Segment};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted outcome.
#[derive(Debug, Clone)]
enum Step<T> {
    Return(Result<T, StageFailure>),
    Panic(String),
}

#[derive(Debug)]
struct Script<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<u32>,
    running: Mutex<u32>,
    peak_running: Mutex<u32>,
}

/// Counts a call as running until dropped, including when the call's future
/// is aborted.
struct Running<'a>(&'a Mutex<u32>);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        *lock(self.0) -= 1;
    }
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            calls: Mutex::new(0),
            running: Mutex::new(0),
            peak_running: Mutex::new(0),
        }
    }

    fn start(&self) -> Running<'_> {
        let mut running = lock(&self.running);
        *running += 1;
        let mut peak = lock(&self.peak_running);
        *peak = (*peak).max(*running);
        Running(&self.running)
    }

    fn push(&self, step: Step<T>) {
        lock(&self.steps).push_back(step);
    }

    /// Record the call, wait out any delay, then produce the next outcome.
    async fn next(&self, fallback: impl FnOnce() -> T) -> Result<T, StageFailure> {
        *lock(&self.calls) += 1;
        let _running = self.start();
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let step = lock(&self.steps).pop_front();
        match step {
            Some(Step::Return(result)) => result,
            Some(Step::Panic(message)) => panic!("{message}"),
            None => Ok(fallback()),
        }
    }

    fn calls(&self) -> u32 {
        *lock(&self.calls)
    }

    fn running(&self) -> u32 {
        *lock(&self.running)
    }

    fn peak_running(&self) -> u32 {
        *lock(&self.peak_running)
    }
}

// =============================================================================
// Mock Downloader
// =============================================================================

pub struct MockDownloader {
    script: Script<DownloadedMedia>,
    urls: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self {
            script: Script::new(),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_duration(self, seconds: f64) -> Self {
        self.script.push(Step::Return(Ok(DownloadedMedia {
            media_ref: MediaRef("/tmp/mock/source.mp4".into()),
            duration_seconds: seconds,
        })));
        self
    }

    pub fn with_failure(self, kind: FailureKind, message: &str) -> Self {
        self.script.push(Step::Return(Err(StageFailure::new(kind, message))));
        self
    }

    pub fn with_panic(self, message: &str) -> Self {
        self.script.push(Step::Panic(message.to_string()));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.script.delay) = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }

    /// Fetches currently in progress.
    pub fn running(&self) -> u32 {
        self.script.running()
    }

    /// Most fetches ever in progress at once.
    pub fn peak_running(&self) -> u32 {
        self.script.peak_running()
    }
}

impl Default for MockDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseDownloader for MockDownloader {
    async fn fetch(&self, ctx: &StageContext, url: &str) -> Result<DownloadedMedia, StageFailure> {
        lock(&self.urls).push(url.to_string());
        let work_dir = ctx.work_dir.clone();
        self.script
            .next(|| DownloadedMedia {
                media_ref: MediaRef(work_dir.join("source.mp4")),
                duration_seconds: 3.0,
            })
            .await
    }
}

// =============================================================================
// Mock Audio Extractor
// =============================================================================

pub struct MockAudioExtractor {
    script: Script<ExtractedAudio>,
    inputs: Mutex<Vec<MediaRef>>,
}

impl MockAudioExtractor {
    pub fn new() -> Self {
        Self {
            script: Script::new(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure(self, kind: FailureKind, message: &str) -> Self {
        self.script.push(Step::Return(Err(StageFailure::new(kind, message))));
        self
    }

    pub fn with_panic(self, message: &str) -> Self {
        self.script.push(Step::Panic(message.to_string()));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.script.delay) = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls()
    }

    /// Media handles this extractor was given, in call order.
    pub fn inputs(&self) -> Vec<MediaRef> {
        lock(&self.inputs).clone()
    }
}

impl Default for MockAudioExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseAudioExtractor for MockAudioExtractor {
    async fn extract(&self, ctx: &StageContext, media: &MediaRef) -> Result<ExtractedAudio, StageFailure> {
        lock(&self.inputs).push(media.clone());
        let work_dir = ctx.work_dir.clone();
        self.script
            .next(|| ExtractedAudio {
                audio_ref: AudioRef(work_dir.join("audio.wav")),
            })
            .await
    }
}

// =============================================================================
// Mock Transcriber
// =============================================================================

/// Arguments captured from a transcribe call
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeCallArgs {
    pub audio: AudioRef,
    pub language: Option<String>,
    pub model: ModelSize,
}

pub struct MockTranscriber {
    script: Script<Transcription>,
    call_args: Mutex<Vec<TranscribeCallArgs>>,
}

impl MockTranscriber {
    pub fn new() -> Self {
        Self {
            script: Script::new(),
            call_args: Mutex::new(Vec::new()),
        }
    }

    pub fn with_transcript(self, text: &str, segments: Vec<Segment>, language: &str) -> Self {
        self.script.push(Step::Return(Ok(Transcription {
            text: text.to_string(),
            segments,
            detected_language: language.to_string(),
        })));
        self
    }

    pub fn with_failure(self, kind: FailureKind, message: &str) -> Self {
        self.script.push(Step::Return(Err(StageFailure::new(kind, message))));
        self
    }

    pub fn with_panic(self, message: &str) -> Self {
        self.script.push(Step::Panic(message.to_string()));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.script.delay) = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls()
    }

    pub fn call_args(&self) -> Vec<TranscribeCallArgs> {
        lock(&self.call_args).clone()
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseTranscriber for MockTranscriber {
    async fn transcribe(
        &self,
        _ctx: &StageContext,
        audio: &AudioRef,
        language: Option<&str>,
        model: ModelSize,
    ) -> Result<Transcription, StageFailure> {
        lock(&self.call_args).push(TranscribeCallArgs {
            audio: audio.clone(),
            language: language.map(str::to_string),
            model,
        });
        let detected = language.unwrap_or("en").to_string();
        self.script
            .next(|| Transcription {
                text: "Hello world. This is a test.".to_string(),
                segments: vec![
                    Segment {
                        start: 0.0,
                        end: 1.5,
                        text: "Hello world.".to_string(),
                    },
                    Segment {
                        start: 1.5,
                        end: 3.0,
                        text: "This is a test.".to_string(),
                    },
                ],
                detected_language: detected,
            })
            .await
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// Bundle of mocks with handles kept for assertions.
pub struct TestDependencies {
    pub downloader: Arc<MockDownloader>,
    pub extractor: Arc<MockAudioExtractor>,
    pub transcriber: Arc<MockTranscriber>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            downloader: Arc::new(MockDownloader::new()),
            extractor: Arc::new(MockAudioExtractor::new()),
            transcriber: Arc::new(MockTranscriber::new()),
        }
    }

    pub fn with_downloader(mut self, downloader: MockDownloader) -> Self {
        self.downloader = Arc::new(downloader);
        self
    }

    pub fn with_extractor(mut self, extractor: MockAudioExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn with_transcriber(mut self, transcriber: MockTranscriber) -> Self {
        self.transcriber = Arc::new(transcriber);
        self
    }

    pub fn executors(&self) -> StageExecutors {
        StageExecutors::new(
            self.downloader.clone(),
            self.extractor.clone(),
            self.transcriber.clone(),
        )
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
