//! Text recognition backends.
//!
//! A [`RecognitionClient`] takes one page image and returns the words on it,
//! each with a bounding polygon. Clients only make a single attempt and report
//! whether a failure is worth retrying. [`Recognizer`] wraps a client with rate
//! limiting, timeouts and retries.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, future::BoxFuture};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use tokio::time;

use crate::{
    errors::{PipelineError, RecognitionFailureKind},
    geometry::Quad,
    page_source::RasterPage,
    prelude::*,
    rate_limit::{RateLimit, RateLimitPeriod},
    retry::retry_result_transient,
};

pub mod azure;
pub mod tesseract;
pub mod textract;

/// A word found by a recognizer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognizedWord {
    /// The word's text. Never empty.
    pub content: String,
    /// Where the word is, in the recognizer's content units.
    pub polygon: Quad,
    /// Recognizer confidence between 0.0 and 1.0, if reported.
    pub confidence: Option<f64>,
}

/// Everything a recognizer found on one page.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecognitionResult {
    /// Page width in the recognizer's content units (pixels, inches, etc).
    pub width: f64,
    /// Page height in the recognizer's content units.
    pub height: f64,
    /// Words in reading order.
    pub words: Vec<RecognizedWord>,
    /// Things the backend reported that we couldn't represent.
    pub warnings: Vec<String>,
}

/// The return type of a single recognition attempt.
pub type RecognitionRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface to a text recognition service.
#[async_trait]
pub trait RecognitionClient: Send + Sync + 'static {
    /// Make one attempt to recognize the text on `page`.
    async fn recognize(&self, page: &RasterPage) -> RecognitionRetryResult<RecognitionResult>;
}

/// Which recognition backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RecognitionEngine {
    /// Azure AI Document Intelligence "prebuilt-read" model. Needs `ENDPOINT`
    /// and `API_KEY`.
    #[default]
    Azure,
    /// AWS Textract `DetectDocumentText`. Uses standard AWS configuration.
    Textract,
    /// The local `tesseract` command.
    Tesseract,
}

impl RecognitionEngine {
    /// Build a client for this engine.
    pub async fn create_client(
        self,
        opts: &RecognitionOpts,
    ) -> Result<Arc<dyn RecognitionClient>> {
        Ok(match self {
            RecognitionEngine::Azure => {
                let config = azure::AzureConfig::from_env()?;
                Arc::new(azure::AzureClient::new(config)?)
            }
            RecognitionEngine::Textract => {
                Arc::new(textract::TextractClient::new().await?)
            }
            RecognitionEngine::Tesseract => {
                Arc::new(tesseract::TesseractClient::new(&opts.tesseract_lang))
            }
        })
    }

    /// The rate limit to use when the user doesn't give one. Local engines
    /// are only limited by `--jobs`.
    pub fn default_rate_limit(self) -> Option<RateLimit> {
        match self {
            RecognitionEngine::Azure | RecognitionEngine::Textract => {
                Some(RateLimit::new(10, RateLimitPeriod::Second))
            }
            RecognitionEngine::Tesseract => None,
        }
    }
}

/// Recognition options.
#[derive(Args, Clone, Debug)]
pub struct RecognitionOpts {
    /// The recognition engine to use.
    #[clap(long, value_enum, default_value_t = RecognitionEngine::Azure)]
    pub engine: RecognitionEngine,

    /// Language(s) for `--engine tesseract`, as passed to `tesseract -l`.
    #[clap(long, default_value = "eng")]
    pub tesseract_lang: String,

    /// A timeout, in seconds, for each recognition attempt. Timed out attempts
    /// are retried.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Maximum request rate for the recognition service, in a format like
    /// "10/s" or "300/m". Defaults to "10/s" for remote engines.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// How many times to retry a page after a transient failure.
    #[clap(long, default_value_t = 5)]
    pub max_retries: u8,
}

impl Default for RecognitionOpts {
    fn default() -> Self {
        Self {
            engine: RecognitionEngine::default(),
            tesseract_lang: "eng".to_owned(),
            timeout: None,
            rate_limit: None,
            max_retries: 5,
        }
    }
}

/// A [`RecognitionClient`] plus the policies we apply when calling it.
pub struct Recognizer {
    client: Arc<dyn RecognitionClient>,
    rate_limiter: Option<RateLimiter>,
    timeout: Option<Duration>,
    max_retries: u8,
}

impl Recognizer {
    /// Wrap `client`, using the limits in `opts`.
    pub fn new(client: Arc<dyn RecognitionClient>, opts: &RecognitionOpts) -> Self {
        let rate_limit = opts
            .rate_limit
            .clone()
            .or_else(|| opts.engine.default_rate_limit());
        Self {
            client,
            rate_limiter: rate_limit.map(|limit| limit.to_rate_limiter()),
            timeout: opts.timeout.map(Duration::from_secs),
            max_retries: opts.max_retries,
        }
    }

    /// Recognize a page, retrying transient failures with exponential backoff.
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    pub async fn recognize_page(
        &self,
        page: &RasterPage,
    ) -> Result<RecognitionResult, PipelineError> {
        // If we have a transient failure, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: self.max_retries,
            jitter_ratio: 0.2,
        };

        let attempts = AtomicUsize::new(0);
        let resolved = self
            .attempt(&attempts, page)
            .await
            .retry_with_async(|_| self.attempt(&attempts, page))
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        let attempts = attempts.load(Ordering::SeqCst);
        let failure = |kind, source| PipelineError::Recognition {
            page: page.index,
            kind,
            attempts,
            source,
        };
        match resolved {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                for warning in &output.warnings {
                    warn!(page = page.index, "recognizer: {warning}");
                }
                Ok(output)
            }
            ResolvedResult::GivenUp { fatal_error, .. } => {
                Err(failure(RecognitionFailureKind::RetriesExhausted, fatal_error))
            }
            ResolvedResult::Fatal { error, .. } => {
                Err(failure(RecognitionFailureKind::Permanent, error))
            }
            ResolvedResult::Unrecoverable { fatal_error, .. } => {
                Err(failure(RecognitionFailureKind::Permanent, fatal_error))
            }
        }
    }

    /// Make a single rate-limited, time-limited attempt.
    fn attempt<'a>(
        &'a self,
        attempts: &'a AtomicUsize,
        page: &'a RasterPage,
    ) -> BoxFuture<'a, RecognitionRetryResult<RecognitionResult>> {
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(page = page.index, attempt, "recognition attempt");
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.acquire_one().await;
            }
            match self.timeout {
                Some(timeout) => {
                    match time::timeout(timeout, self.client.recognize(page)).await {
                        Ok(result) => result,
                        Err(_) => retry_result_transient(anyhow!(
                            "recognition timed out after {}s",
                            timeout.as_secs()
                        )),
                    }
                }
                None => self.client.recognize(page).await,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::retry::{retry_result_fatal, retry_result_ok};

    /// A scripted client for tests. Each call pops the next outcome for the
    /// page; once the script runs out, calls succeed.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        pub(crate) script: Mutex<Vec<(usize, bool)>>,
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl RecognitionClient for ScriptedClient {
        async fn recognize(
            &self,
            page: &RasterPage,
        ) -> RecognitionRetryResult<RecognitionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().expect("lock poisoned");
                script
                    .iter()
                    .position(|(index, _)| *index == page.index)
                    .map(|pos| script.remove(pos))
            };
            match next {
                Some((_, true)) => retry_result_transient(anyhow!("HTTP 503")),
                Some((_, false)) => retry_result_fatal(anyhow!("HTTP 401")),
                None => retry_result_ok(RecognitionResult {
                    width: f64::from(page.width),
                    height: f64::from(page.height),
                    ..RecognitionResult::default()
                }),
            }
        }
    }

    fn page() -> RasterPage {
        RasterPage {
            index: 0,
            mime_type: "image/png".to_owned(),
            data: vec![],
            width: 10,
            height: 10,
        }
    }

    fn recognizer(client: Arc<ScriptedClient>, max_retries: u8) -> Recognizer {
        let opts = RecognitionOpts {
            engine: RecognitionEngine::Tesseract,
            max_retries,
            ..RecognitionOpts::default()
        };
        Recognizer::new(client, &opts)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(0, true), (0, true)]),
            ..ScriptedClient::default()
        });
        let result = recognizer(client.clone(), 5)
            .recognize_page(&page())
            .await
            .unwrap();
        assert_eq!(result.width, 10.0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(0, false)]),
            ..ScriptedClient::default()
        });
        let err = recognizer(client.clone(), 5)
            .recognize_page(&page())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Recognition {
                page: 0,
                kind: RecognitionFailureKind::Permanent,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_a_final_failure() {
        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(0, true); 10]),
            ..ScriptedClient::default()
        });
        let err = recognizer(client.clone(), 1)
            .recognize_page(&page())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Recognition {
                kind: RecognitionFailureKind::RetriesExhausted,
                ..
            }
        ));
        assert!(err.to_string().contains("retries exhausted after"));
        assert!(client.calls.load(Ordering::SeqCst) >= 2);
    }
}
