//! Azure AI Document Intelligence, using the `prebuilt-read` model.
//!
//! This is a long-running REST operation: we `POST` the page image, get back
//! an `Operation-Location` URL, and poll it until the analysis finishes.

use std::{env, fmt, time::Duration};

use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER},
};
use thiserror::Error;
use tokio::time;

use super::{
    RecognitionClient, RecognitionResult, RecognitionRetryResult, RecognizedWord,
};
use crate::{
    geometry::Quad,
    page_source::RasterPage,
    prelude::*,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_fatal, try_potentially_transient, try_retry_result,
    },
};

/// The REST API version we speak.
const API_VERSION: &str = "2023-07-31";

/// How many times we poll a single analysis before giving up on it.
const MAX_POLLS: usize = 300;

/// How long to wait between polls if the service doesn't tell us.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a `Retry-After` delay.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Header that carries the API key.
const API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Credentials for an Azure Document Intelligence resource.
#[derive(Clone)]
pub struct AzureConfig {
    /// Resource endpoint, like `https://example.cognitiveservices.azure.com/`.
    pub endpoint: String,
    pub api_key: String,
}

impl AzureConfig {
    /// Read `ENDPOINT` and `API_KEY` from the environment. Call
    /// [`dotenvy::dotenv`] first to support `.env` files.
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var("ENDPOINT")
            .context("ENDPOINT must be set to your Azure Document Intelligence endpoint")?;
        let api_key = env::var("API_KEY")
            .context("API_KEY must be set to your Azure Document Intelligence key")?;
        Ok(Self { endpoint, api_key })
    }

    /// The URL we `POST` pages to.
    fn analyze_url(&self) -> String {
        format!(
            "{}/formrecognizer/documentModels/prebuilt-read:analyze?api-version={}",
            self.endpoint.trim_end_matches('/'),
            API_VERSION
        )
    }
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// A non-success HTTP response from Azure.
#[derive(Debug, Error)]
#[error("Azure returned HTTP {status}: {body}")]
pub struct AzureHttpError {
    pub status: StatusCode,
    pub body: String,
}

impl IsKnownTransient for AzureHttpError {
    fn is_known_transient(&self) -> bool {
        self.status.is_known_transient()
    }
}

/// Recognition client for Azure's `prebuilt-read` model.
pub struct AzureClient {
    client: reqwest::Client,
    config: AzureConfig,
}

impl AzureClient {
    /// Create a new client.
    pub fn new(config: AzureConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("searchable-pdf/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("could not create HTTP client")?;
        debug!(?config, "Created Azure client");
        Ok(Self { client, config })
    }

    /// Poll a running analysis until it finishes.
    async fn poll(
        &self,
        operation_url: &str,
        mut delay: Duration,
    ) -> RecognitionRetryResult<AnalyzeResult> {
        for poll in 0..MAX_POLLS {
            time::sleep(delay).await;
            let response = try_potentially_transient!(
                self.client
                    .get(operation_url)
                    .header(API_KEY_HEADER, &self.config.api_key)
                    .send()
                    .await
            );
            delay = retry_after(response.headers());
            let response = try_retry_result!(check_status(response).await);
            let operation =
                try_potentially_transient!(response.json::<AnalyzeOperation>().await);
            trace!(poll, status = ?operation.status, "Azure analysis status");
            match operation.status {
                OperationStatus::NotStarted | OperationStatus::Running => {}
                OperationStatus::Succeeded => {
                    let result = try_fatal!(
                        operation
                            .analyze_result
                            .ok_or_else(|| anyhow!("Azure analysis succeeded with no result"))
                    );
                    return retry_result_ok(result);
                }
                OperationStatus::Failed | OperationStatus::Canceled => {
                    return retry_result_fatal(anyhow!(
                        "Azure analysis {:?}: {}",
                        operation.status,
                        operation.error.unwrap_or_default()
                    ));
                }
            }
        }
        retry_result_transient(anyhow!(
            "Azure analysis did not finish after {MAX_POLLS} polls"
        ))
    }
}

#[async_trait]
impl RecognitionClient for AzureClient {
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    async fn recognize(&self, page: &RasterPage) -> RecognitionRetryResult<RecognitionResult> {
        let response = try_potentially_transient!(
            self.client
                .post(self.config.analyze_url())
                .header(API_KEY_HEADER, &self.config.api_key)
                .header("x-ms-useragent", concat!("searchable-pdf/", env!("CARGO_PKG_VERSION")))
                .header(CONTENT_TYPE, &page.mime_type)
                .body(page.data.clone())
                .send()
                .await
        );
        let response = try_retry_result!(check_status(response).await);
        let operation_url = try_fatal!(
            response
                .headers()
                .get("operation-location")
                .ok_or_else(|| anyhow!("Azure response has no Operation-Location"))
                .and_then(|value| {
                    value
                        .to_str()
                        .map(str::to_owned)
                        .context("invalid Operation-Location header")
                })
        );
        let delay = retry_after(response.headers());
        let analysis = try_retry_result!(self.poll(&operation_url, delay).await);
        retry_result_ok(try_fatal!(analysis.into_recognition_result()))
    }
}

/// Turn non-success responses into transient or fatal errors.
async fn check_status(
    response: reqwest::Response,
) -> RecognitionRetryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return retry_result_ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = AzureHttpError { status, body };
    if error.is_known_transient() {
        retry_result_transient(error.into())
    } else {
        retry_result_fatal(error.into())
    }
}

/// How long the service asked us to wait before polling again.
fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_POLL_INTERVAL))
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

/// The body of an `Operation-Location` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: OperationStatus,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
enum OperationStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    pages: Vec<DocumentPage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentPage {
    width: f64,
    height: f64,
    /// "pixel" for images, "inch" for PDFs.
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    words: Vec<DocumentWord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentWord {
    content: String,
    /// Flattened `[x0, y0, x1, y1, ...]`.
    #[serde(default)]
    polygon: Vec<f64>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl AnalyzeResult {
    /// We send one page at a time, so we only look at the first page.
    fn into_recognition_result(self) -> Result<RecognitionResult> {
        let page_count = self.pages.len();
        let page = self
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Azure analysis returned no pages"))?;
        debug!(unit = ?page.unit, page.width, page.height, "Azure page");

        let mut warnings = vec![];
        if page_count > 1 {
            warnings.push(format!("ignored {} extra page(s)", page_count - 1));
        }
        let mut words = Vec::with_capacity(page.words.len());
        for (idx, word) in page.words.into_iter().enumerate() {
            if word.content.trim().is_empty() {
                warnings.push(format!("word {idx} has no text"));
                continue;
            }
            match Quad::from_flat(&word.polygon) {
                Some(polygon) => words.push(RecognizedWord {
                    content: word.content,
                    polygon,
                    confidence: word.confidence,
                }),
                None => warnings.push(format!(
                    "word {idx} ({:?}) has {} polygon coordinates, expected 8",
                    word.content,
                    word.polygon.len()
                )),
            }
        }

        Ok(RecognitionResult {
            width: page.width,
            height: page.height,
            words,
            warnings,
        })
    }
}
