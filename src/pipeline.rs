//! Turn one input document into one searchable PDF.
//!
//! Pages flow through Decode → Recognize → Map → Render as a stream of
//! futures. We use [`StreamExt::buffered`] so that up to `--jobs` pages are in
//! flight at once, while results still come out in page order. The rendered
//! single-page PDFs are then merged by [`assemble_documents`].

use std::pin::pin;

use clap::{Args, ValueEnum};
use futures::StreamExt as _;

use crate::{
    assemble::{PageArtifact, assemble_documents, write_document},
    async_utils::blocking_iter_streams::{
        BlockingIterStream, spawn_blocking_propagating_panics,
    },
    errors::{PipelineError, Stage},
    font::{StandardFont, TIMES_ROMAN},
    geometry::{FidelityWarning, PageGeometry, map_page},
    page_source::{PageSource, PageSourceOptions, RasterPage},
    prelude::*,
    recognition::Recognizer,
    render::render_overlay_page,
    ui::{ProgressConfig, Ui},
};

/// What to do when a page fails permanently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// Stop at the first failed page and write no output.
    #[default]
    FailFast,
    /// Keep going. Pages that failed recognition keep their image but get no
    /// text layer. Pages that could not be decoded or rendered are left out.
    BestEffort,
}

/// Options controlling the page pipeline.
#[derive(Args, Clone, Debug)]
pub struct PipelineOpts {
    /// Max number of pages to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub jobs: usize,

    /// What to do when a page can't be processed.
    #[clap(long, value_enum, default_value_t = FailurePolicy::FailFast)]
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineOpts {
    fn default() -> Self {
        Self {
            jobs: 8,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Overall status of a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Every page has a text layer.
    Ok,
    /// We wrote a document, but some pages lack text or are missing.
    Incomplete,
    /// We could not write a document.
    Failed,
}

/// Status of a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Image and text layer.
    Ok,
    /// Image only, because recognition or mapping failed.
    ImageOnly,
    /// Not in the output at all.
    Omitted,
}

/// What happened to one page.
#[derive(Clone, Debug, Serialize)]
pub struct PageReport {
    /// One-based page number.
    pub page: usize,
    pub status: PageStatus,
    /// Number of words in the text layer.
    pub words: usize,
    /// The stage that failed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// The error that made this page incomplete, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Words we skipped or altered.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<FidelityWarning>,
}

impl PageReport {
    fn failed(index: usize, status: PageStatus, err: &PipelineError) -> Self {
        Self {
            page: index + 1,
            status,
            words: 0,
            stage: err.stage(),
            error: Some(error_chain(err)),
            warnings: vec![],
        }
    }
}

/// Format an error and all its causes on one line.
pub fn error_chain(err: &PipelineError) -> String {
    let mut chain = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain.join(": ")
}

/// Summary of one document, written by `--report`.
#[derive(Clone, Debug, Serialize)]
pub struct DocumentReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: DocumentStatus,
    /// Number of pages in the input.
    pub page_count: usize,
    pub pages: Vec<PageReport>,
    /// Document-level warnings, such as output from PDF tools.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Why the document failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentReport {
    /// A report for a document we could not produce.
    pub fn failed(input: &Path, output: &Path, err: &PipelineError) -> Self {
        Self {
            input: input.to_owned(),
            output: output.to_owned(),
            status: DocumentStatus::Failed,
            page_count: 0,
            pages: vec![],
            warnings: vec![],
            error: Some(error_chain(err)),
        }
    }

    /// Pages without a complete text layer.
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageReport> {
        self.pages.iter().filter(|p| p.status != PageStatus::Ok)
    }

    /// Total number of fidelity warnings across all pages.
    pub fn warning_count(&self) -> usize {
        self.pages.iter().map(|p| p.warnings.len()).sum()
    }
}

/// A page that made it through rendering.
struct RenderedPage {
    artifact: PageArtifact,
    report: PageReport,
}

/// Runs documents through recognition and rendering.
pub struct Pipeline {
    recognizer: Recognizer,
    font: &'static StandardFont,
    opts: PipelineOpts,
}

impl Pipeline {
    /// Create a pipeline using `recognizer`.
    pub fn new(recognizer: Recognizer, opts: PipelineOpts) -> Self {
        Self {
            recognizer,
            font: &TIMES_ROMAN,
            opts,
        }
    }

    /// Make a searchable copy of `input` at `output`.
    ///
    /// With [`FailurePolicy::FailFast`], the first failed page aborts the
    /// document, any pages still in flight are dropped, and `output` is not
    /// touched.
    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    pub async fn make_searchable(
        &self,
        ui: &Ui,
        input: &Path,
        output: &Path,
        source_opts: &PageSourceOptions,
    ) -> Result<DocumentReport, PipelineError> {
        let source = PageSource::from_path(input, source_opts).await?;
        let page_count = source.page_count();
        let warnings = source.warnings().to_owned();
        for warning in &warnings {
            warn!("{}: {}", input.display(), warning);
        }
        info!(pages = page_count, "processing {}", input.display());

        // Per-page PDFs live here until they are merged.
        let artifact_dir = source_opts
            .scratch_dir("searchable-pdf")
            .context("cannot create temporary directory")
            .map_err(|source| PipelineError::Stage {
                stage: Stage::Render,
                page: None,
                source,
            })?;

        let pb = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: "Recognizing pages",
                done_msg: "Recognized pages",
            },
            page_count as u64,
        );

        let artifact_dir_path = artifact_dir.path();
        let mut pages = pin!(
            BlockingIterStream::new(source)
                .enumerate()
                .map(move |(index, page)| self.process_page(index, page, artifact_dir_path))
                // Process pages concurrently, but return them in order.
                .buffered(self.opts.jobs.max(1))
        );

        let mut artifacts = vec![];
        let mut reports = vec![];
        while let Some(result) = pages.next().await {
            pb.inc(1);
            match result {
                Ok(rendered) => {
                    artifacts.push(rendered.artifact);
                    reports.push(rendered.report);
                }
                Err(err) if self.opts.failure_policy == FailurePolicy::BestEffort => {
                    let index = err.page().unwrap_or(reports.len());
                    error!("{}", error_chain(&err));
                    reports.push(PageReport::failed(index, PageStatus::Omitted, &err));
                }
                Err(err) => return Err(err),
            }
        }

        let mut document = assemble_documents(&artifacts)?;
        write_document(&mut document, output)?;

        let complete = reports.len() == page_count
            && reports.iter().all(|r| r.status == PageStatus::Ok);
        Ok(DocumentReport {
            input: input.to_owned(),
            output: output.to_owned(),
            status: if complete {
                DocumentStatus::Ok
            } else {
                DocumentStatus::Incomplete
            },
            page_count,
            pages: reports,
            warnings,
            error: None,
        })
    }

    /// Take one page from raster image to single-page PDF.
    #[instrument(level = "debug", skip_all, fields(page = index))]
    async fn process_page(
        &self,
        index: usize,
        page: Result<RasterPage>,
        artifact_dir: &Path,
    ) -> Result<RenderedPage, PipelineError> {
        let page = page.map_err(|source| PipelineError::Stage {
            stage: Stage::Decode,
            page: Some(index),
            source,
        })?;

        let (geometry, failure) = match self.recognize_and_map(index, &page).await {
            Ok(geometry) => (geometry, None),
            Err(err) if self.opts.failure_policy == FailurePolicy::BestEffort => {
                warn!("{}; keeping page image without text", error_chain(&err));
                let geometry = PageGeometry::image_only(page.width, page.height)
                    .map_err(|source| PipelineError::Geometry { page: index, source })?;
                (geometry, Some(err))
            }
            Err(err) => return Err(err),
        };

        let report = match &failure {
            Some(err) => PageReport::failed(index, PageStatus::ImageOnly, err),
            None => PageReport {
                page: index + 1,
                status: PageStatus::Ok,
                words: geometry.words.len(),
                stage: None,
                error: None,
                warnings: geometry.warnings.clone(),
            },
        };

        let path = artifact_dir.join(format!("page-{index:06}.pdf"));
        let font = self.font;
        let artifact_path = path.clone();
        spawn_blocking_propagating_panics(move || -> Result<()> {
            let bytes = render_overlay_page(&page, &geometry, font)?;
            std::fs::write(&artifact_path, bytes).with_context(|| {
                format!("cannot write page PDF {:?}", artifact_path.display())
            })
        })
        .await
        .map_err(|source| PipelineError::Stage {
            stage: Stage::Render,
            page: Some(index),
            source,
        })?;

        Ok(RenderedPage {
            artifact: PageArtifact { index, path },
            report,
        })
    }

    /// Recognize a page and work out where its words go.
    async fn recognize_and_map(
        &self,
        index: usize,
        page: &RasterPage,
    ) -> Result<PageGeometry, PipelineError> {
        let result = self.recognizer.recognize_page(page).await?;
        let (width, height, font) = (page.width, page.height, self.font);
        let geometry =
            spawn_blocking_propagating_panics(move || map_page(width, height, &result, font))
                .await
                .map_err(|source| PipelineError::Geometry { page: index, source })?;
        for warning in &geometry.warnings {
            debug!(page = index, "{warning}");
        }
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use lopdf::Document;

    use super::*;
    use crate::{
        errors::RecognitionFailureKind,
        geometry::Quad,
        page_source::tests::write_test_tiff,
        recognition::{
            RecognitionClient, RecognitionEngine, RecognitionOpts, RecognitionResult,
            RecognitionRetryResult, RecognizedWord, tests::ScriptedClient,
        },
        retry::retry_result_ok,
    };

    /// Labels each page with `page<N>`, finishing later pages first.
    #[derive(Default)]
    struct SlowFirstPagesClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecognitionClient for SlowFirstPagesClient {
        async fn recognize(
            &self,
            page: &RasterPage,
        ) -> RecognitionRetryResult<RecognitionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = 30 * (4 - page.index.min(3)) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            retry_result_ok(RecognitionResult {
                width: f64::from(page.width),
                height: f64::from(page.height),
                words: vec![RecognizedWord {
                    content: format!("page{}", page.index + 1),
                    polygon: Quad::from_rect(10.0, 10.0, 60.0, 20.0),
                    confidence: None,
                }],
                warnings: vec![],
            })
        }
    }

    fn pipeline(client: Arc<dyn RecognitionClient>, policy: FailurePolicy) -> Pipeline {
        let recognition_opts = RecognitionOpts {
            engine: RecognitionEngine::Tesseract,
            max_retries: 0,
            ..RecognitionOpts::default()
        };
        Pipeline::new(
            Recognizer::new(client, &recognition_opts),
            PipelineOpts {
                jobs: 4,
                failure_policy: policy,
            },
        )
    }

    /// Text shown on each page of `path`, in page order.
    fn page_texts(path: &Path) -> Vec<String> {
        let doc = Document::load(path).unwrap();
        doc.get_pages()
            .values()
            .map(|&id| {
                doc.get_and_decode_page_content(id)
                    .unwrap()
                    .operations
                    .iter()
                    .filter(|op| op.operator == "Tj")
                    .map(|op| String::from_utf8_lossy(op.operands[0].as_str().unwrap()).into_owned())
                    .collect::<String>()
            })
            .collect()
    }

    /// Count what is left in `dir`. Pages still in flight when we abort finish
    /// on blocking threads, so give them a moment to let go of their files.
    async fn leftover_entries(dir: &Path) -> usize {
        let count = || std::fs::read_dir(dir).unwrap().count();
        for _ in 0..100 {
            if count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        count()
    }

    fn three_page_tiff(dir: &Path) -> PathBuf {
        let path = dir.join("scan.tif");
        write_test_tiff(&path, 100, 120, &[255, 200, 150]);
        path
    }

    #[tokio::test]
    async fn pages_stay_in_order_when_finished_out_of_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = three_page_tiff(dir.path());
        let output = dir.path().join("scan.ocr.pdf");
        let client = Arc::new(SlowFirstPagesClient::default());

        let report = pipeline(client.clone(), FailurePolicy::FailFast)
            .make_searchable(
                &Ui::init_for_tests(),
                &input,
                &output,
                &PageSourceOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, DocumentStatus::Ok);
        assert_eq!(report.page_count, 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(page_texts(&output), vec!["page1 ", "page2 ", "page3 "]);
        let numbers = report.pages.iter().map(|p| p.page).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fail_fast_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = three_page_tiff(dir.path());
        let output = dir.path().join("scan.ocr.pdf");
        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(1, false)]),
            ..ScriptedClient::default()
        });

        let err = pipeline(client, FailurePolicy::FailFast)
            .make_searchable(
                &Ui::init_for_tests(),
                &input,
                &output,
                &PageSourceOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Recognition {
                page: 1,
                kind: RecognitionFailureKind::Permanent,
                ..
            }
        ));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn scratch_files_are_removed_after_an_abort() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("scan.tif");
        write_test_tiff(&input, 100, 120, &[255, 200, 150, 100]);
        let output = dir.path().join("scan.ocr.pdf");
        let source_opts = PageSourceOptions {
            temp_dir: Some(scratch.path().to_owned()),
            ..PageSourceOptions::default()
        };

        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(2, false)]),
            ..ScriptedClient::default()
        });
        let err = pipeline(client, FailurePolicy::FailFast)
            .make_searchable(&Ui::init_for_tests(), &input, &output, &source_opts)
            .await
            .unwrap_err();
        assert_eq!(err.page(), Some(2));
        assert!(!output.exists());
        assert_eq!(leftover_entries(scratch.path()).await, 0);

        // And after a clean run.
        let client = Arc::new(ScriptedClient::default());
        pipeline(client, FailurePolicy::FailFast)
            .make_searchable(&Ui::init_for_tests(), &input, &output, &source_opts)
            .await
            .unwrap();
        assert_eq!(Document::load(&output).unwrap().get_pages().len(), 4);
        assert_eq!(leftover_entries(scratch.path()).await, 0);
    }

    #[tokio::test]
    async fn best_effort_keeps_failed_pages_as_images() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = three_page_tiff(dir.path());
        let output = dir.path().join("scan.ocr.pdf");
        let client = Arc::new(ScriptedClient {
            script: Mutex::new(vec![(1, false)]),
            ..ScriptedClient::default()
        });

        let report = pipeline(client, FailurePolicy::BestEffort)
            .make_searchable(
                &Ui::init_for_tests(),
                &input,
                &output,
                &PageSourceOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, DocumentStatus::Incomplete);
        let statuses = report.pages.iter().map(|p| p.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![PageStatus::Ok, PageStatus::ImageOnly, PageStatus::Ok]
        );
        assert_eq!(report.pages[1].stage, Some(Stage::Recognize));
        assert_eq!(report.failed_pages().count(), 1);
        assert_eq!(Document::load(&output).unwrap().get_pages().len(), 3);
    }

    #[tokio::test]
    async fn unsupported_input_makes_no_recognition_calls() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("notes.docx");
        std::fs::write(&input, b"not a scan").unwrap();
        let client = Arc::new(SlowFirstPagesClient::default());

        let err = pipeline(client.clone(), FailurePolicy::BestEffort)
            .make_searchable(
                &Ui::init_for_tests(),
                &input,
                &dir.path().join("out.pdf"),
                &PageSourceOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::UnsupportedFormat { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reports_serialize_with_snake_case_statuses() {
        let err = PipelineError::Stage {
            stage: Stage::Decode,
            page: Some(0),
            source: anyhow!("truncated file"),
        };
        let report = DocumentReport {
            input: PathBuf::from("in.pdf"),
            output: PathBuf::from("in.ocr.pdf"),
            status: DocumentStatus::Incomplete,
            page_count: 1,
            pages: vec![PageReport::failed(0, PageStatus::Omitted, &err)],
            warnings: vec![],
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "incomplete");
        assert_eq!(json["pages"][0]["status"], "omitted");
        assert_eq!(json["pages"][0]["stage"], "decode");
        assert_eq!(
            json["pages"][0]["error"],
            "decode stage failed on page 1: truncated file"
        );
    }
}
