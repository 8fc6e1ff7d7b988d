//! Recognition using the local `tesseract` command.

use tokio::{fs, process::Command};

use super::{
    RecognitionClient, RecognitionResult, RecognitionRetryResult, RecognizedWord,
};
use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    geometry::Quad,
    page_source::RasterPage,
    prelude::*,
    retry::{retry_result_ok, try_fatal},
};

/// The TSV `level` of word rows.
const WORD_LEVEL: &str = "5";

/// Recognition client wrapping the `tesseract` CLI tool.
pub struct TesseractClient {
    /// Value for `-l`, like `eng` or `eng+fra`.
    lang: String,
}

impl TesseractClient {
    /// Create a new `tesseract` client.
    pub fn new(lang: &str) -> Self {
        Self {
            lang: lang.to_owned(),
        }
    }

    /// Run `tesseract` and return its TSV output.
    async fn run(&self, page: &RasterPage) -> Result<String> {
        let extension = match page.mime_type.as_str() {
            "image/jpeg" => "jpg",
            _ => "png",
        };

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{}", extension));
        let output_base = tmpdir.path().join("output");
        fs::write(&input_path, &page.data)
            .await
            .context("cannot write tesseract input file")?;

        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input_path)
                .arg(&output_base)
                .arg("-l")
                .arg(&self.lang)
                .arg("tsv")
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        fs::read_to_string(output_base.with_extension("tsv"))
            .await
            .context("cannot read tesseract output file")
    }
}

#[async_trait]
impl RecognitionClient for TesseractClient {
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    async fn recognize(&self, page: &RasterPage) -> RecognitionRetryResult<RecognitionResult> {
        // A local tool failing once will fail again.
        let tsv = try_fatal!(self.run(page).await);
        let (words, warnings) = try_fatal!(parse_tsv(&tsv));
        retry_result_ok(RecognitionResult {
            width: f64::from(page.width),
            height: f64::from(page.height),
            words,
            warnings,
        })
    }
}

/// Extract word rows from `tesseract`'s TSV output.
///
/// Columns are `level page_num block_num par_num line_num word_num left top
/// width height conf text`. Rows come out in reading order.
fn parse_tsv(tsv: &str) -> Result<(Vec<RecognizedWord>, Vec<String>)> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(tsv.as_bytes());

    let mut words = vec![];
    let mut warnings = vec![];
    for (row, record) in rdr.records().enumerate() {
        let record = record.context("cannot parse tesseract TSV")?;
        if record.get(0) != Some(WORD_LEVEL) {
            continue;
        }
        let Some(content) = record.get(11).map(str::trim).filter(|t| !t.is_empty())
        else {
            continue;
        };
        let number = |idx: usize| -> Option<f64> { record.get(idx)?.trim().parse().ok() };
        match (number(6), number(7), number(8), number(9)) {
            (Some(left), Some(top), Some(width), Some(height)) => {
                words.push(RecognizedWord {
                    content: content.to_owned(),
                    polygon: Quad::from_rect(left, top, width, height),
                    confidence: number(10)
                        .filter(|conf| *conf >= 0.0)
                        .map(|conf| conf / 100.0),
                })
            }
            _ => warnings.push(format!("TSV row {} has an invalid bounding box", row + 2)),
        }
    }
    Ok((words, warnings))
}
