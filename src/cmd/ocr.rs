//! Make one input document searchable.

use clap::Args;

use crate::{
    page_source::{PageSourceOptions, validate_input},
    pipeline::{DocumentReport, DocumentStatus, Pipeline, PipelineOpts},
    prelude::*,
    recognition::{RecognitionOpts, Recognizer},
    ui::Ui,
};

/// Options for making a document searchable.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// The scanned document: PDF, TIFF, JPEG, PNG or BMP.
    pub input: PathBuf,

    /// Where to write the searchable PDF. Defaults to `<input>.ocr.pdf` next
    /// to the input.
    #[clap(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Write a JSON report describing every page to this path.
    #[clap(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub page_source: PageSourceOptions,

    #[command(flatten)]
    pub recognition: RecognitionOpts,

    #[command(flatten)]
    pub pipeline: PipelineOpts,
}

/// Make `opts.input` searchable.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: &Ui, opts: &OcrOpts) -> Result<()> {
    // Reject bad input before building a client, which may need credentials
    // or network access.
    validate_input(&opts.input)?;
    let output = opts
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&opts.input));

    let client = opts
        .recognition
        .engine
        .create_client(&opts.recognition)
        .await
        .with_context(|| format!("cannot create {:?} client", opts.recognition.engine))?;
    let pipeline = Pipeline::new(
        Recognizer::new(client, &opts.recognition),
        opts.pipeline.clone(),
    );

    let result = pipeline
        .make_searchable(ui, &opts.input, &output, &opts.page_source)
        .await;

    if let Some(report_path) = &opts.report {
        let report = match &result {
            Ok(report) => report.clone(),
            Err(err) => DocumentReport::failed(&opts.input, &output, err),
        };
        write_report(report_path, &report).await?;
    }

    let report = result?;
    display_summary(ui, &report);
    Ok(())
}

/// `scans/letter.tiff` becomes `scans/letter.ocr.pdf`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    input.with_file_name(format!("{stem}.ocr.pdf"))
}

async fn write_report(path: &Path, report: &DocumentReport) -> Result<()> {
    let json = serde_json::to_vec_pretty(report).context("cannot serialize report")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("cannot write report to {:?}", path.display()))
}

/// Tell the user how things went.
fn display_summary(ui: &Ui, report: &DocumentReport) {
    for page in report.failed_pages() {
        let error = page.error.as_deref().unwrap_or("unknown error");
        ui.display_message("⚠️", &format!("page {}: {:?}: {}", page.page, page.status, error));
    }
    let warnings = report.warning_count();
    if warnings > 0 {
        ui.display_message(
            "ℹ️",
            &format!("{warnings} word(s) could not be placed exactly (see --report)"),
        );
    }
    match report.status {
        DocumentStatus::Ok => ui.display_message(
            "✅",
            &format!("wrote {} ({} pages)", report.output.display(), report.page_count),
        ),
        _ => ui.display_message(
            "⚠️",
            &format!(
                "wrote {} with {} of {} pages incomplete",
                report.output.display(),
                report.failed_pages().count(),
                report.page_count
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_defaults_to_sibling_file() {
        assert_eq!(
            default_output_path(Path::new("scans/letter.tiff")),
            PathBuf::from("scans/letter.ocr.pdf")
        );
        assert_eq!(
            default_output_path(Path::new("report.v2.pdf")),
            PathBuf::from("report.v2.ocr.pdf")
        );
    }

    #[tokio::test]
    async fn unsupported_input_fails_before_creating_a_client() {
        // Azure would fail first on missing credentials if we got that far.
        let opts = OcrOpts {
            input: PathBuf::from("notes.docx"),
            output: None,
            report: None,
            page_source: PageSourceOptions::default(),
            recognition: RecognitionOpts::default(),
            pipeline: PipelineOpts::default(),
        };
        let err = cmd_ocr(&Ui::init_for_tests(), &opts).await.unwrap_err();
        assert!(err.to_string().starts_with("unsupported input format"), "{err}");
    }
}
