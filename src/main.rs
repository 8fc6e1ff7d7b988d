use std::io::IsTerminal as _;

use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, fmt::format::FmtSpan,
    layer::SubscriberExt, util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod assemble;
mod async_utils;
mod aws;
mod cmd;
mod cpu_limit;
mod errors;
mod font;
mod geometry;
mod page_source;
mod pipeline;
mod prelude;
mod rate_limit;
mod recognition;
mod render;
mod retry;
mod ui;

/// Add an invisible OCR text layer to scanned PDFs and images.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - ENDPOINT: Azure Document Intelligence endpoint, for `--engine azure`.
  - API_KEY: Azure Document Intelligence key, for `--engine azure`.
  - RUST_LOG (optional): Log filter, like `debug` or `searchable_pdf=trace`.

  Standard AWS environment variables and credential files
  are used for `--engine textract`.

  These variables may be set in a standard `.env` file.

External tools:
  PDF input needs `pdfinfo` and `pdftocairo` from Poppler.
  `--engine tesseract` needs `tesseract`.
"#
)]
struct Opts {
    #[command(flatten)]
    ocr: cmd::ocr::OcrOpts,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Progress bars only make sense on a terminal.
    if !std::io::stderr().is_terminal() {
        ui.hide_progress_bars();
    }

    cmd::ocr::cmd_ocr(&ui, &opts.ocr).await
}
