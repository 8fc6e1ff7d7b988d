//! Split an input document into page images.
//!
//! PDFs are rasterized with Poppler's `pdftocairo`, multipage TIFFs are split
//! with the [`tiff`] crate, and single images are passed through. Either way,
//! callers get an [`Iterator`] of [`RasterPage`] values in page order.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::{BufReader, Cursor, Read, Seek},
    sync::LazyLock,
    vec,
};

use clap::Args;
use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage};
use regex::Regex;
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult},
    tags::Tag,
};
use tokio::process::Command;

use crate::{
    async_utils::{
        blocking_iter_streams::spawn_blocking_propagating_panics,
        check_for_command_failure,
    },
    cpu_limit::with_cpu_semaphore,
    errors::{PipelineError, Stage},
    prelude::*,
};

/// Poppler prints this for damaged cross-reference tables it can recover from.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Does this line of Poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// The kinds of input we accept, chosen by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Pdf,
    Tiff,
    Jpeg,
    Png,
    Bmp,
}

impl InputFormat {
    /// Look up a format by (case-insensitive) file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(InputFormat::Pdf),
            "tif" | "tiff" => Some(InputFormat::Tiff),
            "jpg" | "jpeg" => Some(InputFormat::Jpeg),
            "png" => Some(InputFormat::Png),
            "bmp" => Some(InputFormat::Bmp),
            _ => None,
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputFormat::Pdf => "PDF",
            InputFormat::Tiff => "TIFF",
            InputFormat::Jpeg => "JPEG",
            InputFormat::Png => "PNG",
            InputFormat::Bmp => "BMP",
        };
        f.write_str(name)
    }
}

/// Check that `path` is something we can process, without reading it.
///
/// This runs before we create a recognition client, so bad input never costs
/// an API call.
pub fn validate_input(path: &Path) -> Result<InputFormat, PipelineError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    let format = InputFormat::from_extension(&extension).ok_or_else(|| {
        PipelineError::UnsupportedFormat {
            path: path.to_owned(),
            extension,
        }
    })?;
    if !path.is_file() {
        return Err(PipelineError::InputNotFound {
            path: path.to_owned(),
        });
    }
    Ok(format)
}

/// One page image.
#[derive(Clone)]
pub struct RasterPage {
    /// Zero-based page index.
    pub index: usize,
    /// Either `image/png` or `image/jpeg`.
    pub mime_type: String,
    /// Encoded image data.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl fmt::Debug for RasterPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterPage")
            .field("index", &self.index)
            .field("mime_type", &self.mime_type)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl RasterPage {
    /// Wrap an encoded image. JPEG and PNG data is kept as-is, so the output
    /// PDF can embed the original bytes. Anything else is converted to PNG.
    pub fn from_encoded(index: usize, data: Vec<u8>) -> Result<Self> {
        let format = image::guess_format(&data).context("unknown image format")?;
        let mime_type = match format {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            _ => {
                let image = image::load_from_memory_with_format(&data, format)
                    .with_context(|| format!("cannot decode {format:?} image"))?;
                return Self::from_image(index, &image);
            }
        };
        let (width, height) = ImageReader::with_format(Cursor::new(&data), format)
            .into_dimensions()
            .context("cannot read image dimensions")?;
        Ok(Self {
            index,
            mime_type: mime_type.to_owned(),
            data,
            width,
            height,
        })
    }

    /// Encode a decoded image as PNG.
    pub fn from_image(index: usize, image: &DynamicImage) -> Result<Self> {
        let mut data = vec![];
        image
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .context("cannot encode PNG")?;
        Ok(Self {
            index,
            mime_type: "image/png".to_owned(),
            data,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Is this page stored as JPEG?
    pub fn is_jpeg(&self) -> bool {
        self.mime_type == "image/jpeg"
    }

    /// Decode our image data.
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.data)
            .with_context(|| format!("cannot decode {} for page {}", self.mime_type, self.index + 1))
    }
}

/// Options for constructing a [`PageSource`].
#[derive(Args, Clone, Debug)]
pub struct PageSourceOptions {
    /// The DPI to use when rasterizing PDF pages.
    #[clap(long, default_value = "300")]
    pub dpi: u32,

    /// The password for an encrypted PDF.
    #[clap(long)]
    pub password: Option<String>,

    /// Where to put extracted pages and other scratch files. Defaults to the
    /// system temporary directory.
    #[clap(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,
}

impl PageSourceOptions {
    /// Create a scratch directory, deleted when the returned value is dropped.
    pub fn scratch_dir(&self, prefix: &str) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.temp_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

impl Default for PageSourceOptions {
    fn default() -> Self {
        Self {
            dpi: 300,
            password: None,
            temp_dir: None,
        }
    }
}

/// An iterator over the pages of a document, as images.
pub struct PageSource {
    /// Holds extracted pages, if we needed to extract any. Released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
    /// Page files, in order.
    files: vec::IntoIter<PathBuf>,
    /// Index of the next page we'll return.
    next_index: usize,
    /// Number of pages in the document.
    page_count: usize,
    /// Anything odd that the extraction tools told us.
    warnings: Vec<String>,
}

impl PageSource {
    /// Open a document, choosing a strategy based on its extension.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(
        path: &Path,
        options: &PageSourceOptions,
    ) -> Result<Self, PipelineError> {
        let format = validate_input(path)?;
        let result = match format {
            InputFormat::Pdf => Self::from_pdf(path, options).await,
            InputFormat::Tiff => Self::from_tiff(path, options).await,
            InputFormat::Jpeg | InputFormat::Png | InputFormat::Bmp => Ok(Self {
                tmpdir: None,
                files: vec![path.to_owned()].into_iter(),
                next_index: 0,
                page_count: 1,
                warnings: vec![],
            }),
        };
        result.map_err(|source| PipelineError::Stage {
            stage: Stage::Decode,
            page: None,
            source: source.context(format!("cannot read {format} file {}", path.display())),
        })
    }

    /// Rasterize each page of a PDF into a temporary directory.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi = options.dpi))]
    async fn from_pdf(path: &Path, options: &PageSourceOptions) -> Result<Self> {
        let page_count = get_pdf_page_count(path, options.password.as_deref()).await?;

        let tmpdir = options.scratch_dir("pages")?;

        // `pdftocairo` adds zero-padded page numbers to this, so the files
        // sort in page order.
        let out_path = tmpdir.path().join("page");
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png").arg("-r").arg(options.dpi.to_string());
        if let Some(password) = &options.password {
            cmd.arg("-opw").arg(password).arg("-upw").arg(password);
        }

        // `pdftocairo` will use _at least_ 100% of a CPU, and we don't want to
        // run 200 copies of it at once by mistake.
        let output = with_cpu_semaphore(|| async {
            cmd.arg(path).arg(&out_path).output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(is_error_line))?;

        let mut warnings = vec![];
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.trim().is_empty() {
                warnings.push(line.trim().to_owned());
            }
        }

        let files = sorted_dir_entries(tmpdir.path())?;
        if files.len() != page_count {
            return Err(anyhow!(
                "pdftocairo produced {} images for {} pages",
                files.len(),
                page_count
            ));
        }
        Ok(Self {
            tmpdir: Some(tmpdir),
            files: files.into_iter(),
            next_index: 0,
            page_count,
            warnings,
        })
    }

    /// Split a multipage TIFF into PNG files.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn from_tiff(path: &Path, options: &PageSourceOptions) -> Result<Self> {
        let path_owned = path.to_owned();
        let tmpdir = options.scratch_dir("tiff-pages")?;
        let out_dir = tmpdir.path().to_owned();

        // Decoding TIFF frames is CPU-intensive.
        let warnings =
            spawn_blocking_propagating_panics(move || split_tiff(&path_owned, &out_dir))
                .await?;

        let files = sorted_dir_entries(tmpdir.path())?;
        Ok(Self {
            tmpdir: Some(tmpdir),
            page_count: files.len(),
            files: files.into_iter(),
            next_index: 0,
            warnings,
        })
    }

    /// Number of pages in the document.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Get any warnings that occurred while processing the document.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Drop for PageSource {
    fn drop(&mut self) {
        // Delete our temporary directory, if we have one.
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

impl Iterator for PageSource {
    type Item = Result<RasterPage>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.files.next()?;
        let index = self.next_index;
        self.next_index += 1;
        Some(self.read_page(index, &path))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.files.size_hint()
    }
}

impl PageSource {
    fn read_page(&self, index: usize, path: &Path) -> Result<RasterPage> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read file {:?}", path.display()))?;

        // Delete extracted files to recover space a bit early.
        if self.tmpdir.is_some() {
            fs::remove_file(path)
                .with_context(|| format!("failed to delete file {:?}", path.display()))?;
        }

        RasterPage::from_encoded(index, bytes)
            .with_context(|| format!("cannot load image for page {}", index + 1))
    }
}

/// List a directory's files in lexical order.
fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = dir
        .read_dir()
        .with_context(|| format!("failed to read temporary directory {:?}", dir.display()))?
        .map(|entry| Ok(entry?.path()))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("failed to list temporary directory {:?}", dir.display()))?;
    paths.sort();
    Ok(paths)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path, password: Option<&str>) -> Result<usize> {
    let mut cmd = Command::new("pdfinfo");
    if let Some(password) = password {
        cmd.arg("-opw").arg(password).arg("-upw").arg(password);
    }
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
        .with_context(|| format!("failed to get page count for {:?}", path.display()))
}

/// Find `Pages:` in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("invalid page count {pages:?}"))
}

// ============================================================================
// TIFF processing helpers
// ============================================================================

/// NewSubfileType bits from TIFF 6.0, plus DNG extensions.
mod tiff_subfile_type {
    /// Reduced resolution image (thumbnail/preview).
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// Single page of a multi-page document.
    pub const SINGLE_PAGE: u32 = 0x2;
    /// Transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// Depth map, enhanced image and semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
    /// Any of the above that never hold a document page.
    pub const SKIPPABLE: u32 = REDUCED_RESOLUTION | TRANSPARENCY_MASK | DNG_BITS;
}

/// Write every page of a TIFF to `out_dir` as PNG.
///
/// Each IFD in the main chain is one page. Some writers also hide pages in
/// SubIFDs, and we refuse those files rather than silently dropping pages.
fn split_tiff(path: &Path, out_dir: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).with_context(|| {
        format!("failed to create TIFF decoder for {:?}", path.display())
    })?;

    let mut warnings = vec![];
    let mut ifd_index = 0;
    loop {
        if ifd_index > 0 {
            if !decoder.more_images() {
                break;
            }
            decoder
                .next_image()
                .with_context(|| format!("failed to advance to IFD {}", ifd_index))?;
        }
        validate_subifds(&mut decoder, ifd_index, &mut warnings)?;

        let image = decode_tiff_frame(&mut decoder)
            .with_context(|| format!("failed to decode IFD {}", ifd_index))?;
        let png_path = out_dir.join(format!("page-{:05}.png", ifd_index));
        image
            .save_with_format(&png_path, ImageFormat::Png)
            .with_context(|| format!("failed to write PNG {:?}", png_path.display()))?;
        ifd_index += 1;
    }
    debug!(path = %path.display(), pages = ifd_index, "Split multipage TIFF");
    Ok(warnings)
}

/// Make sure the current IFD's SubIFDs (if any) are only thumbnails, masks
/// or camera metadata.
fn validate_subifds<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let Ok(Some(value)) = decoder.find_tag(Tag::SubIfd) else {
        return Ok(());
    };
    let Ok(pointers) = value.into_ifd_vec() else {
        return Ok(());
    };

    for (sub_idx, pointer) in pointers.into_iter().enumerate() {
        let subdir = match decoder.read_directory(pointer) {
            Ok(dir) => dir,
            Err(err) => {
                warnings.push(format!(
                    "could not read SubIFD {} of IFD {}: {}",
                    sub_idx, ifd_index, err
                ));
                continue;
            }
        };
        let subfile_type = decoder
            .read_directory_tags(&subdir)
            .find_tag(Tag::NewSubfileType)
            .ok()
            .flatten()
            .and_then(|value| value.into_u32().ok())
            .unwrap_or(0);

        if subfile_type & tiff_subfile_type::SKIPPABLE != 0 {
            debug!(ifd_index, sub_idx, subfile_type, "Skipping auxiliary SubIFD");
        } else if subfile_type == 0 || subfile_type & tiff_subfile_type::SINGLE_PAGE != 0 {
            return Err(anyhow!(
                "TIFF has ambiguous SubIFD content in IFD {} (SubIFD {}, \
                 NewSubfileType={}). It may contain pages that would be \
                 silently dropped. Please convert it to PDF first.",
                ifd_index,
                sub_idx,
                subfile_type
            ));
        }
    }
    Ok(())
}

/// Decode the current TIFF frame.
fn decode_tiff_frame<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<DynamicImage> {
    let (width, height) = decoder.dimensions()?;
    let color_type = decoder.colortype()?;
    let data = match decoder.read_image()? {
        DecodingResult::U8(data) => data,
        // Keep the high byte of 16-bit samples.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => return Err(anyhow!("unsupported TIFF sample format")),
    };
    let wrong_size = || anyhow!("TIFF frame data does not match {width}x{height}");
    Ok(match color_type {
        ColorType::Gray(8 | 16) => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).ok_or_else(wrong_size)?)
        }
        ColorType::Gray(bits @ (1 | 2 | 4)) => DynamicImage::ImageLuma8(
            unpack_gray(&data, width, height, bits).ok_or_else(wrong_size)?,
        ),
        ColorType::RGB(8 | 16) => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).ok_or_else(wrong_size)?)
        }
        ColorType::RGBA(8 | 16) => {
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, data).ok_or_else(wrong_size)?)
        }
        other => return Err(anyhow!("unsupported TIFF color type {:?}", other)),
    })
}

/// Expand packed 1, 2 or 4-bit grayscale rows to 8 bits per pixel. Each row
/// starts on a byte boundary.
fn unpack_gray(data: &[u8], width: u32, height: u32, bits: u8) -> Option<GrayImage> {
    let (width, height, bits) = (width as usize, height as usize, usize::from(bits));
    let row_bytes = (width * bits).div_ceil(8);
    if data.len() < row_bytes * height {
        return None;
    }
    let max = (1u16 << bits) - 1;
    let mut pixels = Vec::with_capacity(width * height);
    for row in data.chunks(row_bytes).take(height) {
        for x in 0..width {
            let bit = x * bits;
            let shift = 8 - bits - bit % 8;
            let sample = u16::from(row[bit / 8] >> shift) & max;
            pixels.push((sample * 255 / max) as u8);
        }
    }
    GrayImage::from_raw(width as u32, height as u32, pixels)
}
