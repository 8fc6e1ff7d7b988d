//! Mapping recognized word polygons onto PDF text placements.
//!
//! Recognizers report each word as a quadrilateral in their own coordinate
//! space, with the origin at the top left and Y pointing down. PDF pages put
//! the origin at the bottom left with Y pointing up. This module computes, for
//! each word, the font size, horizontal scaling, rotation and baseline anchor
//! that make an invisible text run cover exactly the same area as the word in
//! the page image.
//!
//! Everything here is pure and synchronous.

use std::{f64::consts::PI, fmt};

use thiserror::Error;

use crate::{font::StandardFont, prelude::*, recognition::RecognitionResult};

/// The height of a US Letter page in points. The longer side of every page
/// image is mapped onto this many points.
pub const REFERENCE_PAGE_HEIGHT: f64 = 792.0;

/// How far the horizontal and vertical content scale factors may drift apart
/// (relative to their mean) before we warn about it.
pub const CONTENT_RATIO_TOLERANCE: f64 = 0.02;

/// Polygon edges shorter than this (in recognizer units) are degenerate.
pub const MIN_EXTENT: f64 = 1e-6;

/// Measured text narrower than this (in points) cannot be stretched to fit.
pub const MIN_GLYPH_WIDTH: f64 = 1e-9;

/// A point in recognizer space (Y down).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A word's bounding quadrilateral: top-left, top-right, bottom-right and
/// bottom-left, relative to the text's own reading direction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Quad(pub [Point; 4]);

impl Quad {
    /// An axis-aligned rectangle.
    pub fn from_rect(left: f64, top: f64, width: f64, height: f64) -> Self {
        Quad([
            Point::new(left, top),
            Point::new(left + width, top),
            Point::new(left + width, top + height),
            Point::new(left, top + height),
        ])
    }

    /// Build a quad from `[x0, y0, x1, y1, x2, y2, x3, y3]`. Returns `None`
    /// unless there are exactly 8 numbers.
    pub fn from_flat(coords: &[f64]) -> Option<Self> {
        let coords: &[f64; 8] = coords.try_into().ok()?;
        Some(Quad([
            Point::new(coords[0], coords[1]),
            Point::new(coords[2], coords[3]),
            Point::new(coords[4], coords[5]),
            Point::new(coords[6], coords[7]),
        ]))
    }

    /// Build a quad from exactly 4 points.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let points: [Point; 4] = points.try_into().ok()?;
        Some(Quad(points))
    }
}

/// Why a word (or a whole page) could not be placed.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometryError {
    /// Two adjacent polygon corners coincide.
    #[error("polygon edge p{from}p{to} has zero length")]
    DegenerateEdge { from: usize, to: usize },

    #[error("computed font size {font_size} is not positive")]
    NonPositiveFontSize { font_size: f64 },

    /// The font has no measurable glyphs for this word.
    #[error("text has zero width in the overlay font")]
    ZeroGlyphWidth,

    #[error("polygon or computed placement is not finite")]
    NonFinite,

    #[error("page image has invalid pixel dimensions {width}x{height}")]
    InvalidPixelDimensions { width: u32, height: u32 },

    #[error("recognizer reported invalid content dimensions {width}x{height}")]
    InvalidContentDimensions { width: f64, height: f64 },
}

/// Something that makes the text layer less faithful than it could be, but
/// does not stop the page from being produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FidelityWarning {
    /// A word was left out of the text layer.
    SkippedWord {
        word_index: usize,
        content: String,
        reason: GeometryError,
    },

    /// Some characters of a word have no glyph and were left out.
    DroppedCharacters {
        word_index: usize,
        content: String,
        dropped: String,
    },

    /// The recognizer's content size does not have the page's aspect ratio.
    ContentRatioMismatch { horizontal: f64, vertical: f64 },
}

impl fmt::Display for FidelityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FidelityWarning::SkippedWord {
                word_index,
                content,
                reason,
            } => write!(f, "skipped word {word_index} ({content:?}): {reason}"),
            FidelityWarning::DroppedCharacters {
                word_index,
                content,
                dropped,
            } => write!(
                f,
                "word {word_index} ({content:?}): no glyphs for {dropped:?}"
            ),
            FidelityWarning::ContentRatioMismatch {
                horizontal,
                vertical,
            } => write!(
                f,
                "content scale differs by axis (horizontal {horizontal:.4}, vertical {vertical:.4})"
            ),
        }
    }
}

/// How to draw one word.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WordPlacement {
    pub content: String,
    /// Font size in points.
    pub font_size: f64,
    /// `Tz` operand. 100 means the font's natural width.
    pub horizontal_scale_percent: f64,
    /// Text direction. Positive values rotate clockwise as seen on the page.
    pub rotation_radians: f64,
    /// Start of the baseline, in PDF points from the bottom left.
    pub anchor_x: f64,
    pub anchor_y: f64,
}

impl WordPlacement {
    /// Place a single word, given the page's content `scale` (points per
    /// recognizer unit) and the page height in points.
    pub fn from_polygon(
        content: &str,
        polygon: &Quad,
        scale: f64,
        page_height: f64,
        font: &StandardFont,
    ) -> Result<Self, GeometryError> {
        let [p0, p1, p2, p3] = polygon.0;
        if !polygon.0.iter().all(|p| p.is_finite()) || !scale.is_finite() {
            return Err(GeometryError::NonFinite);
        }
        for (from, to) in [(0, 1), (1, 2), (3, 2), (0, 3)] {
            if polygon.0[from].distance(polygon.0[to]) < MIN_EXTENT {
                return Err(GeometryError::DegenerateEdge { from, to });
            }
        }

        let desired_width = p0.distance(p1).max(p3.distance(p2)) * scale;
        let desired_height = p1.distance(p2).max(p0.distance(p3)) * scale;
        let font_size = desired_height;
        if !font_size.is_finite() {
            return Err(GeometryError::NonFinite);
        }
        if font_size <= 0.0 {
            return Err(GeometryError::NonPositiveFontSize { font_size });
        }

        let actual_width = font.text_width(content, font_size);
        if actual_width < MIN_GLYPH_WIDTH {
            return Err(GeometryError::ZeroGlyphWidth);
        }

        // Average the top and bottom edges so slightly skewed quads still get
        // a sensible baseline angle.
        let dx = ((p1.x - p0.x) + (p2.x - p3.x)) / 2.0;
        let dy = ((p1.y - p0.y) + (p2.y - p3.y)) / 2.0;

        let placement = WordPlacement {
            content: content.to_owned(),
            font_size,
            horizontal_scale_percent: desired_width / actual_width * 100.0,
            rotation_radians: dy.atan2(dx),
            anchor_x: p3.x * scale,
            anchor_y: page_height - p3.y * scale,
        };
        if placement.is_finite() {
            Ok(placement)
        } else {
            Err(GeometryError::NonFinite)
        }
    }

    fn is_finite(&self) -> bool {
        [
            self.font_size,
            self.horizontal_scale_percent,
            self.rotation_radians,
            self.anchor_x,
            self.anchor_y,
        ]
        .iter()
        .all(|v| v.is_finite())
    }

    /// Rotation in degrees, for logging.
    pub fn rotation_degrees(&self) -> f64 {
        self.rotation_radians * 180.0 / PI
    }
}

/// Everything the renderer needs to draw one page.
#[derive(Clone, Debug, Serialize)]
pub struct PageGeometry {
    /// Image pixels per point.
    pub page_scale: f64,
    pub page_width: f64,
    pub page_height: f64,
    /// Points per recognizer unit.
    pub scale: f64,
    pub words: Vec<WordPlacement>,
    pub warnings: Vec<FidelityWarning>,
}

impl PageGeometry {
    /// A page with no text layer, used when recognition failed but we still
    /// want to keep the page image.
    pub fn image_only(width_px: u32, height_px: u32) -> Result<Self, GeometryError> {
        let (page_scale, page_width, page_height) = page_dimensions(width_px, height_px)?;
        Ok(PageGeometry {
            page_scale,
            page_width,
            page_height,
            scale: 1.0 / page_scale,
            words: vec![],
            warnings: vec![],
        })
    }
}

/// Compute `(page_scale, page_width, page_height)` for an image, so that its
/// longer side is [`REFERENCE_PAGE_HEIGHT`] points.
pub fn page_dimensions(
    width_px: u32,
    height_px: u32,
) -> Result<(f64, f64, f64), GeometryError> {
    if width_px == 0 || height_px == 0 {
        return Err(GeometryError::InvalidPixelDimensions {
            width: width_px,
            height: height_px,
        });
    }
    let (width, height) = (f64::from(width_px), f64::from(height_px));
    let page_scale = width.max(height) / REFERENCE_PAGE_HEIGHT;
    Ok((page_scale, width / page_scale, height / page_scale))
}

/// Lay out every recognized word on a page.
///
/// Words that cannot be placed are skipped and recorded in
/// [`PageGeometry::warnings`]. Only problems with the page as a whole return an
/// error.
pub fn map_page(
    width_px: u32,
    height_px: u32,
    result: &RecognitionResult,
    font: &StandardFont,
) -> Result<PageGeometry, GeometryError> {
    let (page_scale, page_width, page_height) = page_dimensions(width_px, height_px)?;

    let (reported_width, reported_height) = (result.width, result.height);
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !valid(reported_width) || !valid(reported_height) {
        return Err(GeometryError::InvalidContentDimensions {
            width: reported_width,
            height: reported_height,
        });
    }

    let mut warnings = vec![];
    let horizontal = page_width / reported_width;
    let vertical = page_height / reported_height;
    let scale = (horizontal + vertical) / 2.0;
    if (horizontal - vertical).abs() / scale > CONTENT_RATIO_TOLERANCE {
        warn!(
            horizontal,
            vertical, "recognizer content size does not match page aspect ratio"
        );
        warnings.push(FidelityWarning::ContentRatioMismatch {
            horizontal,
            vertical,
        });
    }

    let mut words = Vec::with_capacity(result.words.len());
    for (word_index, word) in result.words.iter().enumerate() {
        match WordPlacement::from_polygon(
            &word.content,
            &word.polygon,
            scale,
            page_height,
            font,
        ) {
            Ok(placement) => {
                trace!(
                    word_index,
                    font_size = placement.font_size,
                    rotation = placement.rotation_degrees(),
                    "placed word"
                );
                let dropped = font.encode(&word.content).dropped;
                if !dropped.is_empty() {
                    warnings.push(FidelityWarning::DroppedCharacters {
                        word_index,
                        content: word.content.clone(),
                        dropped: dropped.into_iter().collect(),
                    });
                }
                words.push(placement);
            }
            Err(reason) => {
                debug!(word_index, content = %word.content, %reason, "skipping word");
                warnings.push(FidelityWarning::SkippedWord {
                    word_index,
                    content: word.content.clone(),
                    reason,
                });
            }
        }
    }

    Ok(PageGeometry {
        page_scale,
        page_width,
        page_height,
        scale,
        words,
        warnings,
    })
}
