//! Errors that callers need to tell apart.
//!
//! Most of our plumbing uses [`anyhow::Error`] with `.context(...)`. The types
//! here exist because the pipeline needs to know *which* stage failed, on
//! *which* page, and whether a recognition failure was a transient one that ran
//! out of retries. Every page-scoped error names its stage and page in its
//! `Display` output, so the message printed by `main` is enough for a user to
//! find the problem.

use std::fmt;

use thiserror::Error;

use crate::{geometry::GeometryError, prelude::*};

/// Per-page processing stages, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Turning the input document into raster images.
    Decode,
    /// Calling the recognition backend.
    Recognize,
    /// Computing text placement from word polygons.
    Map,
    /// Writing the single-page overlay PDF.
    Render,
    /// Merging page PDFs into the output document.
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Recognize => "recognize",
            Stage::Map => "map",
            Stage::Render => "render",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// Why a page's recognition failed for good. Either way the page will not be
/// retried again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionFailureKind {
    /// Timeouts, rate limiting and similar kept happening until we ran out
    /// of retries.
    RetriesExhausted,
    /// Authentication, quota, malformed input and similar.
    Permanent,
}

impl fmt::Display for RecognitionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionFailureKind::RetriesExhausted => f.write_str("retries exhausted"),
            RecognitionFailureKind::Permanent => f.write_str("permanent failure"),
        }
    }
}

/// Formats an optional zero-based page index as " on page N" (1-based).
struct OnPage(Option<usize>);

impl fmt::Display for OnPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(page) => write!(f, " on page {}", page + 1),
            None => Ok(()),
        }
    }
}

/// Errors produced while turning a scan into a searchable PDF.
///
/// Page indices are stored zero-based and displayed one-based.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input path does not exist or is not a file.
    #[error("input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    /// The input extension is not one we know how to decode.
    #[error(
        "unsupported input format {extension:?} for {} (supported: PDF, TIF, TIFF, JPG, JPEG, PNG, BMP)",
        path.display()
    )]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The recognition backend could not produce a result for a page.
    #[error(
        "recognize stage failed{} ({kind} after {attempts} attempt(s))",
        OnPage(Some(*page))
    )]
    Recognition {
        page: usize,
        kind: RecognitionFailureKind,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Page-level geometry failure, such as unusable content dimensions.
    #[error("map stage failed{}", OnPage(Some(*page)))]
    Geometry {
        page: usize,
        #[source]
        source: GeometryError,
    },

    /// A decode or render failure, for one page or the whole document.
    #[error("{stage} stage failed{}", OnPage(*page))]
    Stage {
        stage: Stage,
        page: Option<usize>,
        #[source]
        source: anyhow::Error,
    },

    /// A per-page artifact was missing or corrupt at merge time.
    #[error("assemble stage failed{}", OnPage(*page))]
    Assembly {
        page: Option<usize>,
        #[source]
        source: anyhow::Error,
    },

    /// The final document could not be written.
    #[error("could not write output file {}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Which stage produced this error, if it is tied to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::InputNotFound { .. }
            | PipelineError::UnsupportedFormat { .. } => None,
            PipelineError::Recognition { .. } => Some(Stage::Recognize),
            PipelineError::Geometry { .. } => Some(Stage::Map),
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::Assembly { .. } | PipelineError::Output { .. } => {
                Some(Stage::Assemble)
            }
        }
    }

    /// The zero-based page this error belongs to, if any.
    pub fn page(&self) -> Option<usize> {
        match self {
            PipelineError::Recognition { page, .. }
            | PipelineError::Geometry { page, .. } => Some(*page),
            PipelineError::Stage { page, .. } | PipelineError::Assembly { page, .. } => {
                *page
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_errors_name_stage_and_page() {
        let err = PipelineError::Stage {
            stage: Stage::Render,
            page: Some(2),
            source: anyhow!("disk full"),
        };
        assert_eq!(err.to_string(), "render stage failed on page 3");
        assert_eq!(err.stage(), Some(Stage::Render));
        assert_eq!(err.page(), Some(2));

        let err = PipelineError::Recognition {
            page: 0,
            kind: RecognitionFailureKind::RetriesExhausted,
            attempts: 6,
            source: anyhow!("HTTP 429"),
        };
        assert_eq!(
            err.to_string(),
            "recognize stage failed on page 1 (retries exhausted after 6 attempt(s))"
        );
        assert_eq!(
            serde_json::to_string(&RecognitionFailureKind::RetriesExhausted).unwrap(),
            r#""retries_exhausted""#
        );
    }

    #[test]
    fn document_errors_have_no_page() {
        let err = PipelineError::Assembly {
            page: None,
            source: anyhow!("no pages"),
        };
        assert_eq!(err.to_string(), "assemble stage failed");
        assert_eq!(err.page(), None);

        let err = PipelineError::UnsupportedFormat {
            path: PathBuf::from("notes.docx"),
            extension: "docx".to_owned(),
        };
        assert!(err.to_string().contains("unsupported input format"));
        assert_eq!(err.stage(), None);
    }
}
