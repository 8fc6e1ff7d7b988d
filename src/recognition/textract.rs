//! Recognition using AWS Textract's `DetectDocumentText`.

use std::collections::HashMap;

use aws_sdk_textract::{
    operation::detect_document_text::DetectDocumentTextError,
    primitives::Blob,
    types::{Block, BlockType, Document, RelationshipType},
};

use super::{
    RecognitionClient, RecognitionResult, RecognitionRetryResult, RecognizedWord,
};
use crate::{
    aws::load_aws_config,
    geometry::{Point, Quad},
    page_source::RasterPage,
    prelude::*,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

/// Recognition client wrapping the AWS Textract API.
pub struct TextractClient {
    client: aws_sdk_textract::Client,
}

impl TextractClient {
    /// Create a client using the standard AWS configuration.
    pub async fn new() -> Result<Self> {
        let config = load_aws_config().await?;
        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
        })
    }
}

impl IsKnownTransient for DetectDocumentTextError {
    fn is_known_transient(&self) -> bool {
        self.is_throttling_exception()
            || self.is_provisioned_throughput_exceeded_exception()
            || self.is_internal_server_error()
    }
}

#[async_trait]
impl RecognitionClient for TextractClient {
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    async fn recognize(&self, page: &RasterPage) -> RecognitionRetryResult<RecognitionResult> {
        let document = Document::builder()
            .bytes(Blob::new(page.data.clone()))
            .build();
        let output = try_potentially_transient!(
            self.client
                .detect_document_text()
                .document(document)
                .send()
                .await
        );
        trace!("Document response: {output:#?}");
        let result = try_fatal!(words_in_reading_order(
            output.blocks(),
            page.width,
            page.height
        ));
        retry_result_ok(result)
    }
}

/// Collect `WORD` blocks by walking each `LINE` block's children.
///
/// Textract returns lines in reading order, but the words themselves are
/// listed separately. Polygons are normalized to 0.0..=1.0, so we scale them
/// back to pixels and report the pixel size as our content size.
fn words_in_reading_order(
    blocks: &[Block],
    width_px: u32,
    height_px: u32,
) -> Result<RecognitionResult> {
    let blocks_by_id = blocks
        .iter()
        .filter_map(|block| Some((block.id()?, block)))
        .collect::<HashMap<_, _>>();
    let (width, height) = (f64::from(width_px), f64::from(height_px));

    let mut words = vec![];
    let mut warnings = vec![];
    let lines = blocks
        .iter()
        .filter(|block| block.block_type() == Some(&BlockType::Line));
    for line in lines {
        let children = line
            .relationships()
            .iter()
            .filter(|rel| rel.r#type() == Some(&RelationshipType::Child))
            .flat_map(|rel| rel.ids());
        for id in children {
            let word = blocks_by_id
                .get(id.as_str())
                .ok_or_else(|| anyhow!("Textract child block {} not found", id))?;
            if word.block_type() != Some(&BlockType::Word) {
                continue;
            }
            let Some(content) = word.text().filter(|text| !text.trim().is_empty()) else {
                warnings.push(format!("word block {id} has no text"));
                continue;
            };
            let points = word
                .geometry()
                .map(|geometry| geometry.polygon())
                .unwrap_or_default()
                .iter()
                .map(|p| Point::new(f64::from(p.x()) * width, f64::from(p.y()) * height))
                .collect::<Vec<_>>();
            match Quad::from_points(&points) {
                Some(polygon) => words.push(RecognizedWord {
                    content: content.to_owned(),
                    polygon,
                    confidence: word.confidence().map(|c| f64::from(c) / 100.0),
                }),
                None => warnings.push(format!(
                    "word {content:?} has {} polygon points, expected 4",
                    points.len()
                )),
            }
        }
    }

    Ok(RecognitionResult {
        width,
        height,
        words,
        warnings,
    })
}
