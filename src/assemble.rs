//! Merge single-page PDFs into one output document.

use std::io::Write as _;

use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::{errors::PipelineError, prelude::*};

/// PDF version of our output documents.
const PDF_VERSION: &str = "1.5";

/// A rendered single-page PDF waiting to be merged.
#[derive(Clone, Debug)]
pub struct PageArtifact {
    /// Zero-based index of the page in the input document.
    pub index: usize,
    /// Where the rendered page was written.
    pub path: PathBuf,
}

impl PageArtifact {
    /// Load this artifact, making sure it actually contains a page.
    fn load(&self) -> Result<Document> {
        let doc = Document::load(&self.path)
            .with_context(|| format!("cannot parse page PDF {:?}", self.path.display()))?;
        if doc.get_pages().is_empty() {
            return Err(anyhow!("page PDF {:?} has no pages", self.path.display()));
        }
        Ok(doc)
    }
}

/// Combine `artifacts`, in the order given, into a single document with a
/// fresh catalog and page tree.
#[instrument(level = "debug", skip_all, fields(pages = artifacts.len()))]
pub fn assemble_documents(artifacts: &[PageArtifact]) -> Result<Document, PipelineError> {
    if artifacts.is_empty() {
        return Err(PipelineError::Assembly {
            page: None,
            source: anyhow!("no pages to assemble"),
        });
    }

    let mut document = Document::with_version(PDF_VERSION);
    let mut kids: Vec<ObjectId> = vec![];
    let mut max_id = 1;

    for artifact in artifacts {
        let mut doc = artifact.load().map_err(|source| PipelineError::Assembly {
            page: Some(artifact.index),
            source,
        })?;

        // Give every object an ID that doesn't collide with earlier pages.
        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        // Keep `get_pages` order within each artifact, and artifact order
        // overall.
        kids.extend(doc.get_pages().into_values());

        for (object_id, object) in doc.objects {
            match object.type_name().unwrap_or(b"") {
                b"Catalog" | b"Pages" | b"Outlines" | b"Outline" => {}
                _ => {
                    document.objects.insert(object_id, object);
                }
            }
        }
    }
    document.max_id = max_id - 1;

    let pages_id = document.new_object_id();
    for kid in &kids {
        let page = document
            .get_object_mut(*kid)
            .and_then(Object::as_dict_mut)
            .map_err(|err| PipelineError::Assembly {
                page: None,
                source: anyhow!("page object {kid:?} is not a dictionary: {err}"),
            })?;
        page.set("Parent", Object::Reference(pages_id));
    }

    let count = kids.len() as i64;
    let pages = Dictionary::from_iter([
        ("Type", Object::Name(b"Pages".to_vec())),
        (
            "Kids",
            Object::Array(kids.into_iter().map(Object::Reference).collect()),
        ),
        ("Count", Object::Integer(count)),
    ]);
    document.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = document.add_object(Dictionary::from_iter([
        ("Type", Object::Name(b"Catalog".to_vec())),
        ("Pages", Object::Reference(pages_id)),
    ]));
    document.trailer.set("Root", Object::Reference(catalog_id));

    let info_id = document.add_object(Dictionary::from_iter([(
        "Producer",
        Object::string_literal(format!("searchable-pdf {}", env!("CARGO_PKG_VERSION"))),
    )]));
    document.trailer.set("Info", Object::Reference(info_id));

    // Only touches streams that aren't already filtered, so page images are
    // left alone.
    document.compress();
    debug!(pages = count, objects = document.objects.len(), "assembled document");
    Ok(document)
}

/// Write `document` to `output`, replacing any existing file only once the new
/// one is complete.
#[instrument(level = "debug", skip_all, fields(output = %output.display()))]
pub fn write_document(document: &mut Document, output: &Path) -> Result<(), PipelineError> {
    save_atomically(document, output).map_err(|source| PipelineError::Output {
        path: output.to_owned(),
        source,
    })
}

/// Serialize into a temporary file next to `output`, then rename it over
/// `output`.
fn save_atomically(document: &mut Document, output: &Path) -> Result<()> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temporary file in {:?}", dir.display()))?;
    document
        .save_to(&mut tmp)
        .context("cannot serialize PDF")?;
    tmp.flush().context("cannot flush PDF")?;
    tmp.persist(output)
        .map_err(|err| err.error)
        .context("cannot move PDF into place")?;
    Ok(())
}
