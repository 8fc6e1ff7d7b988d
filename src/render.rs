//! Render one page image plus its invisible text layer as a single-page PDF.

use std::io::Write as _;

use flate2::{Compression, write::ZlibEncoder};
use image::{DynamicImage, GenericImageView as _};
use pdf_writer::{
    Content, Filter, Finish, Name, Pdf, Rect, Ref, Str, types::TextRenderingMode,
};

use crate::{
    font::StandardFont,
    geometry::PageGeometry,
    page_source::RasterPage,
    prelude::*,
};

const CATALOG_ID: Ref = Ref::new(1);
const PAGE_TREE_ID: Ref = Ref::new(2);
const PAGE_ID: Ref = Ref::new(3);
const CONTENT_ID: Ref = Ref::new(4);
const FONT_ID: Ref = Ref::new(5);
const IMAGE_ID: Ref = Ref::new(6);

const FONT_NAME: Name<'static> = Name(b"F1");
const IMAGE_NAME: Name<'static> = Name(b"Im1");

/// Image samples ready to go in an image XObject.
struct EmbeddedImage {
    data: Vec<u8>,
    filter: Filter,
    gray: bool,
    width: u32,
    height: u32,
}

impl EmbeddedImage {
    /// Keep JPEG pages byte-for-byte. Everything else is stored losslessly as
    /// Flate-compressed samples.
    fn from_page(page: &RasterPage) -> Result<Self> {
        if page.is_jpeg() {
            match jpeg_components(&page.data) {
                Some(components @ (1 | 3)) => {
                    return Ok(Self {
                        data: page.data.clone(),
                        filter: Filter::DctDecode,
                        gray: components == 1,
                        width: page.width,
                        height: page.height,
                    });
                }
                other => debug!(components = ?other, "re-encoding JPEG we can't pass through"),
            }
        }
        Self::from_image(&page.decode()?)
    }

    fn from_image(image: &DynamicImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        let gray = !image.color().has_color();
        let samples = if image.color().has_alpha() {
            flatten_alpha(image, gray)
        } else if gray {
            image.to_luma8().into_raw()
        } else {
            image.to_rgb8().into_raw()
        };
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&samples)
            .context("cannot compress image samples")?;
        let data = encoder.finish().context("cannot compress image samples")?;
        Ok(Self {
            data,
            filter: Filter::FlateDecode,
            gray,
            width,
            height,
        })
    }
}

/// Composite an image with alpha onto a white background.
fn flatten_alpha(image: &DynamicImage, gray: bool) -> Vec<u8> {
    let blend = |value: u8, alpha: u8| -> u8 {
        let (value, alpha) = (u16::from(value), u16::from(alpha));
        ((value * alpha + 255 * (255 - alpha) + 127) / 255) as u8
    };
    if gray {
        image
            .to_luma_alpha8()
            .pixels()
            .map(|p| blend(p.0[0], p.0[1]))
            .collect()
    } else {
        image
            .to_rgba8()
            .pixels()
            .flat_map(|p| {
                let [r, g, b, a] = p.0;
                [blend(r, a), blend(g, a), blend(b, a)]
            })
            .collect()
    }
}

/// Find the number of color components in a baseline or progressive JPEG, by
/// reading its start-of-frame marker.
fn jpeg_components(data: &[u8]) -> Option<u8> {
    if data.get(..2)? != [0xFF, 0xD8] {
        return None;
    }
    let mut pos = 2;
    loop {
        // Skip fill bytes.
        while *data.get(pos)? == 0xFF && *data.get(pos + 1)? == 0xFF {
            pos += 1;
        }
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        let len = usize::from(u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]));
        match marker {
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                // Length, precision, height, width, then component count.
                return data.get(pos + 9).copied();
            }
            0xD9 | 0xDA => return None,
            _ => pos += 2 + len,
        }
    }
}

/// Build a single-page PDF: the page image filling the page, with every word
/// of `geometry` drawn on top in invisible text.
#[instrument(level = "debug", skip_all, fields(page = page.index, words = geometry.words.len()))]
pub fn render_overlay_page(
    page: &RasterPage,
    geometry: &PageGeometry,
    font: &StandardFont,
) -> Result<Vec<u8>> {
    let image = EmbeddedImage::from_page(page)?;
    let (page_width, page_height) = (geometry.page_width as f32, geometry.page_height as f32);

    let mut pdf = Pdf::new();
    pdf.catalog(CATALOG_ID).pages(PAGE_TREE_ID);
    pdf.pages(PAGE_TREE_ID).kids([PAGE_ID]).count(1);

    let mut pdf_page = pdf.page(PAGE_ID);
    pdf_page.media_box(Rect::new(0.0, 0.0, page_width, page_height));
    pdf_page.parent(PAGE_TREE_ID);
    pdf_page.contents(CONTENT_ID);
    let mut resources = pdf_page.resources();
    resources.fonts().pair(FONT_NAME, FONT_ID);
    resources.x_objects().pair(IMAGE_NAME, IMAGE_ID);
    resources.finish();
    pdf_page.finish();

    pdf.type1_font(FONT_ID)
        .base_font(Name(font.base_font.as_bytes()))
        .encoding_predefined(Name(b"WinAnsiEncoding"));

    // The page already has the image's aspect ratio, so the image fills it.
    let mut content = Content::new();
    content.save_state();
    content.transform([page_width, 0.0, 0.0, page_height, 0.0, 0.0]);
    content.x_object(IMAGE_NAME);
    content.restore_state();

    if !geometry.words.is_empty() {
        content.begin_text();
        content.set_text_rendering_mode(TextRenderingMode::Invisible);
        for word in &geometry.words {
            let (sin, cos) = word.rotation_radians.sin_cos();
            let (sin, cos) = (sin as f32, cos as f32);
            content.set_font(FONT_NAME, word.font_size as f32);
            content.set_text_matrix([
                cos,
                -sin,
                sin,
                cos,
                word.anchor_x as f32,
                word.anchor_y as f32,
            ]);
            content.set_horizontal_scaling(word.horizontal_scale_percent as f32);
            // The trailing space keeps words apart when text is extracted.
            let text = font.encode(&format!("{} ", word.content));
            content.show(Str(&text.bytes));
        }
        content.end_text();
    }
    pdf.stream(CONTENT_ID, &content.finish());

    let mut xobject = pdf.image_xobject(IMAGE_ID, &image.data);
    xobject.filter(image.filter);
    xobject.width(image.width as i32);
    xobject.height(image.height as i32);
    if image.gray {
        xobject.color_space().device_gray();
    } else {
        xobject.color_space().device_rgb();
    }
    xobject.bits_per_component(8);
    xobject.finish();

    Ok(pdf.finish())
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, RgbImage, RgbaImage};
    use lopdf::{Document, Object};

    use super::*;
    use crate::{
        font::TIMES_ROMAN,
        geometry::{Quad, map_page},
        recognition::{RecognitionResult, RecognizedWord},
    };

    fn hello_page() -> (RasterPage, PageGeometry) {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(850, 1100, Luma([255])));
        let page = RasterPage::from_image(0, &image).unwrap();
        let result = RecognitionResult {
            width: 850.0,
            height: 1100.0,
            words: vec![RecognizedWord {
                content: "Hello".to_owned(),
                polygon: Quad::from_rect(100.0, 200.0, 250.0, 50.0),
                confidence: Some(0.99),
            }],
            warnings: vec![],
        };
        let geometry = map_page(page.width, page.height, &result, &TIMES_ROMAN).unwrap();
        (page, geometry)
    }

    fn operands(op: &lopdf::content::Operation) -> Vec<f32> {
        op.operands.iter().map(|o| o.as_float().unwrap()).collect()
    }

    #[test]
    fn hello_page_has_expected_text_layer() {
        let (page, geometry) = hello_page();
        // 1100 px maps to 792 pt, so 1 px = 0.72 pt.
        assert!((geometry.scale - 0.72).abs() < 1e-9);

        let bytes = render_overlay_page(&page, &geometry, &TIMES_ROMAN).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 1);
        let page_id = pages[&1];

        let media_box = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o.as_float().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(media_box, vec![0.0, 0.0, 612.0, 792.0]);

        let content = doc.get_and_decode_page_content(page_id).unwrap();
        let find = |name: &str| {
            content
                .operations
                .iter()
                .find(|op| op.operator == name)
                .unwrap_or_else(|| panic!("no {name} operator"))
        };

        assert_eq!(operands(find("cm")), vec![612.0, 0.0, 0.0, 792.0, 0.0, 0.0]);
        assert_eq!(operands(find("Tr")), vec![3.0]);

        let tf = find("Tf");
        assert_eq!(tf.operands[0], Object::Name(b"F1".to_vec()));
        assert!((tf.operands[1].as_float().unwrap() - 36.0).abs() < 1e-3);

        let tm = operands(find("Tm"));
        let expected = [1.0, 0.0, 0.0, 1.0, 72.0, 792.0 - 250.0 * 0.72];
        for (actual, expected) in tm.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-3, "{tm:?}");
        }

        let tj = find("Tj");
        assert_eq!(tj.operands[0].as_str().unwrap(), b"Hello ");

        // Operators come in the order the reader expects.
        let order = content
            .operations
            .iter()
            .map(|op| op.operator.as_str())
            .filter(|op| ["BT", "Tr", "Tf", "Tm", "Tz", "Tj", "ET"].contains(op))
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["BT", "Tr", "Tf", "Tm", "Tz", "Tj", "ET"]);
    }

    #[test]
    fn rotated_words_get_rotated_text_matrix() {
        let (page, mut geometry) = hello_page();
        geometry.words[0].rotation_radians = std::f64::consts::FRAC_PI_2;
        let bytes = render_overlay_page(&page, &geometry, &TIMES_ROMAN).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        let content = doc.get_and_decode_page_content(doc.get_pages()[&1]).unwrap();
        let tm = content
            .operations
            .iter()
            .find(|op| op.operator == "Tm")
            .map(operands)
            .unwrap();
        // Clockwise on the page: text advances downwards.
        assert!(tm[0].abs() < 1e-6);
        assert!((tm[1] + 1.0).abs() < 1e-6);
        assert!((tm[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn image_only_pages_have_no_text_object() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, image::Rgb([9, 9, 9])));
        let page = RasterPage::from_image(0, &image).unwrap();
        let geometry = PageGeometry::image_only(40, 20).unwrap();
        let bytes = render_overlay_page(&page, &geometry, &TIMES_ROMAN).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        let content = doc.get_and_decode_page_content(doc.get_pages()[&1]).unwrap();
        assert!(content.operations.iter().all(|op| op.operator != "BT"));
        assert!(content.operations.iter().any(|op| op.operator == "Do"));
    }

    #[test]
    fn jpeg_pages_are_embedded_unchanged() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, image::Rgb([200, 10, 10])));
        let mut jpeg = vec![];
        image
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        assert_eq!(jpeg_components(&jpeg), Some(3));

        let page = RasterPage::from_encoded(0, jpeg.clone()).unwrap();
        let embedded = EmbeddedImage::from_page(&page).unwrap();
        assert_eq!(embedded.data, jpeg);
        assert!(!embedded.gray);
    }

    #[test]
    fn alpha_is_flattened_onto_white() {
        let mut image = RgbaImage::from_pixel(2, 1, image::Rgba([0, 0, 0, 0]));
        image.put_pixel(1, 0, image::Rgba([0, 0, 0, 255]));
        let samples = flatten_alpha(&DynamicImage::ImageRgba8(image), false);
        assert_eq!(samples, vec![255, 255, 255, 0, 0, 0]);
    }
}
