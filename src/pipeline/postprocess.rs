//! PDF post-processing with lopdf: merge, watermark, signature.
//!
//! ## Why spawn_blocking?
//!
//! Parsing and re-serialising a PDF is CPU-bound and, for large merges,
//! takes long enough to stall a Tokio worker. [`apply`] runs the whole
//! plan on the blocking pool.
//!
//! ## Overlay model
//!
//! Stamps never rewrite existing content streams. The page's `Contents`
//! becomes `[q, <original…>, Q, <overlay>]`: the original drawing state is
//! saved and restored around the page body, so whatever transform or colour
//! the page leaves behind cannot skew the overlay.

use crate::error::Html2PdfError;
use crate::request::{Signature, Watermark};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeMap;
use tracing::{debug, info};

const WATERMARK_FONT: &str = "EqWmF";
const WATERMARK_GSTATE: &str = "EqWmGS";
const SIGNATURE_XOBJECT: &str = "EqSig";

/// Page attributes that may live on an ancestor `Pages` node.
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Everything to apply to a freshly rendered PDF, in order.
#[derive(Debug, Clone, Default)]
pub struct PostProcessPlan {
    /// Downloaded PDFs appended after the rendered pages.
    pub merge_sources: Vec<Vec<u8>>,
    pub watermark: Option<Watermark>,
    pub signature: Option<Signature>,
}

impl PostProcessPlan {
    pub fn is_empty(&self) -> bool {
        self.merge_sources.is_empty() && self.watermark.is_none() && self.signature.is_none()
    }
}

/// Apply `plan` to `pdf` on the blocking pool.
pub async fn apply(pdf: Vec<u8>, plan: PostProcessPlan) -> Result<Vec<u8>, Html2PdfError> {
    if plan.is_empty() {
        return Ok(pdf);
    }
    tokio::task::spawn_blocking(move || apply_blocking(&pdf, &plan))
        .await
        .map_err(|e| Html2PdfError::Internal(format!("Post-process task panicked: {}", e)))?
}

/// Blocking implementation: merge → watermark → signature → save.
pub fn apply_blocking(pdf: &[u8], plan: &PostProcessPlan) -> Result<Vec<u8>, Html2PdfError> {
    let mut doc = load(pdf)?;

    if !plan.merge_sources.is_empty() {
        let mut documents = Vec::with_capacity(plan.merge_sources.len() + 1);
        documents.push(doc);
        for source in &plan.merge_sources {
            documents.push(load(source)?);
        }
        doc = merge_documents(documents)?;
        info!("Merged {} extra document(s)", plan.merge_sources.len());
    }

    if let Some(ref watermark) = plan.watermark {
        stamp_watermark(&mut doc, watermark)?;
    }

    if let Some(ref signature) = plan.signature {
        stamp_signature(&mut doc, signature)?;
    }

    save(&mut doc)
}

fn pp_err(e: lopdf::Error) -> Html2PdfError {
    Html2PdfError::PostProcessFailed(e.to_string())
}

fn load(bytes: &[u8]) -> Result<Document, Html2PdfError> {
    let doc = Document::load_mem(bytes).map_err(pp_err)?;
    if doc.is_encrypted() {
        return Err(Html2PdfError::PostProcessFailed(
            "encrypted PDFs cannot be modified".into(),
        ));
    }
    Ok(doc)
}

fn save(doc: &mut Document) -> Result<Vec<u8>, Html2PdfError> {
    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| Html2PdfError::PostProcessFailed(format!("cannot write PDF: {e}")))?;
    Ok(out)
}

// ── Merge ────────────────────────────────────────────────────────────────

/// Concatenate documents into one, preserving page order.
///
/// Object ids are renumbered per document so they cannot collide; a single
/// page tree is rebuilt from the first catalog. Outlines are dropped because
/// their destinations would point into the discarded page trees.
pub fn merge_documents(documents: Vec<Document>) -> Result<Document, Html2PdfError> {
    let mut max_id = 1;
    let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for mut doc in documents {
        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        for (_, page_id) in doc.get_pages() {
            let mut page = doc.get_dictionary(page_id).map_err(pp_err)?.clone();
            // Attributes inherited from intermediate page-tree nodes would be
            // lost when the tree is rebuilt, so pin them on the page itself.
            for key in INHERITABLE {
                if page.get(key).is_err() {
                    if let Some(value) = inherited(&doc, page_id, key) {
                        page.set(key.to_vec(), value);
                    }
                }
            }
            pages.push((page_id, page));
        }
        objects.extend(doc.objects);
    }

    let mut merged = Document::with_version("1.7");
    let mut catalog: Option<(ObjectId, Dictionary)> = None;
    let mut pages_root: Option<ObjectId> = None;

    for (id, object) in objects {
        match object.type_name().ok() {
            Some(b"Catalog") => {
                if catalog.is_none() {
                    catalog = Some((id, object.as_dict().map_err(pp_err)?.clone()));
                }
            }
            Some(b"Pages") => {
                if pages_root.is_none() {
                    pages_root = Some(id);
                }
            }
            Some(b"Page") | Some(b"Outlines") | Some(b"Outline") => {}
            _ => {
                merged.objects.insert(id, object);
            }
        }
    }

    let (catalog_id, mut catalog_dict) = catalog.ok_or_else(|| {
        Html2PdfError::PostProcessFailed("no document catalog found while merging".into())
    })?;
    let pages_id = pages_root.ok_or_else(|| {
        Html2PdfError::PostProcessFailed("no page tree found while merging".into())
    })?;

    let kids: Vec<Object> = pages.iter().map(|(id, _)| Object::Reference(*id)).collect();
    let count = pages.len() as i64;
    for (id, mut page) in pages {
        page.set("Parent", pages_id);
        merged.objects.insert(id, Object::Dictionary(page));
    }

    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );

    catalog_dict.set("Pages", pages_id);
    catalog_dict.remove(b"Outlines");
    merged.objects.insert(catalog_id, Object::Dictionary(catalog_dict));
    merged.trailer.set("Root", catalog_id);

    merged.max_id = merged.objects.keys().map(|(n, _)| *n).max().unwrap_or(0);
    merged.renumber_objects();
    Ok(merged)
}

// ── Watermark ────────────────────────────────────────────────────────────

fn stamp_watermark(doc: &mut Document, watermark: &Watermark) -> Result<(), Html2PdfError> {
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let gstate_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => watermark.opacity,
        "CA" => watermark.opacity,
    });

    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let take = if watermark.first_page_only { 1 } else { page_ids.len() };

    for &page_id in page_ids.iter().take(take) {
        let (width, height) = page_size(doc, page_id);
        let content = watermark_content(watermark, width, height);
        set_page_resource(doc, page_id, b"Font", WATERMARK_FONT, font_id)?;
        set_page_resource(doc, page_id, b"ExtGState", WATERMARK_GSTATE, gstate_id)?;
        overlay(doc, page_id, content.encode().map_err(pp_err)?)?;
    }
    debug!("Watermarked {} page(s)", take.min(page_ids.len()));
    Ok(())
}

/// Text centred on the page, rotated about its centre.
fn watermark_content(watermark: &Watermark, page_width: f32, page_height: f32) -> Content {
    let radians = watermark.rotation.to_radians();
    let (sin, cos) = radians.sin_cos();
    // Helvetica averages roughly half an em per glyph; close enough to centre.
    let text_width = watermark.text.chars().count() as f32 * watermark.font_size * 0.5;

    Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new("gs", vec![Object::Name(WATERMARK_GSTATE.as_bytes().to_vec())]),
            Operation::new("g", vec![watermark.gray.into()]),
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![
                    Object::Name(WATERMARK_FONT.as_bytes().to_vec()),
                    watermark.font_size.into(),
                ],
            ),
            Operation::new(
                "Tm",
                vec![
                    cos.into(),
                    sin.into(),
                    (-sin).into(),
                    cos.into(),
                    (page_width / 2.0).into(),
                    (page_height / 2.0).into(),
                ],
            ),
            Operation::new(
                "Td",
                vec![
                    (-text_width / 2.0).into(),
                    (-watermark.font_size / 3.0).into(),
                ],
            ),
            Operation::new(
                "Tj",
                vec![Object::String(latin1(&watermark.text), StringFormat::Literal)],
            ),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ],
    }
}

/// WinAnsi is close enough to Latin-1 for a watermark; anything else becomes '?'.
fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
        .collect()
}

// ── Signature ────────────────────────────────────────────────────────────

fn stamp_signature(doc: &mut Document, signature: &Signature) -> Result<(), Html2PdfError> {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let target = signature.page.unwrap_or(page_ids.len());
    if target == 0 || target > page_ids.len() {
        return Err(Html2PdfError::InvalidRequest(format!(
            "signature.page {} is out of range (document has {} pages)",
            target,
            page_ids.len()
        )));
    }
    let page_id = page_ids[target - 1];

    let bytes = signature.image_bytes()?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| Html2PdfError::InvalidRequest(format!("signature.image: {e}")))?;
    let rgba = image.to_rgba8();
    let (px_w, px_h) = rgba.dimensions();

    let mut rgb = Vec::with_capacity((px_w * px_h * 3) as usize);
    let mut alpha = Vec::with_capacity((px_w * px_h) as usize);
    for pixel in rgba.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => px_w as i64,
            "Height" => px_h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => px_w as i64,
            "Height" => px_h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ));

    let draw_w = signature.width;
    let draw_h = signature.width * px_h as f32 / px_w as f32;
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    draw_w.into(),
                    Object::Integer(0),
                    Object::Integer(0),
                    draw_h.into(),
                    signature.x.into(),
                    signature.y.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(SIGNATURE_XOBJECT.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };

    set_page_resource(doc, page_id, b"XObject", SIGNATURE_XOBJECT, image_id)?;
    overlay(doc, page_id, content.encode().map_err(pp_err)?)?;
    debug!("Signature stamped on page {}", target);
    Ok(())
}

// ── Page helpers ─────────────────────────────────────────────────────────

/// Look up a page attribute, walking up the page tree for inherited values.
fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    // Bounded walk: malformed trees can contain Parent cycles.
    for _ in 0..64 {
        if let Ok(value) = current.get(key) {
            return Some(resolve(doc, value).clone());
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Page width/height in points from the (possibly inherited) MediaBox; A4 if absent.
fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let media_box = inherited(doc, page_id, b"MediaBox");
    let values: Vec<f32> = match media_box {
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|o| number(resolve(doc, o)))
            .collect(),
        _ => Vec::new(),
    };
    if values.len() == 4 {
        ((values[2] - values[0]).abs(), (values[3] - values[1]).abs())
    } else {
        (595.0, 842.0)
    }
}

/// Register `name → id` under a resource category on the page itself.
fn set_page_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &[u8],
    name: &str,
    id: ObjectId,
) -> Result<(), Html2PdfError> {
    let mut resources = match inherited(doc, page_id, b"Resources") {
        Some(Object::Dictionary(d)) => d,
        _ => Dictionary::new(),
    };
    let mut entries = match resources.get(category) {
        Ok(Object::Dictionary(d)) => d.clone(),
        Ok(Object::Reference(rid)) => doc
            .get_dictionary(*rid)
            .cloned()
            .unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    };
    entries.set(name, id);
    resources.set(category.to_vec(), Object::Dictionary(entries));

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(pp_err)?;
    page.set("Resources", Object::Dictionary(resources));
    Ok(())
}

/// Draw `content` above everything already on the page.
fn overlay(doc: &mut Document, page_id: ObjectId, content: Vec<u8>) -> Result<(), Html2PdfError> {
    let existing: Vec<Object> = {
        let page = doc.get_dictionary(page_id).map_err(pp_err)?;
        match page.get(b"Contents") {
            Ok(Object::Reference(id)) => match doc.get_object(*id) {
                Ok(Object::Array(items)) => items.clone(),
                _ => vec![Object::Reference(*id)],
            },
            Ok(Object::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    };

    let save_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let restore_id = doc.add_object(Stream::new(Dictionary::new(), b"\nQ\n".to_vec()));
    let overlay_id = doc.add_object(Stream::new(Dictionary::new(), content));

    let mut contents = Vec::with_capacity(existing.len() + 3);
    contents.push(Object::Reference(save_id));
    contents.extend(existing);
    contents.push(Object::Reference(restore_id));
    contents.push(Object::Reference(overlay_id));

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(pp_err)?;
    page.set("Contents", Object::Array(contents));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::inspect::{page_count, test_support::sample_pdf};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn page_resources(pdf: &[u8], page: u32) -> Dictionary {
        let doc = Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page];
        match inherited(&doc, page_id, b"Resources") {
            Some(Object::Dictionary(d)) => d,
            other => panic!("no resources: {other:?}"),
        }
    }

    fn has_entry(resources: &Dictionary, category: &[u8], name: &str) -> bool {
        matches!(resources.get(category), Ok(Object::Dictionary(d)) if d.get(name.as_bytes()).is_ok())
    }

    fn signature_png() -> String {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 20, Rgba([0, 0, 80, 200])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(buf))
    }

    #[test]
    fn empty_plan_is_noop() {
        let pdf = sample_pdf(1);
        assert!(PostProcessPlan::default().is_empty());
        let out = tokio_test::block_on(apply(pdf.clone(), PostProcessPlan::default())).unwrap();
        assert_eq!(out, pdf);
    }

    #[test]
    fn merge_appends_pages_in_order() {
        let plan = PostProcessPlan {
            merge_sources: vec![sample_pdf(3), sample_pdf(1)],
            ..Default::default()
        };
        let out = apply_blocking(&sample_pdf(2), &plan).unwrap();
        assert_eq!(page_count(&out).unwrap(), 6);
    }

    #[test]
    fn merged_pages_keep_inherited_media_box() {
        let plan = PostProcessPlan {
            merge_sources: vec![sample_pdf(1)],
            ..Default::default()
        };
        let out = apply_blocking(&sample_pdf(1), &plan).unwrap();
        let doc = Document::load_mem(&out).unwrap();
        for (_, page_id) in doc.get_pages() {
            assert_eq!(page_size(&doc, page_id), (595.0, 842.0));
        }
    }

    #[test]
    fn watermark_every_page() {
        let plan = PostProcessPlan {
            watermark: Some(Watermark {
                text: "DRAFT".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = apply_blocking(&sample_pdf(3), &plan).unwrap();
        assert_eq!(page_count(&out).unwrap(), 3);
        for page in 1..=3 {
            let res = page_resources(&out, page);
            assert!(has_entry(&res, b"Font", WATERMARK_FONT), "page {page}");
            assert!(has_entry(&res, b"ExtGState", WATERMARK_GSTATE));
            // The page's own font must survive the resource rewrite.
            assert!(has_entry(&res, b"Font", "F1"));
        }
    }

    #[test]
    fn watermark_first_page_only() {
        let plan = PostProcessPlan {
            watermark: Some(Watermark {
                text: "COPY".into(),
                first_page_only: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = apply_blocking(&sample_pdf(2), &plan).unwrap();
        assert!(has_entry(&page_resources(&out, 1), b"Font", WATERMARK_FONT));
        assert!(!has_entry(&page_resources(&out, 2), b"Font", WATERMARK_FONT));
    }

    #[test]
    fn watermark_content_is_centred() {
        let w = Watermark {
            text: "ABCD".into(),
            rotation: 0.0,
            font_size: 10.0,
            ..Default::default()
        };
        let content = watermark_content(&w, 200.0, 100.0);
        let tm = content
            .operations
            .iter()
            .find(|op| op.operator == "Tm")
            .unwrap();
        assert_eq!(tm.operands[4], Object::Real(100.0));
        assert_eq!(tm.operands[5], Object::Real(50.0));
        let td = content
            .operations
            .iter()
            .find(|op| op.operator == "Td")
            .unwrap();
        assert_eq!(td.operands[0], Object::Real(-10.0));
    }

    #[test]
    fn signature_defaults_to_last_page() {
        let plan = PostProcessPlan {
            signature: Some(Signature {
                image: signature_png(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = apply_blocking(&sample_pdf(3), &plan).unwrap();
        assert!(has_entry(&page_resources(&out, 3), b"XObject", SIGNATURE_XOBJECT));
        assert!(!has_entry(&page_resources(&out, 1), b"XObject", SIGNATURE_XOBJECT));
    }

    #[test]
    fn signature_page_out_of_range() {
        let plan = PostProcessPlan {
            signature: Some(Signature {
                image: signature_png(),
                page: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            apply_blocking(&sample_pdf(2), &plan),
            Err(Html2PdfError::InvalidRequest(_))
        ));
    }

    #[test]
    fn garbage_input_fails_cleanly() {
        let plan = PostProcessPlan {
            merge_sources: vec![b"%PDF-1.4 not really".to_vec()],
            ..Default::default()
        };
        assert!(matches!(
            apply_blocking(&sample_pdf(1), &plan),
            Err(Html2PdfError::PostProcessFailed(_))
        ));
    }

    #[test]
    fn latin1_replaces_wide_chars() {
        assert_eq!(latin1("Café ✓"), b"Caf\xe9 ?".to_vec());
    }
}
