//! Text and image extraction from raw document bytes.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::domain::extraction::{DocumentType, ImageData};
use crate::error::{ExtractError, ExtractResult};
use crate::extraction::context::DocumentContext;

/// Extract document text for the text-based strategy.
///
/// PDF pages come back labeled and joined; DOCX paragraphs and tables are
/// flattened into lines. A document with no extractable text is an error,
/// the router should not have sent it here.
pub fn parse_document(context: &DocumentContext, all_pages: bool) -> ExtractResult<String> {
    let doc_type = context.doc_type();
    match doc_type {
        DocumentType::Pdf => parse_pdf(context.raw_bytes()?, all_pages),
        DocumentType::Docx => parse_docx(context.raw_bytes()?),
        DocumentType::Png | DocumentType::Jpg | DocumentType::Jpeg => {
            Err(ExtractError::Extraction(format!(
                "cannot parse {doc_type} as text, use parse_image_document"
            )))
        }
    }
}

fn parse_pdf(bytes: &[u8], all_pages: bool) -> ExtractResult<String> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::PdfParsing(e.to_string()))?;

    let limit = if all_pages { pages.len() } else { 1.min(pages.len()) };
    let mut sections = Vec::with_capacity(limit);
    for (index, page) in pages.iter().take(limit).enumerate() {
        let text = page.trim();
        if !text.is_empty() {
            sections.push(format!("=== Page {} ===\n{text}", index + 1));
        }
    }

    if sections.is_empty() {
        return Err(ExtractError::PdfParsing(
            "PDF contains no extractable text".to_string(),
        ));
    }
    debug!(pages = pages.len(), extracted = sections.len(), "Parsed PDF text");
    Ok(sections.join("\n\n"))
}

fn parse_docx(bytes: &[u8]) -> ExtractResult<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::DocxParsing(format!("not a valid DOCX archive: {e}")))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::DocxParsing(format!("missing word/document.xml: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::DocxParsing(format!("unreadable word/document.xml: {e}")))?;

    let text = flatten_docx_xml(&xml)?;
    if text.trim().is_empty() {
        return Err(ExtractError::DocxParsing(
            "DOCX contains no extractable text".to_string(),
        ));
    }
    Ok(text)
}

/// Walk WordprocessingML, emitting one line per paragraph and one line per
/// table row with cells joined by " | ".
fn flatten_docx_xml(xml: &str) -> ExtractResult<String> {
    let mut reader = Reader::from_str(xml);

    let mut lines: Vec<String> = Vec::new();
    let mut paragraph = String::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut table_depth: u32 = 0;
    let mut in_cell = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:tbl" => table_depth += 1,
                b"w:tr" if table_depth > 0 => row_cells.clear(),
                b"w:tc" if table_depth > 0 => {
                    in_cell = true;
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:tbl" => table_depth = table_depth.saturating_sub(1),
                b"w:tr" if table_depth > 0 => {
                    if row_cells.iter().any(|cell| !cell.is_empty()) {
                        lines.push(row_cells.join(" | "));
                    }
                }
                b"w:tc" if table_depth > 0 => {
                    in_cell = false;
                    row_cells.push(paragraph.trim().to_string());
                    paragraph.clear();
                }
                b"w:p" if !in_cell => {
                    let line = paragraph.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ExtractError::DocxParsing(format!("bad XML text node: {e}")))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Empty(e)) => {
                // Tabs and breaks inside runs become plain whitespace.
                match e.name().as_ref() {
                    b"w:tab" => paragraph.push('\t'),
                    b"w:br" => paragraph.push(' '),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ExtractError::DocxParsing(format!(
                    "malformed document XML: {e}"
                )))
            }
        }
    }

    Ok(lines.join("\n"))
}

/// Decode and validate an image for the vision strategy.
pub fn parse_image_document(context: &DocumentContext) -> ExtractResult<ImageData> {
    use image::GenericImageView;

    let doc_type = context.doc_type();
    if !doc_type.is_image() {
        return Err(ExtractError::Extraction(format!(
            "cannot parse {doc_type} as an image"
        )));
    }

    let bytes = context.raw_bytes()?;
    let format = image::guess_format(bytes)
        .map_err(|e| ExtractError::ImageParsing(format!("unrecognized image data: {e}")))?;
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractError::ImageParsing(format!("undecodable image: {e}")))?;

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ExtractError::ImageParsing(
            "image has zero dimensions".to_string(),
        ));
    }

    // The decode above is the validity check. The untouched payload is
    // what travels on to the vision backend.
    Ok(ImageData {
        base64_data: context.base64_data().trim().to_string(),
        media_type: doc_type.media_type().to_string(),
        width,
        height,
        mode: color_mode_name(img.color()).to_string(),
        format: format!("{format:?}").to_lowercase(),
    })
}

/// PIL-style color mode label for image metadata.
pub(crate) fn color_mode_name(color: image::ColorType) -> &'static str {
    use image::ColorType;
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "OTHER",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;

    /// Build a minimal DOCX archive holding the given WordprocessingML body.
    pub(crate) fn docx_bytes(body_xml: &str) -> Vec<u8> {
        let document = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body_xml}</w:body></w:document>"#
        );
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("word/", options).unwrap();
        writer.start_file("word/document.xml", options).unwrap();
        writer.write_all(document.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    pub(crate) fn docx_context(body_xml: &str) -> DocumentContext {
        DocumentContext::new(DocumentType::Docx, BASE64_STANDARD.encode(docx_bytes(body_xml)))
    }

    /// Build a digital PDF with one text run per page.
    pub(crate) fn pdf_bytes(pages: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    pub(crate) fn pdf_context(pages: &[&str]) -> DocumentContext {
        DocumentContext::new(DocumentType::Pdf, BASE64_STANDARD.encode(pdf_bytes(pages)))
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let context = docx_context(
            "<w:p><w:r><w:t>Invoice 1042</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Vendor: Acme Corp</w:t></w:r></w:p>",
        );
        let text = parse_document(&context, true).unwrap();
        assert_eq!(text, "Invoice 1042\nVendor: Acme Corp");
    }

    #[test]
    fn docx_table_rows_join_cells_with_pipes() {
        let context = docx_context(
            "<w:tbl><w:tr>\
               <w:tc><w:p><w:r><w:t>Item</w:t></w:r></w:p></w:tc>\
               <w:tc><w:p><w:r><w:t>Price</w:t></w:r></w:p></w:tc>\
             </w:tr><w:tr>\
               <w:tc><w:p><w:r><w:t>Widget</w:t></w:r></w:p></w:tc>\
               <w:tc><w:p><w:r><w:t>9.99</w:t></w:r></w:p></w:tc>\
             </w:tr></w:tbl>",
        );
        let text = parse_document(&context, true).unwrap();
        assert_eq!(text, "Item | Price\nWidget | 9.99");
    }

    #[test]
    fn empty_docx_is_a_parsing_error() {
        let context = docx_context("<w:p></w:p>");
        assert!(matches!(
            parse_document(&context, true),
            Err(ExtractError::DocxParsing(_))
        ));
    }

    #[test]
    fn invalid_docx_bytes_are_rejected() {
        let context = DocumentContext::new(
            DocumentType::Docx,
            BASE64_STANDARD.encode(b"not a zip archive"),
        );
        assert!(matches!(
            parse_document(&context, true),
            Err(ExtractError::DocxParsing(_))
        ));
    }

    #[test]
    fn pdf_pages_are_labeled_and_joined() {
        let context = pdf_context(&["Invoice INV-1042 total 99.50", "Payment terms net-30"]);
        let text = parse_document(&context, true).unwrap();

        let first = text.find("=== Page 1 ===").expect("page 1 label");
        let second = text.find("=== Page 2 ===").expect("page 2 label");
        assert!(first < second);
        assert!(text.contains("INV-1042"));
        assert!(text.contains("net-30"));
    }

    #[test]
    fn pdf_single_page_mode_stops_after_the_first_page() {
        let context = pdf_context(&["First page body", "Second page body"]);
        let text = parse_document(&context, false).unwrap();

        assert!(text.contains("=== Page 1 ==="));
        assert!(!text.contains("=== Page 2 ==="));
    }

    #[test]
    fn invalid_pdf_bytes_are_rejected() {
        let context =
            DocumentContext::new(DocumentType::Pdf, BASE64_STANDARD.encode(b"not a pdf"));
        assert!(matches!(
            parse_document(&context, true),
            Err(ExtractError::PdfParsing(_))
        ));
    }

    #[test]
    fn image_types_refuse_text_parsing() {
        let context = DocumentContext::new(DocumentType::Png, "aGk=");
        assert!(matches!(
            parse_document(&context, true),
            Err(ExtractError::Extraction(_))
        ));
    }

    #[test]
    fn png_image_metadata_is_extracted() {
        let mut png = Cursor::new(Vec::new());
        image::RgbImage::new(12, 8)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let encoded = BASE64_STANDARD.encode(png.into_inner());

        let context = DocumentContext::new(DocumentType::Png, encoded.clone());
        let data = parse_image_document(&context).unwrap();
        assert_eq!(data.width, 12);
        assert_eq!(data.height, 8);
        assert_eq!(data.mode, "RGB");
        assert_eq!(data.media_type, "image/png");
        assert_eq!(data.format, "png");
        // RGB images pass through without re-encoding.
        assert_eq!(data.base64_data, encoded);
    }

    #[test]
    fn rgba_image_reports_mode_and_passes_payload_through() {
        let mut png = Cursor::new(Vec::new());
        image::RgbaImage::new(4, 4)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let encoded = BASE64_STANDARD.encode(png.into_inner());

        let context = DocumentContext::new(DocumentType::Png, encoded.clone());
        let data = parse_image_document(&context).unwrap();
        assert_eq!(data.mode, "RGBA");
        assert_eq!(data.base64_data, encoded);
    }

    #[test]
    fn undecodable_image_is_an_image_error() {
        let context = DocumentContext::new(
            DocumentType::Jpg,
            BASE64_STANDARD.encode(b"garbage bytes"),
        );
        assert!(matches!(
            parse_image_document(&context),
            Err(ExtractError::ImageParsing(_))
        ));
    }
}
