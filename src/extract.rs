//! Raw bytes to normalized text.
//!
//! Plain files are decoded as UTF-8: a NUL byte near the start marks the file
//! as binary, and invalid UTF-8 marks it undecodable. Both are skips rather
//! than failures. PDF and OOXML (docx, pptx, xlsx) are extracted by format;
//! a file that claims one of those formats but cannot be parsed is an error.
//!
//! Every successful path ends in [`normalize_newlines`], so chunk offsets are
//! always relative to `\n`-terminated text without a byte-order mark.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::models::SkipReason;

/// How many leading bytes are inspected for NUL when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8192;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single OOXML part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Outcome of turning a file's bytes into indexable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Text(String),
    Skip(SkipReason),
}

/// Container formats recognised by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Plain,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

fn format_for(path: &Path) -> Format {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => Format::Pdf,
        Some("docx") => Format::Docx,
        Some("pptx") => Format::Pptx,
        Some("xlsx") => Format::Xlsx,
        _ => Format::Plain,
    }
}

/// Extract normalized text from `bytes`, dispatching on the extension of `path`.
pub fn extract(path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = match format_for(path) {
        Format::Plain => {
            return Ok(match decode_text(bytes) {
                Ok(text) => Extracted::Text(text),
                Err(reason) => Extracted::Skip(reason),
            })
        }
        Format::Pdf => extract_pdf(bytes)?,
        Format::Docx => extract_docx(bytes)?,
        Format::Pptx => extract_pptx(bytes)?,
        Format::Xlsx => extract_xlsx(bytes)?,
    };
    Ok(Extracted::Text(normalize_newlines(&text)))
}

/// Decode a plain-text file, rejecting binary and non-UTF-8 content.
pub fn decode_text(bytes: &[u8]) -> Result<String, SkipReason> {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Err(SkipReason::Binary);
    }
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|_| SkipReason::Undecodable)?;
    Ok(normalize_newlines(text))
}

/// Strip a leading BOM and turn `\r\n` and lone `\r` into `\n`.
pub fn normalize_newlines(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "{} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Numbered parts such as `ppt/slides/slide3.xml`, in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of every `<t>` element, one line per `<p>` paragraph.
fn paragraph_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    paragraph_text(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_entry(&mut archive, &name)?;
        let text = paragraph_text(&xml)?;
        if !text.trim().is_empty() {
            slides.push(text);
        }
    }
    // blank line between slides so the document chunker sees paragraph breaks
    Ok(slides.join("\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let has_shared = archive.file_names().any(|n| n == "xl/sharedStrings.xml");
    let shared = if has_shared {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            sheets.push(cells.join(" "));
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    let text = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one sheet: shared strings resolved, inline strings and numbers kept as written.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut cells = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared_ref = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_ref = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                let value = raw.trim();
                if value.is_empty() {
                    // nothing
                } else if shared_ref {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_ref = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                zip.start_file(*name, opts).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn plain_text_is_decoded_and_normalized() {
        let out = extract(Path::new("notes.txt"), b"\xEF\xBB\xBFone\r\ntwo\rthree").unwrap();
        assert_eq!(out, Extracted::Text("one\ntwo\nthree".into()));
    }

    #[test]
    fn nul_bytes_mark_binary() {
        let out = extract(Path::new("blob.dat"), b"PK\x03\x04\x00\x00garbage").unwrap();
        assert_eq!(out, Extracted::Skip(SkipReason::Binary));
    }

    #[test]
    fn invalid_utf8_is_undecodable() {
        let out = extract(Path::new("latin1.txt"), b"caf\xe9 au lait").unwrap();
        assert_eq!(out, Extracted::Skip(SkipReason::Undecodable));
    }

    #[test]
    fn nul_after_sniff_window_is_not_binary_but_still_decodes() {
        let mut bytes = vec![b'a'; BINARY_SNIFF_BYTES];
        bytes.push(0);
        let text = decode_text(&bytes).unwrap();
        assert_eq!(text.len(), BINARY_SNIFF_BYTES + 1);
    }

    #[test]
    fn invalid_pdf_is_an_error() {
        let err = extract(Path::new("report.PDF"), b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_is_an_error_for_docx() {
        let err = extract(Path::new("memo.docx"), b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let doc = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        let out = extract(Path::new("memo.docx"), &bytes).unwrap();
        assert_eq!(out, Extracted::Text("Hello world\nSecond & last\n".into()));
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sld>"#,
                text
            )
        };
        let s10 = slide("tenth");
        let s2 = slide("second");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", &s10),
            ("ppt/slides/slide2.xml", &s2),
        ]);
        let Extracted::Text(text) = extract(Path::new("deck.pptx"), &bytes).unwrap() else {
            panic!("expected text");
        };
        let second = text.find("second").unwrap();
        let tenth = text.find("tenth").unwrap();
        assert!(second < tenth);
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let shared = r#"<sst><si><t>alpha</t></si><si><t>beta</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData><row>
            <c r="A1" t="s"><v>1</v></c><c r="B1"><v>42</v></c><c r="C1" t="s"><v>0</v></c>
        </row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let out = extract(Path::new("book.xlsx"), &bytes).unwrap();
        assert_eq!(out, Extracted::Text("beta 42 alpha".into()));
    }
}
