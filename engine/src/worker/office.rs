//! In-process text extraction for PDF, Word, PowerPoint and spreadsheet files
//!
//! Every reader here is blocking; callers run them on the blocking pool.

use calamine::{open_workbook_auto, Data, Reader};
use courier_sdk::DispatchError;
use quick_xml::events::Event;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Largest XML part read out of an office archive
const MAX_PART_BYTES: u64 = 32 * 1024 * 1024;

fn failed(what: &str, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Extraction(format!("{}: {}", what, e))
}

/// Extract the text of `path`, dispatching on the lowercase extension
pub fn read_office(path: &Path, ext: &str) -> Result<String, DispatchError> {
    match ext {
        "pdf" => read_pdf(path),
        "docx" => read_docx(path),
        "pptx" => read_pptx(path),
        "xlsx" | "xlsm" | "xls" | "ods" => read_spreadsheet(path),
        other => Err(DispatchError::Extraction(format!(
            "no in-process reader for .{}",
            other
        ))),
    }
}

/// Text of every page, pages separated by form feeds
pub fn read_pdf(path: &Path) -> Result<String, DispatchError> {
    pdf_extract::extract_text(path).map_err(|e| failed("Failed to extract PDF text", e))
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<BufReader<File>>, DispatchError> {
    let file = File::open(path).map_err(|e| failed("Failed to open document", e))?;
    zip::ZipArchive::new(BufReader::new(file)).map_err(|e| failed("Not an office archive", e))
}

fn read_part(
    archive: &mut zip::ZipArchive<BufReader<File>>,
    name: &str,
) -> Result<String, DispatchError> {
    let part = archive
        .by_name(name)
        .map_err(|e| failed(&format!("Missing {}", name), e))?;
    let mut xml = String::new();
    part.take(MAX_PART_BYTES)
        .read_to_string(&mut xml)
        .map_err(|e| failed(&format!("Failed to read {}", name), e))?;
    Ok(xml)
}

/// Paragraph text of a Word document
pub fn read_docx(path: &Path) -> Result<String, DispatchError> {
    let mut archive = open_archive(path)?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    xml_paragraphs(&xml, b"w:t", b"w:p")
}

/// Slide number from `ppt/slides/slide<N>.xml`
fn slide_number(name: &str) -> Option<u32> {
    name.strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// Text of every slide in presentation order
pub fn read_pptx(path: &Path) -> Result<String, DispatchError> {
    let mut archive = open_archive(path)?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| slide_number(name).map(|n| (n, name.to_string())))
        .collect();
    // slide10 sorts after slide9, not after slide1
    slides.sort();

    let mut output = String::new();
    for (number, name) in &slides {
        let xml = read_part(&mut archive, name)?;
        let text = xml_paragraphs(&xml, b"a:t", b"a:p")?;
        if !output.is_empty() {
            output.push_str("\n\n");
        }
        output.push_str(&format!("Slide {}\n{}", number, text));
    }
    Ok(output)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Every sheet as tab-separated rows under a shape line
pub fn read_spreadsheet(path: &Path) -> Result<String, DispatchError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| failed("Failed to open spreadsheet", e))?;

    let mut output = String::new();
    for name in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                tracing::debug!("Skipping sheet {}: {}", name, e);
                continue;
            }
        };
        let (rows, columns) = range.get_size();

        if !output.is_empty() {
            output.push_str("\n\n");
        }
        output.push_str(&format!("Sheet {}: {} rows, {} columns\n", name, rows, columns));
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            output.push_str(cells.join("\t").trim_end());
            output.push('\n');
        }
    }
    Ok(output)
}

/// Collect the text nodes named `text_tag`, one line per `para_tag`
fn xml_paragraphs(xml: &str, text_tag: &[u8], para_tag: &[u8]) -> Result<String, DispatchError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut lines: Vec<String> = Vec::new();
    let mut paragraph = String::new();
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == text_tag => inside = true,
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:tab" => paragraph.push('\t'),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:br" => paragraph.push('\n'),
            Ok(Event::End(e)) if e.name().as_ref() == text_tag => inside = false,
            Ok(Event::End(e)) if e.name().as_ref() == para_tag => {
                let line = paragraph.trim();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
                paragraph.clear();
            }
            Ok(Event::Text(e)) if inside => {
                let text = e.unescape().map_err(|e| failed("Bad XML text", e))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(failed("XML parse error", e)),
            _ => {}
        }
    }

    let tail = paragraph.trim();
    if !tail.is_empty() {
        lines.push(tail.to_string());
    }
    Ok(lines.join("\n"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_docx_paragraphs_and_entities() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "memo.docx",
            &samples::docx(&["Budget &amp; plan", "", "Second paragraph"]),
        );

        let text = read_office(&path, "docx").unwrap();
        assert_eq!(text, "Budget & plan\nSecond paragraph");
    }

    #[test]
    fn test_pptx_slides_in_numeric_order() {
        let dir = tempdir().unwrap();
        let titles: Vec<String> = (1..=10).map(|n| format!("Topic {}", n)).collect();
        let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        let path = write(dir.path(), "deck.pptx", &samples::pptx(&refs));

        let text = read_office(&path, "pptx").unwrap();
        assert!(text.starts_with("Slide 1\nTopic 1\n\nSlide 2\nTopic 2"));
        assert!(text.ends_with("Slide 10\nTopic 10"));
    }

    #[test]
    fn test_pdf_text() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "report.pdf", &samples::pdf("Quarterly revenue"));

        let text = read_office(&path, "pdf").unwrap();
        assert!(text.contains("Quarterly"), "got {:?}", text);
    }

    #[test]
    fn test_docx_that_is_not_a_zip() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "fake.docx", b"plain text pretending");

        assert!(matches!(
            read_office(&path, "docx"),
            Err(DispatchError::Extraction(_))
        ));
    }

    #[test]
    fn test_garbage_spreadsheet_fails() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "sheet.xlsx", b"not a workbook");

        assert!(read_office(&path, "xlsx").is_err());
    }

    #[test]
    fn test_slide_number() {
        assert_eq!(slide_number("ppt/slides/slide12.xml"), Some(12));
        assert_eq!(slide_number("ppt/slides/_rels/slide1.xml.rels"), None);
        assert_eq!(slide_number("ppt/slideLayouts/slideLayout1.xml"), None);
    }
}
