//! Document map built from a document-intelligence layout result.
//!
//! The layout service returns paragraphs and tables, each with the character
//! spans they cover in the flattened document content. The document map is
//! the reading-order sequence of text entries the chunker consumes:
//!
//! - page headers, footers and page numbers are dropped;
//! - a paragraph whose spans fall inside a table is dropped, because the
//!   table itself is rendered as row text in its place;
//! - `title` and `sectionHeading` paragraphs open a new section and are
//!   tracked on every following entry.

use serde::{Deserialize, Serialize};

/// Paragraph roles that never reach the document map.
const DROPPED_ROLES: &[&str] = &["pageHeader", "pageFooter", "pageNumber"];

/// Envelope returned by `GET .../analyzeResults/{id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzeResponse {
    pub status: String,
    #[serde(default, rename = "analyzeResult")]
    pub analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResult {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
    #[serde(default)]
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingRegion {
    pub page_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Span {
    pub offset: usize,
    pub length: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.offset.saturating_add(self.length)
    }

    fn within(&self, outer: &Span) -> bool {
        self.offset >= outer.offset && self.end() <= outer.end()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub column_count: usize,
    #[serde(default)]
    pub cells: Vec<TableCell>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCell {
    pub row_index: usize,
    pub column_index: usize,
    #[serde(default)]
    pub content: String,
}

impl Table {
    /// Rows joined by newlines, cells within a row by ` | `.
    pub fn render(&self) -> String {
        let rows = self
            .cells
            .iter()
            .map(|c| c.row_index + 1)
            .max()
            .unwrap_or(0)
            .max(self.row_count);
        let mut grid: Vec<Vec<&TableCell>> = vec![Vec::new(); rows];
        for cell in &self.cells {
            grid[cell.row_index].push(cell);
        }
        grid.iter_mut()
            .filter(|row| !row.is_empty())
            .map(|row| {
                row.sort_by_key(|c| c.column_index);
                row.iter()
                    .map(|c| c.content.trim())
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Title,
    SectionHeading,
    Text,
    Table,
}

impl EntryKind {
    /// Whether this entry starts a new section.
    pub fn opens_section(&self) -> bool {
        matches!(self, EntryKind::Title | EntryKind::SectionHeading)
    }
}

/// One reading-order entry of a [`DocumentMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub kind: EntryKind,
    pub text: String,
    pub page_number: u32,
    pub title: String,
    pub section: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMap {
    pub file_name: String,
    pub file_uri: String,
    pub title: String,
    pub structure: Vec<MapEntry>,
}

fn first_page(regions: &[BoundingRegion]) -> u32 {
    regions.first().map(|r| r.page_number).unwrap_or(1)
}

fn first_offset(spans: &[Span]) -> usize {
    spans.first().map(|s| s.offset).unwrap_or(usize::MAX)
}

/// Build the reading-order document map for one analyzed file.
pub fn build_document_map(file_name: &str, file_uri: &str, result: &AnalyzeResult) -> DocumentMap {
    let table_spans: Vec<Span> = result
        .tables
        .iter()
        .flat_map(|t| t.spans.iter().copied())
        .collect();

    // (offset, kind, text, page) in document order before section tracking.
    let mut raw: Vec<(usize, EntryKind, String, u32)> = Vec::new();

    for paragraph in &result.paragraphs {
        let role = paragraph.role.as_deref().unwrap_or("");
        if DROPPED_ROLES.contains(&role) {
            continue;
        }
        let in_table = !paragraph.spans.is_empty()
            && paragraph
                .spans
                .iter()
                .all(|s| table_spans.iter().any(|t| s.within(t)));
        if in_table {
            continue;
        }
        let text = paragraph.content.trim();
        if text.is_empty() {
            continue;
        }
        let kind = match role {
            "title" => EntryKind::Title,
            "sectionHeading" => EntryKind::SectionHeading,
            _ => EntryKind::Text,
        };
        raw.push((
            first_offset(&paragraph.spans),
            kind,
            text.to_string(),
            first_page(&paragraph.bounding_regions),
        ));
    }

    for table in &result.tables {
        let text = table.render();
        if text.trim().is_empty() {
            continue;
        }
        raw.push((
            first_offset(&table.spans),
            EntryKind::Table,
            text,
            first_page(&table.bounding_regions),
        ));
    }

    // Stable sort keeps service order for entries without spans.
    raw.sort_by_key(|(offset, ..)| *offset);

    let mut document_title = String::new();
    let mut title = String::new();
    let mut section = String::new();
    let mut structure = Vec::with_capacity(raw.len());

    for (_, kind, text, page_number) in raw {
        match kind {
            EntryKind::Title => {
                if document_title.is_empty() {
                    document_title = text.clone();
                }
                title = text.clone();
                section.clear();
            }
            EntryKind::SectionHeading => section = text.clone(),
            EntryKind::Text | EntryKind::Table => {}
        }
        structure.push(MapEntry {
            kind,
            text,
            page_number,
            title: title.clone(),
            section: section.clone(),
        });
    }

    DocumentMap {
        file_name: file_name.to_string(),
        file_uri: file_uri.to_string(),
        title: document_title,
        structure,
    }
}
