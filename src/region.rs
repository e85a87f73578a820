//! Region Detector: finds the innermost HTML elements enclosing dynamic
//! template content, assigns each a stable id, and injects `data-lvt-id`
//! attributes into the template source before it is ever executed
//! (spec.md §4.3).
//!
//! The HTML side of this is a deliberately small tag scanner (not a full
//! HTML5 tree builder) in the spirit of the teacher's `diff/parser.rs`
//! (`Parser`/`Element`/void-element handling), extended to track byte spans
//! rather than build a child tree, since all we need is "does this element's
//! span contain that action's span".

use crate::error::ParseError;
use crate::parser::{self, BoundaryKind, TemplateBoundary};
use std::collections::HashSet;
use std::ops::Range;

/// A region: an HTML element enclosing at least one dynamic construct,
/// labelled with a stable id injected as `data-lvt-id` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRegion {
    pub id: String,
    pub template_source: String,
    pub start_marker: String,
    pub end_marker: String,
    pub field_paths: Vec<String>,
    pub element_tag: String,
    pub original_attrs: String,
    /// Field paths that resolve inside an HTML attribute value within this
    /// region, rather than in text position. Consulted by
    /// [`crate::tree::TreeGenerator`] to choose attribute-mode escaping
    /// (spec.md §4.2: "attribute-context slots must be pre-classified by the
    /// Region Detector").
    pub attribute_field_paths: HashSet<String>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

const CONTAINER_EXCLUDED: &[&str] = &["html", "body", "main"];

#[derive(Debug, Clone)]
struct TagSpan {
    tag: String,
    /// Byte offset of the opening `<`.
    open_start: usize,
    /// Byte offset right before the opening tag's closing `>` (or `/>`),
    /// where `data-lvt-id` is injected.
    attr_insert_at: usize,
    /// Byte offset right after the opening tag's `>`.
    open_end: usize,
    /// Byte offset right after the element's matching closing tag's `>`.
    /// `None` for void / self-closing elements.
    close_end: Option<usize>,
    existing_lvt_id: Option<String>,
    attrs_text: String,
}

impl TagSpan {
    fn full_range(&self) -> Range<usize> {
        self.open_start..self.close_end.unwrap_or(self.open_end)
    }

    /// Whether `r` falls anywhere within this element, including its own
    /// opening tag's attribute text (so a dynamic attribute value on a void
    /// element, which has no content range, still resolves to its own tag).
    fn contains(&self, r: &Range<usize>) -> bool {
        self.full_range().start <= r.start && r.end <= self.full_range().end
    }
}

/// Scan `source` for HTML element spans. Tolerant of template actions
/// appearing anywhere (including inside attribute values); does not attempt
/// to validate HTML5 conformance beyond matching tags and void elements.
fn scan_tags(source: &str) -> Result<Vec<TagSpan>, ParseError> {
    let bytes = source.as_bytes();
    let mut stack: Vec<(String, usize, usize, usize, Option<String>, String)> = Vec::new();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        if source[i..].starts_with("<!--") {
            if let Some(end) = source[i..].find("-->") {
                i += end + 3;
            } else {
                i = bytes.len();
            }
            continue;
        }
        if source[i..].starts_with("<!") {
            if let Some(end) = source[i..].find('>') {
                i += end + 1;
            } else {
                i = bytes.len();
            }
            continue;
        }
        if bytes.get(i + 1) == Some(&b'/') {
            // Closing tag.
            let tag_start = i + 2;
            let tag_end = source[tag_start..]
                .find(|c: char| c.is_whitespace() || c == '>')
                .map(|o| tag_start + o)
                .unwrap_or(bytes.len());
            let tag_name = source[tag_start..tag_end].to_lowercase();
            let close_gt = source[tag_end..].find('>').map(|o| tag_end + o);
            let Some(close_gt) = close_gt else {
                i = bytes.len();
                continue;
            };
            let close_end = close_gt + 1;
            match stack.pop() {
                Some((open_tag, open_start, attr_insert_at, open_end, existing_id, attrs_text))
                    if open_tag == tag_name =>
                {
                    spans.push(TagSpan {
                        tag: open_tag,
                        open_start,
                        attr_insert_at,
                        open_end,
                        close_end: Some(close_end),
                        existing_lvt_id: existing_id,
                        attrs_text,
                    });
                }
                Some((open_tag, ..)) => {
                    return Err(ParseError::MismatchedTag {
                        open: open_tag,
                        close: tag_name,
                        position: i,
                    });
                }
                None => {
                    return Err(ParseError::MismatchedTag {
                        open: String::new(),
                        close: tag_name,
                        position: i,
                    });
                }
            }
            i = close_end;
            continue;
        }

        // Opening (possibly self-closing) tag.
        let tag_start = i + 1;
        let tag_end = source[tag_start..]
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .map(|o| tag_start + o)
            .unwrap_or(bytes.len());
        let tag_name = source[tag_start..tag_end].to_lowercase();
        if tag_name.is_empty() {
            i += 1;
            continue;
        }

        let Some(gt_rel) = source[tag_end..].find('>') else {
            return Err(ParseError::UnclosedTag {
                tag: tag_name,
                opened_at: i,
            });
        };
        let gt = tag_end + gt_rel;
        let self_closing = gt > 0 && bytes[gt - 1] == b'/';
        let attr_insert_at = if self_closing { gt - 1 } else { gt };
        let attrs_text = source[tag_end..attr_insert_at].to_string();
        let existing_id = extract_existing_lvt_id(&attrs_text);
        let open_end = gt + 1;

        if self_closing || VOID_ELEMENTS.contains(&tag_name.as_str()) {
            spans.push(TagSpan {
                tag: tag_name,
                open_start: i,
                attr_insert_at,
                open_end,
                close_end: None,
                existing_lvt_id: existing_id,
                attrs_text,
            });
        } else {
            stack.push((tag_name, i, attr_insert_at, open_end, existing_id, attrs_text));
        }
        i = open_end;
    }

    if let Some((tag, opened_at, ..)) = stack.pop() {
        return Err(ParseError::UnclosedTag {
            tag,
            opened_at,
        });
    }

    Ok(spans)
}

fn extract_existing_lvt_id(attrs_text: &str) -> Option<String> {
    let marker = "data-lvt-id=\"";
    let start = attrs_text.find(marker)? + marker.len();
    let end = attrs_text[start..].find('"')? + start;
    Some(attrs_text[start..end].to_string())
}

/// Generates `a1, a2, ..., a9, b1, ..., z9, aa1, ...` — a pure function of
/// index, so ids never depend on map iteration order (spec.md §4.3).
pub(crate) fn region_id(index: usize) -> String {
    let letters = bijective_base26(index / 9);
    let digit = index % 9 + 1;
    format!("{letters}{digit}")
}

fn bijective_base26(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        let rem = n % 26;
        out.push((b'a' + rem as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.into_iter().rev().collect()
}

/// Find the smallest `TagSpan` (by content-range length) whose content range
/// contains `range`, excluding `html`/`body`/`main` (spec.md §4.3 step 1/2).
fn nearest_enclosing<'a>(spans: &'a [TagSpan], range: &Range<usize>) -> Option<&'a TagSpan> {
    spans
        .iter()
        .filter(|s| !CONTAINER_EXCLUDED.contains(&s.tag.as_str()) && s.contains(range))
        .min_by_key(|s| s.full_range().len())
}

/// Compute `[start, end)` byte span of the full block a `ConditionalIf` /
/// `RangeLoop` / `ContextWith` boundary opens, by walking forward through the
/// (already nesting-validated) boundary stream to its matching `*End`.
fn block_span(boundaries: &[TemplateBoundary], open_idx: usize) -> Range<usize> {
    let open = &boundaries[open_idx];
    let mut depth = 0usize;
    for b in &boundaries[open_idx..] {
        match b.kind {
            BoundaryKind::ConditionalIf | BoundaryKind::RangeLoop | BoundaryKind::ContextWith => {
                depth += 1;
            }
            BoundaryKind::ConditionalEnd | BoundaryKind::RangeEnd | BoundaryKind::WithEnd => {
                depth -= 1;
                if depth == 0 {
                    return open.byte_range.start..b.byte_range.end;
                }
            }
            _ => {}
        }
    }
    open.byte_range.clone()
}

fn collect_field_paths(boundaries: &[TemplateBoundary], range: &Range<usize>) -> Vec<String> {
    let mut seen = Vec::new();
    for b in boundaries {
        if b.byte_range.start < range.start || b.byte_range.end > range.end {
            continue;
        }
        for candidate in [&b.field_path, &b.condition] {
            if let Some(expr) = candidate {
                for path in extract_dotted_paths(expr) {
                    if !seen.contains(&path) {
                        seen.push(path);
                    }
                }
            }
        }
    }
    seen
}

fn extract_dotted_paths(expr: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut current = String::new();
    let mut in_path = false;
    for c in expr.chars().chain(std::iter::once(' ')) {
        if c == '.' && !in_path {
            in_path = true;
            current.push(c);
        } else if in_path && (c.is_alphanumeric() || c == '_' || c == '.') {
            current.push(c);
        } else if in_path {
            if current != "." {
                paths.push(current.clone());
            }
            current.clear();
            in_path = false;
        }
    }
    paths
}

/// Run region detection over raw template `source`, returning the rewritten
/// source (with `data-lvt-id` attributes injected) and the ordered list of
/// regions (spec.md §4.3).
pub fn detect_regions(source: &str) -> Result<(String, Vec<TemplateRegion>), ParseError> {
    let boundaries = parser::parse(source)?;
    let tags = scan_tags(source)?;

    let mut candidate_ranges: Vec<Range<usize>> = Vec::new();

    // Step 1: block-level constructs promote their nearest enclosing element.
    for (idx, b) in boundaries.iter().enumerate() {
        if matches!(
            b.kind,
            BoundaryKind::ConditionalIf | BoundaryKind::RangeLoop | BoundaryKind::ContextWith
        ) {
            let span = block_span(&boundaries, idx);
            if let Some(tag) = nearest_enclosing(&tags, &span) {
                push_unique(&mut candidate_ranges, tag.full_range());
            }
        }
    }

    // Step 2: leaf dynamic content (fields/functions/pipelines) not already
    // covered by a step-1 region promote their own nearest enclosing element.
    for b in &boundaries {
        if matches!(
            b.kind,
            BoundaryKind::SimpleField | BoundaryKind::Function | BoundaryKind::Pipeline
        ) {
            if candidate_ranges
                .iter()
                .any(|r| r.start <= b.byte_range.start && b.byte_range.end <= r.end)
            {
                continue;
            }
            if let Some(tag) = nearest_enclosing(&tags, &b.byte_range) {
                push_unique(&mut candidate_ranges, tag.full_range());
            }
        }
    }

    candidate_ranges.sort_by_key(|r| r.start);

    let mut regions = Vec::new();
    let mut next_index = 0usize;
    let mut insertions: Vec<(usize, String, String)> = Vec::new(); // (offset, id, existing?)

    for range in &candidate_ranges {
        let tag = tags
            .iter()
            .find(|t| t.full_range() == *range)
            .expect("candidate ranges are always derived from `tags`");

        let id = match &tag.existing_lvt_id {
            Some(existing) => existing.clone(),
            None => {
                let id = region_id(next_index);
                next_index += 1;
                insertions.push((tag.attr_insert_at, id.clone(), format!(" data-lvt-id=\"{id}\"")));
                id
            }
        };

        let field_paths = collect_field_paths(&boundaries, &tag.full_range());
        let attribute_field_paths = collect_attribute_field_paths(&boundaries, tag);

        regions.push((
            range.clone(),
            TemplateRegion {
                id: id.clone(),
                template_source: source[range.clone()].to_string(),
                start_marker: format!("<{} data-lvt-id=\"{}\">", tag.tag, id),
                end_marker: if tag.close_end.is_some() {
                    format!("</{}>", tag.tag)
                } else {
                    String::new()
                },
                field_paths,
                element_tag: tag.tag.clone(),
                original_attrs: tag.attrs_text.clone(),
                attribute_field_paths,
            },
        ));
    }

    // Apply insertions from rightmost to leftmost so earlier offsets stay valid.
    insertions.sort_by_key(|(offset, ..)| std::cmp::Reverse(*offset));
    let mut rewritten = source.to_string();
    for (offset, _, text) in &insertions {
        rewritten.insert_str(*offset, text);
    }

    // Re-render each region's `template_source` against the rewritten source
    // so its own span includes the injected attribute it owns, and any
    // injected attributes of elements nested within it.
    let shifts = shift_table(&insertions, source.len());
    let regions = regions
        .into_iter()
        .map(|(range, mut region)| {
            let start = shifted_offset(&shifts, range.start);
            let end = shifted_offset(&shifts, range.end);
            region.template_source = rewritten[start..end].to_string();
            region
        })
        .collect();

    Ok((rewritten, regions))
}

fn push_unique(ranges: &mut Vec<Range<usize>>, r: Range<usize>) {
    if !ranges.contains(&r) {
        ranges.push(r);
    }
}

fn collect_attribute_field_paths(
    boundaries: &[TemplateBoundary],
    tag: &TagSpan,
) -> HashSet<String> {
    let mut set = HashSet::new();
    // Any dynamic boundary whose byte range falls within the opening tag's
    // attribute text (between `<tag` and the injection point) is
    // attribute-context.
    let attr_zone = tag.open_start..tag.attr_insert_at;
    for b in boundaries {
        if b.byte_range.start >= attr_zone.start && b.byte_range.end <= attr_zone.end {
            if let Some(path) = &b.field_path {
                if path.starts_with('.') {
                    set.insert(path.clone());
                }
            }
        }
    }
    set
}

/// Build a sorted list of `(original_offset, cumulative_shift_after)` so a
/// byte offset in the original source can be translated into the rewritten
/// source after all insertions are applied.
fn shift_table(insertions: &[(usize, String, String)], _source_len: usize) -> Vec<(usize, usize)> {
    let mut sorted: Vec<(usize, usize)> = insertions
        .iter()
        .map(|(offset, _, text)| (*offset, text.len()))
        .collect();
    sorted.sort_by_key(|(offset, _)| *offset);
    let mut table = Vec::with_capacity(sorted.len());
    let mut cumulative = 0;
    for (offset, len) in sorted {
        cumulative += len;
        table.push((offset, cumulative));
    }
    table
}

fn shifted_offset(shifts: &[(usize, usize)], original_offset: usize) -> usize {
    let mut shift = 0;
    for (offset, cumulative) in shifts {
        if *offset < original_offset {
            shift = *cumulative;
        } else {
            break;
        }
    }
    original_offset + shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_single_id_on_dynamic_div() {
        let src = r#"<div id="counter">Count: {{.N}}</div>"#;
        let (rewritten, regions) = detect_regions(src).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, "a1");
        assert!(rewritten.contains(r#"<div id="counter" data-lvt-id="a1">"#));
        assert!(regions[0].field_paths.contains(&".N".to_string()));
    }

    #[test]
    fn excludes_body_and_main_from_container_promotion() {
        let src = "<body><div>{{.X}}</div></body>";
        let (_, regions) = detect_regions(src).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].element_tag, "div");
    }

    #[test]
    fn reuses_existing_lvt_id_without_override() {
        let src = r#"<div data-lvt-id="z9">{{.X}}</div>"#;
        let (rewritten, regions) = detect_regions(src).unwrap();
        assert_eq!(regions[0].id, "z9");
        assert_eq!(rewritten.matches("data-lvt-id").count(), 1);
    }

    #[test]
    fn void_element_with_attribute_dynamic_gets_id() {
        let src = r#"<input value="{{.V}}">"#;
        let (rewritten, regions) = detect_regions(src).unwrap();
        assert_eq!(regions.len(), 1);
        assert!(rewritten.contains("data-lvt-id=\"a1\""));
        assert!(regions[0].attribute_field_paths.contains(&".V".to_string()));
    }

    #[test]
    fn ids_are_assigned_in_source_order() {
        let src = "<div>{{.A}}</div><span>{{.B}}</span>";
        let (_, regions) = detect_regions(src).unwrap();
        assert_eq!(regions[0].id, "a1");
        assert_eq!(regions[1].id, "a2");
    }

    #[test]
    fn range_block_promotes_enclosing_ul() {
        let src = "<ul>{{range .Items}}<li>{{.}}</li>{{end}}</ul>";
        let (_, regions) = detect_regions(src).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].element_tag, "ul");
    }

    #[test]
    fn deterministic_across_runs() {
        let src = "<div>{{.A}}</div><span>{{.B}}</span>";
        let (r1, _) = detect_regions(src).unwrap();
        let (r2, _) = detect_regions(src).unwrap();
        assert_eq!(r1, r2);
    }
}
