//! Template Parser: turns template source into a flat, ordered
//! `Vec<TemplateBoundary>` (spec.md §4.1).
//!
//! Two stages, mirroring the tokenize-then-classify split the teacher's
//! macro crate uses for its HTML macro (`tokenizer.rs` feeding
//! `unified_parser.rs`): [`lex`] finds every `{{ ... }}` action's raw byte
//! span without interpreting it, and [`parse`] folds the resulting token
//! stream into the classified, nesting-aware boundary list the rest of the
//! crate consumes. [`crate::region`] calls [`lex`] directly so it can locate
//! actions by byte offset against the raw HTML.

use crate::error::ParseError;

/// The classification of a [`TemplateBoundary`], exactly as enumerated in
/// spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    StaticContent,
    SimpleField,
    Function,
    ConditionalIf,
    ConditionalElse,
    ConditionalEnd,
    RangeLoop,
    RangeEnd,
    ContextWith,
    WithElse,
    WithEnd,
    Variable,
    Pipeline,
    Comment,
    TemplateDefinition,
    Complex,
}

/// One entry in the flat boundary sequence (spec.md §3's `TemplateBoundary`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBoundary {
    pub kind: BoundaryKind,
    /// Verbatim source substring. Concatenating every boundary's `content`
    /// in order reproduces the original template source byte-for-byte
    /// (spec.md §8, property 1).
    pub content: String,
    /// The dotted path or raw expression driving this boundary, when one
    /// applies (`SimpleField`, `Function`, `RangeLoop`, `Variable`).
    pub field_path: Option<String>,
    /// The raw condition expression for `ConditionalIf`/`ContextWith`.
    pub condition: Option<String>,
    pub nesting_level: usize,
    /// Byte offset of `content` within the original source. Internal only:
    /// not part of spec.md's `TemplateBoundary` fields, used by
    /// [`crate::region`] to cross-reference actions against HTML tag spans.
    pub(crate) byte_range: std::ops::Range<usize>,
}

/// A raw, unclassified-but-kind-tagged action token plus the static run that
/// preceded it, produced by [`lex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawToken {
    Static {
        text: String,
        range: std::ops::Range<usize>,
    },
    Action {
        /// The action body, with `{{`/`}}` stripped and trimmed.
        body: String,
        /// The raw action including delimiters, e.g. `{{if .X}}`.
        raw: String,
        range: std::ops::Range<usize>,
    },
}

/// Stage 1: split `source` into alternating static runs and `{{ ... }}`
/// actions, respecting string literals inside an action (a `}}` inside a
/// quoted string does not close the action).
pub(crate) fn lex(source: &str) -> Result<Vec<RawToken>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut static_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if static_start < i {
                tokens.push(RawToken::Static {
                    text: source[static_start..i].to_string(),
                    range: static_start..i,
                });
            }
            let action_start = i;
            i += 2;
            let body_start = i;
            let mut in_quote: Option<u8> = None;
            let mut closed = false;
            while i < bytes.len() {
                let b = bytes[i];
                match in_quote {
                    Some(q) => {
                        if b == b'\\' && i + 1 < bytes.len() {
                            i += 1;
                        } else if b == q {
                            in_quote = None;
                        }
                    }
                    None => {
                        if b == b'"' || b == b'\'' {
                            in_quote = Some(b);
                        } else if b == b'}' && i + 1 < bytes.len() && bytes[i + 1] == b'}' {
                            closed = true;
                            break;
                        }
                    }
                }
                i += 1;
            }
            if !closed {
                return Err(ParseError::UnterminatedAction {
                    position: action_start,
                });
            }
            let body = source[body_start..i].trim().to_string();
            i += 2;
            let raw = source[action_start..i].to_string();
            tokens.push(RawToken::Action {
                body,
                raw,
                range: action_start..i,
            });
            static_start = i;
        } else {
            i += 1;
        }
    }
    if static_start < bytes.len() {
        tokens.push(RawToken::Static {
            text: source[static_start..].to_string(),
            range: static_start..bytes.len(),
        });
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    If { synthesized_elseif: bool },
    Range,
    With,
}

/// Stage 2: classify each action and fold the token stream into the flat,
/// nesting-aware `TemplateBoundary` list (spec.md §4.1).
pub fn parse(source: &str) -> Result<Vec<TemplateBoundary>, ParseError> {
    let tokens = lex(source)?;
    let mut boundaries = Vec::new();
    let mut stack: Vec<OpenBlock> = Vec::new();

    for token in tokens {
        match token {
            RawToken::Static { text, range } => {
                if !text.is_empty() {
                    boundaries.push(TemplateBoundary {
                        kind: BoundaryKind::StaticContent,
                        content: text,
                        field_path: None,
                        condition: None,
                        nesting_level: stack.len(),
                        byte_range: range,
                    });
                }
            }
            RawToken::Action { body, raw, range } => {
                classify_action(&body, &raw, range, &mut stack, &mut boundaries)?;
            }
        }
    }

    if let Some(unclosed) = stack.last() {
        let kind = match unclosed {
            OpenBlock::If { .. } => "if",
            OpenBlock::Range => "range",
            OpenBlock::With => "with",
        };
        return Err(ParseError::UnclosedBlock {
            kind,
            opened_at: boundaries
                .iter()
                .rev()
                .find(|b| {
                    matches!(
                        b.kind,
                        BoundaryKind::ConditionalIf | BoundaryKind::RangeLoop | BoundaryKind::ContextWith
                    )
                })
                .map(|b| b.byte_range.start)
                .unwrap_or(0),
        });
    }

    Ok(boundaries)
}

fn classify_action(
    body: &str,
    raw: &str,
    range: std::ops::Range<usize>,
    stack: &mut Vec<OpenBlock>,
    out: &mut Vec<TemplateBoundary>,
) -> Result<(), ParseError> {
    let level_before = stack.len();

    if body == "end" {
        return close_block(raw, range, stack, out);
    }

    if body == "else" {
        return emit_else(raw, range, stack, out, None);
    }

    if let Some(rest) = body.strip_prefix("else if ").or_else(|| body.strip_prefix("else  if ")) {
        return emit_else(raw, range, stack, out, Some(rest.trim().to_string()));
    }

    if let Some(rest) = body.strip_prefix("if ") {
        stack.push(OpenBlock::If {
            synthesized_elseif: false,
        });
        out.push(TemplateBoundary {
            kind: BoundaryKind::ConditionalIf,
            content: raw.to_string(),
            field_path: None,
            condition: Some(rest.trim().to_string()),
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if let Some(rest) = body.strip_prefix("range ") {
        stack.push(OpenBlock::Range);
        out.push(TemplateBoundary {
            kind: BoundaryKind::RangeLoop,
            content: raw.to_string(),
            field_path: Some(rest.trim().to_string()),
            condition: None,
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if let Some(rest) = body.strip_prefix("with ") {
        stack.push(OpenBlock::With);
        out.push(TemplateBoundary {
            kind: BoundaryKind::ContextWith,
            content: raw.to_string(),
            field_path: None,
            condition: Some(rest.trim().to_string()),
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if body.starts_with("/*") && body.ends_with("*/") {
        out.push(TemplateBoundary {
            kind: BoundaryKind::Comment,
            content: raw.to_string(),
            field_path: None,
            condition: None,
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if body.starts_with("define ") || body.starts_with("template ") || body.starts_with("block ") {
        out.push(TemplateBoundary {
            kind: BoundaryKind::TemplateDefinition,
            content: raw.to_string(),
            field_path: None,
            condition: None,
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if let Some(eq_pos) = body.find(":=") {
        let (lhs, rhs) = body.split_at(eq_pos);
        if lhs.trim_start().starts_with('$') {
            out.push(TemplateBoundary {
                kind: BoundaryKind::Variable,
                content: raw.to_string(),
                field_path: Some(rhs[2..].trim().to_string()),
                condition: None,
                nesting_level: level_before,
                byte_range: range,
            });
            return Ok(());
        }
    }

    if body.contains('|') {
        out.push(TemplateBoundary {
            kind: BoundaryKind::Pipeline,
            content: raw.to_string(),
            field_path: Some(body.to_string()),
            condition: None,
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    if is_simple_field(body) {
        out.push(TemplateBoundary {
            kind: BoundaryKind::SimpleField,
            content: raw.to_string(),
            field_path: Some(body.to_string()),
            condition: None,
            nesting_level: level_before,
            byte_range: range,
        });
        return Ok(());
    }

    out.push(TemplateBoundary {
        kind: BoundaryKind::Function,
        content: raw.to_string(),
        field_path: Some(body.to_string()),
        condition: None,
        nesting_level: level_before,
        byte_range: range,
    });
    Ok(())
}

fn is_simple_field(body: &str) -> bool {
    body.starts_with('.')
        && !body.contains(' ')
        && !body.contains('(')
        && body[1..].chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// Emit the `ConditionalElse`/`WithElse` boundary that ends the current
/// branch. When this is an `else if`, also push the synthesized nested
/// `ConditionalIf` the spec.md §4.1 lowering describes, so a single closing
/// `{{end}}` still balances the whole chain (see [`close_block`]).
fn emit_else(
    raw: &str,
    range: std::ops::Range<usize>,
    stack: &mut Vec<OpenBlock>,
    out: &mut Vec<TemplateBoundary>,
    elseif_condition: Option<String>,
) -> Result<(), ParseError> {
    match stack.last() {
        Some(OpenBlock::If { .. }) => {
            let level = stack.len() - 1;
            match elseif_condition {
                None => {
                    out.push(TemplateBoundary {
                        kind: BoundaryKind::ConditionalElse,
                        content: raw.to_string(),
                        field_path: None,
                        condition: None,
                        nesting_level: level,
                        byte_range: range,
                    });
                }
                Some(cond) => {
                    let (else_part, if_part) = split_else_if(raw);
                    out.push(TemplateBoundary {
                        kind: BoundaryKind::ConditionalElse,
                        content: else_part,
                        field_path: None,
                        condition: None,
                        nesting_level: level,
                        byte_range: range.clone(),
                    });
                    stack.push(OpenBlock::If {
                        synthesized_elseif: true,
                    });
                    out.push(TemplateBoundary {
                        kind: BoundaryKind::ConditionalIf,
                        content: if_part,
                        field_path: None,
                        condition: Some(cond),
                        nesting_level: level,
                        byte_range: range,
                    });
                }
            }
            Ok(())
        }
        Some(OpenBlock::With) => {
            out.push(TemplateBoundary {
                kind: BoundaryKind::WithElse,
                content: raw.to_string(),
                field_path: None,
                condition: None,
                nesting_level: stack.len() - 1,
                byte_range: range,
            });
            Ok(())
        }
        _ => Err(ParseError::MalformedAction {
            position: range.start,
            message: "`else` with no open `if`/`with`".to_string(),
        }),
    }
}

/// Split `{{else if expr}}`'s raw text right between `else` and `if` so the
/// two synthesized boundaries' `content` fields concatenate back to the
/// original text with no overlap or gap (spec.md §8, property 1).
fn split_else_if(raw: &str) -> (String, String) {
    if let Some(else_pos) = raw.find("else") {
        let after_else = else_pos + 4;
        if let Some(if_rel) = raw[after_else..].find("if") {
            let if_pos = after_else + if_rel;
            return (raw[..if_pos].to_string(), raw[if_pos..].to_string());
        }
    }
    (raw.to_string(), String::new())
}

fn close_block(
    raw: &str,
    range: std::ops::Range<usize>,
    stack: &mut Vec<OpenBlock>,
    out: &mut Vec<TemplateBoundary>,
) -> Result<(), ParseError> {
    loop {
        match stack.pop() {
            None => {
                return Err(ParseError::UnmatchedEnd {
                    position: range.start,
                })
            }
            Some(OpenBlock::If { synthesized_elseif }) => {
                out.push(TemplateBoundary {
                    kind: BoundaryKind::ConditionalEnd,
                    content: if synthesized_elseif {
                        String::new()
                    } else {
                        raw.to_string()
                    },
                    field_path: None,
                    condition: None,
                    nesting_level: stack.len(),
                    byte_range: range.clone(),
                });
                if !synthesized_elseif {
                    return Ok(());
                }
            }
            Some(OpenBlock::Range) => {
                out.push(TemplateBoundary {
                    kind: BoundaryKind::RangeEnd,
                    content: raw.to_string(),
                    field_path: None,
                    condition: None,
                    nesting_level: stack.len(),
                    byte_range: range,
                });
                return Ok(());
            }
            Some(OpenBlock::With) => {
                out.push(TemplateBoundary {
                    kind: BoundaryKind::WithEnd,
                    content: raw.to_string(),
                    field_path: None,
                    condition: None,
                    nesting_level: stack.len(),
                    byte_range: range,
                });
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(source: &str) -> Vec<TemplateBoundary> {
        let boundaries = parse(source).unwrap();
        let rebuilt: String = boundaries.iter().map(|b| b.content.as_str()).collect();
        assert_eq!(rebuilt, source, "round-trip failed for {source:?}");
        boundaries
    }

    #[test]
    fn simple_field_roundtrips() {
        let b = roundtrip("Hello {{.Name}}!");
        assert_eq!(b[0].kind, BoundaryKind::StaticContent);
        assert_eq!(b[1].kind, BoundaryKind::SimpleField);
        assert_eq!(b[1].field_path.as_deref(), Some(".Name"));
        assert_eq!(b[2].kind, BoundaryKind::StaticContent);
    }

    #[test]
    fn conditional_roundtrips() {
        let b = roundtrip("{{if .Active}}on{{else}}off{{end}}");
        assert_eq!(
            b.iter().map(|x| x.kind).collect::<Vec<_>>(),
            vec![
                BoundaryKind::ConditionalIf,
                BoundaryKind::StaticContent,
                BoundaryKind::ConditionalElse,
                BoundaryKind::StaticContent,
                BoundaryKind::ConditionalEnd,
            ]
        );
    }

    #[test]
    fn else_if_chain_roundtrips_and_lowers() {
        let b = roundtrip("{{if .A}}X{{else if .B}}Y{{else}}Z{{end}}");
        let kinds: Vec<_> = b.iter().map(|x| x.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BoundaryKind::ConditionalIf,
                BoundaryKind::StaticContent,
                BoundaryKind::ConditionalElse,
                BoundaryKind::ConditionalIf,
                BoundaryKind::StaticContent,
                BoundaryKind::ConditionalElse,
                BoundaryKind::StaticContent,
                BoundaryKind::ConditionalEnd,
                BoundaryKind::ConditionalEnd,
            ]
        );
        // first-true-wins source order: nested if sits inside the outer's else arm
        assert_eq!(b[3].condition.as_deref(), Some(".B"));
    }

    #[test]
    fn range_roundtrips() {
        let b = roundtrip("<ul>{{range .Items}}<li>{{.}}</li>{{end}}</ul>");
        assert_eq!(b[1].kind, BoundaryKind::RangeLoop);
        assert_eq!(b[1].field_path.as_deref(), Some(".Items"));
    }

    #[test]
    fn with_roundtrips() {
        roundtrip("{{with .User}}{{.Name}}{{else}}Anonymous{{end}}");
    }

    #[test]
    fn nested_range_if_roundtrips() {
        roundtrip("{{range .Items}}{{if .Active}}{{.Name}}{{end}}{{end}}");
    }

    #[test]
    fn comment_is_recorded_and_roundtrips() {
        let b = roundtrip("a{{/* note */}}b");
        assert_eq!(b[1].kind, BoundaryKind::Comment);
    }

    #[test]
    fn variable_declaration_classified() {
        let b = roundtrip("{{$x := .Foo}}");
        assert_eq!(b[0].kind, BoundaryKind::Variable);
        assert_eq!(b[0].field_path.as_deref(), Some(".Foo"));
    }

    #[test]
    fn pipeline_classified() {
        let b = roundtrip("{{.Name | upper}}");
        assert_eq!(b[0].kind, BoundaryKind::Pipeline);
    }

    #[test]
    fn function_call_classified() {
        let b = roundtrip("{{eq .A .B}}");
        assert_eq!(b[0].kind, BoundaryKind::Function);
    }

    #[test]
    fn unmatched_end_is_error() {
        assert!(matches!(parse("{{end}}"), Err(ParseError::UnmatchedEnd { .. })));
    }

    #[test]
    fn unclosed_block_is_error() {
        assert!(matches!(
            parse("{{if .A}}x"),
            Err(ParseError::UnclosedBlock { .. })
        ));
    }

    #[test]
    fn quoted_braces_inside_action_do_not_close_early() {
        let b = roundtrip(r#"{{printf "}}"}}"#);
        assert_eq!(b.len(), 1);
    }
}
