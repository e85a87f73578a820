//! Tree Generator: the crate's core algorithm (spec.md §4.2). Turns a
//! template fragment plus an old/new data pair into a [`TreeData`] — an
//! ordered static skeleton plus a key-indexed map of dynamic slots — and
//! caches the parsed structure per fragment id so repeated calls against the
//! same region skip re-parsing.
//!
//! The boundary list [`crate::parser`] produces is flat; this module's first
//! job is folding it back into a nested [`Node`] tree (block constructs
//! consume their body up to the matching `*End`), mirroring the way the
//! teacher's `diff/patch.rs` walks a `VNode` tree rather than a token stream.

use crate::error::{EvalError, TreeError, UnsupportedConstruct};
use crate::eval::{self, RangeItems};
use crate::html;
use crate::parser::{self, BoundaryKind, TemplateBoundary};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A rendered fragment: an ordered static skeleton plus the dynamic slots
/// that fill its gaps (spec.md §3). `s` is `None` on incremental updates
/// when the caller is assumed to already have the skeleton cached.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TreeData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<Vec<String>>,
    #[serde(flatten)]
    pub dynamics: Dynamics,
}

impl TreeData {
    pub fn is_empty_update(&self) -> bool {
        self.s.is_none() && self.dynamics.0.is_empty()
    }
}

/// Ordered `"0", "1", ...` dynamic slots. A thin `Vec` wrapper (rather than a
/// `BTreeMap`) because decimal-string keys don't sort numerically
/// (`"10" < "2"` lexically) and generation order is already numeric order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dynamics(pub Vec<(String, DynamicValue)>);

impl Serialize for Dynamics {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A dynamic slot's value: a plain rendered string, a nested fragment, or
/// (range with more than one element) a list of fragments. The wire shape
/// disambiguates by JSON type, so no tag is serialized (spec.md §9).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum DynamicValue {
    Str(String),
    Tree(Box<TreeData>),
    List(Vec<TreeData>),
}

/// A parsed, nested view of a template fragment's dynamic constructs. Built
/// once per fragment id from the flat [`TemplateBoundary`] list and cached.
#[derive(Debug, Clone)]
enum Node {
    Static(String),
    Field(String),
    Function(String),
    If {
        branches: Vec<(Option<String>, Vec<Node>)>,
    },
    Range {
        expr: String,
        body: Vec<Node>,
    },
    With {
        expr: String,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
    },
    Unsupported(UnsupportedConstruct),
}

fn build_nodes(source: &str) -> Result<Vec<Node>, TreeError> {
    let boundaries = parser::parse(source)?;
    let mut pos = 0;
    let nodes = build_block(&boundaries, &mut pos);
    Ok(nodes)
}

/// Fold boundaries starting at `*pos` into a `Vec<Node>`, stopping (without
/// consuming) at the first `ConditionalElse`/`ConditionalEnd`/`RangeEnd`/
/// `WithElse`/`WithEnd` sentinel. The caller that opened the enclosing block
/// consumes that sentinel itself.
fn build_block(boundaries: &[TemplateBoundary], pos: &mut usize) -> Vec<Node> {
    let mut out = Vec::new();
    while *pos < boundaries.len() {
        let b = &boundaries[*pos];
        match b.kind {
            BoundaryKind::StaticContent => {
                out.push(Node::Static(b.content.clone()));
                *pos += 1;
            }
            BoundaryKind::SimpleField => {
                out.push(Node::Field(b.field_path.clone().unwrap_or_default()));
                *pos += 1;
            }
            BoundaryKind::Function | BoundaryKind::Complex => {
                out.push(Node::Function(b.field_path.clone().unwrap_or_default()));
                *pos += 1;
            }
            BoundaryKind::Pipeline => {
                out.push(Node::Unsupported(UnsupportedConstruct::Pipeline));
                *pos += 1;
            }
            BoundaryKind::Variable => {
                out.push(Node::Unsupported(UnsupportedConstruct::Variable));
                *pos += 1;
            }
            BoundaryKind::Comment | BoundaryKind::TemplateDefinition => {
                *pos += 1;
            }
            BoundaryKind::ConditionalIf => {
                let condition = b.condition.clone().unwrap_or_default();
                *pos += 1;
                let mut branches = vec![(Some(condition), build_block(boundaries, pos))];
                loop {
                    match boundaries.get(*pos).map(|b| b.kind) {
                        Some(BoundaryKind::ConditionalElse) => {
                            *pos += 1;
                            branches.push((None, build_block(boundaries, pos)));
                        }
                        _ => {
                            // ConditionalEnd (or end of stream; parser guarantees balance).
                            *pos += 1;
                            break;
                        }
                    }
                }
                out.push(Node::If { branches });
            }
            BoundaryKind::RangeLoop => {
                let expr = b.field_path.clone().unwrap_or_default();
                *pos += 1;
                let body = build_block(boundaries, pos);
                *pos += 1; // RangeEnd
                out.push(Node::Range { expr, body });
            }
            BoundaryKind::ContextWith => {
                let expr = b.condition.clone().unwrap_or_default();
                *pos += 1;
                let body = build_block(boundaries, pos);
                let else_body = if matches!(
                    boundaries.get(*pos).map(|b| b.kind),
                    Some(BoundaryKind::WithElse)
                ) {
                    *pos += 1;
                    Some(build_block(boundaries, pos))
                } else {
                    None
                };
                *pos += 1; // WithEnd
                out.push(Node::With {
                    expr,
                    body,
                    else_body,
                });
            }
            BoundaryKind::ConditionalElse
            | BoundaryKind::ConditionalEnd
            | BoundaryKind::RangeEnd
            | BoundaryKind::WithElse
            | BoundaryKind::WithEnd => {
                return out;
            }
        }
    }
    out
}

/// `.A.B`-style paths and `eq`/`len`/... calls, with the nil/missing-as-falsy
/// degradation spec.md §4.1 describes for conditions.
fn eval_condition(expr: &str, data: &Value) -> Result<bool, EvalError> {
    match eval::evaluate_expr(expr, data) {
        Ok(v) => Ok(eval::is_truthy(&v)),
        Err(EvalError::MissingField { .. }) | Err(EvalError::NilDeref { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Which HTML-safe escaping a slot needs, per the Region Detector's
/// attribute-vs-text classification (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeMode {
    Text,
    Attr,
}

/// Direct interpolation degradation: missing/nil renders as the empty
/// string rather than failing the whole fragment (spec.md §4.1). The
/// resolved value is always run through `html::escape_text` or
/// `html::escape_attr` before it reaches the output tree — dynamic values
/// are never interpolated raw.
fn eval_interpolation(expr: &str, data: &Value, mode: EscapeMode) -> Result<String, EvalError> {
    match eval::evaluate_expr(expr, data) {
        Ok(v) => {
            let raw = eval::stringify(&v);
            Ok(match mode {
                EscapeMode::Text => html::escape_text(&raw),
                EscapeMode::Attr => html::escape_attr(&raw),
            })
        }
        Err(EvalError::MissingField { .. }) | Err(EvalError::NilDeref { .. }) => {
            Ok(String::new())
        }
        Err(e) => Err(e),
    }
}

fn eval_range(expr: &str, data: &Value) -> Result<RangeItems, EvalError> {
    match eval::evaluate_expr(expr, data) {
        Ok(v) => eval::range_items(&v),
        Err(EvalError::MissingField { .. }) | Err(EvalError::NilDeref { .. }) => {
            Ok(RangeItems::Empty)
        }
        Err(e) => Err(e),
    }
}

/// Per-slot evaluation result: `None` means "unchanged, omit from output"
/// (only possible when `force_full` is false).
type SlotResult = Option<DynamicValue>;

fn finish_tree(statics: Vec<String>, dynamics: Vec<(String, DynamicValue)>, include_s: bool) -> TreeData {
    TreeData {
        s: if include_s { Some(statics) } else { None },
        dynamics: Dynamics(dynamics),
    }
}

/// If/With branches collapse a dynamics-free body down to a plain string
/// (spec.md §4.2's worked example: `{{if .Active}}on{{else}}off{{end}}`
/// renders its selected arm as `"off"`, not `{"s":["off"]}`).
fn collapse_or_tree(statics: Vec<String>, dynamics: Vec<(String, DynamicValue)>, include_s: bool) -> DynamicValue {
    if dynamics.is_empty() {
        DynamicValue::Str(statics.join(""))
    } else {
        DynamicValue::Tree(Box::new(finish_tree(statics, dynamics, include_s)))
    }
}

/// Walk `nodes`, building the static skeleton and the dynamic slot list in
/// lockstep (spec.md §4.2 step 2). When `force_full` is false, slots whose
/// value is unchanged between `old` and `new` are omitted; when true, every
/// slot is rendered fresh against `new` (and structural children are told to
/// do the same, recursively).
fn render_nodes(
    nodes: &[Node],
    old: &Value,
    new: &Value,
    force_full: bool,
    attribute_paths: &HashSet<String>,
) -> Result<(Vec<String>, Vec<(String, DynamicValue)>), TreeError> {
    let mut statics = Vec::new();
    let mut current = String::new();
    let mut dynamics = Vec::new();
    let mut slot = 0usize;

    for node in nodes {
        let result: SlotResult = match node {
            Node::Static(text) => {
                current.push_str(text);
                continue;
            }
            Node::Unsupported(which) => return Err(TreeError::Unsupported(*which)),
            Node::Field(path) | Node::Function(path) => {
                let mode = if attribute_paths.contains(path) {
                    EscapeMode::Attr
                } else {
                    EscapeMode::Text
                };
                let old_s = eval_interpolation(path, old, mode)?;
                let new_s = eval_interpolation(path, new, mode)?;
                if !force_full && old_s == new_s {
                    None
                } else {
                    Some(DynamicValue::Str(new_s))
                }
            }
            Node::If { branches } => render_if(branches, old, new, force_full, attribute_paths)?,
            Node::With {
                expr,
                body,
                else_body,
            } => render_with(expr, body, else_body.as_deref(), old, new, force_full, attribute_paths)?,
            Node::Range { expr, body } => render_range(expr, body, old, new, force_full, attribute_paths)?,
        };

        statics.push(std::mem::take(&mut current));
        if let Some(value) = result {
            dynamics.push((slot.to_string(), value));
        }
        slot += 1;
    }
    statics.push(current);
    Ok((statics, dynamics))
}

fn branch_index(branches: &[(Option<String>, Vec<Node>)], data: &Value) -> Result<Option<usize>, TreeError> {
    for (i, (cond, _)) in branches.iter().enumerate() {
        let matches = match cond {
            None => true,
            Some(expr) => eval_condition(expr, data)?,
        };
        if matches {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn render_if(
    branches: &[(Option<String>, Vec<Node>)],
    old: &Value,
    new: &Value,
    force_full: bool,
    attribute_paths: &HashSet<String>,
) -> Result<SlotResult, TreeError> {
    let old_idx = branch_index(branches, old)?;
    let new_idx = branch_index(branches, new)?;
    let structural = force_full || old_idx != new_idx;

    match (new_idx, structural) {
        (None, false) => Ok(None), // still no matching branch, nothing changed
        (None, true) => Ok(Some(DynamicValue::Str(String::new()))),
        (Some(i), true) => {
            let (_, body) = &branches[i];
            let (statics, dynamics) = render_nodes(body, new, new, true, attribute_paths)?;
            Ok(Some(collapse_or_tree(statics, dynamics, true)))
        }
        (Some(i), false) => {
            let (_, body) = &branches[i];
            let (statics, dynamics) = render_nodes(body, old, new, false, attribute_paths)?;
            if dynamics.is_empty() {
                Ok(None)
            } else {
                Ok(Some(DynamicValue::Tree(Box::new(finish_tree(statics, dynamics, false)))))
            }
        }
    }
}

fn render_with(
    expr: &str,
    body: &[Node],
    else_body: Option<&[Node]>,
    old: &Value,
    new: &Value,
    force_full: bool,
    attribute_paths: &HashSet<String>,
) -> Result<SlotResult, TreeError> {
    let old_truthy = eval_condition(expr, old)?;
    let new_truthy = eval_condition(expr, new)?;
    let structural = force_full || old_truthy != new_truthy;

    let new_ctx = if new_truthy {
        eval::evaluate_expr(expr, new).unwrap_or(Value::Null)
    } else {
        new.clone()
    };
    let old_ctx = if old_truthy {
        eval::evaluate_expr(expr, old).unwrap_or(Value::Null)
    } else {
        old.clone()
    };

    let active_body = if new_truthy {
        body
    } else {
        else_body.unwrap_or(&[])
    };

    if active_body.is_empty() && !structural {
        return Ok(None);
    }

    if structural {
        let (statics, dynamics) = render_nodes(active_body, &new_ctx, &new_ctx, true, attribute_paths)?;
        Ok(Some(collapse_or_tree(statics, dynamics, true)))
    } else {
        let (statics, dynamics) = render_nodes(active_body, &old_ctx, &new_ctx, false, attribute_paths)?;
        if dynamics.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DynamicValue::Tree(Box::new(finish_tree(statics, dynamics, false)))))
        }
    }
}

/// Render a single range element as a full, non-collapsing `TreeData`
/// (range slots are always structured, per spec.md §4.2, never collapsed to
/// a plain string the way `if`/`with` arms are).
fn render_range_item(
    body: &[Node],
    old: &Value,
    new: &Value,
    force_full: bool,
    attribute_paths: &HashSet<String>,
) -> Result<TreeData, TreeError> {
    let (statics, dynamics) = render_nodes(body, old, new, force_full, attribute_paths)?;
    Ok(finish_tree(statics, dynamics, force_full))
}

fn render_range(
    expr: &str,
    body: &[Node],
    old: &Value,
    new: &Value,
    force_full: bool,
    attribute_paths: &HashSet<String>,
) -> Result<SlotResult, TreeError> {
    let old_items = eval_range(expr, old)?;
    let new_items = eval_range(expr, new)?;

    let new_len = match &new_items {
        RangeItems::Empty => 0,
        RangeItems::One(_) => 1,
        RangeItems::Many(v) => v.len(),
    };
    let old_len = match &old_items {
        RangeItems::Empty => 0,
        RangeItems::One(_) => 1,
        RangeItems::Many(v) => v.len(),
    };
    // Any class transition (including a many-element count change) is a
    // user-visible structural change and invalidates the whole slot
    // (spec.md §4.2's tie-break policy, extended to same-class length
    // changes as this spec's resolution of the under-specified many-shrink
    // case noted in spec.md §9).
    let structural = force_full || old_len != new_len;

    match &new_items {
        RangeItems::Empty => {
            if !structural {
                Ok(None)
            } else {
                Ok(Some(DynamicValue::Tree(Box::new(finish_tree(
                    vec![String::new()],
                    Vec::new(),
                    true,
                )))))
            }
        }
        RangeItems::One(new_item) => {
            if !structural {
                let old_item = match &old_items {
                    RangeItems::One(v) => v,
                    _ => unreachable!("same class as new_items by structural check"),
                };
                let td = render_range_item(body, old_item, new_item, false, attribute_paths)?;
                if td.dynamics.0.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(DynamicValue::Tree(Box::new(td))))
                }
            } else {
                let td = render_range_item(body, new_item, new_item, true, attribute_paths)?;
                Ok(Some(DynamicValue::Tree(Box::new(td))))
            }
        }
        RangeItems::Many(new_list) => {
            if !structural {
                let old_list = match &old_items {
                    RangeItems::Many(v) => v,
                    _ => unreachable!("same class as new_items by structural check"),
                };
                let mut any_changed = false;
                let mut items = Vec::with_capacity(new_list.len());
                for (o, n) in old_list.iter().zip(new_list.iter()) {
                    let td = render_range_item(body, o, n, false, attribute_paths)?;
                    if !td.dynamics.0.is_empty() {
                        any_changed = true;
                    }
                    items.push(td);
                }
                if any_changed {
                    Ok(Some(DynamicValue::List(items)))
                } else {
                    Ok(None)
                }
            } else {
                let mut items = Vec::with_capacity(new_list.len());
                for n in new_list {
                    items.push(render_range_item(body, n, n, true, attribute_paths)?);
                }
                Ok(Some(DynamicValue::List(items)))
            }
        }
    }
}

/// Caches the parsed [`Node`] tree and whether each fragment id has been
/// rendered before, keyed by fragment id (spec.md §4.2's "stable fragment
/// id" cache — typically a region id).
pub struct TreeGenerator {
    skeletons: RwLock<HashMap<String, Arc<Vec<Node>>>>,
}

impl TreeGenerator {
    pub fn new() -> Self {
        Self {
            skeletons: RwLock::new(HashMap::new()),
        }
    }

    /// Generate the `TreeData` for `fragment_id`, parsing and caching
    /// `template_source` the first time this id is seen. The first call for
    /// a given id always returns a full tree (`s` populated at every level);
    /// later calls return an incremental tree unless a structural change
    /// forces a subtree to regenerate in full.
    pub fn generate(
        &self,
        fragment_id: &str,
        template_source: &str,
        old_data: &Value,
        new_data: &Value,
        attribute_paths: &HashSet<String>,
    ) -> Result<TreeData, TreeError> {
        let (nodes, first_call) = self.nodes_for(fragment_id, template_source)?;
        let (statics, dynamics) = render_nodes(&nodes, old_data, new_data, first_call, attribute_paths)?;
        Ok(finish_tree(statics, dynamics, first_call))
    }

    fn nodes_for(&self, fragment_id: &str, template_source: &str) -> Result<(Arc<Vec<Node>>, bool), TreeError> {
        if let Some(nodes) = self.skeletons.read().get(fragment_id) {
            return Ok((nodes.clone(), false));
        }
        let built = Arc::new(build_nodes(template_source)?);
        let mut write = self.skeletons.write();
        let nodes = write.entry(fragment_id.to_string()).or_insert_with(|| built).clone();
        Ok((nodes, true))
    }

    /// Execute the whole fragment against `data` and return plain HTML,
    /// ignoring incremental state entirely (spec.md §4.4's `Render`, which
    /// always needs complete output). Reuses the cached `Node` tree but
    /// always walks with `force_full = true`.
    pub fn render_full(
        &self,
        fragment_id: &str,
        template_source: &str,
        data: &Value,
        attribute_paths: &HashSet<String>,
    ) -> Result<String, TreeError> {
        let (nodes, _) = self.nodes_for(fragment_id, template_source)?;
        let (statics, dynamics) = render_nodes(&nodes, data, data, true, attribute_paths)?;
        Ok(flatten_tree(&finish_tree(statics, dynamics, true)))
    }

    /// Drop cached skeleton state for `fragment_id` (e.g. when a region's
    /// template source changes, which cannot happen mid-Page but matters
    /// for tests and for `Page::close`).
    pub fn forget(&self, fragment_id: &str) {
        self.skeletons.write().remove(fragment_id);
    }

    pub fn clear(&self) {
        self.skeletons.write().clear();
    }
}

impl Default for TreeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate a fully-populated `TreeData` (every `s` along the way must be
/// `Some`) back into plain text, the way spec.md §8 property 3 describes.
/// Panics if given an incremental tree with `s: None` anywhere — only meant
/// for trees produced with `force_full = true` throughout.
pub(crate) fn flatten_tree(td: &TreeData) -> String {
    let statics = td
        .s
        .as_ref()
        .expect("flatten_tree requires a fully-populated tree (s must be Some everywhere)");
    let mut out = String::new();
    for (i, (_, value)) in td.dynamics.0.iter().enumerate() {
        out.push_str(&statics[i]);
        match value {
            DynamicValue::Str(s) => out.push_str(s),
            DynamicValue::Tree(t) => out.push_str(&flatten_tree(t)),
            DynamicValue::List(items) => {
                for item in items {
                    out.push_str(&flatten_tree(item));
                }
            }
        }
    }
    out.push_str(statics.last().expect("statics always has at least one entry"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_attrs() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn single_field_first_then_incremental() {
        let gen = TreeGenerator::new();
        let data0 = json!({"Counter": 0});
        let td = gen
            .generate("f1", "Hello {{.Counter}} World", &data0, &data0, &no_attrs())
            .unwrap();
        assert_eq!(td.s, Some(vec!["Hello ".to_string(), " World".to_string()]));
        assert_eq!(td.dynamics.0, vec![("0".to_string(), DynamicValue::Str("0".to_string()))]);

        let data1 = json!({"Counter": 1});
        let td2 = gen
            .generate("f1", "Hello {{.Counter}} World", &data0, &data1, &no_attrs())
            .unwrap();
        assert_eq!(td2.s, None);
        assert_eq!(td2.dynamics.0, vec![("0".to_string(), DynamicValue::Str("1".to_string()))]);
    }

    #[test]
    fn conditional_branch_flip() {
        let gen = TreeGenerator::new();
        let off = json!({"Active": false});
        let td = gen
            .generate("f2", "{{if .Active}}on{{else}}off{{end}}", &off, &off, &no_attrs())
            .unwrap();
        assert_eq!(td.s, Some(vec![String::new(), String::new()]));
        assert_eq!(td.dynamics.0, vec![("0".to_string(), DynamicValue::Str("off".to_string()))]);

        let on = json!({"Active": true});
        let td2 = gen
            .generate("f2", "{{if .Active}}on{{else}}off{{end}}", &off, &on, &no_attrs())
            .unwrap();
        assert_eq!(td2.s, None);
        assert_eq!(td2.dynamics.0, vec![("0".to_string(), DynamicValue::Str("on".to_string()))]);
    }

    #[test]
    fn range_growth_classes() {
        let gen = TreeGenerator::new();
        let empty = json!({"Items": []});
        let td = gen
            .generate("f3", "<ul>{{range .Items}}<li>{{.}}</li>{{end}}</ul>", &empty, &empty, &no_attrs())
            .unwrap();
        assert!(matches!(
            td.dynamics.0[0].1,
            DynamicValue::Tree(_)
        ));

        let one = json!({"Items": ["a"]});
        let td2 = gen
            .generate("f3", "<ul>{{range .Items}}<li>{{.}}</li>{{end}}</ul>", &empty, &one, &no_attrs())
            .unwrap();
        let DynamicValue::Tree(inner) = &td2.dynamics.0[0].1 else {
            panic!("expected a single TreeData for range-one");
        };
        assert_eq!(inner.s, Some(vec!["<li>".to_string(), "</li>".to_string()]));

        let two = json!({"Items": ["a", "b"]});
        let td3 = gen
            .generate("f3", "<ul>{{range .Items}}<li>{{.}}</li>{{end}}</ul>", &one, &two, &no_attrs())
            .unwrap();
        let DynamicValue::List(items) = &td3.dynamics.0[0].1 else {
            panic!("expected a list for range-many");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn unchanged_data_produces_no_dynamics() {
        let gen = TreeGenerator::new();
        let data = json!({"Counter": 0});
        gen.generate("f4", "{{.Counter}}", &data, &data, &no_attrs()).unwrap();
        let td = gen.generate("f4", "{{.Counter}}", &data, &data, &no_attrs()).unwrap();
        assert!(td.is_empty_update());
    }

    #[test]
    fn pipeline_is_unsupported() {
        let gen = TreeGenerator::new();
        let data = json!({"Name": "x"});
        let err = gen.generate("f5", "{{.Name | upper}}", &data, &data, &no_attrs()).unwrap_err();
        assert!(matches!(
            err,
            TreeError::Unsupported(UnsupportedConstruct::Pipeline)
        ));
    }

    #[test]
    fn missing_field_degrades_to_empty_string() {
        let gen = TreeGenerator::new();
        let data = json!({});
        let td = gen.generate("f6", "[{{.Missing}}]", &data, &data, &no_attrs()).unwrap();
        assert_eq!(td.dynamics.0[0].1, DynamicValue::Str(String::new()));
    }

    #[test]
    fn render_full_reconstructs_html() {
        let gen = TreeGenerator::new();
        let data = json!({"N": 5});
        let html = gen
            .render_full("f8", "<div>Count: {{.N}}</div>", &data, &no_attrs())
            .unwrap();
        assert_eq!(html, "<div>Count: 5</div>");
    }

    #[test]
    fn render_full_is_deterministic_across_calls() {
        let gen = TreeGenerator::new();
        let data = json!({"Active": true});
        let a = gen.render_full("f9", "{{if .Active}}on{{else}}off{{end}}", &data, &no_attrs()).unwrap();
        let b = gen.render_full("f9", "{{if .Active}}on{{else}}off{{end}}", &data, &no_attrs()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "on");
    }

    #[test]
    fn serializes_with_sibling_keys() {
        let gen = TreeGenerator::new();
        let data = json!({"Counter": 0});
        let td = gen.generate("f7", "{{.Counter}}", &data, &data, &no_attrs()).unwrap();
        let v = serde_json::to_value(&td).unwrap();
        assert_eq!(v["s"], json!(["", ""]));
        assert_eq!(v["0"], json!("0"));
    }

    #[test]
    fn text_position_slot_escapes_html() {
        let gen = TreeGenerator::new();
        let data = json!({"Name": "<script>alert(1)</script>"});
        let td = gen.generate("f10", "<p>{{.Name}}</p>", &data, &data, &no_attrs()).unwrap();
        assert_eq!(
            td.dynamics.0[0].1,
            DynamicValue::Str("&lt;script&gt;alert(1)&lt;/script&gt;".to_string())
        );
    }

    #[test]
    fn attribute_context_slot_escapes_quotes() {
        let gen = TreeGenerator::new();
        let data = json!({"V": "\"onmouseover=alert(1) x=\""});
        let mut attrs = HashSet::new();
        attrs.insert(".V".to_string());
        let td = gen
            .generate("f11", "<input value=\"{{.V}}\">", &data, &data, &attrs)
            .unwrap();
        assert_eq!(
            td.dynamics.0[0].1,
            DynamicValue::Str("&quot;onmouseover=alert(1) x=&quot;".to_string())
        );
    }
}
