//! Field Evaluator: resolves dotted field paths and a small set of built-in
//! function calls against a data value, the way spec.md §4.1/§9 describes
//! ("a typed walker over a data value abstraction supporting map-like,
//! struct-like, pointer-like, and sequence-like views").
//!
//! Rust has no reflection, so the "struct-like" view is whatever the caller's
//! data serializes to: `Page` accepts any `T: Serialize` and converts it to
//! `serde_json::Value` once per snapshot, which already gives us map-like
//! (object), sequence-like (array), and pointer-like (`Option` flattens to
//! `null` or the inner value through `serde`) views for free.

use crate::error::EvalError;
use serde_json::Value;

/// Resolve a dotted path such as `.A.B.C` against `data`.
///
/// Policy (spec.md §4.1): a missing field is an error; a `null` encountered
/// partway through the path is also an error (nil deref). Callers that only
/// want a truthy/falsy read (`if`/`with`) or a best-effort string
/// (interpolation) should catch these and degrade rather than propagate.
pub fn evaluate_field_path(path: &str, data: &Value) -> Result<Value, EvalError> {
    let path = path.trim();
    if path == "." {
        return Ok(data.clone());
    }
    let Some(rest) = path.strip_prefix('.') else {
        return Err(EvalError::MalformedExpression(path.to_string()));
    };

    let mut current = data.clone();
    let mut consumed = String::new();
    for segment in rest.split('.') {
        if segment.is_empty() {
            return Err(EvalError::MalformedExpression(path.to_string()));
        }
        consumed.push('.');
        consumed.push_str(segment);

        if current.is_null() {
            return Err(EvalError::NilDeref {
                path: consumed.clone(),
            });
        }

        current = match &current {
            Value::Object(map) => map
                .get(segment)
                .cloned()
                .ok_or_else(|| EvalError::MissingField {
                    path: consumed.clone(),
                })?,
            Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| EvalError::MissingField {
                    path: consumed.clone(),
                })?;
                items
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| EvalError::MissingField {
                        path: consumed.clone(),
                    })?
            }
            _ => {
                return Err(EvalError::MissingField {
                    path: consumed.clone(),
                })
            }
        };
    }
    Ok(current)
}

/// Truthiness policy shared by `if` and `with`: non-nil, non-empty,
/// non-zero (spec.md §4.1, §4.2).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Default stringification used for direct interpolation (spec.md §4.2):
/// booleans as `true`/`false`, integers base-10, floats in shortest
/// round-trippable form, nil as the empty string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else if let Some(f) = n.as_f64() {
                format_f64_shortest(f)
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

fn format_f64_shortest(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        let mut s = format!("{}", f);
        if !s.contains('.') && !s.contains('e') {
            s.push_str(".0");
        }
        s
    }
}

/// A sequence view over a resolved range expression's value, classified into
/// the three structural shapes spec.md §4.2 distinguishes: empty, exactly
/// one, or many. The shape is user-visible in the emitted TreeData, so
/// callers must re-derive it on every call rather than caching across data
/// changes.
pub enum RangeItems {
    Empty,
    One(Value),
    Many(Vec<Value>),
}

pub fn range_items(value: &Value) -> Result<RangeItems, EvalError> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.values().cloned().collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(EvalError::NotIterable {
                path: stringify(other),
            })
        }
    };
    Ok(match items.len() {
        0 => RangeItems::Empty,
        1 => RangeItems::One(items.into_iter().next().unwrap()),
        _ => RangeItems::Many(items),
    })
}

/// Evaluate a `Function` boundary's expression: a dotted field path, a
/// quoted/numeric/bool literal, or a call to one of a small set of built-in
/// functions (`eq`, `ne`, `not`, `and`, `or`, `len`, `printf`, `index`).
/// This is not a general template-function runtime; it covers the built-ins
/// spec.md §4.1 calls out as distinguishing `Function` from `SimpleField`.
pub fn evaluate_expr(expr: &str, data: &Value) -> Result<Value, EvalError> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let value = parse_call_or_atom(&tokens, &mut pos, data)?;
    if pos != tokens.len() {
        return Err(EvalError::MalformedExpression(expr.to_string()));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    Dot,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.trim().chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '"' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                }
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(EvalError::MalformedExpression(expr.to_string()));
            }
            i += 1;
            tokens.push(Token::StringLit(s));
        } else if c == '.' {
            let mut s = String::from(".");
            i += 1;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                s.push(chars[i]);
                i += 1;
            }
            if s == "." {
                tokens.push(Token::Dot);
            } else {
                tokens.push(Token::Ident(s));
            }
        } else if c.is_ascii_digit() || (c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let num: String = chars[start..i].iter().collect();
            let n: f64 = num
                .parse()
                .map_err(|_| EvalError::MalformedExpression(expr.to_string()))?;
            tokens.push(Token::NumberLit(n));
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(word));
        }
    }
    Ok(tokens)
}

fn parse_call_or_atom(tokens: &[Token], pos: &mut usize, data: &Value) -> Result<Value, EvalError> {
    let Some(tok) = tokens.get(*pos) else {
        return Err(EvalError::MalformedExpression("empty expression".into()));
    };
    match tok {
        Token::StringLit(s) => {
            *pos += 1;
            Ok(Value::String(s.clone()))
        }
        Token::NumberLit(n) => {
            *pos += 1;
            Ok(serde_json::json!(*n))
        }
        Token::Dot => {
            *pos += 1;
            Ok(data.clone())
        }
        Token::Ident(ident) if ident.starts_with('.') => {
            *pos += 1;
            evaluate_field_path(ident, data)
        }
        Token::Ident(name) => {
            let name = name.clone();
            *pos += 1;
            let mut args = Vec::new();
            while *pos < tokens.len() {
                args.push(parse_call_or_atom(tokens, pos, data)?);
            }
            call_builtin(&name, args)
        }
    }
}

fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match name {
        "eq" => arity(2, &args, name)
            .map(|_| Value::Bool(values_equal(&args[0], &args[1]))),
        "ne" => arity(2, &args, name)
            .map(|_| Value::Bool(!values_equal(&args[0], &args[1]))),
        "not" => arity(1, &args, name).map(|_| Value::Bool(!is_truthy(&args[0]))),
        "and" => Ok(Value::Bool(args.iter().all(is_truthy))),
        "or" => Ok(Value::Bool(args.iter().any(is_truthy))),
        "len" => arity(1, &args, name).map(|_| match &args[0] {
            Value::Array(a) => serde_json::json!(a.len()),
            Value::Object(o) => serde_json::json!(o.len()),
            Value::String(s) => serde_json::json!(s.chars().count()),
            Value::Null => serde_json::json!(0),
            _ => serde_json::json!(0),
        }),
        "index" => arity(2, &args, name).map(|_| match (&args[0], &args[1]) {
            (Value::Array(a), idx) => idx
                .as_u64()
                .and_then(|i| a.get(i as usize))
                .cloned()
                .unwrap_or(Value::Null),
            (Value::Object(o), Value::String(k)) => o.get(k).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }),
        "printf" => {
            if args.is_empty() {
                return Err(EvalError::ArityMismatch {
                    name: name.to_string(),
                });
            }
            let fmt = stringify(&args[0]);
            let mut rest = args[1..].iter().map(stringify);
            let mut out = String::new();
            let mut chars = fmt.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '%' {
                    if let Some(&next) = chars.peek() {
                        if matches!(next, 'd' | 's' | 'v' | 'f') {
                            chars.next();
                            out.push_str(&rest.next().unwrap_or_default());
                            continue;
                        }
                    }
                }
                out.push(c);
            }
            Ok(Value::String(out))
        }
        other => Err(EvalError::UnknownFunction {
            name: other.to_string(),
        }),
    }
}

fn arity(n: usize, args: &[Value], name: &str) -> Result<(), EvalError> {
    if args.len() != n {
        Err(EvalError::ArityMismatch {
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_field() {
        let data = json!({"a": {"b": {"c": 5}}});
        assert_eq!(evaluate_field_path(".a.b.c", &data).unwrap(), json!(5));
    }

    #[test]
    fn missing_field_is_error() {
        let data = json!({"a": 1});
        assert!(matches!(
            evaluate_field_path(".a.b", &data),
            Err(EvalError::MissingField { .. })
        ));
    }

    #[test]
    fn nil_deref_is_error() {
        let data = json!({"a": null});
        assert!(matches!(
            evaluate_field_path(".a.b", &data),
            Err(EvalError::NilDeref { .. })
        ));
    }

    #[test]
    fn truthy_policy() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(1)));
    }

    #[test]
    fn stringify_policy() {
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(1.5)), "1.5");
    }

    #[test]
    fn builtin_eq() {
        let data = json!({"n": 5});
        assert_eq!(evaluate_expr("eq .n 5", &data).unwrap(), json!(true));
    }

    #[test]
    fn builtin_not() {
        let data = json!({"active": false});
        assert_eq!(evaluate_expr("not .active", &data).unwrap(), json!(true));
    }

    #[test]
    fn range_items_classes() {
        assert!(matches!(range_items(&json!([])).unwrap(), RangeItems::Empty));
        assert!(matches!(range_items(&json!([1])).unwrap(), RangeItems::One(_)));
        assert!(matches!(
            range_items(&json!([1, 2])).unwrap(),
            RangeItems::Many(_)
        ));
    }
}
