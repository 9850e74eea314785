//! Template function library.
//!
//! Dispatch point for every function callable from `{{...}}` expressions.
//! Argument order follows the Go text/template convention: the subject of a
//! pipeline arrives as the LAST argument, so `{{.name | upper}}` and
//! `{{upper .name}}` are equivalent.
//!
//! JSON payloads are capped at [`MAX_JSON_SIZE`] and array arguments at
//! [`MAX_ARRAY_LEN`] so a template cannot amplify memory use unboundedly.

use serde_json::{Map, Number, Value, json};

use crate::template::{MAX_ARRAY_LEN, MAX_JSON_SIZE, TemplateError, value_to_string};

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Call a library function by name with already-evaluated arguments.
pub fn call(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    match name {
        // Math
        "add" => fold_numeric(name, args, i64::checked_add, |a, b| a + b),
        "sub" => binary_numeric(name, args, i64::checked_sub, |a, b| a - b),
        "mul" => fold_numeric(name, args, i64::checked_mul, |a, b| a * b),
        "div" => int_div(name, args, false),
        "mod" => int_div(name, args, true),
        "divf" => divf(name, args),
        "min" => fold_numeric(name, args, |a, b| Some(a.min(b)), f64::min),
        "max" => fold_numeric(name, args, |a, b| Some(a.max(b)), f64::max),

        // JSON
        "toJson" => to_json(name, args, false),
        "toJsonPretty" => to_json(name, args, true),
        "fromJson" => from_json(name, args),

        // Strings
        "upper" => map_string(name, args, |s| s.to_uppercase()),
        "lower" => map_string(name, args, |s| s.to_lowercase()),
        "title" => map_string(name, args, title_case),
        "trim" => map_string(name, args, |s| s.trim().to_string()),
        "trimPrefix" => string_pair(name, args, |p, s| {
            s.strip_prefix(p).unwrap_or(s).to_string().into()
        }),
        "trimSuffix" => string_pair(name, args, |p, s| {
            s.strip_suffix(p).unwrap_or(s).to_string().into()
        }),
        "hasPrefix" => string_pair(name, args, |p, s| s.starts_with(p).into()),
        "hasSuffix" => string_pair(name, args, |p, s| s.ends_with(p).into()),
        "contains" => string_pair(name, args, |needle, s| s.contains(needle).into()),
        "replace" => replace(name, args),
        "split" => split(name, args),
        "join" => join(name, args),

        // Collections
        "first" => array_unary(name, args, |items| {
            Ok(items.first().cloned().unwrap_or(Value::Null))
        }),
        "last" => array_unary(name, args, |items| {
            Ok(items.last().cloned().unwrap_or(Value::Null))
        }),
        "len" => len(name, args),
        "keys" => keys(name, args),
        "values" => values(name, args),
        "hasKey" => has_key(name, args),
        "pluck" => pluck(name, args),

        // Defaults
        "default" => default_fn(name, args),
        "coalesce" => Ok(args
            .iter()
            .find(|v| !is_empty(v))
            .cloned()
            .unwrap_or(Value::Null)),

        // Type conversion
        "toInt" => to_int(name, args),
        "toFloat" => to_float(name, args),
        "toString" => {
            let [v] = expect_args::<1>(name, args)?;
            Ok(Value::String(value_to_string(v)))
        }
        "toBool" => to_bool(name, args),

        other => Err(TemplateError::UnknownFunction {
            name: other.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn expect_args<'a, const N: usize>(
    name: &str,
    args: &'a [Value],
) -> Result<&'a [Value; N], TemplateError> {
    args.try_into().map_err(|_| TemplateError::Function {
        name: name.to_string(),
        message: format!("expected {N} argument(s), got {}", args.len()),
    })
}

fn arg_error(name: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::Function {
        name: name.to_string(),
        message: message.into(),
    }
}

fn overflow_error(name: &str) -> TemplateError {
    arg_error(name, "integer overflow")
}

/// Numeric argument, preserving the int/float distinction.
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(name: &str, value: &Value) -> Result<Num, TemplateError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Num::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Num::Float(f))
            } else {
                Err(arg_error(name, "number out of range"))
            }
        }
        other => Err(arg_error(
            name,
            format!("expected a number, got {}", crate::context::value_kind(other)),
        )),
    }
}

fn num_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::from(i),
        Num::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn as_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, TemplateError> {
    value.as_str().ok_or_else(|| {
        arg_error(
            name,
            format!("expected a string, got {}", crate::context::value_kind(value)),
        )
    })
}

fn as_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>, TemplateError> {
    let items = value.as_array().ok_or_else(|| {
        arg_error(
            name,
            format!("expected an array, got {}", crate::context::value_kind(value)),
        )
    })?;
    if items.len() > MAX_ARRAY_LEN {
        return Err(TemplateError::ResourceExceeded {
            what: "array length",
            size: items.len(),
            max: MAX_ARRAY_LEN,
        });
    }
    Ok(items)
}

fn as_object<'a>(name: &str, value: &'a Value) -> Result<&'a Map<String, Value>, TemplateError> {
    value.as_object().ok_or_else(|| {
        arg_error(
            name,
            format!("expected a map, got {}", crate::context::value_kind(value)),
        )
    })
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

/// Variadic fold. All-integer inputs keep integer arithmetic; any float
/// promotes the whole computation to floats. Integer overflow errors
/// instead of wrapping.
fn fold_numeric(
    name: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, TemplateError> {
    if args.is_empty() {
        return Err(arg_error(name, "expected at least 1 argument"));
    }
    let mut nums = Vec::with_capacity(args.len());
    let mut any_float = false;
    for arg in args {
        let n = as_num(name, arg)?;
        if matches!(n, Num::Float(_)) {
            any_float = true;
        }
        nums.push(n);
    }
    if any_float {
        let mut iter = nums.into_iter().map(|n| match n {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        });
        let first = iter.next().unwrap_or(0.0);
        Ok(num_value(Num::Float(iter.fold(first, float_op))))
    } else {
        let mut iter = nums.into_iter().map(|n| match n {
            Num::Int(i) => i,
            Num::Float(_) => unreachable!(),
        });
        let first = iter.next().unwrap_or(0);
        let folded = iter
            .try_fold(first, |acc, n| int_op(acc, n))
            .ok_or_else(|| overflow_error(name))?;
        Ok(num_value(Num::Int(folded)))
    }
}

fn binary_numeric(
    name: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, TemplateError> {
    let [a, b] = expect_args::<2>(name, args)?;
    match (as_num(name, a)?, as_num(name, b)?) {
        (Num::Int(x), Num::Int(y)) => {
            let n = int_op(x, y).ok_or_else(|| overflow_error(name))?;
            Ok(num_value(Num::Int(n)))
        }
        (x, y) => {
            let (x, y) = (to_f64(x), to_f64(y));
            Ok(num_value(Num::Float(float_op(x, y))))
        }
    }
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// Integer division and modulo. Floats are rejected; zero divisors and
/// overflow (i64::MIN / -1) error.
fn int_div(name: &str, args: &[Value], modulo: bool) -> Result<Value, TemplateError> {
    let [a, b] = expect_args::<2>(name, args)?;
    let (Num::Int(x), Num::Int(y)) = (as_num(name, a)?, as_num(name, b)?) else {
        return Err(arg_error(name, "expected integer arguments"));
    };
    if y == 0 {
        return Err(TemplateError::DivideByZero {
            name: if modulo { "mod" } else { "div" },
        });
    }
    let result = if modulo {
        x.checked_rem(y)
    } else {
        x.checked_div(y)
    };
    result
        .map(Value::from)
        .ok_or_else(|| overflow_error(name))
}

fn divf(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [a, b] = expect_args::<2>(name, args)?;
    let x = to_f64(as_num(name, a)?);
    let y = to_f64(as_num(name, b)?);
    Ok(num_value(Num::Float(x / y)))
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn to_json(name: &str, args: &[Value], pretty: bool) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    let serialized = if pretty {
        serde_json::to_string_pretty(v)
    } else {
        serde_json::to_string(v)
    }
    .map_err(|e| arg_error(name, e.to_string()))?;
    if serialized.len() > MAX_JSON_SIZE {
        return Err(TemplateError::ResourceExceeded {
            what: "JSON output",
            size: serialized.len(),
            max: MAX_JSON_SIZE,
        });
    }
    Ok(Value::String(serialized))
}

fn from_json(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    let s = as_str(name, v)?;
    if s.len() > MAX_JSON_SIZE {
        return Err(TemplateError::ResourceExceeded {
            what: "JSON input",
            size: s.len(),
            max: MAX_JSON_SIZE,
        });
    }
    serde_json::from_str(s).map_err(|e| arg_error(name, format!("invalid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn map_string(
    name: &str,
    args: &[Value],
    f: impl Fn(&str) -> String,
) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    Ok(Value::String(f(as_str(name, v)?)))
}

/// Two string arguments with the subject last (pipeline-friendly).
fn string_pair(
    name: &str,
    args: &[Value],
    f: impl Fn(&str, &str) -> Value,
) -> Result<Value, TemplateError> {
    let [a, b] = expect_args::<2>(name, args)?;
    Ok(f(as_str(name, a)?, as_str(name, b)?))
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn replace(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [old, new, subject] = expect_args::<3>(name, args)?;
    let (old, new, subject) = (as_str(name, old)?, as_str(name, new)?, as_str(name, subject)?);
    Ok(Value::String(subject.replace(old, new)))
}

fn split(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [sep, subject] = expect_args::<2>(name, args)?;
    let (sep, subject) = (as_str(name, sep)?, as_str(name, subject)?);
    if sep.is_empty() {
        return Err(arg_error(name, "separator must be non-empty"));
    }
    Ok(Value::Array(
        subject.split(sep).map(|p| json!(p)).collect(),
    ))
}

fn join(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [sep, subject] = expect_args::<2>(name, args)?;
    let sep = as_str(name, sep)?;
    let items = as_array(name, subject)?;
    let parts: Vec<String> = items.iter().map(value_to_string).collect();
    Ok(Value::String(parts.join(sep)))
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

fn array_unary(
    name: &str,
    args: &[Value],
    f: impl Fn(&[Value]) -> Result<Value, TemplateError>,
) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    f(as_array(name, v)?)
}

fn len(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    let n = match v {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(arg_error(
                name,
                format!(
                    "expected a string, array, or map, got {}",
                    crate::context::value_kind(other)
                ),
            ));
        }
    };
    Ok(Value::from(n as i64))
}

/// Map keys in sorted order, for deterministic output.
fn keys(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    let map = as_object(name, v)?;
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    Ok(Value::Array(keys.into_iter().map(|k| json!(k)).collect()))
}

/// Map values ordered by their sorted keys.
fn values(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    let map = as_object(name, v)?;
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by_key(|(k, _)| *k);
    Ok(Value::Array(entries.into_iter().map(|(_, v)| v.clone()).collect()))
}

fn has_key(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [map, key] = expect_args::<2>(name, args)?;
    let map = as_object(name, map)?;
    let key = as_str(name, key)?;
    Ok(Value::Bool(map.contains_key(key)))
}

/// Extract a field from each map in an array, skipping entries that are not
/// maps or lack the field.
fn pluck(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [field, subject] = expect_args::<2>(name, args)?;
    let field = as_str(name, field)?;
    let items = as_array(name, subject)?;
    Ok(Value::Array(
        items
            .iter()
            .filter_map(|item| item.as_object().and_then(|m| m.get(field)).cloned())
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Empty means nil, empty string, empty array, or empty map. `false` and `0`
/// are NOT empty.
fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// `default d v`: `v` when non-empty, otherwise `d`. Subject last.
fn default_fn(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [d, v] = expect_args::<2>(name, args)?;
    Ok(if is_empty(v) { d.clone() } else { v.clone() })
}

// ---------------------------------------------------------------------------
// Type conversion
// ---------------------------------------------------------------------------

fn to_int(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::from(f.trunc() as i64))
            } else {
                Err(arg_error(name, "number out of range"))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| arg_error(name, "string does not parse as an integer")),
        Value::Bool(b) => Ok(Value::from(if *b { 1i64 } else { 0i64 })),
        other => Err(arg_error(
            name,
            format!("cannot convert {} to int", crate::context::value_kind(other)),
        )),
    }
}

fn to_float(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    match v {
        Value::Number(n) => n
            .as_f64()
            .map(|f| num_value(Num::Float(f)))
            .ok_or_else(|| arg_error(name, "number out of range")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| num_value(Num::Float(f)))
            .map_err(|_| arg_error(name, "string does not parse as a float")),
        Value::Bool(b) => Ok(num_value(Num::Float(if *b { 1.0 } else { 0.0 }))),
        other => Err(arg_error(
            name,
            format!("cannot convert {} to float", crate::context::value_kind(other)),
        )),
    }
}

/// Recognized truthy/falsy forms: booleans, 0/1, and the strings
/// true/false, yes/no, y/n, 1/0 (case-insensitive). The empty string is
/// false. Anything else is an error.
fn to_bool(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let [v] = expect_args::<1>(name, args)?;
    match v {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(arg_error(name, "number is not 0 or 1")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "n" | "0" | "" => Ok(Value::Bool(false)),
            _ => Err(arg_error(name, "string is not a recognized boolean form")),
        },
        other => Err(arg_error(
            name,
            format!("cannot convert {} to bool", crate::context::value_kind(other)),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn call_ok(name: &str, args: &[Value]) -> Value {
        call(name, args).unwrap()
    }

    // -----------------------------------------------------------------------
    // Math
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_integers_stay_integers() {
        assert_eq!(call_ok("add", &[json!(2), json!(3)]), json!(5));
    }

    #[test]
    fn test_add_promotes_to_float() {
        assert_eq!(call_ok("add", &[json!(2), json!(0.5)]), json!(2.5));
    }

    #[test]
    fn test_add_is_variadic() {
        assert_eq!(call_ok("add", &[json!(1), json!(2), json!(3)]), json!(6));
    }

    #[test]
    fn test_sub_mul() {
        assert_eq!(call_ok("sub", &[json!(10), json!(4)]), json!(6));
        assert_eq!(call_ok("mul", &[json!(3), json!(4)]), json!(12));
    }

    #[test]
    fn test_div_truncates() {
        assert_eq!(call_ok("div", &[json!(7), json!(2)]), json!(3));
    }

    #[test]
    fn test_div_by_zero_errors() {
        let err = call("div", &[json!(7), json!(0)]).unwrap_err();
        assert_eq!(err, TemplateError::DivideByZero { name: "div" });
        let err = call("mod", &[json!(7), json!(0)]).unwrap_err();
        assert_eq!(err, TemplateError::DivideByZero { name: "mod" });
    }

    #[test]
    fn test_div_rejects_floats() {
        assert!(call("div", &[json!(7.0), json!(2)]).is_err());
    }

    #[test]
    fn test_divf_is_float_division() {
        assert_eq!(call_ok("divf", &[json!(7), json!(2)]), json!(3.5));
    }

    #[test]
    fn test_mod_() {
        assert_eq!(call_ok("mod", &[json!(7), json!(3)]), json!(1));
    }

    #[test]
    fn test_min_max() {
        assert_eq!(call_ok("min", &[json!(3), json!(1), json!(2)]), json!(1));
        assert_eq!(call_ok("max", &[json!(3), json!(1), json!(2)]), json!(3));
        assert_eq!(call_ok("max", &[json!(1), json!(2.5)]), json!(2.5));
    }

    #[test]
    fn test_math_rejects_non_numbers() {
        let err = call("add", &[json!("x"), json!(1)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
    }

    #[test]
    fn test_integer_overflow_errors_instead_of_wrapping() {
        let err = call("add", &[json!(i64::MAX), json!(1)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
        let err = call("sub", &[json!(i64::MIN), json!(1)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
        let err = call("mul", &[json!(i64::MAX), json!(2)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
    }

    #[test]
    fn test_div_min_by_negative_one_errors() {
        let err = call("div", &[json!(i64::MIN), json!(-1)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
        let err = call("mod", &[json!(i64::MIN), json!(-1)]).unwrap_err();
        assert!(matches!(err, TemplateError::Function { .. }));
    }

    #[test]
    fn test_math_at_extremes_without_overflow() {
        assert_eq!(
            call_ok("add", &[json!(i64::MAX - 1), json!(1)]),
            json!(i64::MAX)
        );
        assert_eq!(
            call_ok("div", &[json!(i64::MIN), json!(1)]),
            json!(i64::MIN)
        );
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    #[test]
    fn test_to_json_roundtrip() {
        let v = json!({"a": [1, 2]});
        let s = call_ok("toJson", &[v.clone()]);
        assert_eq!(s, json!(r#"{"a":[1,2]}"#));
        assert_eq!(call_ok("fromJson", &[s]), v);
    }

    #[test]
    fn test_to_json_pretty_has_newlines() {
        let s = call_ok("toJsonPretty", &[json!({"a": 1})]);
        assert!(s.as_str().unwrap().contains('\n'));
    }

    #[test]
    fn test_from_json_invalid_errors() {
        assert!(call("fromJson", &[json!("{not json")]).is_err());
    }

    #[test]
    fn test_from_json_size_cap() {
        let big = "x".repeat(MAX_JSON_SIZE + 1);
        let err = call("fromJson", &[json!(big)]).unwrap_err();
        assert!(matches!(err, TemplateError::ResourceExceeded { .. }));
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    #[test]
    fn test_case_functions() {
        assert_eq!(call_ok("upper", &[json!("abc")]), json!("ABC"));
        assert_eq!(call_ok("lower", &[json!("ABC")]), json!("abc"));
        assert_eq!(call_ok("title", &[json!("hello wide world")]), json!("Hello Wide World"));
        assert_eq!(call_ok("trim", &[json!("  x  ")]), json!("x"));
    }

    #[test]
    fn test_prefix_suffix() {
        assert_eq!(call_ok("trimPrefix", &[json!("ab"), json!("abcd")]), json!("cd"));
        assert_eq!(call_ok("trimSuffix", &[json!("cd"), json!("abcd")]), json!("ab"));
        assert_eq!(call_ok("hasPrefix", &[json!("ab"), json!("abcd")]), json!(true));
        assert_eq!(call_ok("hasSuffix", &[json!("zz"), json!("abcd")]), json!(false));
    }

    #[test]
    fn test_contains_replace() {
        assert_eq!(call_ok("contains", &[json!("bc"), json!("abcd")]), json!(true));
        assert_eq!(
            call_ok("replace", &[json!("o"), json!("0"), json!("foo")]),
            json!("f00")
        );
    }

    #[test]
    fn test_split_join() {
        assert_eq!(
            call_ok("split", &[json!(","), json!("a,b,c")]),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            call_ok("join", &[json!("-"), json!(["a", "b"])]),
            json!("a-b")
        );
        assert_eq!(
            call_ok("join", &[json!(","), json!([1, 2])]),
            json!("1,2")
        );
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_last() {
        assert_eq!(call_ok("first", &[json!([1, 2, 3])]), json!(1));
        assert_eq!(call_ok("last", &[json!([1, 2, 3])]), json!(3));
        assert_eq!(call_ok("first", &[json!([])]), Value::Null);
    }

    #[test]
    fn test_len() {
        assert_eq!(call_ok("len", &[json!("abc")]), json!(3));
        assert_eq!(call_ok("len", &[json!([1, 2])]), json!(2));
        assert_eq!(call_ok("len", &[json!({"a": 1})]), json!(1));
    }

    #[test]
    fn test_keys_values_sorted() {
        let m = json!({"b": 2, "a": 1, "c": 3});
        assert_eq!(call_ok("keys", &[m.clone()]), json!(["a", "b", "c"]));
        assert_eq!(call_ok("values", &[m]), json!([1, 2, 3]));
    }

    #[test]
    fn test_has_key() {
        let m = json!({"a": 1});
        assert_eq!(call_ok("hasKey", &[m.clone(), json!("a")]), json!(true));
        assert_eq!(call_ok("hasKey", &[m, json!("b")]), json!(false));
    }

    #[test]
    fn test_pluck_skips_missing() {
        let items = json!([{"id": 1}, {"name": "x"}, {"id": 3}, "scalar"]);
        assert_eq!(call_ok("pluck", &[json!("id"), items]), json!([1, 3]));
    }

    #[test]
    fn test_array_length_cap() {
        let big: Vec<Value> = (0..=MAX_ARRAY_LEN as i64).map(Value::from).collect();
        let err = call("first", &[Value::Array(big)]).unwrap_err();
        assert!(matches!(err, TemplateError::ResourceExceeded { .. }));
    }

    // -----------------------------------------------------------------------
    // Defaults and conversion
    // -----------------------------------------------------------------------

    #[test]
    fn test_default_fills_empty() {
        assert_eq!(call_ok("default", &[json!("d"), Value::Null]), json!("d"));
        assert_eq!(call_ok("default", &[json!("d"), json!("")]), json!("d"));
        assert_eq!(call_ok("default", &[json!("d"), json!([])]), json!("d"));
        assert_eq!(call_ok("default", &[json!("d"), json!("v")]), json!("v"));
        // false and 0 are not empty
        assert_eq!(call_ok("default", &[json!("d"), json!(false)]), json!(false));
        assert_eq!(call_ok("default", &[json!("d"), json!(0)]), json!(0));
    }

    #[test]
    fn test_coalesce_first_non_empty() {
        assert_eq!(
            call_ok("coalesce", &[Value::Null, json!(""), json!("x"), json!("y")]),
            json!("x")
        );
        assert_eq!(call_ok("coalesce", &[Value::Null, json!("")]), Value::Null);
    }

    #[test]
    fn test_to_int() {
        assert_eq!(call_ok("toInt", &[json!("42")]), json!(42));
        assert_eq!(call_ok("toInt", &[json!(3.9)]), json!(3));
        assert_eq!(call_ok("toInt", &[json!(true)]), json!(1));
        assert!(call("toInt", &[json!("abc")]).is_err());
    }

    #[test]
    fn test_to_float() {
        assert_eq!(call_ok("toFloat", &[json!("2.5")]), json!(2.5));
        assert_eq!(call_ok("toFloat", &[json!(2)]), json!(2.0));
    }

    #[test]
    fn test_to_string() {
        assert_eq!(call_ok("toString", &[json!(5)]), json!("5"));
        assert_eq!(call_ok("toString", &[json!([1])]), json!("[1]"));
    }

    #[test]
    fn test_to_bool_forms() {
        for truthy in ["true", "YES", "y", "1"] {
            assert_eq!(call_ok("toBool", &[json!(truthy)]), json!(true), "{truthy}");
        }
        for falsy in ["false", "No", "n", "0", ""] {
            assert_eq!(call_ok("toBool", &[json!(falsy)]), json!(false), "{falsy}");
        }
        assert_eq!(call_ok("toBool", &[json!(1)]), json!(true));
        assert_eq!(call_ok("toBool", &[json!(0)]), json!(false));
        assert_eq!(call_ok("toBool", &[json!(true)]), json!(true));
        assert!(call("toBool", &[json!("maybe")]).is_err());
    }
}
