//! Methods on strings, numbers, arrays, plain objects and functions.
//!
//! These belong to the language rather than the capability whitelist, so
//! they are resolved by property lookup instead of through scope bindings.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::interpreter::{property_key, EvalResult, Interpreter};
use crate::value::{number_to_string, Function, RuntimeError, Value};

type Method = fn(&mut Interpreter, Value, Vec<Value>) -> EvalResult;

/// Longest string `repeat`/`padStart` may produce.
const MAX_STRING_LENGTH: usize = 1 << 24;

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn this_string(this: &Value, method: &str) -> EvalResult<String> {
    match this {
        Value::String(s) => Ok(s.clone()),
        other => Err(RuntimeError::type_error(format!(
            "String.prototype.{} called on {}",
            method,
            other.type_of()
        ))),
    }
}

fn this_array(this: &Value, method: &str) -> EvalResult<Rc<RefCell<Vec<Value>>>> {
    match this {
        Value::Array(items) => Ok(Rc::clone(items)),
        other => Err(RuntimeError::type_error(format!(
            "Array.prototype.{} called on {}",
            method,
            other.type_of()
        ))),
    }
}

fn callback(args: &[Value], method: &str) -> EvalResult<Value> {
    match args.first() {
        Some(func @ Value::Function(_)) => Ok(func.clone()),
        Some(other) => Err(RuntimeError::type_error(format!(
            "{} is not a function (in {})",
            other.to_js_string(),
            method
        ))),
        None => Err(RuntimeError::type_error(format!(
            "undefined is not a function (in {})",
            method
        ))),
    }
}

/// Resolves a possibly negative `slice`-style index against `len`.
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = value.to_number();
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    let len = len as f64;
    let resolved = if n < 0.0 { (len + n).max(0.0) } else { n.min(len) };
    resolved as usize
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => a.strict_equals(b),
    }
}

fn char_index(haystack: &str, byte_index: usize) -> f64 {
    haystack[..byte_index].chars().count() as f64
}

// ═══════════════════════════════════════════════════════════════════════════════
// STRINGS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn string_method(name: &str) -> Option<Value> {
    let method: Method = match name {
        "toUpperCase" => |_, this, _| Ok(Value::String(this_string(&this, "toUpperCase")?.to_uppercase())),
        "toLowerCase" => |_, this, _| Ok(Value::String(this_string(&this, "toLowerCase")?.to_lowercase())),
        "trim" => |_, this, _| Ok(Value::string(this_string(&this, "trim")?.trim())),
        "trimStart" => |_, this, _| Ok(Value::string(this_string(&this, "trimStart")?.trim_start())),
        "trimEnd" => |_, this, _| Ok(Value::string(this_string(&this, "trimEnd")?.trim_end())),
        "toString" | "valueOf" => |_, this, _| Ok(Value::String(this_string(&this, "toString")?)),
        "includes" => |_, this, args| {
            let s = this_string(&this, "includes")?;
            Ok(Value::Bool(s.contains(arg(&args, 0).to_js_string().as_str())))
        },
        "startsWith" => |_, this, args| {
            let s = this_string(&this, "startsWith")?;
            Ok(Value::Bool(s.starts_with(arg(&args, 0).to_js_string().as_str())))
        },
        "endsWith" => |_, this, args| {
            let s = this_string(&this, "endsWith")?;
            Ok(Value::Bool(s.ends_with(arg(&args, 0).to_js_string().as_str())))
        },
        "indexOf" => |_, this, args| {
            let s = this_string(&this, "indexOf")?;
            let needle = arg(&args, 0).to_js_string();
            Ok(Value::Number(
                s.find(needle.as_str()).map(|b| char_index(&s, b)).unwrap_or(-1.0),
            ))
        },
        "charAt" => |_, this, args| {
            let s = this_string(&this, "charAt")?;
            let index = arg(&args, 0).to_number();
            let index = if index.is_nan() { 0.0 } else { index };
            Ok(Value::String(if index < 0.0 {
                String::new()
            } else {
                s.chars().nth(index as usize).map(String::from).unwrap_or_default()
            }))
        },
        "slice" => |_, this, args| {
            let chars: Vec<char> = this_string(&this, "slice")?.chars().collect();
            let start = relative_index(&arg(&args, 0), chars.len(), 0);
            let end = relative_index(&arg(&args, 1), chars.len(), chars.len());
            Ok(Value::String(if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            }))
        },
        "split" => |_, this, args| {
            let s = this_string(&this, "split")?;
            let parts = match arg(&args, 0) {
                Value::Undefined => vec![Value::String(s)],
                separator => {
                    let separator = separator.to_js_string();
                    if separator.is_empty() {
                        s.chars().map(|c| Value::String(c.to_string())).collect()
                    } else {
                        s.split(separator.as_str()).map(Value::string).collect()
                    }
                }
            };
            Ok(Value::array(parts))
        },
        "replace" => |interp, this, args| replace(interp, this, args, false),
        "replaceAll" => |interp, this, args| replace(interp, this, args, true),
        "padStart" => |_, this, args| pad(this, args, true),
        "padEnd" => |_, this, args| pad(this, args, false),
        "repeat" => |_, this, args| {
            let s = this_string(&this, "repeat")?;
            let count = arg(&args, 0).to_number();
            if count < 0.0 || !count.is_finite() {
                return Err(RuntimeError::type_error("Invalid count value"));
            }
            let count = count as usize;
            if s.len().saturating_mul(count) > MAX_STRING_LENGTH {
                return Err(RuntimeError::type_error("Invalid string length"));
            }
            Ok(Value::String(s.repeat(count)))
        },
        _ => return None,
    };
    Some(Value::native(name, method))
}

fn replace(interp: &mut Interpreter, this: Value, args: Vec<Value>, all: bool) -> EvalResult {
    let s = this_string(&this, "replace")?;
    let pattern = arg(&args, 0).to_js_string();
    let replacement = arg(&args, 1);
    let mut out = String::with_capacity(s.len());
    let mut rest = s.as_str();
    let mut consumed = 0;
    while let Some(found) = rest.find(pattern.as_str()) {
        out.push_str(&rest[..found]);
        let with = match &replacement {
            Value::Function(_) => interp
                .call(
                    &replacement,
                    Value::Undefined,
                    vec![Value::String(pattern.clone()), Value::Number(char_index(&s, consumed + found))],
                )?
                .to_js_string(),
            other => other.to_js_string(),
        };
        out.push_str(&with);
        let advance = found + pattern.len();
        if pattern.is_empty() {
            // an empty pattern matches between every character
            match rest[advance..].chars().next() {
                Some(c) if all => {
                    out.push(c);
                    consumed += advance + c.len_utf8();
                    rest = &rest[advance + c.len_utf8()..];
                    continue;
                }
                _ => {
                    rest = &rest[advance..];
                    break;
                }
            }
        }
        consumed += advance;
        rest = &rest[advance..];
        if !all {
            break;
        }
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn pad(this: Value, args: Vec<Value>, start: bool) -> EvalResult {
    let s = this_string(&this, if start { "padStart" } else { "padEnd" })?;
    let target = arg(&args, 0).to_number();
    let target = if target.is_nan() { 0 } else { target.max(0.0) as usize };
    if target > MAX_STRING_LENGTH {
        return Err(RuntimeError::type_error("Invalid string length"));
    }
    let fill = match arg(&args, 1) {
        Value::Undefined => " ".to_string(),
        other => other.to_js_string(),
    };
    let len = s.chars().count();
    if target <= len || fill.is_empty() {
        return Ok(Value::String(s));
    }
    let padding: String = fill.chars().cycle().take(target - len).collect();
    Ok(Value::String(if start {
        format!("{}{}", padding, s)
    } else {
        format!("{}{}", s, padding)
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// NUMBERS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn number_method(name: &str) -> Option<Value> {
    let method: Method = match name {
        "toFixed" => |_, this, args| {
            let n = this.to_number();
            let digits = arg(&args, 0).to_number();
            let digits = if digits.is_nan() { 0.0 } else { digits };
            if !(0.0..=100.0).contains(&digits) {
                return Err(RuntimeError::type_error("toFixed() digits argument must be between 0 and 100"));
            }
            if !n.is_finite() {
                return Ok(Value::String(number_to_string(n)));
            }
            Ok(Value::String(format!("{:.*}", digits as usize, n)))
        },
        "toString" => |_, this, args| {
            let n = this.to_number();
            let radix = match arg(&args, 0) {
                Value::Undefined => 10,
                other => other.to_number() as u32,
            };
            if !(2..=36).contains(&radix) {
                return Err(RuntimeError::type_error("toString() radix must be between 2 and 36"));
            }
            if radix == 10 || n.fract() != 0.0 || !n.is_finite() {
                return Ok(Value::String(number_to_string(n)));
            }
            Ok(Value::String(integer_to_radix(n as i64, radix)))
        },
        "valueOf" => |_, this, _| Ok(Value::Number(this.to_number())),
        _ => return None,
    };
    Some(Value::native(name, method))
}

fn integer_to_radix(n: i64, radix: u32) -> String {
    let mut magnitude = n.unsigned_abs();
    if magnitude == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while magnitude > 0 {
        let digit = (magnitude % radix as u64) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        magnitude /= radix as u64;
    }
    if n < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARRAYS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn array_method(name: &str) -> Option<Value> {
    let method: Method = match name {
        "push" => |_, this, args| {
            let items = this_array(&this, "push")?;
            let mut items = items.borrow_mut();
            items.extend(args);
            Ok(Value::Number(items.len() as f64))
        },
        "pop" => |_, this, _| Ok(this_array(&this, "pop")?.borrow_mut().pop().unwrap_or_default()),
        "shift" => |_, this, _| {
            let items = this_array(&this, "shift")?;
            let mut items = items.borrow_mut();
            Ok(if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            })
        },
        "unshift" => |_, this, args| {
            let items = this_array(&this, "unshift")?;
            let mut items = items.borrow_mut();
            items.splice(0..0, args);
            Ok(Value::Number(items.len() as f64))
        },
        "splice" => |_, this, args| {
            let items = this_array(&this, "splice")?;
            let mut items = items.borrow_mut();
            let len = items.len();
            let start = relative_index(&arg(&args, 0), len, 0);
            let delete = match args.get(1) {
                None => len - start,
                Some(count) => {
                    let count = count.to_number();
                    let count = if count.is_nan() { 0.0 } else { count.max(0.0) };
                    (count as usize).min(len - start)
                }
            };
            let inserted = args.into_iter().skip(2);
            let removed: Vec<Value> = items.splice(start..start + delete, inserted).collect();
            Ok(Value::array(removed))
        },
        "slice" => |_, this, args| {
            let items = this_array(&this, "slice")?;
            let items = items.borrow();
            let start = relative_index(&arg(&args, 0), items.len(), 0);
            let end = relative_index(&arg(&args, 1), items.len(), items.len());
            Ok(Value::array(if start < end {
                items[start..end].to_vec()
            } else {
                Vec::new()
            }))
        },
        "concat" => |_, this, args| {
            let mut out = this_array(&this, "concat")?.borrow().clone();
            for extra in args {
                match extra {
                    Value::Array(more) => out.extend(more.borrow().iter().cloned()),
                    other => out.push(other),
                }
            }
            Ok(Value::array(out))
        },
        "reverse" => |_, this, _| {
            this_array(&this, "reverse")?.borrow_mut().reverse();
            Ok(this)
        },
        "join" => |_, this, args| {
            let items = this_array(&this, "join")?;
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                other => other.to_js_string(),
            };
            Ok(Value::String(Value::join_array(&items, &separator)))
        },
        "includes" => |_, this, args| {
            let needle = arg(&args, 0);
            let found = this_array(&this, "includes")?
                .borrow()
                .iter()
                .any(|item| same_value_zero(item, &needle));
            Ok(Value::Bool(found))
        },
        "indexOf" => |_, this, args| {
            let needle = arg(&args, 0);
            let index = this_array(&this, "indexOf")?
                .borrow()
                .iter()
                .position(|item| item.strict_equals(&needle));
            Ok(Value::Number(index.map(|i| i as f64).unwrap_or(-1.0)))
        },
        "forEach" => |interp, this, args| {
            let func = callback(&args, "forEach")?;
            for (index, item) in snapshot(&this, "forEach")?.into_iter().enumerate() {
                interp.call(&func, Value::Undefined, vec![item, Value::Number(index as f64), this.clone()])?;
            }
            Ok(Value::Undefined)
        },
        "map" => |interp, this, args| {
            let func = callback(&args, "map")?;
            let mut out = Vec::new();
            for (index, item) in snapshot(&this, "map")?.into_iter().enumerate() {
                out.push(interp.call(&func, Value::Undefined, vec![item, Value::Number(index as f64), this.clone()])?);
            }
            Ok(Value::array(out))
        },
        "filter" => |interp, this, args| {
            let func = callback(&args, "filter")?;
            let mut out = Vec::new();
            for (index, item) in snapshot(&this, "filter")?.into_iter().enumerate() {
                let keep = interp.call(&func, Value::Undefined, vec![item.clone(), Value::Number(index as f64), this.clone()])?;
                if keep.is_truthy() {
                    out.push(item);
                }
            }
            Ok(Value::array(out))
        },
        "find" => |interp, this, args| {
            let func = callback(&args, "find")?;
            for (index, item) in snapshot(&this, "find")?.into_iter().enumerate() {
                let hit = interp.call(&func, Value::Undefined, vec![item.clone(), Value::Number(index as f64), this.clone()])?;
                if hit.is_truthy() {
                    return Ok(item);
                }
            }
            Ok(Value::Undefined)
        },
        "findIndex" => |interp, this, args| {
            let func = callback(&args, "findIndex")?;
            for (index, item) in snapshot(&this, "findIndex")?.into_iter().enumerate() {
                let hit = interp.call(&func, Value::Undefined, vec![item, Value::Number(index as f64), this.clone()])?;
                if hit.is_truthy() {
                    return Ok(Value::Number(index as f64));
                }
            }
            Ok(Value::Number(-1.0))
        },
        "some" => |interp, this, args| {
            let func = callback(&args, "some")?;
            for (index, item) in snapshot(&this, "some")?.into_iter().enumerate() {
                if interp.call(&func, Value::Undefined, vec![item, Value::Number(index as f64), this.clone()])?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        },
        "every" => |interp, this, args| {
            let func = callback(&args, "every")?;
            for (index, item) in snapshot(&this, "every")?.into_iter().enumerate() {
                if !interp.call(&func, Value::Undefined, vec![item, Value::Number(index as f64), this.clone()])?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        },
        "reduce" => |interp, this, args| {
            let func = callback(&args, "reduce")?;
            let mut items = snapshot(&this, "reduce")?.into_iter().enumerate();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match items.next() {
                    Some((_, first)) => first,
                    None => {
                        return Err(RuntimeError::type_error(
                            "Reduce of empty array with no initial value",
                        ));
                    }
                },
            };
            for (index, item) in items {
                acc = interp.call(&func, Value::Undefined, vec![acc, item, Value::Number(index as f64), this.clone()])?;
            }
            Ok(acc)
        },
        "sort" => |interp, this, args| {
            let items = this_array(&this, "sort")?;
            let comparator = args.first().filter(|c| c.is_function()).cloned();
            let unsorted = items.borrow().clone();
            // insertion sort: user comparators need not be consistent
            let mut sorted: Vec<Value> = Vec::with_capacity(unsorted.len());
            for item in unsorted {
                let mut position = sorted.len();
                while position > 0 {
                    let order = match &comparator {
                        Some(func) => {
                            let n = interp
                                .call(func, Value::Undefined, vec![sorted[position - 1].clone(), item.clone()])?
                                .to_number();
                            n.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
                        }
                        None => sorted[position - 1].to_js_string().cmp(&item.to_js_string()),
                    };
                    if order != Ordering::Greater {
                        break;
                    }
                    position -= 1;
                }
                sorted.insert(position, item);
            }
            *items.borrow_mut() = sorted;
            Ok(this)
        },
        _ => return None,
    };
    Some(Value::native(name, method))
}

fn snapshot(this: &Value, method: &str) -> EvalResult<Vec<Value>> {
    Ok(this_array(this, method)?.borrow().clone())
}

// ═══════════════════════════════════════════════════════════════════════════════
// OBJECTS AND FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn object_method(name: &str) -> Option<Value> {
    let method: Method = match name {
        "hasOwnProperty" => |_, this, args| {
            let key = property_key(&arg(&args, 0));
            Ok(Value::Bool(match &this {
                Value::Object(obj) => obj.has_own(&key),
                _ => false,
            }))
        },
        _ => return None,
    };
    Some(Value::native(name, method))
}

pub fn function_method(name: &str) -> Option<Value> {
    let method: Method = match name {
        "call" => |interp, this, args| {
            let mut args = args.into_iter();
            let receiver = args.next().unwrap_or_default();
            interp.call(&this, receiver, args.collect())
        },
        "apply" => |interp, this, args| {
            let receiver = arg(&args, 0);
            let list = match arg(&args, 1) {
                Value::Array(items) => items.borrow().clone(),
                Value::Undefined | Value::Null => Vec::new(),
                _ => return Err(RuntimeError::type_error("CreateListFromArrayLike called on non-object")),
            };
            interp.call(&this, receiver, list)
        },
        "bind" => |_, this, args| match this {
            Value::Function(target) => Ok(Value::Function(Rc::new(Function::Bound {
                target,
                this: arg(&args, 0),
            }))),
            other => Err(RuntimeError::type_error(format!(
                "Bind must be called on a function, got {}",
                other.type_of()
            ))),
        },
        _ => return None,
    };
    Some(Value::native(name, method))
}

#[cfg(test)]
mod tests {
    use crate::interpreter::{Interpreter, Limits, Scope};
    use crate::lower::parse_program;
    use crate::value::Value;

    fn run(source: &str) -> Value {
        let body = parse_program(source).unwrap();
        Interpreter::new(Limits::default())
            .run_program(&body, &Scope::root())
            .unwrap()
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(run("return ' Node '.trim().toUpperCase();").to_js_string(), "NODE");
        assert_eq!(run("return 'a,b,c'.split(',').length;").to_number(), 3.0);
        assert_eq!(run("return 'hello'.slice(-3);").to_js_string(), "llo");
        assert_eq!(run("return 'a-b-c'.replace('-', '+');").to_js_string(), "a+b-c");
        assert_eq!(run("return 'a-b-c'.replaceAll('-', '+');").to_js_string(), "a+b+c");
        assert_eq!(run("return '7'.padStart(3, '0');").to_js_string(), "007");
    }

    #[test]
    fn test_number_methods() {
        assert_eq!(run("return (3.14159).toFixed(2);").to_js_string(), "3.14");
        assert_eq!(run("return (255).toString(16);").to_js_string(), "ff");
    }

    #[test]
    fn test_array_callbacks() {
        let source = r#"
            const xs = [3, 1, 2];
            const doubled = xs.map(x => x * 2).filter(x => x > 2);
            const total = xs.reduce((acc, x) => acc + x, 0);
            xs.sort((a, b) => a - b);
            return [doubled.join('+'), total, xs.join(''), xs.includes(2), xs.indexOf(9)].join(' ');
        "#;
        assert_eq!(run(source).to_js_string(), "6+4 6 123 true -1");
    }

    #[test]
    fn test_splice_and_mutation() {
        let source = r#"
            const xs = ['a', 'b', 'c', 'd'];
            const removed = xs.splice(1, 2, 'x');
            xs.push('e');
            xs.unshift('z');
            return removed.join('') + ':' + xs.join('');
        "#;
        assert_eq!(run(source).to_js_string(), "bc:zaxde");
    }

    #[test]
    fn test_function_bind_and_call() {
        let source = r#"
            function label() { return this.name; }
            const bound = label.bind({ name: 'bound' });
            return bound() + '/' + label.call({ name: 'called' });
        "#;
        assert_eq!(run(source).to_js_string(), "bound/called");
    }
}
