//! Host functions and methods visible to contract code.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value as Json;

use super::capabilities::{Digest, SandboxModule};
use super::interpreter::{Exec, Interpreter};
use super::value::{number_to_string, ArrayData, Value, VALUE_BYTES};
use super::SandboxError;

/// A host function callable from contract code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Native {
    Require,
    Error,
    String,
    Number,
    Boolean,
    JsonStringify,
    JsonParse,
    Math(MathFn),
    ObjectKeys,
    ObjectValues,
    ObjectEntries,
    ArrayIsArray,
    Digest(Digest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Floor,
    Ceil,
    Round,
    Abs,
    Min,
    Max,
    Pow,
    Sqrt,
}

impl MathFn {
    const ALL: [Self; 8] = [
        Self::Floor,
        Self::Ceil,
        Self::Round,
        Self::Abs,
        Self::Min,
        Self::Max,
        Self::Pow,
        Self::Sqrt,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Pow => "pow",
            Self::Sqrt => "sqrt",
        }
    }

    fn apply(self, args: &[Value]) -> f64 {
        let arg = |i: usize| args.get(i).map_or(f64::NAN, Value::to_number);
        match self {
            Self::Floor => arg(0).floor(),
            Self::Ceil => arg(0).ceil(),
            Self::Round => (arg(0) + 0.5).floor(),
            Self::Abs => arg(0).abs(),
            Self::Pow => arg(0).powf(arg(1)),
            Self::Sqrt => arg(0).sqrt(),
            Self::Min => args.iter().map(Value::to_number).fold(f64::INFINITY, |a, b| {
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.min(b)
                }
            }),
            Self::Max => args
                .iter()
                .map(Value::to_number)
                .fold(f64::NEG_INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() {
                        f64::NAN
                    } else {
                        a.max(b)
                    }
                }),
        }
    }
}

impl Native {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Require => "require",
            Self::Error => "Error",
            Self::String => "String",
            Self::Number => "Number",
            Self::Boolean => "Boolean",
            Self::JsonStringify => "stringify",
            Self::JsonParse => "parse",
            Self::Math(f) => f.name(),
            Self::ObjectKeys => "keys",
            Self::ObjectValues => "values",
            Self::ObjectEntries => "entries",
            Self::ArrayIsArray => "isArray",
            Self::Digest(d) => d.name(),
        }
    }
}

fn namespace(entries: impl IntoIterator<Item = Native>) -> Value {
    Value::frozen_object(
        entries
            .into_iter()
            .map(|n| (n.name().to_string(), Value::Native(n)))
            .collect(),
    )
}

/// Global names every program can see
pub fn globals() -> HashMap<String, Value> {
    let mut g = HashMap::new();
    for n in [
        Native::Require,
        Native::Error,
        Native::String,
        Native::Number,
        Native::Boolean,
    ] {
        g.insert(n.name().to_string(), Value::Native(n));
    }
    g.insert(
        "JSON".to_string(),
        namespace([Native::JsonStringify, Native::JsonParse]),
    );
    g.insert(
        "Math".to_string(),
        namespace(MathFn::ALL.into_iter().map(Native::Math)),
    );
    g.insert(
        "Object".to_string(),
        namespace([Native::ObjectKeys, Native::ObjectValues, Native::ObjectEntries]),
    );
    g.insert("Array".to_string(), namespace([Native::ArrayIsArray]));
    g
}

/// The object handed out by `require` for an allowed module
pub fn module_value(module: SandboxModule) -> Value {
    namespace(module.exports().iter().copied().map(Native::Digest))
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

/// Resolve a relative index the way `slice` does
fn slice_bound(v: Option<&Value>, len: usize, default: usize) -> usize {
    match v {
        None | Some(Value::Undefined) => default,
        Some(v) => {
            let n = v.to_number();
            if n.is_nan() {
                0
            } else if n < 0.0 {
                len.saturating_sub((-n).trunc() as usize)
            } else {
                (n.trunc() as usize).min(len)
            }
        }
    }
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => a.strict_equals(b),
    }
}

impl Interpreter {
    pub(super) fn call_native(&mut self, native: Native, args: Vec<Value>) -> Exec<Value> {
        match native {
            Native::Require => {
                let name = match args.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    Some(other) => return Err(SandboxError::ModuleNotAllowed(self.display(other)?)),
                    None => return Err(SandboxError::ModuleNotAllowed("undefined".to_string())),
                };
                let module = self.modules.resolve(&name)?;
                Ok(module_value(module))
            }
            Native::Error => {
                let message = match args.first() {
                    None | Some(Value::Undefined) => String::new(),
                    Some(v) => self.display(v)?,
                };
                let mut props = BTreeMap::new();
                props.insert("name".to_string(), Value::str("Error"));
                props.insert("message".to_string(), self.new_string(message)?);
                self.new_object(props)
            }
            Native::String => match args.first() {
                None => Ok(Value::str("")),
                Some(v) => {
                    let text = self.display(v)?;
                    self.new_string(text)
                }
            },
            Native::Number => Ok(Value::Number(args.first().map_or(0.0, Value::to_number))),
            Native::Boolean => Ok(Value::Bool(args.first().is_some_and(Value::truthy))),
            Native::JsonStringify => {
                let v = arg(&args, 0);
                if matches!(v, Value::Undefined) {
                    return Ok(Value::Undefined);
                }
                let json = v.to_json(self).map_err(|e| e.context("JSON.stringify"))?;
                let text = serde_json::to_string(&json)
                    .map_err(|e| SandboxError::Execution(format!("JSON.stringify: {e}")))?;
                self.charge(text.len() as u64)?;
                self.new_string(text)
            }
            Native::JsonParse => {
                let text = self.display(&arg(&args, 0))?;
                self.charge(text.len() as u64)?;
                let json: Json = serde_json::from_str(&text)
                    .map_err(|e| SandboxError::Execution(format!("JSON.parse: {e}")))?;
                self.import_json(&json)
            }
            Native::Math(f) => Ok(Value::Number(f.apply(&args))),
            Native::ObjectKeys | Native::ObjectValues | Native::ObjectEntries => {
                let entries: Vec<(String, Value)> = match args.first() {
                    Some(Value::Object(o)) => o
                        .props
                        .borrow()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    Some(Value::Array(a)) => a
                        .items
                        .borrow()
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i.to_string(), v.clone()))
                        .collect(),
                    _ => Vec::new(),
                };
                self.charge(entries.len() as u64)?;
                let items = entries
                    .into_iter()
                    .map(|(k, v)| match native {
                        Native::ObjectKeys => Ok(Value::str(k)),
                        Native::ObjectValues => Ok(v),
                        _ => self.new_array(vec![Value::str(k), v]),
                    })
                    .collect::<Exec<Vec<_>>>()?;
                self.new_array(items)
            }
            Native::ArrayIsArray => Ok(Value::Bool(matches!(args.first(), Some(Value::Array(_))))),
            Native::Digest(d) => {
                let input = self.display(&arg(&args, 0))?;
                self.charge(input.len() as u64 / 64)?;
                Ok(Value::str(d.hex(input.as_bytes())))
            }
        }
    }

    pub(super) fn array_method(
        &mut self,
        receiver: &Value,
        a: &Rc<ArrayData>,
        name: &str,
        args: Vec<Value>,
    ) -> Exec<Value> {
        let mutates = matches!(name, "push" | "pop" | "reverse");
        if mutates && a.frozen {
            return Err(SandboxError::Execution(format!(
                "cannot call {name} on a read-only array"
            )));
        }
        let len = a.items.borrow().len();
        match name {
            "push" => {
                self.check_len(len + args.len())?;
                self.allocate(args.len() * VALUE_BYTES)?;
                let mut items = a.items.borrow_mut();
                items.extend(args);
                Ok(Value::Number(items.len() as f64))
            }
            "pop" => Ok(a.items.borrow_mut().pop().unwrap_or(Value::Undefined)),
            "includes" => {
                self.charge(len as u64)?;
                let needle = arg(&args, 0);
                Ok(Value::Bool(
                    a.items.borrow().iter().any(|v| same_value_zero(v, &needle)),
                ))
            }
            "indexOf" => {
                self.charge(len as u64)?;
                let needle = arg(&args, 0);
                let pos = a.items.borrow().iter().position(|v| v.strict_equals(&needle));
                Ok(Value::Number(pos.map_or(-1.0, |p| p as f64)))
            }
            "join" => {
                self.charge(len as u64)?;
                let sep = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(v) => self.display(v)?,
                };
                let items = a.items.borrow().clone();
                let mut joined = String::new();
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        joined.push_str(&sep);
                    }
                    if !v.is_nullish() {
                        v.write_display(&mut joined, self)?;
                    }
                    // new_string reports the overflow
                    if joined.len() > self.limits.max_string_len {
                        break;
                    }
                }
                self.new_string(joined)
            }
            "slice" => {
                let start = slice_bound(args.first(), len, 0);
                let end = slice_bound(args.get(1), len, len);
                let items = if start < end {
                    a.items.borrow()[start..end].to_vec()
                } else {
                    Vec::new()
                };
                self.charge(items.len() as u64)?;
                self.new_array(items)
            }
            "concat" => {
                let mut items = a.items.borrow().clone();
                for v in args {
                    if let Value::Array(other) = &v {
                        items.extend(other.items.borrow().iter().cloned());
                    } else {
                        items.push(v);
                    }
                    self.check_len(items.len())?;
                }
                self.charge(items.len() as u64)?;
                self.new_array(items)
            }
            "reverse" => {
                a.items.borrow_mut().reverse();
                Ok(receiver.clone())
            }
            _ => Err(SandboxError::Execution(format!("array.{name} is not a function"))),
        }
    }

    pub(super) fn string_method(&mut self, s: &str, name: &str, args: Vec<Value>) -> Exec<Value> {
        self.charge(s.len() as u64 / 64)?;
        let text_arg = match name {
            "includes" | "startsWith" | "endsWith" | "indexOf" => match args.first() {
                None => "undefined".to_string(),
                Some(v) => self.display(v)?,
            },
            _ => String::new(),
        };
        match name {
            "toUpperCase" => self.new_string(s.to_uppercase()),
            "toLowerCase" => self.new_string(s.to_lowercase()),
            "trim" => Ok(Value::str(s.trim())),
            "includes" => Ok(Value::Bool(s.contains(text_arg.as_str()))),
            "startsWith" => Ok(Value::Bool(s.starts_with(text_arg.as_str()))),
            "endsWith" => Ok(Value::Bool(s.ends_with(text_arg.as_str()))),
            "indexOf" => {
                let pos = s
                    .find(text_arg.as_str())
                    .map_or(-1.0, |byte| s[..byte].chars().count() as f64);
                Ok(Value::Number(pos))
            }
            "slice" => {
                let chars: Vec<char> = s.chars().collect();
                let start = slice_bound(args.first(), chars.len(), 0);
                let end = slice_bound(args.get(1), chars.len(), chars.len());
                let out: String = if start < end {
                    chars[start..end].iter().collect()
                } else {
                    String::new()
                };
                Ok(Value::str(out))
            }
            "split" => {
                // one past the cap is enough for new_array to reject it
                let cap = self.limits.max_collection_len.saturating_add(1);
                let parts: Vec<Value> = match args.first() {
                    None | Some(Value::Undefined) => vec![Value::str(s)],
                    Some(sep) => {
                        let sep = self.display(sep)?;
                        if sep.is_empty() {
                            s.chars().take(cap).map(|c| Value::str(c.to_string())).collect()
                        } else {
                            s.split(sep.as_str()).take(cap).map(Value::str).collect()
                        }
                    }
                };
                self.new_array(parts)
            }
            _ => Err(SandboxError::Execution(format!("string.{name} is not a function"))),
        }
    }
}

impl Interpreter {
    /// Render a thrown value for the error report
    pub(super) fn thrown_message(&mut self, v: &Value) -> Exec<String> {
        let message = match v {
            Value::Object(o) => o.props.borrow().get("message").cloned(),
            _ => None,
        };
        match (message, v) {
            (Some(m), _) => self.display(&m),
            (None, Value::Number(n)) => Ok(number_to_string(*n)),
            (None, other) => self.display(other),
        }
    }
}
