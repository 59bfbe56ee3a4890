//! Runtime values inside the sandbox.
//!
//! Arrays and objects have reference semantics (as contract authors expect
//! from JavaScript) but every value is built fresh from JSON for each call,
//! so nothing here can alias host-owned state.
//!
//! Shared references let a few steps build a graph whose expansion is
//! exponential, so every walk that renders a value reports each node to a
//! [`Meter`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Number, Value as Json};

use super::ast::FunctionDecl;
use super::builtins::Native;
use super::SandboxError;

/// Nesting limit when converting to JSON or text; also catches cycles
pub const MAX_VALUE_DEPTH: usize = 64;

/// Largest integer an f64 represents exactly (2^53)
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Approximate heap cost of one runtime value slot
pub const VALUE_BYTES: usize = std::mem::size_of::<Value>();

const JSON_NODE_BYTES: usize = std::mem::size_of::<Json>();

/// Accounting hook for walks over a value graph
pub trait Meter {
    /// Record one visited node producing about `bytes` of output
    fn visit(&mut self, bytes: usize) -> Result<(), SandboxError>;

    /// Longest text a walk may build
    fn max_text(&self) -> usize;
}

pub struct ArrayData {
    pub items: RefCell<Vec<Value>>,
    pub frozen: bool,
}

pub struct ObjectData {
    pub props: RefCell<BTreeMap<String, Value>>,
    pub frozen: bool,
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<ArrayData>),
    Object(Rc<ObjectData>),
    Function(Rc<FunctionDecl>),
    Native(Native),
}

impl fmt::Debug for Value {
    // Shallow on purpose: containers may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&number_to_string(*n)),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Array(a) => write!(f, "[array; {}]", a.items.borrow().len()),
            Self::Object(o) => write!(f, "{{object; {}}}", o.props.borrow().len()),
            Self::Function(decl) => write!(f, "function {}", decl.name),
            Self::Native(n) => write!(f, "native {}", n.name()),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    // Untracked; contract-visible containers go through the interpreter
    #[cfg(test)]
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(ArrayData {
            items: RefCell::new(items),
            frozen: false,
        }))
    }

    #[cfg(test)]
    pub fn object(props: BTreeMap<String, Value>) -> Self {
        Self::Object(Rc::new(ObjectData {
            props: RefCell::new(props),
            frozen: false,
        }))
    }

    pub fn frozen_object(props: BTreeMap<String, Value>) -> Self {
        Self::Object(Rc::new(ObjectData {
            props: RefCell::new(props),
            frozen: true,
        }))
    }

    /// Result of the `typeof` operator
    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null | Self::Array(_) | Self::Object(_) => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Function(_) | Self::Native(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::Str(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// String conversion as `String(x)` performs it
    pub fn display(&self, meter: &mut impl Meter) -> Result<String, SandboxError> {
        let mut out = String::new();
        self.write_display(&mut out, meter)?;
        Ok(out)
    }

    /// Append the `String(x)` form to `out`
    pub fn write_display(
        &self,
        out: &mut String,
        meter: &mut impl Meter,
    ) -> Result<(), SandboxError> {
        self.display_at(out, meter, 0)?;
        if out.len() > meter.max_text() {
            return Err(text_too_long(meter.max_text()));
        }
        Ok(())
    }

    fn display_at(
        &self,
        out: &mut String,
        meter: &mut impl Meter,
        depth: usize,
    ) -> Result<(), SandboxError> {
        let Self::Array(a) = self else {
            let text = self.leaf_text();
            meter.visit(text.len())?;
            out.push_str(&text);
            return Ok(());
        };
        let items = a.items.borrow();
        meter.visit(items.len())?;
        if depth >= MAX_VALUE_DEPTH {
            return Ok(());
        }
        for (i, v) in items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if !v.is_nullish() {
                v.display_at(out, meter, depth + 1)?;
            }
            if out.len() > meter.max_text() {
                return Err(text_too_long(meter.max_text()));
            }
        }
        Ok(())
    }

    /// Text of a non-array value; arrays render through [`Value::display`]
    fn leaf_text(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => number_to_string(*n),
            Self::Str(s) => s.to_string(),
            Self::Array(_) => String::new(),
            Self::Object(_) => "[object Object]".to_string(),
            Self::Function(decl) => format!("function {}() {{ [code] }}", decl.name),
            Self::Native(n) => format!("function {}() {{ [native code] }}", n.name()),
        }
    }

    /// The `===` operator
    pub fn strict_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            #[allow(clippy::float_cmp)]
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => a == b,
            _ => false,
        }
    }

    /// The `==` operator: `null == undefined`, and primitives compare
    /// numerically when their types differ
    pub fn loose_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
            (Self::Number(_) | Self::Str(_) | Self::Bool(_), Self::Number(_) | Self::Str(_) | Self::Bool(_))
                if std::mem::discriminant(self) != std::mem::discriminant(other) =>
            {
                #[allow(clippy::float_cmp)]
                let eq = self.to_number() == other.to_number();
                eq
            }
            _ => self.strict_equals(other),
        }
    }

    /// Build a sandbox value from JSON. `frozen` marks every container
    /// read-only.
    pub fn from_json(json: &Json, frozen: bool) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::str(s.as_str()),
            Json::Array(items) => Self::Array(Rc::new(ArrayData {
                items: RefCell::new(items.iter().map(|v| Self::from_json(v, frozen)).collect()),
                frozen,
            })),
            Json::Object(map) => Self::Object(Rc::new(ObjectData {
                props: RefCell::new(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v, frozen)))
                        .collect(),
                ),
                frozen,
            })),
        }
    }

    /// Convert to JSON following `JSON.stringify` rules: `undefined`
    /// properties are dropped, non-finite numbers become `null`.
    ///
    /// # Errors
    /// Fails on functions, on nesting deeper than [`MAX_VALUE_DEPTH`], and
    /// on whatever quota `meter` enforces.
    pub fn to_json(&self, meter: &mut impl Meter) -> Result<Json, SandboxError> {
        self.to_json_at(meter, 0)
    }

    fn to_json_at(&self, meter: &mut impl Meter, depth: usize) -> Result<Json, SandboxError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(SandboxError::Execution(
                "value is nested too deeply or contains a cycle".to_string(),
            ));
        }
        let text = match self {
            Self::Str(s) => s.len(),
            _ => 0,
        };
        meter.visit(JSON_NODE_BYTES + text)?;
        Ok(match self {
            Self::Undefined | Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::Str(s) => Json::String(s.to_string()),
            Self::Array(a) => Json::Array(
                a.items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_at(meter, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Object(o) => {
                let mut map = Map::new();
                for (k, v) in o.props.borrow().iter() {
                    if matches!(v, Self::Undefined) {
                        continue;
                    }
                    map.insert(k.clone(), v.to_json_at(meter, depth + 1)?);
                }
                Json::Object(map)
            }
            Self::Function(_) | Self::Native(_) => {
                return Err(SandboxError::Execution(
                    "functions cannot be serialized".to_string(),
                ))
            }
        })
    }
}

fn text_too_long(max: usize) -> SandboxError {
    SandboxError::MemoryLimit(format!("string exceeds the limit of {max} bytes"))
}

/// Number formatting matching what contract authors see in JavaScript
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{n}")
    }
}

fn number_to_json(n: f64) -> Json {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        // -0 canonicalizes to 0
        Json::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Json::Null, Json::Number)
    }
}
