//! Tree-walking evaluator for parsed ClawScript.
//!
//! Every statement and expression costs one step; host functions charge
//! extra in proportion to the data they touch. The wall clock is consulted
//! every [`CLOCK_CHECK_INTERVAL`] steps.
//!
//! Every array and object created during a call is tracked, and all of them
//! are emptied when the interpreter is dropped. Contract code can build
//! reference cycles, which would otherwise never be freed.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Instant;

use serde_json::Value as Json;

use super::ast::{
    AssignOp, BinaryOp, DeclKind, Expr, FunctionDecl, Literal, LogicalOp, Program, Stmt, UnaryOp,
};
use super::builtins;
use super::capabilities::ModuleAllowlist;
use super::limits::{SandboxLimits, CLOCK_CHECK_INTERVAL};
use super::value::{number_to_string, ArrayData, Meter, ObjectData, Value, VALUE_BYTES};
use super::SandboxError;

pub(super) type Exec<T> = Result<T, SandboxError>;

struct Binding {
    value: Value,
    mutable: bool,
}

type Scope = HashMap<String, Binding>;

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Resolved assignment target; the object and key are evaluated once
enum Place {
    Var(String),
    Key(Value, Value),
}

fn type_error(message: impl AsRef<str>) -> SandboxError {
    SandboxError::Execution(format!("TypeError: {}", message.as_ref()))
}

fn reference_error(name: &str) -> SandboxError {
    SandboxError::Execution(format!("ReferenceError: {name} is not defined"))
}

fn nullish_name(v: &Value) -> &'static str {
    if matches!(v, Value::Null) {
        "null"
    } else {
        "undefined"
    }
}

/// Array slot addressed by a key, if the key is a canonical index
fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < 4_294_967_295.0 => {
            Some(*n as usize)
        }
        Value::Str(s) => s.parse::<usize>().ok().filter(|i| i.to_string() == **s),
        _ => None,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> bool {
    let ord = match (l, r) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => l.to_number().partial_cmp(&r.to_number()),
    };
    ord.is_some_and(|o| match op {
        BinaryOp::Lt => o.is_lt(),
        BinaryOp::LtEq => o.is_le(),
        BinaryOp::Gt => o.is_gt(),
        _ => o.is_ge(),
    })
}

fn callee_name(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        _ => "expression".to_string(),
    }
}

/// Evaluation context for one sandboxed call
pub struct Interpreter {
    pub(super) limits: SandboxLimits,
    pub(super) modules: ModuleAllowlist,
    builtins: HashMap<String, Value>,
    /// One frame per active function call; frame 0 is the top level and
    /// its first scope holds the globals
    frames: Vec<Vec<Scope>>,
    steps: u64,
    depth: usize,
    deadline: Option<Instant>,
    allocated: usize,
    arrays: Vec<Weak<ArrayData>>,
    objects: Vec<Weak<ObjectData>>,
}

impl Interpreter {
    pub fn new(limits: SandboxLimits, modules: ModuleAllowlist) -> Self {
        Self {
            limits,
            modules,
            builtins: builtins::globals(),
            frames: vec![vec![Scope::new()]],
            steps: 0,
            depth: 0,
            deadline: Instant::now().checked_add(limits.timeout),
            allocated: 0,
            arrays: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Steps consumed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Inject a read-only global binding
    pub fn bind_const(&mut self, name: &str, value: Value) {
        self.frames[0][0].insert(
            name.to_string(),
            Binding {
                value,
                mutable: false,
            },
        );
    }

    /// Hoist the program's functions and run its top-level statements
    pub fn run_program(&mut self, program: &Program) -> Exec<()> {
        for decl in program.functions() {
            if self.frames[0][0].contains_key(&decl.name) {
                return Err(SandboxError::Execution(format!(
                    "SyntaxError: identifier '{}' has already been declared",
                    decl.name
                )));
            }
            self.frames[0][0].insert(
                decl.name.clone(),
                Binding {
                    value: Value::Function(Rc::clone(decl)),
                    mutable: true,
                },
            );
        }
        match self.exec_stmts(&program.body)? {
            Flow::Normal => Ok(()),
            _ => Err(SandboxError::Execution(
                "illegal control flow at top level".to_string(),
            )),
        }
    }

    /// Call a top-level function by name
    pub fn invoke(&mut self, name: &str, args: Vec<Value>) -> Exec<Value> {
        match self.frames[0][0].get(name).map(|b| b.value.clone()) {
            Some(Value::Function(decl)) => self.call_function(&decl, args),
            _ => Err(SandboxError::MethodNotFound(name.to_string())),
        }
    }

    // ----- accounting -----

    pub(super) fn charge(&mut self, cost: u64) -> Exec<()> {
        let before = self.steps;
        self.steps = self.steps.saturating_add(cost);
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::StepLimit(self.limits.max_steps));
        }
        if before / CLOCK_CHECK_INTERVAL != self.steps / CLOCK_CHECK_INTERVAL
            && self.deadline.is_some_and(|d| Instant::now() >= d)
        {
            return Err(SandboxError::Timeout(self.limits.timeout));
        }
        Ok(())
    }

    fn tick(&mut self) -> Exec<()> {
        self.charge(1)
    }

    pub(super) fn check_len(&self, len: usize) -> Exec<()> {
        if len > self.limits.max_collection_len {
            return Err(SandboxError::MemoryLimit(format!(
                "collection of {len} elements exceeds the limit of {}",
                self.limits.max_collection_len
            )));
        }
        Ok(())
    }

    /// Count `bytes` against the per-call allocation quota
    pub(super) fn allocate(&mut self, bytes: usize) -> Exec<()> {
        self.allocated = self.allocated.saturating_add(bytes);
        if self.allocated > self.limits.max_memory {
            return Err(SandboxError::MemoryLimit(format!(
                "call allocated more than {} bytes",
                self.limits.max_memory
            )));
        }
        Ok(())
    }

    pub(super) fn new_string(&mut self, s: String) -> Exec<Value> {
        if s.len() > self.limits.max_string_len {
            return Err(SandboxError::MemoryLimit(format!(
                "string of {} bytes exceeds the limit of {}",
                s.len(),
                self.limits.max_string_len
            )));
        }
        self.allocate(s.len())?;
        self.charge(s.len() as u64 / 64)?;
        Ok(Value::str(s))
    }

    pub(super) fn new_array(&mut self, items: Vec<Value>) -> Exec<Value> {
        self.check_len(items.len())?;
        self.allocate((items.len() + 1) * VALUE_BYTES)?;
        let array = Rc::new(ArrayData {
            items: RefCell::new(items),
            frozen: false,
        });
        self.arrays.push(Rc::downgrade(&array));
        Ok(Value::Array(array))
    }

    pub(super) fn new_object(&mut self, props: BTreeMap<String, Value>) -> Exec<Value> {
        self.check_len(props.len())?;
        let keys: usize = props.keys().map(String::len).sum();
        self.allocate((props.len() + 1) * VALUE_BYTES + keys)?;
        let object = Rc::new(ObjectData {
            props: RefCell::new(props),
            frozen: false,
        });
        self.objects.push(Rc::downgrade(&object));
        Ok(Value::Object(object))
    }

    /// Track the mutable containers of a value built by the host
    pub fn adopt(&mut self, value: &Value) {
        match value {
            Value::Array(a) if !a.frozen => {
                self.arrays.push(Rc::downgrade(a));
                for v in a.items.borrow().iter() {
                    self.adopt(v);
                }
            }
            Value::Object(o) if !o.frozen => {
                self.objects.push(Rc::downgrade(o));
                for v in o.props.borrow().values() {
                    self.adopt(v);
                }
            }
            _ => {}
        }
    }

    /// Build a value from parsed JSON under the collection and
    /// allocation quotas
    pub(super) fn import_json(&mut self, json: &Json) -> Exec<Value> {
        match json {
            Json::Array(items) => {
                self.check_len(items.len())?;
                self.tick()?;
                let values = items
                    .iter()
                    .map(|v| self.import_json(v))
                    .collect::<Exec<Vec<_>>>()?;
                self.new_array(values)
            }
            Json::Object(map) => {
                self.check_len(map.len())?;
                self.tick()?;
                let mut props = BTreeMap::new();
                for (k, v) in map {
                    props.insert(k.clone(), self.import_json(v)?);
                }
                self.new_object(props)
            }
            Json::String(s) => {
                self.visit(VALUE_BYTES + s.len())?;
                Ok(Value::str(s.as_str()))
            }
            scalar => {
                self.visit(VALUE_BYTES)?;
                Ok(Value::from_json(scalar, false))
            }
        }
    }

    /// `String(v)` under the string and allocation quotas
    pub(super) fn display(&mut self, v: &Value) -> Exec<String> {
        v.display(self)
    }

    /// Property name for a key value
    fn property_key(&mut self, key: &Value) -> Exec<String> {
        Ok(match key {
            Value::Str(s) => s.to_string(),
            Value::Number(n) => number_to_string(*n),
            other => self.display(other)?,
        })
    }

    // ----- scopes -----

    fn lookup(&self, name: &str) -> Option<Value> {
        let frame = self.frames.last()?;
        frame
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| {
                if self.frames.len() > 1 {
                    self.frames[0][0].get(name)
                } else {
                    None
                }
            })
            .map(|b| b.value.clone())
            .or_else(|| self.builtins.get(name).cloned())
    }

    fn binding_mut(&mut self, name: &str) -> Option<&mut Binding> {
        let top = self.frames.len() - 1;
        match self.frames[top].iter().rposition(|s| s.contains_key(name)) {
            Some(i) => self.frames[top][i].get_mut(name),
            None if top > 0 => self.frames[0][0].get_mut(name),
            None => None,
        }
    }

    fn declare(&mut self, kind: DeclKind, name: &str, value: Value) -> Exec<()> {
        let scope = self
            .frames
            .last_mut()
            .and_then(|f| f.last_mut())
            .ok_or_else(|| SandboxError::Execution("no active scope".to_string()))?;
        if let Some(existing) = scope.get(name) {
            if kind != DeclKind::Var || !existing.mutable {
                return Err(SandboxError::Execution(format!(
                    "SyntaxError: identifier '{name}' has already been declared"
                )));
            }
        }
        scope.insert(
            name.to_string(),
            Binding {
                value,
                mutable: kind != DeclKind::Const,
            },
        );
        Ok(())
    }

    fn assign_var(&mut self, name: &str, value: Value) -> Exec<()> {
        let is_builtin = self.builtins.contains_key(name);
        match self.binding_mut(name) {
            Some(b) if !b.mutable => Err(type_error(format!(
                "assignment to constant variable '{name}'"
            ))),
            Some(b) => {
                b.value = value;
                Ok(())
            }
            None if is_builtin => Err(type_error(format!("cannot assign to built-in '{name}'"))),
            None => Err(reference_error(name)),
        }
    }

    fn push_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(Scope::new());
        }
    }

    fn pop_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pop();
        }
    }

    // ----- statements -----

    fn exec_stmts(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        for stmt in stmts {
            let flow = self.exec(stmt)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        self.push_scope();
        let flow = self.exec_stmts(stmts);
        self.pop_scope();
        flow
    }

    fn exec(&mut self, stmt: &Stmt) -> Exec<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Decl { kind, decls } => {
                for (name, init) in decls {
                    let value = match init {
                        Some(expr) => self.eval(expr)?,
                        None => Value::Undefined,
                    };
                    self.declare(*kind, name, value)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.exec(then)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    match self.exec(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.push_scope();
                let flow = self.exec_for(init.as_deref(), cond.as_ref(), step.as_ref(), body);
                self.pop_scope();
                flow
            }
            Stmt::ForOf {
                kind,
                name,
                iterable,
                body,
            } => {
                let items: Vec<Value> = match self.eval(iterable)? {
                    Value::Array(a) => a.items.borrow().clone(),
                    Value::Str(s) => {
                        self.allocate(s.len() * VALUE_BYTES)?;
                        s.chars().map(|c| Value::str(c.to_string())).collect()
                    }
                    other => {
                        return Err(type_error(format!("{} is not iterable", other.type_of())))
                    }
                };
                for item in items {
                    self.push_scope();
                    let flow = match self.declare(*kind, name, item) {
                        Ok(()) => self.exec(body),
                        Err(e) => Err(e),
                    };
                    self.pop_scope();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => self.exec_block(stmts),
            Stmt::Return(expr) => Ok(Flow::Return(match expr {
                Some(expr) => self.eval(expr)?,
                None => Value::Undefined,
            })),
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let thrown = self.eval(expr)?;
                let message = self.thrown_message(&thrown)?;
                Err(SandboxError::Execution(format!(
                    "uncaught exception: {message}"
                )))
            }
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> Exec<Flow> {
        if let Some(init) = init {
            self.exec(init)?;
        }
        loop {
            if let Some(cond) = cond {
                if !self.eval(cond)?.truthy() {
                    break;
                }
            }
            match self.exec(body)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            if let Some(step) = step {
                self.eval(step)?;
            }
        }
        Ok(Flow::Normal)
    }

    // ----- expressions -----

    fn eval(&mut self, expr: &Expr) -> Exec<Value> {
        self.tick()?;
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Number(n) => Value::Number(*n),
                Literal::Str(s) => Value::Str(Rc::clone(s)),
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Null => Value::Null,
                Literal::Undefined => Value::Undefined,
            }),
            Expr::Ident(name) => self.lookup(name).ok_or_else(|| reference_error(name)),
            Expr::Array(items) => {
                self.check_len(items.len())?;
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Exec<Vec<_>>>()?;
                self.new_array(values)
            }
            Expr::Object(entries) => {
                self.check_len(entries.len())?;
                let mut props = BTreeMap::new();
                for (key, expr) in entries {
                    let value = self.eval(expr)?;
                    props.insert(key.clone(), value);
                }
                self.new_object(props)
            }
            Expr::Unary { op, expr } => {
                // typeof tolerates undeclared names
                if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, expr.as_ref()) {
                    let kind = self.lookup(name).map_or("undefined", |v| v.type_of());
                    return Ok(Value::str(kind));
                }
                let v = self.eval(expr)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => Value::Number(-v.to_number()),
                    UnaryOp::Plus => Value::Number(v.to_number()),
                    UnaryOp::TypeOf => Value::str(v.type_of()),
                })
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary(*op, &l, &r)
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOp::And => !l.truthy(),
                    LogicalOp::Or => l.truthy(),
                    LogicalOp::Nullish => !l.is_nullish(),
                };
                if short_circuit {
                    Ok(l)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.place(target)?;
                let v = match op {
                    AssignOp::Assign => self.eval(value)?,
                    AssignOp::Compound(bin) => {
                        let current = self.read(&place)?;
                        let rhs = self.eval(value)?;
                        self.binary(*bin, &current, &rhs)?
                    }
                };
                self.write(&place, v.clone())?;
                Ok(v)
            }
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.place(target)?;
                let old = self.read(&place)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write(&place, Value::Number(new))?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                self.get_index(&obj, &Value::str(property.as_str()))
            }
            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let key = self.eval(index)?;
                self.get_index(&obj, &key)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args),
        }
    }

    fn binary(&mut self, op: BinaryOp, l: &Value, r: &Value) -> Exec<Value> {
        let stringy = |v: &Value| matches!(v, Value::Str(_) | Value::Array(_) | Value::Object(_));
        Ok(match op {
            BinaryOp::Add if stringy(l) || stringy(r) => {
                let mut s = self.display(l)?;
                r.write_display(&mut s, self)?;
                return self.new_string(s);
            }
            BinaryOp::Add => Value::Number(l.to_number() + r.to_number()),
            BinaryOp::Sub => Value::Number(l.to_number() - r.to_number()),
            BinaryOp::Mul => Value::Number(l.to_number() * r.to_number()),
            BinaryOp::Div => Value::Number(l.to_number() / r.to_number()),
            BinaryOp::Rem => Value::Number(l.to_number() % r.to_number()),
            BinaryOp::Eq => Value::Bool(l.loose_equals(r)),
            BinaryOp::NotEq => Value::Bool(!l.loose_equals(r)),
            BinaryOp::StrictEq => Value::Bool(l.strict_equals(r)),
            BinaryOp::StrictNotEq => Value::Bool(!l.strict_equals(r)),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                Value::Bool(compare(op, l, r))
            }
        })
    }

    fn place(&mut self, target: &Expr) -> Exec<Place> {
        match target {
            Expr::Ident(name) => Ok(Place::Var(name.clone())),
            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                Ok(Place::Key(obj, Value::str(property.as_str())))
            }
            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let key = self.eval(index)?;
                Ok(Place::Key(obj, key))
            }
            _ => Err(SandboxError::Execution(
                "SyntaxError: invalid assignment target".to_string(),
            )),
        }
    }

    fn read(&mut self, place: &Place) -> Exec<Value> {
        match place {
            Place::Var(name) => self.lookup(name).ok_or_else(|| reference_error(name)),
            Place::Key(obj, key) => self.get_index(obj, key),
        }
    }

    fn write(&mut self, place: &Place, value: Value) -> Exec<()> {
        match place {
            Place::Var(name) => self.assign_var(name, value),
            Place::Key(obj, key) => self.set_index(obj, key, value),
        }
    }

    fn get_index(&mut self, obj: &Value, key: &Value) -> Exec<Value> {
        match obj {
            Value::Undefined | Value::Null => {
                let name = self.property_key(key)?;
                Err(type_error(format!(
                    "cannot read properties of {} (reading '{name}')",
                    nullish_name(obj)
                )))
            }
            Value::Array(a) => {
                if let Some(i) = array_index(key) {
                    return Ok(a.items.borrow().get(i).cloned().unwrap_or(Value::Undefined));
                }
                Ok(if self.property_key(key)? == "length" {
                    Value::Number(a.items.borrow().len() as f64)
                } else {
                    Value::Undefined
                })
            }
            Value::Str(s) => {
                if let Some(i) = array_index(key) {
                    return Ok(s
                        .chars()
                        .nth(i)
                        .map_or(Value::Undefined, |c| Value::str(c.to_string())));
                }
                Ok(if self.property_key(key)? == "length" {
                    Value::Number(s.chars().count() as f64)
                } else {
                    Value::Undefined
                })
            }
            Value::Object(o) => {
                let name = self.property_key(key)?;
                Ok(o.props.borrow().get(&name).cloned().unwrap_or(Value::Undefined))
            }
            _ => Ok(Value::Undefined),
        }
    }

    fn set_index(&mut self, obj: &Value, key: &Value, value: Value) -> Exec<()> {
        match obj {
            Value::Array(a) => {
                if a.frozen {
                    return Err(type_error("cannot modify a read-only array"));
                }
                let len = a.items.borrow().len();
                if let Some(i) = array_index(key) {
                    if i >= len {
                        self.check_len(i + 1)?;
                        self.allocate((i + 1 - len) * VALUE_BYTES)?;
                    }
                    let mut items = a.items.borrow_mut();
                    if i < items.len() {
                        items[i] = value;
                    } else {
                        items.resize(i, Value::Undefined);
                        items.push(value);
                    }
                    return Ok(());
                }
                let name = self.property_key(key)?;
                if name == "length" {
                    let new_len = array_index(&Value::Number(value.to_number()))
                        .ok_or_else(|| type_error("invalid array length"))?;
                    self.check_len(new_len)?;
                    self.allocate(new_len.saturating_sub(len) * VALUE_BYTES)?;
                    a.items.borrow_mut().resize(new_len, Value::Undefined);
                    return Ok(());
                }
                Err(type_error(format!("cannot set property '{name}' on an array")))
            }
            Value::Object(o) => {
                let name = self.property_key(key)?;
                if o.frozen {
                    return Err(type_error(format!(
                        "cannot assign to property '{name}' of a read-only object"
                    )));
                }
                let (present, count) = {
                    let props = o.props.borrow();
                    (props.contains_key(&name), props.len())
                };
                if !present {
                    self.check_len(count + 1)?;
                    self.allocate(VALUE_BYTES + name.len())?;
                }
                o.props.borrow_mut().insert(name, value);
                Ok(())
            }
            Value::Undefined | Value::Null => {
                let name = self.property_key(key)?;
                Err(type_error(format!(
                    "cannot set properties of {} (setting '{name}')",
                    nullish_name(obj)
                )))
            }
            _ => {
                let name = self.property_key(key)?;
                Err(type_error(format!(
                    "cannot set property '{name}' on a {}",
                    obj.type_of()
                )))
            }
        }
    }

    // ----- calls -----

    fn eval_args(&mut self, args: &[Expr]) -> Exec<Vec<Value>> {
        args.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Exec<Value> {
        match callee {
            Expr::Member { object, property } => {
                let receiver = self.eval(object)?;
                let args = self.eval_args(args)?;
                self.call_method(&receiver, property, args)
            }
            Expr::Index { object, index } => {
                let receiver = self.eval(object)?;
                let key = self.eval(index)?;
                let name = self.property_key(&key)?;
                let args = self.eval_args(args)?;
                self.call_method(&receiver, &name, args)
            }
            _ => {
                let function = self.eval(callee)?;
                let args = self.eval_args(args)?;
                self.call_value(&function, args, &callee_name(callee))
            }
        }
    }

    fn call_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Exec<Value> {
        match receiver {
            Value::Array(a) => self.array_method(receiver, a, name, args),
            Value::Str(s) => self.string_method(s, name, args),
            _ => {
                let function = self.get_index(receiver, &Value::str(name))?;
                self.call_value(&function, args, name)
            }
        }
    }

    fn call_value(&mut self, function: &Value, args: Vec<Value>, name: &str) -> Exec<Value> {
        match function {
            Value::Function(decl) => self.call_function(decl, args),
            Value::Native(native) => self.call_native(*native, args),
            _ => Err(type_error(format!("{name} is not a function"))),
        }
    }

    fn call_function(&mut self, decl: &Rc<FunctionDecl>, args: Vec<Value>) -> Exec<Value> {
        if self.depth >= self.limits.max_call_depth {
            return Err(SandboxError::Execution(format!(
                "RangeError: maximum call depth of {} exceeded",
                self.limits.max_call_depth
            )));
        }
        let mut args = args.into_iter();
        let scope: Scope = decl
            .params
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    Binding {
                        value: args.next().unwrap_or(Value::Undefined),
                        mutable: true,
                    },
                )
            })
            .collect();

        self.frames.push(vec![scope]);
        self.depth += 1;
        let flow = self.exec_stmts(&decl.body);
        self.depth -= 1;
        self.frames.pop();

        match flow? {
            Flow::Return(v) => Ok(v),
            _ => Ok(Value::Undefined),
        }
    }
}

impl Meter for Interpreter {
    fn visit(&mut self, bytes: usize) -> Exec<()> {
        self.allocate(bytes)?;
        self.tick()
    }

    fn max_text(&self) -> usize {
        self.limits.max_string_len
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Hold every live container first so that emptying one never frees
        // another recursively.
        let arrays: Vec<Rc<ArrayData>> = self.arrays.iter().filter_map(Weak::upgrade).collect();
        let objects: Vec<Rc<ObjectData>> = self.objects.iter().filter_map(Weak::upgrade).collect();
        for a in &arrays {
            if let Ok(mut items) = a.items.try_borrow_mut() {
                items.clear();
            }
        }
        for o in &objects {
            if let Ok(mut props) = o.props.try_borrow_mut() {
                props.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse;
    use std::time::Duration;

    fn run_with(limits: SandboxLimits, src: &str, method: &str) -> Exec<Value> {
        let program = parse(src).unwrap();
        let mut interp = Interpreter::new(limits, ModuleAllowlist::default());
        interp.run_program(&program)?;
        interp.invoke(method, vec![])
    }

    fn run(src: &str) -> Exec<Value> {
        run_with(SandboxLimits::default(), src, "main")
    }

    fn display(src: &str) -> String {
        let program = parse(src).unwrap();
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.run_program(&program).unwrap();
        let value = interp.invoke("main", vec![]).unwrap();
        interp.display(&value).unwrap()
    }

    #[test]
    fn test_arithmetic_and_concat() {
        assert_eq!(display("function main() { return 1 + 2 * 3 - 4 / 2; }"), "5");
        assert_eq!(display("function main() { return 'a' + 1 + 2; }"), "a12");
        assert_eq!(display("function main() { return 7 % 3; }"), "1");
    }

    #[test]
    fn test_loops_and_control_flow() {
        let src = r"
            function main() {
                let total = 0;
                for (let i = 0; i < 10; i++) {
                    if (i === 2) continue;
                    if (i === 6) break;
                    total += i;
                }
                let j = 0;
                while (true) { j++; if (j > 3) break; }
                for (const x of [10, 20]) total += x;
                return total + j;
            }";
        // 0+1+3+4+5 + 30 + 4
        assert_eq!(display(src), "47");
    }

    #[test]
    fn test_objects_and_arrays() {
        let src = r"
            function main() {
                const o = { a: 1, list: [] };
                o.list.push('x', 'y');
                o['b'] = o.list.length;
                o.list[3] = 'z';
                return [o.b, o.list.join('-'), Object.keys(o).join()].join('|');
            }";
        assert_eq!(display(src), "2|x-y--z|a,b,list");
    }

    #[test]
    fn test_string_methods() {
        let src = r"
            function main() {
                const s = '  Hello World ';
                return s.trim().toUpperCase().split(' ').concat([s.trim().slice(-5)]).join(',');
            }";
        assert_eq!(display(src), "HELLO,WORLD,World");
    }

    #[test]
    fn test_top_level_code_and_helpers() {
        let src = r"
            const greeting = 'hi ';
            function helper(n) { return greeting + n; }
            function main() { return helper('bob'); }";
        assert_eq!(display(src), "hi bob");
    }

    #[test]
    fn test_const_cannot_be_reassigned() {
        let err = run("function main() { const x = 1; x = 2; }").unwrap_err();
        assert!(err.to_string().contains("constant"));
    }

    #[test]
    fn test_undefined_name() {
        let err = run("function main() { return nope; }").unwrap_err();
        assert!(err.to_string().contains("nope is not defined"));
        assert_eq!(display("function main() { return typeof nope; }"), "undefined");
    }

    #[test]
    fn test_throw_reports_message() {
        let err = run("function main() { throw new Error('boom'); }").unwrap_err();
        assert!(matches!(&err, SandboxError::Execution(m) if m.contains("boom")));
    }

    #[test]
    fn test_step_limit() {
        let limits = SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        };
        let err = run_with(limits, "function main() { while (true) {} }", "main").unwrap_err();
        assert_eq!(err, SandboxError::StepLimit(10_000));
    }

    #[test]
    fn test_timeout() {
        let limits = SandboxLimits {
            max_steps: u64::MAX,
            timeout: Duration::from_millis(20),
            ..SandboxLimits::default()
        };
        let err = run_with(limits, "function main() { for (;;) {} }", "main").unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[test]
    fn test_call_depth() {
        let err = run("function f(n) { return f(n + 1); } function main() { return f(0); }")
            .unwrap_err();
        assert!(err.to_string().contains("call depth"));
    }

    #[test]
    fn test_collection_limit() {
        let limits = SandboxLimits {
            max_collection_len: 100,
            ..SandboxLimits::default()
        };
        let err = run_with(
            limits,
            "function main() { const a = []; for (let i = 0; i < 200; i++) a.push(i); }",
            "main",
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryLimit(_)));

        let err = run_with(limits, "function main() { const a = []; a[500] = 1; }", "main")
            .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryLimit(_)));
    }

    #[test]
    fn test_string_limit() {
        let limits = SandboxLimits {
            max_string_len: 1024,
            ..SandboxLimits::default()
        };
        let err = run_with(
            limits,
            "function main() { let s = 'x'; while (true) s = s + s; }",
            "main",
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::MemoryLimit(_)));
    }

    #[test]
    fn test_allocation_quota() {
        let limits = SandboxLimits {
            max_memory: 1 << 16,
            ..SandboxLimits::default()
        };
        let src = r"
            function main() {
                const keep = [];
                for (let i = 0; i < 5000; i++) keep.push('chunk ' + i + ' of a larger buffer');
            }";
        let err = run_with(limits, src, "main").unwrap_err();
        assert!(matches!(&err, SandboxError::MemoryLimit(m) if m.contains("allocated")));
    }

    #[test]
    fn test_cycles_are_freed_on_drop() {
        let program = parse("function main() { const o = {}; o.self = o; return o; }").unwrap();
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.run_program(&program).unwrap();
        let Value::Object(o) = interp.invoke("main", vec![]).unwrap() else {
            panic!("expected an object");
        };
        let weak = Rc::downgrade(&o);
        drop(o);
        assert!(weak.upgrade().is_some());
        drop(interp);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_cycles_are_freed_after_a_failed_call() {
        let src = "function main() { state.ring = [1]; state.ring.push(state.ring); throw new Error('no'); }";
        let state = Value::from_json(&serde_json::json!({}), false);
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.adopt(&state);
        interp.bind_const("state", state.clone());
        interp.run_program(&parse(src).unwrap()).unwrap();
        assert!(interp.invoke("main", vec![]).is_err());

        let ring = match &state {
            Value::Object(o) => match o.props.borrow().get("ring") {
                Some(Value::Array(a)) => Rc::downgrade(a),
                _ => panic!("ring was not stored"),
            },
            _ => unreachable!(),
        };
        drop(state);
        drop(interp);
        assert!(ring.upgrade().is_none());
    }

    #[test]
    fn test_require() {
        let src = "function main() { return require('crypto').sha256('abc'); }";
        assert_eq!(
            display(src),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let err = run("function main() { return require('fs'); }").unwrap_err();
        assert_eq!(err, SandboxError::ModuleNotAllowed("fs".to_string()));
    }

    #[test]
    fn test_bound_constants_are_read_only() {
        let program = parse("function main() { params.x = 1; }").unwrap();
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.bind_const(
            "params",
            Value::from_json(&serde_json::json!({"x": 0}), true),
        );
        interp.run_program(&program).unwrap();
        assert!(interp.invoke("main", vec![]).is_err());

        let program = parse("function main() { sender = 'me'; }").unwrap();
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.bind_const("sender", Value::str("0xA"));
        interp.run_program(&program).unwrap();
        assert!(interp.invoke("main", vec![]).is_err());
    }

    #[test]
    fn test_function_cannot_shadow_binding() {
        let program = parse("function state() {}").unwrap();
        let mut interp = Interpreter::new(SandboxLimits::default(), ModuleAllowlist::default());
        interp.bind_const("state", Value::Null);
        assert!(interp.run_program(&program).is_err());
    }

    #[test]
    fn test_missing_method() {
        let err = run_with(SandboxLimits::default(), "function main() {}", "other").unwrap_err();
        assert_eq!(err, SandboxError::MethodNotFound("other".to_string()));
    }
}
