//! Functions that can be launched as child processes.
//!
//! Functions are collected in a [`RegistryBuilder`] and frozen into the
//! process-wide registry by [`crate::init_main`]. The parent and the
//! re-executed child build the same registry, so a function is identified
//! across processes by its name alone.

pub mod invocation;

pub use invocation::Invocation;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// An argument or result of a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "{}", hex::encode(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Map,
    /// Accepts any value, including nil.
    Any,
}

impl ParamType {
    pub fn name(self) -> &'static str {
        match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Str => "str",
            ParamType::Bytes => "bytes",
            ParamType::List => "list",
            ParamType::Map => "map",
            ParamType::Any => "any",
        }
    }

    /// What a nil argument turns into.
    pub fn zero(self) -> Value {
        match self {
            ParamType::Bool => Value::Bool(false),
            ParamType::Int => Value::Int(0),
            ParamType::Float => Value::Float(0.0),
            ParamType::Str => Value::Str(String::new()),
            ParamType::Bytes => Value::Bytes(Vec::new()),
            ParamType::List => Value::List(Vec::new()),
            ParamType::Map => Value::Map(BTreeMap::new()),
            ParamType::Any => Value::Nil,
        }
    }

    pub fn accepts(self, v: &Value) -> bool {
        matches!(
            (self, v),
            (ParamType::Any, _)
                | (ParamType::Bool, Value::Bool(_))
                | (ParamType::Int, Value::Int(_))
                | (ParamType::Float, Value::Float(_))
                | (ParamType::Str, Value::Str(_))
                | (ParamType::Bytes, Value::Bytes(_))
                | (ParamType::List, Value::List(_))
                | (ParamType::Map, Value::Map(_))
        )
    }
}

/// Parameter list of a registered function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    params: Vec<ParamType>,
    variadic: Option<ParamType>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, t: ParamType) -> Self {
        self.params.push(t);
        self
    }

    /// Any number of trailing arguments of type `t`.
    pub fn variadic(mut self, t: ParamType) -> Self {
        self.variadic = Some(t);
        self
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic.is_some()
    }

    /// Checks `args` and replaces nil arguments with the zero value of their
    /// parameter type.
    pub fn check(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let n = self.params.len();
        let count_ok = match self.variadic {
            Some(_) => args.len() >= n,
            None => args.len() == n,
        };
        if !count_ok {
            let expected = match self.variadic {
                Some(_) => format!("at least {}", n),
                None => n.to_string(),
            };
            return Err(Error::ArgCount {
                name: name.to_string(),
                expected,
                got: args.len(),
            });
        }

        args.into_iter()
            .enumerate()
            .map(|(i, arg)| {
                let t = match self.params.get(i) {
                    Some(t) => *t,
                    // count check guarantees the variadic type is present
                    None => self.variadic.unwrap_or(ParamType::Any),
                };
                if arg.is_nil() {
                    return Ok(t.zero());
                }
                if !t.accepts(&arg) {
                    return Err(Error::ArgType {
                        name: name.to_string(),
                        index: i,
                        expected: t.name(),
                        got: arg.kind(),
                    });
                }
                Ok(arg)
            })
            .collect()
    }
}

/// Validated arguments handed to a registered function.
#[derive(Debug, Clone)]
pub struct Args {
    name: String,
    values: Vec<Value>,
}

impl Args {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, i: usize) -> Result<&Value> {
        self.values.get(i).ok_or_else(|| Error::ArgCount {
            name: self.name.clone(),
            expected: format!("at least {}", i + 1),
            got: self.values.len(),
        })
    }

    fn mismatch(&self, i: usize, expected: &'static str, got: &Value) -> Error {
        Error::ArgType {
            name: self.name.clone(),
            index: i,
            expected,
            got: got.kind(),
        }
    }

    pub fn str(&self, i: usize) -> Result<&str> {
        match self.get(i)? {
            Value::Str(s) => Ok(s),
            other => Err(self.mismatch(i, "str", other)),
        }
    }

    pub fn int(&self, i: usize) -> Result<i64> {
        match self.get(i)? {
            Value::Int(v) => Ok(*v),
            other => Err(self.mismatch(i, "int", other)),
        }
    }

    pub fn float(&self, i: usize) -> Result<f64> {
        match self.get(i)? {
            Value::Float(v) => Ok(*v),
            other => Err(self.mismatch(i, "float", other)),
        }
    }

    pub fn bool(&self, i: usize) -> Result<bool> {
        match self.get(i)? {
            Value::Bool(v) => Ok(*v),
            other => Err(self.mismatch(i, "bool", other)),
        }
    }

    pub fn bytes(&self, i: usize) -> Result<&[u8]> {
        match self.get(i)? {
            Value::Bytes(v) => Ok(v),
            other => Err(self.mismatch(i, "bytes", other)),
        }
    }

    pub fn list(&self, i: usize) -> Result<&[Value]> {
        match self.get(i)? {
            Value::List(v) => Ok(v),
            other => Err(self.mismatch(i, "list", other)),
        }
    }

    /// Arguments from index `from` on, e.g. the variadic tail.
    pub fn rest(&self, from: usize) -> &[Value] {
        self.values.get(from..).unwrap_or(&[])
    }
}

type Func = dyn Fn(Args) -> anyhow::Result<Value> + Send + Sync;

struct Entry {
    signature: Signature,
    func: Arc<Func>,
}

/// Collects functions before they are frozen by [`crate::init_main`].
#[derive(Default)]
pub struct RegistryBuilder {
    funcs: HashMap<String, Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, signature: Signature, f: F) -> Result<Self>
    where
        F: Fn(Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.funcs.contains_key(&name) {
            return Err(Error::DuplicateRegistration(name));
        }
        self.funcs.insert(
            name,
            Entry {
                signature,
                func: Arc::new(f),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry { funcs: self.funcs }
    }
}

/// Frozen set of registered functions.
pub struct Registry {
    funcs: HashMap<String, Entry>,
}

impl Registry {
    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.funcs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn signature(&self, name: &str) -> Result<&Signature> {
        self.funcs
            .get(name)
            .map(|e| &e.signature)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    /// Validates `args` against the function's signature without calling it.
    pub fn check(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.signature(name)?.check(name, args)
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let entry = self
            .funcs
            .get(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        let args = entry.signature.check(name, args)?;
        log::debug!("Calling {}({} args)", name, args.len());
        (entry.func)(Args::new(name, args)).map_err(Error::Function)
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub(crate) fn install(registry: Registry) -> Result<&'static Registry> {
    REGISTRY
        .set(registry)
        .map_err(|_| Error::RegistryFrozen)?;
    global()
}

/// The registry frozen by [`crate::init_main`].
pub fn global() -> Result<&'static Registry> {
    REGISTRY.get().ok_or(Error::InitMainNotCalled)
}

/// Calls a function from the process-wide registry in this process.
pub fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    global()?.call(name, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        RegistryBuilder::new()
            .register(
                "add",
                Signature::new().param(ParamType::Int).param(ParamType::Int),
                |args| Ok(Value::Int(args.int(0)? + args.int(1)?)),
            )
            .unwrap()
            .register(
                "join",
                Signature::new().param(ParamType::Str).variadic(ParamType::Str),
                |args| {
                    let sep = args.str(0)?;
                    let parts: Vec<String> = args.rest(1).iter().map(|v| v.to_string()).collect();
                    Ok(Value::Str(parts.join(sep)))
                },
            )
            .unwrap()
            .register("fail", Signature::new(), |_| anyhow::bail!("nope"))
            .unwrap()
            .build()
    }

    #[test]
    fn test_call_add() {
        let r = registry();
        assert_eq!(r.call("add", vec![2.into(), 3.into()]).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_arg_count() {
        let r = registry();
        let err = r.call("add", vec![2.into()]).unwrap_err();
        assert!(matches!(err, Error::ArgCount { got: 1, .. }), "{}", err);
        let err = r.call("add", vec![1.into(), 2.into(), 3.into()]).unwrap_err();
        assert!(matches!(err, Error::ArgCount { got: 3, .. }));
        let err = r.call("join", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "join: expected at least 1 argument(s), got 0");
    }

    #[test]
    fn test_arg_type() {
        let r = registry();
        let err = r.call("add", vec![2.into(), "3".into()]).unwrap_err();
        assert!(matches!(err, Error::ArgType { index: 1, expected: "int", got: "str", .. }));
        let err = r.call("join", vec![",".into(), "a".into(), 1.into()]).unwrap_err();
        assert!(matches!(err, Error::ArgType { index: 2, .. }));
    }

    #[test]
    fn test_nil_becomes_zero_value() {
        let r = registry();
        assert_eq!(r.call("add", vec![Value::Nil, 4.into()]).unwrap(), Value::Int(4));
        assert_eq!(
            r.call("join", vec!["-".into(), "a".into(), Value::Nil, "b".into()]).unwrap(),
            Value::Str("a--b".to_string())
        );
    }

    #[test]
    fn test_unknown_and_failing_functions() {
        let r = registry();
        assert!(matches!(r.call("nope", vec![]), Err(Error::UnknownFunction(_))));
        let err = r.call("fail", vec![]).unwrap_err();
        assert!(matches!(err, Error::Function(_)));
        assert!(!err.is_usage());
    }

    #[test]
    fn test_duplicate_registration() {
        let res = RegistryBuilder::new()
            .register("f", Signature::new(), |_| Ok(Value::Nil))
            .unwrap()
            .register("f", Signature::new(), |_| Ok(Value::Nil));
        assert!(matches!(res, Err(Error::DuplicateRegistration(name)) if name == "f"));
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(registry().names(), vec!["add", "fail", "join"]);
    }
}
