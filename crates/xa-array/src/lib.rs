//! `XArray`: an immutable, lazily evaluated, homogeneously typed array.
//!
//! An array is a [`DType`] plus a lazy [`Handle`] over [`Value`] elements.
//! Constructors validate types eagerly but defer per-element cast work (and
//! cast failures) to materialization; transformations return new arrays that
//! stack further work onto the handle chain. Alignment between two arrays is
//! cheap when their structure tags match and falls back to an indexed join
//! when they do not.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use log::debug;
use thiserror::Error;
use xa_engine::{EngineError, Handle, StructureTag};
use xa_sketch::Sketch;
use xa_types::{CastError, DType, TypeError, Value, cast_value, infer_dtype, render_value};
use xa_types::INFERENCE_PREFIX;

/// Failure class, mirroring the conventional taxonomy: bad types, bad
/// values, bad positions, and violated runtime expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Type,
    Value,
    Index,
    Runtime,
}

/// Any array-level failure.
#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("operation `{op}` is not supported for {dtype} arrays")]
    UnsupportedDType { op: &'static str, dtype: DType },
    #[error("cannot construct a bool array from {dtype} data")]
    BoolConstruction { dtype: DType },
    #[error("array lengths do not match: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("index {index} is out of range for {len} elements")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("slice step must be nonzero")]
    ZeroStep,
    #[error("cannot append a {other} array to a {this} array")]
    AppendMismatch { this: DType, other: DType },
    #[error("sample fraction {fraction} must lie in [0, 1]")]
    BadFraction { fraction: f64 },
    #[error("undefined element encountered with skip_undefined disabled")]
    UndefinedElement,
    #[error("{0}")]
    Value(String),
    #[error("{0}")]
    Runtime(String),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error(transparent)]
    Engine(EngineError),
}

impl ArrayError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArrayError::UnsupportedDType { .. }
            | ArrayError::BoolConstruction { .. }
            | ArrayError::Type(_) => ErrorKind::Type,
            ArrayError::Cast(_)
            | ArrayError::BadFraction { .. }
            | ArrayError::ZeroStep
            | ArrayError::UndefinedElement
            | ArrayError::Value(_) => ErrorKind::Value,
            ArrayError::LengthMismatch { .. } | ArrayError::IndexOutOfRange { .. } => {
                ErrorKind::Index
            }
            ArrayError::AppendMismatch { .. }
            | ArrayError::Runtime(_)
            | ArrayError::Engine(_) => ErrorKind::Runtime,
        }
    }
}

// Cast and type failures keep their class when they bubble out of lazy
// evaluation.
impl From<EngineError> for ArrayError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cast(c) => ArrayError::Cast(c),
            EngineError::Type(t) => ArrayError::Type(t),
            EngineError::UndefinedElement => ArrayError::UndefinedElement,
            other => ArrayError::Engine(other),
        }
    }
}

/// Elementwise arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Elementwise comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl ComparisonOp {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            ComparisonOp::Gt => ord == Ordering::Greater,
            ComparisonOp::Ge => ord != Ordering::Less,
            ComparisonOp::Lt => ord == Ordering::Less,
            ComparisonOp::Le => ord != Ordering::Greater,
            ComparisonOp::Eq => ord == Ordering::Equal,
            ComparisonOp::Ne => ord != Ordering::Equal,
        }
    }
}

/// Keys used by [`XArray::unpack`] to pick out sub-elements: positions for
/// list arrays, string keys for dict arrays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnpackKey {
    Pos(usize),
    Key(String),
}

impl UnpackKey {
    fn column_suffix(&self) -> String {
        match self {
            UnpackKey::Pos(i) => i.to_string(),
            UnpackKey::Key(s) => s.clone(),
        }
    }

    fn extract(&self, row: &Value) -> Option<Value> {
        match (row, self) {
            (Value::List(xs), UnpackKey::Pos(i)) => xs.get(*i).cloned(),
            (Value::Dict(d), UnpackKey::Key(k)) => d.get(k).cloned(),
            _ => None,
        }
    }
}

fn int_view(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn numeric_binary(l: &Value, r: &Value, op: ArithmeticOp) -> Result<Value, EngineError> {
    if l.is_missing() || r.is_missing() {
        return Ok(Value::Undefined);
    }
    if let (Value::Str(a), Value::Str(b)) = (l, r)
        && op == ArithmeticOp::Add
    {
        let mut out = a.clone();
        out.push_str(b);
        return Ok(Value::Str(out));
    }
    if op != ArithmeticOp::Div
        && let (Some(a), Some(b)) = (int_view(l), int_view(r))
    {
        let exact = match op {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            ArithmeticOp::Mul => a.checked_mul(b),
            ArithmeticOp::Pow => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            ArithmeticOp::Div => None,
        };
        if let Some(v) = exact {
            return Ok(Value::Int(v));
        }
        // Overflow (or a negative exponent) falls through to floats.
    }
    let (a, b) = (l.to_f64()?, r.to_f64()?);
    let out = match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Sub => a - b,
        ArithmeticOp::Mul => a * b,
        ArithmeticOp::Div => a / b,
        ArithmeticOp::Pow => a.powf(b),
    };
    Ok(Value::Float(out))
}

fn missing_last(a: &Value, b: &Value, ascending: bool) -> Ordering {
    match (a.is_missing(), b.is_missing()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ord = a.total_cmp(b);
            if ascending { ord } else { ord.reverse() }
        }
    }
}

/// An immutable, lazily evaluated, homogeneously typed one-dimensional
/// array.
#[derive(Debug, Clone)]
pub struct XArray {
    dtype: DType,
    handle: Handle<Value>,
}

impl XArray {
    fn with(dtype: DType, handle: Handle<Value>) -> Self {
        Self { dtype, handle }
    }

    /// Build an array from raw data.
    ///
    /// When `dtype` is absent it is inferred from the leading elements.
    /// Every element is cast to the resolved dtype; the casts (and their
    /// failures) are deferred until materialization. With
    /// `ignore_cast_failure` an uncastable element degrades to `Undefined`
    /// instead of failing.
    ///
    /// Declaring `bool` over non-bool data is rejected eagerly; `bool` is
    /// reachable from other dtypes only through [`XArray::astype`].
    pub fn from_values(
        values: Vec<Value>,
        dtype: Option<DType>,
        ignore_cast_failure: bool,
    ) -> Result<Self, ArrayError> {
        let inferred = infer_dtype(&values);
        let declared = dtype.unwrap_or(inferred);
        if declared == DType::Bool && inferred != DType::Bool && inferred != DType::Undefined {
            return Err(ArrayError::BoolConstruction { dtype: inferred });
        }
        let handle = Handle::from_vec(values);
        Ok(Self::with(declared, cast_chain(&handle, declared, ignore_cast_failure)))
    }

    /// Infer the dtype and fail lazily on any uncastable element.
    pub fn from_vec(values: Vec<Value>) -> Result<Self, ArrayError> {
        Self::from_values(values, None, false)
    }

    /// An array of `n` copies of `value`. Bool constants are rejected for
    /// the same reason a declared bool dtype is.
    pub fn from_const(value: Value, n: usize) -> Result<Self, ArrayError> {
        if value.dtype() == DType::Bool {
            return Err(ArrayError::UnsupportedDType {
                op: "from_const",
                dtype: DType::Bool,
            });
        }
        let dtype = value.dtype();
        Ok(Self::with(dtype, Handle::from_vec(vec![value; n])))
    }

    /// Integers in `[start, stop)`.
    #[must_use]
    pub fn from_sequence(start: i64, stop: i64) -> Self {
        Self::with(
            DType::Int,
            Handle::from_vec((start..stop).map(Value::Int).collect()),
        )
    }

    /// Wrap already-partitioned, already-typed data (used by persisted
    /// storage when reloading).
    #[must_use]
    pub fn from_partitions(partitions: Vec<Vec<Value>>, dtype: DType) -> Self {
        Self::with(dtype, Handle::from_partitions(partitions))
    }

    /// Wrap an existing engine handle whose elements already conform to
    /// `dtype`.
    #[must_use]
    pub fn from_handle(handle: Handle<Value>, dtype: DType) -> Self {
        Self::with(dtype, handle)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The underlying lazy handle.
    #[must_use]
    pub fn handle(&self) -> &Handle<Value> {
        &self.handle
    }

    /// Partition-lineage marker; equal tags make [`XArray::zip`]-based
    /// operations cheap.
    #[must_use]
    pub fn structure_tag(&self) -> StructureTag {
        self.handle.tag()
    }

    /// Materialize the element count.
    pub fn len(&self) -> Result<usize, ArrayError> {
        Ok(self.handle.count()?)
    }

    /// Alias for [`XArray::len`].
    pub fn size(&self) -> Result<usize, ArrayError> {
        self.len()
    }

    pub fn is_empty(&self) -> Result<bool, ArrayError> {
        Ok(self.len()? == 0)
    }

    /// Materialize every element in order.
    pub fn collect(&self) -> Result<Vec<Value>, ArrayError> {
        Ok(self.handle.collect()?)
    }

    /// Materialize at most the first `n` elements.
    pub fn head(&self, n: usize) -> Result<Vec<Value>, ArrayError> {
        Ok(self.handle.take(n)?)
    }

    /// Materialize at most the last `n` elements.
    pub fn tail(&self, n: usize) -> Result<Vec<Value>, ArrayError> {
        let all = self.collect()?;
        let skip = all.len().saturating_sub(n);
        Ok(all[skip..].to_vec())
    }

    /// Cache the next materialization for reuse.
    pub fn persist(&self) -> &Self {
        self.handle.persist();
        self
    }

    pub fn unpersist(&self) {
        self.handle.unpersist();
    }

    /// Re-type every element. Casting is deferred; with
    /// `ignore_cast_failure` uncastable elements degrade to `Undefined`.
    #[must_use]
    pub fn astype(&self, dtype: DType, ignore_cast_failure: bool) -> Self {
        Self::with(dtype, cast_chain(&self.handle, dtype, ignore_cast_failure))
    }

    fn require_numeric(&self, op: &'static str) -> Result<(), ArrayError> {
        match self.dtype {
            DType::Int | DType::Float | DType::Bool | DType::Undefined => Ok(()),
            dtype => Err(TypeError::Unsupported { op, dtype }.into()),
        }
    }

    fn require_dtype(&self, want: DType, op: &'static str) -> Result<(), ArrayError> {
        if self.dtype == want || self.dtype == DType::Undefined {
            Ok(())
        } else {
            Err(ArrayError::UnsupportedDType {
                op,
                dtype: self.dtype,
            })
        }
    }

    fn check_same_len(&self, other: &XArray) -> Result<(), ArrayError> {
        let (l, r) = (self.len()?, other.len()?);
        if l == r {
            Ok(())
        } else {
            Err(ArrayError::LengthMismatch { left: l, right: r })
        }
    }

    // ---- elementwise operators ----

    fn arith_out_dtype(&self, rhs: DType, op: ArithmeticOp) -> Result<DType, ArrayError> {
        if self.dtype == DType::Str && rhs == DType::Str && op == ArithmeticOp::Add {
            return Ok(DType::Str);
        }
        for side in [self.dtype, rhs] {
            if !matches!(
                side,
                DType::Int | DType::Float | DType::Bool | DType::Undefined
            ) {
                return Err(TypeError::Unsupported {
                    op: "arithmetic",
                    dtype: side,
                }
                .into());
            }
        }
        Ok(if op == ArithmeticOp::Div {
            DType::Float
        } else if self.dtype == DType::Float || rhs == DType::Float {
            DType::Float
        } else {
            DType::Int
        })
    }

    /// Elementwise arithmetic against a scalar. `reverse` puts the scalar
    /// on the left of the operator.
    pub fn arith_scalar(
        &self,
        op: ArithmeticOp,
        scalar: Value,
        reverse: bool,
    ) -> Result<XArray, ArrayError> {
        let out_dtype = self.arith_out_dtype(scalar.dtype(), op)?;
        let handle = self.handle.try_map(move |v| {
            let res = if reverse {
                numeric_binary(&scalar, v, op)?
            } else {
                numeric_binary(v, &scalar, op)?
            };
            cast_value(res, out_dtype).map_err(EngineError::from)
        });
        Ok(Self::with(out_dtype, handle))
    }

    /// Elementwise arithmetic between two equal-length arrays.
    pub fn arith(&self, other: &XArray, op: ArithmeticOp) -> Result<XArray, ArrayError> {
        let out_dtype = self.arith_out_dtype(other.dtype, op)?;
        self.check_same_len(other)?;
        let zipped = self.handle.zip(&other.handle);
        let handle = zipped.try_map(move |(l, r)| {
            let res = numeric_binary(l, r, op)?;
            cast_value(res, out_dtype).map_err(EngineError::from)
        });
        Ok(Self::with(out_dtype, handle))
    }

    fn comparable_with(&self, rhs: DType, op: ComparisonOp) -> Result<(), ArrayError> {
        if matches!(op, ComparisonOp::Eq | ComparisonOp::Ne) {
            return Ok(());
        }
        let numericish =
            |d: DType| matches!(d, DType::Int | DType::Float | DType::Bool | DType::Undefined);
        if (numericish(self.dtype) && numericish(rhs))
            || self.dtype == rhs
            || self.dtype == DType::Undefined
            || rhs == DType::Undefined
        {
            Ok(())
        } else {
            Err(TypeError::Unsupported {
                op: "comparison",
                dtype: self.dtype,
            }
            .into())
        }
    }

    /// Elementwise comparison against a scalar; yields a bool array with
    /// `Undefined` wherever either side is missing.
    pub fn compare_scalar(&self, op: ComparisonOp, scalar: Value) -> Result<XArray, ArrayError> {
        self.comparable_with(scalar.dtype(), op)?;
        let handle = self.handle.map(move |v| compare_values(v, &scalar, op));
        Ok(Self::with(DType::Bool, handle))
    }

    /// Elementwise comparison between two equal-length arrays.
    pub fn compare(&self, other: &XArray, op: ComparisonOp) -> Result<XArray, ArrayError> {
        self.comparable_with(other.dtype, op)?;
        self.check_same_len(other)?;
        let zipped = self.handle.zip(&other.handle);
        let handle = zipped.map(move |(l, r)| compare_values(l, r, op));
        Ok(Self::with(DType::Bool, handle))
    }

    fn require_bool_pair(&self, other: &XArray, op: &'static str) -> Result<(), ArrayError> {
        for side in [self.dtype, other.dtype] {
            if !matches!(side, DType::Bool | DType::Undefined) {
                return Err(TypeError::Unsupported { op, dtype: side }.into());
            }
        }
        Ok(())
    }

    /// Elementwise conjunction of two equal-length bool arrays. A missing
    /// operand yields a missing result.
    pub fn logical_and(&self, other: &XArray) -> Result<XArray, ArrayError> {
        self.require_bool_pair(other, "logical and")?;
        self.check_same_len(other)?;
        let zipped = self.handle.zip(&other.handle);
        let handle = zipped.map(|(l, r)| {
            if l.is_missing() || r.is_missing() {
                Value::Undefined
            } else {
                Value::Bool(l.is_truthy() && r.is_truthy())
            }
        });
        Ok(Self::with(DType::Bool, handle))
    }

    /// Elementwise disjunction of two equal-length bool arrays. A missing
    /// operand yields a missing result.
    pub fn logical_or(&self, other: &XArray) -> Result<XArray, ArrayError> {
        self.require_bool_pair(other, "logical or")?;
        self.check_same_len(other)?;
        let zipped = self.handle.zip(&other.handle);
        let handle = zipped.map(|(l, r)| {
            if l.is_missing() || r.is_missing() {
                Value::Undefined
            } else {
                Value::Bool(l.is_truthy() || r.is_truthy())
            }
        });
        Ok(Self::with(DType::Bool, handle))
    }

    /// Conjunction of a bool array with one scalar; missing passes through.
    pub fn logical_and_scalar(&self, scalar: bool) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::Bool, "logical and")?;
        let handle = self.handle.map(move |v| {
            if v.is_missing() {
                Value::Undefined
            } else {
                Value::Bool(v.is_truthy() && scalar)
            }
        });
        Ok(Self::with(DType::Bool, handle))
    }

    /// Disjunction of a bool array with one scalar; missing passes through.
    pub fn logical_or_scalar(&self, scalar: bool) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::Bool, "logical or")?;
        let handle = self.handle.map(move |v| {
            if v.is_missing() {
                Value::Undefined
            } else {
                Value::Bool(v.is_truthy() || scalar)
            }
        });
        Ok(Self::with(DType::Bool, handle))
    }

    /// Negate every numeric element.
    pub fn neg(&self) -> Result<XArray, ArrayError> {
        self.arith_scalar(ArithmeticOp::Mul, Value::Int(-1), false)
    }

    /// Absolute value of every numeric element.
    pub fn abs(&self) -> Result<XArray, ArrayError> {
        self.require_numeric("abs")?;
        let dtype = self.dtype;
        let handle = self.handle.map(|v| match v {
            Value::Int(i) => Value::Int(i.wrapping_abs()),
            Value::Float(f) => Value::Float(f.abs()),
            other => other.clone(),
        });
        Ok(Self::with(dtype, handle))
    }

    // ---- selection ----

    /// Keep elements whose counterpart in `mask` is truthy. The two arrays
    /// must have equal lengths; `mask` is conventionally the result of a
    /// comparison but any dtype works through truthiness.
    pub fn logical_filter(&self, mask: &XArray) -> Result<XArray, ArrayError> {
        self.check_same_len(mask)?;
        let zipped = self.handle.zip(&mask.handle);
        let handle = zipped
            .filter(|(_, m)| m.is_truthy())
            .map(|(v, _)| v.clone());
        Ok(Self::with(self.dtype, handle))
    }

    /// Keep elements matching a predicate.
    pub fn filter_by<F>(&self, pred: F) -> XArray
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::with(self.dtype, self.handle.filter(pred))
    }

    /// Single-element lookup; negative indices count from the end.
    pub fn get(&self, index: i64) -> Result<Value, ArrayError> {
        let len = self.len()?;
        let pos = normalize_index(index, len)
            .ok_or(ArrayError::IndexOutOfRange { index, len })?;
        let mut head = self.handle.take(pos + 1)?;
        head.pop()
            .ok_or(ArrayError::IndexOutOfRange { index, len })
    }

    /// Contiguous or strided slice with negative-index and negative-step
    /// conventions; out-of-range bounds clamp rather than fail.
    pub fn slice(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<XArray, ArrayError> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(ArrayError::ZeroStep);
        }
        let len = self.len()? as i64;
        let clamp = |i: i64, lo: i64, hi: i64| i.max(lo).min(hi);
        let resolve = |bound: Option<i64>, default: i64, hi: i64| match bound {
            None => default,
            Some(b) if b < 0 => clamp(b + len, if step < 0 { -1 } else { 0 }, hi),
            Some(b) => clamp(b, if step < 0 { -1 } else { 0 }, hi),
        };
        let (start, stop) = if step > 0 {
            (resolve(start, 0, len), resolve(stop, len, len))
        } else {
            (resolve(start, len - 1, len - 1), resolve(stop, -1, len - 1))
        };
        let mut wanted = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            wanted.push(i as usize);
            i += step;
        }
        let selected: HashSet<usize> = wanted.iter().copied().collect();
        let filtered = self
            .handle
            .zip_with_index()
            .filter(move |(_, i)| selected.contains(i));
        let ordered = if step < 0 {
            filtered.sort_by(|a, b| b.1.cmp(&a.1))
        } else {
            filtered
        };
        Ok(Self::with(self.dtype, ordered.map(|(v, _)| v.clone())))
    }

    // ---- per-element functions ----

    /// Apply `f` to every present element. When `dtype` is absent the
    /// output type is inferred by running `f` over a leading sample.
    /// Missing inputs pass through as `Undefined` when `skip_undefined`,
    /// and fail the operation otherwise.
    pub fn apply<F>(
        &self,
        f: F,
        dtype: Option<DType>,
        skip_undefined: bool,
    ) -> Result<XArray, ArrayError>
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let out_dtype = match dtype {
            Some(d) => d,
            None => {
                let head = self.handle.take(INFERENCE_PREFIX)?;
                let mut outs = Vec::with_capacity(head.len());
                for v in &head {
                    if v.is_missing() {
                        if skip_undefined {
                            continue;
                        }
                        return Err(ArrayError::UndefinedElement);
                    }
                    outs.push(f(v));
                }
                infer_dtype(&outs)
            }
        };
        let handle = self.handle.try_map(move |v| {
            if v.is_missing() {
                return if skip_undefined {
                    Ok(Value::Undefined)
                } else {
                    Err(EngineError::UndefinedElement)
                };
            }
            let out = f(v);
            if out_dtype == DType::Undefined {
                Ok(out)
            } else {
                cast_value(out, out_dtype).map_err(EngineError::from)
            }
        });
        Ok(Self::with(out_dtype, handle))
    }

    /// Expand every present element into zero or more outputs and
    /// concatenate. Missing inputs and missing outputs are dropped when
    /// `skip_undefined`, and fail the operation otherwise.
    pub fn flat_map<F>(
        &self,
        f: F,
        dtype: Option<DType>,
        skip_undefined: bool,
    ) -> Result<XArray, ArrayError>
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let out_dtype = match dtype {
            Some(d) => d,
            None => {
                let head = self.handle.take(INFERENCE_PREFIX)?;
                let mut outs = Vec::new();
                for v in &head {
                    if v.is_missing() {
                        if skip_undefined {
                            continue;
                        }
                        return Err(ArrayError::UndefinedElement);
                    }
                    outs.extend(f(v));
                }
                infer_dtype(&outs)
            }
        };
        let handle = self.handle.try_flat_map(move |v| {
            if v.is_missing() {
                return if skip_undefined {
                    Ok(Vec::new())
                } else {
                    Err(EngineError::UndefinedElement)
                };
            }
            let mut kept = Vec::new();
            for out in f(v) {
                if out.is_missing() {
                    if skip_undefined {
                        continue;
                    }
                    return Err(EngineError::UndefinedElement);
                }
                kept.push(if out_dtype == DType::Undefined {
                    out
                } else {
                    cast_value(out, out_dtype).map_err(EngineError::from)?
                });
            }
            Ok(kept)
        });
        Ok(Self::with(out_dtype, handle))
    }

    /// Concatenate the rows of a list array.
    pub fn flatten(&self, skip_undefined: bool) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::List, "flatten")?;
        self.flat_map(
            |v| match v {
                Value::List(xs) => xs.clone(),
                other => vec![other.clone()],
            },
            None,
            skip_undefined,
        )
    }

    // ---- reshaping ----

    /// Distinct elements, first occurrences in encounter order.
    pub fn unique(&self) -> Result<XArray, ArrayError> {
        if self.dtype == DType::Dict {
            return Err(ArrayError::UnsupportedDType {
                op: "unique",
                dtype: self.dtype,
            });
        }
        Ok(Self::with(self.dtype, self.handle.distinct()))
    }

    /// Totally ordered sort; missing elements sort last in either
    /// direction.
    pub fn sort(&self, ascending: bool) -> Result<XArray, ArrayError> {
        if matches!(self.dtype, DType::List | DType::Dict) {
            return Err(ArrayError::UnsupportedDType {
                op: "sort",
                dtype: self.dtype,
            });
        }
        let handle = self
            .handle
            .sort_by(move |a, b| missing_last(a, b, ascending));
        Ok(Self::with(self.dtype, handle))
    }

    /// Mark the positions of the `topk` largest elements (smallest when
    /// `reverse`) with 1, everything else with 0. Ties break toward the
    /// earlier position.
    pub fn topk_index(&self, topk: usize, reverse: bool) -> Result<XArray, ArrayError> {
        let mut order: Vec<(Value, usize)> = self.handle.zip_with_index().collect()?;
        order.sort_by(|a, b| {
            let ord = if reverse {
                missing_last(&a.0, &b.0, true)
            } else {
                missing_last(&a.0, &b.0, false)
            };
            ord.then(a.1.cmp(&b.1))
        });
        let chosen: HashSet<usize> = order.iter().take(topk).map(|p| p.1).collect();
        let handle = self
            .handle
            .zip_with_index()
            .map(move |(_, i)| Value::Int(i64::from(chosen.contains(i))));
        Ok(Self::with(DType::Int, handle))
    }

    /// Concatenate two arrays of the same dtype (an all-missing array
    /// adopts the other side's dtype).
    pub fn append(&self, other: &XArray) -> Result<XArray, ArrayError> {
        let dtype = match (self.dtype, other.dtype) {
            (DType::Undefined, d) | (d, DType::Undefined) => d,
            (a, b) if a == b => a,
            (a, b) => return Err(ArrayError::AppendMismatch { this: a, other: b }),
        };
        Ok(Self::with(dtype, self.handle.union(&other.handle)))
    }

    /// Bernoulli sample of the array.
    pub fn sample(&self, fraction: f64, seed: Option<u64>) -> Result<XArray, ArrayError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ArrayError::BadFraction { fraction });
        }
        Ok(Self::with(self.dtype, self.handle.sample(fraction, seed)))
    }

    /// Rebalance into `num_partitions` chunks without changing contents.
    #[must_use]
    pub fn repartition(&self, num_partitions: usize) -> XArray {
        Self::with(self.dtype, self.handle.repartition(num_partitions))
    }

    // ---- missing-value handling ----

    /// Drop missing elements.
    #[must_use]
    pub fn dropna(&self) -> XArray {
        Self::with(self.dtype, self.handle.filter(|v| !v.is_missing()))
    }

    /// Replace missing elements with `value` (cast to the array dtype).
    pub fn fillna(&self, value: Value) -> Result<XArray, ArrayError> {
        let fill = if self.dtype == DType::Undefined {
            value
        } else {
            cast_value(value, self.dtype)?
        };
        let dtype = if self.dtype == DType::Undefined {
            fill.dtype()
        } else {
            self.dtype
        };
        let handle = self
            .handle
            .map(move |v| if v.is_missing() { fill.clone() } else { v.clone() });
        Ok(Self::with(dtype, handle))
    }

    /// Count of missing elements.
    pub fn num_missing(&self) -> Result<usize, ArrayError> {
        Ok(self.handle.aggregate(
            0usize,
            |acc, v| acc + usize::from(v.is_missing()),
            |a, b| a + b,
        )?)
    }

    /// Count of truthy (nonzero) elements.
    pub fn nnz(&self) -> Result<usize, ArrayError> {
        Ok(self.handle.aggregate(
            0usize,
            |acc, v| acc + usize::from(v.is_truthy()),
            |a, b| a + b,
        )?)
    }

    /// Clamp numeric elements (and numeric list members, for list arrays)
    /// into `[lower, upper]`. A NaN bound means unbounded on that side;
    /// bounds are cast to the element dtype eagerly.
    pub fn clip(
        &self,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Result<XArray, ArrayError> {
        if !matches!(
            self.dtype,
            DType::Int | DType::Float | DType::List | DType::Undefined
        ) {
            return Err(ArrayError::UnsupportedDType {
                op: "clip",
                dtype: self.dtype,
            });
        }
        let element_dtype = if self.dtype == DType::List {
            DType::Float
        } else {
            self.dtype
        };
        let normalize = |bound: Option<Value>| -> Result<Option<Value>, ArrayError> {
            match bound {
                None => Ok(None),
                Some(Value::Float(f)) if f.is_nan() => Ok(None),
                Some(v) if v.is_undefined() => Ok(None),
                Some(v) if self.dtype == DType::Undefined || self.dtype == DType::List => {
                    Ok(Some(v))
                }
                Some(v) => Ok(Some(cast_value(v, element_dtype)?)),
            }
        };
        let lower = normalize(lower)?;
        let upper = normalize(upper)?;
        let clamp_scalar = move |v: &Value, lo: &Option<Value>, hi: &Option<Value>| {
            if v.is_missing() || !v.dtype().is_numeric() {
                return v.clone();
            }
            if let Some(lo) = lo
                && v.total_cmp(lo) == Ordering::Less
            {
                return lo.clone();
            }
            if let Some(hi) = hi
                && v.total_cmp(hi) == Ordering::Greater
            {
                return hi.clone();
            }
            v.clone()
        };
        let dtype = self.dtype;
        let handle = self.handle.map(move |v| match v {
            Value::List(xs) => Value::List(
                xs.iter()
                    .map(|x| clamp_scalar(x, &lower, &upper))
                    .collect(),
            ),
            other => clamp_scalar(other, &lower, &upper),
        });
        Ok(Self::with(dtype, handle))
    }

    /// Clamp from below only.
    pub fn clip_lower(&self, lower: Value) -> Result<XArray, ArrayError> {
        self.clip(Some(lower), None)
    }

    /// Clamp from above only.
    pub fn clip_upper(&self, upper: Value) -> Result<XArray, ArrayError> {
        self.clip(None, Some(upper))
    }

    // ---- aggregates ----

    /// Sum of present elements; `None` when nothing is present. Exact
    /// (integer) arithmetic for int and bool arrays.
    pub fn sum(&self) -> Result<Option<Value>, ArrayError> {
        self.require_numeric("sum")?;
        match self.dtype {
            DType::Float => {
                let (s, n) = self.handle.aggregate(
                    (0.0f64, 0u64),
                    |(s, n), v| match v {
                        Value::Float(f) if !f.is_nan() => (s + f, n + 1),
                        _ => (s, n),
                    },
                    |a, b| (a.0 + b.0, a.1 + b.1),
                )?;
                Ok((n > 0).then_some(Value::Float(s)))
            }
            DType::Int | DType::Bool => {
                let (s, n) = self.handle.aggregate(
                    (0i64, 0u64),
                    |(s, n), v| match int_view(v) {
                        Some(i) => (s.wrapping_add(i), n + 1),
                        None => (s, n),
                    },
                    |a, b| (a.0.wrapping_add(b.0), a.1 + b.1),
                )?;
                Ok((n > 0).then_some(Value::Int(s)))
            }
            _ => Ok(None),
        }
    }

    /// Arithmetic mean of present elements.
    pub fn mean(&self) -> Result<Option<f64>, ArrayError> {
        self.require_numeric("mean")?;
        Ok(self.sketch_summary()?.mean())
    }

    /// Population variance of present elements.
    pub fn var(&self) -> Result<Option<f64>, ArrayError> {
        self.require_numeric("var")?;
        Ok(self.sketch_summary()?.var())
    }

    /// Population standard deviation of present elements.
    pub fn std(&self) -> Result<Option<f64>, ArrayError> {
        self.require_numeric("std")?;
        Ok(self.sketch_summary()?.std())
    }

    /// Smallest present element.
    pub fn min(&self) -> Result<Option<Value>, ArrayError> {
        self.require_numeric("min")?;
        Ok(self.sketch_summary()?.min().cloned())
    }

    /// Largest present element.
    pub fn max(&self) -> Result<Option<Value>, ArrayError> {
        self.require_numeric("max")?;
        Ok(self.sketch_summary()?.max().cloned())
    }

    /// True when every element is truthy; vacuously true on empty input.
    pub fn all(&self) -> Result<bool, ArrayError> {
        Ok(self
            .handle
            .aggregate(true, |acc, v| acc && v.is_truthy(), |a, b| a && b)?)
    }

    /// True when any element is truthy; false on empty input.
    pub fn any(&self) -> Result<bool, ArrayError> {
        Ok(self
            .handle
            .aggregate(false, |acc, v| acc || v.is_truthy(), |a, b| a || b)?)
    }

    /// One-pass statistical summary (count, extrema, moments, distinct
    /// estimate, heavy hitters).
    pub fn sketch_summary(&self) -> Result<Sketch, ArrayError> {
        Ok(Sketch::from_handle(&self.handle)?)
    }

    // ---- sized elements ----

    /// Length of each element: characters for strings, members for lists
    /// and dicts. Missing in, missing out.
    pub fn item_length(&self) -> Result<XArray, ArrayError> {
        if !self.dtype.is_sized() && self.dtype != DType::Undefined {
            return Err(ArrayError::UnsupportedDType {
                op: "item_length",
                dtype: self.dtype,
            });
        }
        let handle = self.handle.map(|v| match v {
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            Value::List(xs) => Value::Int(xs.len() as i64),
            Value::Dict(d) => Value::Int(d.len() as i64),
            _ => Value::Undefined,
        });
        Ok(Self::with(DType::Int, handle))
    }

    /// Project `[start, end)` out of each list row. A single-position
    /// projection yields the bare element; rows too short yield
    /// `Undefined`.
    pub fn vector_slice(&self, start: usize, end: usize) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::List, "vector_slice")?;
        if end <= start {
            return Err(ArrayError::Value(format!(
                "vector_slice bounds [{start}, {end}) select nothing"
            )));
        }
        let single = end - start == 1;
        let project = move |v: &Value| match v {
            Value::List(xs) if xs.len() >= end => {
                if single {
                    xs[start].clone()
                } else {
                    Value::List(xs[start..end].to_vec())
                }
            }
            _ => Value::Undefined,
        };
        let dtype = if single {
            let head = self.handle.take(INFERENCE_PREFIX)?;
            let outs: Vec<Value> = head.iter().map(project).collect();
            infer_dtype(&outs)
        } else {
            DType::List
        };
        Ok(Self::with(dtype, self.handle.map(project)))
    }

    // ---- dict arrays ----

    /// Keep (or with `exclude`, remove) the named keys in each dict row.
    pub fn dict_trim_by_keys(
        &self,
        keys: &[String],
        exclude: bool,
    ) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::Dict, "dict_trim_by_keys")?;
        let keys: HashSet<String> = keys.iter().cloned().collect();
        let handle = self.handle.map(move |v| match v {
            Value::Dict(d) => Value::Dict(
                d.iter()
                    .filter(|(k, _)| keys.contains(*k) != exclude)
                    .map(|(k, x)| (k.clone(), x.clone()))
                    .collect(),
            ),
            other => other.clone(),
        });
        Ok(Self::with(DType::Dict, handle))
    }

    /// Keep dict entries whose values fall in `[lower, upper]` under the
    /// total element order.
    pub fn dict_trim_by_values(
        &self,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::Dict, "dict_trim_by_values")?;
        let in_range = move |x: &Value| {
            if let Some(lo) = &lower
                && x.total_cmp(lo) == Ordering::Less
            {
                return false;
            }
            if let Some(hi) = &upper
                && x.total_cmp(hi) == Ordering::Greater
            {
                return false;
            }
            true
        };
        let handle = self.handle.map(move |v| match v {
            Value::Dict(d) => Value::Dict(
                d.iter()
                    .filter(|(_, x)| in_range(*x))
                    .map(|(k, x)| (k.clone(), x.clone()))
                    .collect(),
            ),
            other => other.clone(),
        });
        Ok(Self::with(DType::Dict, handle))
    }

    /// Truthy when a dict row contains at least one of `keys`.
    pub fn dict_has_any_keys(&self, keys: &[String]) -> Result<XArray, ArrayError> {
        self.dict_key_test(keys, false)
    }

    /// Truthy when a dict row contains every one of `keys`.
    pub fn dict_has_all_keys(&self, keys: &[String]) -> Result<XArray, ArrayError> {
        self.dict_key_test(keys, true)
    }

    fn dict_key_test(&self, keys: &[String], all: bool) -> Result<XArray, ArrayError> {
        self.require_dtype(DType::Dict, "dict key test")?;
        let keys = keys.to_vec();
        let handle = self.handle.map(move |v| match v {
            Value::Dict(d) => {
                let hit = if all {
                    keys.iter().all(|k| d.contains_key(k))
                } else {
                    keys.iter().any(|k| d.contains_key(k))
                };
                Value::Bool(hit)
            }
            _ => Value::Undefined,
        });
        Ok(Self::with(DType::Bool, handle))
    }

    /// Spread each dict row's keys across columns. Every row must carry
    /// the same number of keys; keys appear in their sorted dict order.
    pub fn dict_keys(&self) -> Result<Frame, ArrayError> {
        self.dict_component(true)
    }

    /// Spread each dict row's values across columns, in key order.
    pub fn dict_values(&self) -> Result<Frame, ArrayError> {
        self.dict_component(false)
    }

    fn dict_component(&self, keys: bool) -> Result<Frame, ArrayError> {
        self.require_dtype(DType::Dict, "dict_keys")?;
        let lists = self.handle.try_map(move |v| match v {
            Value::Dict(d) => Ok(Value::List(if keys {
                d.keys().map(|k| Value::Str(k.clone())).collect()
            } else {
                d.values().cloned().collect()
            })),
            _ => Err(EngineError::UndefinedElement),
        });
        let as_lists = Self::with(DType::List, lists);
        let mut widths = BTreeSet::new();
        for row in as_lists.collect()? {
            if let Value::List(xs) = row {
                widths.insert(xs.len());
            }
        }
        if widths.len() > 1 {
            return Err(ArrayError::Value(
                "dict rows carry differing numbers of keys".into(),
            ));
        }
        as_lists.unpack(Some("X"), None, None, &Value::Undefined)
    }

    // ---- unpack ----

    /// Spread list positions or dict keys into the columns of a
    /// [`Frame`].
    ///
    /// `column_name_prefix`: `None` names columns by the bare key;
    /// `Some(p)` (including the empty string) names them `p.key`.
    /// `limit` selects which positions/keys to take; absent, they are
    /// discovered from a leading sample. `column_types` overrides per-column
    /// inference and must match `limit` in length when both are given.
    /// Elements missing from a row are filled with `na_value`.
    pub fn unpack(
        &self,
        column_name_prefix: Option<&str>,
        limit: Option<&[UnpackKey]>,
        column_types: Option<&[DType]>,
        na_value: &Value,
    ) -> Result<Frame, ArrayError> {
        if !matches!(self.dtype, DType::List | DType::Dict) {
            return Err(ArrayError::UnsupportedDType {
                op: "unpack",
                dtype: self.dtype,
            });
        }
        if let Some(lim) = limit {
            let distinct: HashSet<&UnpackKey> = lim.iter().collect();
            if distinct.len() != lim.len() {
                return Err(ArrayError::Value("limit contains duplicate keys".into()));
            }
            let kind_ok = lim.iter().all(|k| match self.dtype {
                DType::List => matches!(k, UnpackKey::Pos(_)),
                _ => matches!(k, UnpackKey::Key(_)),
            });
            if !kind_ok {
                return Err(ArrayError::Type(TypeError::Unsupported {
                    op: "unpack limit",
                    dtype: self.dtype,
                }));
            }
            if let Some(types) = column_types
                && types.len() != lim.len()
            {
                return Err(ArrayError::Value(format!(
                    "limit names {} columns but column_types has {}",
                    lim.len(),
                    types.len()
                )));
            }
        } else if self.dtype == DType::Dict && column_types.is_some() {
            return Err(ArrayError::Value(
                "unpacking a dict array with column_types requires limit".into(),
            ));
        }
        let sample = self.handle.take(INFERENCE_PREFIX)?;
        let keys: Vec<UnpackKey> = match limit {
            Some(l) => l.to_vec(),
            None => match self.dtype {
                DType::List => {
                    let width = column_types.map_or_else(
                        || {
                            sample
                                .iter()
                                .filter_map(|v| match v {
                                    Value::List(xs) => Some(xs.len()),
                                    _ => None,
                                })
                                .max()
                                .unwrap_or(0)
                        },
                        <[DType]>::len,
                    );
                    if width == 0 {
                        return Err(ArrayError::Runtime(
                            "cannot infer the unpacked shape from empty input".into(),
                        ));
                    }
                    (0..width).map(UnpackKey::Pos).collect()
                }
                _ => {
                    let mut all_keys: BTreeSet<String> = BTreeSet::new();
                    for v in &sample {
                        if let Value::Dict(d) = v {
                            all_keys.extend(d.keys().cloned());
                        }
                    }
                    if all_keys.is_empty() {
                        return Err(ArrayError::Runtime(
                            "cannot infer the unpacked shape from empty input".into(),
                        ));
                    }
                    all_keys.into_iter().map(UnpackKey::Key).collect()
                }
            },
        };
        let types: Vec<DType> = match column_types {
            Some(t) => t.to_vec(),
            None => keys
                .iter()
                .map(|k| {
                    let outs: Vec<Value> =
                        sample.iter().filter_map(|row| k.extract(row)).collect();
                    infer_dtype(&outs)
                })
                .collect(),
        };
        debug!("unpack: {} columns from a {} array", keys.len(), self.dtype);
        let mut columns = Vec::with_capacity(keys.len());
        for (key, ty) in keys.iter().zip(types.iter()) {
            let name = match column_name_prefix {
                None => key.column_suffix(),
                Some(p) => format!("{p}.{}", key.column_suffix()),
            };
            let (key, ty, na) = (key.clone(), *ty, na_value.clone());
            let handle = self.handle.try_map(move |row| {
                let v = key.extract(row).unwrap_or_else(|| na.clone());
                if ty == DType::Undefined {
                    Ok(v)
                } else {
                    cast_value(v, ty).map_err(EngineError::from)
                }
            });
            columns.push((name, Self::with(ty, handle)));
        }
        Frame::new(columns)
    }
}

fn cast_chain(handle: &Handle<Value>, dtype: DType, ignore_cast_failure: bool) -> Handle<Value> {
    if dtype == DType::Undefined {
        return handle.clone();
    }
    handle.try_map(move |v| match cast_value(v.clone(), dtype) {
        Ok(v) => Ok(v),
        Err(_) if ignore_cast_failure => Ok(Value::Undefined),
        Err(e) => Err(e.into()),
    })
}

fn compare_values(l: &Value, r: &Value, op: ComparisonOp) -> Value {
    if l.is_missing() || r.is_missing() {
        return Value::Undefined;
    }
    Value::Bool(op.accepts(l.total_cmp(r)))
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let pos = if index < 0 { index + len } else { index };
    (0..len).contains(&pos).then_some(pos as usize)
}

impl fmt::Display for XArray {
    /// Renders the dtype, the row count, and up to the first 100 elements.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dtype: {}", self.dtype)?;
        let len = match self.len() {
            Ok(n) => n,
            Err(e) => return write!(f, "[materialization failed: {e}]"),
        };
        writeln!(f, "Rows: {len}")?;
        let head = self.handle.take(100).map_err(|_| fmt::Error)?;
        write!(f, "[")?;
        for (i, v) in head.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                Value::Str(s) => write!(f, "{s:?}")?,
                other => write!(f, "{}", render_value(other))?,
            }
        }
        if len > 100 {
            write!(f, ", ... ]")
        } else {
            write!(f, "]")
        }
    }
}

/// An ordered set of equal-length named columns, produced by the
/// unpacking operations.
#[derive(Debug, Clone)]
pub struct Frame {
    columns: Vec<(String, XArray)>,
}

impl Frame {
    /// Column names must be distinct.
    pub fn new(columns: Vec<(String, XArray)>) -> Result<Frame, ArrayError> {
        let mut seen = HashSet::new();
        for (name, _) in &columns {
            if !seen.insert(name.as_str()) {
                return Err(ArrayError::Value(format!("duplicate column name {name:?}")));
            }
        }
        Ok(Frame { columns })
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&XArray> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    #[must_use]
    pub fn columns(&self) -> &[(String, XArray)] {
        &self.columns
    }

    pub fn num_rows(&self) -> Result<usize, ArrayError> {
        match self.columns.first() {
            Some((_, col)) => col.len(),
            None => Ok(0),
        }
    }
}
