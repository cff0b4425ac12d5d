//! Typed option registry.
//!
//! Components declare their options in a [`Schema`] (name, type,
//! default, and for string options an allowed set).  Callers collect
//! settings in an [`Options`] value; every setting is checked against
//! the schema when it is made, so misspelt names, wrong types and
//! unknown enum strings fail before any numerical work starts.  Reads
//! fall back to the declared default when a key was never set.

use std::collections::BTreeMap;
use crate::{Error, Result};

/// A dynamically typed option value.
#[derive(Clone, Debug, PartialEq)]
pub enum OptValue {
    Int(i64),
    Real(f64),
    Bool(bool),
    Str(String),
    RealVec(Vec<f64>),
    IntVec(Vec<i64>),
    Dict(BTreeMap<String, OptValue>),
}

impl OptValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptValue::Int(_) => "int",
            OptValue::Real(_) => "real",
            OptValue::Bool(_) => "bool",
            OptValue::Str(_) => "string",
            OptValue::RealVec(_) => "[real]",
            OptValue::IntVec(_) => "[int]",
            OptValue::Dict(_) => "dict",
        }
    }
}

/// Types an option can be declared with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptType { Int, Real, Bool, Str, RealVec, IntVec, Dict }

impl OptType {
    fn name(self) -> &'static str {
        match self {
            OptType::Int => "int",
            OptType::Real => "real",
            OptType::Bool => "bool",
            OptType::Str => "string",
            OptType::RealVec => "[real]",
            OptType::IntVec => "[int]",
            OptType::Dict => "dict",
        }
    }

    fn admits(self, v: &OptValue) -> bool {
        matches!((self, v),
                 (OptType::Int, OptValue::Int(_))
                 | (OptType::Real, OptValue::Real(_))
                 // Integers promote to reals, as in hand-written input.
                 | (OptType::Real, OptValue::Int(_))
                 | (OptType::Bool, OptValue::Bool(_))
                 | (OptType::Str, OptValue::Str(_))
                 | (OptType::RealVec, OptValue::RealVec(_))
                 | (OptType::IntVec, OptValue::IntVec(_))
                 | (OptType::Dict, OptValue::Dict(_)))
    }
}

#[derive(Clone, Debug)]
struct Decl {
    ty: OptType,
    default: Option<OptValue>,
    allowed: Option<Vec<&'static str>>,
}

/// The set of options a component understands.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    decls: BTreeMap<String, Decl>,
}

impl Schema {
    pub fn new() -> Self { Schema::default() }

    /// Declare an option.  `default: None` makes it optional with no
    /// fallback value.
    pub fn declare(mut self, name: &str, ty: OptType,
                   default: impl Into<Option<OptValue>>) -> Self {
        self.decls.insert(name.to_string(),
                          Decl { ty, default: default.into(), allowed: None });
        self
    }

    /// Declare a string option restricted to `allowed`.
    pub fn declare_enum(mut self, name: &str, default: &str,
                        allowed: &[&'static str]) -> Self {
        debug_assert!(allowed.contains(&default));
        self.decls.insert(name.to_string(), Decl {
            ty: OptType::Str,
            default: Some(OptValue::Str(default.to_string())),
            allowed: Some(allowed.to_vec()),
        });
        self
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.decls.contains_key(name)
    }

    /// Declared option names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.decls.keys().map(|k| k.as_str())
    }

    /// The options understood by [`crate::Integrator`].
    pub fn integrator() -> Schema {
        Schema::new()
            .declare("max_num_steps", OptType::Int, OptValue::Int(10_000))
            .declare("reltol", OptType::Real, OptValue::Real(1e-6))
            .declare("abstol", OptType::Real, OptValue::Real(1e-8))
            .declare("exact_jacobian", OptType::Bool, OptValue::Bool(false))
            .declare("upper_bandwidth", OptType::Int, None)
            .declare("lower_bandwidth", OptType::Int, None)
            .declare_enum("linear_solver", "dense",
                          &["user_defined", "dense", "banded", "iterative"])
            .declare_enum("iterative_solver", "gmres",
                          &["gmres", "bcgstab", "tfqmr"])
            .declare_enum("pretype", "none", &["none", "left", "right", "both"])
            .declare("max_krylov", OptType::Int, OptValue::Int(10))
            .declare("use_preconditioner", OptType::Bool, OptValue::Bool(false))
            .declare("linear_solver_options", OptType::Dict, None)
            .declare("max_multistep_order", OptType::Int, OptValue::Int(5))
            .declare("stop_at_end", OptType::Bool, OptValue::Bool(false))
            .declare("quad_err_con", OptType::Bool, OptValue::Bool(false))
            .declare_enum("sensitivity_method", "simultaneous",
                          &["simultaneous", "staggered"])
            .declare("fsens_err_con", OptType::Bool, OptValue::Bool(true))
            .declare("finite_difference_fsens", OptType::Bool,
                     OptValue::Bool(false))
            // Unset sensitivity tolerances fall back to reltol/abstol.
            .declare("fsens_reltol", OptType::Real, None)
            .declare("fsens_abstol", OptType::Real, None)
            // Tuning knobs of the finite-difference sensitivity scheme;
            // accepted and recorded, the symbolic augmentation ignores
            // them.  The second name keeps its historical spelling.
            .declare("fsens_scaling_factors", OptType::RealVec, None)
            .declare("fsens_sensitiviy_parameters", OptType::IntVec, None)
            .declare("steps_per_checkpoint", OptType::Int, OptValue::Int(20))
            .declare_enum("interpolation_type", "hermite",
                          &["hermite", "polynomial"])
            .declare("asens_upper_bandwidth", OptType::Int, None)
            .declare("asens_lower_bandwidth", OptType::Int, None)
            .declare_enum("asens_linear_solver", "dense",
                          &["dense", "banded", "iterative"])
            .declare_enum("asens_iterative_solver", "gmres",
                          &["gmres", "bcgstab", "tfqmr"])
            .declare_enum("asens_pretype", "none",
                          &["none", "left", "right", "both"])
            .declare("asens_max_krylov", OptType::Int, OptValue::Int(10))
            .declare("asens_reltol", OptType::Real, None)
            .declare("asens_abstol", OptType::Real, None)
    }

    /// The options understood by the dense QR factorization.
    pub fn dense_qr() -> Schema {
        Schema::new()
            .declare("max_nrhs", OptType::Int, OptValue::Int(10))
    }
}

/// A validated collection of option settings against a fixed schema.
#[derive(Clone, Debug)]
pub struct Options {
    schema: Schema,
    set: BTreeMap<String, OptValue>,
}

impl Options {
    pub fn new(schema: Schema) -> Self {
        Options { schema, set: BTreeMap::new() }
    }

    fn decl(&self, name: &str) -> Result<&Decl> {
        self.schema.decls.get(name)
            .ok_or_else(|| Error::UnknownOption { name: name.to_string() })
    }

    /// Record a setting, checking name, type and (for restricted
    /// string options) the value against the schema.
    pub fn set(&mut self, name: &str, value: OptValue) -> Result<()> {
        let decl = self.decl(name)?;
        if !decl.ty.admits(&value) {
            return Err(Error::OptionTypeMismatch {
                name: name.to_string(),
                expected: decl.ty.name(),
                got: value.type_name(),
            })
        }
        if let (Some(allowed), OptValue::Str(s)) = (&decl.allowed, &value) {
            if !allowed.contains(&s.as_str()) {
                return Err(Error::InvalidEnumValue {
                    name: name.to_string(),
                    value: s.clone(),
                    allowed: allowed.join(", "),
                })
            }
        }
        // Promote now so readers never see an Int under a Real key.
        let value = match (decl.ty, value) {
            (OptType::Real, OptValue::Int(i)) => OptValue::Real(i as f64),
            (_, v) => v,
        };
        self.set.insert(name.to_string(), value);
        Ok(())
    }

    /// Chainable [`Self::set`].
    pub fn with(mut self, name: &str, value: OptValue) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// True if the option was explicitly set (defaults do not count).
    pub fn has_set(&self, name: &str) -> bool {
        self.set.contains_key(name)
    }

    pub fn schema(&self) -> &Schema { &self.schema }

    /// The effective value: the setting if present, the declared
    /// default otherwise.
    fn lookup(&self, name: &str) -> Result<Option<&OptValue>> {
        let decl = self.decl(name)?;
        Ok(self.set.get(name).or(decl.default.as_ref()))
    }

    fn require(&self, name: &str) -> Result<&OptValue> {
        self.lookup(name)?.ok_or_else(|| Error::InvalidOptionValue {
            name: name.to_string(),
            why: "not set and declared without a default".to_string(),
        })
    }

    fn mismatch(&self, name: &str, v: &OptValue, requested: &'static str)
                -> Error {
        Error::OptionTypeMismatch {
            name: name.to_string(),
            expected: requested,
            got: v.type_name(),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            OptValue::Int(i) => Ok(*i),
            v => Err(self.mismatch(name, v, "int")),
        }
    }

    pub fn int_opt(&self, name: &str) -> Result<Option<i64>> {
        match self.lookup(name)? {
            None => Ok(None),
            Some(OptValue::Int(i)) => Ok(Some(*i)),
            Some(v) => Err(self.mismatch(name, v, "int")),
        }
    }

    pub fn real(&self, name: &str) -> Result<f64> {
        match self.require(name)? {
            OptValue::Real(r) => Ok(*r),
            OptValue::Int(i) => Ok(*i as f64),
            v => Err(self.mismatch(name, v, "real")),
        }
    }

    pub fn real_opt(&self, name: &str) -> Result<Option<f64>> {
        match self.lookup(name)? {
            None => Ok(None),
            Some(OptValue::Real(r)) => Ok(Some(*r)),
            Some(OptValue::Int(i)) => Ok(Some(*i as f64)),
            Some(v) => Err(self.mismatch(name, v, "real")),
        }
    }

    pub fn boolean(&self, name: &str) -> Result<bool> {
        match self.require(name)? {
            OptValue::Bool(b) => Ok(*b),
            v => Err(self.mismatch(name, v, "bool")),
        }
    }

    pub fn string(&self, name: &str) -> Result<String> {
        match self.require(name)? {
            OptValue::Str(s) => Ok(s.clone()),
            v => Err(self.mismatch(name, v, "string")),
        }
    }

    pub fn dict_opt(&self, name: &str)
                    -> Result<Option<&BTreeMap<String, OptValue>>> {
        match self.lookup(name)? {
            None => Ok(None),
            Some(OptValue::Dict(d)) => Ok(Some(d)),
            Some(v) => Err(self.mismatch(name, v, "dict")),
        }
    }
}
