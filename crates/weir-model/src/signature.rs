//! Pipe signatures and argument binding.
//!
//! A call site supplies positional and keyword arguments; binding
//! normalizes them against the pipe's declared parameters so that two
//! calls meaning the same thing always produce the same ordered argument
//! list. This normalization is what the fingerprint hashes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::id::{FileId, ResourceId, VirtualId};
use crate::value::Value;

/// One argument at a call site: a literal value or a reference to a node
/// in the provenance graph. `Virtual` arguments are only legal inside a
/// batch and are replaced by concrete references before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    Value(Value),
    Resource(ResourceId),
    File(FileId),
    Virtual(VirtualId),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

macro_rules! argument_from_value {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Argument {
            fn from(value: $ty) -> Self {
                Argument::Value(value.into())
            }
        })+
    };
}

argument_from_value!(bool, i32, i64, f64, &str, String);

impl From<&ResourceId> for Argument {
    fn from(id: &ResourceId) -> Self {
        Argument::Resource(id.clone())
    }
}

impl From<&FileId> for Argument {
    fn from(id: &FileId) -> Self {
        Argument::File(id.clone())
    }
}

/// A declared parameter: a name and an optional default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    /// A required parameter.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// A parameter with a declared default.
    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

/// The argument schema of a pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    params: Vec<Param>,
    variadic: bool,
}

impl Signature {
    pub fn new(params: Vec<Param>) -> Self {
        Self {
            params,
            variadic: false,
        }
    }

    /// Convenience constructor for a list of required parameters.
    pub fn positional(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| Param::required(*n)).collect())
    }

    /// Allow extra positional arguments beyond the declared parameters;
    /// they are collected, in order, after the declared slots.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Bind positional and keyword arguments against this signature.
    ///
    /// Positional arguments fill declared parameters in order, keyword
    /// arguments fill by name, unfilled parameters take their defaults.
    /// The result is a single ordered list: declared parameters first,
    /// then the variadic tail.
    pub fn bind(
        &self,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Result<BoundArgs> {
        let declared = self.params.len();
        if args.len() > declared && !self.variadic {
            return Err(ModelError::TooManyArguments {
                declared,
                got: args.len(),
            });
        }

        let mut slots: Vec<Option<Argument>> = vec![None; declared];
        let mut tail = Vec::new();
        let positional = args.len().min(declared);
        let mut args = args.into_iter();
        for slot in slots.iter_mut().take(positional) {
            *slot = args.next();
        }
        tail.extend(args);

        for (name, value) in kwargs {
            let index = self
                .params
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| ModelError::UnknownParameter(name.clone()))?;
            if slots[index].is_some() {
                return Err(ModelError::DuplicateArgument(name));
            }
            slots[index] = Some(value);
        }

        let mut values = Vec::with_capacity(declared + tail.len());
        for (slot, param) in slots.into_iter().zip(&self.params) {
            match slot {
                Some(value) => values.push(value),
                None => match &param.default {
                    Some(default) => values.push(Argument::Value(default.clone())),
                    None => return Err(ModelError::MissingArgument(param.name.clone())),
                },
            }
        }
        values.extend(tail);

        Ok(BoundArgs { values })
    }
}

/// Arguments after normalization: one entry per declared parameter, in
/// declaration order, followed by any variadic tail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundArgs {
    pub values: Vec<Argument>,
}

impl BoundArgs {
    /// Ids of every virtual resource referenced by these arguments.
    pub fn virtual_refs(&self) -> Vec<&VirtualId> {
        self.values
            .iter()
            .filter_map(|a| match a {
                Argument::Virtual(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}
