//! User function registry
//!
//! Functions are registered under the name used in the workflow file, with a
//! signature matching the role they play. One name may carry one function per
//! role, so the same name can sit before one `foreach` and after another.
//! Compilation checks every reference against this table.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::plan::{FunctionUse, Plan};
use crate::errors::CompileError;
use crate::types::Role;

pub type CallFn = Arc<dyn Fn(JsonValue) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type FanOutFn =
    Arc<dyn Fn(JsonValue) -> anyhow::Result<(JsonValue, Vec<JsonValue>)> + Send + Sync>;
pub type ReduceFn =
    Arc<dyn Fn(JsonValue, Vec<JsonValue>) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type IterationFn = Arc<dyn Fn(JsonValue, JsonValue) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ConditionFn = Arc<dyn Fn(&JsonValue) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Clone)]
pub enum UserFunction {
    Call(CallFn),
    FanOut(FanOutFn),
    Reduce(ReduceFn),
    Iteration(IterationFn),
    Condition(ConditionFn),
}

impl UserFunction {
    pub fn role(&self) -> Role {
        match self {
            UserFunction::Call(_) => Role::Call,
            UserFunction::FanOut(_) => Role::FanOut,
            UserFunction::Reduce(_) => Role::Reduce,
            UserFunction::Iteration(_) => Role::Iteration,
            UserFunction::Condition(_) => Role::Condition,
        }
    }
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserFunction({})", self.role())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<(String, Role), UserFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain step function: `f(result) -> result`
    pub fn call<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JsonValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.insert(name, UserFunction::Call(Arc::new(f)))
    }

    /// Register a function that precedes a `foreach`: `f(result) -> (result, keys)`
    pub fn fan_out<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JsonValue) -> anyhow::Result<(JsonValue, Vec<JsonValue>)> + Send + Sync + 'static,
    {
        self.insert(name, UserFunction::FanOut(Arc::new(f)))
    }

    /// Register a function that follows a `foreach`: `f(result, values) -> result`
    pub fn reduce<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JsonValue, Vec<JsonValue>) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.insert(name, UserFunction::Reduce(Arc::new(f)))
    }

    /// Register a `foreach` function: `f(result, key) -> value`
    pub fn iteration<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JsonValue, JsonValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.insert(name, UserFunction::Iteration(Arc::new(f)))
    }

    /// Register a `wait N until` condition: `f(result) -> bool`
    pub fn condition<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JsonValue) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.insert(name, UserFunction::Condition(Arc::new(f)))
    }

    /// Add or replace the function `name` has in `function`'s role
    pub fn insert(mut self, name: impl Into<String>, function: UserFunction) -> Self {
        self.functions.insert((name.into(), function.role()), function);
        self
    }

    pub fn get(&self, name: &str, role: Role) -> Option<&UserFunction> {
        self.functions.get(&(name.to_string(), role))
    }

    /// Roles registered under `name`
    pub fn roles(&self, name: &str) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .functions
            .keys()
            .filter(|(registered, _)| registered == name)
            .map(|(_, role)| *role)
            .collect();
        roles.sort_by_key(|role| role.to_string());
        roles
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Placeholder implementations for every function a plan needs
    ///
    /// Calls and reduces return the result unchanged, fan-outs produce no
    /// keys, iterations return their key and conditions are always met.
    pub fn stubs(plan: &Plan) -> Self {
        plan.required_functions()
            .into_iter()
            .fold(Self::new(), |registry, function| {
                let stub = match function.role {
                    Role::Call => UserFunction::Call(Arc::new(stub_call)),
                    Role::FanOut => UserFunction::FanOut(Arc::new(stub_fan_out)),
                    Role::Reduce => UserFunction::Reduce(Arc::new(stub_reduce)),
                    Role::Iteration => UserFunction::Iteration(Arc::new(stub_iteration)),
                    Role::Condition => UserFunction::Condition(Arc::new(stub_condition)),
                };
                registry.insert(function.name, stub)
            })
    }

    /// Resolve a reference, checking the registered signature
    pub(crate) fn resolve(
        &self,
        function: &FunctionUse,
        step: &str,
    ) -> Result<UserFunction, CompileError> {
        if let Some(found) = self.get(&function.name, function.role) {
            return Ok(found.clone());
        }

        match self.roles(&function.name).first() {
            Some(registered) => Err(CompileError::SignatureMismatch {
                name: function.name.clone(),
                step: step.to_string(),
                expected: function.role,
                registered: *registered,
            }),
            None => Err(CompileError::UnknownFunction {
                name: function.name.clone(),
                role: function.role,
                step: step.to_string(),
            }),
        }
    }
}

/* ===================== Stubs ===================== */

fn stub_call(result: JsonValue) -> anyhow::Result<JsonValue> {
    Ok(result)
}

fn stub_fan_out(result: JsonValue) -> anyhow::Result<(JsonValue, Vec<JsonValue>)> {
    Ok((result, Vec::new()))
}

fn stub_reduce(result: JsonValue, _values: Vec<JsonValue>) -> anyhow::Result<JsonValue> {
    Ok(result)
}

fn stub_iteration(_result: JsonValue, key: JsonValue) -> anyhow::Result<JsonValue> {
    Ok(key)
}

fn stub_condition(_result: &JsonValue) -> anyhow::Result<bool> {
    Ok(true)
}
