// Variable store - typed variables scoped to one instance

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::models::{Value, VarType, Variable, VariableSource};
use crate::{Result, ThresherError};

/// Per-instance variable store
///
/// Backed by a `DashMap`, so tracks read and write concurrently without an
/// instance-wide lock; each variable's mutation is serialized by its shard.
/// A name keeps the type it was created with for the life of the instance.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: DashMap<String, Variable>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `var` unless it exists
    ///
    /// Re-declaring an existing name with the same type keeps the stored
    /// value and succeeds. A different type is a `TypeMismatch`.
    pub fn new_var(&self, var: Variable) -> Result<()> {
        if var.name.is_empty() {
            return Err(ThresherError::structural("variable without a name"));
        }
        match self.vars.entry(var.name.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.var_type() != var.var_type() {
                    return Err(ThresherError::TypeMismatch {
                        name: var.name.clone(),
                        expected: existing.var_type().to_string(),
                        actual: var.var_type().to_string(),
                    });
                }
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(var);
                Ok(())
            }
        }
    }

    /// Copy of the named variable
    pub fn get(&self, name: &str) -> Result<Variable> {
        self.vars
            .get(name)
            .map(|v| v.value().clone())
            .ok_or_else(|| ThresherError::VariableNotFound(name.to_string()))
    }

    /// Read the named variable coerced to `ty`
    pub fn get_as(&self, name: &str, ty: VarType) -> Result<Value> {
        self.get(name)?.read_as(ty)
    }

    /// Replace the value of an existing variable; the type must match
    pub fn update<V: Into<Value>>(&self, name: &str, value: V) -> Result<()> {
        let mut var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| ThresherError::VariableNotFound(name.to_string()))?;
        var.update(value)
    }

    /// Create or overwrite; an existing variable must keep its type
    pub fn put(&self, var: Variable) -> Result<()> {
        match self.vars.entry(var.name.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().var_type() != var.var_type() {
                    return Err(ThresherError::TypeMismatch {
                        name: var.name.clone(),
                        expected: existing.get().var_type().to_string(),
                        actual: var.var_type().to_string(),
                    });
                }
                existing.insert(var);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(var);
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy of every variable, sorted by name
    pub fn snapshot(&self) -> Vec<Variable> {
        let mut out: Vec<Variable> = self.vars.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl VariableSource for VarStore {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.vars.get(name).map(|v| v.value().value().clone())
    }
}
