//! Guest environments: variable frames linked to a parent

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::values::Value;

/// Shared handle to an environment frame. Cloning shares the frame.
#[derive(Clone)]
pub struct Env(Rc<Frame>);

struct Frame {
    name: Option<String>,
    vars: RefCell<BTreeMap<String, Value>>,
    parent: Option<Env>,
}

impl Env {
    /// The outermost environment. It has no parent and never holds bindings.
    pub fn empty() -> Self {
        Env(Rc::new(Frame {
            name: Some("R_EmptyEnv".to_string()),
            vars: RefCell::new(BTreeMap::new()),
            parent: None,
        }))
    }

    pub fn named(name: &str, parent: &Env) -> Self {
        Env(Rc::new(Frame {
            name: Some(name.to_string()),
            vars: RefCell::new(BTreeMap::new()),
            parent: Some(parent.clone()),
        }))
    }

    pub fn child(parent: &Env) -> Self {
        Env(Rc::new(Frame {
            name: None,
            vars: RefCell::new(BTreeMap::new()),
            parent: Some(parent.clone()),
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn parent(&self) -> Option<&Env> {
        self.0.parent.as_ref()
    }

    pub fn is_empty_env(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the shared frame
    pub fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Binding in this frame only
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.0.vars.borrow().get(name).cloned()
    }

    /// Binding in this frame or any ancestor
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Some(value) = current.get_local(name) {
                return Some(value);
            }
            env = current.parent();
        }
        None
    }

    /// Function binding in this frame or any ancestor, skipping non-functions
    pub fn lookup_function(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Some(value) = current.get_local(name) {
                if value.is_function() {
                    return Some(value);
                }
            }
            env = current.parent();
        }
        None
    }

    pub fn set(&self, name: &str, value: Value) {
        self.0.vars.borrow_mut().insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.0.vars.borrow_mut().remove(name).is_some()
    }

    /// Sorted names bound in this frame
    pub fn names(&self) -> Vec<String> {
        self.0.vars.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.vars.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        // Values are dropped outside the borrow.
        let vars = std::mem::take(&mut *self.0.vars.borrow_mut());
        drop(vars);
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "<environment: {}>", name),
            None => write!(f, "<environment: {:p}>", Rc::as_ptr(&self.0)),
        }
    }
}
