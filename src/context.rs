//! Matching context: the DOM under construction plus the scope chain that
//! expressions resolve names against.

use crate::ruler::{MatchError, Program};
use crate::value::Value;
use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::Arc;

/// DOM of one context. The tag is fixed by the first write.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Dom {
    #[default]
    Empty,
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Dom {
    pub fn to_value(&self) -> Value {
        match self {
            Dom::Empty => Value::Nil,
            Dom::List(v) => Value::List(v.clone()),
            Dom::Map(m) => Value::Map(m.clone()),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Dom::Empty => Value::Nil,
            Dom::List(v) => Value::List(v),
            Dom::Map(m) => Value::Map(m),
        }
    }
}

/// State shared by every context of one match.
struct Shared {
    globals: RefCell<BTreeMap<String, Value>>,
    stack: RefCell<Vec<Value>>,
    program: RefCell<Arc<Program>>,
    dumper: RefCell<Box<dyn Write>>,
}

/// One node of the context tree. Children borrow their parent, so the tree
/// lives on the call stack and is discarded when the match returns.
pub struct Context<'p> {
    dom: Dom,
    parent: Option<&'p Context<'p>>,
    shared: Rc<Shared>,
}

impl Context<'static> {
    pub fn new() -> Self {
        Context {
            dom: Dom::Empty,
            parent: None,
            shared: Rc::new(Shared {
                globals: RefCell::new(BTreeMap::new()),
                stack: RefCell::new(Vec::new()),
                program: RefCell::new(Arc::new(Program::default())),
                dumper: RefCell::new(Box::new(io::stderr())),
            }),
        }
    }
}

impl Default for Context<'static> {
    fn default() -> Self {
        Context::new()
    }
}

impl<'p> Context<'p> {
    /// Fresh sub-context; shares globals, stack, program and dumper.
    pub fn child(&self) -> Context<'_> {
        Context {
            dom: Dom::Empty,
            parent: Some(self),
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn parent(&self) -> Option<&Context<'p>> {
        self.parent
    }

    /// The context a member's enclosing struct or array lives in.
    pub fn enclosing(&self) -> &Context<'p> {
        match self.parent {
            Some(p) => p,
            None => self,
        }
    }

    pub fn dom(&self) -> Value {
        self.dom.to_value()
    }

    pub fn dom_ref(&self) -> &Dom {
        &self.dom
    }

    pub fn into_dom(self) -> Value {
        self.dom.into_value()
    }

    /// Assign the whole DOM at once; only allowed while it is still empty.
    pub fn set_dom(&mut self, v: Value) -> Result<(), MatchError> {
        if self.dom != Dom::Empty {
            return Err(MatchError::DomAssigned);
        }
        self.dom = match v {
            Value::List(items) => Dom::List(items),
            Value::Map(m) => Dom::Map(m),
            _ => return Err(MatchError::DomType { expected: "list or map" }),
        };
        Ok(())
    }

    pub fn require_map(&mut self) -> Result<&mut BTreeMap<String, Value>, MatchError> {
        if self.dom == Dom::Empty {
            self.dom = Dom::Map(BTreeMap::new());
        }
        match &mut self.dom {
            Dom::Map(m) => Ok(m),
            _ => Err(MatchError::DomType { expected: "map" }),
        }
    }

    pub fn require_list(&mut self) -> Result<&mut Vec<Value>, MatchError> {
        if self.dom == Dom::Empty {
            self.dom = Dom::List(Vec::new());
        }
        match &mut self.dom {
            Dom::List(v) => Ok(v),
            _ => Err(MatchError::DomType { expected: "list" }),
        }
    }

    pub fn push(&mut self, v: Value) -> Result<(), MatchError> {
        self.require_list()?.push(v);
        Ok(())
    }

    /// Bind a member name once. Rebinding, or shadowing a global, fails.
    pub fn bind(&mut self, name: &str, v: Value) -> Result<(), MatchError> {
        if self.shared.globals.borrow().contains_key(name) {
            return Err(MatchError::VarExists(name.to_string()));
        }
        let map = self.require_map()?;
        if map.contains_key(name) {
            return Err(MatchError::VarExists(name.to_string()));
        }
        map.insert(name.to_string(), v);
        Ok(())
    }

    /// `let`: overwrite a local, or update the global of that name.
    pub fn let_var(&mut self, name: &str, v: Value) -> Result<(), MatchError> {
        {
            let mut globals = self.shared.globals.borrow_mut();
            if let Some(slot) = globals.get_mut(name) {
                *slot = v;
                return Ok(());
            }
        }
        self.require_map()?.insert(name.to_string(), v);
        Ok(())
    }

    pub fn set_global(&self, name: &str, v: Value) {
        self.shared.globals.borrow_mut().insert(name.to_string(), v);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.shared.globals.borrow().get(name).cloned()
    }

    /// Resolve a name: this context's map, then each ancestor's, then globals.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut cur = Some(self);
        while let Some(c) = cur {
            if let Dom::Map(m) = &c.dom {
                if let Some(v) = m.get(name) {
                    return Some(v.clone());
                }
            }
            cur = c.parent;
        }
        self.global(name)
    }

    pub fn set_dumper(&self, w: Box<dyn Write>) {
        *self.shared.dumper.borrow_mut() = w;
    }

    pub fn write_dump(&self, text: &str) -> io::Result<()> {
        let mut w = self.shared.dumper.borrow_mut();
        w.write_all(text.as_bytes())?;
        w.flush()
    }

    pub fn set_program(&self, program: Arc<Program>) {
        *self.shared.program.borrow_mut() = program;
    }

    pub fn program(&self) -> Arc<Program> {
        Arc::clone(&self.shared.program.borrow())
    }

    pub(crate) fn stack(&self) -> RefMut<'_, Vec<Value>> {
        self.shared.stack.borrow_mut()
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dom", &self.dom)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
