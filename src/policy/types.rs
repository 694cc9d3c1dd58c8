//! Policy Types
//!
//! Bundles contain sections of promises; bodies are named attribute
//! blocks referenced by promises. Promises carry denormalized origin
//! information (bundle name, namespace, promise type, source location)
//! instead of parent pointers, so the graph stays acyclic and frames can
//! hold plain shared references.

use std::rc::Rc;

use crate::value::Value;

/// A complete, parsed policy.
#[derive(Debug, Default)]
pub struct Policy {
    pub bundles: Vec<Rc<Bundle>>,
    pub bodies: Vec<Rc<Body>>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bundle(&mut self, bundle: Bundle) -> Rc<Bundle> {
        let bundle = Rc::new(bundle);
        self.bundles.push(bundle.clone());
        bundle
    }

    pub fn add_body(&mut self, body: Body) -> Rc<Body> {
        let body = Rc::new(body);
        self.bodies.push(body.clone());
        body
    }
}

/// A named, argument-taking unit of policy containing promise sections.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub ns: String,
    pub name: String,
    /// Bundle type: `agent`, `common`, `edit_line`, `edit_xml`, ...
    pub bundle_type: String,
    /// Parameter names, zipped against caller arguments on push.
    pub args: Vec<String>,
    pub sections: Vec<Rc<BundleSection>>,
    pub source_path: Option<String>,
}

impl Bundle {
    pub fn new(ns: &str, name: &str, bundle_type: &str) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            bundle_type: bundle_type.to_string(),
            args: Vec::new(),
            sections: Vec::new(),
            source_path: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_path(mut self, path: &str) -> Self {
        self.source_path = Some(path.to_string());
        self
    }

    pub fn add_section(&mut self, section: BundleSection) -> Rc<BundleSection> {
        let section = Rc::new(section);
        self.sections.push(section.clone());
        section
    }
}

/// A promise-type section within a bundle.
#[derive(Debug, Clone)]
pub struct BundleSection {
    pub promise_type: String,
    pub promises: Vec<Rc<Promise>>,
}

impl BundleSection {
    pub fn new(promise_type: &str) -> Self {
        Self { promise_type: promise_type.to_string(), promises: Vec::new() }
    }

    pub fn add_promise(&mut self, promise: Promise) -> Rc<Promise> {
        let promise = Rc::new(promise);
        self.promises.push(promise.clone());
        promise
    }
}

/// A named, argument-taking block of attribute assignments.
#[derive(Debug, Clone)]
pub struct Body {
    pub ns: String,
    pub name: String,
    pub body_type: String,
    pub args: Vec<String>,
    pub constraints: Vec<Constraint>,
}

impl Body {
    pub fn new(ns: &str, name: &str, body_type: &str) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            body_type: body_type.to_string(),
            args: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn constraint(&self, lval: &str) -> Option<&Value> {
        self.constraints.iter().find(|c| c.lval == lval).map(|c| &c.rval)
    }
}

/// One attribute assignment on a promise or body.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub lval: String,
    pub rval: Value,
}

impl Constraint {
    pub fn new(lval: &str, rval: Value) -> Self {
        Self { lval: lval.to_string(), rval }
    }
}

/// A single declarative assertion tying a promiser to constraints.
#[derive(Debug, Clone)]
pub struct Promise {
    /// The subject of the promise.
    pub promiser: String,
    /// Intended beneficiary, a scalar or a list of scalars.
    pub promisee: Option<Value>,
    pub promise_type: String,
    /// Class context expression; empty means unconditional.
    pub classes: String,
    pub comment: Option<String>,
    pub constraints: Vec<Constraint>,
    pub bundle_ns: String,
    pub bundle_name: String,
    pub source_path: Option<String>,
    pub line: u64,
}

impl Promise {
    pub fn new(promiser: &str, promise_type: &str) -> Self {
        Self {
            promiser: promiser.to_string(),
            promisee: None,
            promise_type: promise_type.to_string(),
            classes: String::new(),
            comment: None,
            constraints: Vec::new(),
            bundle_ns: "default".to_string(),
            bundle_name: String::new(),
            source_path: None,
            line: 0,
        }
    }

    pub fn in_bundle(mut self, ns: &str, name: &str) -> Self {
        self.bundle_ns = ns.to_string();
        self.bundle_name = name.to_string();
        self
    }

    pub fn with_classes(mut self, classes: &str) -> Self {
        self.classes = classes.to_string();
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn with_promisee(mut self, promisee: Value) -> Self {
        self.promisee = Some(promisee);
        self
    }

    pub fn with_source(mut self, path: &str, line: u64) -> Self {
        self.source_path = Some(path.to_string());
        self.line = line;
        self
    }

    pub fn with_constraint(mut self, lval: &str, rval: Value) -> Self {
        self.constraints.push(Constraint::new(lval, rval));
        self
    }

    pub fn constraint(&self, lval: &str) -> Option<&Value> {
        self.constraints.iter().find(|c| c.lval == lval).map(|c| &c.rval)
    }

    pub fn constraint_scalar(&self, lval: &str) -> Option<&str> {
        self.constraint(lval).and_then(|v| v.as_scalar())
    }

    /// The promise handle, when one is declared.
    pub fn handle(&self) -> Option<&str> {
        self.constraint_scalar("handle")
    }
}
