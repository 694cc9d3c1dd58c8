//! Stack Frames
//!
//! The closed set of frame kinds and the stack-path rendering. A frame's
//! path is computed once at push time and never changes; it uniquely
//! identifies the stack position and seeds promise lock names.

use std::rc::Rc;

use crate::classes::table::ClassTable;
use crate::policy::types::{Body, Bundle, BundleSection, Promise};
use crate::stack::ring_buffer::RingBuffer;
use crate::vars::table::VariableTable;

/// Max chars of a multiline promiser kept on each side of the `...`
/// abbreviation in stack paths.
const PATH_FRAGMENT_LEN: usize = 19;

#[derive(Debug)]
pub struct BundleFrame {
    pub owner: Rc<Bundle>,
    pub classes: ClassTable,
    pub vars: VariableTable,
}

#[derive(Debug)]
pub struct BodyFrame {
    pub owner: Rc<Body>,
    pub vars: VariableTable,
}

#[derive(Debug)]
pub struct SectionFrame {
    pub owner: Rc<BundleSection>,
}

#[derive(Debug)]
pub struct PromiseFrame {
    pub owner: Rc<Promise>,
    pub vars: VariableTable,
}

#[derive(Debug)]
pub struct IterationFrame {
    /// The fully expanded promise for this iteration.
    pub owner: Promise,
    pub index: usize,
    /// Most recent log messages produced during the iteration.
    pub log_messages: RingBuffer,
}

#[derive(Debug)]
pub enum FrameData {
    Bundle(BundleFrame),
    Body(BodyFrame),
    BundleSection(SectionFrame),
    Promise(PromiseFrame),
    PromiseIteration(IterationFrame),
}

#[derive(Debug)]
pub struct StackFrame {
    pub data: FrameData,
    /// When set, class lookups that miss this frame continue into the
    /// frame below; transitive until a frame with the flag cleared.
    pub inherits_previous: bool,
    /// Immutable path string computed at push time.
    pub path: String,
}

impl StackFrame {
    pub fn new_bundle(owner: Rc<Bundle>, inherits_previous: bool) -> Self {
        Self {
            data: FrameData::Bundle(BundleFrame {
                owner,
                classes: ClassTable::new(),
                vars: VariableTable::new(),
            }),
            inherits_previous,
            path: String::new(),
        }
    }

    pub fn new_body(owner: Rc<Body>) -> Self {
        Self {
            data: FrameData::Body(BodyFrame { owner, vars: VariableTable::new() }),
            inherits_previous: false,
            path: String::new(),
        }
    }

    pub fn new_bundle_section(owner: Rc<BundleSection>) -> Self {
        Self {
            data: FrameData::BundleSection(SectionFrame { owner }),
            inherits_previous: true,
            path: String::new(),
        }
    }

    pub fn new_promise(owner: Rc<Promise>) -> Self {
        Self {
            data: FrameData::Promise(PromiseFrame { owner, vars: VariableTable::new() }),
            inherits_previous: true,
            path: String::new(),
        }
    }

    pub fn new_promise_iteration(owner: Promise, index: usize) -> Self {
        Self {
            data: FrameData::PromiseIteration(IterationFrame {
                owner,
                index,
                log_messages: RingBuffer::default(),
            }),
            inherits_previous: true,
            path: String::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.data {
            FrameData::Bundle(_) => "bundle",
            FrameData::Body(_) => "body",
            FrameData::BundleSection(_) => "bundle_section",
            FrameData::Promise(_) => "promise",
            FrameData::PromiseIteration(_) => "promise_iteration",
        }
    }
}

/// Append `promiser`, abbreviating multiline text to its first and last
/// few characters around `...` so paths stay single-line.
fn append_abbreviated(out: &mut String, promiser: &str) {
    match promiser.find('\n') {
        None => out.push_str(promiser),
        Some(first_nl) => {
            let last_line = promiser.rsplit('\n').next().unwrap_or("");
            let tail: Vec<char> = last_line.chars().collect();
            let tail_start = tail.len().saturating_sub(PATH_FRAGMENT_LEN);

            out.extend(promiser[..first_nl].chars().take(PATH_FRAGMENT_LEN));
            out.push_str("...");
            out.extend(tail[tail_start..].iter());
        }
    }
}

/// Render the path for the whole stack. Every frame kind contributes a
/// segment, so each push strictly extends the path and each pop strictly
/// contracts it.
pub fn render_stack_path(stack: &[StackFrame]) -> String {
    let mut path = String::new();
    for frame in stack {
        match &frame.data {
            FrameData::Body(body) => {
                path.push('/');
                path.push_str(&body.owner.name);
            }
            FrameData::Bundle(bundle) => {
                path.push('/');
                path.push_str(&bundle.owner.ns);
                path.push('/');
                path.push_str(&bundle.owner.name);
            }
            FrameData::BundleSection(section) => {
                path.push('/');
                path.push_str(&section.owner.promise_type);
            }
            FrameData::Promise(promise) => {
                path.push_str("/'");
                append_abbreviated(&mut path, &promise.owner.promiser);
                path.push('\'');
            }
            FrameData::PromiseIteration(iteration) => {
                path.push('[');
                path.push_str(&iteration.index.to_string());
                path.push(']');
            }
        }
    }
    path
}
