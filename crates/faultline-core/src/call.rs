//! Named callables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::frame::{self, ActiveFrame, Code, Frame, FrameRef};
use crate::object::{Header, Value};

/// Named arguments.
pub type Kwargs = BTreeMap<String, Value>;

/// Shared handle to a [`Callable`].
pub type CallableRef = Arc<Callable>;

type Body = dyn Fn(&CallScope<'_>) -> Result<Value, RuntimeError> + Send + Sync;

/// A named unit of work with declared parameters.
pub struct Callable {
    header: Header,
    code: Arc<Code>,
    arity: usize,
    body: Box<Body>,
}

impl Callable {
    /// A callable whose parameters are also its only locals.
    #[must_use]
    pub fn new<F>(name: &str, params: &[&str], body: F) -> CallableRef
    where
        F: Fn(&CallScope<'_>) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        Self::with_locals(name, params, &[], body)
    }

    /// A callable with extra local slots after its parameters.
    #[must_use]
    pub fn with_locals<F>(name: &str, params: &[&str], locals: &[&str], body: F) -> CallableRef
    where
        F: Fn(&CallScope<'_>) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        let varnames: Vec<&str> = params.iter().chain(locals.iter()).copied().collect();
        Arc::new(Self {
            header: Header::new(),
            code: Arc::new(Code::new(name, &varnames)),
            arity: params.len(),
            body: Box::new(body),
        })
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    /// Declared parameter names.
    #[must_use]
    pub fn params(&self) -> Vec<&str> {
        self.code.varnames()[..self.arity]
            .iter()
            .map(String::as_str)
            .collect()
    }

    /// Bind arguments into a fresh frame and run the body.
    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, RuntimeError> {
        if args.len() > self.arity {
            return Err(RuntimeError::TooManyArguments {
                callable: self.name().to_string(),
                expected: self.arity,
                given: args.len(),
            });
        }
        for key in kwargs.keys() {
            match self.code.slot_of(key) {
                Some(index) if index < self.arity => {
                    if index < args.len() {
                        return Err(RuntimeError::InvalidArgument(format!(
                            "{}() got multiple values for argument '{key}'",
                            self.name()
                        )));
                    }
                }
                _ => {
                    return Err(RuntimeError::UnexpectedKeyword {
                        callable: self.name().to_string(),
                        keyword: key.clone(),
                    });
                }
            }
        }

        let frame = Frame::new(Arc::clone(&self.code), frame::current_frame());
        for (name, value) in self.code.varnames().iter().zip(args) {
            frame.set_local(name, value.clone())?;
        }
        for (name, value) in kwargs {
            frame.set_local(name, value.clone())?;
        }

        let active = ActiveFrame::enter(frame);
        let scope = CallScope {
            frame: active.frame(),
            args,
            kwargs,
        };
        (self.body)(&scope)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name())
            .field("params", &self.params())
            .finish_non_exhaustive()
    }
}

/// What a callable body sees of its invocation.
pub struct CallScope<'a> {
    frame: &'a FrameRef,
    args: &'a [Value],
    kwargs: &'a Kwargs,
}

impl CallScope<'_> {
    /// The frame created for this call.
    #[must_use]
    pub fn frame(&self) -> &FrameRef {
        self.frame
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        self.args
    }

    #[must_use]
    pub fn kwargs(&self) -> &Kwargs {
        self.kwargs
    }

    /// Value currently bound to a parameter or local.
    pub fn get(&self, name: &str) -> Result<Value, RuntimeError> {
        self.frame
            .local(name)
            .ok_or_else(|| RuntimeError::UnknownLocal(name.to_string()))
    }

    /// Bind a local.
    pub fn set(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.frame.set_local(name, value)
    }
}
