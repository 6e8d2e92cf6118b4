//! Fault scenarios run in-process under supervision.

use faultline_core::{Callable, FaultKind, Instance, Kwargs, RuntimeError, TypeObject, Value};
use faultline_guard::{
    StackBuffer, force_set_attr, force_update_locals, handle, probes, run_stack_callback,
};

/// What a scenario is expected to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    /// A normal return of this value.
    Returns(Value),
    /// An ordinary error passed through from the callable.
    Raised,
    /// A captured fault of `kind` naming `unit`.
    Fault { kind: FaultKind, unit: &'static str },
}

/// A named, self-contained check.
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub expected: Expected,
    body: fn() -> Result<Value, RuntimeError>,
}

impl Scenario {
    /// Execute the scenario body.
    pub fn run(&self) -> Result<Value, RuntimeError> {
        (self.body)()
    }

    /// Whether `result` is what this scenario expects.
    #[must_use]
    pub fn matches(&self, result: &Result<Value, RuntimeError>) -> bool {
        match (&self.expected, result) {
            (Expected::Returns(expected), Ok(value)) => expected == value,
            (Expected::Raised, Err(RuntimeError::Raised(_))) => true,
            (Expected::Fault { kind, unit }, Err(RuntimeError::Fault(report))) => {
                report.kind == *kind && report.unit == *unit
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

fn returns_value() -> Result<Value, RuntimeError> {
    let add = Callable::new("add", &["a", "b"], |scope| {
        let a = scope.get("a")?.as_int().unwrap_or(0);
        let b = scope.get("b")?.as_int().unwrap_or(0);
        Ok(Value::Int(a + b))
    });
    let mut kwargs = Kwargs::new();
    kwargs.insert("b".into(), Value::Int(40));
    handle(&add, Some(vec![Value::Int(2)]), Some(kwargs))
}

fn raises_error() -> Result<Value, RuntimeError> {
    let parse = Callable::new("parse", &[], |_| Err(RuntimeError::raised("malformed header")));
    handle(&parse, None, None)
}

fn segv_protected_page() -> Result<Value, RuntimeError> {
    let reader = Callable::new("read_protected", &[], |_| {
        Ok(Value::Int(i64::from(probes::read_protected_page())))
    });
    handle(&reader, None, None)
}

fn segv_nested_frame() -> Result<Value, RuntimeError> {
    let inner = Callable::new("inner_reader", &[], |_| {
        probes::write_protected_page(1);
        Ok(Value::None)
    });
    let outer = Callable::new("outer_loader", &[], move |_| inner.call(&[], &Kwargs::new()));
    handle(&outer, None, None)
}

fn raise_kind(name: &'static str, kind: FaultKind) -> Result<Value, RuntimeError> {
    let raiser = Callable::new(name, &[], move |_| {
        probes::raise_signal(kind);
        Ok(Value::None)
    });
    handle(&raiser, None, None)
}

fn abort_signal() -> Result<Value, RuntimeError> {
    raise_kind("shutdown", FaultKind::Abort)
}

fn fpe_signal() -> Result<Value, RuntimeError> {
    raise_kind("divide", FaultKind::FloatingPoint)
}

fn bus_signal() -> Result<Value, RuntimeError> {
    raise_kind("map_tail", FaultKind::Bus)
}

fn nested_supervision() -> Result<Value, RuntimeError> {
    let outer = Callable::new("coordinator", &[], |_| {
        let worker = Callable::new("worker", &[], |_| {
            probes::read_protected_page();
            Ok(Value::None)
        });
        match handle(&worker, None, None) {
            Err(RuntimeError::Fault(report)) => Ok(Value::str(&report.unit)),
            other => other,
        }
    });
    handle(&outer, None, None)
}

fn recovery_repeat() -> Result<Value, RuntimeError> {
    let reader = Callable::new("again", &[], |_| {
        probes::read_protected_page();
        Ok(Value::None)
    });
    let mut recovered = 0;
    for _ in 0..25 {
        if matches!(handle(&reader, None, None), Err(RuntimeError::Fault(_))) {
            recovered += 1;
        }
    }
    Ok(Value::Int(recovered))
}

fn stack_buffer() -> Result<Value, RuntimeError> {
    let user = Callable::new("stack_user", &["size"], |scope| {
        let size = scope.get("size")?.as_int().unwrap_or(0);
        let size = usize::try_from(size)
            .map_err(|_| RuntimeError::InvalidArgument(format!("negative size {size}")))?;
        let seen = run_stack_callback::<StackBuffer, _>(size, |buf| {
            (buf.size(), buf.offset(buf.size() + 1).is_err(), buf.free().is_err())
        })?;
        Ok(Value::Bool(seen == (size, true, true)))
    });
    handle(&user, Some(vec![Value::Int(3000)]), None)
}

fn force_set_attr_immutable() -> Result<Value, RuntimeError> {
    let builtin = TypeObject::builder("builtin_str").immutable().build();
    let obj = Instance::new(&builtin);
    if builtin.set_attr("shout", Value::Bool(true)).is_ok() {
        return Err(RuntimeError::raised("immutable type accepted set_attr"));
    }
    force_set_attr(&builtin, "shout", Value::str("HELLO"));
    obj.get_attr("shout")
}

fn force_update_locals_running() -> Result<Value, RuntimeError> {
    let target = Callable::new("target", &["x"], |scope| {
        force_update_locals(scope.frame(), "x", Value::Int(99));
        scope.get("x")
    });
    let runner = Callable::new("runner", &[], move |_| {
        target.call(&[Value::Int(1)], &Kwargs::new())
    });
    handle(&runner, None, None)
}

/// Every scenario, in a stable order.
#[must_use]
pub fn catalog() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "returns-value",
            description: "successful call returns its value",
            expected: Expected::Returns(Value::Int(42)),
            body: returns_value,
        },
        Scenario {
            name: "raises-error",
            description: "ordinary errors pass through unchanged",
            expected: Expected::Raised,
            body: raises_error,
        },
        Scenario {
            name: "segv-protected-page",
            description: "read of a PROT_NONE page is captured",
            expected: Expected::Fault {
                kind: FaultKind::Segmentation,
                unit: "read_protected",
            },
            body: segv_protected_page,
        },
        Scenario {
            name: "segv-nested-frame",
            description: "fault names the innermost frame, not the callable",
            expected: Expected::Fault {
                kind: FaultKind::Segmentation,
                unit: "inner_reader",
            },
            body: segv_nested_frame,
        },
        Scenario {
            name: "abort-signal",
            description: "SIGABRT is captured",
            expected: Expected::Fault {
                kind: FaultKind::Abort,
                unit: "shutdown",
            },
            body: abort_signal,
        },
        Scenario {
            name: "fpe-signal",
            description: "SIGFPE is captured",
            expected: Expected::Fault {
                kind: FaultKind::FloatingPoint,
                unit: "divide",
            },
            body: fpe_signal,
        },
        Scenario {
            name: "bus-signal",
            description: "SIGBUS is captured",
            expected: Expected::Fault {
                kind: FaultKind::Bus,
                unit: "map_tail",
            },
            body: bus_signal,
        },
        Scenario {
            name: "nested-supervision",
            description: "inner supervised call contains its own fault",
            expected: Expected::Returns(Value::str("worker")),
            body: nested_supervision,
        },
        Scenario {
            name: "recovery-repeat",
            description: "25 consecutive faults are all recovered",
            expected: Expected::Returns(Value::Int(25)),
            body: recovery_repeat,
        },
        Scenario {
            name: "stack-buffer",
            description: "stack callback inside a supervised call",
            expected: Expected::Returns(Value::Bool(true)),
            body: stack_buffer,
        },
        Scenario {
            name: "force-set-attr",
            description: "attribute forced onto an immutable type is visible",
            expected: Expected::Returns(Value::str("HELLO")),
            body: force_set_attr_immutable,
        },
        Scenario {
            name: "force-update-locals",
            description: "running frame's local rewritten in place",
            expected: Expected::Returns(Value::Int(99)),
            body: force_update_locals_running,
        },
    ]
}

/// Look up a scenario by name.
#[must_use]
pub fn find(name: &str) -> Option<Scenario> {
    catalog().into_iter().find(|s| s.name == name)
}
