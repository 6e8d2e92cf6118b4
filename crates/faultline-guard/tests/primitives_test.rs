use std::sync::Arc;

use faultline_core::{
    Callable, Instance, Kwargs, RuntimeError, TypeObject, Value, address_of, dereference_tracked,
};
use faultline_guard::{
    StackBuffer, add_ref, force_set_attr, force_update_locals, remove_ref, run_stack_callback,
    set_ref,
};

#[test]
fn force_set_attr_bypasses_immutability_and_invalidates_lookups() {
    let frozen = TypeObject::builder("Frozen").attr("limit", 1).immutable().build();
    let derived = TypeObject::builder("Derived").base(&frozen).build();
    assert_eq!(derived.lookup("limit"), Some(Value::Int(1)));
    assert_eq!(frozen.lookup("limit"), Some(Value::Int(1)));

    assert!(matches!(
        frozen.set_attr("limit", Value::Int(2)),
        Err(RuntimeError::ImmutableType { .. })
    ));

    force_set_attr(&frozen, "limit", Value::Int(2));
    force_set_attr(&frozen, "not an identifier!", Value::Bool(true));

    assert_eq!(frozen.lookup("limit"), Some(Value::Int(2)));
    assert_eq!(derived.lookup("limit"), Some(Value::Int(2)));
    assert_eq!(
        frozen.lookup("not an identifier!"),
        Some(Value::Bool(true))
    );
}

#[test]
fn forced_type_attributes_reach_instances() {
    let builtin = TypeObject::builder("builtin_int").immutable().build();
    let obj = Instance::new(&builtin);
    assert!(obj.get_attr("describe").is_err());

    force_set_attr(&builtin, "describe", Value::str("forced"));

    assert_eq!(obj.get_attr("describe"), Ok(Value::str("forced")));
}

#[test]
fn force_update_locals_rewrites_a_running_frame() {
    let rewrite = Callable::with_locals("rewrite", &["x"], &["y"], |scope| {
        scope.set("y", Value::Int(1))?;
        assert!(force_update_locals(scope.frame(), "x", Value::Int(99)));
        assert!(force_update_locals(scope.frame(), "y", Value::Int(7)));
        assert!(!force_update_locals(scope.frame(), "missing", Value::Int(0)));
        let x = scope.get("x")?.as_int().unwrap_or(0);
        let y = scope.get("y")?.as_int().unwrap_or(0);
        Ok(Value::Int(x + y))
    });
    assert_eq!(
        rewrite.call(&[Value::Int(1)], &Kwargs::new()),
        Ok(Value::Int(106))
    );
}

#[test]
fn force_update_locals_balances_lifetime_counts() {
    let typ = TypeObject::builder("Payload").build();
    let old = Instance::new(&typ);
    let new = Instance::new(&typ);
    let (old_probe, new_probe) = (Arc::clone(&old), Arc::clone(&new));

    let swap = Callable::new("swap", &["item"], move |scope| {
        assert_eq!(old_probe.header().count(), 2);
        force_update_locals(
            scope.frame(),
            "item",
            Value::Instance(Arc::clone(&new_probe)),
        );
        assert_eq!(old_probe.header().count(), 1);
        assert_eq!(new_probe.header().count(), 2);
        Ok(Value::None)
    });
    swap.call(&[Value::Instance(Arc::clone(&old))], &Kwargs::new())
        .unwrap();

    assert_eq!(old.header().count(), 1);
    assert_eq!(new.header().count(), 1);
}

#[test]
fn count_primitives_adjust_and_deallocate() {
    let typ = TypeObject::builder("Counted").build();
    let obj = Value::Instance(Instance::new(&typ));
    let addr = address_of(&obj).unwrap();

    assert_eq!(add_ref(&obj), Ok(2));
    assert_eq!(add_ref(&obj), Ok(3));
    set_ref(&obj, 1).unwrap();
    assert!(dereference_tracked(addr).is_ok());

    assert_eq!(remove_ref(&obj), Ok(0));
    assert!(obj.header().unwrap().is_deallocated());
    assert_eq!(
        dereference_tracked(addr).unwrap_err(),
        RuntimeError::Dereference(addr)
    );
}

#[test]
fn count_primitives_refuse_values_without_a_header() {
    let err = add_ref(&Value::Int(5)).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::InvalidArgument("'int' values carry no lifetime count".into())
    );
}

#[test]
fn stack_callback_returns_callback_result() {
    let total = run_stack_callback::<StackBuffer, _>(2048, |buf| {
        // SAFETY: buf is the live block for this callback.
        unsafe { buf.write_bytes(0, &[1, 2, 3, 4]).unwrap() };
        let mut out = [0u8; 4];
        // SAFETY: as above.
        unsafe { buf.read_bytes(0, &mut out).unwrap() };
        out.iter().map(|b| u32::from(*b)).sum::<u32>()
    });
    assert_eq!(total, Ok(10));
}
