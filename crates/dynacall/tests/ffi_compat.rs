//! Behavior expected by code written against classic dynamic FFI bindings

mod common;

use dynacall::{
    read_c_string, run_until_idle, Callback, Error, Library, LibraryOptions, Reference, SignatureMap, Type, Value,
};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

fn mul_only() -> SignatureMap {
    SignatureMap::new().with("mul", "int", ["int", "int"])
}

fn make_int_lib() -> Library {
    common::load(
        &SignatureMap::new().with("makeInt", "int", ["float", "double", "pointer"]),
        LibraryOptions::default(),
    )
}

fn float_double_callback() -> Callback {
    Callback::new("int", [Type::float(), Type::double()], |args: &[Value]| {
        let f = args[0].as_f64().unwrap_or(0.0);
        let d = args[1].as_f64().unwrap_or(0.0);
        Ok(Value::from(f + d + 0.1))
    })
    .unwrap()
}

#[test]
fn test_multiple_function_definition() {
    let lib = common::load(
        &SignatureMap::new()
            .with("mul", "int", ["int", "int"])
            .with("getString", "char*", Vec::<&str>::new()),
        LibraryOptions::default(),
    );
    assert_eq!(lib.call("mul", &[21.into(), 2.into()]).unwrap(), 42);
    assert_eq!(lib.call("getString", &[]).unwrap(), "world");
    lib.release().unwrap();
}

#[test]
fn test_string_read_through_raw_pointer() {
    let lib = common::load(
        &SignatureMap::new().with("getString", "pointer", Vec::<&str>::new()),
        LibraryOptions::default(),
    );
    let ptr = lib.call("getString", &[]).unwrap().as_pointer().unwrap();
    assert_eq!(unsafe { read_c_string(ptr) }.unwrap(), "world");
    lib.release().unwrap();
}

#[test]
fn test_async_explicit() {
    let lib = common::load(&mul_only(), LibraryOptions::default());
    let seen: Rc<RefCell<Vec<Result<Value, Error>>>> = Rc::default();

    let sink = Rc::clone(&seen);
    lib.func("mul").unwrap().call_async(&[21.into(), 2.into()], move |r| sink.borrow_mut().push(r));
    // Released right away: the in-flight call drains first.
    lib.release().unwrap();

    run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![Ok(Value::from(42))]);
}

#[test]
fn test_async_in_options() {
    let lib = common::load(&mul_only(), LibraryOptions::default().asynchronous(true));
    assert!(lib.is_async_default());

    let seen: Rc<RefCell<Option<Result<Value, Error>>>> = Rc::default();
    let sink = Rc::clone(&seen);
    let invocation = lib.func("mul").unwrap().invoke(&[21.into(), 2.into()]);
    assert!(invocation.is_pending());
    invocation.then(move |r| *sink.borrow_mut() = Some(r));

    run_until_idle().unwrap();
    assert_eq!(seen.borrow_mut().take(), Some(Ok(Value::from(42))));
    lib.release().unwrap();
}

#[test]
fn test_promises() {
    let lib = common::load(&mul_only(), LibraryOptions::default());
    let result = dynacall::block_on(lib.func("mul").unwrap().call_promise(&[21.into(), 2.into()])).unwrap();
    assert_eq!(result.unwrap(), 42);
    lib.release().unwrap();
}

#[test]
fn test_sync_callback() {
    let lib = make_int_lib();
    let cb = float_double_callback();
    assert_eq!(lib.call("makeInt", &[19.9.into(), 2.into(), cb.clone().into()]).unwrap(), 42);
    assert_eq!(cb.calls(), 1);
    lib.release().unwrap();
}

#[test]
fn test_async_callback() {
    let lib = make_int_lib();
    let cb = float_double_callback();
    let seen: Rc<RefCell<Option<Result<Value, Error>>>> = Rc::default();

    let sink = Rc::clone(&seen);
    lib.func("makeInt")
        .unwrap()
        .call_async(&[19.9.into(), 2.into(), (&cb).into()], move |r| *sink.borrow_mut() = Some(r));
    lib.release().unwrap();

    run_until_idle().unwrap();
    assert_eq!(seen.borrow_mut().take(), Some(Ok(Value::from(42))));
    assert_eq!(cb.calls(), 1);
}

#[test]
fn test_array_and_struct() {
    let rec_with_array = Type::structure([
        ("values", Type::array(Type::long(), 5).unwrap()),
        ("index", Type::uint()),
    ])
    .unwrap();
    let lib = common::load(
        &SignatureMap::new().with(
            "incRecWithArrays",
            "void",
            [Type::pointer_to(rec_with_array.clone()), Type::long()],
        ),
        LibraryOptions::default(),
    );

    let first = Value::record([("index", Value::from(4)), ("values", Value::array([3, 4, 5, 6, 7]))]);
    let second = Reference::from_value(
        &rec_with_array,
        &Value::record([("index", Value::from(5)), ("values", Value::array([-3, -4, -5, -6, -7]))]),
    )
    .unwrap();
    let records = Reference::array_of(&rec_with_array, &[first, second.into()]).unwrap();

    lib.call("incRecWithArrays", &[(&records).into(), 2.into()]).unwrap();

    assert_eq!(records.element(0).unwrap().get_field("index").unwrap(), 5);
    assert_eq!(records.element(1).unwrap().get_field("index").unwrap(), 6);
    for i in 0..5 {
        let a = records.element(0).unwrap().field("values").unwrap().get(i).unwrap();
        let b = records.element(1).unwrap().field("values").unwrap().get(i).unwrap();
        assert_eq!(a, i as i64 + 4);
        assert_eq!(b, -2 - i as i64);
    }
    lib.release().unwrap();
}
