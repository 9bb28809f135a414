//! Typed views over native memory

use dynacall::{read_c_string, write_c_string, Error, MarshalError, Reference, Type, TypeRegistry, Value};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn record_type() -> Type {
    let mut registry = TypeRegistry::new();
    registry
        .define_struct("Sample", &[("tag", "char"), ("count", "int64"), ("ratio", "double")])
        .unwrap()
}

proptest! {
    #[test]
    fn prop_array_elements_keep_their_index(values in prop::collection::vec(any::<i32>(), 1..64)) {
        let buffer = Reference::alloc_array(&Type::int(), values.len()).unwrap();
        for (i, v) in values.iter().enumerate() {
            buffer.set(i, &Value::from(*v)).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(buffer.get(i).unwrap(), Value::from(*v));
        }
        prop_assert!(buffer.get(values.len()).is_err());
    }

    #[test]
    fn prop_record_fields_are_independent(tag in any::<i8>(), count in any::<i64>(), ratio in -1e12f64..1e12) {
        let rec = Reference::alloc(&record_type()).unwrap();
        rec.set_field("ratio", &ratio.into()).unwrap();
        rec.set_field("tag", &tag.into()).unwrap();
        rec.set_field("count", &count.into()).unwrap();

        prop_assert_eq!(rec.get_field("tag").unwrap(), Value::from(tag));
        prop_assert_eq!(rec.get_field("count").unwrap(), Value::from(count));
        prop_assert_eq!(rec.get_field("ratio").unwrap(), Value::from(ratio));
    }

    #[test]
    fn prop_c_strings_survive_a_buffer(s in "[a-zA-Z0-9 ]{0,40}") {
        let buffer = Reference::alloc_c_string(&s).unwrap();
        prop_assert_eq!(unsafe { read_c_string(buffer.address()) }.unwrap(), s);
    }
}

#[test]
fn test_sub_views_share_memory() {
    let matrix = Reference::alloc(&Type::named("int[3][2]").unwrap()).unwrap();
    let row = matrix.element(1).unwrap();
    row.set(2, &Value::from(9)).unwrap();

    assert_eq!(matrix.element(1).unwrap().get(2).unwrap(), 9);
    assert_eq!(
        matrix.to_value().unwrap(),
        Value::Array(vec![Value::array([0, 0, 0]), Value::array([0, 0, 9])])
    );
    assert_eq!(row.address(), matrix.address().offset(12));
}

#[test]
fn test_offset_and_cast() {
    let ints = Reference::array_of(&Type::int(), &[1.into(), 2.into(), 3.into(), 4.into()]).unwrap();
    let first = ints.cast(Type::int()).unwrap();
    assert_eq!(first.to_value().unwrap(), 1);
    assert_eq!(first.offset(8).unwrap().to_value().unwrap(), 3);

    // Past the end of the allocation
    assert!(matches!(first.offset(20), Err(MarshalError::OutOfExtent { .. })));
    assert!(matches!(
        first.offset(16).unwrap().to_value(),
        Err(MarshalError::OutOfExtent { .. })
    ));
    assert!(matches!(
        ints.cast(Type::array(Type::int(), 5).unwrap()),
        Err(MarshalError::OutOfExtent { .. })
    ));
}

#[test]
fn test_pointer_field_dereference() {
    let mut registry = TypeRegistry::new();
    let holder = registry.define_struct("Holder", &[("target", "int64*")]).unwrap();

    let target = Reference::from_value(&Type::int64(), &Value::from(-77)).unwrap();
    let rec = Reference::alloc(&holder).unwrap();
    rec.set_field("target", &(&target).into()).unwrap();
    drop(target);

    // The record keeps what it points to alive.
    let seen = unsafe { rec.field("target").unwrap().deref() }.unwrap();
    assert_eq!(seen.to_value().unwrap(), -77);
    seen.store(&Value::from(5)).unwrap();
    let again = unsafe { rec.field("target").unwrap().deref() }.unwrap();
    assert_eq!(again.to_value().unwrap(), 5);
}

#[test]
fn test_null_pointer_dereference() {
    let slot = Reference::alloc(&Type::pointer_to(Type::int())).unwrap();
    assert_eq!(unsafe { slot.deref() }.unwrap_err(), MarshalError::NullPointer);
    let not_a_pointer = Reference::alloc(&Type::int()).unwrap();
    assert!(unsafe { not_a_pointer.deref() }.is_err());
}

#[test]
fn test_unsized_array_view_rejects_oversized_store() {
    let cell = Reference::alloc(&Type::int64()).unwrap();
    let view = cell.cast(Type::unsized_array(Type::int64()).unwrap()).unwrap();
    assert_eq!(
        view.store(&Value::array(0i64..64)).unwrap_err(),
        MarshalError::OutOfExtent {
            offset: 0,
            size: 512,
            extent: 8
        }
    );
    assert_eq!(cell.to_value().unwrap(), 0);
}

#[test]
fn test_write_c_string_respects_capacity() {
    let buffer = Reference::alloc_array(&Type::char(), 6).unwrap();
    write_c_string(&buffer, "hello").unwrap();
    assert_eq!(unsafe { read_c_string(buffer.address()) }.unwrap(), "hello");

    assert_eq!(
        write_c_string(&buffer, "hello!").unwrap_err(),
        MarshalError::OutOfExtent {
            offset: 0,
            size: 7,
            extent: 6
        }
    );
}

#[test]
fn test_record_literal_rejects_unknown_fields() {
    let err = Reference::from_value(&record_type(), &Value::record([("weight", Value::from(1))])).unwrap_err();
    assert_eq!(err, Error::from(MarshalError::UnknownField("weight".to_string())));
}

#[test]
fn test_unsized_array_takes_literal_length() {
    let ty = Type::named("double[]").unwrap();
    let buffer = Reference::from_value(&ty, &Value::array([0.5, 1.5, 2.5])).unwrap();
    assert_eq!(buffer.len(), Some(3));
    assert_eq!(buffer.size(), 24);
    assert_eq!(buffer.get(2).unwrap(), 2.5);
}

#[test]
fn test_borrowed_memory_is_not_owned() {
    let mut native: [i32; 2] = [11, 22];
    let view = unsafe {
        Reference::borrowed(
            dynacall::Pointer::from_ptr(native.as_mut_ptr()),
            Type::array(Type::int(), 2).unwrap(),
        )
    };
    assert!(!view.is_owned());
    assert_eq!(view.extent(), None);
    view.set(0, &Value::from(33)).unwrap();
    drop(view);
    assert_eq!(native, [33, 22]);
}
