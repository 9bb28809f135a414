//! Layout rules, checked against the Rust compiler's own C layouts

mod common;

use common::{Point, TNumber, TRecWithArray};
use dynacall::types::align_up;
use dynacall::{Type, TypeError, TypeRegistry};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use std::mem::{align_of, size_of};

fn scalar() -> impl Strategy<Value = Type> {
    prop_oneof![
        Just(Type::char()),
        Just(Type::uchar()),
        Just(Type::int()),
        Just(Type::uint()),
        Just(Type::long()),
        Just(Type::int64()),
        Just(Type::float()),
        Just(Type::double()),
        Just(Type::pointer()),
    ]
}

fn member() -> impl Strategy<Value = Type> {
    scalar().prop_recursive(2, 8, 4, |inner| {
        prop_oneof![
            (inner.clone(), 1usize..4).prop_map(|(t, n)| Type::array(t, n).unwrap()),
            prop::collection::vec(inner, 1..4).prop_map(|ts| {
                Type::structure(ts.into_iter().enumerate().map(|(i, t)| (format!("f{}", i), t))).unwrap()
            }),
        ]
    })
}

fn members() -> impl Strategy<Value = Vec<(String, Type)>> {
    prop::collection::vec(member(), 1..6)
        .prop_map(|ts| ts.into_iter().enumerate().map(|(i, t)| (format!("m{}", i), t)).collect())
}

proptest! {
    #[test]
    fn prop_struct_layout_follows_c_rules(fields in members()) {
        let ty = Type::structure(fields.clone()).unwrap();
        let max_align = fields.iter().map(|(_, t)| t.align()).max().unwrap();

        prop_assert_eq!(ty.align(), max_align);
        prop_assert_eq!(ty.size() % ty.align(), 0);

        let mut end = 0;
        for field in ty.fields() {
            prop_assert_eq!(field.offset % field.ty.align(), 0);
            prop_assert!(field.offset >= end, "fields overlap");
            // Padding never exceeds what alignment needs.
            prop_assert!(field.offset - end < field.ty.align());
            end = field.offset + field.ty.size();
        }
        prop_assert!(ty.size() >= end);
        prop_assert!(ty.size() - end < ty.align());
    }

    #[test]
    fn prop_union_overlays_every_member(fields in members()) {
        let ty = Type::union(fields.clone()).unwrap();
        let widest = fields.iter().map(|(_, t)| t.size()).max().unwrap();
        let max_align = fields.iter().map(|(_, t)| t.align()).max().unwrap();

        prop_assert!(ty.fields().iter().all(|f| f.offset == 0));
        prop_assert_eq!(ty.align(), max_align);
        // Widest member, padded to the strictest alignment as in C
        prop_assert_eq!(Some(ty.size()), align_up(widest, max_align));
    }

    #[test]
    fn prop_array_size_is_element_times_length(element in member(), length in 1usize..64) {
        let ty = Type::array(element.clone(), length).unwrap();
        prop_assert_eq!(ty.size(), element.size() * length);
        prop_assert_eq!(ty.align(), element.align());
    }
}

#[test]
fn test_matches_repr_c_record() {
    let registry = TypeRegistry::new();
    let rec = Type::structure([
        ("values", registry.resolve("long[5]").unwrap()),
        ("index", registry.resolve("uint").unwrap()),
    ])
    .unwrap();
    assert_eq!(rec.size(), size_of::<TRecWithArray>());
    assert_eq!(rec.align(), align_of::<TRecWithArray>());
    assert_eq!(rec.fields()[1].offset, 5 * size_of::<std::os::raw::c_long>());
}

#[test]
fn test_matches_repr_c_point_and_union() {
    let point = Type::structure([("x", Type::int()), ("y", Type::int())]).unwrap();
    assert_eq!(point.size(), size_of::<Point>());
    assert_eq!(point.align(), align_of::<Point>());

    let number = Type::union([("i", Type::int()), ("d", Type::double())]).unwrap();
    assert_eq!(number.size(), size_of::<TNumber>());
    assert_eq!(number.align(), align_of::<TNumber>());
}

#[test]
fn test_union_pads_to_member_alignment() {
    let ty = Type::union([("bytes", Type::array(Type::char(), 5).unwrap()), ("word", Type::int())]).unwrap();
    assert_eq!(ty.size(), 8);
    assert_eq!(ty.align(), 4);
}

#[rstest]
#[case("char", 1)]
#[case("short", 2)]
#[case("int", 4)]
#[case("int64", 8)]
#[case("double", 8)]
#[case("float", 4)]
#[case("pointer", size_of::<usize>())]
#[case("size_t", size_of::<usize>())]
#[case("long", size_of::<std::os::raw::c_long>())]
#[case("int*", size_of::<usize>())]
#[case("int[3]", 12)]
#[case("char[2][3]", 6)]
fn test_token_sizes(#[case] token: &str, #[case] size: usize) {
    assert_eq!(Type::named(token).unwrap().size(), size);
}

#[test]
fn test_registered_types_resolve_in_tokens() {
    let mut registry = TypeRegistry::new();
    let point = registry.define_struct("Point", &[("x", "int"), ("y", "int")]).unwrap();

    assert_eq!(registry.resolve("Point").unwrap(), point);
    assert_eq!(registry.resolve("Point*").unwrap(), Type::pointer_to(point.clone()));
    assert_eq!(registry.resolve("Point[4]").unwrap().size(), 4 * point.size());
    assert_eq!(
        registry.define_struct("Point", &[("z", "int")]).unwrap_err(),
        TypeError::AlreadyRegistered("Point".to_string())
    );
}

#[test]
fn test_linked_list_node() {
    let mut registry = TypeRegistry::new();
    let node = registry.define_struct("Node", &[("value", "int64"), ("next", "Node*")]).unwrap();
    assert_eq!(node.size(), 8 + size_of::<usize>());
    assert!(node.fields()[1].ty.is_address());
}

#[rstest]
#[case::empty(Type::structure(Vec::<(&str, Type)>::new()), TypeError::EmptyComposite("struct"))]
#[case::empty_union(Type::union(Vec::<(&str, Type)>::new()), TypeError::EmptyComposite("union"))]
#[case::duplicate(
    Type::structure([("a", Type::int()), ("a", Type::int())]),
    TypeError::DuplicateField("a".to_string())
)]
#[case::void_field(Type::structure([("nothing", Type::void())]), TypeError::ZeroSizedField("nothing".to_string()))]
fn test_malformed_composites(#[case] built: Result<Type, TypeError>, #[case] expected: TypeError) {
    assert_eq!(built.unwrap_err(), expected);
}

#[test]
fn test_opaque_types_only_behind_pointers() {
    let handle = Type::opaque("FILE");
    assert_eq!(handle.size(), 0);
    assert_eq!(handle.check_argument(), Err(TypeError::NotPassable("FILE".to_string())));
    assert!(Type::pointer_to(handle).check_argument().is_ok());
    assert!(Type::void().check_argument().is_err());
    assert!(Type::void().check_return().is_ok());
}
