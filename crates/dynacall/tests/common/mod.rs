//! Native test library shared by the integration tests
//!
//! Plain `extern "C"` functions registered in a [`SymbolTable`], so the tests
//! exercise the real calling convention without building a shared object.

#![allow(dead_code)]

use dynacall::{Library, LibraryOptions, SignatureMap, SymbolTable};
use std::os::raw::{c_char, c_double, c_float, c_int, c_long, c_uint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TRecWithArray {
    pub values: [c_long; 5],
    pub index: c_uint,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: c_int,
    pub y: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union TNumber {
    pub i: c_int,
    pub d: c_double,
}

pub type FloatDoubleToInt = extern "C" fn(c_float, c_double) -> c_int;
pub type IntToInt = extern "C" fn(c_int) -> c_int;
pub type StringProducer = extern "C" fn() -> *const c_char;

static SLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

pub extern "C" fn mul(a: c_int, b: c_int) -> c_int {
    a * b
}

pub extern "C" fn get_string() -> *const c_char {
    b"world\0".as_ptr().cast()
}

pub extern "C" fn make_int(f: c_float, d: c_double, cb: FloatDoubleToInt) -> c_int {
    (f as c_double + d) as c_int + cb(f, d)
}

/// Increment the index and every value of `count` records
pub extern "C" fn inc_rec_with_arrays(records: *mut TRecWithArray, count: c_long) {
    for i in 0..count.max(0) as usize {
        // SAFETY: the caller passes `count` records.
        let rec = unsafe { &mut *records.add(i) };
        rec.index += 1;
        for v in rec.values.iter_mut() {
            *v += 1;
        }
    }
}

/// Add `delta` to the index and every value of one record
pub extern "C" fn add_to_record(record: *mut TRecWithArray, delta: c_long) {
    // SAFETY: the caller passes one record.
    let rec = unsafe { &mut *record };
    rec.index = (rec.index as c_long + delta) as c_uint;
    for v in rec.values.iter_mut() {
        *v += delta;
    }
}

pub extern "C" fn make_point(x: c_int, y: c_int) -> Point {
    Point { x, y }
}

pub extern "C" fn sum_point(p: Point) -> c_int {
    p.x + p.y
}

pub extern "C" fn union_double(n: *const TNumber) -> c_double {
    // SAFETY: the tests store a double.
    unsafe { (*n).d }
}

pub extern "C" fn str_len(s: *const c_char) -> usize {
    if s.is_null() {
        return 0;
    }
    // SAFETY: NUL-terminated by the marshaler.
    unsafe { std::ffi::CStr::from_ptr(s) }.to_bytes().len()
}

pub extern "C" fn echo_string(s: *const c_char) -> *const c_char {
    s
}

pub extern "C" fn sum_ints(values: *const c_int, count: c_int) -> c_int {
    (0..count.max(0) as usize)
        // SAFETY: the caller passes `count` ints.
        .map(|i| unsafe { *values.add(i) })
        .sum()
}

pub extern "C" fn call_twice(cb: IntToInt, x: c_int) -> c_int {
    cb(cb(x))
}

pub extern "C" fn produced_len(cb: StringProducer) -> usize {
    str_len(cb())
}

/// `cb(x)` through a native frame
pub extern "C" fn apply(cb: IntToInt, x: c_int) -> c_int {
    cb(x)
}

/// Produce two strings and hand back the first, still held
pub extern "C" fn first_of_two(cb: StringProducer) -> *const c_char {
    let first = cb();
    let _second = cb();
    first
}

pub extern "C" fn same_string_twice(cb: StringProducer) -> bool {
    cb() == cb()
}

pub extern "C" fn negate_char(c: i8) -> i8 {
    -c
}

pub extern "C" fn is_positive(x: c_int) -> bool {
    x > 0
}

pub extern "C" fn status(x: c_int) -> c_int {
    x
}

/// Multiply after a pause, long enough for a release to overlap
pub extern "C" fn slow_mul(a: c_int, b: c_int) -> c_int {
    thread::sleep(Duration::from_millis(100));
    SLOW_CALLS.fetch_add(1, Ordering::SeqCst);
    a * b
}

pub fn slow_calls() -> usize {
    SLOW_CALLS.load(Ordering::SeqCst)
}

pub fn test_library() -> SymbolTable {
    SymbolTable::new("testlib")
        .with("mul", mul as *const ())
        .with("getString", get_string as *const ())
        .with("makeInt", make_int as *const ())
        .with("incRecWithArrays", inc_rec_with_arrays as *const ())
        .with("addToRecord", add_to_record as *const ())
        .with("makePoint", make_point as *const ())
        .with("sumPoint", sum_point as *const ())
        .with("unionDouble", union_double as *const ())
        .with("strLen", str_len as *const ())
        .with("echoString", echo_string as *const ())
        .with("sumInts", sum_ints as *const ())
        .with("callTwice", call_twice as *const ())
        .with("producedLen", produced_len as *const ())
        .with("apply", apply as *const ())
        .with("firstOfTwo", first_of_two as *const ())
        .with("sameStringTwice", same_string_twice as *const ())
        .with("negateChar", negate_char as *const ())
        .with("isPositive", is_positive as *const ())
        .with("status", status as *const ())
        .with("slowMul", slow_mul as *const ())
}

pub fn load(signatures: &SignatureMap, options: LibraryOptions) -> Library {
    init_logging();
    Library::bind(Box::new(test_library()), signatures, options).expect("test library binds")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
