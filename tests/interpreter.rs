mod common;

use common::{call_static, define, vm};
use lungo::classfile::synth::ClassSynth;
use lungo::classfile::MethodAccessFlags;
use lungo::types::JValue;

const STATIC: MethodAccessFlags = MethodAccessFlags::PUBLIC.union(MethodAccessFlags::STATIC);

fn b2(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}

#[test]
fn static_field_round_trip() {
    let mut ctx = vm();

    let mut synth = ClassSynth::new("fix/StaticField");
    let field_ref = synth.cp_fieldref("fix/StaticField", "x", "I");
    let [hi, lo] = b2(field_ref);
    let cf = synth
        .superclass("java/lang/Object")
        .field(
            lungo::classfile::FieldAccessFlags::PRIVATE | lungo::classfile::FieldAccessFlags::STATIC,
            "x",
            "I",
        )
        .method(
            STATIC,
            "test",
            "()I",
            1,
            0,
            vec![
                0x10, 42, // bipush 42
                0xb3, hi, lo, // putstatic x
                0xb2, hi, lo, // getstatic x
                0xac, // ireturn
            ],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let value = call_static(&mut ctx, clsidx, "test", "()I").unwrap();
    assert_eq!(value, Some(JValue::Int(42)));

    // the class's static slot holds the value too
    let entry = ctx.classes.entry(clsidx).unwrap();
    assert_eq!(entry.statics, vec![JValue::Int(42)]);
}

#[test]
fn division_by_zero_raises_arithmetic_exception() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Div")
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "test",
            "()I",
            2,
            0,
            vec![0x04, 0x03, 0x6c, 0xac], // iconst_1 iconst_0 idiv ireturn
        )
        .method(
            STATIC,
            "rem",
            "()I",
            2,
            0,
            vec![0x04, 0x03, 0x70, 0xac], // iconst_1 iconst_0 irem ireturn
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let err = call_static(&mut ctx, clsidx, "test", "()I").unwrap_err();
    assert_eq!(err.class_name.as_ref(), "java/lang/ArithmeticException");
    let err = call_static(&mut ctx, clsidx, "rem", "()I").unwrap_err();
    assert_eq!(err.class_name.as_ref(), "java/lang/ArithmeticException");
}

#[test]
fn float_to_int_conversion_special_cases() {
    let mut ctx = vm();

    let mut synth = ClassSynth::new("fix/F2I");
    let nan = synth.cp_float(f32::NAN);
    let pos_inf = synth.cp_float(f32::INFINITY);
    let neg_inf = synth.cp_float(f32::NEG_INFINITY);
    let cf = synth
        .superclass("java/lang/Object")
        .method(STATIC, "nan", "()I", 1, 0, vec![0x12, nan as u8, 0x8b, 0xac])
        .method(STATIC, "pos", "()I", 1, 0, vec![0x12, pos_inf as u8, 0x8b, 0xac])
        .method(STATIC, "neg", "()I", 1, 0, vec![0x12, neg_inf as u8, 0x8b, 0xac])
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "nan", "()I").unwrap(),
        Some(JValue::Int(0))
    );
    assert_eq!(
        call_static(&mut ctx, clsidx, "pos", "()I").unwrap(),
        Some(JValue::Int(i32::MAX))
    );
    assert_eq!(
        call_static(&mut ctx, clsidx, "neg", "()I").unwrap(),
        Some(JValue::Int(i32::MIN))
    );
}

#[test]
fn branch_bounds_are_checked() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Branch")
        .superclass("java/lang/Object")
        // goto exactly code_length: rejected
        .method(STATIC, "past", "()V", 0, 0, vec![0xa7, 0x00, 0x03])
        // goto code_length - 1: lands on the return
        .method(STATIC, "edge", "()V", 0, 0, vec![0xa7, 0x00, 0x03, 0xb1])
        .build();
    let clsidx = define(&mut ctx, cf);

    let err = call_static(&mut ctx, clsidx, "past", "()V").unwrap_err();
    assert_eq!(err.class_name.as_ref(), "java/lang/VerifyError");
    assert_eq!(call_static(&mut ctx, clsidx, "edge", "()V").unwrap(), None);
}

#[test]
fn loop_with_iinc_sums() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Loop")
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "sum",
            "()I",
            2,
            2,
            vec![
                0x03, // iconst_0
                0x3b, // istore_0
                0x04, // iconst_1
                0x3c, // istore_1
                0x1b, // 4: iload_1
                0x10, 10, // bipush 10
                0xa3, 0x00, 13, // if_icmpgt +13 -> 20
                0x1a, // iload_0
                0x1b, // iload_1
                0x60, // iadd
                0x3b, // istore_0
                0x84, 0x01, 0x01, // iinc 1, 1
                0xa7, 0xff, 0xf3, // goto -13 -> 4
                0x1a, // 20: iload_0
                0xac, // ireturn
            ],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "sum", "()I").unwrap(),
        Some(JValue::Int(55))
    );
}

#[test]
fn long_arithmetic_spans_two_slots() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Longs");
    let big = synth.cp_long(0x1_0000_0000);
    let [hi, lo] = b2(big);
    let cf = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "add",
            "()J",
            4,
            0,
            vec![0x14, hi, lo, 0x0a, 0x61, 0xad], // ldc2_w, lconst_1, ladd, lreturn
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "add", "()J").unwrap(),
        Some(JValue::Long(0x1_0000_0001))
    );
}

#[test]
fn invokestatic_passes_arguments() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Calls");
    let callee = synth.cp_methodref("fix/Calls", "add", "(II)I");
    let [hi, lo] = b2(callee);
    let cf = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "add",
            "(II)I",
            2,
            2,
            vec![0x1a, 0x1b, 0x60, 0xac], // iload_0 iload_1 iadd ireturn
        )
        .method(
            STATIC,
            "test",
            "()I",
            2,
            0,
            vec![0x05, 0x06, 0xb8, hi, lo, 0xac], // iconst_2 iconst_3 invokestatic add
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(5))
    );
}

#[test]
fn tableswitch_selects_matching_arm() {
    let mut ctx = vm();
    let mut code = vec![
        0x05, // 0: iconst_2 (the key)
        0xaa, // 1: tableswitch
        0x00, 0x00, // padding to offset 4
    ];
    for word in [27i32, 1, 3, 29, 31, 33] {
        code.extend_from_slice(&word.to_be_bytes());
    }
    code.extend_from_slice(&[
        0x03, 0xac, // 28: default -> 0
        0x04, 0xac, // 30: case 1 -> 1
        0x05, 0xac, // 32: case 2 -> 2
        0x06, 0xac, // 34: case 3 -> 3
    ]);
    let cf = ClassSynth::new("fix/Switch")
        .superclass("java/lang/Object")
        .method(STATIC, "pick", "()I", 1, 0, code)
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "pick", "()I").unwrap(),
        Some(JValue::Int(2))
    );
}

#[test]
fn lookupswitch_matches_sparse_keys() {
    let mut ctx = vm();
    let mut code = vec![
        0x10, 100, // 0: bipush 100
        0xab, // 2: lookupswitch
        0x00, // padding to offset 4
    ];
    // default 21, npairs 2, pairs (7 -> 23), (100 -> 25)
    for word in [21i32, 2, 7, 23, 100, 25] {
        code.extend_from_slice(&word.to_be_bytes());
    }
    code.extend_from_slice(&[
        0x03, 0xac, // 23: -> 0 (default)
        0x04, 0xac, // 25: -> 1 (key 7)
        0x05, 0xac, // 27: -> 2 (key 100)
    ]);
    let cf = ClassSynth::new("fix/Lookup")
        .superclass("java/lang/Object")
        .method(STATIC, "pick", "()I", 1, 0, code)
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "pick", "()I").unwrap(),
        Some(JValue::Int(2))
    );
}

#[test]
fn wide_prefix_reaches_high_locals() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Wide")
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "test",
            "()I",
            1,
            300,
            vec![
                0x10, 77, // bipush 77
                0xc4, 0x36, 0x01, 0x07, // wide istore 263
                0xc4, 0x15, 0x01, 0x07, // wide iload 263
                0xac, // ireturn
            ],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(77))
    );
}
