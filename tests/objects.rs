mod common;

use common::{call_static, define, vm};
use lungo::class;
use lungo::classfile::synth::ClassSynth;
use lungo::classfile::{FieldAccessFlags, MethodAccessFlags};
use lungo::gc::{CountingCollector, GcPolicy};
use lungo::object::{instance_delete, instance_new, NewInstance, Special};
use lungo::types::{JValue, ObjectHash};

const STATIC: MethodAccessFlags = MethodAccessFlags::PUBLIC.union(MethodAccessFlags::STATIC);

#[test]
fn instance_create_delete_round_trips_the_table() {
    let mut ctx = vm();
    let system_thread = ctx.system_thread;
    let clsidx = class::load(&mut ctx, "java/lang/Object", system_thread).unwrap();

    let before = ctx.objects.in_use_count();
    let hash = instance_new(
        &mut ctx,
        NewInstance {
            class: clsidx,
            special: Special::None,
            lengths: Vec::new(),
            run_init: false,
            thread: system_thread,
        },
    )
    .unwrap();
    assert!(ctx.objects.entry(hash).is_some());
    assert_eq!(ctx.objects.in_use_count(), before + 1);

    instance_delete(&mut ctx, hash);
    assert!(ctx.objects.entry(hash).is_none());
    assert_eq!(ctx.objects.in_use_count(), before, "no leaked slots");
}

#[test]
fn superclass_chain_objects_share_lifetime() {
    let mut ctx = vm();
    let a = ClassSynth::new("fix/A")
        .superclass("java/lang/Object")
        .field(FieldAccessFlags::PUBLIC, "a", "I")
        .build();
    let b = ClassSynth::new("fix/B")
        .superclass("fix/A")
        .field(FieldAccessFlags::PUBLIC, "b", "I")
        .build();
    define(&mut ctx, a);
    let b_cls = define(&mut ctx, b);

    // lookup indices stack on top of inherited ones
    let a_cls = ctx.classes.by_name("fix/A").unwrap();
    assert_eq!(ctx.classes.entry(a_cls).unwrap().num_instance_lookups, 1);
    assert_eq!(ctx.classes.entry(b_cls).unwrap().num_instance_lookups, 2);

    let before = ctx.objects.in_use_count();
    let system_thread = ctx.system_thread;
    let hash = instance_new(
        &mut ctx,
        NewInstance {
            class: b_cls,
            special: Special::None,
            lengths: Vec::new(),
            run_init: false,
            thread: system_thread,
        },
    )
    .unwrap();

    let entry = ctx.objects.entry(hash).unwrap();
    assert_eq!(entry.fields.len(), 2);
    let super_hash = entry.superclass;
    assert!(ctx.objects.entry(super_hash).is_some());
    assert_eq!(ctx.objects.class_of(super_hash), Some(a_cls));

    // the whole chain goes away with its owner
    instance_delete(&mut ctx, hash);
    assert!(ctx.objects.entry(super_hash).is_none());
    assert_eq!(ctx.objects.in_use_count(), before);
}

#[test]
fn mkref_rmref_pair_leaves_counts_unchanged() {
    let mut ctx = vm();
    ctx.gc = Box::new(CountingCollector::default());
    let system_thread = ctx.system_thread;
    let clsidx = class::load(&mut ctx, "java/lang/Object", system_thread).unwrap();

    let make = |ctx: &mut lungo::JvmContext| {
        instance_new(
            ctx,
            NewInstance {
                class: clsidx,
                special: Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: ctx.system_thread,
            },
        )
        .unwrap()
    };
    let a = make(&mut ctx);
    let b = make(&mut ctx);

    let before = ctx.objects.entry(b).unwrap().references;
    ctx.gc.object_mkref_from_object(&mut ctx.objects, a, b);
    assert_eq!(ctx.objects.entry(b).unwrap().references, before + 1);
    ctx.gc.object_rmref_from_object(&mut ctx.objects, a, b);
    assert_eq!(ctx.objects.entry(b).unwrap().references, before);
}

#[test]
fn anewarray_handles_zero_and_negative_counts() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Arr");
    let object_cls = synth.cp_class("java/lang/Object");
    let [hi, lo] = object_cls.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "empty",
            "()I",
            1,
            0,
            // zero-length arrays are valid
            vec![0x03, 0xbd, hi, lo, 0xbe, 0xac], // iconst_0 anewarray arraylength ireturn
        )
        .method(
            STATIC,
            "negative",
            "()V",
            1,
            0,
            vec![0x02, 0xbd, hi, lo, 0x57, 0xb1], // iconst_m1 anewarray pop return
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "empty", "()I").unwrap(),
        Some(JValue::Int(0))
    );
    let err = call_static(&mut ctx, clsidx, "negative", "()V").unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/NegativeArraySizeException"
    );
}

#[test]
fn primitive_array_store_and_load() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/IntArr")
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "test",
            "()I",
            3,
            1,
            vec![
                0x10, 5, // bipush 5
                0xbc, 10, // newarray int
                0x4b, // astore_0
                0x2a, // aload_0
                0x03, // iconst_0
                0x10, 99, // bipush 99
                0x4f, // iastore
                0x2a, // aload_0
                0x03, // iconst_0
                0x2e, // iaload
                0xac, // ireturn
            ],
        )
        .method(
            STATIC,
            "out_of_bounds",
            "()I",
            2,
            1,
            vec![
                0x10, 2, // bipush 2
                0xbc, 10, // newarray int
                0x4b, // astore_0
                0x2a, // aload_0
                0x10, 7, // bipush 7
                0x2e, // iaload
                0xac,
            ],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(99))
    );
    let err = call_static(&mut ctx, clsidx, "out_of_bounds", "()I").unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/ArrayIndexOutOfBoundsException"
    );
}

#[test]
fn multianewarray_builds_every_dimension() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Multi");
    let array_cls = synth.cp_class("[[I");
    let [hi, lo] = array_cls.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "make",
            "()Ljava/lang/Object;",
            2,
            0,
            vec![0x06, 0x05, 0xc5, hi, lo, 0x02, 0xb0], // iconst_3 iconst_2 multianewarray 2 areturn
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let value = call_static(&mut ctx, clsidx, "make", "()Ljava/lang/Object;").unwrap();
    let Some(JValue::Reference(outer)) = value else {
        panic!("no array came back");
    };

    let entry = ctx.objects.entry(outer).unwrap();
    assert_eq!(entry.dimensions, 2);
    assert_eq!(entry.lengths, vec![3, 2]);

    // total addressable storage is the product of the length vector
    let mut elements = 0;
    for i in 0..3 {
        let Ok(JValue::Reference(sub)) = ctx.objects.array_get(outer, i) else {
            panic!("missing sub-array {i}");
        };
        let sub_entry = ctx.objects.entry(sub).unwrap();
        assert_eq!(sub_entry.dimensions, 1);
        assert_eq!(sub_entry.lengths, vec![2]);
        assert!(sub_entry
            .status
            .contains(lungo::object::ObjectStatus::SUBARRAY));
        elements += sub_entry.lengths[0];
    }
    assert_eq!(elements, 3 * 2);
}

#[test]
fn instance_fields_move_through_put_and_get() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Box");
    let ctor = synth.cp_methodref("fix/Box", "<init>", "()V");
    let field = synth.cp_fieldref("fix/Box", "held", "I");
    let own = synth.cp_class("fix/Box");
    let [c_hi, c_lo] = ctor.to_be_bytes();
    let [f_hi, f_lo] = field.to_be_bytes();
    let [o_hi, o_lo] = own.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .field(FieldAccessFlags::PUBLIC, "held", "I")
        .method(MethodAccessFlags::PUBLIC, "<init>", "()V", 1, 1, vec![0xb1])
        .method(
            STATIC,
            "test",
            "()I",
            3,
            1,
            vec![
                0xbb, o_hi, o_lo, // new fix/Box
                0x59, // dup
                0xb7, c_hi, c_lo, // invokespecial <init>
                0x4b, // astore_0
                0x2a, // aload_0
                0x10, 41, // bipush 41
                0xb5, f_hi, f_lo, // putfield held
                0x2a, // aload_0
                0xb4, f_hi, f_lo, // getfield held
                0xac, // ireturn
            ],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(41))
    );
}

#[test]
fn getfield_on_null_raises_npe() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Null");
    let field = synth.cp_fieldref("fix/Null", "v", "I");
    let [hi, lo] = field.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .field(FieldAccessFlags::PUBLIC, "v", "I")
        .method(
            STATIC,
            "test",
            "()I",
            1,
            0,
            vec![0x01, 0xb4, hi, lo, 0xac], // aconst_null getfield ireturn
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let err = call_static(&mut ctx, clsidx, "test", "()I").unwrap_err();
    assert_eq!(err.class_name.as_ref(), "java/lang/NullPointerException");
}

#[test]
fn checkcast_and_instanceof_walk_the_hierarchy() {
    let mut ctx = vm();
    let a = ClassSynth::new("fix/Animal")
        .superclass("java/lang/Object")
        .method(MethodAccessFlags::PUBLIC, "<init>", "()V", 1, 1, vec![0xb1])
        .build();
    define(&mut ctx, a);

    let mut synth = ClassSynth::new("fix/Cat");
    let ctor = synth.cp_methodref("fix/Cat", "<init>", "()V");
    let own = synth.cp_class("fix/Cat");
    let animal = synth.cp_class("fix/Animal");
    let [c_hi, c_lo] = ctor.to_be_bytes();
    let [o_hi, o_lo] = own.to_be_bytes();
    let [a_hi, a_lo] = animal.to_be_bytes();
    let cf = synth
        .superclass("fix/Animal")
        .method(MethodAccessFlags::PUBLIC, "<init>", "()V", 1, 1, vec![0xb1])
        .method(
            STATIC,
            "upcast",
            "()I",
            2,
            0,
            vec![
                0xbb, o_hi, o_lo, // new fix/Cat
                0x59, // dup
                0xb7, c_hi, c_lo, // invokespecial <init>
                0xc0, a_hi, a_lo, // checkcast fix/Animal
                0xc1, a_hi, a_lo, // instanceof fix/Animal
                0xac,
            ],
        )
        .build();
    let cat = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, cat, "upcast", "()I").unwrap(),
        Some(JValue::Int(1))
    );
}

#[test]
fn null_object_hash_is_reserved() {
    let ctx = vm();
    assert!(ctx.objects.entry(ObjectHash::NULL).is_none());
}
