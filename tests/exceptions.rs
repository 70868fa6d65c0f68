mod common;

use common::{arm_main, call_static, define, drive_to_death, vm};
use lungo::classfile::synth::ClassSynth;
use lungo::classfile::{ExceptionHandler, FieldAccessFlags, MethodAccessFlags};
use lungo::state::ThreadState;
use lungo::throwable;
use lungo::types::JValue;

const STATIC: MethodAccessFlags = MethodAccessFlags::PUBLIC.union(MethodAccessFlags::STATIC);

#[test]
fn handler_in_the_same_frame_catches() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Catch");
    let catch_type = synth.cp_class("java/lang/ArithmeticException");
    let cf = synth
        .superclass("java/lang/Object")
        .method_with_handlers(
            STATIC,
            "test",
            "()I",
            2,
            0,
            vec![
                0x04, // 0: iconst_1
                0x03, // 1: iconst_0
                0x6c, // 2: idiv <- throws
                0xac, // 3: ireturn
                0x57, // 4: pop (the exception reference)
                0x02, // 5: iconst_m1
                0xac, // 6: ireturn
            ],
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type,
            }],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(-1))
    );
}

#[test]
fn catch_all_handler_matches_any_exception() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/CatchAll")
        .superclass("java/lang/Object")
        .method_with_handlers(
            STATIC,
            "test",
            "()I",
            2,
            0,
            vec![0x04, 0x03, 0x6c, 0xac, 0x57, 0x10, 7, 0xac],
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: 0,
            }],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(7))
    );
}

#[test]
fn unwinding_reaches_a_caller_frame_handler() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Unwind");
    let callee = synth.cp_methodref("fix/Unwind", "boom", "()V");
    let catch_type = synth.cp_class("java/lang/ArithmeticException");
    let [hi, lo] = callee.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "boom",
            "()V",
            2,
            0,
            vec![0x04, 0x03, 0x6c, 0x57, 0xb1], // iconst_1 iconst_0 idiv pop return
        )
        .method_with_handlers(
            STATIC,
            "test",
            "()I",
            1,
            0,
            vec![
                0xb8, hi, lo, // 0: invokestatic boom
                0x03, // 3: iconst_0
                0xac, // 4: ireturn
                0x57, // 5: pop
                0x04, // 6: iconst_1
                0xac, // 7: ireturn
            ],
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 5,
                handler_pc: 5,
                catch_type,
            }],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    assert_eq!(
        call_static(&mut ctx, clsidx, "test", "()I").unwrap(),
        Some(JValue::Int(1))
    );
}

#[test]
fn athrow_carries_the_instance_into_the_handler() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Thrower");
    let exc = synth.cp_class("java/lang/RuntimeException");
    let ctor = synth.cp_methodref("java/lang/RuntimeException", "<init>", "()V");
    let [e_hi, e_lo] = exc.to_be_bytes();
    let [c_hi, c_lo] = ctor.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .method_with_handlers(
            STATIC,
            "test",
            "()Ljava/lang/Object;",
            2,
            0,
            vec![
                0xbb, e_hi, e_lo, // 0: new RuntimeException
                0x59, // 3: dup
                0xb7, c_hi, c_lo, // 4: invokespecial <init>
                0xbf, // 7: athrow
                0xb0, // 8: areturn (the caught instance)
            ],
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 8,
                handler_pc: 8,
                catch_type: 0,
            }],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let value = call_static(&mut ctx, clsidx, "test", "()Ljava/lang/Object;").unwrap();
    let Some(JValue::Reference(hash)) = value else {
        panic!("handler did not return the instance");
    };
    let instance_cls = ctx.objects.class_of(hash).unwrap();
    assert_eq!(
        ctx.classes.name_of(instance_cls).unwrap().as_ref(),
        "java/lang/RuntimeException"
    );
}

#[test]
fn errors_are_not_catchable() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Fatal");
    let missing = synth.cp_fieldref("no/Such", "x", "I");
    let [hi, lo] = missing.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .method_with_handlers(
            STATIC,
            "test",
            "()I",
            1,
            0,
            vec![0xb2, hi, lo, 0xac, 0x02, 0xac], // getstatic -> linkage error
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: 0,
            }],
        )
        .build();
    let clsidx = define(&mut ctx, cf);

    let err = call_static(&mut ctx, clsidx, "test", "()I").unwrap_err();
    assert_eq!(err.class_name.as_ref(), "java/lang/NoClassDefFoundError");
}

#[test]
fn uncaught_exception_completes_the_thread() {
    let mut ctx = vm();
    let mut synth = ClassSynth::new("fix/Npe");
    let field = synth.cp_fieldref("fix/Npe", "v", "I");
    let [hi, lo] = field.to_be_bytes();
    let cf = synth
        .superclass("java/lang/Object")
        .field(FieldAccessFlags::PUBLIC, "v", "I")
        .method(
            STATIC,
            "main",
            "([Ljava/lang/String;)V",
            1,
            1,
            vec![0x01, 0xb4, hi, lo, 0x57, 0xb1], // aconst_null getfield pop return
        )
        .build();
    let clsidx = define(&mut ctx, cf);
    let main = arm_main(&mut ctx, clsidx);

    let trace = drive_to_death(&mut ctx, main, 32);
    assert_eq!(trace.last(), Some(&ThreadState::Dead));
    assert!(trace.contains(&ThreadState::Complete));
    assert_eq!(ctx.uncaught_count, 1, "uncaughtException path ran");
}

#[test]
fn unloadable_throwable_retries_as_linkage_error() {
    let mut ctx = vm();
    let thridx = ctx.system_thread;
    let hash = throwable::load_run_throwable(&mut ctx, "no/Such/Throwable", thridx).unwrap();
    let clsidx = ctx.objects.class_of(hash).unwrap();
    assert_eq!(
        ctx.classes.name_of(clsidx).unwrap().as_ref(),
        "java/lang/LinkageError"
    );
    assert_eq!(ctx.linkage_error_guard, 0, "the guard unwinds fully");
}
