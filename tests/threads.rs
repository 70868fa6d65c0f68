mod common;

use std::time::{Duration, Instant};

use common::{arm_main, define, drive_to_death, new_thread, round, vm};
use lungo::classfile::synth::ClassSynth;
use lungo::classfile::{FieldAccessFlags, MethodAccessFlags};
use lungo::monitor;
use lungo::state::{self, ThreadState};
use lungo::thread::ThreadFlags;
use lungo::types::{JValue, ThreadIndex};

const STATIC: MethodAccessFlags = MethodAccessFlags::PUBLIC.union(MethodAccessFlags::STATIC);

#[test]
fn trivial_main_walks_the_whole_lifecycle() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Trivial")
        .superclass("java/lang/Object")
        .method(STATIC, "main", "([Ljava/lang/String;)V", 0, 1, vec![0xb1])
        .build();
    let clsidx = define(&mut ctx, cf);
    let main = arm_main(&mut ctx, clsidx);

    let trace = drive_to_death(&mut ctx, main, 32);
    assert_eq!(
        trace,
        vec![
            ThreadState::New,
            ThreadState::Start,
            ThreadState::Runnable,
            ThreadState::Running,
            ThreadState::Complete,
            ThreadState::Dead,
        ]
    );
}

#[test]
fn dead_threads_give_their_slot_back() {
    let mut ctx = vm();
    let cf = ClassSynth::new("fix/Quick")
        .superclass("java/lang/Object")
        .method(STATIC, "main", "([Ljava/lang/String;)V", 0, 1, vec![0xb1])
        .build();
    let clsidx = define(&mut ctx, cf);
    let main = arm_main(&mut ctx, clsidx);

    drive_to_death(&mut ctx, main, 32);
    // one reclamation round after dead
    round(&mut ctx);
    round(&mut ctx);
    assert!(ctx.threads.entry(main).is_none(), "slot was reclaimed");
}

fn running_thread(ctx: &mut lungo::JvmContext) -> ThreadIndex {
    let (thridx, _) = new_thread(ctx);
    let te = ctx.threads.entry_mut(thridx).unwrap();
    te.this_state = ThreadState::Running;
    te.next_state = ThreadState::Running;
    thridx
}

#[test]
fn sleep_parks_until_the_deadline() {
    let mut ctx = vm();
    let a = running_thread(&mut ctx);

    {
        let te = ctx.threads.entry_mut(a).unwrap();
        te.flags |= ThreadFlags::SLEEPING;
        te.sleep_deadline = Some(Instant::now() + Duration::from_millis(30));
    }
    state::request(&mut ctx, a, ThreadState::BlockingEvent);

    state::tick(&mut ctx, a); // blockingevent
    state::tick(&mut ctx, a); // blocked
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Blocked);
    state::tick(&mut ctx, a); // still blocked, deadline in the future
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Blocked);

    std::thread::sleep(Duration::from_millis(40));
    state::tick(&mut ctx, a); // deadline passed -> unblocked requested
    state::tick(&mut ctx, a); // unblocked
    state::tick(&mut ctx, a); // runnable
    let te = ctx.threads.entry(a).unwrap();
    assert_eq!(te.this_state, ThreadState::Runnable);
    assert!(!te.flags.contains(ThreadFlags::SLEEPING));
    assert!(te.pending_throwable.is_none());
}

#[test]
fn interrupt_wakes_a_sleeper_with_interrupted_exception() {
    let mut ctx = vm();
    let a = running_thread(&mut ctx);

    {
        let te = ctx.threads.entry_mut(a).unwrap();
        te.flags |= ThreadFlags::SLEEPING;
        te.sleep_deadline = Some(Instant::now() + Duration::from_secs(3600));
    }
    state::request(&mut ctx, a, ThreadState::BlockingEvent);
    state::tick(&mut ctx, a);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Blocked);

    ctx.threads.entry_mut(a).unwrap().flags |= ThreadFlags::INTERRUPTED;
    state::tick(&mut ctx, a); // interrupt noticed
    state::tick(&mut ctx, a); // unblocked
    state::tick(&mut ctx, a); // runnable
    let te = ctx.threads.entry(a).unwrap();
    assert_eq!(te.this_state, ThreadState::Runnable);
    assert_eq!(
        te.pending_throwable.as_deref(),
        Some("java/lang/InterruptedException")
    );
}

#[test]
fn join_unblocks_when_the_target_dies() {
    let mut ctx = vm();
    let a = running_thread(&mut ctx);
    let b = running_thread(&mut ctx);

    {
        let te = ctx.threads.entry_mut(a).unwrap();
        te.flags |= ThreadFlags::JOIN4EVER;
        te.join_target = b;
    }
    state::request(&mut ctx, a, ThreadState::BlockingEvent);
    state::tick(&mut ctx, a);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Blocked);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Blocked);

    // b finishes
    state::request(&mut ctx, b, ThreadState::Complete);
    state::tick(&mut ctx, b); // complete
    state::tick(&mut ctx, b); // dead

    state::tick(&mut ctx, a); // join target dead -> unblocked requested
    state::tick(&mut ctx, a);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Runnable);
}

#[test]
fn deprecated_stop_goes_through_badlogic_and_releases_monitors() {
    let mut ctx = vm();
    let a = running_thread(&mut ctx);
    let o = {
        let system_thread = ctx.system_thread;
        let clsidx = lungo::class::load(&mut ctx, "java/lang/Object", system_thread).unwrap();
        lungo::object::instance_new(
            &mut ctx,
            lungo::object::NewInstance {
                class: clsidx,
                special: lungo::object::Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: system_thread,
            },
        )
        .unwrap()
    };
    assert!(monitor::synchronize(&mut ctx, a, o));
    assert_eq!(ctx.objects.entry(o).unwrap().mlock_thread, a);

    state::request(&mut ctx, a, ThreadState::BadLogic);
    state::tick(&mut ctx, a); // badlogic -> complete requested
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::BadLogic);
    state::tick(&mut ctx, a); // complete: monitors force released
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Complete);
    {
        let entry = ctx.objects.entry(o).unwrap();
        assert_eq!(entry.mlock_count, 0);
        assert_eq!(entry.mlock_thread, ThreadIndex::NULL);
    }
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Dead);
}

#[test]
fn illegal_transition_collapses_into_badlogic() {
    let mut ctx = vm();
    let (a, _) = new_thread(&mut ctx);
    // new -> running is not a legal request
    ctx.threads.entry_mut(a).unwrap().next_state = ThreadState::Running;
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::BadLogic);
}

#[test]
fn started_thread_runs_its_run_method() {
    let mut ctx = vm();

    let mut synth = ClassSynth::new("fix/Worker");
    let done = synth.cp_fieldref("fix/Worker", "done", "I");
    let [d_hi, d_lo] = done.to_be_bytes();
    let worker = synth
        .superclass("java/lang/Thread")
        .field(
            FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC,
            "done",
            "I",
        )
        .method(MethodAccessFlags::PUBLIC, "<init>", "()V", 1, 1, vec![0xb1])
        .method(
            MethodAccessFlags::PUBLIC,
            "run",
            "()V",
            1,
            1,
            vec![0x04, 0xb3, d_hi, d_lo, 0xb1], // iconst_1 putstatic done return
        )
        .build();
    let worker_cls = define(&mut ctx, worker);

    let mut synth = ClassSynth::new("fix/Spawner");
    let ctor = synth.cp_methodref("fix/Worker", "<init>", "()V");
    let start = synth.cp_methodref("java/lang/Thread", "start", "()V");
    let worker_ref = synth.cp_class("fix/Worker");
    let [c_hi, c_lo] = ctor.to_be_bytes();
    let [s_hi, s_lo] = start.to_be_bytes();
    let [w_hi, w_lo] = worker_ref.to_be_bytes();
    let spawner = synth
        .superclass("java/lang/Object")
        .method(
            STATIC,
            "main",
            "([Ljava/lang/String;)V",
            2,
            1,
            vec![
                0xbb, w_hi, w_lo, // new fix/Worker
                0x59, // dup
                0xb7, c_hi, c_lo, // invokespecial <init>
                0xb6, s_hi, s_lo, // invokevirtual start
                0xb1, // return
            ],
        )
        .build();
    let spawner_cls = define(&mut ctx, spawner);

    let main = arm_main(&mut ctx, spawner_cls);
    drive_to_death(&mut ctx, main, 64);
    // keep the machine ticking until the worker finishes too
    for _ in 0..64 {
        round(&mut ctx);
    }

    let entry = ctx.classes.entry(worker_cls).unwrap();
    assert_eq!(entry.statics, vec![JValue::Int(1)], "run() stored its flag");
}
