mod common;

use common::{new_thread, vm};
use lungo::monitor;
use lungo::object::ObjectStatus;
use lungo::state::{self, ThreadState};
use lungo::types::{ObjectHash, ThreadIndex};

fn make_running(ctx: &mut lungo::JvmContext) -> ThreadIndex {
    let (thridx, _) = new_thread(ctx);
    let te = ctx.threads.entry_mut(thridx).unwrap();
    te.this_state = ThreadState::Running;
    te.next_state = ThreadState::Running;
    thridx
}

fn plain_object(ctx: &mut lungo::JvmContext) -> ObjectHash {
    let clsidx = lungo::class::load(ctx, "java/lang/Object", ctx.system_thread).unwrap();
    lungo::object::instance_new(
        ctx,
        lungo::object::NewInstance {
            class: clsidx,
            special: lungo::object::Special::None,
            lengths: Vec::new(),
            run_init: false,
            thread: ctx.system_thread,
        },
    )
    .unwrap()
}

#[test]
fn reentrance_counts_up_and_down() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    assert!(monitor::synchronize(&mut ctx, a, o));
    assert!(monitor::synchronize(&mut ctx, a, o));
    {
        let entry = ctx.objects.entry(o).unwrap();
        assert_eq!(entry.mlock_count, 2);
        assert_eq!(entry.mlock_thread, a);
        assert!(entry.status.contains(ObjectStatus::MLOCK));
    }

    monitor::unsynchronize(&mut ctx, a, o).unwrap();
    {
        let entry = ctx.objects.entry(o).unwrap();
        assert_eq!(entry.mlock_count, 1);
        assert!(entry.status.contains(ObjectStatus::MLOCK));
    }

    monitor::unsynchronize(&mut ctx, a, o).unwrap();
    {
        // count zero iff unlocked
        let entry = ctx.objects.entry(o).unwrap();
        assert_eq!(entry.mlock_count, 0);
        assert_eq!(entry.mlock_thread, ThreadIndex::NULL);
        assert!(!entry.status.contains(ObjectStatus::MLOCK));
    }
}

#[test]
fn only_the_holder_may_release() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let b = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    assert!(monitor::synchronize(&mut ctx, a, o));
    let err = monitor::unsynchronize(&mut ctx, b, o).unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/IllegalMonitorStateException"
    );
    // releasing an unlocked monitor is just as illegal
    monitor::unsynchronize(&mut ctx, a, o).unwrap();
    let err = monitor::unsynchronize(&mut ctx, a, o).unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/IllegalMonitorStateException"
    );
}

#[test]
fn contention_parks_and_reacquires_through_lock_state() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let b = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    assert!(monitor::synchronize(&mut ctx, a, o));
    assert!(!monitor::synchronize(&mut ctx, b, o), "b must contend");
    assert_eq!(ctx.threads.entry(b).unwrap().lock_target, o);
    assert_eq!(ctx.threads.entry(b).unwrap().next_state, ThreadState::Synchronized);

    // synchronized -> lock, then spin in lock while a still holds
    state::tick(&mut ctx, b);
    assert_eq!(ctx.threads.entry(b).unwrap().this_state, ThreadState::Synchronized);
    state::tick(&mut ctx, b);
    assert_eq!(ctx.threads.entry(b).unwrap().this_state, ThreadState::Lock);
    state::tick(&mut ctx, b);
    assert_eq!(ctx.threads.entry(b).unwrap().this_state, ThreadState::Lock);

    monitor::unsynchronize(&mut ctx, a, o).unwrap();

    // next contention attempt wins: lock -> acquire -> runnable
    state::tick(&mut ctx, b);
    assert_eq!(ctx.threads.entry(b).unwrap().next_state, ThreadState::Acquire);
    state::tick(&mut ctx, b);
    state::tick(&mut ctx, b);
    assert_eq!(ctx.threads.entry(b).unwrap().this_state, ThreadState::Runnable);

    let entry = ctx.objects.entry(o).unwrap();
    assert_eq!(entry.mlock_thread, b);
    assert_eq!(entry.mlock_count, 1);
    assert!(ctx.threads.entry(b).unwrap().lock_target.is_null());
}

#[test]
fn wait_notify_handshake() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let b = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    // a holds the monitor and calls wait()
    assert!(monitor::synchronize(&mut ctx, a, o));
    monitor::wait_on(&mut ctx, a, o, 0).unwrap();
    assert_eq!(ctx.threads.entry(a).unwrap().next_state, ThreadState::Release);

    // running -> release -> wait; the release action frees the lock
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Release);
    assert_eq!(ctx.objects.entry(o).unwrap().mlock_count, 0);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Wait);

    // b takes the monitor, notifies, releases
    assert!(monitor::synchronize(&mut ctx, b, o));
    monitor::notify(&mut ctx, b, o, false).unwrap();
    monitor::unsynchronize(&mut ctx, b, o).unwrap();

    // wait -> notify -> lock -> acquire -> runnable
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().next_state, ThreadState::Notify);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Notify);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Lock);
    state::tick(&mut ctx, a);
    state::tick(&mut ctx, a);
    assert_eq!(ctx.threads.entry(a).unwrap().this_state, ThreadState::Runnable);

    let entry = ctx.objects.entry(o).unwrap();
    assert_eq!(entry.mlock_thread, a);
    assert_eq!(entry.mlock_count, 1);
}

#[test]
fn wait_restores_reentrance_depth_on_reacquisition() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    assert!(monitor::synchronize(&mut ctx, a, o));
    assert!(monitor::synchronize(&mut ctx, a, o));
    monitor::wait_on(&mut ctx, a, o, 0).unwrap();
    state::tick(&mut ctx, a); // release
    assert_eq!(ctx.objects.entry(o).unwrap().mlock_count, 0);
    state::tick(&mut ctx, a); // wait

    if let Some(te) = ctx.threads.entry_mut(a) {
        te.flags |= lungo::thread::ThreadFlags::NOTIFIED;
    }
    state::tick(&mut ctx, a); // wait notices
    state::tick(&mut ctx, a); // notify
    state::tick(&mut ctx, a); // lock: reacquires
    assert_eq!(ctx.objects.entry(o).unwrap().mlock_count, 2);
    assert_eq!(ctx.objects.entry(o).unwrap().mlock_thread, a);
}

#[test]
fn wait_without_holding_is_illegal() {
    let mut ctx = vm();
    let a = make_running(&mut ctx);
    let o = plain_object(&mut ctx);

    let err = monitor::wait_on(&mut ctx, a, o, 0).unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/IllegalMonitorStateException"
    );
    let err = monitor::notify(&mut ctx, a, o, true).unwrap_err();
    assert_eq!(
        err.class_name.as_ref(),
        "java/lang/IllegalMonitorStateException"
    );
}
