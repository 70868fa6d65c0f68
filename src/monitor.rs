//! Object monitors and wait/notify coordination.
//!
//! Every object carries a monitor: a holder thread index and a
//! reentrance count, zero iff unlocked.  Contention and waiting are
//! expressed purely as thread state transitions; the monitor itself
//! never parks anything.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::jvm::JvmContext;
use crate::object::ObjectStatus;
use crate::state::{self, ThreadState};
use crate::thread::ThreadFlags;
use crate::types::{ObjectHash, ThreadIndex, Thrown};

/// Attempts to acquire `hash`'s monitor for `thridx`.
///
/// Succeeds when the monitor is free or already held by the caller
/// (reentrance: the count goes up).  On contention the caller's lock
/// target is set and it is sent through `synchronized` into `lock`,
/// where it re-contends once per tick.
pub fn synchronize(ctx: &mut JvmContext, thridx: ThreadIndex, hash: ObjectHash) -> bool {
    let Some(entry) = ctx.objects.entry_mut(hash) else {
        return true; // the null object cannot be locked
    };
    if entry.mlock_count == 0 || entry.mlock_thread == thridx {
        entry.mlock_thread = thridx;
        entry.mlock_count += 1;
        entry.status |= ObjectStatus::MLOCK;
        trace!("{thridx:?} acquired monitor of {hash:?}, count {}", entry.mlock_count);
        return true;
    }
    let holder = entry.mlock_thread;
    if let Some(thread) = ctx.threads.entry_mut(thridx) {
        thread.lock_target = hash;
    }
    debug!("{thridx:?} contends for monitor of {hash:?} held by {holder:?}");
    state::request(ctx, thridx, ThreadState::Synchronized);
    false
}

/// Releases one reentrance level; the monitor clears when the count
/// reaches zero.  Only the holder may release.
pub fn unsynchronize(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    hash: ObjectHash,
) -> Result<(), Thrown> {
    let Some(entry) = ctx.objects.entry_mut(hash) else {
        return Err(Thrown::exception("java/lang/NullPointerException"));
    };
    if entry.mlock_count == 0 || entry.mlock_thread != thridx {
        return Err(Thrown::exception(
            "java/lang/IllegalMonitorStateException",
        ));
    }
    entry.mlock_count -= 1;
    if entry.mlock_count == 0 {
        entry.mlock_thread = ThreadIndex::NULL;
        entry.status.remove(ObjectStatus::MLOCK);
    }
    trace!("{thridx:?} released monitor of {hash:?}, count {}", entry.mlock_count);
    Ok(())
}

/// One contention attempt, the processing action of the `lock` state.
///
/// On success the saved reentrance depth of a post-wait reacquisition
/// is restored and the lock target cleared.
pub fn contend(ctx: &mut JvmContext, thridx: ThreadIndex) -> bool {
    let (target, saved) = match ctx.threads.entry(thridx) {
        Some(e) => (e.lock_target, e.saved_lock_count),
        None => return false,
    };
    if target.is_null() {
        return true;
    }
    let Some(entry) = ctx.objects.entry_mut(target) else {
        return true; // the object died while we were parked
    };
    if entry.mlock_count != 0 && entry.mlock_thread != thridx {
        return false;
    }
    entry.mlock_thread = thridx;
    entry.mlock_count = if saved > 0 { saved } else { entry.mlock_count + 1 };
    entry.status |= ObjectStatus::MLOCK;
    if let Some(thread) = ctx.threads.entry_mut(thridx) {
        thread.lock_target = ObjectHash::NULL;
        thread.saved_lock_count = 0;
        thread.flags.remove(ThreadFlags::NOTIFIED);
    }
    debug!("{thridx:?} acquired contended monitor of {target:?}");
    true
}

/// Begins an `Object.wait()`: the caller must hold the monitor.  The
/// wait flags and deadline are set and the thread is sent through
/// `release` into `wait`; the actual lock release happens in the
/// `release` state action.
pub fn wait_on(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    hash: ObjectHash,
    timeout_ms: i64,
) -> Result<(), Thrown> {
    let holds = ctx
        .objects
        .entry(hash)
        .is_some_and(|e| e.mlock_count > 0 && e.mlock_thread == thridx);
    if !holds {
        return Err(Thrown::exception(
            "java/lang/IllegalMonitorStateException",
        ));
    }
    if let Some(thread) = ctx.threads.entry_mut(thridx) {
        thread.lock_target = hash;
        if timeout_ms > 0 {
            thread.flags |= ThreadFlags::WAITTIMED;
            thread.sleep_deadline =
                Some(Instant::now() + Duration::from_millis(timeout_ms as u64));
        } else {
            thread.flags |= ThreadFlags::WAIT4EVER;
        }
    }
    state::request(ctx, thridx, ThreadState::Release);
    Ok(())
}

/// The `release` state action: give up the monitor entirely,
/// preserving the reentrance depth and the lock target so the
/// post-wait path can reacquire.
pub fn release_to_wait(ctx: &mut JvmContext, thridx: ThreadIndex) {
    let target = match ctx.threads.entry(thridx) {
        Some(e) => e.lock_target,
        None => return,
    };
    let Some(entry) = ctx.objects.entry_mut(target) else {
        return;
    };
    if entry.mlock_thread != thridx {
        return;
    }
    let depth = entry.mlock_count;
    entry.mlock_count = 0;
    entry.mlock_thread = ThreadIndex::NULL;
    entry.status.remove(ObjectStatus::MLOCK);
    if let Some(thread) = ctx.threads.entry_mut(thridx) {
        thread.saved_lock_count = depth;
    }
    trace!("{thridx:?} released monitor of {target:?} for wait (depth {depth})");
}

/// Moves one (or all) threads waiting on `hash` from `wait` towards
/// `notify`; the transient advance rule then pushes them into `lock`
/// to contend for the monitor again.
pub fn notify(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    hash: ObjectHash,
    all: bool,
) -> Result<(), Thrown> {
    let holds = ctx
        .objects
        .entry(hash)
        .is_some_and(|e| e.mlock_count > 0 && e.mlock_thread == thridx);
    if !holds {
        return Err(Thrown::exception(
            "java/lang/IllegalMonitorStateException",
        ));
    }
    let waiters: Vec<ThreadIndex> = ctx
        .threads
        .iter_in_use()
        .filter(|&t| {
            ctx.threads.entry(t).is_some_and(|e| {
                e.this_state == ThreadState::Wait && e.lock_target == hash
            })
        })
        .collect();
    for waiter in waiters {
        debug!("{thridx:?} notifies {waiter:?} on {hash:?}");
        if let Some(entry) = ctx.threads.entry_mut(waiter) {
            entry.flags |= ThreadFlags::NOTIFIED;
            entry.flags.remove(ThreadFlags::WAIT4EVER | ThreadFlags::WAITTIMED);
        }
        if !all {
            break;
        }
    }
    Ok(())
}

/// Unconditionally clears a monitor; used when the holding thread
/// dies without unwinding.
pub fn force_release(ctx: &mut JvmContext, hash: ObjectHash) {
    if let Some(entry) = ctx.objects.entry_mut(hash) {
        entry.mlock_thread = ThreadIndex::NULL;
        entry.mlock_count = 0;
        entry.status.remove(ObjectStatus::MLOCK);
    }
}
