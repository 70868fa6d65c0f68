//! The thread state machine.
//!
//! States are a tagged variant; whether a transition is legal is a
//! pure function of the (state, state) pair.  The per-tick driver
//! keeps the observable three-phase split: request validation,
//! activation, processing.

use std::time::Instant;

use log::{debug, error, trace};

use crate::jvm::JvmContext;
use crate::thread::{self, ThreadFlags};
use crate::types::{ObjectHash, ThreadIndex};

/// Thread lifecycle states.  The `(+)` states of the transition table
/// are transient: their processing action unconditionally requests a
/// further transition, producing the appearance of immediate advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadState {
    New,
    /// Transient: `Thread.start()` was called.
    Start,
    Runnable,
    Running,
    /// Transient: a blocking event (sleep, join, interruptible I/O)
    /// was requested.
    BlockingEvent,
    Blocked,
    /// Transient: the blocking condition cleared.
    Unblocked,
    /// Transient: entering a `synchronized` region.
    Synchronized,
    /// Transient: `Object.wait()` is giving up the monitor.
    Release,
    Wait,
    /// Transient: woken by notify/notifyAll/interrupt.
    Notify,
    /// Contending for a monitor.
    Lock,
    /// Transient: the monitor was obtained.
    Acquire,
    /// Transient: the thread finished or was killed.
    Complete,
    Dead,
    /// Diagnostic state forced by illegal transitions and the
    /// deprecated stop/suspend operations.
    BadLogic,
}

/// The transition predicate: is `next` a legal successor of `this`?
///
/// Forcing [ThreadState::BadLogic] is always legal; that is what
/// illegal requests collapse into.
pub fn transition_allowed(this: ThreadState, next: ThreadState) -> bool {
    use ThreadState::*;
    match next {
        New => false, // entered only by slot allocation
        Start => this == New,
        Runnable => matches!(this, Start | Running | Unblocked | Acquire),
        Running => this == Runnable,
        BlockingEvent => matches!(this, Running | BadLogic),
        Blocked => this == BlockingEvent,
        Unblocked => this == Blocked,
        Synchronized => this == Running,
        Release => this == Running,
        Wait => this == Release,
        Notify => this == Wait,
        Lock => matches!(this, Synchronized | Notify),
        Acquire => this == Lock,
        Complete => matches!(this, New | Running | BadLogic),
        Dead => this == Complete,
        BadLogic => true,
    }
}

/// Requests a transition for the next tick.  Returns false (and
/// leaves the request in place to be collapsed into badlogic by phase
/// one) when the transition is illegal.
pub fn request(ctx: &mut JvmContext, thridx: ThreadIndex, next: ThreadState) -> bool {
    let Some(entry) = ctx.threads.entry_mut(thridx) else {
        return false;
    };
    let allowed = transition_allowed(entry.this_state, next);
    trace!(
        "{thridx:?}: request {:?} -> {next:?} ({})",
        entry.this_state,
        if allowed { "ok" } else { "ILLEGAL" }
    );
    entry.next_state = next;
    allowed
}

/// One tick of the three-phase driver for a single in-use thread.
pub fn tick(ctx: &mut JvmContext, thridx: ThreadIndex) {
    // phase 1: validate the pending request
    if let Some(entry) = ctx.threads.entry_mut(thridx) {
        if entry.next_state != entry.this_state
            && !transition_allowed(entry.this_state, entry.next_state)
        {
            error!(
                "{thridx:?}: illegal transition {:?} -> {:?}",
                entry.this_state, entry.next_state
            );
            entry.next_state = ThreadState::BadLogic;
        }
    } else {
        return;
    }

    // phase 2: activation
    let this_state = {
        let entry = match ctx.threads.entry_mut(thridx) {
            Some(e) => e,
            None => return,
        };
        entry.prev_state = entry.this_state;
        entry.this_state = entry.next_state;
        entry.this_state
    };

    // phase 3: the state's action
    process(ctx, thridx, this_state);
}

fn process(ctx: &mut JvmContext, thridx: ThreadIndex, state: ThreadState) {
    use ThreadState::*;
    match state {
        New => {}
        Start => {
            request(ctx, thridx, Runnable);
        }
        Runnable => {} // the scheduler promotes runnable threads
        Running => {
            crate::opcode::run(ctx, thridx, true);
            // an expired timeslice rotates the thread back behind its
            // peers; blocking and completion set their own successor
            if ctx
                .threads
                .entry(thridx)
                .is_some_and(|e| e.this_state == Running && e.next_state == Running)
            {
                request(ctx, thridx, Runnable);
            }
        }
        BlockingEvent => {
            request(ctx, thridx, Blocked);
        }
        Blocked => {
            if blocked_condition_cleared(ctx, thridx) {
                request(ctx, thridx, Unblocked);
            }
        }
        Unblocked => {
            if let Some(entry) = ctx.threads.entry_mut(thridx) {
                entry.flags.remove(ThreadFlags::BLOCKING);
                entry.sleep_deadline = None;
                entry.join_target = crate::types::ThreadIndex::NULL;
            }
            request(ctx, thridx, Runnable);
        }
        Synchronized => {
            request(ctx, thridx, Lock);
        }
        Lock => {
            // one contention attempt per tick
            if crate::monitor::contend(ctx, thridx) {
                request(ctx, thridx, Acquire);
            }
        }
        Acquire => {
            request(ctx, thridx, Runnable);
        }
        Release => {
            crate::monitor::release_to_wait(ctx, thridx);
            request(ctx, thridx, Wait);
        }
        Wait => {
            if wait_condition_cleared(ctx, thridx) {
                request(ctx, thridx, Notify);
            }
        }
        Notify => {
            request(ctx, thridx, Lock);
        }
        Complete => {
            on_complete(ctx, thridx);
            request(ctx, thridx, Dead);
        }
        Dead => {
            // stay dead for one full round so joiners observe it, then
            // reclaim the slot
            if ctx
                .threads
                .entry(thridx)
                .is_some_and(|e| e.prev_state == Dead)
            {
                thread::thread_delete(ctx, thridx);
            }
        }
        BadLogic => {
            let next = ctx.threads.entry(thridx).map(|e| e.next_state);
            if next != Some(BlockingEvent) {
                debug!("{thridx:?}: badlogic, killing the thread");
                request(ctx, thridx, Complete);
            }
        }
    }
}

fn blocked_condition_cleared(ctx: &mut JvmContext, thridx: ThreadIndex) -> bool {
    let Some(entry) = ctx.threads.entry(thridx) else {
        return false;
    };
    let flags = entry.flags;
    let deadline = entry.sleep_deadline;
    let join_target = entry.join_target;

    if flags.contains(ThreadFlags::INTERRUPTED) {
        // blocking operations convert a pending interrupt into
        // InterruptedException on the way out
        if let Some(entry) = ctx.threads.entry_mut(thridx) {
            entry.pending_throwable = Some("java/lang/InterruptedException".into());
        }
        return true;
    }
    if flags.intersects(ThreadFlags::SLEEPING | ThreadFlags::JOINTIMED) {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
    }
    if flags.intersects(ThreadFlags::JOIN4EVER | ThreadFlags::JOINTIMED) {
        let target_gone = match ctx.threads.entry(join_target) {
            None => true,
            Some(target) => target.this_state == ThreadState::Dead,
        };
        if target_gone {
            return true;
        }
    }
    false
}

fn wait_condition_cleared(ctx: &mut JvmContext, thridx: ThreadIndex) -> bool {
    let Some(entry) = ctx.threads.entry(thridx) else {
        return false;
    };
    let flags = entry.flags;
    let deadline = entry.sleep_deadline;

    if flags.contains(ThreadFlags::NOTIFIED) {
        return true;
    }
    if flags.contains(ThreadFlags::INTERRUPTED) {
        if let Some(entry) = ctx.threads.entry_mut(thridx) {
            entry.pending_throwable = Some("java/lang/InterruptedException".into());
        }
        return true;
    }
    if flags.contains(ThreadFlags::WAITTIMED) {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
    }
    false
}

/// Completion cleanup: monitors held by the dying thread are scanned
/// and force released (the deprecated stop path depends on this), and
/// the thread object is unlinked.
fn on_complete(ctx: &mut JvmContext, thridx: ThreadIndex) {
    let held: Vec<ObjectHash> = ctx
        .objects
        .iter_in_use()
        .filter(|&h| {
            ctx.objects
                .entry(h)
                .is_some_and(|e| e.mlock_thread == thridx)
        })
        .collect();
    for hash in held {
        debug!("{thridx:?}: force releasing monitor of {hash:?} on completion");
        crate::monitor::force_release(ctx, hash);
    }
    if let Some(entry) = ctx.threads.entry_mut(thridx) {
        entry.lock_target = ObjectHash::NULL;
    }
}
