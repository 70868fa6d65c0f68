//! Exception and throwable dispatch: the canonical "raise this
//! condition" path, handler search over the frame stack, and the
//! recursion-guarded double-fault handler.

use log::{debug, error, warn};

use crate::class;
use crate::classfile::MethodAccessFlags;
use crate::gc::GcPolicy;
use crate::jvm::{ExitCategory, JvmContext};
use crate::monitor;
use crate::object::{self, NewInstance, Special};
use crate::thread::ThreadFlags;
use crate::types::{JValue, ObjectHash, TableIndex, ThreadIndex, Thrown, ThrownKind};

/// What became of a thrown event.
#[derive(Debug)]
pub enum Disposition {
    /// A handler accepted it; the thread's program counter points at
    /// the handler and execution resumes.
    Resumed,
    /// No handler between here and the invocation floor; the caller
    /// decides (uncaught processing at top level, propagation for
    /// nested invocations).
    Unhandled(Thrown),
}

/// Classifies and routes a thrown event that non-locally returned into
/// the dispatch loop.
pub fn dispatch(ctx: &mut JvmContext, thridx: ThreadIndex, mut thrown: Thrown) -> Disposition {
    debug!("{thridx:?} threw {} ({:?})", thrown.class_name, thrown.kind);
    if let Some(te) = ctx.threads.entry_mut(thridx) {
        te.flags |= match thrown.kind {
            ThrownKind::Exception => ThreadFlags::THREW_EXCEPTION,
            ThrownKind::Error => ThreadFlags::THREW_ERROR,
            ThrownKind::Throwable => ThreadFlags::THREW_THROWABLE,
        };
        te.pending_throwable = None;
    }

    // materialize the throwable instance unless athrow supplied one
    if thrown.instance.is_null() {
        match load_run_throwable(ctx, &thrown.class_name.clone(), thridx) {
            Ok(hash) => thrown.instance = hash,
            Err(fault) => return Disposition::Unhandled(fault),
        }
    }

    // only Exception-kind events are recoverable; Error and bare
    // Throwable take the thread down
    if thrown.kind == ThrownKind::Exception && find_handler(ctx, thridx, &thrown) {
        if let Some(te) = ctx.threads.entry_mut(thridx) {
            te.flags.remove(
                ThreadFlags::THREW_EXCEPTION
                    | ThreadFlags::THREW_ERROR
                    | ThreadFlags::THREW_THROWABLE,
            );
        }
        return Disposition::Resumed;
    }
    Disposition::Unhandled(thrown)
}

/// Searches exception tables frame by frame down to the invocation
/// floor, unwinding as it goes.  On a hit the operand stack is cleared
/// to the frame base, the throwable reference pushed and the program
/// counter set to the handler.
fn find_handler(ctx: &mut JvmContext, thridx: ThreadIndex, thrown: &Thrown) -> bool {
    let thrown_class = match ctx.objects.class_of(thrown.instance) {
        Some(cls) => cls,
        None => return false,
    };

    loop {
        let pc = match ctx.threads.entry(thridx) {
            Some(te) => te.pc,
            None => return false,
        };
        let Some(cf) = ctx.classes.class_file(pc.clsidx) else {
            return false;
        };
        let Some((_, _, max_locals, handlers)) = cf.code_at(pc.mthidx.0, pc.codeatridx) else {
            return false;
        };
        let handlers = handlers.to_vec();

        for handler in handlers {
            let off = pc.offset;
            if off < handler.start_pc as u32 || off >= handler.end_pc as u32 {
                continue;
            }
            let matches = if handler.catch_type == 0 {
                true
            } else {
                match class::load(
                    ctx,
                    &match cf.class_name_at(handler.catch_type) {
                        Some(name) => name.clone(),
                        None => continue,
                    },
                    thridx,
                ) {
                    Ok(catch_cls) => ctx.classes.is_assignable(thrown_class, catch_cls),
                    Err(_) => continue,
                }
            };
            if !matches {
                continue;
            }

            let Some(te) = ctx.threads.entry_mut(thridx) else {
                return false;
            };
            te.sp = te.operand_base(max_locals);
            if te.push(thrown.instance.raw() as i32).is_err() {
                return false;
            }
            te.pc.offset = handler.handler_pc as u32;
            debug!(
                "{thridx:?} caught {} at {:?}+{}",
                thrown.class_name, pc.clsidx, handler.handler_pc
            );
            return true;
        }

        // abrupt completion of a synchronized method still releases
        // its monitor
        if let Some(method) = cf.methods.get(pc.mthidx.idx()) {
            if method.access_flags.contains(MethodAccessFlags::SYNCHRONIZED) {
                let target = if method.access_flags.contains(MethodAccessFlags::STATIC) {
                    ctx.classes
                        .entry(pc.clsidx)
                        .map(|e| e.class_object)
                        .unwrap_or(ObjectHash::NULL)
                } else {
                    ctx.threads
                        .entry(thridx)
                        .map(|te| ObjectHash::from_raw(te.local(0) as u32))
                        .unwrap_or(ObjectHash::NULL)
                };
                if !target.is_null() {
                    let _ = monitor::unsynchronize(ctx, thridx, target);
                }
            }
        }

        let frame = ctx.threads.entry(thridx).map(|te| te.fp).unwrap_or(0);
        ctx.gc.stack_rmref_from_jvm(thridx, frame);
        let done = match ctx.threads.entry_mut(thridx) {
            Some(te) => te.pop_frame(max_locals),
            None => return false,
        };
        if done {
            return false;
        }
    }
}

/// Loads, initializes and instantiates the named throwable class on
/// the given thread: the canonical path every raised condition takes.
///
/// Guarded against faults inside itself: a failure retries once with
/// `java/lang/LinkageError`; a second recursion terminates the machine
/// with the accumulated error code.
pub fn load_run_throwable(
    ctx: &mut JvmContext,
    name: &str,
    thridx: ThreadIndex,
) -> Result<ObjectHash, Thrown> {
    if ctx.linkage_error_guard > 2 {
        error!("double fault while raising {name}; terminating");
        ctx.fatal_exit = Some(ExitCategory::Class);
        ctx.request_shutdown();
        return Err(Thrown::error("java/lang/InternalError"));
    }

    ctx.linkage_error_guard += 1;
    let result = load_run_inner(ctx, name, thridx);
    ctx.linkage_error_guard -= 1;

    match result {
        Ok(hash) => Ok(hash),
        Err(first) => {
            warn!(
                "raising {name} itself threw {}; retrying as LinkageError",
                first.class_name
            );
            ctx.linkage_error_guard += 1;
            let retry = load_run_inner(ctx, "java/lang/LinkageError", thridx);
            ctx.linkage_error_guard -= 1;
            match retry {
                Ok(hash) => Ok(hash),
                Err(_) => {
                    error!("double fault while raising {name}; terminating");
                    ctx.fatal_exit = Some(ExitCategory::Class);
                    ctx.request_shutdown();
                    Err(first)
                }
            }
        }
    }
}

fn load_run_inner(
    ctx: &mut JvmContext,
    name: &str,
    thridx: ThreadIndex,
) -> Result<ObjectHash, Thrown> {
    let clsidx = class::load_resolve_init(ctx, name, thridx)?;
    let hash = object::instance_new(
        ctx,
        NewInstance {
            class: clsidx,
            special: Special::None,
            lengths: Vec::new(),
            run_init: true,
            thread: thridx,
        },
    )?;
    // visible to the collector, but ephemeral
    ctx.gc.object_mkref_from_class(&mut ctx.objects, clsidx, hash);
    ctx.gc.object_rmref_from_class(&mut ctx.objects, clsidx, hash);
    Ok(hash)
}

/// Uncaught-exception processing: locates
/// `ThreadGroup.uncaughtException` and runs it on the offending
/// thread, then leaves the thread to be completed by the caller.
pub fn uncaught(ctx: &mut JvmContext, thridx: ThreadIndex, thrown: &Thrown) {
    warn!(
        "{thridx:?}: uncaught {} ({:?})",
        thrown.class_name, thrown.kind
    );
    ctx.uncaught_count += 1;
    if let Some(te) = ctx.threads.entry_mut(thridx) {
        te.flags |= ThreadFlags::THREW_UNCAUGHT;
        te.thrown = Some(thrown.clone());
    }

    let group = ctx.system_thread_group;
    let thread_object = ctx
        .threads
        .entry(thridx)
        .map(|te| te.thread_object)
        .unwrap_or(ObjectHash::NULL);
    let Some(group_class) = ctx.objects.class_of(group) else {
        return;
    };
    let Some((def_class, mthidx)) = ctx.classes.find_method(
        group_class,
        "uncaughtException",
        "(Ljava/lang/Thread;Ljava/lang/Throwable;)V",
    ) else {
        return;
    };
    let args = [
        JValue::Reference(group),
        JValue::Reference(thread_object),
        JValue::Reference(thrown.instance),
    ];
    if let Err(e) = crate::opcode::invoke_now(ctx, thridx, def_class, mthidx, &args) {
        warn!("uncaughtException handler itself threw {}", e.class_name);
    }
}
