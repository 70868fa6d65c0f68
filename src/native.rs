//! Native method binding: a table mapping (class, name, descriptor)
//! to an ordinal, and the bootstrap natives the minimal class library
//! needs.  The interpreter dispatches through the ordinal only.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::gc::GcPolicy;
use crate::jvm::JvmContext;
use crate::monitor;
use crate::state::{self, ThreadState};
use crate::thread::ThreadFlags;
use crate::types::{JValue, ObjectHash, TableIndex, ThreadIndex, Thrown};

/// The bootstrap native table; the position of a row is its ordinal.
const TABLE: &[(&str, &str, &str)] = &[
    ("java/lang/Object", "getClass", "()Ljava/lang/Class;"),
    ("java/lang/Object", "hashCode", "()I"),
    ("java/lang/Object", "wait", "()V"),
    ("java/lang/Object", "wait", "(J)V"),
    ("java/lang/Object", "notify", "()V"),
    ("java/lang/Object", "notifyAll", "()V"),
    ("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;"),
    ("java/lang/Thread", "start", "()V"),
    ("java/lang/Thread", "sleep", "(J)V"),
    ("java/lang/Thread", "yield", "()V"),
    ("java/lang/Thread", "interrupt", "()V"),
    ("java/lang/Thread", "isInterrupted", "()Z"),
    ("java/lang/Thread", "interrupted", "()Z"),
    ("java/lang/Thread", "isAlive", "()Z"),
    ("java/lang/Thread", "join", "()V"),
    ("java/lang/Thread", "join", "(J)V"),
    ("java/lang/Thread", "setPriority", "(I)V"),
    ("java/lang/Thread", "getPriority", "()I"),
    ("java/lang/Thread", "stop", "()V"),
    ("java/lang/Thread", "suspend", "()V"),
    ("java/lang/Thread", "resume", "()V"),
    ("java/lang/Thread", "destroy", "()V"),
    ("java/lang/System", "currentTimeMillis", "()J"),
    ("java/lang/System", "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V"),
    ("java/lang/System", "exit", "(I)V"),
    ("java/lang/Class", "getName", "()Ljava/lang/String;"),
    ("java/io/PrintStream", "println", "(Ljava/lang/String;)V"),
    ("java/io/PrintStream", "println", "(I)V"),
    ("java/io/PrintStream", "println", "(J)V"),
    ("java/io/PrintStream", "println", "()V"),
];

const ORD_OBJECT_GET_CLASS: u16 = 0;
const ORD_OBJECT_HASH_CODE: u16 = 1;
const ORD_OBJECT_WAIT: u16 = 2;
const ORD_OBJECT_WAIT_TIMED: u16 = 3;
const ORD_OBJECT_NOTIFY: u16 = 4;
const ORD_OBJECT_NOTIFY_ALL: u16 = 5;
const ORD_THREAD_CURRENT: u16 = 6;
const ORD_THREAD_START: u16 = 7;
const ORD_THREAD_SLEEP: u16 = 8;
const ORD_THREAD_YIELD: u16 = 9;
const ORD_THREAD_INTERRUPT: u16 = 10;
const ORD_THREAD_IS_INTERRUPTED: u16 = 11;
const ORD_THREAD_INTERRUPTED: u16 = 12;
const ORD_THREAD_IS_ALIVE: u16 = 13;
const ORD_THREAD_JOIN: u16 = 14;
const ORD_THREAD_JOIN_TIMED: u16 = 15;
const ORD_THREAD_SET_PRIORITY: u16 = 16;
const ORD_THREAD_GET_PRIORITY: u16 = 17;
const ORD_THREAD_STOP: u16 = 18;
const ORD_THREAD_SUSPEND: u16 = 19;
const ORD_THREAD_RESUME: u16 = 20;
const ORD_THREAD_DESTROY: u16 = 21;
const ORD_SYSTEM_MILLIS: u16 = 22;
const ORD_SYSTEM_ARRAYCOPY: u16 = 23;
const ORD_SYSTEM_EXIT: u16 = 24;
const ORD_CLASS_GET_NAME: u16 = 25;
const ORD_PRINTLN_STRING: u16 = 26;
const ORD_PRINTLN_INT: u16 = 27;
const ORD_PRINTLN_LONG: u16 = 28;
const ORD_PRINTLN_EMPTY: u16 = 29;

/// Lookup side of the binding table.
#[derive(Debug, Default)]
pub struct NativeRegistry;

impl NativeRegistry {
    pub fn bootstrap() -> NativeRegistry {
        NativeRegistry
    }

    /// Maps a (class, name, descriptor) triple to its ordinal.
    pub fn ordinal_of(&self, class: &str, name: &str, descriptor: &str) -> Option<u16> {
        TABLE
            .iter()
            .position(|&(c, n, d)| c == class && n == name && d == descriptor)
            .map(|i| i as u16)
    }
}

fn this_of(args: &[JValue]) -> Result<ObjectHash, Thrown> {
    match args.first() {
        Some(JValue::Reference(hash)) if !hash.is_null() => Ok(*hash),
        _ => Err(Thrown::exception("java/lang/NullPointerException")),
    }
}

fn long_arg(args: &[JValue], index: usize) -> i64 {
    match args.get(index) {
        Some(JValue::Long(v)) => *v,
        _ => 0,
    }
}

fn int_arg(args: &[JValue], index: usize) -> i32 {
    match args.get(index) {
        Some(JValue::Int(v)) => *v,
        _ => 0,
    }
}

/// The thread table slot behind a `java/lang/Thread` object.
fn thread_of(ctx: &JvmContext, hash: ObjectHash) -> Result<ThreadIndex, Thrown> {
    ctx.objects
        .entry(hash)
        .map(|e| e.thread)
        .filter(|t| !t.is_null())
        .ok_or_else(|| Thrown::exception("java/lang/IllegalThreadStateException"))
}

/// Dispatches a native method by ordinal.  Blocking natives park the
/// calling thread by requesting a state transition; the interpreter
/// notices and leaves the dispatch loop.
pub fn invoke(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    ordinal: u16,
    args: Vec<JValue>,
) -> Result<Option<JValue>, Thrown> {
    match ordinal {
        ORD_OBJECT_GET_CLASS => {
            let this = this_of(&args)?;
            let clsidx = ctx
                .objects
                .class_of(this)
                .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
            let meta = ctx
                .classes
                .entry(clsidx)
                .map(|e| e.class_object)
                .unwrap_or(ObjectHash::NULL);
            Ok(Some(JValue::Reference(meta)))
        }
        ORD_OBJECT_HASH_CODE => {
            let this = this_of(&args)?;
            Ok(Some(JValue::Int(this.raw() as i32)))
        }
        ORD_OBJECT_WAIT => {
            let this = this_of(&args)?;
            monitor::wait_on(ctx, thridx, this, 0)?;
            Ok(None)
        }
        ORD_OBJECT_WAIT_TIMED => {
            let this = this_of(&args)?;
            let millis = long_arg(&args, 1);
            if millis < 0 {
                return Err(Thrown::exception("java/lang/IllegalArgumentException"));
            }
            monitor::wait_on(ctx, thridx, this, millis)?;
            Ok(None)
        }
        ORD_OBJECT_NOTIFY => {
            let this = this_of(&args)?;
            monitor::notify(ctx, thridx, this, false)?;
            Ok(None)
        }
        ORD_OBJECT_NOTIFY_ALL => {
            let this = this_of(&args)?;
            monitor::notify(ctx, thridx, this, true)?;
            Ok(None)
        }

        ORD_THREAD_CURRENT => {
            let hash = ctx
                .threads
                .entry(thridx)
                .map(|te| te.thread_object)
                .unwrap_or(ObjectHash::NULL);
            Ok(Some(JValue::Reference(hash)))
        }
        ORD_THREAD_START => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            start_thread(ctx, target, this)?;
            Ok(None)
        }
        ORD_THREAD_SLEEP => {
            let millis = long_arg(&args, 0).max(0);
            if let Some(te) = ctx.threads.entry_mut(thridx) {
                te.flags |= ThreadFlags::SLEEPING;
                te.sleep_deadline = Some(Instant::now() + Duration::from_millis(millis as u64));
            }
            state::request(ctx, thridx, ThreadState::BlockingEvent);
            Ok(None)
        }
        ORD_THREAD_YIELD => {
            state::request(ctx, thridx, ThreadState::Runnable);
            Ok(None)
        }
        ORD_THREAD_INTERRUPT => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            if let Some(te) = ctx.threads.entry_mut(target) {
                te.flags |= ThreadFlags::INTERRUPTED;
            }
            Ok(None)
        }
        ORD_THREAD_IS_INTERRUPTED => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            let set = ctx
                .threads
                .entry(target)
                .is_some_and(|te| te.flags.contains(ThreadFlags::INTERRUPTED));
            Ok(Some(JValue::Boolean(set)))
        }
        ORD_THREAD_INTERRUPTED => {
            let set = ctx
                .threads
                .entry_mut(thridx)
                .map(|te| {
                    let was = te.flags.contains(ThreadFlags::INTERRUPTED);
                    te.flags.remove(ThreadFlags::INTERRUPTED);
                    was
                })
                .unwrap_or(false);
            Ok(Some(JValue::Boolean(set)))
        }
        ORD_THREAD_IS_ALIVE => {
            let this = this_of(&args)?;
            let alive = ctx
                .objects
                .entry(this)
                .map(|e| e.thread)
                .filter(|t| !t.is_null())
                .and_then(|t| ctx.threads.entry(t))
                .is_some_and(|te| {
                    !matches!(te.this_state, ThreadState::New | ThreadState::Dead)
                });
            Ok(Some(JValue::Boolean(alive)))
        }
        ORD_THREAD_JOIN | ORD_THREAD_JOIN_TIMED => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            let millis = if ordinal == ORD_THREAD_JOIN_TIMED {
                long_arg(&args, 1)
            } else {
                0
            };
            if let Some(te) = ctx.threads.entry_mut(thridx) {
                te.join_target = target;
                if millis > 0 {
                    te.flags |= ThreadFlags::JOINTIMED;
                    te.sleep_deadline =
                        Some(Instant::now() + Duration::from_millis(millis as u64));
                } else {
                    te.flags |= ThreadFlags::JOIN4EVER;
                }
            }
            state::request(ctx, thridx, ThreadState::BlockingEvent);
            Ok(None)
        }
        ORD_THREAD_SET_PRIORITY => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            let priority = int_arg(&args, 1).clamp(1, 10);
            if let Some(te) = ctx.threads.entry_mut(target) {
                te.priority = priority;
            }
            Ok(None)
        }
        ORD_THREAD_GET_PRIORITY => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            let priority = ctx.threads.entry(target).map(|te| te.priority).unwrap_or(5);
            Ok(Some(JValue::Int(priority)))
        }
        ORD_THREAD_STOP | ORD_THREAD_DESTROY => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            debug!("deprecated stop/destroy of {target:?} via badlogic");
            state::request(ctx, target, ThreadState::BadLogic);
            Ok(None)
        }
        ORD_THREAD_SUSPEND => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            debug!("deprecated suspend of {target:?} via badlogic");
            if let Some(te) = ctx.threads.entry_mut(target) {
                te.this_state = ThreadState::BadLogic;
                te.next_state = ThreadState::BlockingEvent;
            }
            Ok(None)
        }
        ORD_THREAD_RESUME => {
            let this = this_of(&args)?;
            let target = thread_of(ctx, this)?;
            if ctx
                .threads
                .entry(target)
                .is_some_and(|te| te.this_state == ThreadState::Blocked)
            {
                state::request(ctx, target, ThreadState::Unblocked);
            }
            Ok(None)
        }

        ORD_SYSTEM_MILLIS => {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            Ok(Some(JValue::Long(millis)))
        }
        ORD_SYSTEM_ARRAYCOPY => {
            let src = match args.first() {
                Some(JValue::Reference(h)) => *h,
                _ => ObjectHash::NULL,
            };
            let src_pos = int_arg(&args, 1);
            let dst = match args.get(2) {
                Some(JValue::Reference(h)) => *h,
                _ => ObjectHash::NULL,
            };
            let dst_pos = int_arg(&args, 3);
            let length = int_arg(&args, 4);
            if length < 0 || src_pos < 0 || dst_pos < 0 {
                return Err(Thrown::exception(
                    "java/lang/ArrayIndexOutOfBoundsException",
                ));
            }
            for i in 0..length {
                let value = ctx.objects.array_get(src, src_pos + i)?;
                ctx.objects.array_set(dst, dst_pos + i, value)?;
            }
            Ok(None)
        }
        ORD_SYSTEM_EXIT => {
            let code = int_arg(&args, 0);
            debug!("System.exit({code})");
            ctx.user_exit = Some(code);
            ctx.request_shutdown();
            Ok(None)
        }

        ORD_CLASS_GET_NAME => {
            let this = this_of(&args)?;
            let represented = ctx
                .objects
                .entry(this)
                .map(|e| e.represented_class)
                .unwrap_or(crate::types::ClassIndex::NULL);
            let name = ctx
                .classes
                .name_of(represented)
                .map(|n| n.replace('/', "."))
                .unwrap_or_default();
            let hash = ctx.intern_string(&name.as_str().into(), thridx)?;
            Ok(Some(JValue::Reference(hash)))
        }

        ORD_PRINTLN_STRING => {
            let text = match args.get(1) {
                Some(JValue::Reference(h)) => ctx.java_string(*h).unwrap_or_default(),
                _ => String::new(),
            };
            println!("{text}");
            Ok(None)
        }
        ORD_PRINTLN_INT => {
            println!("{}", int_arg(&args, 1));
            Ok(None)
        }
        ORD_PRINTLN_LONG => {
            println!("{}", long_arg(&args, 1));
            Ok(None)
        }
        ORD_PRINTLN_EMPTY => {
            println!();
            Ok(None)
        }

        _ => {
            warn!("unknown native ordinal {ordinal}");
            Err(Thrown::error("java/lang/UnsatisfiedLinkError"))
        }
    }
}

/// Arms a freshly started thread: frame for `run()V`, end-of-program
/// mark, and the `new -> start` transition.
pub fn start_thread(
    ctx: &mut JvmContext,
    target: ThreadIndex,
    this: ObjectHash,
) -> Result<(), Thrown> {
    let already_started = ctx
        .threads
        .entry(target)
        .map(|te| te.this_state != ThreadState::New)
        .unwrap_or(true);
    if already_started {
        return Err(Thrown::exception("java/lang/IllegalThreadStateException"));
    }

    let runtime_class = ctx
        .objects
        .class_of(this)
        .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
    let (def_class, mthidx) = ctx
        .classes
        .find_method(runtime_class, "run", "()V")
        .ok_or_else(|| Thrown::error("java/lang/NoSuchMethodError"))?;
    let cf = ctx
        .classes
        .class_file(def_class)
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
    let method = cf
        .methods
        .get(mthidx as usize)
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
    let code_attr = method
        .code_attr_index()
        .ok_or_else(|| Thrown::error("java/lang/AbstractMethodError"))?;
    let (_, max_stack, max_locals, _) = cf
        .code_at(mthidx, code_attr)
        .ok_or_else(|| Thrown::error("java/lang/VerifyError"))?;

    let pc = crate::thread::ProgramCounter {
        clsidx: def_class,
        mthidx: crate::types::MethodIndex(mthidx),
        codeatridx: code_attr,
        excpatridx: code_attr,
        offset: 0,
    };
    let frame = {
        let te = ctx
            .threads
            .entry_mut(target)
            .ok_or_else(|| Thrown::exception("java/lang/IllegalThreadStateException"))?;
        let floor = te.fp;
        te.push_frame(max_locals, max_stack, pc)?;
        te.end_program_fp = floor;
        te.set_local(0, this.raw() as i32);
        te.fp
    };
    ctx.gc.stack_mkref_from_jvm(target, frame);
    state::request(ctx, target, ThreadState::Start);
    debug!("started thread {target:?} at {:?}.run()V", def_class);
    Ok(())
}
