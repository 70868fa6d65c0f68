use std::time::Duration;

use lungo::class;
use lungo::classfile::ClassFile;
use lungo::jvm::{JvmConfig, JvmContext};
use lungo::object::{instance_new, NewInstance, Special};
use lungo::opcode;
use lungo::state::{self, ThreadState};
use lungo::types::{ClassIndex, JValue, ObjectHash, ThreadIndex, Thrown};

pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

/// A machine with an empty classpath: every core class comes from the
/// synthesized bootstrap library.
#[allow(unused)]
pub fn vm() -> JvmContext {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();

    // a tick that never fires keeps scheduling deterministic under test
    JvmContext::init(JvmConfig {
        timeslice: Duration::from_secs(3600),
        ..JvmConfig::default()
    })
    .expect("machine failed to boot")
}

/// Defines a fixture class built in memory.
#[allow(unused)]
pub fn define(ctx: &mut JvmContext, class_file: ClassFile) -> ClassIndex {
    ctx.define_class(class_file).expect("fixture class rejected")
}

/// Runs a static method of a fixture class synchronously on the
/// system thread and returns its value.
#[allow(unused)]
pub fn call_static(
    ctx: &mut JvmContext,
    clsidx: ClassIndex,
    name: &str,
    descriptor: &str,
) -> std::result::Result<Option<JValue>, Thrown> {
    let cf = ctx.classes.class_file(clsidx).expect("class has no image");
    let (mthidx, _) = cf
        .find_method(name, descriptor)
        .unwrap_or_else(|| panic!("fixture has no {name}{descriptor}"));
    let thridx = ctx.system_thread;
    opcode::invoke_now(ctx, thridx, clsidx, mthidx, &[])
}

/// Creates a parked thread object; tests poke its state directly or
/// arm it with a method.
#[allow(unused)]
pub fn new_thread(ctx: &mut JvmContext) -> (ThreadIndex, ObjectHash) {
    let thread_cls = class::load(ctx, "java/lang/Thread", ctx.system_thread).unwrap();
    let hash = instance_new(
        ctx,
        NewInstance {
            class: thread_cls,
            special: Special::Thread,
            lengths: Vec::new(),
            run_init: false,
            thread: ctx.system_thread,
        },
    )
    .unwrap();
    let thridx = ctx.objects.entry(hash).unwrap().thread;
    (thridx, hash)
}

/// Arms a thread on a static `main(String[])` of a fixture class, as
/// the launcher does, with an empty argument array.
#[allow(unused)]
pub fn arm_main(ctx: &mut JvmContext, clsidx: ClassIndex) -> ThreadIndex {
    let (thridx, _) = new_thread(ctx);
    let cf = ctx.classes.class_file(clsidx).unwrap();
    let (mthidx, method) = cf
        .find_method("main", "([Ljava/lang/String;)V")
        .expect("fixture has no main");
    let code_attr = method.code_attr_index().unwrap();
    let (_, max_stack, max_locals, _) = cf.code_at(mthidx, code_attr).unwrap();

    let array_cls = class::load(ctx, "[Ljava/lang/String;", ctx.system_thread).unwrap();
    let args = instance_new(
        ctx,
        NewInstance {
            class: array_cls,
            special: Special::None,
            lengths: vec![0],
            run_init: false,
            thread: ctx.system_thread,
        },
    )
    .unwrap();

    let pc = lungo::thread::ProgramCounter {
        clsidx,
        mthidx: lungo::types::MethodIndex(mthidx),
        codeatridx: code_attr,
        excpatridx: code_attr,
        offset: 0,
    };
    {
        let te = ctx.threads.entry_mut(thridx).unwrap();
        let floor = te.fp;
        te.push_frame(max_locals, max_stack, pc).unwrap();
        te.end_program_fp = floor;
        te.set_local(0, {
            use lungo::types::TableIndex;
            args.raw() as i32
        });
    }
    state::request(ctx, thridx, ThreadState::Start);
    thridx
}

/// One scheduler round: promote a runnable thread when nothing runs,
/// then tick every in-use thread.
#[allow(unused)]
pub fn round(ctx: &mut JvmContext) {
    let order: Vec<ThreadIndex> = ctx.threads.iter_in_use().collect();
    let running = order.iter().any(|&t| {
        ctx.threads
            .entry(t)
            .is_some_and(|e| e.this_state == ThreadState::Running)
    });
    if !running {
        if let Some(&next) = order.iter().find(|&&t| {
            ctx.threads
                .entry(t)
                .is_some_and(|e| e.this_state == ThreadState::Runnable)
        }) {
            state::request(ctx, next, ThreadState::Running);
        }
    }
    for thridx in order {
        state::tick(ctx, thridx);
    }
    ctx.clear_timeslice();
}

/// Drives rounds until the thread is gone or dead, collecting the
/// distinct states it passed through.
#[allow(unused)]
pub fn drive_to_death(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    max_rounds: usize,
) -> Vec<ThreadState> {
    let mut trace = Vec::new();
    let mut push = |state: ThreadState, trace: &mut Vec<ThreadState>| {
        if trace.last() != Some(&state) {
            trace.push(state);
        }
    };
    if let Some(te) = ctx.threads.entry(thridx) {
        push(te.this_state, &mut trace);
    }
    for _ in 0..max_rounds {
        round(ctx);
        match ctx.threads.entry(thridx) {
            Some(te) => {
                push(te.this_state, &mut trace);
                if te.this_state == ThreadState::Dead {
                    break;
                }
            }
            None => break,
        }
    }
    trace
}
