//! The bytecode interpreter: the inner loop over one thread's program
//! counter.
//!
//! Every opcode boundary is a suspension point; nothing yields
//! mid-opcode.  Errors of every depth propagate as [Thrown] back to
//! the top of the dispatch loop, where the throwable dispatcher
//! classifies them.

use std::rc::Rc;

use log::{trace, warn};

use crate::classfile::{self, ClassFile, CpEntry, MethodAccessFlags};
use crate::gc::GcPolicy;
use crate::jvm::JvmContext;
use crate::linkage::{self, ResolvedMethod};
use crate::monitor;
use crate::object::{self, NewInstance, Special};
use crate::state::{self, ThreadState};
use crate::thread::{ProgramCounter, ThreadEntry};
use crate::types::{
    combine_jlong, float_to_slot, slot_to_float, split_jlong, BaseType, ClassIndex, JValue,
    MethodIndex, ObjectHash, TableIndex, ThreadIndex, Thrown,
};

/// The instruction set.
#[allow(dead_code)]
pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_4: u8 = 0x07;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const LCONST_1: u8 = 0x0a;
    pub const FCONST_0: u8 = 0x0b;
    pub const FCONST_1: u8 = 0x0c;
    pub const FCONST_2: u8 = 0x0d;
    pub const DCONST_0: u8 = 0x0e;
    pub const DCONST_1: u8 = 0x0f;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ILOAD_1: u8 = 0x1b;
    pub const ILOAD_2: u8 = 0x1c;
    pub const ILOAD_3: u8 = 0x1d;
    pub const LLOAD_0: u8 = 0x1e;
    pub const LLOAD_1: u8 = 0x1f;
    pub const LLOAD_2: u8 = 0x20;
    pub const LLOAD_3: u8 = 0x21;
    pub const FLOAD_0: u8 = 0x22;
    pub const FLOAD_1: u8 = 0x23;
    pub const FLOAD_2: u8 = 0x24;
    pub const FLOAD_3: u8 = 0x25;
    pub const DLOAD_0: u8 = 0x26;
    pub const DLOAD_1: u8 = 0x27;
    pub const DLOAD_2: u8 = 0x28;
    pub const DLOAD_3: u8 = 0x29;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ALOAD_1: u8 = 0x2b;
    pub const ALOAD_2: u8 = 0x2c;
    pub const ALOAD_3: u8 = 0x2d;
    pub const IALOAD: u8 = 0x2e;
    pub const LALOAD: u8 = 0x2f;
    pub const FALOAD: u8 = 0x30;
    pub const DALOAD: u8 = 0x31;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const CALOAD: u8 = 0x34;
    pub const SALOAD: u8 = 0x35;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const ISTORE_1: u8 = 0x3c;
    pub const ISTORE_2: u8 = 0x3d;
    pub const ISTORE_3: u8 = 0x3e;
    pub const LSTORE_0: u8 = 0x3f;
    pub const LSTORE_1: u8 = 0x40;
    pub const LSTORE_2: u8 = 0x41;
    pub const LSTORE_3: u8 = 0x42;
    pub const FSTORE_0: u8 = 0x43;
    pub const FSTORE_1: u8 = 0x44;
    pub const FSTORE_2: u8 = 0x45;
    pub const FSTORE_3: u8 = 0x46;
    pub const DSTORE_0: u8 = 0x47;
    pub const DSTORE_1: u8 = 0x48;
    pub const DSTORE_2: u8 = 0x49;
    pub const DSTORE_3: u8 = 0x4a;
    pub const ASTORE_0: u8 = 0x4b;
    pub const ASTORE_1: u8 = 0x4c;
    pub const ASTORE_2: u8 = 0x4d;
    pub const ASTORE_3: u8 = 0x4e;
    pub const IASTORE: u8 = 0x4f;
    pub const LASTORE: u8 = 0x50;
    pub const FASTORE: u8 = 0x51;
    pub const DASTORE: u8 = 0x52;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const CASTORE: u8 = 0x55;
    pub const SASTORE: u8 = 0x56;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5a;
    pub const DUP_X2: u8 = 0x5b;
    pub const DUP2: u8 = 0x5c;
    pub const DUP2_X1: u8 = 0x5d;
    pub const DUP2_X2: u8 = 0x5e;
    pub const SWAP: u8 = 0x5f;
    pub const IADD: u8 = 0x60;
    pub const LADD: u8 = 0x61;
    pub const FADD: u8 = 0x62;
    pub const DADD: u8 = 0x63;
    pub const ISUB: u8 = 0x64;
    pub const LSUB: u8 = 0x65;
    pub const FSUB: u8 = 0x66;
    pub const DSUB: u8 = 0x67;
    pub const IMUL: u8 = 0x68;
    pub const LMUL: u8 = 0x69;
    pub const FMUL: u8 = 0x6a;
    pub const DMUL: u8 = 0x6b;
    pub const IDIV: u8 = 0x6c;
    pub const LDIV: u8 = 0x6d;
    pub const FDIV: u8 = 0x6e;
    pub const DDIV: u8 = 0x6f;
    pub const IREM: u8 = 0x70;
    pub const LREM: u8 = 0x71;
    pub const FREM: u8 = 0x72;
    pub const DREM: u8 = 0x73;
    pub const INEG: u8 = 0x74;
    pub const LNEG: u8 = 0x75;
    pub const FNEG: u8 = 0x76;
    pub const DNEG: u8 = 0x77;
    pub const ISHL: u8 = 0x78;
    pub const LSHL: u8 = 0x79;
    pub const ISHR: u8 = 0x7a;
    pub const LSHR: u8 = 0x7b;
    pub const IUSHR: u8 = 0x7c;
    pub const LUSHR: u8 = 0x7d;
    pub const IAND: u8 = 0x7e;
    pub const LAND: u8 = 0x7f;
    pub const IOR: u8 = 0x80;
    pub const LOR: u8 = 0x81;
    pub const IXOR: u8 = 0x82;
    pub const LXOR: u8 = 0x83;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const I2F: u8 = 0x86;
    pub const I2D: u8 = 0x87;
    pub const L2I: u8 = 0x88;
    pub const L2F: u8 = 0x89;
    pub const L2D: u8 = 0x8a;
    pub const F2I: u8 = 0x8b;
    pub const F2L: u8 = 0x8c;
    pub const F2D: u8 = 0x8d;
    pub const D2I: u8 = 0x8e;
    pub const D2L: u8 = 0x8f;
    pub const D2F: u8 = 0x90;
    pub const I2B: u8 = 0x91;
    pub const I2C: u8 = 0x92;
    pub const I2S: u8 = 0x93;
    pub const LCMP: u8 = 0x94;
    pub const FCMPL: u8 = 0x95;
    pub const FCMPG: u8 = 0x96;
    pub const DCMPL: u8 = 0x97;
    pub const DCMPG: u8 = 0x98;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const IFLT: u8 = 0x9b;
    pub const IFGE: u8 = 0x9c;
    pub const IFGT: u8 = 0x9d;
    pub const IFLE: u8 = 0x9e;
    pub const IF_ICMPEQ: u8 = 0x9f;
    pub const IF_ICMPNE: u8 = 0xa0;
    pub const IF_ICMPLT: u8 = 0xa1;
    pub const IF_ICMPGE: u8 = 0xa2;
    pub const IF_ICMPGT: u8 = 0xa3;
    pub const IF_ICMPLE: u8 = 0xa4;
    pub const IF_ACMPEQ: u8 = 0xa5;
    pub const IF_ACMPNE: u8 = 0xa6;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const MONITORENTER: u8 = 0xc2;
    pub const MONITOREXIT: u8 = 0xc3;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

/// Outcome of a single opcode.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    /// The thread left `running` (contention, sleep, wait); the state
    /// machine takes over.
    Block,
    /// The thread's top-level method returned.
    End,
}

fn verify_error() -> Thrown {
    Thrown::error("java/lang/VerifyError")
}

fn internal_error() -> Thrown {
    Thrown::error("java/lang/InternalError")
}

fn te_mut<'a>(ctx: &'a mut JvmContext, thridx: ThreadIndex) -> Result<&'a mut ThreadEntry, Thrown> {
    ctx.threads.entry_mut(thridx).ok_or_else(internal_error)
}

/// Big-endian operand fetch over the code array.
struct Fetch<'a> {
    code: &'a [u8],
    off: usize,
}

impl<'a> Fetch<'a> {
    fn u1(&mut self) -> Result<u8, Thrown> {
        let b = *self.code.get(self.off).ok_or_else(verify_error)?;
        self.off += 1;
        Ok(b)
    }

    fn u2(&mut self) -> Result<u16, Thrown> {
        Ok(((self.u1()? as u16) << 8) | self.u1()? as u16)
    }

    fn u4(&mut self) -> Result<u32, Thrown> {
        Ok(((self.u2()? as u32) << 16) | self.u2()? as u32)
    }

    fn i1(&mut self) -> Result<i8, Thrown> {
        self.u1().map(|b| b as i8)
    }

    fn i2(&mut self) -> Result<i16, Thrown> {
        self.u2().map(|v| v as i16)
    }

    fn i4(&mut self) -> Result<i32, Thrown> {
        self.u4().map(|v| v as i32)
    }

    /// Pads to the next 4-byte boundary relative to the code start
    /// (tableswitch/lookupswitch).
    fn align4(&mut self) {
        while self.off % 4 != 0 {
            self.off += 1;
        }
    }
}

/// Checked branch: the target must land inside the code array.
fn branch_target(base: u32, offset: i64, code_len: usize) -> Result<u32, Thrown> {
    let target = base as i64 + offset;
    if target < 0 || target >= code_len as i64 {
        return Err(verify_error());
    }
    Ok(target as u32)
}

fn slots_of(value: JValue, out: &mut Vec<i32>) {
    match value {
        JValue::Boolean(v) => out.push(v as i32),
        JValue::Byte(v) => out.push(v as i32),
        JValue::Char(v) => out.push(v as i32),
        JValue::Short(v) => out.push(v as i32),
        JValue::Int(v) => out.push(v),
        JValue::Float(v) => out.push(float_to_slot(v)),
        JValue::Reference(h) => out.push(h.raw() as i32),
        JValue::Long(v) => {
            let (hi, lo) = split_jlong(v);
            out.push(hi);
            out.push(lo);
        }
        JValue::Double(v) => {
            let (hi, lo) = crate::types::split_jdouble(v);
            out.push(hi);
            out.push(lo);
        }
    }
}

/// Pops a value of the given type off the operand stack, truncating
/// the widened 32-bit form back to the storage type.
fn pop_typed(te: &mut ThreadEntry, tpe: BaseType) -> JValue {
    match tpe {
        BaseType::Boolean => JValue::Boolean(te.pop() != 0),
        BaseType::Byte => JValue::Byte(te.pop() as i8),
        BaseType::Char => JValue::Char(te.pop() as u16),
        BaseType::Short => JValue::Short(te.pop() as i16),
        BaseType::Int => JValue::Int(te.pop()),
        BaseType::Float => JValue::Float(slot_to_float(te.pop())),
        BaseType::Long => JValue::Long(te.pop_long()),
        BaseType::Double => JValue::Double(f64::from_bits(te.pop_long() as u64)),
        BaseType::Reference => JValue::Reference(ObjectHash::from_raw(te.pop() as u32)),
    }
}

/// Pushes a stored value, widening small integers to 32 bits.
fn push_value(te: &mut ThreadEntry, value: JValue) -> Result<(), Thrown> {
    match value {
        JValue::Long(v) => te.push_long(v),
        JValue::Double(v) => te.push_long(v.to_bits() as i64),
        other => {
            let mut slots = Vec::with_capacity(1);
            slots_of(other, &mut slots);
            te.push(slots[0])
        }
    }
}

/// Executes bytecode on `thridx` while it stays in `running`.
///
/// With `check_timeslice`, the loop returns at the next opcode
/// boundary after the wall-clock tick sets the timeslice-expired
/// flag; the outer loop then rotates to the next thread.
pub fn run(ctx: &mut JvmContext, thridx: ThreadIndex, check_timeslice: bool) {
    if let Some(te) = ctx.threads.entry_mut(thridx) {
        te.slice_instructions = 0;
    }
    loop {
        let Some(te) = ctx.threads.entry(thridx) else {
            return;
        };
        if te.this_state != ThreadState::Running || te.next_state != ThreadState::Running {
            return;
        }
        if check_timeslice && ctx.timeslice_expired() {
            return;
        }

        // interrupts and similar wakeup conditions leave a throwable
        // to be raised before the next opcode
        let pending = ctx
            .threads
            .entry_mut(thridx)
            .and_then(|te| te.pending_throwable.take());
        let outcome = match pending {
            Some(name) => Err(Thrown::exception(&name)),
            None => step(ctx, thridx),
        };

        match outcome {
            Ok(Step::Continue) => {}
            Ok(Step::Block) => return,
            Ok(Step::End) => {
                state::request(ctx, thridx, ThreadState::Complete);
                return;
            }
            Err(thrown) => match crate::throwable::dispatch(ctx, thridx, thrown) {
                crate::throwable::Disposition::Resumed => {}
                crate::throwable::Disposition::Unhandled(thrown) => {
                    crate::throwable::uncaught(ctx, thridx, &thrown);
                    state::request(ctx, thridx, ThreadState::Complete);
                    return;
                }
            },
        }
    }
}

/// Runs one method to completion on a thread, outside the scheduler:
/// `<clinit>`, `<init>` from instance construction, finalizers and the
/// throwable machinery all enter here.
///
/// The end-of-program frame pointer makes the nested invocation
/// detectable: it is saved, pointed at the current frame, and restored
/// on the way out, so an enclosing interpreter loop keeps its own
/// termination mark.
pub fn invoke_now(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    clsidx: ClassIndex,
    mthidx: u16,
    args: &[JValue],
) -> Result<Option<JValue>, Thrown> {
    let cf = ctx.classes.class_file(clsidx).ok_or_else(internal_error)?;
    let method = cf.methods.get(mthidx as usize).ok_or_else(internal_error)?;
    let descriptor = cf
        .method_descriptor(method)
        .cloned()
        .ok_or_else(internal_error)?;
    let desc = classfile::method_descriptor(&descriptor).map_err(|_| verify_error())?;

    if method.access_flags.contains(MethodAccessFlags::NATIVE) {
        let name = cf.method_name(method).cloned().ok_or_else(internal_error)?;
        let class_name = ctx.classes.name_of(clsidx).ok_or_else(internal_error)?;
        let ordinal = ctx
            .natives
            .ordinal_of(&class_name, &name, &descriptor)
            .ok_or_else(|| Thrown::error("java/lang/UnsatisfiedLinkError"))?;
        return crate::native::invoke(ctx, thridx, ordinal, args.to_vec());
    }

    let code_attr = method.code_attr_index().ok_or_else(verify_error)?;
    let (_, max_stack, max_locals, _) = cf
        .code_at(mthidx, code_attr)
        .ok_or_else(verify_error)?;

    let mut slots = Vec::new();
    for &arg in args {
        slots_of(arg, &mut slots);
    }

    let (saved_end_fp, saved_fp, saved_sp, saved_pc) = {
        let te = te_mut(ctx, thridx)?;
        let saved = (te.end_program_fp, te.fp, te.sp, te.pc);
        let pc = ProgramCounter {
            clsidx,
            mthidx: MethodIndex(mthidx),
            codeatridx: code_attr,
            excpatridx: code_attr,
            offset: 0,
        };
        te.push_frame(max_locals, max_stack, pc)?;
        te.end_program_fp = saved.1;
        for (i, slot) in slots.iter().enumerate() {
            te.set_local(i, *slot);
        }
        saved
    };
    let frame = ctx.threads.entry(thridx).map(|te| te.fp).unwrap_or(0);
    ctx.gc.stack_mkref_from_jvm(thridx, frame);

    let result = loop {
        match step(ctx, thridx) {
            Ok(Step::Continue) => {}
            Ok(Step::End) => break Ok(()),
            Ok(Step::Block) => {
                // a manual invocation cannot park; failing it keeps the
                // cooperative scheduler alive
                warn!("nested invocation blocked; failing it");
                break Err(internal_error());
            }
            Err(thrown) => match crate::throwable::dispatch(ctx, thridx, thrown) {
                crate::throwable::Disposition::Resumed => {}
                crate::throwable::Disposition::Unhandled(thrown) => break Err(thrown),
            },
        }
    };

    let te = te_mut(ctx, thridx)?;
    te.end_program_fp = saved_end_fp;
    match result {
        Ok(()) => {
            debug_assert!(te.fp == saved_fp);
            Ok(desc.return_type.map(|tpe| pop_typed(te, tpe)))
        }
        Err(thrown) => {
            // discard whatever the failed invocation left behind
            te.fp = saved_fp;
            te.sp = saved_sp;
            te.pc = saved_pc;
            Err(thrown)
        }
    }
}

/// Decodes and executes one opcode.  On error the program counter is
/// left at the faulting instruction so handler ranges match.
fn step(ctx: &mut JvmContext, thridx: ThreadIndex) -> Result<Step, Thrown> {
    let (pc, wide) = {
        let te = te_mut(ctx, thridx)?;
        te.instruction_count += 1;
        te.slice_instructions += 1;
        (te.pc, std::mem::take(&mut te.wide_latch))
    };
    let cf = ctx
        .classes
        .class_file(pc.clsidx)
        .ok_or_else(internal_error)?;
    let (code, ..) = cf
        .code_at(pc.mthidx.0, pc.codeatridx)
        .ok_or_else(verify_error)?;
    // owned so ctx can be borrowed freely below; bytecode methods are
    // small and this is the bootstrap interpreter, not the fast one
    let code = code.to_vec();

    let opcode_start = pc.offset;
    let mut fetch = Fetch {
        code: &code,
        off: pc.offset as usize,
    };

    let result = step_inner(ctx, thridx, &cf, &mut fetch, opcode_start, wide);
    match result {
        Ok(step) => {
            if step == Step::Continue {
                // opcodes that did not redirect the pc fall through to
                // the next instruction
                let te = te_mut(ctx, thridx)?;
                if te.pc == pc {
                    te.pc.offset = fetch.off as u32;
                }
            }
            Ok(step)
        }
        Err(thrown) => {
            let te = te_mut(ctx, thridx)?;
            if te.pc == pc {
                te.pc.offset = opcode_start;
            }
            Err(thrown)
        }
    }
}

fn step_inner(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    cf: &Rc<ClassFile>,
    fetch: &mut Fetch<'_>,
    opcode_start: u32,
    wide: bool,
) -> Result<Step, Thrown> {
    let code_len = fetch.code.len();
    let opcode = fetch.u1()?;

    macro_rules! te {
        () => {
            te_mut(ctx, thridx)?
        };
    }

    macro_rules! ibinop {
        (|$a:ident, $b:ident| $e:expr) => {{
            let te = te!();
            let $b = te.pop();
            let $a = te.pop();
            te.push($e)?;
        }};
    }

    macro_rules! lbinop {
        (|$a:ident, $b:ident| $e:expr) => {{
            let te = te!();
            let $b = te.pop_long();
            let $a = te.pop_long();
            te.push_long($e)?;
        }};
    }

    macro_rules! fbinop {
        (|$a:ident, $b:ident| $e:expr) => {{
            let te = te!();
            let $b = slot_to_float(te.pop());
            let $a = slot_to_float(te.pop());
            te.push(float_to_slot($e))?;
        }};
    }

    macro_rules! dbinop {
        (|$a:ident, $b:ident| $e:expr) => {{
            let te = te!();
            let $b = f64::from_bits(te.pop_long() as u64);
            let $a = f64::from_bits(te.pop_long() as u64);
            te.push_long(($e).to_bits() as i64)?;
        }};
    }

    macro_rules! branch_if {
        ($cond:expr) => {{
            let offset = fetch.i2()? as i64;
            if $cond {
                let target = branch_target(opcode_start, offset, code_len)?;
                te!().pc.offset = target;
            }
        }};
    }

    match opcode {
        op::NOP => {}
        op::ACONST_NULL => te!().push(0)?,
        op::ICONST_M1..=op::ICONST_5 => {
            te!().push(opcode as i32 - op::ICONST_0 as i32)?;
        }
        op::LCONST_0 | op::LCONST_1 => {
            te!().push_long((opcode - op::LCONST_0) as i64)?;
        }
        op::FCONST_0 | op::FCONST_1 | op::FCONST_2 => {
            te!().push(float_to_slot((opcode - op::FCONST_0) as f32))?;
        }
        op::DCONST_0 | op::DCONST_1 => {
            let v = (opcode - op::DCONST_0) as f64;
            te!().push_long(v.to_bits() as i64)?;
        }
        op::BIPUSH => {
            let v = fetch.i1()? as i32;
            te!().push(v)?;
        }
        op::SIPUSH => {
            let v = fetch.i2()? as i32;
            te!().push(v)?;
        }
        op::LDC => {
            let index = fetch.u1()? as u16;
            do_ldc(ctx, thridx, cf, index)?;
        }
        op::LDC_W => {
            let index = fetch.u2()?;
            do_ldc(ctx, thridx, cf, index)?;
        }
        op::LDC2_W => {
            let index = fetch.u2()?;
            match cf.pool(index) {
                Some(CpEntry::Long(v)) => te!().push_long(*v)?,
                Some(CpEntry::Double(v)) => te!().push_long(v.to_bits() as i64)?,
                _ => return Err(verify_error()),
            }
        }

        op::ILOAD | op::FLOAD | op::ALOAD => {
            let index = local_index(fetch, wide)?;
            let te = te!();
            let v = te.local(index);
            te.push(v)?;
        }
        op::LLOAD | op::DLOAD => {
            let index = local_index(fetch, wide)?;
            let te = te!();
            let v = te.local_long(index);
            te.push_long(v)?;
        }
        op::ILOAD_0..=op::ILOAD_3 => load_n(ctx, thridx, (opcode - op::ILOAD_0) as usize, false)?,
        op::LLOAD_0..=op::LLOAD_3 => load_n(ctx, thridx, (opcode - op::LLOAD_0) as usize, true)?,
        op::FLOAD_0..=op::FLOAD_3 => load_n(ctx, thridx, (opcode - op::FLOAD_0) as usize, false)?,
        op::DLOAD_0..=op::DLOAD_3 => load_n(ctx, thridx, (opcode - op::DLOAD_0) as usize, true)?,
        op::ALOAD_0..=op::ALOAD_3 => load_n(ctx, thridx, (opcode - op::ALOAD_0) as usize, false)?,

        op::IALOAD | op::LALOAD | op::FALOAD | op::DALOAD | op::AALOAD | op::BALOAD
        | op::CALOAD | op::SALOAD => {
            let (index, hash) = {
                let te = te!();
                let index = te.pop();
                let hash = ObjectHash::from_raw(te.pop() as u32);
                (index, hash)
            };
            let value = ctx.objects.array_get(hash, index)?;
            push_value(te!(), value)?;
        }

        op::ISTORE | op::FSTORE | op::ASTORE => {
            let index = local_index(fetch, wide)?;
            let te = te!();
            let v = te.pop();
            te.set_local(index, v);
        }
        op::LSTORE | op::DSTORE => {
            let index = local_index(fetch, wide)?;
            let te = te!();
            let v = te.pop_long();
            te.set_local_long(index, v);
        }
        op::ISTORE_0..=op::ISTORE_3 => store_n(ctx, thridx, (opcode - op::ISTORE_0) as usize, false)?,
        op::LSTORE_0..=op::LSTORE_3 => store_n(ctx, thridx, (opcode - op::LSTORE_0) as usize, true)?,
        op::FSTORE_0..=op::FSTORE_3 => store_n(ctx, thridx, (opcode - op::FSTORE_0) as usize, false)?,
        op::DSTORE_0..=op::DSTORE_3 => store_n(ctx, thridx, (opcode - op::DSTORE_0) as usize, true)?,
        op::ASTORE_0..=op::ASTORE_3 => store_n(ctx, thridx, (opcode - op::ASTORE_0) as usize, false)?,

        op::IASTORE | op::FASTORE | op::BASTORE | op::CASTORE | op::SASTORE | op::LASTORE
        | op::DASTORE | op::AASTORE => {
            do_array_store(ctx, thridx, opcode)?;
        }

        op::POP => {
            te!().pop();
        }
        op::POP2 => {
            let te = te!();
            te.pop();
            te.pop();
        }
        op::DUP => {
            let te = te!();
            let v = te.peek(0);
            te.push(v)?;
        }
        op::DUP_X1 => {
            let te = te!();
            let v1 = te.pop();
            let v2 = te.pop();
            te.push(v1)?;
            te.push(v2)?;
            te.push(v1)?;
        }
        op::DUP_X2 => {
            let te = te!();
            let v1 = te.pop();
            let v2 = te.pop();
            let v3 = te.pop();
            te.push(v1)?;
            te.push(v3)?;
            te.push(v2)?;
            te.push(v1)?;
        }
        op::DUP2 => {
            let te = te!();
            let v1 = te.peek(0);
            let v2 = te.peek(1);
            te.push(v2)?;
            te.push(v1)?;
        }
        op::DUP2_X1 => {
            let te = te!();
            let v1 = te.pop();
            let v2 = te.pop();
            let v3 = te.pop();
            te.push(v2)?;
            te.push(v1)?;
            te.push(v3)?;
            te.push(v2)?;
            te.push(v1)?;
        }
        op::DUP2_X2 => {
            let te = te!();
            let v1 = te.pop();
            let v2 = te.pop();
            let v3 = te.pop();
            let v4 = te.pop();
            te.push(v2)?;
            te.push(v1)?;
            te.push(v4)?;
            te.push(v3)?;
            te.push(v2)?;
            te.push(v1)?;
        }
        op::SWAP => {
            let te = te!();
            let v1 = te.pop();
            let v2 = te.pop();
            te.push(v1)?;
            te.push(v2)?;
        }

        op::IADD => ibinop!(|a, b| a.wrapping_add(b)),
        op::LADD => lbinop!(|a, b| a.wrapping_add(b)),
        op::FADD => fbinop!(|a, b| a + b),
        op::DADD => dbinop!(|a, b| a + b),
        op::ISUB => ibinop!(|a, b| a.wrapping_sub(b)),
        op::LSUB => lbinop!(|a, b| a.wrapping_sub(b)),
        op::FSUB => fbinop!(|a, b| a - b),
        op::DSUB => dbinop!(|a, b| a - b),
        op::IMUL => ibinop!(|a, b| a.wrapping_mul(b)),
        op::LMUL => lbinop!(|a, b| a.wrapping_mul(b)),
        op::FMUL => fbinop!(|a, b| a * b),
        op::DMUL => dbinop!(|a, b| a * b),
        op::IDIV => {
            let te = te!();
            let b = te.pop();
            let a = te.pop();
            if b == 0 {
                return Err(Thrown::exception("java/lang/ArithmeticException"));
            }
            te.push(a.wrapping_div(b))?;
        }
        op::LDIV => {
            let te = te!();
            let b = te.pop_long();
            let a = te.pop_long();
            if b == 0 {
                return Err(Thrown::exception("java/lang/ArithmeticException"));
            }
            te.push_long(a.wrapping_div(b))?;
        }
        op::FDIV => fbinop!(|a, b| a / b),
        op::DDIV => dbinop!(|a, b| a / b),
        op::IREM => {
            let te = te!();
            let b = te.pop();
            let a = te.pop();
            if b == 0 {
                return Err(Thrown::exception("java/lang/ArithmeticException"));
            }
            te.push(a.wrapping_rem(b))?;
        }
        op::LREM => {
            let te = te!();
            let b = te.pop_long();
            let a = te.pop_long();
            if b == 0 {
                return Err(Thrown::exception("java/lang/ArithmeticException"));
            }
            te.push_long(a.wrapping_rem(b))?;
        }
        op::FREM => fbinop!(|a, b| a % b),
        op::DREM => dbinop!(|a, b| a % b),
        op::INEG => {
            let te = te!();
            let v = te.pop();
            te.push(v.wrapping_neg())?;
        }
        op::LNEG => {
            let te = te!();
            let v = te.pop_long();
            te.push_long(v.wrapping_neg())?;
        }
        op::FNEG => {
            let te = te!();
            let v = slot_to_float(te.pop());
            te.push(float_to_slot(-v))?;
        }
        op::DNEG => {
            let te = te!();
            let v = f64::from_bits(te.pop_long() as u64);
            te.push_long((-v).to_bits() as i64)?;
        }
        // shift distances use only the low bits of the count
        op::ISHL => ibinop!(|a, b| a.wrapping_shl(b as u32 & 0x1f)),
        op::LSHL => {
            let te = te!();
            let b = te.pop();
            let a = te.pop_long();
            te.push_long(a.wrapping_shl(b as u32 & 0x3f))?;
        }
        op::ISHR => ibinop!(|a, b| a.wrapping_shr(b as u32 & 0x1f)),
        op::LSHR => {
            let te = te!();
            let b = te.pop();
            let a = te.pop_long();
            te.push_long(a.wrapping_shr(b as u32 & 0x3f))?;
        }
        op::IUSHR => ibinop!(|a, b| ((a as u32) >> (b as u32 & 0x1f)) as i32),
        op::LUSHR => {
            let te = te!();
            let b = te.pop();
            let a = te.pop_long();
            te.push_long(((a as u64) >> (b as u32 & 0x3f)) as i64)?;
        }
        op::IAND => ibinop!(|a, b| a & b),
        op::LAND => lbinop!(|a, b| a & b),
        op::IOR => ibinop!(|a, b| a | b),
        op::LOR => lbinop!(|a, b| a | b),
        op::IXOR => ibinop!(|a, b| a ^ b),
        op::LXOR => lbinop!(|a, b| a ^ b),

        op::IINC => {
            let (index, delta) = if wide {
                (fetch.u2()? as usize, fetch.i2()? as i32)
            } else {
                (fetch.u1()? as usize, fetch.i1()? as i32)
            };
            let te = te!();
            let v = te.local(index).wrapping_add(delta);
            te.set_local(index, v);
        }

        op::I2L => {
            let te = te!();
            let v = te.pop();
            te.push_long(v as i64)?;
        }
        op::I2F => {
            let te = te!();
            let v = te.pop();
            te.push(float_to_slot(v as f32))?;
        }
        op::I2D => {
            let te = te!();
            let v = te.pop();
            te.push_long((v as f64).to_bits() as i64)?;
        }
        op::L2I => {
            let te = te!();
            let v = te.pop_long();
            te.push(v as i32)?;
        }
        op::L2F => {
            let te = te!();
            let v = te.pop_long();
            te.push(float_to_slot(v as f32))?;
        }
        op::L2D => {
            let te = te!();
            let v = te.pop_long();
            te.push_long((v as f64).to_bits() as i64)?;
        }
        // `as` casts saturate and send NaN to zero, exactly the
        // special-case table these conversions require
        op::F2I => {
            let te = te!();
            let v = slot_to_float(te.pop());
            te.push(v as i32)?;
        }
        op::F2L => {
            let te = te!();
            let v = slot_to_float(te.pop());
            te.push_long(v as i64)?;
        }
        op::F2D => {
            let te = te!();
            let v = slot_to_float(te.pop());
            te.push_long((v as f64).to_bits() as i64)?;
        }
        op::D2I => {
            let te = te!();
            let v = f64::from_bits(te.pop_long() as u64);
            te.push(v as i32)?;
        }
        op::D2L => {
            let te = te!();
            let v = f64::from_bits(te.pop_long() as u64);
            te.push_long(v as i64)?;
        }
        op::D2F => {
            let te = te!();
            let v = f64::from_bits(te.pop_long() as u64);
            te.push(float_to_slot(v as f32))?;
        }
        op::I2B => {
            let te = te!();
            let v = te.pop();
            te.push(v as i8 as i32)?;
        }
        op::I2C => {
            let te = te!();
            let v = te.pop();
            te.push(v as u16 as i32)?;
        }
        op::I2S => {
            let te = te!();
            let v = te.pop();
            te.push(v as i16 as i32)?;
        }

        op::LCMP => {
            let te = te!();
            let b = te.pop_long();
            let a = te.pop_long();
            te.push(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })?;
        }
        op::FCMPL | op::FCMPG => {
            let te = te!();
            let b = slot_to_float(te.pop());
            let a = slot_to_float(te.pop());
            te.push(fp_compare(
                a.partial_cmp(&b),
                opcode == op::FCMPG,
            ))?;
        }
        op::DCMPL | op::DCMPG => {
            let te = te!();
            let b = f64::from_bits(te.pop_long() as u64);
            let a = f64::from_bits(te.pop_long() as u64);
            te.push(fp_compare(
                a.partial_cmp(&b),
                opcode == op::DCMPG,
            ))?;
        }

        op::IFEQ => branch_if!(te!().pop() == 0),
        op::IFNE => branch_if!(te!().pop() != 0),
        op::IFLT => branch_if!(te!().pop() < 0),
        op::IFGE => branch_if!(te!().pop() >= 0),
        op::IFGT => branch_if!(te!().pop() > 0),
        op::IFLE => branch_if!(te!().pop() <= 0),
        op::IF_ICMPEQ | op::IF_ICMPNE | op::IF_ICMPLT | op::IF_ICMPGE | op::IF_ICMPGT
        | op::IF_ICMPLE => {
            let (a, b) = {
                let te = te!();
                let b = te.pop();
                let a = te.pop();
                (a, b)
            };
            let taken = match opcode {
                op::IF_ICMPEQ => a == b,
                op::IF_ICMPNE => a != b,
                op::IF_ICMPLT => a < b,
                op::IF_ICMPGE => a >= b,
                op::IF_ICMPGT => a > b,
                _ => a <= b,
            };
            let offset = fetch.i2()? as i64;
            if taken {
                te!().pc.offset = branch_target(opcode_start, offset, code_len)?;
            }
        }
        op::IF_ACMPEQ => branch_if!({
            let te = te!();
            let b = te.pop();
            let a = te.pop();
            a == b
        }),
        op::IF_ACMPNE => branch_if!({
            let te = te!();
            let b = te.pop();
            let a = te.pop();
            a != b
        }),
        op::IFNULL => branch_if!(te!().pop() == 0),
        op::IFNONNULL => branch_if!(te!().pop() != 0),
        op::GOTO => {
            let offset = fetch.i2()? as i64;
            te!().pc.offset = branch_target(opcode_start, offset, code_len)?;
        }
        op::GOTO_W => {
            let offset = fetch.i4()? as i64;
            te!().pc.offset = branch_target(opcode_start, offset, code_len)?;
        }
        op::JSR => {
            let offset = fetch.i2()? as i64;
            let next = fetch.off as i32;
            let te = te!();
            te.push(next)?;
            te.pc.offset = branch_target(opcode_start, offset, code_len)?;
        }
        op::JSR_W => {
            let offset = fetch.i4()? as i64;
            let next = fetch.off as i32;
            let te = te!();
            te.push(next)?;
            te.pc.offset = branch_target(opcode_start, offset, code_len)?;
        }
        op::RET => {
            let index = local_index(fetch, wide)?;
            let te = te!();
            let target = te.local(index);
            if target < 0 || target as usize >= code_len {
                return Err(verify_error());
            }
            te.pc.offset = target as u32;
        }

        op::TABLESWITCH => {
            fetch.align4();
            let default = fetch.i4()? as i64;
            let low = fetch.i4()?;
            let high = fetch.i4()?;
            if low > high {
                return Err(verify_error());
            }
            let key = te!().pop();
            let mut taken = default;
            for i in low..=high {
                let offset = fetch.i4()? as i64;
                if i == key {
                    taken = offset;
                }
            }
            te!().pc.offset = branch_target(opcode_start, taken, code_len)?;
        }
        op::LOOKUPSWITCH => {
            fetch.align4();
            let default = fetch.i4()? as i64;
            let npairs = fetch.i4()?;
            if npairs < 0 {
                return Err(verify_error());
            }
            let key = te!().pop();
            let mut taken = default;
            for _ in 0..npairs {
                let candidate = fetch.i4()?;
                let offset = fetch.i4()? as i64;
                if candidate == key {
                    taken = offset;
                }
            }
            te!().pc.offset = branch_target(opcode_start, taken, code_len)?;
        }

        op::IRETURN | op::FRETURN | op::ARETURN => return do_return(ctx, thridx, cf, 1),
        op::LRETURN | op::DRETURN => return do_return(ctx, thridx, cf, 2),
        op::RETURN => return do_return(ctx, thridx, cf, 0),

        op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD => {
            let index = fetch.u2()?;
            return do_field_access(ctx, thridx, cf, index, opcode, opcode_start);
        }

        op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC => {
            let index = fetch.u2()?;
            return do_invoke(ctx, thridx, cf, index, opcode, opcode_start, fetch.off as u32);
        }
        op::INVOKEINTERFACE => {
            let index = fetch.u2()?;
            let _count = fetch.u1()?;
            let zero = fetch.u1()?;
            if zero != 0 {
                return Err(verify_error());
            }
            return do_invoke(ctx, thridx, cf, index, opcode, opcode_start, fetch.off as u32);
        }
        op::INVOKEDYNAMIC => {
            // post-bootstrap linkage; the constant kinds behind it are
            // rejected at class load, so reaching here is malformed
            return Err(Thrown::error("java/lang/UnsupportedClassVersionError"));
        }

        op::NEW => {
            let index = fetch.u2()?;
            let current = thridx_class(ctx, thridx)?;
            let clsidx = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let entry = ctx.classes.entry(clsidx).ok_or_else(internal_error)?;
            if entry.is_interface()
                || entry.is_array()
                || entry
                    .access_flags()
                    .contains(classfile::ClassAccessFlags::ABSTRACT)
            {
                return Err(Thrown::error("java/lang/InstantiationError"));
            }
            crate::class::clinit(ctx, clsidx, thridx)?;
            let special = if ctx.is_thread_class(clsidx) {
                Special::Thread
            } else {
                Special::None
            };
            let hash = object::instance_new(
                ctx,
                NewInstance {
                    class: clsidx,
                    special,
                    lengths: Vec::new(),
                    run_init: false,
                    thread: thridx,
                },
            )?;
            te!().push(hash.raw() as i32)?;
        }
        op::NEWARRAY => {
            let atype = fetch.u1()?;
            let descriptor = match atype {
                4 => "[Z",
                5 => "[C",
                6 => "[F",
                7 => "[D",
                8 => "[B",
                9 => "[S",
                10 => "[I",
                11 => "[J",
                _ => return Err(verify_error()),
            };
            let count = te!().pop();
            let hash = new_array(ctx, thridx, descriptor, &[count])?;
            te!().push(hash.raw() as i32)?;
        }
        op::ANEWARRAY => {
            let index = fetch.u2()?;
            let current = thridx_class(ctx, thridx)?;
            let element = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let element_name = ctx.classes.name_of(element).ok_or_else(internal_error)?;
            let descriptor = if element_name.starts_with('[') {
                format!("[{element_name}")
            } else {
                format!("[L{element_name};")
            };
            let count = te!().pop();
            let hash = new_array(ctx, thridx, &descriptor, &[count])?;
            te!().push(hash.raw() as i32)?;
        }
        op::MULTIANEWARRAY => {
            let index = fetch.u2()?;
            let dims = fetch.u1()? as usize;
            if dims == 0 {
                return Err(verify_error());
            }
            let current = thridx_class(ctx, thridx)?;
            let clsidx = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let name = ctx.classes.name_of(clsidx).ok_or_else(internal_error)?;
            let mut counts = vec![0i32; dims];
            {
                let te = te!();
                for slot in counts.iter_mut().rev() {
                    *slot = te.pop();
                }
            }
            let hash = new_array(ctx, thridx, &name, &counts)?;
            te!().push(hash.raw() as i32)?;
        }
        op::ARRAYLENGTH => {
            let hash = ObjectHash::from_raw(te!().pop() as u32);
            let entry = ctx
                .objects
                .entry(hash)
                .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
            if !entry.is_array() {
                return Err(verify_error());
            }
            let length = *entry.lengths.first().unwrap_or(&0);
            te!().push(length as i32)?;
        }

        op::ATHROW => {
            let hash = ObjectHash::from_raw(te!().pop() as u32);
            let clsidx = ctx
                .objects
                .class_of(hash)
                .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
            let name = ctx.classes.name_of(clsidx).ok_or_else(internal_error)?;
            return Err(Thrown {
                kind: ctx.throwable_kind(clsidx),
                class_name: name,
                instance: hash,
            });
        }

        op::CHECKCAST => {
            let index = fetch.u2()?;
            let current = thridx_class(ctx, thridx)?;
            let target = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let hash = ObjectHash::from_raw(te!().peek(0) as u32);
            if !hash.is_null() && !ctx.instance_of(hash, target) {
                return Err(Thrown::exception("java/lang/ClassCastException"));
            }
        }
        op::INSTANCEOF => {
            let index = fetch.u2()?;
            let current = thridx_class(ctx, thridx)?;
            let target = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let hash = ObjectHash::from_raw(te!().pop() as u32);
            let result = !hash.is_null() && ctx.instance_of(hash, target);
            te!().push(result as i32)?;
        }

        op::MONITORENTER => {
            let hash = ObjectHash::from_raw(te!().pop() as u32);
            if hash.is_null() {
                return Err(Thrown::exception("java/lang/NullPointerException"));
            }
            if !monitor::synchronize(ctx, thridx, hash) {
                // re-contend via the lock state: restore the operand
                // and re-enter at this opcode
                let te = te!();
                te.push(hash.raw() as i32)?;
                te.pc.offset = opcode_start;
                return Ok(Step::Block);
            }
        }
        op::MONITOREXIT => {
            let hash = ObjectHash::from_raw(te!().pop() as u32);
            if hash.is_null() {
                return Err(Thrown::exception("java/lang/NullPointerException"));
            }
            monitor::unsynchronize(ctx, thridx, hash)?;
        }

        op::WIDE => {
            te!().wide_latch = true;
        }

        _ => {
            warn!("unimplemented opcode {opcode:#04x}");
            return Err(verify_error());
        }
    }
    Ok(Step::Continue)
}

/// The class whose pool the current method reads from.
fn thridx_class(ctx: &JvmContext, thridx: ThreadIndex) -> Result<ClassIndex, Thrown> {
    ctx.threads
        .entry(thridx)
        .map(|te| te.pc.clsidx)
        .ok_or_else(internal_error)
}

fn fp_compare(ordering: Option<std::cmp::Ordering>, nan_is_one: bool) -> i32 {
    match ordering {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => {
            if nan_is_one {
                1
            } else {
                -1
            }
        }
    }
}

fn local_index(fetch: &mut Fetch<'_>, wide: bool) -> Result<usize, Thrown> {
    Ok(if wide {
        fetch.u2()? as usize
    } else {
        fetch.u1()? as usize
    })
}

fn load_n(ctx: &mut JvmContext, thridx: ThreadIndex, index: usize, long: bool) -> Result<(), Thrown> {
    let te = te_mut(ctx, thridx)?;
    if long {
        let v = te.local_long(index);
        te.push_long(v)
    } else {
        let v = te.local(index);
        te.push(v)
    }
}

fn store_n(ctx: &mut JvmContext, thridx: ThreadIndex, index: usize, long: bool) -> Result<(), Thrown> {
    let te = te_mut(ctx, thridx)?;
    if long {
        let v = te.pop_long();
        te.set_local_long(index, v);
    } else {
        let v = te.pop();
        te.set_local(index, v);
    }
    Ok(())
}

fn do_ldc(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    cf: &Rc<ClassFile>,
    index: u16,
) -> Result<(), Thrown> {
    match cf.pool(index) {
        Some(CpEntry::Integer(v)) => te_mut(ctx, thridx)?.push(*v),
        Some(CpEntry::Float(v)) => te_mut(ctx, thridx)?.push(float_to_slot(*v)),
        Some(CpEntry::String { string_index }) => {
            let s = cf.utf8(*string_index).cloned().ok_or_else(verify_error)?;
            let hash = ctx.intern_string(&s, thridx)?;
            te_mut(ctx, thridx)?.push(hash.raw() as i32)
        }
        Some(CpEntry::Class { .. }) => {
            let current = thridx_class(ctx, thridx)?;
            let clsidx = linkage::resolve_class_entry(ctx, current, cf, index, thridx)?;
            let meta = ctx
                .classes
                .entry(clsidx)
                .map(|e| e.class_object)
                .unwrap_or(ObjectHash::NULL);
            te_mut(ctx, thridx)?.push(meta.raw() as i32)
        }
        _ => Err(verify_error()),
    }
}

fn do_array_store(ctx: &mut JvmContext, thridx: ThreadIndex, opcode: u8) -> Result<(), Thrown> {
    let tpe = match opcode {
        op::IASTORE => BaseType::Int,
        op::FASTORE => BaseType::Float,
        op::BASTORE => BaseType::Byte,
        op::CASTORE => BaseType::Char,
        op::SASTORE => BaseType::Short,
        op::LASTORE => BaseType::Long,
        op::DASTORE => BaseType::Double,
        _ => BaseType::Reference,
    };
    let (value, index, hash) = {
        let te = te_mut(ctx, thridx)?;
        let value = pop_typed(te, tpe);
        let index = te.pop();
        let hash = ObjectHash::from_raw(te.pop() as u32);
        (value, index, hash)
    };
    if opcode == op::AASTORE {
        if let JValue::Reference(target) = value {
            if !target.is_null() && !ctx.array_element_accepts(hash, target) {
                return Err(Thrown::exception("java/lang/ArrayStoreException"));
            }
        }
    }
    ctx.objects.array_set(hash, index, value)
}

fn new_array(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    descriptor: &str,
    counts: &[i32],
) -> Result<ObjectHash, Thrown> {
    if counts.iter().any(|&c| c < 0) {
        return Err(Thrown::exception(
            "java/lang/NegativeArraySizeException",
        ));
    }
    let clsidx = crate::class::load(ctx, descriptor, thridx)?;
    object::instance_new(
        ctx,
        NewInstance {
            class: clsidx,
            special: Special::None,
            lengths: counts.iter().map(|&c| c as u32).collect(),
            run_init: false,
            thread: thridx,
        },
    )
}

fn do_field_access(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    cf: &Rc<ClassFile>,
    index: u16,
    opcode: u8,
    _opcode_start: u32,
) -> Result<Step, Thrown> {
    let current = thridx_class(ctx, thridx)?;
    let field = linkage::resolve_field_entry(ctx, current, cf, index, thridx)?;

    let want_static = matches!(opcode, op::GETSTATIC | op::PUTSTATIC);
    if field.static_field != want_static {
        return Err(Thrown::error(
            "java/lang/IncompatibleClassChangeError",
        ));
    }

    match opcode {
        op::GETSTATIC => {
            let value = ctx
                .classes
                .entry(field.class)
                .and_then(|e| e.statics.get(field.lookup.idx()).copied())
                .ok_or_else(internal_error)?;
            push_value(te_mut(ctx, thridx)?, value)?;
        }
        op::PUTSTATIC => {
            if field.final_field && current != field.class {
                return Err(Thrown::error("java/lang/IllegalAccessError"));
            }
            let value = pop_typed(te_mut(ctx, thridx)?, field.value_type);
            let old = ctx
                .classes
                .entry(field.class)
                .and_then(|e| e.statics.get(field.lookup.idx()).copied());
            // reference mutation is bracketed by rmref(old)/mkref(new)
            if let Some(JValue::Reference(old_hash)) = old {
                if !old_hash.is_null() {
                    ctx.gc
                        .class_field_rmref(&mut ctx.classes, field.class, field.lookup);
                    ctx.gc
                        .object_rmref_from_class(&mut ctx.objects, field.class, old_hash);
                }
            }
            if let JValue::Reference(new_hash) = value {
                if !new_hash.is_null() {
                    ctx.gc
                        .class_field_mkref(&mut ctx.classes, field.class, field.lookup);
                    ctx.gc
                        .object_mkref_from_class(&mut ctx.objects, field.class, new_hash);
                }
            }
            if let Some(slot) = ctx
                .classes
                .entry_mut(field.class)
                .and_then(|e| e.statics.get_mut(field.lookup.idx()))
            {
                *slot = value;
            }
        }
        op::GETFIELD => {
            let hash = ObjectHash::from_raw(te_mut(ctx, thridx)?.pop() as u32);
            let value = ctx
                .objects
                .entry(hash)
                .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?
                .fields
                .get(field.lookup.idx())
                .copied()
                .ok_or_else(internal_error)?;
            push_value(te_mut(ctx, thridx)?, value)?;
        }
        op::PUTFIELD => {
            if field.final_field && current != field.class {
                return Err(Thrown::error("java/lang/IllegalAccessError"));
            }
            let (value, hash) = {
                let te = te_mut(ctx, thridx)?;
                let value = pop_typed(te, field.value_type);
                let hash = ObjectHash::from_raw(te.pop() as u32);
                (value, hash)
            };
            let old = ctx
                .objects
                .entry(hash)
                .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?
                .fields
                .get(field.lookup.idx())
                .copied();
            if let Some(JValue::Reference(old_hash)) = old {
                if !old_hash.is_null() {
                    ctx.gc
                        .object_field_rmref(&mut ctx.objects, hash, field.lookup);
                    ctx.gc
                        .object_rmref_from_object(&mut ctx.objects, hash, old_hash);
                }
            }
            if let JValue::Reference(new_hash) = value {
                if !new_hash.is_null() {
                    ctx.gc
                        .object_field_mkref(&mut ctx.objects, hash, field.lookup);
                    ctx.gc
                        .object_mkref_from_object(&mut ctx.objects, hash, new_hash);
                }
            }
            if let Some(slot) = ctx
                .objects
                .entry_mut(hash)
                .and_then(|e| e.fields.get_mut(field.lookup.idx()))
            {
                *slot = value;
            }
        }
        _ => return Err(internal_error()),
    }
    Ok(Step::Continue)
}

fn do_invoke(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    cf: &Rc<ClassFile>,
    index: u16,
    opcode: u8,
    opcode_start: u32,
    next_offset: u32,
) -> Result<Step, Thrown> {
    let current = thridx_class(ctx, thridx)?;
    let resolved = linkage::resolve_method_entry(ctx, current, cf, index, thridx)?;

    let descriptor = classfile::method_descriptor(&resolved.descriptor)
        .map_err(|_| verify_error())?;
    let is_static = resolved.access_flags.contains(MethodAccessFlags::STATIC);
    if (opcode == op::INVOKESTATIC) != is_static {
        return Err(Thrown::error(
            "java/lang/IncompatibleClassChangeError",
        ));
    }

    let arg_slots = descriptor.arg_slots as usize + usize::from(!is_static);

    // `this` sits below the arguments; leave everything on the stack
    // until the monitor (if any) is held
    let this_hash = if is_static {
        ObjectHash::NULL
    } else {
        let te = te_mut(ctx, thridx)?;
        let hash = ObjectHash::from_raw(te.peek(arg_slots - 1) as u32);
        if hash.is_null() {
            return Err(Thrown::exception("java/lang/NullPointerException"));
        }
        hash
    };

    // dynamic dispatch for virtual/interface sends
    let selected = match opcode {
        op::INVOKEVIRTUAL | op::INVOKEINTERFACE => {
            let runtime_class = ctx
                .objects
                .class_of(this_hash)
                .ok_or_else(internal_error)?;
            select_method(ctx, runtime_class, &resolved)?
        }
        _ => resolved.clone(),
    };

    if selected
        .access_flags
        .contains(MethodAccessFlags::ABSTRACT)
    {
        return Err(Thrown::error("java/lang/AbstractMethodError"));
    }

    if selected
        .access_flags
        .contains(MethodAccessFlags::SYNCHRONIZED)
    {
        let target = if is_static {
            ctx.classes
                .entry(selected.class)
                .map(|e| e.class_object)
                .unwrap_or(ObjectHash::NULL)
        } else {
            this_hash
        };
        if !target.is_null() && !monitor::synchronize(ctx, thridx, target) {
            // roll the pc back to the opcode byte: the thread re-enters
            // through the lock state and retries the whole invoke
            te_mut(ctx, thridx)?.pc.offset = opcode_start;
            return Ok(Step::Block);
        }
    }

    // arguments leave the caller's operand stack now
    let mut slots = vec![0i32; arg_slots];
    {
        let te = te_mut(ctx, thridx)?;
        for slot in slots.iter_mut().rev() {
            *slot = te.pop();
        }
        te.pc.offset = next_offset;
    }

    if selected.access_flags.contains(MethodAccessFlags::NATIVE) {
        let ordinal = selected
            .native_ordinal
            .ok_or_else(|| Thrown::error("java/lang/UnsatisfiedLinkError"))?;
        let args = slots_to_values(&slots, &descriptor, is_static);
        let result = crate::native::invoke(ctx, thridx, ordinal, args)?;
        if let Some(value) = result {
            push_value(te_mut(ctx, thridx)?, value)?;
        }
        // a blocking native parks the thread through the state machine
        let blocked = ctx
            .threads
            .entry(thridx)
            .is_some_and(|te| te.next_state != ThreadState::Running || te.this_state != ThreadState::Running);
        return Ok(if blocked { Step::Block } else { Step::Continue });
    }

    let target_cf = ctx
        .classes
        .class_file(selected.class)
        .ok_or_else(internal_error)?;
    let (_, max_stack, max_locals, _) = target_cf
        .code_at(selected.method.0, selected.code_attr)
        .ok_or_else(verify_error)?;

    let pc = ProgramCounter {
        clsidx: selected.class,
        mthidx: selected.method,
        codeatridx: selected.code_attr,
        excpatridx: selected.excp_attr,
        offset: 0,
    };
    let frame = {
        let te = te_mut(ctx, thridx)?;
        te.push_frame(max_locals, max_stack, pc)?;
        for (i, slot) in slots.iter().enumerate() {
            te.set_local(i, *slot);
        }
        te.fp
    };
    ctx.gc.stack_mkref_from_jvm(thridx, frame);
    trace!(
        "{thridx:?} invoke {}{} on {:?}",
        selected.name,
        selected.descriptor,
        selected.class
    );
    Ok(Step::Continue)
}

/// Walks the runtime class chain for the override of a resolved
/// method (virtual dispatch).
fn select_method(
    ctx: &mut JvmContext,
    runtime_class: ClassIndex,
    resolved: &ResolvedMethod,
) -> Result<ResolvedMethod, Thrown> {
    let Some((def_class, mthidx)) = ctx
        .classes
        .find_method(runtime_class, &resolved.name, &resolved.descriptor)
    else {
        return Ok(resolved.clone());
    };
    if def_class == resolved.class {
        return Ok(resolved.clone());
    }
    let cf = ctx
        .classes
        .class_file(def_class)
        .ok_or_else(internal_error)?;
    let method = cf
        .methods
        .get(mthidx as usize)
        .ok_or_else(internal_error)?;
    let code_attr = method.code_attr_index().unwrap_or(u16::MAX);
    let native_ordinal = if method.access_flags.contains(MethodAccessFlags::NATIVE) {
        ctx.natives.ordinal_of(
            ctx.classes.name_of(def_class).as_deref().unwrap_or(""),
            &resolved.name,
            &resolved.descriptor,
        )
    } else {
        None
    };
    Ok(ResolvedMethod {
        class: def_class,
        method: MethodIndex(mthidx),
        code_attr,
        excp_attr: code_attr,
        access_flags: method.access_flags,
        name: resolved.name.clone(),
        descriptor: resolved.descriptor.clone(),
        native_ordinal,
    })
}

fn slots_to_values(
    slots: &[i32],
    descriptor: &classfile::MethodDescriptor,
    is_static: bool,
) -> Vec<JValue> {
    let mut values = Vec::new();
    let mut cursor = 0;
    if !is_static {
        values.push(JValue::Reference(ObjectHash::from_raw(slots[0] as u32)));
        cursor = 1;
    }
    for &tpe in &descriptor.arg_types {
        match tpe {
            BaseType::Long => {
                values.push(JValue::Long(combine_jlong(slots[cursor], slots[cursor + 1])));
                cursor += 2;
            }
            BaseType::Double => {
                values.push(JValue::Double(crate::types::combine_jdouble(
                    slots[cursor],
                    slots[cursor + 1],
                )));
                cursor += 2;
            }
            BaseType::Float => {
                values.push(JValue::Float(slot_to_float(slots[cursor])));
                cursor += 1;
            }
            BaseType::Reference => {
                values.push(JValue::Reference(ObjectHash::from_raw(slots[cursor] as u32)));
                cursor += 1;
            }
            _ => {
                values.push(JValue::Int(slots[cursor]));
                cursor += 1;
            }
        }
    }
    values
}

/// Shared tail of the six return opcodes.
fn do_return(
    ctx: &mut JvmContext,
    thridx: ThreadIndex,
    cf: &Rc<ClassFile>,
    value_slots: usize,
) -> Result<Step, Thrown> {
    let pc = ctx
        .threads
        .entry(thridx)
        .map(|te| te.pc)
        .ok_or_else(internal_error)?;
    let method = cf
        .methods
        .get(pc.mthidx.idx())
        .ok_or_else(internal_error)?;
    let (_, _, max_locals, _) = cf
        .code_at(pc.mthidx.0, pc.codeatridx)
        .ok_or_else(verify_error)?;

    // a synchronized method gives its monitor back on the way out
    if method.access_flags.contains(MethodAccessFlags::SYNCHRONIZED) {
        let target = if method.access_flags.contains(MethodAccessFlags::STATIC) {
            ctx.classes
                .entry(pc.clsidx)
                .map(|e| e.class_object)
                .unwrap_or(ObjectHash::NULL)
        } else {
            let te = te_mut(ctx, thridx)?;
            ObjectHash::from_raw(te.local(0) as u32)
        };
        if !target.is_null() {
            monitor::unsynchronize(ctx, thridx, target)?;
        }
    }

    let frame = ctx.threads.entry(thridx).map(|te| te.fp).unwrap_or(0);
    ctx.gc.stack_rmref_from_jvm(thridx, frame);

    let te = te_mut(ctx, thridx)?;
    let mut value = [0i32; 2];
    for i in (0..value_slots).rev() {
        value[i] = te.pop();
    }
    let done = te.pop_frame(max_locals);
    for slot in value.iter().take(value_slots) {
        te.push(*slot)?;
    }
    Ok(if done { Step::End } else { Step::Continue })
}
