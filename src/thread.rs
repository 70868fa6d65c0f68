//! The thread table: per-thread JVM stack, frame and program-counter
//! bookkeeping, status bits and the non-local-return buffer.

use std::rc::Rc;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, trace};

use crate::gc::GcPolicy;
use crate::heap::Block;
use crate::jvm::JvmContext;
use crate::state::ThreadState;
use crate::types::{
    ClassIndex, MethodIndex, ObjectHash, TableIndex, ThreadIndex, Thrown,
};

/// Control words a frame saves above its locals: the previous frame
/// pointer, the five program-counter fields, and the saved
/// exception-table attribute index.
pub const FRAME_CONTROL_WORDS: usize = 7;

const CTL_PREV_FP: usize = 0;
const CTL_CLSIDX: usize = 1;
const CTL_MTHIDX: usize = 2;
const CTL_CODEATR: usize = 3;
const CTL_EXCPATR: usize = 4;
const CTL_OFFSET: usize = 5;
const CTL_SAVED_EXCP: usize = 6;

bitflags! {
    /// Thread entry status bitmap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ThreadFlags: u32 {
        const INUSE = 0x0000_0001;
        const NULL = 0x0000_0002;
        const DAEMON = 0x0000_0004;
        const SLEEPING = 0x0000_0008;
        const JOIN4EVER = 0x0000_0010;
        const JOINTIMED = 0x0000_0020;
        const WAIT4EVER = 0x0000_0040;
        const WAITTIMED = 0x0000_0080;
        /// Parked in interruptible I/O.
        const INTERRUPTIBLE_IO = 0x0000_0100;
        /// Woken by notify/notifyAll while waiting.
        const NOTIFIED = 0x0000_0200;
        const INTERRUPTED = 0x0000_0400;
        const THREW_EXCEPTION = 0x0000_0800;
        const THREW_ERROR = 0x0000_1000;
        const THREW_THROWABLE = 0x0000_2000;
        const THREW_UNCAUGHT = 0x0000_4000;
    }
}

impl ThreadFlags {
    /// All blocking-condition bits, cleared on wakeup.
    pub const BLOCKING: ThreadFlags = ThreadFlags::SLEEPING
        .union(ThreadFlags::JOIN4EVER)
        .union(ThreadFlags::JOINTIMED)
        .union(ThreadFlags::WAIT4EVER)
        .union(ThreadFlags::WAITTIMED)
        .union(ThreadFlags::INTERRUPTIBLE_IO);
}

/// Where a thread is executing: class, method, code attribute,
/// exception-table attribute and byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramCounter {
    pub clsidx: ClassIndex,
    pub mthidx: MethodIndex,
    pub codeatridx: u16,
    pub excpatridx: u16,
    pub offset: u32,
}

impl ProgramCounter {
    pub fn null() -> ProgramCounter {
        ProgramCounter {
            clsidx: ClassIndex::NULL,
            mthidx: MethodIndex::BAD,
            codeatridx: u16::MAX,
            excpatridx: u16::MAX,
            offset: 0,
        }
    }
}

/// One thread.
#[derive(Debug)]
pub struct ThreadEntry {
    pub name: Option<String>,
    pub priority: i32,
    pub flags: ThreadFlags,
    pub prev_state: ThreadState,
    pub this_state: ThreadState,
    pub next_state: ThreadState,
    /// Wall-clock deadline for timed sleeps and waits.
    pub sleep_deadline: Option<Instant>,
    /// Thread being joined, when parked on a join.
    pub join_target: ThreadIndex,
    /// Object whose monitor this thread is contending for or must
    /// reacquire after a wait.  An unlocked, unparked thread has no
    /// lock target.
    pub lock_target: ObjectHash,
    /// Reentrance depth surrendered by a wait, restored on
    /// reacquisition.
    pub saved_lock_count: u32,
    /// The JVM stack: contiguous 32-bit slots.
    pub stack: Block,
    /// First free slot above the operand stack.
    pub sp: usize,
    /// Base of the current frame.
    pub fp: usize,
    /// Frame pointer at which this thread's top-level method was
    /// invoked; once `fp` falls back to or below it the thread is
    /// done, even while nested manual invocations run.
    pub end_program_fp: usize,
    pub pc: ProgramCounter,
    /// `wide` prefix latch, consumed by the next index-bearing opcode.
    pub wide_latch: bool,
    pub instruction_count: u64,
    /// Instructions retired in the current timeslice.
    pub slice_instructions: u64,
    /// The non-local-return buffer for thrown events.
    pub thrown: Option<Thrown>,
    /// Class name of a throwable waiting to be dispatched.
    pub pending_throwable: Option<Rc<str>>,
    /// The `java/lang/Thread` object for this thread.
    pub thread_object: ObjectHash,
}

impl ThreadEntry {
    fn empty() -> ThreadEntry {
        ThreadEntry {
            name: None,
            priority: 5,
            flags: ThreadFlags::empty(),
            prev_state: ThreadState::New,
            this_state: ThreadState::New,
            next_state: ThreadState::New,
            sleep_deadline: None,
            join_target: ThreadIndex::NULL,
            lock_target: ObjectHash::NULL,
            saved_lock_count: 0,
            stack: Block::null(),
            sp: 1,
            fp: 0,
            end_program_fp: 0,
            pc: ProgramCounter::null(),
            wide_latch: false,
            instruction_count: 0,
            slice_instructions: 0,
            thrown: None,
            pending_throwable: None,
            thread_object: ObjectHash::NULL,
        }
    }

    /// A fresh entry over the given stack storage; slot 0 is burned so
    /// the first frame sits above the end-of-program mark.
    pub fn with_stack(stack: Block) -> ThreadEntry {
        ThreadEntry {
            stack,
            ..ThreadEntry::empty()
        }
    }

    fn stack_slots(&self) -> usize {
        self.stack.len() / 4
    }

    /// Pushes one operand-stack slot.
    pub fn push(&mut self, value: i32) -> Result<(), Thrown> {
        if self.sp >= self.stack_slots() {
            return Err(Thrown::error("java/lang/StackOverflowError"));
        }
        self.stack.set_slot(self.sp, value);
        self.sp += 1;
        Ok(())
    }

    /// Pops one operand-stack slot.
    pub fn pop(&mut self) -> i32 {
        debug_assert!(self.sp > self.fp, "operand stack underflow");
        self.sp -= 1;
        self.stack.get_slot(self.sp)
    }

    /// Pushes a 64-bit value as two slots, MS word first.
    pub fn push_long(&mut self, value: i64) -> Result<(), Thrown> {
        let (hi, lo) = crate::types::split_jlong(value);
        self.push(hi)?;
        self.push(lo)
    }

    pub fn pop_long(&mut self) -> i64 {
        let lo = self.pop();
        let hi = self.pop();
        crate::types::combine_jlong(hi, lo)
    }

    /// Reads the slot `depth` positions below the top without popping.
    pub fn peek(&self, depth: usize) -> i32 {
        self.stack.get_slot(self.sp - 1 - depth)
    }

    pub fn local(&self, index: usize) -> i32 {
        self.stack.get_slot(self.fp + index)
    }

    pub fn set_local(&mut self, index: usize, value: i32) {
        self.stack.set_slot(self.fp + index, value);
    }

    pub fn local_long(&self, index: usize) -> i64 {
        crate::types::combine_jlong(self.local(index), self.local(index + 1))
    }

    pub fn set_local_long(&mut self, index: usize, value: i64) {
        let (hi, lo) = crate::types::split_jlong(value);
        self.set_local(index, hi);
        self.set_local(index + 1, lo);
    }

    /// Pushes a new frame: locals, saved control words, then room for
    /// the operand stack.  The caller fills locals afterwards.
    pub fn push_frame(
        &mut self,
        max_locals: u16,
        max_stack: u16,
        pc: ProgramCounter,
    ) -> Result<(), Thrown> {
        let new_fp = self.sp;
        let needed = new_fp + max_locals as usize + FRAME_CONTROL_WORDS + max_stack as usize;
        if needed > self.stack_slots() {
            return Err(Thrown::error("java/lang/StackOverflowError"));
        }

        for i in 0..max_locals as usize {
            self.stack.set_slot(new_fp + i, 0);
        }

        let ctl = new_fp + max_locals as usize;
        self.stack.set_slot(ctl + CTL_PREV_FP, self.fp as i32);
        self.stack.set_slot(ctl + CTL_CLSIDX, self.pc.clsidx.raw() as i32);
        self.stack.set_slot(ctl + CTL_MTHIDX, self.pc.mthidx.0 as i32);
        self.stack.set_slot(ctl + CTL_CODEATR, self.pc.codeatridx as i32);
        self.stack.set_slot(ctl + CTL_EXCPATR, self.pc.excpatridx as i32);
        self.stack.set_slot(ctl + CTL_OFFSET, self.pc.offset as i32);
        self.stack.set_slot(ctl + CTL_SAVED_EXCP, pc.excpatridx as i32);

        self.fp = new_fp;
        self.sp = ctl + FRAME_CONTROL_WORDS;
        self.pc = pc;
        Ok(())
    }

    /// Pops the current frame, restoring the caller's frame pointer
    /// and program counter.  Locals size is recovered from the saved
    /// control words' position.
    ///
    /// Returns true when the restored frame pointer has fallen to or
    /// below the end-of-program mark, meaning the thread's top-level
    /// method has returned.
    pub fn pop_frame(&mut self, max_locals: u16) -> bool {
        let ctl = self.fp + max_locals as usize;
        let prev_fp = self.stack.get_slot(ctl + CTL_PREV_FP) as usize;
        let pc = ProgramCounter {
            clsidx: ClassIndex::from_raw(self.stack.get_slot(ctl + CTL_CLSIDX) as u16),
            mthidx: MethodIndex(self.stack.get_slot(ctl + CTL_MTHIDX) as u16),
            codeatridx: self.stack.get_slot(ctl + CTL_CODEATR) as u16,
            excpatridx: self.stack.get_slot(ctl + CTL_EXCPATR) as u16,
            offset: self.stack.get_slot(ctl + CTL_OFFSET) as u32,
        };

        self.sp = self.fp;
        self.fp = prev_fp;
        self.pc = pc;
        self.fp <= self.end_program_fp
    }

    /// Base slot of the current frame's operand stack.
    pub fn operand_base(&self, max_locals: u16) -> usize {
        self.fp + max_locals as usize + FRAME_CONTROL_WORDS
    }
}

/// The thread registry.  Slot 0 is the permanently reserved null
/// entry.
#[derive(Debug)]
pub struct ThreadTable {
    entries: Vec<ThreadEntry>,
    capacity: usize,
    last_allocated: usize,
}

impl ThreadTable {
    pub fn init(capacity: usize) -> ThreadTable {
        ThreadTable {
            entries: vec![ThreadEntry::empty()],
            capacity,
            last_allocated: 0,
        }
    }

    pub fn entry(&self, thridx: ThreadIndex) -> Option<&ThreadEntry> {
        if thridx.is_null() {
            return None;
        }
        let entry = self.entries.get(thridx.idx())?;
        entry.flags.contains(ThreadFlags::INUSE).then_some(entry)
    }

    pub fn entry_mut(&mut self, thridx: ThreadIndex) -> Option<&mut ThreadEntry> {
        if thridx.is_null() {
            return None;
        }
        let entry = self.entries.get_mut(thridx.idx())?;
        entry.flags.contains(ThreadFlags::INUSE).then_some(entry)
    }

    pub fn iter_in_use(&self) -> impl Iterator<Item = ThreadIndex> + '_ {
        self.entries.iter().enumerate().skip(1).filter_map(|(i, e)| {
            e.flags
                .contains(ThreadFlags::INUSE)
                .then(|| ThreadIndex::from_raw(i as u16))
        })
    }

    fn alloc(&mut self) -> Option<ThreadIndex> {
        let len = self.entries.len();
        let start = (self.last_allocated + 1).max(1);
        for i in 0..len.saturating_sub(1) {
            let slot = 1 + (start - 1 + i) % (len - 1);
            if !self.entries[slot].flags.contains(ThreadFlags::INUSE) {
                self.entries[slot] = ThreadEntry::empty();
                self.last_allocated = slot;
                return Some(ThreadIndex::from_raw(slot as u16));
            }
        }
        if self.entries.len() < self.capacity {
            let slot = self.entries.len();
            self.entries.push(ThreadEntry::empty());
            self.last_allocated = slot;
            return Some(ThreadIndex::from_raw(slot as u16));
        }
        None
    }
}

/// Allocates a thread entry with its JVM stack, in state `new`.
pub fn thread_new(ctx: &mut JvmContext, thread_object: ObjectHash) -> Result<ThreadIndex, Thrown> {
    let thridx = ctx
        .threads
        .alloc()
        .ok_or_else(|| Thrown::error("java/lang/OutOfMemoryError"))?;

    let stack = ctx.acquire_stack(ctx.config.stack_slots * 4)?;
    let entry = &mut ctx.threads.entries[thridx.idx()];
    entry.flags = ThreadFlags::INUSE;
    entry.stack = stack;
    entry.thread_object = thread_object;
    ctx.gc.stack_new(thridx, ctx.config.stack_slots);
    debug!("thread_new {thridx:?} (object {thread_object:?})");
    Ok(thridx)
}

/// Reclaims a dead thread's slot and stack storage.
pub fn thread_delete(ctx: &mut JvmContext, thridx: ThreadIndex) {
    let Some(entry) = ctx.threads.entry_mut(thridx) else {
        return;
    };
    let stack = std::mem::replace(&mut entry.stack, Block::null());
    entry.flags = ThreadFlags::empty();
    ctx.gc.stack_delete(thridx, 0);
    ctx.heap.release_stack_area(stack);
    trace!("thread_delete {thridx:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::types::{combine_jlong, split_jlong};

    fn entry_with_stack(slots: usize) -> (Heap, ThreadEntry) {
        let mut heap = Heap::init(1 << 20);
        let stack = heap.acquire_stack_area(slots * 4, true).unwrap();
        (heap, ThreadEntry::with_stack(stack))
    }

    #[test]
    fn push_pop_round_trip() {
        let (_heap, mut te) = entry_with_stack(64);
        for v in [0, 1, -1, i32::MIN, i32::MAX] {
            te.push(v).unwrap();
            assert_eq!(te.pop(), v);
        }
        for v in [0i64, -1, i64::MIN, i64::MAX] {
            te.push_long(v).unwrap();
            assert_eq!(te.pop_long(), v);
        }
    }

    #[test]
    fn long_is_two_slots_ms_first() {
        let (_heap, mut te) = entry_with_stack(64);
        te.push_long(0x1122_3344_5566_7788).unwrap();
        let (hi, lo) = split_jlong(0x1122_3344_5566_7788);
        assert_eq!(te.pop(), lo);
        assert_eq!(te.pop(), hi);
        te.push(hi).unwrap();
        te.push(lo).unwrap();
        assert_eq!(te.pop_long(), combine_jlong(hi, lo));
    }

    #[test]
    fn frame_push_pop_restores_caller() {
        let (_heap, mut te) = entry_with_stack(256);
        let outer = ProgramCounter {
            clsidx: crate::types::ClassIndex::from_raw(3),
            mthidx: MethodIndex(1),
            codeatridx: 0,
            excpatridx: 0,
            offset: 17,
        };
        te.push_frame(4, 8, outer).unwrap();
        te.end_program_fp = 0;
        let outer_fp = te.fp;

        let inner = ProgramCounter {
            clsidx: crate::types::ClassIndex::from_raw(5),
            mthidx: MethodIndex(0),
            codeatridx: 0,
            excpatridx: 0,
            offset: 0,
        };
        te.push(41).unwrap();
        te.push_frame(2, 8, inner).unwrap();
        assert_eq!(te.pc, inner);
        assert!(te.fp > outer_fp);

        let done = te.pop_frame(2);
        assert!(!done, "outer frame is still live");
        assert_eq!(te.pc, outer);
        assert_eq!(te.fp, outer_fp);
        assert_eq!(te.pop(), 41);
    }

    #[test]
    fn fp_stays_at_or_above_initial_allocation() {
        let (_heap, mut te) = entry_with_stack(256);
        te.push_frame(2, 4, ProgramCounter::null()).unwrap();
        assert!(te.fp <= te.sp);
        assert!(te.sp <= te.stack_slots());
        let done = te.pop_frame(2);
        assert!(done, "popping the only frame ends the program");
    }

    #[test]
    fn frame_overflow_is_stack_overflow_error() {
        let (_heap, mut te) = entry_with_stack(32);
        let err = te.push_frame(64, 64, ProgramCounter::null()).unwrap_err();
        assert_eq!(err.class_name.as_ref(), "java/lang/StackOverflowError");
    }

    #[test]
    fn operand_overflow_is_stack_overflow_error() {
        let (_heap, mut te) = entry_with_stack(8);
        for _ in 0..7 {
            te.push(0).unwrap();
        }
        let err = te.push(0).unwrap_err();
        assert_eq!(err.class_name.as_ref(), "java/lang/StackOverflowError");
    }
}
