//! The garbage collection interface.
//!
//! A set of hooks invoked on every reference-creating or
//! reference-destroying event in the class and object tables.  The
//! core never assumes a particular policy; it is required to call
//! these hooks at the prescribed points, and any mutation of a
//! reference-bearing field is bracketed by rmref(old) / mkref(new).

use log::{debug, trace};

use crate::class::ClassTable;
use crate::jvm::JvmContext;
use crate::object::{ObjectStatus, ObjectTable};
use crate::types::{ClassIndex, FieldLookupIndex, ObjectHash, ThreadIndex};

/// A collection policy.  Implementations range from the no-op
/// [StubCollector] to reference counting; a tracing collector fits the
/// same surface.
///
/// Hooks return false when the indices passed make no sense, which
/// callers may ignore: a broken reference graph is the collector's
/// problem to survive, not the mutator's.
#[allow(unused_variables)]
pub trait GcPolicy {
    fn init(&mut self) {}

    /// Runs one collection cycle.  With `remove_refs`, reclaimed
    /// objects also drop the references their fields carry.
    fn run(&mut self, ctx: &mut JvmContext, remove_refs: bool) {}

    fn class_new(&mut self, classes: &mut ClassTable, cls: ClassIndex) -> bool {
        true
    }

    fn class_reload(&mut self, classes: &mut ClassTable, old: ClassIndex, new: ClassIndex) -> bool {
        true
    }

    fn class_delete(&mut self, classes: &mut ClassTable, cls: ClassIndex, delete_class: bool) -> bool {
        true
    }

    fn class_mkref_from_class(&mut self, classes: &mut ClassTable, from: ClassIndex, to: ClassIndex) -> bool {
        true
    }

    fn class_mkref_from_object(&mut self, classes: &mut ClassTable, from: ObjectHash, to: ClassIndex) -> bool {
        true
    }

    fn class_rmref_from_class(&mut self, classes: &mut ClassTable, from: ClassIndex, to: ClassIndex) -> bool {
        true
    }

    fn class_rmref_from_object(&mut self, classes: &mut ClassTable, from: ObjectHash, to: ClassIndex) -> bool {
        true
    }

    fn class_field_mkref(&mut self, classes: &mut ClassTable, cls: ClassIndex, field: FieldLookupIndex) -> bool {
        true
    }

    fn class_field_rmref(&mut self, classes: &mut ClassTable, cls: ClassIndex, field: FieldLookupIndex) -> bool {
        true
    }

    fn object_new(&mut self, objects: &mut ObjectTable, obj: ObjectHash) -> bool {
        true
    }

    fn object_delete(&mut self, objects: &mut ObjectTable, obj: ObjectHash) -> bool {
        true
    }

    fn object_mkref_from_class(&mut self, objects: &mut ObjectTable, from: ClassIndex, to: ObjectHash) -> bool {
        true
    }

    fn object_mkref_from_object(&mut self, objects: &mut ObjectTable, from: ObjectHash, to: ObjectHash) -> bool {
        true
    }

    fn object_rmref_from_class(&mut self, objects: &mut ObjectTable, from: ClassIndex, to: ObjectHash) -> bool {
        true
    }

    fn object_rmref_from_object(&mut self, objects: &mut ObjectTable, from: ObjectHash, to: ObjectHash) -> bool {
        true
    }

    fn object_field_mkref(&mut self, objects: &mut ObjectTable, obj: ObjectHash, field: FieldLookupIndex) -> bool {
        true
    }

    fn object_field_rmref(&mut self, objects: &mut ObjectTable, obj: ObjectHash, field: FieldLookupIndex) -> bool {
        true
    }

    fn stack_new(&mut self, thread: ThreadIndex, num_locals: usize) {}

    fn stack_mkref_from_jvm(&mut self, thread: ThreadIndex, frame: usize) {}

    fn stack_rmref_from_jvm(&mut self, thread: ThreadIndex, frame: usize) {}

    fn stack_delete(&mut self, thread: ThreadIndex, out_frames: usize) {}
}

/// The policy pending a real collection design: every hook accepts and
/// forgets.
#[derive(Debug, Default)]
pub struct StubCollector;

impl GcPolicy for StubCollector {
    fn run(&mut self, _ctx: &mut JvmContext, remove_refs: bool) {
        trace!("stub collector run (remove_refs: {remove_refs}), nothing to do");
    }
}

/// Reference counting against the per-entry counters.
///
/// Creation leaves an object at zero references, so a mkref/rmref pair
/// is observable as no net change and an ephemeral instance (made
/// visible then immediately unmarked) is reclaimable on the next run.
/// Thread objects, class meta-objects and sub-arrays are owned by the
/// machine and never reclaimed here.
#[derive(Debug, Default)]
pub struct CountingCollector {
    runs: u64,
}

impl CountingCollector {
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

fn bump_class(classes: &mut ClassTable, cls: ClassIndex, delta: i64) -> bool {
    match classes.entry_mut(cls) {
        Some(entry) => {
            entry.references = (entry.references as i64 + delta).max(0) as u32;
            true
        }
        None => false,
    }
}

fn bump_object(objects: &mut ObjectTable, obj: ObjectHash, delta: i64) -> bool {
    match objects.entry_mut(obj) {
        Some(entry) => {
            entry.references = (entry.references as i64 + delta).max(0) as u32;
            true
        }
        None => false,
    }
}

impl GcPolicy for CountingCollector {
    fn run(&mut self, ctx: &mut JvmContext, remove_refs: bool) {
        self.runs += 1;
        let dead: Vec<ObjectHash> = ctx
            .objects
            .iter_in_use()
            .filter(|&hash| {
                ctx.objects.entry(hash).is_some_and(|e| {
                    e.references == 0
                        && !e.status.intersects(
                            ObjectStatus::THREAD
                                | ObjectStatus::CLASS
                                | ObjectStatus::SUBARRAY
                                | ObjectStatus::NULL,
                        )
                })
            })
            .collect();
        debug!("counting collector run {}: {} reclaimable", self.runs, dead.len());
        if remove_refs {
            let finalizer_thread = ctx.current_thread;
            for hash in dead {
                if let Err(thrown) =
                    crate::object::instance_finalize(ctx, hash, finalizer_thread)
                {
                    debug!("finalize of {hash:?} threw {}", thrown.class_name);
                }
                crate::object::instance_delete(ctx, hash);
            }

            // a class is unloadable at reference count zero with no
            // live instances; unload re-checks before touching anything
            let unloadable: Vec<_> = ctx
                .classes
                .iter_in_use()
                .filter(|&cls| {
                    ctx.classes
                        .entry(cls)
                        .is_some_and(|e| e.references == 0 && !e.is_primitive())
                        && !ctx
                            .objects
                            .iter_in_use()
                            .any(|h| ctx.objects.class_of(h) == Some(cls))
                })
                .collect();
            for cls in unloadable {
                crate::class::unload(ctx, cls);
            }
        }
    }

    fn class_mkref_from_class(&mut self, classes: &mut ClassTable, _from: ClassIndex, to: ClassIndex) -> bool {
        bump_class(classes, to, 1)
    }

    fn class_mkref_from_object(&mut self, classes: &mut ClassTable, _from: ObjectHash, to: ClassIndex) -> bool {
        bump_class(classes, to, 1)
    }

    fn class_rmref_from_class(&mut self, classes: &mut ClassTable, _from: ClassIndex, to: ClassIndex) -> bool {
        bump_class(classes, to, -1)
    }

    fn class_rmref_from_object(&mut self, classes: &mut ClassTable, _from: ObjectHash, to: ClassIndex) -> bool {
        bump_class(classes, to, -1)
    }

    fn object_mkref_from_class(&mut self, objects: &mut ObjectTable, _from: ClassIndex, to: ObjectHash) -> bool {
        bump_object(objects, to, 1)
    }

    fn object_mkref_from_object(&mut self, objects: &mut ObjectTable, _from: ObjectHash, to: ObjectHash) -> bool {
        bump_object(objects, to, 1)
    }

    fn object_rmref_from_class(&mut self, objects: &mut ObjectTable, _from: ClassIndex, to: ObjectHash) -> bool {
        bump_object(objects, to, -1)
    }

    fn object_rmref_from_object(&mut self, objects: &mut ObjectTable, _from: ObjectHash, to: ObjectHash) -> bool {
        bump_object(objects, to, -1)
    }
}
