//! The object table: hash-indexed slot array for object and array
//! instances, superclass chains, instance-field storage and
//! monitor-lock state.

use bitflags::bitflags;
use log::{debug, trace};

use crate::classfile::{self, ClassAccessFlags, MethodAccessFlags};
use crate::gc::GcPolicy;
use crate::heap::Block;
use crate::jvm::JvmContext;
use crate::types::{
    BaseType, ClassIndex, FieldLookupIndex, JValue, ObjectHash, TableIndex, ThreadIndex, Thrown,
};

bitflags! {
    /// Object entry status bitmap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ObjectStatus: u16 {
        const INUSE = 0x0001;
        /// Allocated but not yet fully constructed.
        const NULL = 0x0002;
        const ARRAY = 0x0004;
        /// An inner dimension of a multi-dimensional array; its length
        /// vector aliases a slice of the outermost one, so it does not
        /// free the shared allocation.
        const SUBARRAY = 0x0008;
        const THREAD = 0x0010;
        /// A class meta-object.
        const CLASS = 0x0020;
        const MLOCK = 0x0040;
    }
}

/// One object or array instance.
#[derive(Debug)]
pub struct ObjectEntry {
    pub status: ObjectStatus,
    /// The backing class.
    pub class: ClassIndex,
    /// Access flags of the class, copied at creation.
    pub access_flags: ClassAccessFlags,
    /// For thread-typed objects, the owning thread table slot.
    pub thread: ThreadIndex,
    /// For class meta-objects, the class this object describes.
    pub represented_class: ClassIndex,
    /// Array element type; None for plain objects.
    pub base_type: Option<BaseType>,
    pub dimensions: u8,
    /// Per-dimension lengths as seen from this object.
    pub lengths: Vec<u32>,
    /// Element storage: primitive/reference elements for one
    /// dimension, object hashes of sub-arrays above that.
    pub storage: Block,
    /// The object hash of the parent-class subobject.
    pub superclass: ObjectHash,
    /// Monitor: holding thread, or NULL when unlocked.
    pub mlock_thread: ThreadIndex,
    /// Monitor reentrance count; zero iff unlocked.
    pub mlock_count: u32,
    /// Instance-field slots indexed by field lookup index.
    pub fields: Vec<JValue>,
    /// Private reference marker maintained by the collector.
    pub references: u32,
}

impl ObjectEntry {
    fn empty() -> ObjectEntry {
        ObjectEntry {
            status: ObjectStatus::empty(),
            class: ClassIndex::NULL,
            access_flags: ClassAccessFlags::empty(),
            thread: ThreadIndex::NULL,
            represented_class: ClassIndex::NULL,
            base_type: None,
            dimensions: 0,
            lengths: Vec::new(),
            storage: Block::null(),
            superclass: ObjectHash::NULL,
            mlock_thread: ThreadIndex::NULL,
            mlock_count: 0,
            fields: Vec::new(),
            references: 0,
        }
    }

    pub fn is_array(&self) -> bool {
        self.status.contains(ObjectStatus::ARRAY)
    }
}

/// The instance registry.  Slot 0 is the null object: permanently
/// reserved and untouchable.
#[derive(Debug)]
pub struct ObjectTable {
    entries: Vec<ObjectEntry>,
    capacity: usize,
    last_allocated: usize,
}

impl ObjectTable {
    pub fn init(capacity: usize) -> ObjectTable {
        let mut entries = Vec::with_capacity(16);
        entries.push(ObjectEntry::empty()); // the null object
        ObjectTable {
            entries,
            capacity,
            last_allocated: 0,
        }
    }

    pub fn entry(&self, hash: ObjectHash) -> Option<&ObjectEntry> {
        if hash.is_null() {
            return None;
        }
        let entry = self.entries.get(hash.idx())?;
        entry.status.contains(ObjectStatus::INUSE).then_some(entry)
    }

    pub fn entry_mut(&mut self, hash: ObjectHash) -> Option<&mut ObjectEntry> {
        if hash.is_null() {
            return None;
        }
        let entry = self.entries.get_mut(hash.idx())?;
        entry
            .status
            .contains(ObjectStatus::INUSE)
            .then_some(entry)
    }

    pub fn class_of(&self, hash: ObjectHash) -> Option<ClassIndex> {
        self.entry(hash).map(|e| e.class)
    }

    pub fn iter_in_use(&self) -> impl Iterator<Item = ObjectHash> + '_ {
        self.entries.iter().enumerate().skip(1).filter_map(|(i, e)| {
            e.status
                .contains(ObjectStatus::INUSE)
                .then(|| ObjectHash::from_raw(i as u32))
        })
    }

    pub fn in_use_count(&self) -> usize {
        self.entries
            .iter()
            .skip(1)
            .filter(|e| e.status.contains(ObjectStatus::INUSE))
            .count()
    }

    /// Rotating search for a free slot; None when the table is full.
    fn alloc(&mut self) -> Option<ObjectHash> {
        let len = self.entries.len();
        let start = (self.last_allocated + 1).max(1);
        for i in 0..len.saturating_sub(1) {
            let slot = 1 + (start - 1 + i) % (len - 1);
            if !self.entries[slot].status.contains(ObjectStatus::INUSE) {
                self.entries[slot] = ObjectEntry::empty();
                self.last_allocated = slot;
                return Some(ObjectHash::from_raw(slot as u32));
            }
        }
        if self.entries.len() < self.capacity {
            let slot = self.entries.len();
            self.entries.push(ObjectEntry::empty());
            self.last_allocated = slot;
            return Some(ObjectHash::from_raw(slot as u32));
        }
        None
    }

    /// Array element read with bounds check.
    pub fn array_get(&self, hash: ObjectHash, index: i32) -> Result<JValue, Thrown> {
        let entry = self
            .entry(hash)
            .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
        let length = *entry.lengths.first().unwrap_or(&0);
        if index < 0 || index as u32 >= length {
            return Err(Thrown::exception(
                "java/lang/ArrayIndexOutOfBoundsException",
            ));
        }
        if entry.dimensions > 1 {
            let raw = entry.storage.read_n(index as usize * 4, 4) as u32;
            return Ok(JValue::Reference(ObjectHash::from_raw(raw)));
        }
        let tpe = entry.base_type.unwrap_or(BaseType::Reference);
        let width = tpe.element_size();
        let raw = entry.storage.read_n(index as usize * width, width);
        Ok(decode_element(tpe, raw))
    }

    /// Array element write with bounds check; the value must already
    /// be of the element type.
    pub fn array_set(&mut self, hash: ObjectHash, index: i32, value: JValue) -> Result<(), Thrown> {
        let entry = self
            .entry_mut(hash)
            .ok_or_else(|| Thrown::exception("java/lang/NullPointerException"))?;
        let length = *entry.lengths.first().unwrap_or(&0);
        if index < 0 || index as u32 >= length {
            return Err(Thrown::exception(
                "java/lang/ArrayIndexOutOfBoundsException",
            ));
        }
        let tpe = if entry.dimensions > 1 {
            BaseType::Reference
        } else {
            entry.base_type.unwrap_or(BaseType::Reference)
        };
        let width = tpe.element_size();
        entry
            .storage
            .write_n(index as usize * width, width, encode_element(value));
        Ok(())
    }
}

fn decode_element(tpe: BaseType, raw: u64) -> JValue {
    match tpe {
        BaseType::Boolean => JValue::Boolean(raw != 0),
        BaseType::Byte => JValue::Byte(raw as i8),
        BaseType::Char => JValue::Char(raw as u16),
        BaseType::Short => JValue::Short(raw as i16),
        BaseType::Int => JValue::Int(raw as i32),
        BaseType::Float => JValue::Float(f32::from_bits(raw as u32)),
        BaseType::Long => JValue::Long(raw as i64),
        BaseType::Double => JValue::Double(f64::from_bits(raw)),
        BaseType::Reference => JValue::Reference(ObjectHash::from_raw(raw as u32)),
    }
}

fn encode_element(value: JValue) -> u64 {
    match value {
        JValue::Boolean(v) => v as u64,
        JValue::Byte(v) => v as u8 as u64,
        JValue::Char(v) => v as u64,
        JValue::Short(v) => v as u16 as u64,
        JValue::Int(v) => v as u32 as u64,
        JValue::Float(v) => v.to_bits() as u64,
        JValue::Long(v) => v as u64,
        JValue::Double(v) => v.to_bits(),
        JValue::Reference(h) => h.raw() as u64,
    }
}

/// Special treatment bits for a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    None,
    /// Allocate and link a thread table entry.
    Thread,
    /// A class meta-object describing the given class.
    Class(ClassIndex),
}

/// Parameters of [instance_new].
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub class: ClassIndex,
    pub special: Special,
    /// Array dimension lengths, outermost first; empty for plain
    /// objects.
    pub lengths: Vec<u32>,
    /// Run `<init>()V` on `thread` after construction.
    pub run_init: bool,
    pub thread: ThreadIndex,
}

/// Instantiates an object or array of the backing class.
pub fn instance_new(ctx: &mut JvmContext, req: NewInstance) -> Result<ObjectHash, Thrown> {
    instance_new_inner(ctx, req, false)
}

fn instance_new_inner(
    ctx: &mut JvmContext,
    req: NewInstance,
    sub_array: bool,
) -> Result<ObjectHash, Thrown> {
    let hash = match ctx.objects.alloc() {
        Some(hash) => hash,
        None => {
            // full table: reclaim once and retry before giving up
            ctx.run_gc(false);
            ctx.objects
                .alloc()
                .ok_or_else(|| Thrown::error("java/lang/OutOfMemoryError"))?
        }
    };

    let (access_flags, base_type, is_array, num_lookups, super_class) = {
        let entry = ctx
            .classes
            .entry(req.class)
            .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
        (
            entry.access_flags(),
            entry.base_type,
            entry.is_array(),
            entry.num_instance_lookups,
            entry.super_class,
        )
    };

    {
        let entry = &mut ctx.objects.entries[hash.idx()];
        entry.status = ObjectStatus::INUSE | ObjectStatus::NULL;
        entry.class = req.class;
        entry.access_flags = access_flags;
        if sub_array {
            entry.status |= ObjectStatus::SUBARRAY;
        }
    }

    if is_array && !req.lengths.is_empty() {
        build_array_storage(ctx, hash, &req, base_type)?;
    }

    match req.special {
        Special::None => {}
        Special::Thread => {
            let thridx = crate::thread::thread_new(ctx, hash)?;
            let entry = &mut ctx.objects.entries[hash.idx()];
            entry.status |= ObjectStatus::THREAD;
            entry.thread = thridx;
        }
        Special::Class(clsidx) => {
            let entry = &mut ctx.objects.entries[hash.idx()];
            entry.status |= ObjectStatus::CLASS;
            entry.represented_class = clsidx;
        }
    }

    // instance field slots, zeroed by declared type
    let mut fields = Vec::with_capacity(num_lookups as usize);
    for lookup in 0..num_lookups {
        let tpe = field_lookup_type(ctx, req.class, FieldLookupIndex(lookup));
        fields.push(JValue::zero_of(tpe));
    }
    ctx.objects.entries[hash.idx()].fields = fields;

    // every non-root object carries a superclass sub-object of the
    // same lifetime
    if !super_class.is_null() && !is_array {
        let super_hash = instance_new_inner(
            ctx,
            NewInstance {
                class: super_class,
                special: Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: req.thread,
            },
            false,
        )?;
        ctx.objects.entries[hash.idx()].superclass = super_hash;
        ctx.gc
            .object_mkref_from_object(&mut ctx.objects, hash, super_hash);
    }

    ctx.gc
        .class_mkref_from_object(&mut ctx.classes, hash, req.class);
    ctx.gc.object_new(&mut ctx.objects, hash);

    ctx.objects.entries[hash.idx()].status.remove(ObjectStatus::NULL);
    trace!("instance_new {hash:?} of {:?}", ctx.classes.name_of(req.class));

    if req.run_init {
        run_init(ctx, hash, req.class, req.thread)?;
    }

    Ok(hash)
}

fn run_init(
    ctx: &mut JvmContext,
    hash: ObjectHash,
    clsidx: ClassIndex,
    thridx: ThreadIndex,
) -> Result<(), Thrown> {
    let Some(cf) = ctx.classes.class_file(clsidx) else {
        return Ok(());
    };
    let Some((mthidx, method)) = cf.find_method("<init>", "()V") else {
        return Ok(());
    };
    if method.access_flags.contains(MethodAccessFlags::NATIVE) {
        return Ok(());
    }
    crate::opcode::invoke_now(ctx, thridx, clsidx, mthidx, &[JValue::Reference(hash)]).map(|_| ())
}

fn build_array_storage(
    ctx: &mut JvmContext,
    hash: ObjectHash,
    req: &NewInstance,
    base_type: Option<BaseType>,
) -> Result<(), Thrown> {
    let dimensions = req.lengths.len() as u8;
    let length = req.lengths[0];
    let tpe = base_type.unwrap_or(BaseType::Reference);

    {
        let entry = &mut ctx.objects.entries[hash.idx()];
        entry.status |= ObjectStatus::ARRAY;
        entry.base_type = Some(tpe);
        entry.dimensions = dimensions;
        entry.lengths = req.lengths.clone();
    }

    if dimensions == 1 {
        let storage = ctx.acquire_data(length as usize * tpe.element_size(), true)?;
        ctx.objects.entries[hash.idx()].storage = storage;
        return Ok(());
    }

    // higher dimensions hold the object hashes of their sub-arrays
    let mut storage = ctx.acquire_data(length as usize * 4, true)?;
    for i in 0..length {
        ctx.gc
            .class_mkref_from_class(&mut ctx.classes, req.class, req.class);
        let sub = instance_new_inner(
            ctx,
            NewInstance {
                class: req.class,
                special: Special::None,
                lengths: req.lengths[1..].to_vec(),
                run_init: false,
                thread: req.thread,
            },
            true,
        )?;
        storage.write_n(i as usize * 4, 4, sub.raw() as u64);
        ctx.gc.object_mkref_from_object(&mut ctx.objects, hash, sub);
    }
    ctx.objects.entries[hash.idx()].storage = storage;
    Ok(())
}

fn field_lookup_type(ctx: &JvmContext, clsidx: ClassIndex, lookup: FieldLookupIndex) -> BaseType {
    let Some((def_cls, fldidx)) = ctx.classes.field_at_lookup(clsidx, lookup) else {
        return BaseType::Int;
    };
    let Some(cf) = ctx.classes.entry(def_cls).and_then(|e| e.class_file.as_ref()) else {
        return BaseType::Int;
    };
    cf.fields
        .get(fldidx.idx())
        .and_then(|f| cf.field_descriptor(f))
        .and_then(|d| classfile::field_type(d).ok())
        .unwrap_or(BaseType::Int)
}

/// Runs `finalize()V` on the requested thread before deletion, when
/// the class declares one.
pub fn instance_finalize(
    ctx: &mut JvmContext,
    hash: ObjectHash,
    thridx: ThreadIndex,
) -> Result<(), Thrown> {
    let Some(clsidx) = ctx.objects.class_of(hash) else {
        return Ok(());
    };
    let Some((def_cls, mthidx)) = ctx.classes.find_method(clsidx, "finalize", "()V") else {
        return Ok(());
    };
    let is_native = ctx
        .classes
        .class_file(def_cls)
        .and_then(|cf| {
            cf.methods
                .get(mthidx as usize)
                .map(|m| m.access_flags.contains(MethodAccessFlags::NATIVE))
        })
        .unwrap_or(true);
    if is_native {
        return Ok(());
    }
    crate::opcode::invoke_now(ctx, thridx, def_cls, mthidx, &[JValue::Reference(hash)]).map(|_| ())
}

/// Destroys an instance: the reverse of [instance_new].
///
/// Owned sub-objects (the superclass chain and array sub-arrays) go
/// with their owner, so a create/delete pair leaves the table in its
/// pre-call state.
pub fn instance_delete(ctx: &mut JvmContext, hash: ObjectHash) {
    let Some(entry) = ctx.objects.entry(hash) else {
        return;
    };
    let class = entry.class;
    let superclass = entry.superclass;
    let is_multi_dim = entry.dimensions > 1;
    let sub_count = if is_multi_dim {
        *entry.lengths.first().unwrap_or(&0)
    } else {
        0
    };
    let field_refs: Vec<ObjectHash> = entry
        .fields
        .iter()
        .filter_map(|v| match v {
            JValue::Reference(h) if !h.is_null() => Some(*h),
            _ => None,
        })
        .collect();

    // reference-typed instance fields drop their targets
    for (lookup, target) in field_refs.iter().enumerate() {
        ctx.gc
            .object_field_rmref(&mut ctx.objects, hash, FieldLookupIndex(lookup as u16));
        ctx.gc
            .object_rmref_from_object(&mut ctx.objects, hash, *target);
    }

    // a held monitor does not outlive its object
    {
        let entry = &mut ctx.objects.entries[hash.idx()];
        entry.mlock_thread = ThreadIndex::NULL;
        entry.mlock_count = 0;
        entry.status.remove(ObjectStatus::MLOCK);
    }

    if is_multi_dim {
        for i in 0..sub_count {
            let raw = ctx.objects.entries[hash.idx()].storage.read_n(i as usize * 4, 4) as u32;
            let sub = ObjectHash::from_raw(raw);
            if !sub.is_null() {
                ctx.gc.class_rmref_from_class(&mut ctx.classes, class, class);
                ctx.gc.object_rmref_from_object(&mut ctx.objects, hash, sub);
                instance_delete(ctx, sub);
            }
        }
    }

    if !superclass.is_null() {
        ctx.gc
            .object_rmref_from_object(&mut ctx.objects, hash, superclass);
        instance_delete(ctx, superclass);
    }

    ctx.gc.class_rmref_from_object(&mut ctx.classes, hash, class);
    ctx.gc.object_delete(&mut ctx.objects, hash);

    let entry = &mut ctx.objects.entries[hash.idx()];
    let storage = std::mem::replace(&mut entry.storage, Block::null());
    entry.status = ObjectStatus::empty();
    entry.fields = Vec::new();
    entry.lengths = Vec::new();
    ctx.heap.release_data_area(storage);
    debug!("instance_delete {hash:?}");
}
