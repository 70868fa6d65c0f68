//! The class table: registry of loaded classes, name resolution,
//! primitive pseudo-classes, array class synthesis and static-field
//! storage.

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::classfile::{self, Attribute, ClassFile, CpEntry, FieldAccessFlags, MethodAccessFlags};
use crate::gc::GcPolicy;
use crate::jvm::JvmContext;
use crate::linkage::{self, LocalBinding};
use crate::object::{self, NewInstance};
use crate::types::{
    BaseType, ClassIndex, FieldIndex, FieldLookupIndex, JValue, ObjectHash, TableIndex,
    ThreadIndex, Thrown,
};

/// Superclass chains longer than this indicate table corruption.
pub const MAX_SUPERCLASS_DEPTH: usize = 256;

/// The eight primitive pseudo-classes, synthesized with no backing
/// class file so the class-meta machinery can describe a primitive's
/// class object.
pub const PRIMITIVE_NAMES: [(&str, BaseType, u8); 8] = [
    ("byte", BaseType::Byte, b'B'),
    ("char", BaseType::Char, b'C'),
    ("double", BaseType::Double, b'D'),
    ("float", BaseType::Float, b'F'),
    ("int", BaseType::Int, b'I'),
    ("long", BaseType::Long, b'J'),
    ("short", BaseType::Short, b'S'),
    ("boolean", BaseType::Boolean, b'Z'),
];

bitflags! {
    /// Class entry status bitmap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ClassStatus: u16 {
        const INUSE = 0x0001;
        /// Allocated but not yet populated.
        const NULL = 0x0002;
        const LOADED = 0x0004;
        /// Constant pool bindings resolved.
        const LINKED = 0x0008;
        const INITIALIZED = 0x0010;
        /// `<clinit>` is on a thread's stack right now.
        const INITIALIZING = 0x0020;
        const ARRAY = 0x0040;
        const PRIMITIVE = 0x0080;
        const INTERFACE = 0x0100;
    }
}

/// One loaded class.
#[derive(Debug)]
pub struct ClassEntry {
    pub status: ClassStatus,
    /// Internal-form name, array descriptor, or primitive name.
    pub name: Rc<str>,
    /// The owning class file image; None for primitives and
    /// primitive-element arrays.
    pub class_file: Option<Rc<ClassFile>>,
    /// Element type for arrays, own type for primitives.
    pub base_type: Option<BaseType>,
    /// Array dimension count implied by the name (`[[I` is 2); zero
    /// for non-arrays.
    pub dimensions: u8,
    /// Resolved superclass; NULL for the root class and primitives.
    pub super_class: ClassIndex,
    pub interfaces: Vec<ClassIndex>,
    /// The class's meta-object in the object table.
    pub class_object: ObjectHash,
    /// Static field slots, indexed by class-local static lookup index.
    pub statics: Vec<JValue>,
    /// Static lookup index to `fields[]` slot.
    pub static_lookup: Vec<FieldIndex>,
    /// This class's own instance fields; dense lookup index =
    /// inherited count + position here.
    pub instance_lookup: Vec<FieldIndex>,
    /// Instance-field lookups inherited by objects of this class,
    /// including all superclasses.
    pub num_instance_lookups: u16,
    /// Local bindings, parallel to the constant pool.  Monotonic: once
    /// set to a valid index they are not rewritten.
    pub bindings: Vec<LocalBinding>,
    /// Count of in-flight references, maintained by the collector.
    pub references: u32,
}

impl ClassEntry {
    fn empty(name: Rc<str>) -> ClassEntry {
        ClassEntry {
            status: ClassStatus::INUSE | ClassStatus::NULL,
            name,
            class_file: None,
            base_type: None,
            dimensions: 0,
            super_class: ClassIndex::NULL,
            interfaces: Vec::new(),
            class_object: ObjectHash::NULL,
            statics: Vec::new(),
            static_lookup: Vec::new(),
            instance_lookup: Vec::new(),
            num_instance_lookups: 0,
            bindings: Vec::new(),
            references: 0,
        }
    }

    pub fn is_array(&self) -> bool {
        self.status.contains(ClassStatus::ARRAY)
    }

    pub fn is_primitive(&self) -> bool {
        self.status.contains(ClassStatus::PRIMITIVE)
    }

    pub fn is_interface(&self) -> bool {
        self.status.contains(ClassStatus::INTERFACE)
    }

    /// Access flags of the backing class file, or empty for synthetic
    /// entries.
    pub fn access_flags(&self) -> classfile::ClassAccessFlags {
        self.class_file
            .as_ref()
            .map(|cf| cf.access_flags)
            .unwrap_or(classfile::ClassAccessFlags::empty())
    }
}

/// Registry of loaded classes.  Slot 0 is the permanently reserved
/// null entry.
#[derive(Debug)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
    by_name: HashMap<Rc<str>, ClassIndex>,
    last_allocated: usize,
}

impl ClassTable {
    pub fn init() -> ClassTable {
        ClassTable {
            entries: vec![ClassEntry::empty("".into())],
            by_name: HashMap::new(),
            last_allocated: 0,
        }
    }

    pub fn entry(&self, clsidx: ClassIndex) -> Option<&ClassEntry> {
        let entry = self.entries.get(clsidx.idx())?;
        if clsidx.is_null() || !entry.status.contains(ClassStatus::INUSE) {
            return None;
        }
        Some(entry)
    }

    pub fn entry_mut(&mut self, clsidx: ClassIndex) -> Option<&mut ClassEntry> {
        let entry = self.entries.get_mut(clsidx.idx())?;
        if clsidx.is_null() || !entry.status.contains(ClassStatus::INUSE) {
            return None;
        }
        Some(entry)
    }

    pub fn by_name(&self, name: &str) -> Option<ClassIndex> {
        self.by_name.get(name).copied()
    }

    /// The class file image of an in-use entry.
    pub fn class_file(&self, clsidx: ClassIndex) -> Option<Rc<ClassFile>> {
        self.entry(clsidx)?.class_file.clone()
    }

    pub fn name_of(&self, clsidx: ClassIndex) -> Option<Rc<str>> {
        self.entry(clsidx).map(|e| e.name.clone())
    }

    /// In-use indices, for table sweeps.
    pub fn iter_in_use(&self) -> impl Iterator<Item = ClassIndex> + '_ {
        self.entries.iter().enumerate().skip(1).filter_map(|(i, e)| {
            e.status
                .contains(ClassStatus::INUSE)
                .then(|| ClassIndex::from_raw(i as u16))
        })
    }

    /// Allocates an empty slot by rotating search, extending the table
    /// when no free slot exists.
    fn alloc(&mut self, name: Rc<str>) -> ClassIndex {
        let len = self.entries.len();
        let start = (self.last_allocated + 1).max(1);
        for i in 0..len.saturating_sub(1) {
            let slot = 1 + (start - 1 + i) % (len - 1);
            if !self.entries[slot].status.contains(ClassStatus::INUSE) {
                self.entries[slot] = ClassEntry::empty(name.clone());
                self.by_name.insert(name, ClassIndex::from_raw(slot as u16));
                self.last_allocated = slot;
                return ClassIndex::from_raw(slot as u16);
            }
        }
        let slot = self.entries.len();
        self.entries.push(ClassEntry::empty(name.clone()));
        self.by_name.insert(name, ClassIndex::from_raw(slot as u16));
        self.last_allocated = slot;
        ClassIndex::from_raw(slot as u16)
    }

    /// Walks the superclass chain from `clsidx` to the root,
    /// returning each class index in order, `clsidx` first.
    ///
    /// Chains longer than [MAX_SUPERCLASS_DEPTH] indicate corruption
    /// and truncate with a warning.
    pub fn superclass_chain(&self, clsidx: ClassIndex) -> Vec<ClassIndex> {
        let mut chain = Vec::new();
        let mut cursor = clsidx;
        while !cursor.is_null() {
            chain.push(cursor);
            if chain.len() > MAX_SUPERCLASS_DEPTH {
                warn!("superclass chain of {clsidx:?} exceeds {MAX_SUPERCLASS_DEPTH}");
                break;
            }
            cursor = match self.entry(cursor) {
                Some(e) => e.super_class,
                None => break,
            };
        }
        chain
    }

    /// True when `from` is assignment compatible with `to`: the same
    /// class, a subclass, or an implementor of `to`.
    pub fn is_assignable(&self, from: ClassIndex, to: ClassIndex) -> bool {
        for cls in self.superclass_chain(from) {
            if cls == to {
                return true;
            }
            if let Some(entry) = self.entry(cls) {
                if self.interface_chain_contains(&entry.interfaces, to, 0) {
                    return true;
                }
            }
        }
        false
    }

    fn interface_chain_contains(&self, interfaces: &[ClassIndex], to: ClassIndex, depth: usize) -> bool {
        if depth > MAX_SUPERCLASS_DEPTH {
            return false;
        }
        for &iface in interfaces {
            if iface == to {
                return true;
            }
            if let Some(entry) = self.entry(iface) {
                if self.interface_chain_contains(&entry.interfaces, to, depth + 1) {
                    return true;
                }
            }
        }
        false
    }

    /// Maps a dense instance-field lookup index on an object of
    /// `clsidx` to the defining class and its `fields[]` slot.
    pub fn field_at_lookup(
        &self,
        clsidx: ClassIndex,
        lookup: FieldLookupIndex,
    ) -> Option<(ClassIndex, FieldIndex)> {
        let mut cursor = clsidx;
        for _ in 0..MAX_SUPERCLASS_DEPTH {
            let entry = self.entry(cursor)?;
            let own_base = entry.num_instance_lookups as usize - entry.instance_lookup.len();
            if lookup.idx() >= own_base {
                return Some((cursor, *entry.instance_lookup.get(lookup.idx() - own_base)?));
            }
            cursor = entry.super_class;
        }
        None
    }

    /// Finds a method by name and descriptor starting at `clsidx` and
    /// walking the superclass chain (dynamic dispatch order).
    pub fn find_method(
        &self,
        clsidx: ClassIndex,
        name: &str,
        descriptor: &str,
    ) -> Option<(ClassIndex, u16)> {
        for cls in self.superclass_chain(clsidx) {
            if let Some(cf) = self.entry(cls).and_then(|e| e.class_file.as_ref()) {
                if let Some((mthidx, _)) = cf.find_method(name, descriptor) {
                    return Some((cls, mthidx));
                }
            }
        }
        None
    }
}

/// Synthesizes the eight primitive pseudo-classes.  Called once at
/// boot, before anything else touches the table.
pub fn define_primitives(ctx: &mut JvmContext) {
    for (name, tpe, _) in PRIMITIVE_NAMES {
        let clsidx = ctx.classes.alloc(name.into());
        let entry = &mut ctx.classes.entries[clsidx.idx()];
        entry.status = ClassStatus::INUSE | ClassStatus::LOADED | ClassStatus::LINKED
            | ClassStatus::INITIALIZED
            | ClassStatus::PRIMITIVE;
        entry.base_type = Some(tpe);
        ctx.gc.class_new(&mut ctx.classes, clsidx);
        trace!("primitive pseudo-class {name} at {clsidx:?}");
    }
}

/// Loads a class by its internal UTF-8 name, triggering superclass and
/// interface loads recursively.
///
/// Returns the existing index when the class is already in the table.
pub fn load(ctx: &mut JvmContext, name: &str, thridx: ThreadIndex) -> Result<ClassIndex, Thrown> {
    let mut in_progress = Vec::new();
    load_inner(ctx, name, thridx, &mut in_progress)
}

fn load_inner(
    ctx: &mut JvmContext,
    name: &str,
    thridx: ThreadIndex,
    in_progress: &mut Vec<Rc<str>>,
) -> Result<ClassIndex, Thrown> {
    if let Some(clsidx) = ctx.classes.by_name(name) {
        // an allocated but unloaded entry on the in-progress walk is a
        // superclass cycle closing on itself
        let loaded = ctx
            .classes
            .entry(clsidx)
            .is_some_and(|e| e.status.contains(ClassStatus::LOADED));
        if !loaded && in_progress.iter().any(|n| n.as_ref() == name) {
            return Err(Thrown::error("java/lang/ClassCircularityError"));
        }
        return Ok(clsidx);
    }

    if let Some(stripped) = name.strip_prefix('[') {
        return load_array_class(ctx, name, stripped, thridx, in_progress);
    }

    let class_file = match ctx.classpath.find(name) {
        Some(bytes) => match classfile::parse::parse(&bytes) {
            Ok(cf) => cf,
            Err(classfile::parse::ClassParseError::UnsupportedVersion { major, minor }) => {
                debug!("{name}: unsupported class file version {major}.{minor}");
                return Err(Thrown::error("java/lang/UnsupportedClassVersionError"));
            }
            Err(e) => {
                debug!("{name}: malformed class file: {e}");
                return Err(Thrown::error("java/lang/ClassFormatError"));
            }
        },
        None => match crate::bootstrap::synthesize(name) {
            Some(cf) => cf,
            None => {
                debug!("{name}: not found on the classpath");
                return Err(Thrown::error("java/lang/NoClassDefFoundError"));
            }
        },
    };

    // the file must define the name we asked for
    if class_file.this_class_name().map(Rc::as_ref) != Some(name) {
        return Err(Thrown::error("java/lang/NoClassDefFoundError"));
    }

    define(ctx, Rc::new(class_file), thridx, in_progress)
}

/// Enters a parsed class file image into the table, recursively
/// loading its superclass and interfaces, and marks it loaded.
///
/// This is also the entry point for classes defined directly from
/// memory (the bootstrap library, test fixtures).
pub fn define(
    ctx: &mut JvmContext,
    class_file: Rc<ClassFile>,
    thridx: ThreadIndex,
    in_progress: &mut Vec<Rc<str>>,
) -> Result<ClassIndex, Thrown> {
    let name = class_file
        .this_class_name()
        .cloned()
        .ok_or_else(|| Thrown::error("java/lang/ClassFormatError"))?;

    if let Some(existing) = ctx.classes.by_name(&name) {
        return Ok(existing);
    }

    let super_name = class_file.super_class_name().cloned();
    let interface_names: Vec<Rc<str>> = class_file
        .interfaces
        .iter()
        .filter_map(|&i| class_file.class_name_at(i).cloned())
        .collect();

    let clsidx = ctx.classes.alloc(name.clone());
    debug!("defining class {name} at {clsidx:?}");

    in_progress.push(name.clone());
    let super_class = match &super_name {
        Some(s) => load_inner(ctx, s, thridx, in_progress)?,
        None => ClassIndex::NULL,
    };
    let mut interfaces = Vec::with_capacity(interface_names.len());
    for iface in &interface_names {
        interfaces.push(load_inner(ctx, iface, thridx, in_progress)?);
    }
    in_progress.pop();

    let inherited = match ctx.classes.entry(super_class) {
        Some(e) => e.num_instance_lookups,
        None => 0,
    };

    // build the field lookup tables: statics get value slots right
    // away, instance lookups stack on top of the inherited ones
    let mut statics = Vec::new();
    let mut static_lookup = Vec::new();
    let mut instance_lookup = Vec::new();
    for (i, field) in class_file.fields.iter().enumerate() {
        let descriptor = class_file
            .field_descriptor(field)
            .ok_or_else(|| Thrown::error("java/lang/ClassFormatError"))?;
        let tpe = classfile::field_type(descriptor)
            .map_err(|_| Thrown::error("java/lang/ClassFormatError"))?;
        if field.access_flags.contains(FieldAccessFlags::STATIC) {
            static_lookup.push(FieldIndex(i as u16));
            statics.push(initial_static_value(&class_file, field, tpe));
        } else {
            instance_lookup.push(FieldIndex(i as u16));
        }
    }

    let num_instance_lookups = inherited + instance_lookup.len() as u16;
    let bindings = vec![LocalBinding::default(); class_file.constant_pool.len()];

    let is_interface = class_file
        .access_flags
        .contains(classfile::ClassAccessFlags::INTERFACE);

    let entry = &mut ctx.classes.entries[clsidx.idx()];
    entry.class_file = Some(class_file);
    entry.super_class = super_class;
    entry.interfaces = interfaces;
    entry.statics = statics;
    entry.static_lookup = static_lookup;
    entry.instance_lookup = instance_lookup;
    entry.num_instance_lookups = num_instance_lookups;
    entry.bindings = bindings;
    entry.status = ClassStatus::INUSE | ClassStatus::LOADED;
    if is_interface {
        entry.status |= ClassStatus::INTERFACE;
    }

    ctx.gc.class_new(&mut ctx.classes, clsidx);
    if !super_class.is_null() {
        ctx.gc
            .class_mkref_from_class(&mut ctx.classes, clsidx, super_class);
    }

    make_meta_object(ctx, clsidx, thridx)?;
    Ok(clsidx)
}

/// Array classes are created on demand for any `[Type` descriptor;
/// they share the element class's metadata but carry the array status
/// bit and a base type.
fn load_array_class(
    ctx: &mut JvmContext,
    name: &str,
    stripped: &str,
    thridx: ThreadIndex,
    in_progress: &mut Vec<Rc<str>>,
) -> Result<ClassIndex, Thrown> {
    let mut dimensions = 1u8;
    let mut element = stripped;
    while let Some(rest) = element.strip_prefix('[') {
        dimensions += 1;
        element = rest;
    }

    let (base_type, class_file) = match element.as_bytes().first() {
        Some(b'L') => {
            let element_name = element
                .strip_prefix('L')
                .and_then(|e| e.strip_suffix(';'))
                .ok_or_else(|| Thrown::error("java/lang/NoClassDefFoundError"))?;
            let element_cls = load_inner(ctx, element_name, thridx, in_progress)?;
            (BaseType::Reference, ctx.classes.class_file(element_cls))
        }
        Some(&ch) => (
            BaseType::from_descriptor_char(ch)
                .ok_or_else(|| Thrown::error("java/lang/NoClassDefFoundError"))?,
            None,
        ),
        None => return Err(Thrown::error("java/lang/NoClassDefFoundError")),
    };

    let root = load_inner(ctx, crate::bootstrap::ROOT_CLASS, thridx, in_progress)?;

    let clsidx = ctx.classes.alloc(name.into());
    let entry = &mut ctx.classes.entries[clsidx.idx()];
    entry.status = ClassStatus::INUSE | ClassStatus::LOADED | ClassStatus::LINKED
        | ClassStatus::INITIALIZED
        | ClassStatus::ARRAY;
    entry.class_file = class_file;
    entry.base_type = Some(base_type);
    entry.dimensions = dimensions;
    entry.super_class = root;

    ctx.gc.class_new(&mut ctx.classes, clsidx);
    ctx.gc.class_mkref_from_class(&mut ctx.classes, clsidx, root);

    make_meta_object(ctx, clsidx, thridx)?;
    trace!("array class {name} at {clsidx:?}, {dimensions} dimension(s)");
    Ok(clsidx)
}

/// Creates the class's meta-object once `java/lang/Class` itself is
/// available; early boot entries are materialized later.
fn make_meta_object(
    ctx: &mut JvmContext,
    clsidx: ClassIndex,
    thridx: ThreadIndex,
) -> Result<(), Thrown> {
    let Some(meta_cls) = ctx.classes.by_name(crate::bootstrap::CLASS_META_CLASS) else {
        return Ok(());
    };
    if ctx
        .classes
        .entry(clsidx)
        .is_some_and(|e| !e.class_object.is_null())
    {
        return Ok(());
    }
    let hash = object::instance_new(
        ctx,
        NewInstance {
            class: meta_cls,
            special: object::Special::Class(clsidx),
            lengths: Vec::new(),
            run_init: false,
            thread: thridx,
        },
    )?;
    if let Some(entry) = ctx.classes.entry_mut(clsidx) {
        entry.class_object = hash;
    }
    Ok(())
}

/// Gives meta-objects to entries created before `java/lang/Class` was
/// loaded.  Called once by the boot sequence.
pub fn materialize_meta_objects(ctx: &mut JvmContext, thridx: ThreadIndex) -> Result<(), Thrown> {
    let missing: Vec<ClassIndex> = ctx
        .classes
        .iter_in_use()
        .filter(|&c| {
            ctx.classes
                .entry(c)
                .is_some_and(|e| e.class_object.is_null())
        })
        .collect();
    for clsidx in missing {
        make_meta_object(ctx, clsidx, thridx)?;
    }
    Ok(())
}

/// Runs `<clinit>` once, after all superclasses' `<clinit>` have run,
/// and marks the class initialized.
pub fn clinit(ctx: &mut JvmContext, clsidx: ClassIndex, thridx: ThreadIndex) -> Result<(), Thrown> {
    let Some(entry) = ctx.classes.entry(clsidx) else {
        return Ok(());
    };
    if entry
        .status
        .intersects(ClassStatus::INITIALIZED | ClassStatus::INITIALIZING)
    {
        return Ok(());
    }
    let super_class = entry.super_class;
    let class_file = entry.class_file.clone();

    if let Some(e) = ctx.classes.entry_mut(clsidx) {
        e.status |= ClassStatus::INITIALIZING;
    }

    if !super_class.is_null() {
        clinit(ctx, super_class, thridx)?;
    }

    if let Some(cf) = class_file {
        if let Some((mthidx, method)) = cf.find_method("<clinit>", "()V") {
            if !method.access_flags.contains(MethodAccessFlags::NATIVE) {
                debug!("running <clinit> of {:?}", ctx.classes.name_of(clsidx));
                let result = crate::opcode::invoke_now(ctx, thridx, clsidx, mthidx, &[]);
                if let Err(thrown) = result {
                    if let Some(e) = ctx.classes.entry_mut(clsidx) {
                        e.status.remove(ClassStatus::INITIALIZING);
                    }
                    warn!(
                        "<clinit> of {:?} threw {}",
                        ctx.classes.name_of(clsidx),
                        thrown.class_name
                    );
                    return Err(Thrown::error("java/lang/ExceptionInInitializerError"));
                }
            }
        }
    }

    if let Some(e) = ctx.classes.entry_mut(clsidx) {
        e.status.remove(ClassStatus::INITIALIZING);
        e.status |= ClassStatus::INITIALIZED;
    }
    Ok(())
}

/// Loads, resolves and initializes a class: the full path a symbolic
/// reference takes on first use.
pub fn load_resolve_init(
    ctx: &mut JvmContext,
    name: &str,
    thridx: ThreadIndex,
) -> Result<ClassIndex, Thrown> {
    let clsidx = load(ctx, name, thridx)?;
    linkage::resolve(ctx, clsidx, thridx)?;
    clinit(ctx, clsidx, thridx)?;
    Ok(clsidx)
}

/// Static field initial value: the ConstantValue attribute when
/// present, the type's zero otherwise.
fn initial_static_value(
    class_file: &ClassFile,
    field: &classfile::FieldInfo,
    tpe: BaseType,
) -> JValue {
    for attr in &field.attributes {
        if let Attribute::ConstantValue(index) = attr {
            match class_file.pool(*index) {
                Some(CpEntry::Integer(v)) => {
                    return match tpe {
                        BaseType::Boolean => JValue::Boolean(*v != 0),
                        BaseType::Byte => JValue::Byte(*v as i8),
                        BaseType::Char => JValue::Char(*v as u16),
                        BaseType::Short => JValue::Short(*v as i16),
                        _ => JValue::Int(*v),
                    }
                }
                Some(CpEntry::Float(v)) => return JValue::Float(*v),
                Some(CpEntry::Long(v)) => return JValue::Long(*v),
                Some(CpEntry::Double(v)) => return JValue::Double(*v),
                // string constants intern lazily on first getstatic
                _ => break,
            }
        }
    }
    JValue::zero_of(tpe)
}

/// Unloads a class whose reference count has reached zero.  Classes
/// with live instances or subclasses keep their entry.
pub fn unload(ctx: &mut JvmContext, clsidx: ClassIndex) {
    let Some(entry) = ctx.classes.entry(clsidx) else {
        return;
    };
    if entry.references > 0 {
        return;
    }
    let name = entry.name.clone();
    let super_class = entry.super_class;

    linkage::unresolve(ctx, clsidx);
    ctx.gc.class_delete(&mut ctx.classes, clsidx, true);
    if !super_class.is_null() {
        ctx.gc
            .class_rmref_from_class(&mut ctx.classes, clsidx, super_class);
    }

    let entry = &mut ctx.classes.entries[clsidx.idx()];
    entry.status = ClassStatus::empty();
    entry.class_file = None;
    entry.statics.clear();
    entry.bindings.clear();
    ctx.classes.by_name.remove(&name);
    debug!("unloaded class {name}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rotates_and_reuses_slots() {
        let mut table = ClassTable::init();
        let a = table.alloc("a".into());
        let b = table.alloc("b".into());
        assert_ne!(a, b);
        assert_eq!(table.by_name("a"), Some(a));

        table.entries[a.idx()].status = ClassStatus::empty();
        table.by_name.remove("a");
        let c = table.alloc("c".into());
        assert_eq!(c, a, "freed slot is found again by the rotating scan");
    }

    #[test]
    fn superclass_chain_stops_at_root() {
        let mut table = ClassTable::init();
        let root = table.alloc("root".into());
        table.entries[root.idx()].status = ClassStatus::INUSE;
        let mid = table.alloc("mid".into());
        table.entries[mid.idx()].status = ClassStatus::INUSE;
        table.entries[mid.idx()].super_class = root;
        let leaf = table.alloc("leaf".into());
        table.entries[leaf.idx()].status = ClassStatus::INUSE;
        table.entries[leaf.idx()].super_class = mid;

        assert_eq!(table.superclass_chain(leaf), vec![leaf, mid, root]);
        assert!(table.is_assignable(leaf, root));
        assert!(!table.is_assignable(root, leaf));
    }
}
