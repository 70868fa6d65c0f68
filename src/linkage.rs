//! The linkage resolver: late binding of symbolic constant-pool
//! references to concrete class, method and field indices.
//!
//! Bindings start at bad sentinels and are monotonic: once set to a
//! valid index they are never rewritten.  A full sweep happens at
//! class initialization; entries the sweep could not bind are retried
//! on demand when an instruction first touches them.

use std::rc::Rc;

use log::{debug, trace};

use crate::class::{self, ClassStatus};
use crate::classfile::{self, ClassFile, CpEntry, FieldAccessFlags, MethodAccessFlags};
use crate::jvm::JvmContext;
use crate::types::{
    BaseType, ClassIndex, FieldIndex, FieldLookupIndex, MethodIndex, ThreadIndex, Thrown,
};

/// The resolved companion of one constant-pool entry.
#[derive(Debug, Clone, Copy)]
pub struct LocalBinding {
    /// Bound class for Class/Fieldref/Methodref entries.
    pub class: ClassIndex,
    /// Bound method table index for method references.
    pub method: MethodIndex,
    /// Code attribute index of the bound method.
    pub code_attr: u16,
    /// Exception-table attribute index of the bound method.
    pub excp_attr: u16,
    /// Dense value-array index for field references.
    pub field_lookup: FieldLookupIndex,
    /// Value type of a bound field.
    pub value_type: Option<BaseType>,
    /// Whether the bound field lives in class-static storage.
    pub static_field: bool,
    /// Native-method ordinal of the bound method, when native.
    pub native_ordinal: Option<u16>,
}

impl Default for LocalBinding {
    fn default() -> LocalBinding {
        LocalBinding {
            class: ClassIndex::NULL,
            method: MethodIndex::BAD,
            code_attr: u16::MAX,
            excp_attr: u16::MAX,
            field_lookup: FieldLookupIndex::BAD,
            value_type: None,
            static_field: false,
            native_ordinal: None,
        }
    }
}

/// A method reference after resolution, with everything an invoke
/// needs in one place.
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    pub class: ClassIndex,
    pub method: MethodIndex,
    pub code_attr: u16,
    pub excp_attr: u16,
    pub access_flags: MethodAccessFlags,
    pub name: Rc<str>,
    pub descriptor: Rc<str>,
    pub native_ordinal: Option<u16>,
}

/// A field reference after resolution.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub class: ClassIndex,
    pub lookup: FieldLookupIndex,
    pub value_type: BaseType,
    pub static_field: bool,
    pub final_field: bool,
}

/// Sweeps the constant pool of `clsidx` in index order, filling in
/// every binding it can.  Fieldref/Methodref targets are fully
/// resolved and `<clinit>`-ed before their bindings are computed.
pub fn resolve(ctx: &mut JvmContext, clsidx: ClassIndex, thridx: ThreadIndex) -> Result<(), Thrown> {
    let Some(entry) = ctx.classes.entry(clsidx) else {
        return Ok(());
    };
    if entry.status.contains(ClassStatus::LINKED) {
        return Ok(());
    }
    let Some(cf) = entry.class_file.clone() else {
        // primitives and primitive arrays have nothing to bind
        if let Some(e) = ctx.classes.entry_mut(clsidx) {
            e.status |= ClassStatus::LINKED;
        }
        return Ok(());
    };

    // mark first: a pool that references this class itself must not
    // recurse back into the sweep
    if let Some(e) = ctx.classes.entry_mut(clsidx) {
        e.status |= ClassStatus::LINKED;
    }
    debug!("resolving constant pool of {:?}", ctx.classes.name_of(clsidx));

    // the sweep is best-effort: entries that fail keep their bad
    // sentinel and are retried (and then raise) on first use
    for index in 1..cf.constant_pool.len() as u16 {
        let outcome = match &cf.constant_pool[index as usize] {
            CpEntry::Class { .. } => {
                resolve_class_entry(ctx, clsidx, &cf, index, thridx).map(|_| ())
            }
            CpEntry::Fieldref { .. } => {
                resolve_field_entry(ctx, clsidx, &cf, index, thridx).map(|_| ())
            }
            CpEntry::Methodref { .. } | CpEntry::InterfaceMethodref { .. } => {
                resolve_method_entry(ctx, clsidx, &cf, index, thridx).map(|_| ())
            }
            _ => Ok(()),
        };
        if let Err(thrown) = outcome {
            trace!("pool entry {index} left unresolved: {}", thrown.class_name);
        }
    }
    Ok(())
}

/// Clears every binding of the class back to the bad sentinels.
pub fn unresolve(ctx: &mut JvmContext, clsidx: ClassIndex) {
    if let Some(entry) = ctx.classes.entry_mut(clsidx) {
        for binding in entry.bindings.iter_mut() {
            *binding = LocalBinding::default();
        }
        entry.status.remove(ClassStatus::LINKED);
        trace!("unresolved {:?}", entry.name);
    }
}

fn binding_of(ctx: &JvmContext, clsidx: ClassIndex, index: u16) -> LocalBinding {
    ctx.classes
        .entry(clsidx)
        .and_then(|e| e.bindings.get(index as usize).copied())
        .unwrap_or_default()
}

fn store_binding(ctx: &mut JvmContext, clsidx: ClassIndex, index: u16, binding: LocalBinding) {
    if let Some(entry) = ctx.classes.entry_mut(clsidx) {
        if let Some(slot) = entry.bindings.get_mut(index as usize) {
            *slot = binding;
        }
    }
}

/// Binds a Class pool entry, loading the target on first touch.
pub fn resolve_class_entry(
    ctx: &mut JvmContext,
    clsidx: ClassIndex,
    cf: &ClassFile,
    index: u16,
    thridx: ThreadIndex,
) -> Result<ClassIndex, Thrown> {
    let binding = binding_of(ctx, clsidx, index);
    if !binding.class.is_null() {
        return Ok(binding.class);
    }
    let name = cf
        .class_name_at(index)
        .cloned()
        .ok_or_else(|| Thrown::error("java/lang/VerifyError"))?;
    let target = class::load(ctx, &name, thridx)?;
    store_binding(
        ctx,
        clsidx,
        index,
        LocalBinding {
            class: target,
            ..binding
        },
    );
    Ok(target)
}

fn symbolic_ref<'a>(
    cf: &'a ClassFile,
    index: u16,
) -> Option<(u16, &'a Rc<str>, &'a Rc<str>)> {
    let (class_index, nat_index) = match cf.pool(index)? {
        CpEntry::Fieldref {
            class_index,
            name_and_type_index,
        }
        | CpEntry::Methodref {
            class_index,
            name_and_type_index,
        }
        | CpEntry::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => return None,
    };
    let (name, descriptor) = cf.name_and_type_at(nat_index)?;
    Some((class_index, name, descriptor))
}

/// Binds a Fieldref: owning class, dense lookup index and value type.
pub fn resolve_field_entry(
    ctx: &mut JvmContext,
    clsidx: ClassIndex,
    cf: &ClassFile,
    index: u16,
    thridx: ThreadIndex,
) -> Result<ResolvedField, Thrown> {
    let binding = binding_of(ctx, clsidx, index);
    if !binding.field_lookup.is_bad() {
        return finish_field(ctx, binding);
    }

    let (class_index, name, descriptor) = symbolic_ref(cf, index)
        .ok_or_else(|| Thrown::error("java/lang/VerifyError"))?;
    let (name, descriptor) = (name.clone(), descriptor.clone());

    // the target class is fully resolved and <clinit>-ed before its
    // field bindings are computed
    let target = resolve_class_entry(ctx, clsidx, cf, class_index, thridx)?;
    resolve(ctx, target, thridx)?;
    class::clinit(ctx, target, thridx)?;

    let found = find_field(ctx, target, &name, &descriptor)
        .ok_or_else(|| Thrown::error("java/lang/NoSuchFieldError"))?;

    let new_binding = LocalBinding {
        class: found.class,
        field_lookup: found.lookup,
        value_type: Some(found.value_type),
        static_field: found.static_field,
        ..binding
    };
    store_binding(ctx, clsidx, index, new_binding);
    trace!(
        "bound fieldref {name}:{descriptor} of pool {index} to {:?}/{:?}",
        found.class,
        found.lookup
    );
    Ok(found)
}

fn finish_field(ctx: &JvmContext, binding: LocalBinding) -> Result<ResolvedField, Thrown> {
    Ok(ResolvedField {
        class: binding.class,
        lookup: binding.field_lookup,
        value_type: binding
            .value_type
            .ok_or_else(|| Thrown::error("java/lang/InternalError"))?,
        static_field: binding.static_field,
        final_field: field_is_final(ctx, binding),
    })
}

fn field_is_final(ctx: &JvmContext, binding: LocalBinding) -> bool {
    let Some(entry) = ctx.classes.entry(binding.class) else {
        return false;
    };
    let Some(cf) = entry.class_file.as_ref() else {
        return false;
    };
    let fldidx = if binding.static_field {
        entry.static_lookup.get(binding.field_lookup.idx()).copied()
    } else {
        let own_base = entry.num_instance_lookups as usize - entry.instance_lookup.len();
        binding
            .field_lookup
            .idx()
            .checked_sub(own_base)
            .and_then(|i| entry.instance_lookup.get(i).copied())
    };
    fldidx
        .and_then(|f| cf.fields.get(f.idx()))
        .map(|f| f.access_flags.contains(FieldAccessFlags::FINAL))
        .unwrap_or(false)
}

/// Searches `target` and its superclasses for a field, computing the
/// binding the way objects of the *referenced* class index their
/// value arrays.
fn find_field(
    ctx: &JvmContext,
    target: ClassIndex,
    name: &str,
    descriptor: &str,
) -> Option<ResolvedField> {
    for cls in ctx.classes.superclass_chain(target) {
        let entry = ctx.classes.entry(cls)?;
        let cf = entry.class_file.as_ref()?;
        for (i, field) in cf.fields.iter().enumerate() {
            if cf.field_name(field).map(Rc::as_ref) != Some(name)
                || cf.field_descriptor(field).map(Rc::as_ref) != Some(descriptor)
            {
                continue;
            }
            let value_type = classfile::field_type(descriptor).ok()?;
            let final_field = field.access_flags.contains(FieldAccessFlags::FINAL);
            let fldidx = FieldIndex(i as u16);
            return if field.access_flags.contains(FieldAccessFlags::STATIC) {
                let lookup = entry
                    .static_lookup
                    .iter()
                    .position(|&f| f == fldidx)
                    .map(|p| FieldLookupIndex(p as u16))?;
                Some(ResolvedField {
                    class: cls,
                    lookup,
                    value_type,
                    static_field: true,
                    final_field,
                })
            } else {
                let own_base = entry.num_instance_lookups as usize - entry.instance_lookup.len();
                let position = entry.instance_lookup.iter().position(|&f| f == fldidx)?;
                Some(ResolvedField {
                    class: cls,
                    lookup: FieldLookupIndex((own_base + position) as u16),
                    value_type,
                    static_field: false,
                    final_field,
                })
            };
        }
    }
    None
}

/// Binds a Methodref or InterfaceMethodref.
pub fn resolve_method_entry(
    ctx: &mut JvmContext,
    clsidx: ClassIndex,
    cf: &ClassFile,
    index: u16,
    thridx: ThreadIndex,
) -> Result<ResolvedMethod, Thrown> {
    let binding = binding_of(ctx, clsidx, index);
    if !binding.method.is_bad() {
        return finish_method(ctx, binding);
    }

    let (class_index, name, descriptor) = symbolic_ref(cf, index)
        .ok_or_else(|| Thrown::error("java/lang/VerifyError"))?;
    let (name, descriptor) = (name.clone(), descriptor.clone());

    let target = resolve_class_entry(ctx, clsidx, cf, class_index, thridx)?;
    resolve(ctx, target, thridx)?;
    class::clinit(ctx, target, thridx)?;

    let (def_class, mthidx) = ctx
        .classes
        .find_method(target, &name, &descriptor)
        .ok_or_else(|| Thrown::error("java/lang/NoSuchMethodError"))?;

    let def_cf = ctx
        .classes
        .class_file(def_class)
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
    let method = def_cf
        .methods
        .get(mthidx as usize)
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;

    let code_attr = method.code_attr_index().unwrap_or(u16::MAX);
    let native_ordinal = if method.access_flags.contains(MethodAccessFlags::NATIVE) {
        ctx.natives.ordinal_of(
            ctx.classes.name_of(def_class).as_deref().unwrap_or(""),
            &name,
            &descriptor,
        )
    } else {
        None
    };

    let new_binding = LocalBinding {
        class: def_class,
        method: MethodIndex(mthidx),
        code_attr,
        excp_attr: code_attr,
        native_ordinal,
        ..binding
    };
    store_binding(ctx, clsidx, index, new_binding);
    trace!("bound methodref {name}{descriptor} of pool {index} to {def_class:?}[{mthidx}]");
    finish_method(ctx, new_binding)
}

fn finish_method(ctx: &JvmContext, binding: LocalBinding) -> Result<ResolvedMethod, Thrown> {
    let cf = ctx
        .classes
        .class_file(binding.class)
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
    let method = cf
        .methods
        .get(binding.method.idx())
        .ok_or_else(|| Thrown::error("java/lang/InternalError"))?;
    Ok(ResolvedMethod {
        class: binding.class,
        method: binding.method,
        code_attr: binding.code_attr,
        excp_attr: binding.excp_attr,
        access_flags: method.access_flags,
        name: cf
            .method_name(method)
            .cloned()
            .ok_or_else(|| Thrown::error("java/lang/InternalError"))?,
        descriptor: cf
            .method_descriptor(method)
            .cloned()
            .ok_or_else(|| Thrown::error("java/lang/InternalError"))?,
        native_ordinal: binding.native_ordinal,
    })
}
