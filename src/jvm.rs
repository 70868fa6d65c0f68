//! The machine itself: explicit context threading instead of global
//! state, the init/run/teardown lifecycle, and the outer scheduling
//! loop driving the three-phase thread state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::class::{self, ClassTable};
use crate::classfile::ClassFile;
use crate::classpath::ClassPath;
use crate::gc::{GcPolicy, StubCollector};
use crate::heap::{Block, Heap, HeapError};
use crate::native::NativeRegistry;
use crate::object::{instance_new, NewInstance, ObjectTable, Special};
use crate::state::{self, ThreadState};
use crate::thread::ThreadTable;
use crate::types::{
    ClassIndex, FieldLookupIndex, JValue, ObjectHash, TableIndex, ThreadIndex, Thrown, ThrownKind,
};

/// Exit categories reported by the launcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCategory {
    Okay = 0,
    Argument = 1,
    Classpath = 2,
    Heap = 3,
    Class = 4,
    Method = 5,
    Attribute = 6,
    Object = 7,
    Thread = 8,
    Internal = 9,
    Signal = 10,
}

#[derive(Debug, Error)]
pub enum JvmError {
    #[error("boot failed raising {throwable}")]
    Boot { throwable: String },
    #[error("startup class {class} has no static main(String[]) method")]
    NoMain { class: String },
}

impl JvmError {
    pub fn category(&self) -> ExitCategory {
        match self {
            JvmError::Boot { .. } => ExitCategory::Class,
            JvmError::NoMain { .. } => ExitCategory::Method,
        }
    }
}

/// Everything configurable from the outside.
#[derive(Debug, Clone)]
pub struct JvmConfig {
    pub classpath: Vec<PathBuf>,
    /// Total heap byte limit.
    pub heap_limit: usize,
    /// Object table capacity.
    pub max_objects: usize,
    /// Thread table capacity.
    pub max_threads: usize,
    /// JVM stack slots per thread.
    pub stack_slots: usize,
    /// Wall-clock timeslice; the tick sets the expired flag read by
    /// the interpreter.
    pub timeslice: Duration,
}

impl Default for JvmConfig {
    fn default() -> JvmConfig {
        JvmConfig {
            classpath: Vec::new(),
            heap_limit: 64 << 20,
            max_objects: 1 << 16,
            max_threads: 256,
            stack_slots: 16 * 1024,
            timeslice: Duration::from_millis(10),
        }
    }
}

/// The process-wide machine state, constructed at init, passed into
/// every subsystem entry point, torn down at shutdown.
pub struct JvmContext {
    pub config: JvmConfig,
    pub classes: ClassTable,
    pub objects: ObjectTable,
    pub threads: ThreadTable,
    pub heap: Heap,
    pub gc: Box<dyn GcPolicy>,
    pub classpath: ClassPath,
    pub natives: NativeRegistry,
    /// Interned string objects by value.
    pub strings: HashMap<Rc<str>, ObjectHash>,
    pub current_thread: ThreadIndex,
    /// The boot thread `<clinit>` runs on when no other thread asked.
    pub system_thread: ThreadIndex,
    pub system_thread_group: ObjectHash,
    /// Reentrancy counter of the throwable dispatcher.
    pub linkage_error_guard: u32,
    pub fatal_exit: Option<ExitCategory>,
    /// Exit code requested by `System.exit`.
    pub user_exit: Option<i32>,
    /// Threads that died with an uncaught throwable.
    pub uncaught_count: u32,
    timeslice_flag: Arc<AtomicBool>,
    shutdown_flag: Arc<AtomicBool>,
    ticker_stop: Arc<AtomicBool>,
    ticker: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for JvmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JvmContext")
            .field("current_thread", &self.current_thread)
            .field("objects_in_use", &self.objects.in_use_count())
            .finish_non_exhaustive()
    }
}

impl JvmContext {
    /// Brings the machine up: heap, tables, collector, wall-clock
    /// ticker, primitive pseudo-classes, the bootstrap class core and
    /// the system thread.
    pub fn init(config: JvmConfig) -> Result<JvmContext, JvmError> {
        let timeslice_flag = Arc::new(AtomicBool::new(false));
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = spawn_ticker(config.timeslice, timeslice_flag.clone(), ticker_stop.clone());

        let mut ctx = JvmContext {
            classpath: ClassPath::from_paths(&config.classpath),
            heap: Heap::init(config.heap_limit),
            classes: ClassTable::init(),
            objects: ObjectTable::init(config.max_objects),
            threads: ThreadTable::init(config.max_threads),
            gc: Box::new(StubCollector),
            natives: NativeRegistry::bootstrap(),
            strings: HashMap::new(),
            current_thread: ThreadIndex::NULL,
            system_thread: ThreadIndex::NULL,
            system_thread_group: ObjectHash::NULL,
            linkage_error_guard: 0,
            fatal_exit: None,
            user_exit: None,
            uncaught_count: 0,
            timeslice_flag,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            ticker_stop,
            ticker: Some(ticker),
            config,
        };
        ctx.gc.init();
        ctx.boot().map_err(|thrown| JvmError::Boot {
            throwable: thrown.class_name.to_string(),
        })?;
        Ok(ctx)
    }

    fn boot(&mut self) -> Result<(), Thrown> {
        class::define_primitives(self);

        for name in [
            crate::bootstrap::ROOT_CLASS,
            crate::bootstrap::CLASS_META_CLASS,
            crate::bootstrap::STRING_CLASS,
            crate::bootstrap::THREAD_CLASS,
            crate::bootstrap::THREAD_GROUP_CLASS,
            crate::bootstrap::THROWABLE_CLASS,
        ] {
            class::load(self, name, ThreadIndex::NULL)?;
        }

        // entries created before java/lang/Class need meta-objects
        class::materialize_meta_objects(self, ThreadIndex::NULL)?;

        let thread_cls = class::load(self, crate::bootstrap::THREAD_CLASS, ThreadIndex::NULL)?;
        let system_thread_object = instance_new(
            self,
            NewInstance {
                class: thread_cls,
                special: Special::Thread,
                lengths: Vec::new(),
                run_init: false,
                thread: ThreadIndex::NULL,
            },
        )?;
        self.system_thread = self
            .objects
            .entry(system_thread_object)
            .map(|e| e.thread)
            .unwrap_or(ThreadIndex::NULL);
        self.current_thread = self.system_thread;
        if let Some(te) = self.threads.entry_mut(self.system_thread) {
            te.name = Some("system".into());
            te.flags |= crate::thread::ThreadFlags::DAEMON;
        }

        let group_cls = class::load(self, crate::bootstrap::THREAD_GROUP_CLASS, self.system_thread)?;
        self.system_thread_group = instance_new(
            self,
            NewInstance {
                class: group_cls,
                special: Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: self.system_thread,
            },
        )?;

        self.wire_system_out()?;
        info!("machine is up; system thread {:?}", self.system_thread);
        Ok(())
    }

    /// Gives `java/lang/System.out` its stream instance.
    fn wire_system_out(&mut self) -> Result<(), Thrown> {
        let system = class::load_resolve_init(self, "java/lang/System", self.system_thread)?;
        let stream_cls = class::load_resolve_init(self, "java/io/PrintStream", self.system_thread)?;
        let stream = instance_new(
            self,
            NewInstance {
                class: stream_cls,
                special: Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: self.system_thread,
            },
        )?;
        if let Some(lookup) = self.static_lookup_by_name(system, "out") {
            self.gc.class_field_mkref(&mut self.classes, system, lookup);
            self.gc
                .object_mkref_from_class(&mut self.objects, system, stream);
            if let Some(slot) = self
                .classes
                .entry_mut(system)
                .and_then(|e| e.statics.get_mut(lookup.idx()))
            {
                *slot = JValue::Reference(stream);
            }
        }
        Ok(())
    }

    /// Defines a class from an already parsed image, as the bootstrap
    /// path and test fixtures do.
    pub fn define_class(&mut self, class_file: ClassFile) -> Result<ClassIndex, Thrown> {
        let thridx = self.system_thread;
        let mut in_progress = Vec::new();
        class::define(self, Rc::new(class_file), thridx, &mut in_progress)
    }

    pub fn timeslice_expired(&self) -> bool {
        self.timeslice_flag.load(Ordering::Relaxed)
    }

    pub fn clear_timeslice(&self) {
        self.timeslice_flag.store(false, Ordering::Relaxed);
    }

    /// A clone of the shutdown flag for signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Runs one collection cycle.
    pub fn run_gc(&mut self, remove_refs: bool) {
        let mut gc = std::mem::replace(&mut self.gc, Box::new(StubCollector));
        gc.run(self, remove_refs);
        self.gc = gc;
    }

    fn acquire(
        &mut self,
        which: fn(&mut Heap, usize, bool) -> Result<Block, HeapError>,
        size: usize,
    ) -> Result<Block, Thrown> {
        match which(&mut self.heap, size, true) {
            Ok(block) => Ok(block),
            Err(HeapError::Exhausted { .. }) => {
                // reclaim once and retry before giving up
                self.run_gc(true);
                which(&mut self.heap, size, true).map_err(|e| {
                    warn!("heap exhausted after collection: {e}");
                    Thrown::error("java/lang/OutOfMemoryError")
                })
            }
        }
    }

    pub fn acquire_data(&mut self, size: usize, _clear: bool) -> Result<Block, Thrown> {
        self.acquire(Heap::acquire_data_area, size)
    }

    pub fn acquire_stack(&mut self, size: usize) -> Result<Block, Thrown> {
        self.acquire(Heap::acquire_stack_area, size)
    }

    pub fn acquire_method_area(&mut self, size: usize) -> Result<Block, Thrown> {
        self.acquire(Heap::acquire_method_area, size)
    }

    /// True when the class is `java/lang/Thread` or a subclass.
    pub fn is_thread_class(&self, clsidx: ClassIndex) -> bool {
        self.classes.superclass_chain(clsidx).iter().any(|&c| {
            self.classes
                .name_of(c)
                .is_some_and(|n| n.as_ref() == crate::bootstrap::THREAD_CLASS)
        })
    }

    /// Classifies a throwable class by its superclass chain.
    pub fn throwable_kind(&self, clsidx: ClassIndex) -> ThrownKind {
        for cls in self.classes.superclass_chain(clsidx) {
            match self.classes.name_of(cls).as_deref() {
                Some("java/lang/Error") => return ThrownKind::Error,
                Some("java/lang/Exception") => return ThrownKind::Exception,
                _ => {}
            }
        }
        ThrownKind::Throwable
    }

    /// The `instanceof`/`checkcast` relation over live objects.
    pub fn instance_of(&self, hash: ObjectHash, target: ClassIndex) -> bool {
        let Some(cls) = self.objects.class_of(hash) else {
            return false;
        };
        cls == target || self.classes.is_assignable(cls, target)
    }

    /// Store check for `aastore`.
    pub fn array_element_accepts(&self, array: ObjectHash, value: ObjectHash) -> bool {
        let Some(array_cls) = self.objects.class_of(array) else {
            return false;
        };
        let Some(array_name) = self.classes.name_of(array_cls) else {
            return false;
        };
        let Some(element_desc) = array_name.strip_prefix('[') else {
            return false;
        };
        let element_name = element_desc
            .strip_prefix('L')
            .and_then(|n| n.strip_suffix(';'))
            .unwrap_or(element_desc);
        match self.classes.by_name(element_name) {
            // an element class nobody loaded yet cannot have live
            // incompatible instances
            None => true,
            Some(element_cls) => self
                .objects
                .class_of(value)
                .is_some_and(|v| v == element_cls || self.classes.is_assignable(v, element_cls)),
        }
    }

    fn static_lookup_by_name(&self, clsidx: ClassIndex, name: &str) -> Option<FieldLookupIndex> {
        let entry = self.classes.entry(clsidx)?;
        let cf = entry.class_file.as_ref()?;
        entry
            .static_lookup
            .iter()
            .position(|&f| {
                cf.fields
                    .get(f.idx())
                    .and_then(|field| cf.field_name(field))
                    .map(Rc::as_ref)
                    == Some(name)
            })
            .map(|p| FieldLookupIndex(p as u16))
    }

    fn instance_lookup_by_name(&self, clsidx: ClassIndex, name: &str) -> Option<FieldLookupIndex> {
        for cls in self.classes.superclass_chain(clsidx) {
            let Some(entry) = self.classes.entry(cls) else {
                continue;
            };
            let Some(cf) = entry.class_file.as_ref() else {
                continue;
            };
            let own_base = entry.num_instance_lookups as usize - entry.instance_lookup.len();
            for (position, &f) in entry.instance_lookup.iter().enumerate() {
                if cf
                    .fields
                    .get(f.idx())
                    .and_then(|field| cf.field_name(field))
                    .map(Rc::as_ref)
                    == Some(name)
                {
                    return Some(FieldLookupIndex((own_base + position) as u16));
                }
            }
        }
        None
    }

    /// Interns a string constant as a `java/lang/String` object over a
    /// char array.
    pub fn intern_string(
        &mut self,
        value: &Rc<str>,
        thridx: ThreadIndex,
    ) -> Result<ObjectHash, Thrown> {
        if let Some(&hash) = self.strings.get(value) {
            return Ok(hash);
        }

        let units: Vec<u16> = value.encode_utf16().collect();
        let array_cls = class::load(self, "[C", thridx)?;
        let array = instance_new(
            self,
            NewInstance {
                class: array_cls,
                special: Special::None,
                lengths: vec![units.len() as u32],
                run_init: false,
                thread: thridx,
            },
        )?;
        for (i, &unit) in units.iter().enumerate() {
            self.objects.array_set(array, i as i32, JValue::Char(unit))?;
        }

        let string_cls = class::load(self, crate::bootstrap::STRING_CLASS, thridx)?;
        let hash = instance_new(
            self,
            NewInstance {
                class: string_cls,
                special: Special::None,
                lengths: Vec::new(),
                run_init: false,
                thread: thridx,
            },
        )?;
        if let Some(lookup) = self.instance_lookup_by_name(string_cls, "value") {
            self.gc.object_field_mkref(&mut self.objects, hash, lookup);
            self.gc
                .object_mkref_from_object(&mut self.objects, hash, array);
            if let Some(slot) = self
                .objects
                .entry_mut(hash)
                .and_then(|e| e.fields.get_mut(lookup.idx()))
            {
                *slot = JValue::Reference(array);
            }
        }
        if let Some(lookup) = self.instance_lookup_by_name(string_cls, "count") {
            if let Some(slot) = self
                .objects
                .entry_mut(hash)
                .and_then(|e| e.fields.get_mut(lookup.idx()))
            {
                *slot = JValue::Int(units.len() as i32);
            }
        }

        // interned strings are rooted in the string class
        self.gc
            .object_mkref_from_class(&mut self.objects, string_cls, hash);
        self.strings.insert(value.clone(), hash);
        Ok(hash)
    }

    /// Reads a `java/lang/String` object back into a Rust string.
    pub fn java_string(&self, hash: ObjectHash) -> Option<String> {
        let clsidx = self.objects.class_of(hash)?;
        let lookup = self.instance_lookup_by_name(clsidx, "value")?;
        let array = match self.objects.entry(hash)?.fields.get(lookup.idx())? {
            JValue::Reference(array) => *array,
            _ => return None,
        };
        let length = *self.objects.entry(array)?.lengths.first()? as i32;
        let mut units = Vec::with_capacity(length as usize);
        for i in 0..length {
            match self.objects.array_get(array, i).ok()? {
                JValue::Char(unit) => units.push(unit),
                _ => return None,
            }
        }
        String::from_utf16(&units).ok()
    }

    /// Loads the startup class, arms the main thread on its
    /// `main(String[])`, and drives the scheduler until every user
    /// thread is dead.  Returns the process exit code.
    pub fn run_main(&mut self, class_name: &str, program_args: &[String]) -> i32 {
        match self.launch_main(class_name, program_args) {
            Ok(()) => {}
            Err(LaunchFailure::Jvm(e)) => {
                warn!("launch failed: {e}");
                return e.category() as i32;
            }
            Err(LaunchFailure::Thrown(thrown)) => {
                warn!("launch raised {}", thrown.class_name);
                return ExitCategory::Class as i32;
            }
        }
        self.scheduler_loop();
        self.exit_code()
    }

    fn launch_main(
        &mut self,
        class_name: &str,
        program_args: &[String],
    ) -> Result<(), LaunchFailure> {
        let no_main = || {
            LaunchFailure::Jvm(JvmError::NoMain {
                class: class_name.into(),
            })
        };

        let internal = class_name.replace('.', "/");
        let clsidx = class::load_resolve_init(self, &internal, self.system_thread)
            .map_err(LaunchFailure::Thrown)?;

        let cf = self.classes.class_file(clsidx).ok_or_else(no_main)?;
        let (mthidx, method) = cf
            .find_method("main", "([Ljava/lang/String;)V")
            .ok_or_else(no_main)?;
        if !method
            .access_flags
            .contains(crate::classfile::MethodAccessFlags::STATIC)
        {
            return Err(no_main());
        }
        let code_attr = method.code_attr_index().ok_or_else(no_main)?;
        let (_, max_stack, max_locals, _) = cf.code_at(mthidx, code_attr).ok_or_else(no_main)?;

        // program arguments become a String[]
        let array_cls = class::load(self, "[Ljava/lang/String;", self.system_thread)
            .map_err(LaunchFailure::Thrown)?;
        let args_array = instance_new(
            self,
            NewInstance {
                class: array_cls,
                special: Special::None,
                lengths: vec![program_args.len() as u32],
                run_init: false,
                thread: self.system_thread,
            },
        )
        .map_err(LaunchFailure::Thrown)?;
        for (i, arg) in program_args.iter().enumerate() {
            let s = self
                .intern_string(&Rc::from(arg.as_str()), self.system_thread)
                .map_err(LaunchFailure::Thrown)?;
            self.objects
                .array_set(args_array, i as i32, JValue::Reference(s))
                .map_err(LaunchFailure::Thrown)?;
        }

        // the main thread is a regular thread object armed at main()
        let thread_cls = class::load(self, crate::bootstrap::THREAD_CLASS, self.system_thread)
            .map_err(LaunchFailure::Thrown)?;
        let main_object = instance_new(
            self,
            NewInstance {
                class: thread_cls,
                special: Special::Thread,
                lengths: Vec::new(),
                run_init: false,
                thread: self.system_thread,
            },
        )
        .map_err(LaunchFailure::Thrown)?;
        let main_thread = self
            .objects
            .entry(main_object)
            .map(|e| e.thread)
            .unwrap_or(ThreadIndex::NULL);

        let pc = crate::thread::ProgramCounter {
            clsidx,
            mthidx: crate::types::MethodIndex(mthidx),
            codeatridx: code_attr,
            excpatridx: code_attr,
            offset: 0,
        };
        {
            let te = self.threads.entry_mut(main_thread).ok_or_else(no_main)?;
            te.name = Some("main".into());
            let floor = te.fp;
            te.push_frame(max_locals, max_stack, pc)
                .map_err(LaunchFailure::Thrown)?;
            te.end_program_fp = floor;
            te.set_local(0, args_array.raw() as i32);
        }
        state::request(self, main_thread, ThreadState::Start);
        info!("main thread {main_thread:?} armed at {internal}.main");
        Ok(())
    }

    /// One round per in-use thread, in priority order, until no user
    /// thread remains or shutdown is requested.
    fn scheduler_loop(&mut self) {
        loop {
            if self.shutdown_requested() || self.fatal_exit.is_some() {
                break;
            }

            let mut order: Vec<ThreadIndex> = self.threads.iter_in_use().collect();
            order.sort_by_key(|&t| {
                std::cmp::Reverse(self.threads.entry(t).map(|e| e.priority).unwrap_or(0))
            });

            // promote a runnable thread when nothing is running
            let running = order.iter().any(|&t| {
                self.threads
                    .entry(t)
                    .is_some_and(|e| e.this_state == ThreadState::Running)
            });
            if !running {
                if let Some(&next) = order.iter().find(|&&t| {
                    self.threads
                        .entry(t)
                        .is_some_and(|e| e.this_state == ThreadState::Runnable)
                }) {
                    state::request(self, next, ThreadState::Running);
                }
            }

            let mut any_user_alive = false;
            for thridx in order {
                if self.shutdown_requested() {
                    break;
                }
                self.current_thread = thridx;
                state::tick(self, thridx);
                if let Some(te) = self.threads.entry(thridx) {
                    if !te.flags.contains(crate::thread::ThreadFlags::DAEMON)
                        && te.this_state != ThreadState::Dead
                    {
                        any_user_alive = true;
                    }
                }
            }
            self.clear_timeslice();

            if !any_user_alive {
                break;
            }
        }
        debug!("scheduler loop finished");
    }

    fn exit_code(&self) -> i32 {
        if let Some(category) = self.fatal_exit {
            return category as i32;
        }
        if let Some(code) = self.user_exit {
            return code;
        }
        if self.uncaught_count > 0 {
            return ExitCategory::Thread as i32;
        }
        ExitCategory::Okay as i32
    }

    /// Ordered teardown, the reverse of init.  Dropping the context
    /// afterwards releases tables and heap.
    pub fn teardown(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
        let stats = self.heap.stats();
        info!(
            "teardown: {} objects live, heap {}B in use (slab {}/{} sys {}/{})",
            self.objects.in_use_count(),
            self.heap.bytes_in_use(),
            stats.slab_allocs,
            stats.slab_frees,
            stats.system_allocs,
            stats.system_frees,
        );
    }
}

impl Drop for JvmContext {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }
}

enum LaunchFailure {
    Jvm(JvmError),
    Thrown(Thrown),
}

fn spawn_ticker(
    period: Duration,
    flag: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("timeslice-ticker".into())
        .spawn(move || loop {
            std::thread::sleep(period);
            if stop.load(Ordering::Relaxed) {
                break;
            }
            flag.store(true, Ordering::Relaxed);
        })
        .expect("cannot spawn the timeslice ticker")
}
