//! A bootstrap Java Virtual Machine.
//!
//! A stack-based interpreter that loads class files, manages object
//! and class lifetimes on a managed heap, coordinates cooperative
//! multi-threading with monitor-lock synchronization, and executes
//! the JVM instruction set against an operand stack and local
//! variable frame model.
//!
//! The machine is single OS-threaded and cooperative: the outer loop
//! gives each Java thread one timeslice per round, and every opcode
//! boundary is a suspension point.  All cross-references between
//! classes, objects and threads are dense table indices, never
//! pointers, and the whole machine state lives in one explicit
//! [jvm::JvmContext].

pub mod bootstrap;
pub mod class;
pub mod classfile;
pub mod classpath;
pub mod gc;
pub mod gif;
pub mod heap;
pub mod jvm;
pub mod linkage;
pub mod monitor;
pub mod native;
pub mod object;
pub mod opcode;
pub mod state;
pub mod thread;
pub mod throwable;
pub mod types;

pub use jvm::{ExitCategory, JvmConfig, JvmContext, JvmError};
pub use types::{JValue, Thrown, ThrownKind};
