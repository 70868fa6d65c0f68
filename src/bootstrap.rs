//! The minimal bootstrap class library.
//!
//! Only the classes needed to start the machine are provided: the
//! root object, the class meta type, string, thread, thread group,
//! and the throwable hierarchy the machine itself raises.  Classpath
//! definitions always win; these are synthesized only when the
//! classpath has no `.class` resource for the name.

use crate::classfile::{
    synth::ClassSynth, ClassFile, FieldAccessFlags, MethodAccessFlags,
};
use crate::opcode::op;

pub const ROOT_CLASS: &str = "java/lang/Object";
pub const CLASS_META_CLASS: &str = "java/lang/Class";
pub const STRING_CLASS: &str = "java/lang/String";
pub const THREAD_CLASS: &str = "java/lang/Thread";
pub const THREAD_GROUP_CLASS: &str = "java/lang/ThreadGroup";
pub const THROWABLE_CLASS: &str = "java/lang/Throwable";

/// The throwable hierarchy: (class, superclass).  Everything gets a
/// bare no-arg constructor.
const THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Throwable", ROOT_CLASS),
    ("java/lang/Error", "java/lang/Throwable"),
    ("java/lang/Exception", "java/lang/Throwable"),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/InterruptedException", "java/lang/Exception"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    (
        "java/lang/ArrayIndexOutOfBoundsException",
        "java/lang/IndexOutOfBoundsException",
    ),
    ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
    ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/IllegalMonitorStateException", "java/lang/RuntimeException"),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
    (
        "java/lang/IllegalThreadStateException",
        "java/lang/IllegalArgumentException",
    ),
    ("java/lang/ThreadDeath", "java/lang/Error"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/ClassFormatError", "java/lang/LinkageError"),
    (
        "java/lang/UnsupportedClassVersionError",
        "java/lang/ClassFormatError",
    ),
    ("java/lang/ClassCircularityError", "java/lang/LinkageError"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    (
        "java/lang/IncompatibleClassChangeError",
        "java/lang/LinkageError",
    ),
    (
        "java/lang/NoSuchFieldError",
        "java/lang/IncompatibleClassChangeError",
    ),
    (
        "java/lang/NoSuchMethodError",
        "java/lang/IncompatibleClassChangeError",
    ),
    (
        "java/lang/IllegalAccessError",
        "java/lang/IncompatibleClassChangeError",
    ),
    (
        "java/lang/InstantiationError",
        "java/lang/IncompatibleClassChangeError",
    ),
    (
        "java/lang/AbstractMethodError",
        "java/lang/IncompatibleClassChangeError",
    ),
    ("java/lang/VerifyError", "java/lang/LinkageError"),
    ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
    (
        "java/lang/ExceptionInInitializerError",
        "java/lang/LinkageError",
    ),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/InternalError", "java/lang/VirtualMachineError"),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
    ("java/lang/UnknownError", "java/lang/VirtualMachineError"),
];

const PUBLIC: MethodAccessFlags = MethodAccessFlags::PUBLIC;

fn public_native() -> MethodAccessFlags {
    MethodAccessFlags::PUBLIC | MethodAccessFlags::NATIVE
}

fn public_static_native() -> MethodAccessFlags {
    MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC | MethodAccessFlags::NATIVE
}

/// A `{ return; }` body.
fn empty_body() -> Vec<u8> {
    vec![op::RETURN]
}

/// Synthesizes the named bootstrap class, or None when the name is
/// not part of the minimal library.
pub fn synthesize(name: &str) -> Option<ClassFile> {
    let cf = match name {
        ROOT_CLASS => ClassSynth::new(ROOT_CLASS)
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .bodyless_method(public_native(), "getClass", "()Ljava/lang/Class;")
            .bodyless_method(public_native(), "hashCode", "()I")
            .bodyless_method(public_native(), "wait", "()V")
            .bodyless_method(public_native(), "wait", "(J)V")
            .bodyless_method(public_native(), "notify", "()V")
            .bodyless_method(public_native(), "notifyAll", "()V")
            .build(),
        CLASS_META_CLASS => ClassSynth::new(CLASS_META_CLASS)
            .superclass(ROOT_CLASS)
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .bodyless_method(public_native(), "getName", "()Ljava/lang/String;")
            .build(),
        STRING_CLASS => ClassSynth::new(STRING_CLASS)
            .superclass(ROOT_CLASS)
            .field(FieldAccessFlags::PRIVATE, "value", "[C")
            .field(FieldAccessFlags::PRIVATE, "count", "I")
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .build(),
        THREAD_CLASS => ClassSynth::new(THREAD_CLASS)
            .superclass(ROOT_CLASS)
            .field(FieldAccessFlags::PRIVATE, "name", "Ljava/lang/String;")
            .field(FieldAccessFlags::PRIVATE, "priority", "I")
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .method(PUBLIC, "run", "()V", 1, 1, empty_body())
            .bodyless_method(public_static_native(), "currentThread", "()Ljava/lang/Thread;")
            .bodyless_method(public_native(), "start", "()V")
            .bodyless_method(public_static_native(), "sleep", "(J)V")
            .bodyless_method(public_static_native(), "yield", "()V")
            .bodyless_method(public_native(), "interrupt", "()V")
            .bodyless_method(public_native(), "isInterrupted", "()Z")
            .bodyless_method(public_static_native(), "interrupted", "()Z")
            .bodyless_method(public_native(), "isAlive", "()Z")
            .bodyless_method(public_native(), "join", "()V")
            .bodyless_method(public_native(), "join", "(J)V")
            .bodyless_method(public_native(), "setPriority", "(I)V")
            .bodyless_method(public_native(), "getPriority", "()I")
            .bodyless_method(public_native(), "stop", "()V")
            .bodyless_method(public_native(), "suspend", "()V")
            .bodyless_method(public_native(), "resume", "()V")
            .bodyless_method(public_native(), "destroy", "()V")
            .build(),
        THREAD_GROUP_CLASS => ClassSynth::new(THREAD_GROUP_CLASS)
            .superclass(ROOT_CLASS)
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .method(
                PUBLIC,
                "uncaughtException",
                "(Ljava/lang/Thread;Ljava/lang/Throwable;)V",
                1,
                3,
                empty_body(),
            )
            .build(),
        "java/lang/System" => ClassSynth::new("java/lang/System")
            .superclass(ROOT_CLASS)
            .field(
                FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
                "out",
                "Ljava/io/PrintStream;",
            )
            .bodyless_method(public_static_native(), "currentTimeMillis", "()J")
            .bodyless_method(
                public_static_native(),
                "arraycopy",
                "(Ljava/lang/Object;ILjava/lang/Object;II)V",
            )
            .bodyless_method(public_static_native(), "exit", "(I)V")
            .build(),
        "java/io/PrintStream" => ClassSynth::new("java/io/PrintStream")
            .superclass(ROOT_CLASS)
            .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
            .bodyless_method(public_native(), "println", "(Ljava/lang/String;)V")
            .bodyless_method(public_native(), "println", "(I)V")
            .bodyless_method(public_native(), "println", "(J)V")
            .bodyless_method(public_native(), "println", "()V")
            .build(),
        _ => {
            let &(name, super_name) = THROWABLES.iter().find(|(n, _)| *n == name)?;
            ClassSynth::new(name)
                .superclass(super_name)
                .field(
                    FieldAccessFlags::PRIVATE,
                    "detailMessage",
                    "Ljava/lang/String;",
                )
                .method(PUBLIC, "<init>", "()V", 1, 1, empty_body())
                .build()
        }
    };
    Some(cf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_names_synthesize() {
        for name in [
            ROOT_CLASS,
            CLASS_META_CLASS,
            STRING_CLASS,
            THREAD_CLASS,
            THREAD_GROUP_CLASS,
            THROWABLE_CLASS,
            "java/lang/OutOfMemoryError",
            "java/lang/ArithmeticException",
        ] {
            let cf = synthesize(name).unwrap();
            assert_eq!(cf.this_class_name().unwrap().as_ref(), name);
        }
        assert!(synthesize("com/example/NotBootstrap").is_none());
    }

    #[test]
    fn root_class_has_no_superclass() {
        let cf = synthesize(ROOT_CLASS).unwrap();
        assert_eq!(cf.super_class, 0);
        assert!(cf.find_method("<init>", "()V").is_some());
    }

    #[test]
    fn every_throwable_superclass_is_in_the_table() {
        for (name, super_name) in THROWABLES {
            if *super_name != ROOT_CLASS {
                assert!(
                    THROWABLES.iter().any(|(n, _)| n == super_name),
                    "{name} has an undefined superclass {super_name}"
                );
            }
        }
    }
}
