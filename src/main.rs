use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info, LevelFilter};

use lungo::jvm::{ExitCategory, JvmConfig, JvmContext};

/// A bootstrap Java Virtual Machine.
#[derive(Debug, Parser)]
#[command(name = "lungo", version, about)]
struct Args {
    /// Class search path of directories and jar archives
    /// (falls back to the CLASSPATH environment variable).
    #[arg(long = "classpath", short = 'c', alias = "cp")]
    classpath: Option<String>,

    /// Execute the Main-Class of a jar archive instead of CLASS.
    #[arg(long = "jar", conflicts_with = "class")]
    jar: Option<PathBuf>,

    /// Startup class name.
    #[arg(value_name = "CLASS", required_unless_present = "jar")]
    class: Option<String>,

    /// Arguments passed to main(String[]).
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    args: Vec<String>,

    /// Heap limit in megabytes.
    #[arg(long = "heap-mb", default_value_t = 64)]
    heap_mb: usize,

    /// Timeslice in milliseconds.
    #[arg(long = "timeslice-ms", default_value_t = 10)]
    timeslice_ms: u64,

    /// More diagnostic output (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Errors only.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn level_of(args: &Args) -> LevelFilter {
    if args.quiet {
        LevelFilter::Error
    } else {
        match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn classpath_entries(args: &Args) -> Vec<PathBuf> {
    let joined = args
        .classpath
        .clone()
        .or_else(|| std::env::var("CLASSPATH").ok())
        .unwrap_or_else(|| ".".into());
    let mut entries: Vec<PathBuf> = joined
        .split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if let Some(jar) = &args.jar {
        entries.insert(0, jar.clone());
    }
    entries
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(level_of(&args))
        .init();

    let startup_class = match (&args.class, &args.jar) {
        (Some(class), _) => class.clone(),
        (None, Some(jar)) => match lungo::classpath::jar_main_class(jar) {
            Ok(main) => main,
            Err(e) => {
                error!("{e}");
                std::process::exit(ExitCategory::Argument as i32);
            }
        },
        (None, None) => unreachable!("clap enforces CLASS or --jar"),
    };

    let config = JvmConfig {
        classpath: classpath_entries(&args),
        heap_limit: args.heap_mb << 20,
        timeslice: Duration::from_millis(args.timeslice_ms.max(1)),
        ..JvmConfig::default()
    };

    let mut ctx = match JvmContext::init(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{e}");
            std::process::exit(e.category() as i32);
        }
    };

    // SIGHUP/SIGINT/SIGTERM request orderly shutdown through the same
    // flag System.exit uses
    let shutdown = ctx.shutdown_flag();
    for signal in [
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, shutdown.clone()) {
            error!("cannot trap signal {signal}: {e}");
        }
    }

    let code = ctx.run_main(&startup_class, &args.args);
    let interrupted = ctx.shutdown_requested() && ctx.user_exit.is_none();
    ctx.teardown();

    if interrupted && code == ExitCategory::Okay as i32 {
        info!("terminated by signal");
        std::process::exit(ExitCategory::Signal as i32);
    }
    std::process::exit(code);
}
