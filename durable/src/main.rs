use clap::{Parser as ClapParser, Subcommand};
use env_logger::Env;
use std::{
    process,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use durable::{
    DurableError, FrameRunner, Instance, ManualHost, ObjectHandle, Operand, Persistence, PrimitiveKind,
    Result, Runtime, RuntimeCreateInfo, ScaleConfig, Step, StepContext, TypeDescriptor, TypeRegistry, Value,
    storage::{BinaryOp, MemoryStore},
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name recorded in run space descriptors
    #[arg(long, default_value = "local")]
    node: String,

    /// Pool workers used after a resume; 0 drives everything on this thread
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Issue one statement per reactive slot read
    #[arg(long, help = "Disable combined reactive reads")]
    no_combine_reads: bool,

    /// Raise the log level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a linked list of lazy objects, contract it and read it back
    Lazy {
        #[arg(long, default_value_t = 8)]
        length: usize,
    },
    /// Run compound operations against reactive objects
    Reactive {
        #[arg(long, default_value_t = 10)]
        rounds: i64,
    },
    /// Suspend countdowns halfway and resume them in a second runtime
    Resume {
        #[arg(long, default_value_t = 4)]
        spaces: usize,
        #[arg(long, default_value_t = 6)]
        steps: i64,
    },
}

fn registry() -> TypeRegistry {
    let registry = TypeRegistry::new();
    registry.register(
        TypeDescriptor::new("Link", Persistence::Lazy)
            .slot("value", PrimitiveKind::Int)
            .typed_slot("next", PrimitiveKind::Object, "Link"),
    );
    registry.register(
        TypeDescriptor::new("Account", Persistence::Reactive)
            .slot("balance", PrimitiveKind::Int)
            .slot("deposits", PrimitiveKind::Int),
    );
    registry.register(
        TypeDescriptor::new("Countdown", Persistence::Lazy)
            .slot("remaining", PrimitiveKind::Int)
            .typed_slot("tally", PrimitiveKind::Object, "Account")
            .frame(),
    );
    registry
}

/// Decrements `remaining` once per slice and counts every step on the
/// tally account. Returns the number of steps taken.
struct Countdown;

impl FrameRunner for Countdown {
    fn step(&self, ctx: &StepContext<'_>, frame: &Arc<Instance>) -> Result<Step> {
        let remaining = ctx.get(ctx.frame(), 0)?.as_int().unwrap_or(0);
        if remaining <= 0 {
            let taken = frame.frame().and_then(|f| f.pc).unwrap_or(0);
            return Ok(Step::Return(Value::Int(i64::from(taken))));
        }
        ctx.set(ctx.frame(), 0, Value::Int(remaining - 1))?;
        if let Some(tally) = ctx.get(ctx.frame(), 1)?.as_object() {
            ctx.runtime().increment(tally, 1, Value::Int(1), Some(ctx.frame_id()))?;
        }
        frame.update_frame(|f| f.pc = Some(f.pc.unwrap_or(0) + 1));
        Ok(Step::Yield)
    }
}

fn runtime_info(cli: &Cli) -> RuntimeCreateInfo {
    RuntimeCreateInfo {
        node: cli.node.clone(),
        scale: ScaleConfig {
            max_pool_workers: cli.workers,
            ..ScaleConfig::default()
        },
        combine_reads: !cli.no_combine_reads,
        ..RuntimeCreateInfo::default()
    }
}

fn run_lazy(cli: &Cli, store: &MemoryStore, length: usize) -> Result<()> {
    let runtime = Runtime::builder(Arc::new(store.clone()), registry())
        .info(runtime_info(cli))
        .build();

    let mut head: Option<ObjectHandle> = None;
    for value in (0..length as i64).rev() {
        let link = runtime.create("Link", None)?;
        runtime.set_slot(&link, 0, Value::Int(value), None)?;
        if let Some(next) = head.take() {
            runtime.set_slot(&link, 1, Value::Object(next), None)?;
        }
        head = Some(link);
    }
    let Some(head) = head else {
        println!("empty list");
        return Ok(());
    };
    let head_ref = runtime.persist(&head)?;
    drop(head);

    let report = runtime.save_point()?;
    println!(
        "save point: {} flushed, {} contracted, {} evicted",
        report.flushed, report.contracted, report.evicted
    );

    let before = store.stats();
    let mut cursor = Some(runtime.resolve(&head_ref)?);
    let mut values = Vec::new();
    while let Some(link) = cursor {
        values.push(runtime.get_slot(&link, 0, None)?);
        cursor = runtime.get_slot(&link, 1, None)?.as_object().cloned();
    }
    let after = store.stats();
    println!("read back {values:?} with {} row reads", after.reads - before.reads);
    Ok(())
}

fn run_reactive(cli: &Cli, store: &MemoryStore, rounds: i64) -> Result<()> {
    let runtime = Runtime::builder(Arc::new(store.clone()), registry())
        .info(runtime_info(cli))
        .build();
    let source = runtime.create("Account", None)?;
    let target = runtime.create("Account", None)?;
    runtime.set_slot(&source, 0, Value::Int(rounds * 10), None)?;

    let before = store.stats();
    for _ in 0..rounds {
        runtime.binary(
            &source,
            0,
            Operand::slot(&source, 0),
            BinaryOp::Sub,
            Operand::from(10_i64),
            None,
        )?;
        runtime.binary(
            &target,
            0,
            Operand::slot(&target, 0),
            BinaryOp::Add,
            Operand::from(10_i64),
            None,
        )?;
        runtime.increment(&target, 1, Value::Int(1), None)?;
    }
    let after = store.stats();

    let balances = runtime.reactive().get_many(&target, &[0, 1], None)?;
    println!(
        "source {:?}, target {:?} after {} statements",
        runtime.get_slot(&source, 0, None)?,
        balances,
        after.statements - before.statements
    );
    Ok(())
}

fn run_resume(cli: &Cli, store: &MemoryStore, spaces: usize, steps: i64) -> Result<()> {
    let host = Arc::new(ManualHost::new());
    let first = Runtime::builder(Arc::new(store.clone()), registry())
        .info(RuntimeCreateInfo {
            node: format!("{}-before", cli.node),
            ..runtime_info(cli)
        })
        .runner(Arc::new(Countdown))
        .host(host.clone())
        .build();

    let tally = first.create("Account", None)?;
    for i in 0..spaces {
        let frame = first.create("Countdown", None)?;
        first.set_slot(&frame, 0, Value::Int(steps), None)?;
        first.set_slot(&frame, 1, Value::Object(tally.clone()), None)?;
        first.spawn(&format!("countdown-{i}"), frame)?;
    }
    // Roughly half of the work happens before the suspend.
    let half = spaces * (steps as usize) / 2;
    for _ in 0..half {
        if !first.run_next(&host) {
            break;
        }
    }
    let tally_ref = first.persist(&tally)?;
    let suspended = first.suspend_all()?;
    println!("suspended {} run spaces", suspended.len());
    drop(first);

    let builder = Runtime::builder(Arc::new(store.clone()), registry())
        .info(runtime_info(cli))
        .runner(Arc::new(Countdown));
    let (second, report) = if cli.workers > 0 {
        let (runtime, scheduler) = builder.build_with_scheduler();
        let report = runtime.resume_stored()?;
        let deadline = Instant::now() + Duration::from_secs(10);
        while report.spaces.iter().any(|s| !s.is_done()) && Instant::now() < deadline {
            scheduler.run_main_once();
            thread::sleep(Duration::from_millis(1));
        }
        scheduler.shutdown();
        (runtime, report)
    } else {
        let host = Arc::new(ManualHost::new());
        let runtime = builder.host(host.clone()).build();
        let report = runtime.resume_stored()?;
        runtime.run_pending(&host);
        (runtime, report)
    };

    for (id, err) in &report.failures {
        eprintln!("{id} did not resume: {err}");
    }
    for space in &report.spaces {
        println!("{} {} -> {:?}", space.id(), space.name(), space.result());
    }
    let tally = second.resolve(&tally_ref)?;
    println!("tally counted {:?} steps", second.get_slot(&tally, 1, None)?);
    if report.is_clean() {
        Ok(())
    } else {
        Err(DurableError::Codec(format!("{} run spaces failed to resume", report.failures.len())))
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let store = MemoryStore::new();
    let outcome = match &cli.command {
        Command::Lazy { length } => run_lazy(&cli, &store, *length),
        Command::Reactive { rounds } => run_reactive(&cli, &store, *rounds),
        Command::Resume { spaces, steps } => run_resume(&cli, &store, *spaces, *steps),
    };
    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        process::exit(1);
    }
    let stats = store.stats();
    println!(
        "store: {} statements ({} reads, {} writes)",
        stats.statements, stats.reads, stats.writes
    );
}
