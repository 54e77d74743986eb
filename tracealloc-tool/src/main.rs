use std::path::PathBuf;

use clap::Parser;
use tracealloc::{
    checker::check,
    target::{Arm32, TargetProfile, X64},
    trace::Trace,
    Options, Output, Pos, ProgPoint,
};

#[derive(Parser)]
/// Tool for testing tracealloc.
struct Args {
    /// Print the input trace and the result of register allocation.
    #[clap(short = 'v')]
    verbose: bool,

    /// Input file containing a bincode-encoded Trace.
    input: PathBuf,

    /// Which target to allocate for.
    #[clap(long, value_enum, default_value = "x64")]
    target: CliTarget,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliTarget {
    X64,
    Arm32,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let trace: Trace = bincode::deserialize(&input).expect("could not deserialize input file");

    if args.verbose {
        println!("Input trace: {trace:?}");
    }

    let target: &dyn TargetProfile = match args.target {
        CliTarget::X64 => &X64,
        CliTarget::Arm32 => &Arm32,
    };
    let options = Options {
        verbose_log: true,
        check_invariants: true,
    };
    let output = match tracealloc::run(&trace, target, options) {
        Ok(output) => output,
        Err(e) => {
            panic!("Register allocation failed: {e:#?}");
        }
    };

    if args.verbose {
        print_output(&trace, &output);
    }

    if let Err(e) = check(&trace, target.env(), &output) {
        panic!("Register allocation checker failed: {:#?}", e.errors());
    }
}

fn print_output(trace: &Trace, output: &Output) {
    print!("Register allocation result: {{\n");
    print!("  inputs: {:?}\n", output.input_locations);
    for (i, op) in trace.ops.iter().enumerate() {
        let pos = Pos::new(i);
        for edit in output.edits_at(ProgPoint::before(pos)) {
            print!("    edit: {edit}\n");
        }
        let allocs = output.op_allocs(pos);
        let args: Vec<_> = op
            .args
            .iter()
            .zip(&allocs.args)
            .map(|(arg, loc)| format!("{arg:?} => {loc}"))
            .collect();
        let args = args.join(", ");
        match allocs.result {
            Some(result) => print!("  op{i}: {:?} {args} -> {result}\n", op.kind),
            None => print!("  op{i}: {:?} {args}\n", op.kind),
        }
        for edit in output.edits_at(ProgPoint::after(pos)) {
            print!("    edit: {edit}\n");
        }
        if let Some(id) = allocs.guard {
            print!("    guard: {:?}\n", output.guards[id]);
        }
    }
    print!(
        "  frame depth: {}, pool: {} bytes, stats: {:?}\n",
        output.frame_depth,
        output.pool_size(),
        output.stats
    );
    print!("}}\n");
}
