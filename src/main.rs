use std::collections::HashMap;
use std::fs;
use std::process;

use clap::Parser;

use tomasulo_sim::cpu::{load_sim_config, SimConfig, Simulator, Trace};
use tomasulo_sim::Snapshot;

#[derive(Parser, Debug)]
#[command(
    name = "tomasulo-sim",
    version,
    about = "Cycle-accurate Tomasulo out-of-order simulator",
    long_about = "Simulates a small out-of-order core (reservation stations, reorder \
buffer, register renaming, common data bus) one cycle at a time and reports \
per-instruction pipeline timing.\n\nExamples:\n  tomasulo-sim program.asm\n  \
tomasulo-sim program.asm --memory mem.json --verbose\n  tomasulo-sim program.asm --json"
)]
struct Cli {
    /// Assembly program to simulate.
    file: String,

    /// Simulator configuration (YAML).
    #[arg(short, long)]
    config: Option<String>,

    /// Memory initialization file: a JSON object mapping address to value.
    #[arg(short, long)]
    memory: Option<String>,

    /// Stop after this many cycles even if the program has not finished.
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Dump the final snapshot as JSON instead of the text report.
    #[arg(long)]
    json: bool,

    /// Print a trace line for every pipeline event.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_sim_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error reading config {}: {}", path, err);
                process::exit(1);
            }
        },
        None => SimConfig::default(),
    };
    if cli.verbose {
        config.trace = Trace::all();
    }
    if let Some(max_cycles) = cli.max_cycles {
        config.max_cycles = max_cycles;
    }

    let source = fs::read_to_string(&cli.file).unwrap_or_else(|err| {
        eprintln!("Error reading {}: {}", cli.file, err);
        process::exit(1);
    });

    let max_cycles = config.max_cycles;
    let mut sim = Simulator::new(config);
    if let Err(err) = sim.load_program(&source) {
        eprintln!("{}: program failed to load", cli.file);
        eprintln!("{}", err);
        process::exit(1);
    }

    if let Some(path) = &cli.memory {
        let entries = read_memory_file(path);
        if let Err(err) = sim.initialize_memory(&entries) {
            eprintln!("Error initializing memory from {}: {}", path, err);
            process::exit(1);
        }
    }

    while !sim.is_complete() && sim.cycle() < max_cycles {
        sim.step_cycle();
    }

    let snapshot = sim.snapshot();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot).unwrap());
        return;
    }

    if !snapshot.complete {
        println!("Stopped after {} cycles without completing", snapshot.cycle);
    }
    print_timing_table(&snapshot);
    print_final_state(&snapshot);
}

fn read_memory_file(path: &str) -> Vec<(i64, i64)> {
    let text = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Error reading {}: {}", path, err);
        process::exit(1);
    });
    let map: HashMap<String, i64> = serde_json::from_str(&text).unwrap_or_else(|err| {
        eprintln!("Error parsing {}: {}", path, err);
        process::exit(1);
    });

    let mut entries = Vec::with_capacity(map.len());
    for (address, value) in map {
        let address = address.trim().parse::<i64>().unwrap_or_else(|_| {
            eprintln!("Error parsing {}: '{}' is not a memory address", path, address);
            process::exit(1);
        });
        entries.push((address, value));
    }
    entries.sort_unstable();
    entries
}

fn print_timing_table(snapshot: &Snapshot) {
    let cell = |stage: Option<u64>| stage.map_or_else(|| "-".to_string(), |c| c.to_string());

    println!();
    println!(
        "{:<4} {:<24} {:>6} {:>6} {:>7} {:>6} {:>7}",
        "ID", "Instruction", "Issue", "Exec", "Finish", "Write", "Commit"
    );
    for instr in &snapshot.instructions {
        println!(
            "{:<4} {:<24} {:>6} {:>6} {:>7} {:>6} {:>7}",
            instr.id,
            instr.text,
            cell(instr.timing.issue),
            cell(instr.timing.start_exec),
            cell(instr.timing.finish_exec),
            cell(instr.timing.write),
            cell(instr.timing.commit),
        );
    }
}

fn print_final_state(snapshot: &Snapshot) {
    println!("\nRegisters:");
    for (reg, value) in snapshot.registers.iter().enumerate() {
        println!("  R{} = {}", reg, value);
    }

    println!("\nMemory:");
    if snapshot.memory.is_empty() {
        println!("  (empty)");
    }
    for cell in &snapshot.memory {
        println!("  [{}] = {}", cell.address, cell.value);
    }

    println!("\nCycles: {}", snapshot.cycle);
}
