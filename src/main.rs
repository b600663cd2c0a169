use clap::{Parser, Subcommand, ValueEnum};
use iced_x86::{Formatter, Instruction, IntelFormatter, Register};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use scalarize::config::ConfigError;
use scalarize::recover::RecoveryOutcome;
use scalarize::sim::{Simulator, Stop};
use scalarize::{
    EncodedUnit, ExpandConfig, Family, InstructionDescriptor, MachineContext, Phase,
    RestoreStateQuery, ScatterGather, TlsSlotAllocator, Unit,
};

/// Where expanded units are placed.
const CACHE_PC: u64 = 0x7000_0000;
/// Thread-local block in the simulator.
const TLS_BASE: u64 = 0x9000_0000;
/// Scratch spill slot in the simulator.
const SLOT_ADDR: u64 = 0x9100_0000;
/// Memory the base register points at in the simulator.
const DATA_ADDR: u64 = 0x20_0000;
const DATA_SIZE: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

/// Print `value` as JSON, or through `text` for the text format.
fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> Result<(), String> {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "scalarize")]
#[command(about = "Scalar expansion of x86 scatter/gather instructions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a scatter/gather and print the scalar sequence
    Expand {
        /// Instruction bytes in hex (e.g. c4e26d900488)
        hex: String,

        /// Application address of the instruction
        #[arg(long, default_value = "0x400000", value_parser = parse_u64)]
        app_pc: u64,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(long, value_enum, default_value = "text")]
        format: FormatArg,

        /// Log the expanded sequence
        #[arg(long)]
        trace: bool,
    },
    /// Run the expansion in the simulator, fault at an instruction and recover
    Fault {
        /// Instruction bytes in hex
        hex: String,

        /// Active lanes, one bit per lane
        #[arg(long, default_value = "0xffff", value_parser = parse_u64)]
        mask: u64,

        /// Index of the expanded instruction to fault at
        #[arg(long)]
        fault_at: usize,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(long, value_enum, default_value = "text")]
        format: FormatArg,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("expected an even number of hex digits, got '{}'", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("invalid hex byte '{}': {}", &digits[i..i + 2], e))
        })
        .collect()
}

fn load_config(path: Option<&PathBuf>) -> Result<ExpandConfig, ConfigError> {
    match path {
        Some(path) => ExpandConfig::load(path),
        None => Ok(ExpandConfig::default()),
    }
}

fn init_logging(trace: bool) {
    let default = if trace { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn format_instruction(formatter: &mut IntelFormatter, instr: &Instruction) -> String {
    let mut text = String::new();
    formatter.format(instr, &mut text);
    text
}

#[derive(Serialize)]
struct ListingLine {
    pc: String,
    bytes: String,
    text: String,
}

#[derive(Serialize)]
struct Listing {
    app_pc: String,
    start_pc: String,
    lanes: u32,
    size: usize,
    instructions: Vec<ListingLine>,
}

fn listing(encoded: &EncodedUnit, app_pc: u64, lanes: u32) -> Listing {
    let mut formatter = IntelFormatter::new();
    let instructions = encoded
        .instructions()
        .iter()
        .map(|instr| {
            let offset = (instr.ip() - encoded.start_pc) as usize;
            let bytes = &encoded.code[offset..offset + instr.len()];
            ListingLine {
                pc: format!("{:#x}", instr.ip()),
                bytes: bytes.iter().map(|b| format!("{:02x}", b)).collect(),
                text: format_instruction(&mut formatter, instr),
            }
        })
        .collect();
    Listing {
        app_pc: format!("{:#x}", app_pc),
        start_pc: format!("{:#x}", encoded.start_pc),
        lanes,
        size: encoded.code.len(),
        instructions,
    }
}

/// Decode, expand and encode one instruction.
fn expand(
    sg: &ScatterGather,
    bytes: &[u8],
    app_pc: u64,
) -> Result<(EncodedUnit, u32), String> {
    let bitness = sg.config().bitness;
    let mut unit = Unit::decode(bitness, app_pc, bytes).map_err(|e| e.to_string())?;
    let mut alloc = TlsSlotAllocator::with_defaults(bitness);
    let expansion = sg
        .expand_unit(&mut unit, Phase::AppToApp, &mut alloc)
        .map_err(|e| e.to_string())?;
    let lanes = match expansion {
        scalarize::Expansion::Expanded { lanes } => lanes,
        scalarize::Expansion::NotApplicable => {
            return Err("not a scatter or gather instruction".to_string());
        }
    };
    alloc.finish().map_err(|e| e.to_string())?;
    let encoded = unit.encode(CACHE_PC).map_err(|e| e.to_string())?;
    Ok((encoded, lanes))
}

/// Active lanes as a bitmap.
fn lane_mask(ctx: &MachineContext, desc: &InstructionDescriptor) -> u64 {
    match desc.family {
        Family::Wide => ctx.opmask(desc.mask),
        Family::Narrow => (0..desc.lane_count())
            .filter(|&lane| {
                ctx.vector_element(desc.mask, lane, desc.value_width) >> (desc.value_width * 8 - 1)
                    != 0
            })
            .fold(0, |acc, lane| acc | 1 << lane),
    }
}

/// Simulator state for a scatter/gather over a small data region.
fn prepare(sg: &ScatterGather, desc: &InstructionDescriptor, mask: u64) -> Simulator {
    let config = sg.config();
    let mut sim = Simulator::new(config.bitness);
    sim.mem.map(TLS_BASE, 0x1000);
    sim.mem.map(SLOT_ADDR, 64);
    sim.mem.map(DATA_ADDR, DATA_SIZE);
    match config.bitness {
        scalarize::Bitness::B64 => sim.gs_base = TLS_BASE,
        scalarize::Bitness::B32 => sim.fs_base = TLS_BASE,
    }
    let slot_ptr = TLS_BASE + config.tls_spill_slot_offset as u64;
    let _ = sim
        .mem
        .write_uint(slot_ptr, config.bitness.gpr_bytes(), SLOT_ADDR);

    for i in 0..DATA_SIZE / 4 {
        let _ = sim.mem.write_uint(DATA_ADDR + i * 4, 4, 0x1000_0000 + i);
    }
    if desc.base != Register::None {
        sim.ctx.set_gpr(desc.base, DATA_ADDR);
    }
    for lane in 0..desc.lane_count() {
        sim.ctx
            .set_vector_element(desc.index, lane, desc.index_width, (lane * 2) as u64);
        sim.ctx
            .set_vector_element(desc.data, lane, desc.value_width, 0xEE00 + lane as u64);
    }
    match desc.family {
        Family::Wide => sim.ctx.set_opmask(desc.mask, mask),
        Family::Narrow => {
            for lane in 0..desc.lane_count() {
                let active = if mask >> lane & 1 == 1 { u64::MAX } else { 0 };
                sim.ctx
                    .set_vector_element(desc.mask, lane, desc.value_width, active);
            }
        }
    }
    sim
}

#[derive(Serialize)]
struct FaultReport {
    fault_pc: String,
    instruction: String,
    outcome: String,
    raw_mask: String,
    recovered_mask: String,
    scratch_restored: bool,
}

fn fault(
    config: ExpandConfig,
    bytes: &[u8],
    mask: u64,
    fault_at: usize,
) -> Result<FaultReport, String> {
    let app_pc = 0x40_0000;
    let sg = ScatterGather::new(config);
    let (encoded, _) = expand(&sg, bytes, app_pc)?;
    let app = Unit::decode(sg.config().bitness, app_pc, bytes).map_err(|e| e.to_string())?;
    let app_instr = app
        .nodes()
        .first()
        .and_then(|node| node.instruction())
        .copied()
        .ok_or("empty input")?;
    let desc = InstructionDescriptor::extract(&app_instr, sg.config().bitness)
        .map_err(|e| e.to_string())?;

    let instructions = encoded.instructions();
    let target = instructions.get(fault_at).ok_or_else(|| {
        format!(
            "--fault-at {} out of range ({} instructions)",
            fault_at,
            instructions.len()
        )
    })?;

    let mut sim = prepare(&sg, &desc, mask);
    let stop = sim
        .run(&encoded.code, encoded.start_pc, Some(target.ip()))
        .map_err(|e| e.to_string())?;
    if stop == Stop::Finished {
        return Err(format!(
            "instruction {} at {:#x} was never executed",
            fault_at,
            target.ip()
        ));
    }

    let mut thread = sg.thread_init();
    let mut slot = [0u8; 64];
    sim.mem
        .read(SLOT_ADDR, &mut slot)
        .map_err(|at| format!("spill slot unmapped at {:#x}", at))?;
    thread.bytes_mut().copy_from_slice(&slot);

    let raw = sim.ctx.clone();
    let mut translated = raw.clone();
    let query = RestoreStateQuery {
        cache_start_pc: Some(encoded.start_pc),
        code: &encoded.code,
        app_pc,
        app_code: bytes,
        app_code_consistent: true,
        raw: &raw,
    };
    let outcome = sg.try_recover(&thread, &query, &mut translated);
    sg.thread_exit(thread);

    let mut formatter = IntelFormatter::new();
    Ok(FaultReport {
        fault_pc: format!("{:#x}", target.ip()),
        instruction: format_instruction(&mut formatter, target),
        outcome: format!("{:?}", outcome),
        raw_mask: format!("{:#b}", lane_mask(&raw, &desc)),
        recovered_mask: format!("{:#b}", lane_mask(&translated, &desc)),
        scratch_restored: matches!(
            outcome,
            RecoveryOutcome::Restored(r) if r.restored_scratch.is_some()
        ),
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Expand {
            hex,
            app_pc,
            config,
            format,
            trace,
        } => {
            init_logging(trace);
            let mut config = match load_config(config.as_ref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            config.trace |= trace;
            let bytes = match parse_hex(&hex) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let sg = ScatterGather::new(config);
            let (encoded, lanes) = match expand(&sg, &bytes, app_pc) {
                Ok(result) => result,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let listing = listing(&encoded, app_pc, lanes);
            let printed = emit(format.into(), &listing, |listing| {
                println!(
                    "; {} lanes, {} bytes at {}",
                    listing.lanes, listing.size, listing.start_pc
                );
                for line in &listing.instructions {
                    println!("{:>12}  {:<28} {}", line.pc, line.bytes, line.text);
                }
            });
            if let Err(e) = printed {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Fault {
            hex,
            mask,
            fault_at,
            config,
            format,
        } => {
            init_logging(false);
            let config = match load_config(config.as_ref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            let report = parse_hex(&hex).and_then(|bytes| fault(config, &bytes, mask, fault_at));
            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let printed = emit(format.into(), &report, |report| {
                println!("fault at {}: {}", report.fault_pc, report.instruction);
                println!("outcome:        {}", report.outcome);
                println!("raw mask:       {}", report.raw_mask);
                println!("recovered mask: {}", report.recovered_mask);
                println!("scratch restored: {}", report.scratch_restored);
            });
            if let Err(e) = printed {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
