use clap::{Parser, Subcommand, ValueEnum};
use curry_jit::config::{Config, OutputFormat};
use curry_jit::jit::memory::page_size;
use curry_jit::jit::plan::{FrameLayout, Plan};
use curry_jit::jit::thunk::{self, Bindings};
use curry_jit::jit::trampoline;
use curry_jit::{MAX_ARGS, curry};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Human,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Human => OutputFormat::Human,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "curry-jit")]
#[command(about = "Inspect and exercise curried x86-64 thunks", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./curry-jit.toml if present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Trace thunk construction on stderr
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the instruction plan for a pair of argument counts
    Plan {
        /// Number of captured arguments
        #[arg(long)]
        now: usize,

        /// Number of arguments supplied when the thunk is called
        #[arg(long)]
        later: usize,

        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Synthesize a thunk and dump its machine code
    Dump {
        /// Captured argument values (comma separated, 0x for hex)
        #[arg(long, value_delimiter = ',', value_parser = parse_word)]
        now: Vec<u64>,

        /// Number of arguments supplied when the thunk is called
        #[arg(long, default_value = "0")]
        later: usize,

        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Bytes per line of the hex dump
        #[arg(long)]
        bytes_per_line: Option<usize>,

        /// Omit the instruction plan
        #[arg(long)]
        no_plan: bool,
    },
    /// Curry a built-in 16-argument function, call it, and compare against
    /// a direct call (missing trailing arguments are zero)
    Run {
        /// Captured argument values
        #[arg(long, value_delimiter = ',', value_parser = parse_word)]
        now: Vec<u64>,

        /// Argument values supplied at call time
        #[arg(long, value_delimiter = ',', value_parser = parse_word)]
        later: Vec<u64>,
    },
}

#[derive(Serialize)]
struct PlanReport {
    nargs_now: usize,
    nargs_later: usize,
    nargs_total: usize,
    frame: String,
    estimate: usize,
    ops: Vec<String>,
}

impl PlanReport {
    fn new(plan: &Plan) -> Self {
        let frame = match plan.frame() {
            FrameLayout::Aligned => "aligned".to_string(),
            FrameLayout::Overflow { slots, bytes } => {
                format!("overflow ({slots} slots, {bytes} bytes)")
            }
        };
        Self {
            nargs_now: plan.nargs_now(),
            nargs_later: plan.nargs_later(),
            nargs_total: plan.nargs_total(),
            frame,
            estimate: plan.estimate(),
            ops: plan.ops().iter().map(ToString::to_string).collect(),
        }
    }

    fn print_human(&self) {
        println!(
            "thunk (now = {}, later = {}, total = {}): {} ops, frame {}, estimate {} bytes",
            self.nargs_now,
            self.nargs_later,
            self.nargs_total,
            self.ops.len(),
            self.frame,
            self.estimate
        );
        for op in &self.ops {
            println!("    {op}");
        }
    }
}

#[derive(Serialize)]
struct DumpReport {
    plan: PlanReport,
    code_len: usize,
    code: String,
}

/// Parse a 64-bit word: decimal, negative decimal, or 0x-prefixed hex.
fn parse_word(s: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16).map_err(|e| e.to_string())
    } else if s.starts_with('-') {
        s.parse::<i64>().map(|n| n as u64).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    };
    parsed.map_err(|e| format!("invalid word '{s}': {e}"))
}

fn check_counts(now: usize, later: usize) -> Result<(), String> {
    if now > MAX_ARGS || later > MAX_ARGS {
        return Err(format!(
            "at most {MAX_ARGS} now-args and {MAX_ARGS} later-args are supported"
        ));
    }
    Ok(())
}

fn hex_dump(code: &[u8], bytes_per_line: usize) -> String {
    code.chunks(bytes_per_line)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            format!("{:04x}: {}", i * bytes_per_line, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

#[rustfmt::skip]
extern "C" fn mix16(
    a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64,
    a8: u64, a9: u64, a10: u64, a11: u64, a12: u64, a13: u64, a14: u64, a15: u64,
) -> u64 {
    [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15]
        .iter()
        .fold(0u64, |acc, &x| acc.wrapping_mul(31).wrapping_add(x))
}

const MIX_ARITY: usize = 16;

fn cmd_plan(now: usize, later: usize, format: OutputFormat) -> Result<(), String> {
    check_counts(now, later)?;
    let report = PlanReport::new(&Plan::new(now, later));
    match format {
        OutputFormat::Human => report.print_human(),
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(())
}

fn cmd_dump(now: &[u64], later: usize, config: &Config) -> Result<(), String> {
    check_counts(now.len(), later)?;
    let plan = Plan::new(now.len(), later);
    let page = page_size();
    let bindings = Bindings {
        now_args: now,
        target: mix16 as *const () as usize as u64,
        trampoline: trampoline::address(),
        // The real base is only known once the region is mapped
        region_base: 0,
        region_size: (plan.estimate().div_ceil(page) * page) as u64,
        unmap: thunk::unmap_address(),
    };
    let code = thunk::synthesize(&plan, &bindings).into_code();
    let dump = &config.dump;

    match dump.format {
        OutputFormat::Human => {
            if dump.show_plan {
                PlanReport::new(&plan).print_human();
                println!();
            }
            println!("{} bytes:", code.len());
            println!("{}", hex_dump(&code, dump.bytes_per_line));
        }
        OutputFormat::Json => print_json(&DumpReport {
            plan: PlanReport::new(&plan),
            code_len: code.len(),
            code: code.iter().map(|b| format!("{b:02x}")).collect(),
        })?,
    }
    Ok(())
}

fn cmd_run(now: &[u64], later: &[u64]) -> Result<(), String> {
    if now.len() + later.len() > MIX_ARITY {
        return Err(format!("the built-in target takes {MIX_ARITY} arguments"));
    }
    let mut padded = later.to_vec();
    padded.resize(MIX_ARITY - now.len(), 0);

    let curried = unsafe { curry(mix16 as *const (), padded.len(), now) }
        .map_err(|e| format!("curry failed: {e}"))?;
    let kind = if curried.is_thunk() { "thunk" } else { "identity" };
    let result = curried.call(&padded);

    let all: Vec<u64> = now.iter().chain(&padded).copied().collect();
    let direct = unsafe { thunk::invoke(mix16 as *const (), &all) };

    println!("curried ({kind}): {result:#018x}");
    println!("direct:          {direct:#018x}");
    if result != direct {
        return Err("curried result differs from direct call".to_string());
    }
    Ok(())
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("curry_jit=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Config::load(path),
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            Config::discover(&cwd)
        }
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.trace || config.trace);

    let result = match cli.command {
        Commands::Plan { now, later, format } => {
            let format = format.map(Into::into).unwrap_or(config.dump.format);
            cmd_plan(now, later, format)
        }
        Commands::Dump {
            now,
            later,
            format,
            bytes_per_line,
            no_plan,
        } => {
            if let Some(format) = format {
                config.dump.format = format.into();
            }
            if let Some(n) = bytes_per_line.filter(|&n| n > 0) {
                config.dump.bytes_per_line = n;
            }
            if no_plan {
                config.dump.show_plan = false;
            }
            cmd_dump(&now, later, &config)
        }
        Commands::Run { now, later } => cmd_run(&now, &later),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
