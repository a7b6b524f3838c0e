//! dgpu runtime CLI
//!
//! Main entry point for the `dgpu` command: device listing, module
//! inspection and assembly, and one-shot kernel runs on the host backend.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Serialize;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use dgpu_runtime::backend::default_backend;
use dgpu_runtime::config::{self, LOG_CALLS_VAR, LOG_FILTER_VAR, RuntimeConfig};
use dgpu_runtime::ir::{GpuModule, GpuType, verify};
use dgpu_runtime::{AllocType, KernelArg, Stream};

#[derive(Parser)]
#[command(name = "dgpu")]
#[command(author = "Demetrios Chiuratto Agourakis, Dionisio Chiuratto Agourakis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "GPU kernel runtime tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available devices and their selectors
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the kernels of a module binary
    Inspect {
        /// Module binary
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wrap a JSON module into a loadable binary
    Assemble {
        /// JSON-encoded module
        #[arg(value_name = "JSON")]
        input: PathBuf,

        /// Output binary
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Launch one kernel and print its buffers
    Run {
        /// Module binary
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Kernel name
        #[arg(short, long)]
        kernel: String,

        /// Device selector
        #[arg(short, long, default_value = "")]
        device: String,

        /// Grid size in blocks (X[,Y[,Z]])
        #[arg(long, default_value = "1", value_parser = parse_dims)]
        grid: [usize; 3],

        /// Block size in threads (X[,Y[,Z]])
        #[arg(long, default_value = "1", value_parser = parse_dims)]
        block: [usize; 3],

        /// Kernel argument: i32:5, f64:0.5, bool:true, buf:<elem>:<count>, local:<bytes>
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<ArgSpec>,
    },

    /// Show information about the runtime
    Info,
}

/// A `--arg` value
#[derive(Debug, Clone, PartialEq)]
enum ArgSpec {
    Scalar(KernelArg),
    /// Zeroed shared buffer, printed after the run
    Buffer { elem: GpuType, count: usize },
    Local(usize),
}

fn parse_dims(s: &str) -> std::result::Result<[usize; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(format!("expected 1 to 3 comma-separated sizes, got `{}`", s));
    }
    let mut dims = [1usize; 3];
    for (slot, part) in dims.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| format!("`{}` is not a size", part))?;
    }
    Ok(dims)
}

fn parse_elem(s: &str) -> Option<GpuType> {
    match s {
        "bool" => Some(GpuType::Bool),
        "i8" => Some(GpuType::I8),
        "i16" => Some(GpuType::I16),
        "i32" => Some(GpuType::I32),
        "i64" => Some(GpuType::I64),
        "f32" => Some(GpuType::F32),
        "f64" => Some(GpuType::F64),
        _ => None,
    }
}

fn parse_arg(s: &str) -> std::result::Result<ArgSpec, String> {
    let (kind, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <type>:<value>, got `{}`", s))?;
    let bad = |e: &dyn std::fmt::Display| format!("invalid {} value `{}`: {}", kind, value, e);

    let arg = match kind {
        "bool" => KernelArg::Bool(value.parse().map_err(|e| bad(&e))?),
        "i8" => KernelArg::Int8(value.parse().map_err(|e| bad(&e))?),
        "i16" => KernelArg::Int16(value.parse().map_err(|e| bad(&e))?),
        "i32" => KernelArg::Int32(value.parse().map_err(|e| bad(&e))?),
        "i64" => KernelArg::Int64(value.parse().map_err(|e| bad(&e))?),
        "f32" => KernelArg::Float32(value.parse().map_err(|e| bad(&e))?),
        "f64" => KernelArg::Float64(value.parse().map_err(|e| bad(&e))?),
        "local" => return Ok(ArgSpec::Local(value.parse().map_err(|e| bad(&e))?)),
        "buf" => {
            let (elem, count) = value
                .split_once(':')
                .ok_or_else(|| format!("expected buf:<elem>:<count>, got `{}`", s))?;
            let elem = parse_elem(elem).ok_or_else(|| format!("unknown element type `{}`", elem))?;
            let count = count.parse().map_err(|e| bad(&e))?;
            return Ok(ArgSpec::Buffer { elem, count });
        }
        other => return Err(format!("unknown argument type `{}`", other)),
    };
    Ok(ArgSpec::Scalar(arg))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        RuntimeConfig::global().log_filter.clone()
    };
    config::init_logging(&filter);

    match cli.command {
        Commands::Devices { json } => devices(json),
        Commands::Inspect { input, json } => inspect(&input, json),
        Commands::Assemble { input, output } => assemble(&input, &output),
        Commands::Run {
            input,
            kernel,
            device,
            grid,
            block,
            args,
        } => run(&input, &kernel, &device, grid, block, &args),
        Commands::Info => info(),
    }
}

fn devices(json: bool) -> Result<()> {
    let devices = default_backend().devices();
    if json {
        let out = serde_json::to_string_pretty(&devices).into_diagnostic()?;
        println!("{}", out);
        return Ok(());
    }

    for device in &devices {
        println!(
            "{:<12} {:<16} {:>6} MB  max block {:>5}  warp {:>2}",
            device.selector(),
            device.name,
            device.total_memory / (1024 * 1024),
            device.max_threads_per_block,
            device.warp_size
        );
    }
    Ok(())
}

fn read_module(input: &Path) -> Result<GpuModule> {
    let bytes = std::fs::read(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", input.display()))?;
    Ok(GpuModule::from_binary(&bytes)?)
}

#[derive(Serialize)]
struct KernelSummary {
    name: String,
    params: Vec<String>,
    blocks: usize,
    shared_bytes: u32,
    max_threads: Option<u32>,
}

fn inspect(input: &Path, json: bool) -> Result<()> {
    let module = read_module(input)?;
    let kernels: Vec<KernelSummary> = module
        .kernels
        .values()
        .map(|k| KernelSummary {
            name: k.name.clone(),
            params: k
                .params
                .iter()
                .map(|p| format!("{}: {}", p.name, p.ty))
                .collect(),
            blocks: k.blocks.len(),
            shared_bytes: k.shared_mem_size().unwrap_or_default(),
            max_threads: k.max_threads,
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&kernels).into_diagnostic()?;
        println!("{}", out);
        return Ok(());
    }

    println!("module {} ({} kernels)", module.name, kernels.len());
    for k in &kernels {
        println!("  {}({})", k.name, k.params.join(", "));
        println!(
            "    {} blocks, {} bytes shared{}",
            k.blocks,
            k.shared_bytes,
            k.max_threads
                .map(|m| format!(", max {} threads", m))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn assemble(input: &Path, output: &Path) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", input.display()))?;
    let module: GpuModule = serde_json::from_str(&text)
        .into_diagnostic()
        .wrap_err("Invalid module JSON")?;
    verify::verify_module(&module)?;

    let bytes = module.to_binary()?;
    std::fs::write(output, &bytes)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", output.display()))?;

    tracing::info!(kernels = module.kernels.len(), bytes = bytes.len(), "assembled module");
    println!("Wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

/// Buffer allocated for a `buf:` argument
struct RunBuffer {
    index: usize,
    ptr: *mut c_void,
    elem: GpuType,
    count: usize,
}

fn format_buffer(buffer: &RunBuffer) -> String {
    let base = buffer.ptr as *const u8;
    let size = buffer.elem.size_bytes() as usize;
    let values: Vec<String> = (0..buffer.count)
        .map(|i| {
            // Reads stay inside the allocation made for `count` elements
            let p = unsafe { base.add(i * size) };
            unsafe {
                match buffer.elem {
                    GpuType::Bool => (p.read() != 0).to_string(),
                    GpuType::I8 => p.cast::<i8>().read().to_string(),
                    GpuType::I16 => p.cast::<i16>().read_unaligned().to_string(),
                    GpuType::I32 => p.cast::<i32>().read_unaligned().to_string(),
                    GpuType::I64 => p.cast::<i64>().read_unaligned().to_string(),
                    GpuType::F32 => p.cast::<f32>().read_unaligned().to_string(),
                    GpuType::F64 => p.cast::<f64>().read_unaligned().to_string(),
                    GpuType::Ptr(_) => format!("{:#x}", p.cast::<usize>().read_unaligned()),
                }
            }
        })
        .collect();
    values.join(", ")
}

fn run(
    input: &Path,
    kernel_name: &str,
    device: &str,
    grid: [usize; 3],
    block: [usize; 3],
    specs: &[ArgSpec],
) -> Result<()> {
    let bytes = std::fs::read(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", input.display()))?;

    let stream = Stream::create(device)?;
    tracing::info!(device = %stream.device().selector(), "running on {}", stream.device().name);
    let module = stream.load_module(&bytes)?;
    let kernel = module.kernel(kernel_name)?;

    let mut buffers = Vec::new();
    let mut args = Vec::with_capacity(specs.len());
    let outcome = (|| -> Result<()> {
        for (index, spec) in specs.iter().enumerate() {
            let arg = match spec {
                ArgSpec::Scalar(arg) => *arg,
                ArgSpec::Local(size) => KernelArg::LocalMemory(*size),
                ArgSpec::Buffer { elem, count } => {
                    let size = count * elem.size_bytes() as usize;
                    let (ptr, event) =
                        unsafe { stream.alloc_buffer(size, 0, AllocType::Shared, &[])? };
                    unsafe { stream.destroy_event(event)? };
                    buffers.push(RunBuffer {
                        index,
                        ptr,
                        elem: *elem,
                        count: *count,
                    });
                    KernelArg::Pointer(ptr as usize)
                }
            };
            args.push(arg);
        }

        let event = unsafe { stream.launch(&kernel, grid, block, &[], args)? };
        let waited = unsafe { stream.wait_event(event) };
        unsafe { stream.destroy_event(event)? };
        waited?;

        for buffer in &buffers {
            println!("arg {}: [{}]", buffer.index, format_buffer(buffer));
        }
        Ok(())
    })();

    for buffer in &buffers {
        unsafe { stream.dealloc_buffer(buffer.ptr)? };
    }
    outcome
}

fn info() -> Result<()> {
    let config = RuntimeConfig::global();
    let backend = default_backend();

    println!("dgpu runtime");
    println!("Version: {}", dgpu_runtime::VERSION);
    println!();
    println!("Backend: {} ({} devices)", backend.name(), backend.devices().len());
    println!();
    println!("Environment:");
    println!(
        "  {} = {}",
        LOG_CALLS_VAR,
        if config.log_calls { "on" } else { "off" }
    );
    println!("  {} = {}", LOG_FILTER_VAR, config.log_filter);

    Ok(())
}
