use argh::FromArgs;
use std::{path::PathBuf, str::FromStr, time::Duration};

use qpu::blas::{
    emulator::sgemm_emulator, run_gemm_benchmark, BenchmarkConfig, DispatchError, DispatchOptions,
    QpuProgram,
};
use qpu::device::{Device, FakeDevice};

#[derive(Clone, Copy)]
enum Backend {
    Fake,
    Mailbox,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fake" => Ok(Self::Fake),
            "mailbox" => Ok(Self::Mailbox),
            other => Err(format!("unknown backend {other}, expected fake or mailbox")),
        }
    }
}

#[derive(FromArgs)]
/// Time a convolution-sized GEMM on the CPU and on the VideoCore QPUs
struct Args {
    /// device backend: mailbox for the VideoCore, fake for the host emulator
    #[argh(option, short = 'b', default = "Backend::Fake")]
    backend: Backend,

    /// path to the compiled QPU GEMM program
    #[argh(option, short = 'p')]
    program: Option<PathBuf>,

    /// rows of the input matrix
    #[argh(option, default = "3025")]
    input_height: usize,

    /// values per input row
    #[argh(option, default = "363")]
    input_channels: usize,

    /// rows of the weights matrix
    #[argh(option, default = "96")]
    output_channels: usize,

    /// number of QPUs to start
    #[argh(option, short = 'w', default = "12")]
    workers: u32,

    /// job timeout in milliseconds
    #[argh(option, default = "10000")]
    timeout_ms: u64,

    /// largest difference counted as agreement
    #[argh(option, default = "1e-6")]
    tolerance: f32,

    /// firmware allocation flags for the mailbox backend: 12 for the BCM2835, 4 for later SoCs
    #[argh(option, default = "0xc")]
    mem_flags: u32,

    /// fill the per-worker scratch with a sentinel and print it after the dispatch
    #[argh(switch)]
    debug_scratch: bool,

    /// render the three outputs with at most this many elements each
    #[argh(option)]
    print: Option<usize>,
}

fn run<D: Device>(
    device: &D,
    program: &QpuProgram,
    args: &Args,
) -> Result<bool, Box<dyn std::error::Error>> {
    let options = DispatchOptions::default()
        .with_worker_count(args.workers)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_debug_scratch(args.debug_scratch);
    let config = BenchmarkConfig {
        input_height: args.input_height,
        input_channels: args.input_channels,
        output_channels: args.output_channels,
        tolerance: args.tolerance,
        print_max_elements: args.print,
        ..Default::default()
    };

    let report = run_gemm_benchmark(device, program, &options, &config)?;

    match &report.dispatch {
        Ok(dispatch) if args.debug_scratch => eprint!("{}", dispatch.scratch_dump()),
        Err(DispatchError::Device(e)) if e.is_unavailable() => {
            log::error!("The QPUs are in use by another process or could not be enabled")
        }
        _ => {}
    }

    Ok(report.passed())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    let passed = match args.backend {
        Backend::Fake => {
            let program = match &args.program {
                Some(path) => QpuProgram::from_file(path, 32)?,
                None => QpuProgram::from_words("emulated-sgemm", &[0, 0x1000_0000], 32)?,
            };
            let device = FakeDevice::new().with_execution(sgemm_emulator());
            run(&device, &program, &args)?
        }
        Backend::Mailbox => {
            let Some(path) = &args.program else {
                return Err("the mailbox backend needs --program".into());
            };
            let program = QpuProgram::from_file(path, 32)?;
            run_on_mailbox(&program, &args)?
        }
    };

    if !passed {
        log::warn!("GEMM outputs disagree");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_on_mailbox(
    program: &QpuProgram,
    args: &Args,
) -> Result<bool, Box<dyn std::error::Error>> {
    use qpu::device::{Mailbox, MailboxConfig};

    let device = Mailbox::open(MailboxConfig::default().with_mem_flags(args.mem_flags))?;
    run(&device, program, args)
}

#[cfg(not(target_os = "linux"))]
fn run_on_mailbox(
    _program: &QpuProgram,
    _args: &Args,
) -> Result<bool, Box<dyn std::error::Error>> {
    Err("the mailbox backend is only available on Linux".into())
}
