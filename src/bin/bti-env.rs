use bti::Env;

fn main() {
    let num_cores = match Env::online_cores() {
        Some(n) => n.to_string(),
        None => "<unknown>".to_string(),
    };
    let smt = match Env::smt_enabled() {
        Ok(true) => "enabled".to_string(),
        Ok(false) => "disabled [!!]".to_string(),
        Err(e) => format!("<read error: {}>", e),
    };
    let aslr = match Env::aslr_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(e) => format!("<read error: {}>", e),
    };
    let mmap_min_addr = match Env::mmap_min_addr() {
        Ok(addr) => format!("{:#x}", addr),
        Err(e) => format!("<read error: {}>", e),
    };
    let spectre_v2 = match Env::spectre_v2_status() {
        Ok(s) => s,
        Err(e) => format!("<read error: {}>", e),
    };

    println!("[*] 'bti' environment summary:");
    println!("  {:<40}: {}", "online cores", num_cores);
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)", smt);
    println!("  {:<40}: {}", "address-space randomization", aslr);
    println!("  {:<40}: {}", "vm.mmap_min_addr", mmap_min_addr);
    println!("  {:<40}: {}", "spectre_v2", spectre_v2);
}
