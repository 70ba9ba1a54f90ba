//! Hex parsing, byte display and the state of the running process.

use std::io::Read;
use nix::sys::personality::{ self, Persona };
use std::num::ParseIntError;

/// Parse a hexadecimal number, with or without a leading `0x`.
pub fn parse_hex(s: &str) -> Result<usize, ParseIntError> {
    let s = s.trim();
    let digits = s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    usize::from_str_radix(digits, 16)
}

/// Printable-ASCII representation of a byte, or `?`.
pub fn printable(b: u8) -> char {
    if b > 31 && b < 127 { b as char } else { '?' }
}


/// Utilities for inspecting and controlling the state of the current
/// process.
pub struct Env;
impl Env {
    const MMAP_MIN_PATH: &'static str =
        "/proc/sys/vm/mmap_min_addr";
    const ASLR_PATH: &'static str =
        "/proc/sys/kernel/randomize_va_space";
    const SMT_PATH: &'static str =
        "/sys/devices/system/cpu/smt/control";
    const SPECTRE_V2_PATH: &'static str =
        "/sys/devices/system/cpu/vulnerabilities/spectre_v2";

    fn read_trimmed(path: &str) -> std::io::Result<String> {
        let mut f = std::fs::File::open(path)?;
        let mut res = String::new();
        f.read_to_string(&mut res)?;
        Ok(res.trim().to_string())
    }

    fn invalid(path: &str, res: &str) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData,
            format!("unexpected contents in {}: {:?}", path, res))
    }

    /// Return the minimum supported `mmap()` address.
    pub fn mmap_min_addr() -> std::io::Result<usize> {
        let res = Self::read_trimmed(Self::MMAP_MIN_PATH)?;
        res.parse().map_err(|_| Self::invalid(Self::MMAP_MIN_PATH, &res))
    }

    /// Returns true if address-space layout randomization applies to this
    /// process: it is enabled system-wide, and not turned off with the
    /// `ADDR_NO_RANDOMIZE` personality (for instance by `setarch -R`).
    /// The victim only loads at the default PIE base when it does not.
    pub fn aslr_enabled() -> std::io::Result<bool> {
        let res = Self::read_trimmed(Self::ASLR_PATH)?;
        let persona = personality::get()?;
        Self::aslr_from(&res, persona)
    }

    /// Combine `kernel.randomize_va_space` with the personality flags.
    pub fn aslr_from(sysctl: &str, persona: Persona) -> std::io::Result<bool> {
        let system = match sysctl {
            "0" => false,
            "1" | "2" => true,
            _ => return Err(Self::invalid(Self::ASLR_PATH, sysctl)),
        };
        Ok(system && !persona.contains(Persona::ADDR_NO_RANDOMIZE))
    }

    /// Returns true if SMT is enabled.
    pub fn smt_enabled() -> std::io::Result<bool> {
        let res = Self::read_trimmed(Self::SMT_PATH)?;
        match res.as_str() {
            "on" | "forceon" => Ok(true),
            "off" | "forceoff" | "notsupported" | "notimplemented" => Ok(false),
            _ => Err(Self::invalid(Self::SMT_PATH, &res)),
        }
    }

    /// The kernel's description of its Spectre v2 mitigations.
    pub fn spectre_v2_status() -> std::io::Result<String> {
        Self::read_trimmed(Self::SPECTRE_V2_PATH)
    }

    /// Pin to a particular core.
    pub fn pin_to_core(core: usize) -> nix::Result<()> {
        let this_pid = nix::unistd::Pid::from_raw(0);
        let mut cpuset = nix::sched::CpuSet::new();
        cpuset.set(core)?;
        nix::sched::sched_setaffinity(this_pid, &cpuset)
    }

    /// Number of online cores.
    pub fn online_cores() -> Option<i64> {
        nix::unistd::sysconf(nix::unistd::SysconfVar::_NPROCESSORS_ONLN)
            .ok()
            .flatten()
            .map(|n| n as i64)
    }
}
