//! Gadgets planted into a mapped image.

use dynasmrt::{ dynasm, DynasmApi, DynasmError, VecAssembler };
use dynasmrt::x64::X64Relocation;

/// A short instruction sequence written over the code at a mistrained
/// branch target.
///
/// The attacker never needs the gadget to *do* anything: it only has to be
/// a valid target for the indirect call so that the branch predictor
/// records it. A bare `ret` is enough.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Gadget {
    /// `ret`
    Ret,
    /// `lfence; ret`
    LfenceRet,
}
impl Gadget {
    /// Assemble the gadget.
    pub fn assemble(&self) -> Result<Vec<u8>, DynasmError> {
        let mut ops = VecAssembler::<X64Relocation>::new(0);
        match self {
            Gadget::Ret => {
                dynasm!(ops
                    ; .arch x64
                    ; ret
                );
            },
            Gadget::LfenceRet => {
                dynasm!(ops
                    ; .arch x64
                    ; lfence
                    ; ret
                );
            },
        }
        ops.finalize()
    }
}

impl std::fmt::Display for Gadget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gadget::Ret => write!(f, "ret"),
            Gadget::LfenceRet => write!(f, "lfence; ret"),
        }
    }
}
