//! Calling conventions for emulated calls.

use crate::arch::Arch;

/// A calling convention for a fixed number of word-sized integer
/// arguments and a word-sized integer return value.
///
/// The substrate interprets the convention when it performs a call:
/// where the arguments land (stack slots, registers) is the substrate's
/// business, the probe only promises their count and width.
#[derive(Clone, Copy, Debug)]
pub struct CallConv {
    /// Number of word-sized integer arguments.
    pub num_args: usize,
    /// Word width of every argument and of the return value.
    pub bits: u32,
}

impl CallConv {
    /// The factory the probe uses: given "N word-sized ints in, one
    /// word-sized int out", yield the convention object.
    pub fn word_ints(num_args: usize, arch: &Arch) -> CallConv {
        CallConv {
            num_args,
            bits: arch.bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_ints_takes_width_from_the_arch() {
        let cc = CallConv::word_ints(3, &Arch::i386());
        assert_eq!(cc.num_args, 3);
        assert_eq!(cc.bits, 32);
    }
}
