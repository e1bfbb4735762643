//! # x64 encodings

use std::mem;

use super::FAR_JMP_LEN;

#[repr(C, packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: u64,
}

/// Generates an absolute jump to a specified address, reachable from anywhere in the address space
pub fn jmp_abs(target: u64) -> [u8; FAR_JMP_LEN] {
    // Safety: `JmpAbs` is packed plain data of exactly `FAR_JMP_LEN` bytes
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target: target.to_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::jmp_abs;

    #[test]
    /// The target follows the indirect jmp in little endian
    fn test_jmp_abs() {
        assert_eq!(
            hex::encode(jmp_abs(0x1122_3344_5566_7788)),
            "ff25000000008877665544332211"
        );
    }
}
