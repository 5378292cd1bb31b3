/// Static per-chip configuration: exploit staging addresses, the
/// register-access dispatch pointers the overflow is aimed at, and the
/// Download Agent load layout. Extend by adding entries, not branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    pub hw_code: u16,
    pub name: &'static str,
    pub watchdog: u32,
    pub uart: u32,
    /// SRAM address the exploit payload is staged at.
    pub brom_payload_addr: u32,
    pub da_payload_addr: u32,
    /// Blacklist-bypass address/value pairs. Present for reference; the
    /// uploaded payload applies them on-device.
    pub blacklist: &'static [(u32, u32)],
    /// (pointer table base, live send-function pointer slot).
    pub send_ptr: (u32, u32),
    /// (handler address, register-access dispatch pointer) - the overflow
    /// offsets in the exploit are computed against the second entry.
    pub brom_register_access: (u32, u32),
    pub da1_addr: u32,
    pub da2_addr: u32,
    pub da1_sig_len: u32,
    pub da2_sig_len: u32,
}

pub const MT6771: ChipProfile = ChipProfile {
    hw_code: 0x0788,
    name: "MT6771",
    watchdog: 0x1000_7000,
    uart: 0x1100_2000,
    brom_payload_addr: 0x0010_0a00,
    da_payload_addr: 0x0020_1000,
    blacklist: &[(0x0010_2834, 0x0), (0x0010_6a60, 0x0)],
    send_ptr: (0x0010_2878, 0xdebc),
    brom_register_access: (0xe2d0, 0xe388),
    da1_addr: 0x0020_0000,
    da2_addr: 0x4000_0000,
    da1_sig_len: 0x100,
    da2_sig_len: 0x100,
};

pub const PROFILES: &[ChipProfile] = &[MT6771];

pub fn by_hw_code(hw_code: u16) -> Option<&'static ChipProfile> {
    PROFILES.iter().find(|profile| profile.hw_code == hw_code)
}
