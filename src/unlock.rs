//! End-to-end unlock flow: exploit the BROM, chain-load both Download
//! Agents, flip the FRP unlock flag, and reboot into fastboot.

use crate::brom::{BlMode, BromError, BromProtocol};
use crate::chip::{self, ChipProfile};
use crate::dapatch::patch_da_security;
use crate::gpt::{parse_gpt, GptNotFound};
use crate::kamakiri::{ExploitError, Kamakiri2};
use crate::transport::{Transport, TransportError, UsbTransport};
use crate::xflash::{BootMode, XflashError, XflashProtocol};

const GPT_SECTOR_SIZE: usize = 512;
const GPT_READ_SECTORS: usize = 128;

const STORAGE_EMMC: u32 = 1;
const PART_TYPE_USER: u32 = 8;

const FRP_PARTITION: &str = "frp";
const UNLOCK_ALLOWED: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Brom(#[from] BromError),
    #[error(transparent)]
    Exploit(#[from] ExploitError),
    #[error(transparent)]
    Xflash(#[from] XflashError),
    #[error(transparent)]
    Gpt(#[from] GptNotFound),
    #[error("FRP partition not found. Partitions: {0}")]
    PartitionNotFound(String),
    #[error("FRP partition read returned no data")]
    EmptyFrp,
}

/// The three binary blobs the flow needs; their origin is opaque here.
pub struct UnlockPayloads {
    pub exploit: Vec<u8>,
    pub da1: Vec<u8>,
    pub da2: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOutcome {
    /// Whether the FRP unlock flag actually had to be rewritten.
    pub frp_modified: bool,
    pub rebooted_to_fastboot: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: &'static str,
    pub step: String,
    /// Monotonically non-decreasing fraction in [0, 1] across the whole run.
    pub progress: f32,
}

pub(crate) struct Reporter<'a> {
    sink: Option<&'a mut dyn FnMut(ProgressEvent)>,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(sink: Option<&'a mut dyn FnMut(ProgressEvent)>) -> Self {
        Self { sink }
    }

    fn report(&mut self, phase: &'static str, step: impl Into<String>, progress: f32) {
        let step = step.into();
        tracing::info!("[{phase}] {step}");

        if let Some(sink) = self.sink.as_mut() {
            sink(ProgressEvent {
                phase,
                step,
                progress,
            });
        }
    }
}

/// Opens the first MediaTek BROM/preloader device, claims it, and runs the
/// unlock flow. The transport is closed on every exit path.
pub fn unlock(
    payloads: &UnlockPayloads,
    on_progress: Option<&mut dyn FnMut(ProgressEvent)>,
) -> Result<UnlockOutcome, UnlockError> {
    let mut progress = Reporter::new(on_progress);

    progress.report("Connect", "Searching for a MediaTek BROM device", 0.02);
    let mut transport = UsbTransport::find_device()?;
    progress.report("Connect", "Device opened", 0.05);

    if let Err(why) = transport.connect() {
        transport.close();
        return Err(why.into());
    }
    progress.report("Connect", "USB interfaces claimed", 0.08);

    let result = run_unlock(&mut transport, &chip::MT6771, payloads, &mut progress);
    transport.close();
    result
}

fn run_unlock<T: Transport>(
    transport: &mut T,
    profile: &'static ChipProfile,
    payloads: &UnlockPayloads,
    progress: &mut Reporter<'_>,
) -> Result<UnlockOutcome, UnlockError> {
    let mut brom = BromProtocol::new(&mut *transport);

    progress.report("Handshake", "BROM sync", 0.10);
    brom.handshake()?;
    progress.report("Handshake", "Sync OK", 0.13);

    progress.report("Detect", "Reading chip info", 0.15);
    let hw = brom.get_hw_code()?;
    match chip::by_hw_code(hw.code) {
        Some(detected) if detected.hw_code == profile.hw_code => {
            progress.report(
                "Detect",
                format!("Chip: {:#06x} ({})", hw.code, profile.name),
                0.17,
            );
        }
        _ => {
            tracing::warn!(
                "Detected hw code {:#06x}, expected {:#06x} ({}); proceeding anyway",
                hw.code,
                profile.hw_code,
                profile.name,
            );
            progress.report(
                "Detect",
                format!("Chip: {:#06x} (unexpected)", hw.code),
                0.17,
            );
        }
    }

    brom.disable_watchdog(profile.watchdog)?;
    let config = brom.get_target_config()?;
    progress.report(
        "Detect",
        format!(
            "Security: SBC={} SLA={} DAA={}",
            config.secure_boot, config.sla, config.daa
        ),
        0.19,
    );

    let mode = match brom.get_bl_ver() {
        BlMode::Brom { version } => format!("BROM mode (version {version})"),
        BlMode::Preloader { version } => format!("Preloader mode (version {version})"),
    };
    progress.report("Detect", mode, 0.20);

    progress.report(
        "Exploit",
        format!("Payload: {} bytes", payloads.exploit.len()),
        0.25,
    );
    progress.report("Exploit", "Running kamakiri2 (CDC overflow)", 0.27);
    let mut kamakiri = Kamakiri2::new(&mut brom, profile);
    kamakiri.exploit(&payloads.exploit, None)?;

    progress.report("Exploit", "Waiting for exploit ack", 0.32);
    kamakiri.verify_exploit()?;
    progress.report("Exploit", "BROM patched - security bypassed", 0.35);

    progress.report("Exploit", "Re-syncing", 0.37);
    brom.handshake()?;

    progress.report("DA", "Patching DA1", 0.40);
    let da1 = patch_da_security(&payloads.da1);
    progress.report(
        "DA",
        format!("DA1 patched ({} bytes), uploading", da1.len()),
        0.43,
    );
    brom.send_da(profile.da1_addr, &da1, profile.da1_sig_len)?;
    progress.report("DA", "DA1 uploaded, jumping", 0.48);
    brom.jump_da(profile.da1_addr)?;

    progress.report("DA", "Waiting for DA1", 0.50);
    let mut xflash = XflashProtocol::new(&mut *transport);
    xflash.da1_handshake()?;
    progress.report("DA", "DA1 active - XFlash protocol up", 0.53);

    progress.report("DA", "Patching DA2", 0.55);
    let da2 = patch_da_security(&payloads.da2);
    progress.report(
        "DA",
        format!("DA2 patched ({} bytes), booting", da2.len()),
        0.58,
    );
    xflash.boot_to(profile.da2_addr as u64, &da2)?;
    progress.report("DA", "DA2 booted", 0.62);
    xflash.da2_handshake();

    progress.report("FRP", "Reading partition table", 0.65);
    let gpt_raw = xflash.read_partition(
        0,
        GPT_READ_SECTORS * GPT_SECTOR_SIZE,
        STORAGE_EMMC,
        PART_TYPE_USER,
    )?;
    let (sector_size, partitions) = parse_gpt(&gpt_raw, GPT_SECTOR_SIZE)?;

    let names: Vec<&str> = partitions.iter().map(|p| p.name.as_str()).collect();
    tracing::debug!("Partitions: {}", names.join(", "));

    let frp = partitions
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(FRP_PARTITION))
        .ok_or_else(|| UnlockError::PartitionNotFound(names.join(", ")))?;
    progress.report(
        "FRP",
        format!(
            "FRP: LBA {}, {} bytes",
            frp.first_lba,
            frp.size_bytes(sector_size as u64)
        ),
        0.70,
    );

    progress.report("FRP", "Reading FRP", 0.73);
    let frp_addr = frp.first_lba * sector_size as u64;
    let mut frp_data = xflash.read_partition(
        frp_addr,
        frp.size_bytes(sector_size as u64) as usize,
        STORAGE_EMMC,
        PART_TYPE_USER,
    )?;
    progress.report("FRP", format!("FRP read: {} bytes", frp_data.len()), 0.77);

    let flag = *frp_data.last().ok_or(UnlockError::EmptyFrp)?;
    progress.report("FRP", format!("Unlock flag byte: {flag:#04x}"), 0.78);

    let modified = apply_unlock_flag(&mut frp_data);
    if modified {
        progress.report("FRP", "Set to 0x01 (bootloader unlock allowed)", 0.80);
    } else {
        progress.report("FRP", "Already 0x01 - unlock flag was set", 0.80);
    }

    if modified {
        progress.report("FRP", "Writing modified FRP", 0.83);
        xflash.write_partition(frp_addr, &frp_data, STORAGE_EMMC, PART_TYPE_USER)?;
        progress.report("FRP", "FRP written", 0.88);
    }

    progress.report("Reboot", "Rebooting to fastboot", 0.92);
    let rebooted = xflash.shutdown(BootMode::Fastboot)?;
    progress.report("Reboot", "Shutdown sent", 0.95);

    progress.report("Done", "Device rebooting to fastboot", 1.0);

    Ok(UnlockOutcome {
        frp_modified: modified,
        rebooted_to_fastboot: rebooted,
    })
}

/// Forces the trailing unlock flag to 0x01. Returns whether the buffer was
/// actually changed.
fn apply_unlock_flag(data: &mut [u8]) -> bool {
    match data.last_mut() {
        Some(flag) if *flag == UNLOCK_ALLOWED => false,
        Some(flag) => {
            *flag = UNLOCK_ALLOWED;
            true
        }
        None => false,
    }
}
