//! Framed command/param/status protocol spoken by a running Download Agent.
//! Every message is a 12-byte little-endian header (magic, flow tag, payload
//! length) followed by the payload; a bare status reply is the same framing
//! around a 4-byte status code.

use std::time::Duration;

use crate::transport::{Transport, TransportError};

pub const XFLASH_MAGIC: u32 = 0xfeee_eeef;
const DATA_PROTOCOL_FLOW: u32 = 1;

const CMD_WRITE_DATA: u32 = 0x01_0004;
const CMD_READ_DATA: u32 = 0x01_0005;
const CMD_SHUTDOWN: u32 = 0x01_0007;
const CMD_BOOT_TO: u32 = 0x01_0008;

const SYNC_BYTE: u8 = 0xc0;
const SYNC_ATTEMPTS: usize = 30;

const WRITE_CHUNK: usize = 0x40000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_TIMEOUT: Duration = Duration::from_secs(15);
const BOOT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum XflashError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("XFlash bad magic: {0:#010x}")]
    BadMagic(u32),
    #[error("{op} rejected with status {status:#010x}")]
    BadStatus { op: &'static str, status: u32 },
    #[error("DA1 sync timeout - no 0xC0 byte received")]
    SyncTimeout,
}

/// Reboot target selected by the 4th word of the shutdown parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Off = 0,
    Home = 1,
    Fastboot = 2,
}

pub struct XflashProtocol<T> {
    transport: T,
}

impl<T: Transport> XflashProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn header(length: u32) -> [u8; 12] {
        let mut header = [0u8; 12];
        header[0..4].copy_from_slice(&XFLASH_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&DATA_PROTOCOL_FLOW.to_le_bytes());
        header[8..12].copy_from_slice(&length.to_le_bytes());
        header
    }

    pub fn send_command(&mut self, command: u32) -> Result<(), TransportError> {
        self.transport.write(&Self::header(4))?;
        self.transport.write(&command.to_le_bytes())
    }

    pub fn send_param(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut packet = Vec::with_capacity(12 + data.len());
        packet.extend_from_slice(&Self::header(data.len() as u32));
        packet.extend_from_slice(data);
        self.transport.write(&packet)
    }

    /// Acknowledges a streamed data chunk with a zero-status frame.
    pub fn send_ack(&mut self) -> Result<(), TransportError> {
        let mut packet = [0u8; 16];
        packet[0..12].copy_from_slice(&Self::header(4));
        self.transport.write(&packet)
    }

    pub fn recv_packet(&mut self, timeout: Duration) -> Result<Vec<u8>, XflashError> {
        let header = self.transport.read(12, timeout)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        if magic != XFLASH_MAGIC {
            return Err(XflashError::BadMagic(magic));
        }

        if length == 0 {
            return Ok(Vec::new());
        }
        Ok(self.transport.read(length as usize, timeout)?)
    }

    pub fn recv_status(&mut self, timeout: Duration) -> Result<u32, XflashError> {
        let data = self.recv_packet(timeout)?;

        Ok(match data.len() {
            0 => 0,
            1..=3 => data[0] as u32,
            _ => u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        })
    }

    fn expect_status(&mut self, op: &'static str, timeout: Duration) -> Result<(), XflashError> {
        let status = self.recv_status(timeout)?;
        if status != 0 {
            return Err(XflashError::BadStatus { op, status });
        }
        Ok(())
    }

    /// Synchronizes with a freshly jumped-to stage-1 DA: wait for the lone
    /// sync byte, echo it, exchange the protocol magic, and mirror back
    /// whatever protocol version the DA reports.
    pub fn da1_handshake(&mut self) -> Result<(), XflashError> {
        let mut synced = false;
        for _ in 0..SYNC_ATTEMPTS {
            match self.transport.read(1, Duration::from_secs(1)) {
                Ok(data) if data[0] == SYNC_BYTE => {
                    synced = true;
                    break;
                }
                Ok(data) => tracing::trace!("Discarding pre-sync byte {:#04x}", data[0]),
                Err(_) => std::thread::sleep(Duration::from_millis(200)),
            }
        }

        if !synced {
            return Err(XflashError::SyncTimeout);
        }

        self.transport.write(&[SYNC_BYTE])?;

        let data = self.transport.read(4, Duration::from_secs(5))?;
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != XFLASH_MAGIC {
            return Err(XflashError::BadMagic(magic));
        }
        self.transport.write(&XFLASH_MAGIC.to_le_bytes())?;

        let version = self.transport.read(4, Duration::from_secs(5))?;
        self.transport.write(&version)?;

        Ok(())
    }

    /// Stage-2 DAs usually announce storage info up front; not all builds
    /// send it, so a missing packet is not an error.
    pub fn da2_handshake(&mut self) {
        if let Err(why) = self.recv_packet(Duration::from_secs(5)) {
            tracing::debug!("No DA2 storage info packet: {why}");
        }
    }

    /// Boots the stage-2 DA: command, a 16-byte (address, length) parameter
    /// block, then the raw image, each phase gated on a zero status.
    pub fn boot_to(&mut self, address: u64, data: &[u8]) -> Result<(), XflashError> {
        self.send_command(CMD_BOOT_TO)?;
        self.expect_status("BOOT_TO command", DEFAULT_TIMEOUT)?;

        let mut params = [0u8; 16];
        params[0..8].copy_from_slice(&address.to_le_bytes());
        params[8..16].copy_from_slice(&(data.len() as u64).to_le_bytes());
        self.send_param(&params)?;
        self.expect_status("BOOT_TO params", DEFAULT_TIMEOUT)?;

        self.send_param(data)?;
        // Booting the second stage can be slow.
        self.expect_status("BOOT_TO image", BOOT_TIMEOUT)?;

        Ok(())
    }

    fn partition_params(address: u64, size: u64, storage: u32, part_type: u32) -> Vec<u8> {
        let mut params = Vec::with_capacity(56);
        params.extend_from_slice(&storage.to_le_bytes());
        params.extend_from_slice(&part_type.to_le_bytes());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&size.to_le_bytes());
        // NAND extension block, zeroed for eMMC.
        params.extend_from_slice(&[0u8; 32]);
        params
    }

    /// Streams `size` bytes of flash starting at `address`, acknowledging
    /// each data chunk. A terminal short packet ends the stream early.
    pub fn read_partition(
        &mut self,
        address: u64,
        size: usize,
        storage: u32,
        part_type: u32,
    ) -> Result<Vec<u8>, XflashError> {
        self.send_command(CMD_READ_DATA)?;
        self.expect_status("READ_DATA command", DEFAULT_TIMEOUT)?;

        self.send_param(&Self::partition_params(address, size as u64, storage, part_type))?;
        self.expect_status("READ_DATA params", DEFAULT_TIMEOUT)?;
        self.expect_status("READ_DATA start", DEFAULT_TIMEOUT)?;

        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let packet = self.recv_packet(STREAM_TIMEOUT)?;
            if packet.len() <= 4 {
                break;
            }
            out.extend_from_slice(&packet);
            self.send_ack()?;
        }

        Ok(out)
    }

    /// Writes `data` in fixed-size chunks, each prefixed with a reserved
    /// word and a 16-bit running checksum the device validates.
    pub fn write_partition(
        &mut self,
        address: u64,
        data: &[u8],
        storage: u32,
        part_type: u32,
    ) -> Result<(), XflashError> {
        self.send_command(CMD_WRITE_DATA)?;
        self.expect_status("WRITE_DATA command", DEFAULT_TIMEOUT)?;

        self.send_param(&Self::partition_params(
            address,
            data.len() as u64,
            storage,
            part_type,
        ))?;
        self.expect_status("WRITE_DATA params", DEFAULT_TIMEOUT)?;

        for chunk in data.chunks(WRITE_CHUNK) {
            let mut packet = Vec::with_capacity(8 + chunk.len());
            packet.extend_from_slice(&0u32.to_le_bytes());
            packet.extend_from_slice(&(checksum16(chunk) as u32).to_le_bytes());
            packet.extend_from_slice(chunk);
            self.send_param(&packet)?;
        }

        self.expect_status("WRITE_DATA final", STREAM_TIMEOUT)
    }

    /// Returns whether the device accepted the shutdown request.
    pub fn shutdown(&mut self, boot_mode: BootMode) -> Result<bool, XflashError> {
        self.send_command(CMD_SHUTDOWN)?;
        self.expect_status("SHUTDOWN command", DEFAULT_TIMEOUT)?;

        let mut params = [0u8; 32];
        params[0..4].copy_from_slice(&1u32.to_le_bytes());
        params[12..16].copy_from_slice(&(boot_mode as u32).to_le_bytes());
        self.send_param(&params)?;

        Ok(self.recv_status(DEFAULT_TIMEOUT)? == 0)
    }
}

/// Sum of little-endian 16-bit words, an odd tail byte counted alone,
/// masked to 16 bits.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum = 0u64;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_le_bytes([word[0], word[1]]));
    }
    if let [tail] = words.remainder() {
        sum += u64::from(*tail);
    }

    (sum & 0xffff) as u16
}
