//! Echo-verified command protocol spoken by the MediaTek boot ROM.
//!
//! Command opcodes, addresses, and lengths are big-endian on the wire;
//! status words are 2-byte little-endian and any nonzero status is fatal to
//! the operation in flight.

use std::time::Duration;

use crate::transport::{Transport, TransportError};

const CMD_READ32: u8 = 0xd1;
const CMD_WRITE32: u8 = 0xd4;
const CMD_JUMP_DA: u8 = 0xd5;
const CMD_SEND_DA: u8 = 0xd7;
const CMD_GET_TARGET_CONFIG: u8 = 0xd8;
const CMD_BROM_REGISTER_ACCESS: u8 = 0xda;
const CMD_GET_HW_CODE: u8 = 0xfd;
const CMD_GET_BL_VER: u8 = 0xfe;

const WATCHDOG_DISABLE_MAGIC: u32 = 0x2200_0064;

const SEND_DA_CHUNK: usize = 4096;

const HANDSHAKE_SEQUENCE: [(u8, u8); 4] =
    [(0xa0, 0x5f), (0x0a, 0xf5), (0x50, 0xaf), (0x05, 0xfa)];
const HANDSHAKE_MAX_RESYNCS: u32 = 50;
const HANDSHAKE_BYTE_TIMEOUT: Duration = Duration::from_millis(500);

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BromError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("BROM handshake failed after {0} resync attempts")]
    Handshake(u32),
    #[error("Echo mismatch at offset {offset}: sent {sent:#04x}, got {got:#04x}")]
    EchoMismatch { offset: usize, sent: u8, got: u8 },
    #[error("{op} failed with device status {status:#06x}")]
    BadStatus { op: &'static str, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwCode {
    pub code: u16,
    pub version: u16,
}

/// Security state reported by GET_TARGET_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub secure_boot: bool,
    pub sla: bool,
    pub daa: bool,
    pub raw: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlMode {
    Brom { version: u8 },
    Preloader { version: u8 },
}

/// Register-access direction. The BROM multiplexes reads and writes over the
/// same opcode with a leading mode word.
pub enum RegisterOp<'a> {
    Read(usize),
    Write(&'a [u8]),
}

pub struct BromProtocol<T> {
    transport: T,
}

impl<T: Transport> BromProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends the four sync bytes one at a time, restarting the sequence on
    /// any mismatch or read failure. Bounded by [`HANDSHAKE_MAX_RESYNCS`].
    pub fn handshake(&mut self) -> Result<(), BromError> {
        let mut resyncs = 0u32;
        let mut index = 0;

        while index < HANDSHAKE_SEQUENCE.len() {
            let (send, expect) = HANDSHAKE_SEQUENCE[index];
            self.transport.write(&[send])?;

            match self.transport.read(1, HANDSHAKE_BYTE_TIMEOUT) {
                Ok(resp) if resp[0] == expect => index += 1,
                Ok(resp) => {
                    tracing::debug!(
                        "Handshake byte {index}: sent {send:#04x}, expected {expect:#04x}, got {:#04x}",
                        resp[0],
                    );
                    index = 0;
                    resyncs += 1;
                    if resyncs > HANDSHAKE_MAX_RESYNCS {
                        return Err(BromError::Handshake(resyncs));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(why) => {
                    tracing::debug!("Handshake byte {index} read failed: {why}");
                    index = 0;
                    resyncs += 1;
                    if resyncs > HANDSHAKE_MAX_RESYNCS {
                        return Err(BromError::Handshake(resyncs));
                    }
                    std::thread::sleep(Duration::from_millis(300));
                }
            }
        }

        Ok(())
    }

    /// Writes `data` and reads back the same length, failing on the first
    /// differing byte. Nearly every BROM command is framed this way.
    pub fn echo(&mut self, data: &[u8]) -> Result<(), BromError> {
        self.transport.write(data)?;
        let resp = self.transport.read(data.len(), DEFAULT_READ_TIMEOUT)?;

        for (offset, (&sent, &got)) in data.iter().zip(resp.iter()).enumerate() {
            if sent != got {
                return Err(BromError::EchoMismatch { offset, sent, got });
            }
        }

        Ok(())
    }

    fn echo_u32(&mut self, value: u32) -> Result<(), BromError> {
        self.echo(&value.to_be_bytes())
    }

    fn echo_byte(&mut self, value: u8) -> Result<u8, BromError> {
        self.transport.write(&[value])?;
        let resp = self.transport.read(1, DEFAULT_READ_TIMEOUT)?;
        Ok(resp[0])
    }

    fn read_u16(&mut self) -> Result<u16, BromError> {
        let data = self.transport.read(2, DEFAULT_READ_TIMEOUT)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    fn read_u32_be(&mut self) -> Result<u32, BromError> {
        let data = self.transport.read(4, DEFAULT_READ_TIMEOUT)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn read_status(&mut self, op: &'static str) -> Result<(), BromError> {
        let status = self.read_u16()?;
        if status != 0 {
            return Err(BromError::BadStatus { op, status });
        }
        Ok(())
    }

    pub fn get_hw_code(&mut self) -> Result<HwCode, BromError> {
        self.echo(&[CMD_GET_HW_CODE])?;
        let data = self.transport.read(4, DEFAULT_READ_TIMEOUT)?;

        Ok(HwCode {
            code: u16::from_be_bytes([data[0], data[1]]),
            version: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    pub fn get_target_config(&mut self) -> Result<TargetConfig, BromError> {
        self.echo(&[CMD_GET_TARGET_CONFIG])?;
        let data = self.transport.read(4, DEFAULT_READ_TIMEOUT)?;
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        self.read_status("GET_TARGET_CONFIG")?;

        Ok(TargetConfig {
            secure_boot: raw & 1 != 0,
            sla: raw & 2 != 0,
            daa: raw & 4 != 0,
            raw,
        })
    }

    /// Distinguishes "already in BROM" from "in preloader" by whether the
    /// opcode echoes back identically. Failures are taken to mean BROM mode.
    pub fn get_bl_ver(&mut self) -> BlMode {
        match self.echo_byte(CMD_GET_BL_VER) {
            Ok(echoed) if echoed == CMD_GET_BL_VER => {
                match self.transport.read(1, DEFAULT_READ_TIMEOUT) {
                    Ok(data) => BlMode::Brom { version: data[0] },
                    Err(_) => BlMode::Brom { version: 0 },
                }
            }
            Ok(other) => BlMode::Preloader { version: other },
            Err(_) => BlMode::Brom { version: 0 },
        }
    }

    pub fn disable_watchdog(&mut self, watchdog: u32) -> Result<(), BromError> {
        self.write32(watchdog, WATCHDOG_DISABLE_MAGIC)
    }

    /// Reads `count` consecutive 32-bit words starting at `address`.
    pub fn read32(&mut self, address: u32, count: usize) -> Result<Vec<u32>, BromError> {
        self.echo(&[CMD_READ32])?;
        self.echo_u32(address)?;
        self.echo_u32(count as u32)?;
        self.read_status("READ32")?;

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_u32_be()?);
        }

        self.read_status("READ32")?;
        Ok(values)
    }

    pub fn write32(&mut self, address: u32, value: u32) -> Result<(), BromError> {
        self.echo(&[CMD_WRITE32])?;
        self.echo_u32(address)?;
        self.echo_u32(1)?;
        self.read_status("WRITE32")?;
        self.echo_u32(value)?;
        self.read_status("WRITE32")?;
        Ok(())
    }

    pub fn register_read(
        &mut self,
        address: u32,
        length: usize,
        check_result: bool,
    ) -> Result<Vec<u8>, BromError> {
        self.register_access(address, RegisterOp::Read(length), check_result)
    }

    pub fn register_write(
        &mut self,
        address: u32,
        data: &[u8],
        check_result: bool,
    ) -> Result<(), BromError> {
        self.register_access(address, RegisterOp::Write(data), check_result)?;
        Ok(())
    }

    /// Low-level register window access. This is the primitive the exploit
    /// repurposes for arbitrary-address memory access once hijacked, which is
    /// also why the trailing status is optional: after the dispatch pointer
    /// has been overwritten, no status ever arrives.
    pub fn register_access(
        &mut self,
        address: u32,
        op: RegisterOp<'_>,
        check_result: bool,
    ) -> Result<Vec<u8>, BromError> {
        let (mode, length) = match &op {
            RegisterOp::Read(length) => (0u32, *length),
            RegisterOp::Write(data) => (1u32, data.len()),
        };

        self.echo(&[CMD_BROM_REGISTER_ACCESS])?;
        self.echo_u32(mode)?;
        self.echo_u32(address)?;
        self.echo_u32(length as u32)?;
        self.read_status("BROM_REGISTER_ACCESS")?;

        let result = match op {
            RegisterOp::Read(length) => self.transport.read(length, DEFAULT_READ_TIMEOUT)?,
            RegisterOp::Write(data) => {
                self.transport.write(data)?;
                Vec::new()
            }
        };

        if check_result {
            let _ = self.read_u16()?;
        }

        Ok(result)
    }

    /// Uploads a Download Agent image and verifies the device checksum
    /// exchange. Returns the device-reported checksum word.
    pub fn send_da(&mut self, address: u32, data: &[u8], sig_len: u32) -> Result<u16, BromError> {
        self.echo(&[CMD_SEND_DA])?;
        self.echo_u32(address)?;
        self.echo_u32(data.len() as u32)?;
        self.echo_u32(sig_len)?;
        self.read_status("SEND_DA")?;

        for chunk in data.chunks(SEND_DA_CHUNK) {
            self.transport.write(chunk)?;
        }

        // Flush with a zero-length write. Some stacks reject the ZLP; the
        // upload is already complete at this point.
        let _ = self.transport.write(&[]);

        let checksum = self.read_u16()?;
        self.read_status("SEND_DA")?;
        Ok(checksum)
    }

    /// Jumps to an uploaded DA. Returns the execution address reported back.
    pub fn jump_da(&mut self, address: u32) -> Result<u32, BromError> {
        self.echo(&[CMD_JUMP_DA])?;
        self.transport.write(&address.to_be_bytes())?;
        let exec_address = self.read_u32_be()?;
        self.read_status("JUMP_DA")?;
        Ok(exec_address)
    }
}
