use std::time::{Duration, Instant};

use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};

pub const MTK_VID: u16 = 0x0e8d;
pub const MTK_PIDS: &[u16] = &[0x0003, 0x2000, 0x2001, 0x20ff, 0x3000, 0x6000];

const CDC_CONTROL_CLASS: u8 = 0x02;
const CDC_DATA_CLASS: u8 = 0x0a;

const CLAIM_ATTEMPTS: u64 = 3;

const BULK_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const CTRL_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to iterate USB devices: {0}")]
    IterateUsb(rusb::Error),
    #[error("No MediaTek BROM/preloader device found (VID 0e8d)")]
    NoDevice,
    #[error("Failed to fetch USB device descriptor: {0}")]
    GetDeviceDescriptor(rusb::Error),
    #[error("Failed to fetch USB config descriptor: {0}")]
    GetConfigDescriptor(rusb::Error),
    #[error("Failed to open USB device: {0}")]
    Open(rusb::Error),
    #[error("Failed to set active configuration for USB device: {0}")]
    SetActiveConfiguration(rusb::Error),
    #[error("Cannot claim USB interface {interface} - a host driver is blocking access.\n\n{help}")]
    Claim { interface: u8, help: &'static str },
    #[error("USB read timed out (wanted {wanted} bytes, got {got})")]
    Timeout { wanted: usize, got: usize },
    #[error("Error whilst writing bulk data: {0}")]
    Write(rusb::Error),
    #[error("Device only accepted {0} out of {1} bytes whilst writing")]
    WriteTooSmall(usize, usize),
    #[error("Error whilst reading bulk data: {0}")]
    Read(rusb::Error),
    #[error("Control transfer failed: {0}")]
    Control(rusb::Error),
}

/// Byte-oriented bulk and control transfer primitives over a claimed USB
/// device. The protocol layers only ever talk to this trait, so they can be
/// driven against a scripted transport in tests.
pub trait Transport {
    fn max_packet_size(&self) -> usize;

    /// Issues a single bulk OUT transfer. An empty slice sends a zero-length
    /// packet.
    fn write_packet(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Accumulates bulk IN transfers until `length` bytes are collected or
    /// the timeout elapses.
    fn read(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError>;

    fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Interface number of the communications-control interface, used as the
    /// wIndex of class requests.
    fn ctrl_interface(&self) -> u16;

    /// Best-effort release. Never fails.
    fn close(&mut self);

    /// Splits `data` into max-packet-size chunks and issues sequential bulk
    /// OUT transfers. An empty payload sends a single zero-length packet.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return self.write_packet(&[]);
        }

        let max = self.max_packet_size();
        for chunk in data.chunks(max) {
            self.write_packet(chunk)?;
        }

        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_packet(data)
    }

    fn read(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(length, timeout)
    }

    fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).ctrl_in(request_type, request, value, index, length)
    }

    fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        (**self).ctrl_out(request_type, request, value, index, data)
    }

    fn ctrl_interface(&self) -> u16 {
        (**self).ctrl_interface()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub struct UsbTransport {
    device: Device<GlobalContext>,
    handle: DeviceHandle<GlobalContext>,
    ep_in: u8,
    ep_out: u8,
    ctrl_iface: u8,
    max_packet_size: usize,
    claimed: Vec<u8>,
}

impl UsbTransport {
    pub fn init_if_mtk(device: Device<GlobalContext>) -> Result<Option<Self>, TransportError> {
        let device_descriptor = device
            .device_descriptor()
            .map_err(TransportError::GetDeviceDescriptor)?;

        tracing::debug!(
            "Inspecting device: Bus {:03} Device {:03} ID {:04x}:{:04x}",
            device.bus_number(),
            device.address(),
            device_descriptor.vendor_id(),
            device_descriptor.product_id(),
        );

        if device_descriptor.vendor_id() != MTK_VID
            || !MTK_PIDS.contains(&device_descriptor.product_id())
        {
            return Ok(None);
        }

        let handle = device.open().map_err(TransportError::Open)?;

        Ok(Some(Self {
            device,
            handle,
            ep_in: 0x81,
            ep_out: 0x01,
            ctrl_iface: 0,
            max_packet_size: 64,
            claimed: Vec::new(),
        }))
    }

    pub fn find_device() -> Result<Self, TransportError> {
        let devices = rusb::devices().map_err(TransportError::IterateUsb)?;

        for device in devices.iter() {
            match Self::init_if_mtk(device) {
                Ok(Some(transport)) => return Ok(transport),
                Ok(None) => continue,
                Err(why) => {
                    tracing::debug!("Error when initialising device: {why}");
                    continue;
                }
            }
        }

        Err(TransportError::NoDevice)
    }

    /// Selects a configuration if none is active, locates the CDC control and
    /// data interfaces, extracts the bulk endpoints, and claims both
    /// interfaces with bounded retry.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let _ = self.handle.set_auto_detach_kernel_driver(true);

        match self.handle.active_configuration() {
            Ok(0) | Err(_) => {
                self.handle
                    .set_active_configuration(1)
                    .map_err(TransportError::SetActiveConfiguration)?;
            }
            Ok(_) => {}
        }

        let config_descriptor = self
            .device
            .active_config_descriptor()
            .map_err(TransportError::GetConfigDescriptor)?;

        let mut ctrl_iface = None;
        let mut data_iface = None;
        for interface in config_descriptor.interfaces() {
            for descriptor in interface.descriptors() {
                if descriptor.class_code() == CDC_CONTROL_CLASS && ctrl_iface.is_none() {
                    ctrl_iface = Some(interface.number());
                }

                if descriptor.class_code() == CDC_DATA_CLASS && data_iface.is_none() {
                    data_iface = Some(interface.number());
                    self.grab_bulk_endpoints(&descriptor);
                }
            }
        }

        // Some preloaders expose a single vendor interface instead of a CDC
        // pair, so fall back to interface 0 for everything.
        if data_iface.is_none() {
            for interface in config_descriptor.interfaces() {
                if interface.number() != 0 {
                    continue;
                }
                for descriptor in interface.descriptors() {
                    self.grab_bulk_endpoints(&descriptor);
                }
            }
        }

        let ctrl_iface = ctrl_iface.unwrap_or(0);
        let data_iface = data_iface.unwrap_or(0);

        tracing::debug!(
            "Interfaces: ctrl={} data={} ep_in={:#04x} ep_out={:#04x} max_packet={}",
            ctrl_iface,
            data_iface,
            self.ep_in,
            self.ep_out,
            self.max_packet_size,
        );

        let mut to_claim = vec![ctrl_iface];
        if data_iface != ctrl_iface {
            to_claim.push(data_iface);
        }

        for iface in to_claim {
            self.claim_with_retry(iface)?;
            self.claimed.push(iface);
        }

        self.ctrl_iface = ctrl_iface;
        Ok(())
    }

    fn grab_bulk_endpoints(&mut self, descriptor: &rusb::InterfaceDescriptor<'_>) {
        for endpoint in descriptor.endpoint_descriptors() {
            if endpoint.transfer_type() == TransferType::Bulk {
                match endpoint.direction() {
                    Direction::In => {
                        tracing::trace!("Found bulk in endpoint: {:#04x}", endpoint.address());
                        self.ep_in = endpoint.address();
                        self.max_packet_size = endpoint.max_packet_size() as usize;
                    }
                    Direction::Out => {
                        tracing::trace!("Found bulk out endpoint: {:#04x}", endpoint.address());
                        self.ep_out = endpoint.address();
                    }
                }
            }
        }
    }

    fn claim_with_retry(&mut self, iface: u8) -> Result<(), TransportError> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            match self.handle.claim_interface(iface) {
                Ok(()) => return Ok(()),
                Err(why) => {
                    tracing::debug!("Claim attempt {attempt} on interface {iface} failed: {why}");
                    if attempt < CLAIM_ATTEMPTS {
                        std::thread::sleep(Duration::from_millis(500 * attempt));
                        let _ = self.handle.reset();
                        std::thread::sleep(Duration::from_millis(300));
                    }
                }
            }
        }

        Err(TransportError::Claim {
            interface: iface,
            help: claim_help(),
        })
    }
}

impl Transport for UsbTransport {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<(), TransportError> {
        tracing::trace!("Writing {data:02x?}");

        let amount = self
            .handle
            .write_bulk(self.ep_out, data, BULK_WRITE_TIMEOUT)
            .map_err(TransportError::Write)?;

        if amount != data.len() {
            return Err(TransportError::WriteTooSmall(amount, data.len()));
        }

        Ok(())
    }

    fn read(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(length);
        let mut buf = vec![0u8; self.max_packet_size.max(1)];

        while out.len() < length {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    wanted: length,
                    got: out.len(),
                });
            }

            let chunk = (length - out.len()).min(buf.len());
            match self.handle.read_bulk(self.ep_in, &mut buf[..chunk], deadline - now) {
                Ok(0) => {}
                Ok(amount) => out.extend_from_slice(&buf[..amount]),
                Err(rusb::Error::Timeout) => {
                    return Err(TransportError::Timeout {
                        wanted: length,
                        got: out.len(),
                    });
                }
                Err(why) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Read(why));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        tracing::trace!("Read {out:02x?}");
        Ok(out)
    }

    fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; length];
        let amount = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, CTRL_TIMEOUT)
            .map_err(TransportError::Control)?;
        buf.truncate(amount);

        tracing::trace!("Ctrl in {request_type:#04x}/{request:#04x}: {buf:02x?}");
        Ok(buf)
    }

    fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        tracing::trace!("Ctrl out {request_type:#04x}/{request:#04x}: {data:02x?}");

        self.handle
            .write_control(request_type, request, value, index, data, CTRL_TIMEOUT)
            .map_err(TransportError::Control)?;

        Ok(())
    }

    fn ctrl_interface(&self) -> u16 {
        self.ctrl_iface as u16
    }

    fn close(&mut self) {
        for iface in self.claimed.drain(..) {
            let _ = self.handle.release_interface(iface);
        }
    }
}

fn claim_help() -> &'static str {
    if cfg!(target_os = "linux") {
        "Linux fix - install a udev rule, then replug and retry:\n\n  \
         echo 'SUBSYSTEM==\"usb\", ATTR{idVendor}==\"0e8d\", MODE=\"0666\", GROUP=\"plugdev\"' \\\n    \
         | sudo tee /etc/udev/rules.d/51-mediatek.rules\n  \
         sudo udevadm control --reload-rules && sudo udevadm trigger\n\n\
         If the cdc_acm driver grabbed the device, unbind it:\n  \
         for f in /sys/bus/usb/drivers/cdc_acm/*/; do basename \"$f\" \\\n    \
         | sudo tee /sys/bus/usb/drivers/cdc_acm/unbind 2>/dev/null; done"
    } else if cfg!(target_os = "macos") {
        "macOS fix - unload the CDC driver before plugging in:\n\n  \
         sudo kextunload -b com.apple.driver.usb.cdc.acm\n\n\
         If that fails with SIP enabled, try:\n  \
         sudo kextutil -b com.apple.driver.usb.cdc.acm -R\n\n\
         Also close any serial terminal apps (CoolTerm, screen, etc.)."
    } else if cfg!(target_os = "windows") {
        "Windows fix:\n  \
         1. Close SP Flash Tool / MTKClient / serial terminals\n  \
         2. Download Zadig: https://zadig.akeo.ie/\n  \
         3. Options -> List All Devices -> select the MediaTek device\n  \
         4. Set the driver to WinUSB -> Replace Driver\n  \
         5. Replug the device and retry"
    } else {
        "A host driver is holding the USB interface. Detach it and retry."
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{Transport, TransportError};

    /// Scripted transport: reads are served from a pre-queued byte stream,
    /// writes and control transfers are recorded for inspection.
    pub(crate) struct MockTransport {
        pub max_packet: usize,
        pub reads: VecDeque<u8>,
        pub packets: Vec<Vec<u8>>,
        pub ctrl_in_data: VecDeque<Vec<u8>>,
        pub ctrl_out_log: Vec<(u8, u8, u16, u16, Vec<u8>)>,
        pub closed: bool,
    }

    impl MockTransport {
        pub fn new(max_packet: usize) -> Self {
            Self {
                max_packet,
                reads: VecDeque::new(),
                packets: Vec::new(),
                ctrl_in_data: VecDeque::new(),
                ctrl_out_log: Vec::new(),
                closed: false,
            }
        }

        pub fn queue(&mut self, data: &[u8]) {
            self.reads.extend(data.iter().copied());
        }

        pub fn written(&self) -> Vec<u8> {
            self.packets.iter().flatten().copied().collect()
        }
    }

    impl Transport for MockTransport {
        fn max_packet_size(&self) -> usize {
            self.max_packet
        }

        fn write_packet(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.packets.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, length: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            if self.reads.len() < length {
                return Err(TransportError::Timeout {
                    wanted: length,
                    got: 0,
                });
            }
            Ok(self.reads.drain(..length).collect())
        }

        fn ctrl_in(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            length: usize,
        ) -> Result<Vec<u8>, TransportError> {
            self.ctrl_in_data
                .pop_front()
                .ok_or(TransportError::Timeout {
                    wanted: length,
                    got: 0,
                })
        }

        fn ctrl_out(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
        ) -> Result<(), TransportError> {
            self.ctrl_out_log
                .push((request_type, request, value, index, data.to_vec()));
            Ok(())
        }

        fn ctrl_interface(&self) -> u16 {
            0
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::MockTransport;
    use super::{Transport, TransportError};

    #[test]
    fn write_chunks_to_max_packet_size() {
        let mut mock = MockTransport::new(64);
        mock.write(&[0xab; 130]).unwrap();

        let sizes: Vec<usize> = mock.packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, [64, 64, 2]);
    }

    #[test]
    fn write_of_exact_multiple_has_no_trailing_packet() {
        let mut mock = MockTransport::new(64);
        mock.write(&[0x55; 128]).unwrap();

        let sizes: Vec<usize> = mock.packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, [64, 64]);
    }

    #[test]
    fn empty_write_sends_zero_length_packet() {
        let mut mock = MockTransport::new(64);
        mock.write(&[]).unwrap();

        assert_eq!(mock.packets, [Vec::<u8>::new()]);
    }

    #[test]
    fn short_read_times_out_with_byte_count() {
        let mut mock = MockTransport::new(64);
        mock.queue(&[0x01, 0x02]);

        match mock.read(4, Duration::from_millis(10)) {
            Err(TransportError::Timeout { wanted: 4, .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
