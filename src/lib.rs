//! Host-side MediaTek BROM exploitation and bootloader-unlock toolkit.
//!
//! Talks to a MediaTek SoC in boot ROM mode over USB CDC, runs the
//! kamakiri2 overflow to bypass download-agent authentication, loads
//! security-patched Download Agents over the XFlash protocol, and flips
//! the FRP unlock flag so fastboot accepts `oem unlock`.

pub mod brom;
pub mod chip;
pub mod dapatch;
pub mod gpt;
pub mod kamakiri;
pub mod transport;
pub mod unlock;
pub mod xflash;

pub use transport::{Transport, TransportError, UsbTransport};
pub use unlock::{unlock, ProgressEvent, UnlockError, UnlockOutcome, UnlockPayloads};
