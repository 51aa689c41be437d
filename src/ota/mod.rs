//! Simulated firmware-update transfers.
//!
//! 1. [`request`] - Validation of `cmd/ota` payloads into a [`TransferPlan`]
//! 2. [`transfer`] - Statum state machine moving synthetic chunks through CRC-32
//! 3. [`ota_handle`] - Cancellable task per transfer, events out over a channel
//!
//! # Event sequence
//!
//! ```text
//! started(0) ──► progress(25) ──► progress(50) ──► progress(75) ──► verified(100, crc)
//!
//! rejected request:   error(reason, detail)
//! cancelled transfer: started(0) ... error("aborted", "superseded" | "shutdown")
//! ```

pub mod event;
pub mod ota_handle;
pub mod request;
pub mod transfer;

pub use event::{OtaEvent, OtaStatus};
pub use ota_handle::{OtaHandle, TransferContext, TransferOutcome};
pub use request::{OtaRejection, OtaRequest, TransferPlan};
