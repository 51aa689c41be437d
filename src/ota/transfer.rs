//! Chunked transfer state machine with compile-time state safety via statum
//!
//! ```text
//! (request validated) ──► Started ──► Progressing ──► Verified
//!                                        │  ▲
//!                                        └──┘ advance() per chunk
//! ```
//!
//! Payload bytes are synthetic: byte `i` of the image is a pure function of
//! `i`, so identical `(size, chunk)` parameters always produce the same CRC.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use statum::{machine, state};
use tracing::debug;

use super::event::OtaEvent;
use super::request::{TransferPlan, PROGRESS_MARKS};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Byte at absolute offset `offset` of the synthetic image
pub fn synthetic_byte(offset: u64) -> u8 {
    ((offset.wrapping_mul(29).wrapping_add(0x5F)) ^ 0xA5) as u8
}

#[state]
#[derive(Debug, Clone)]
pub enum TransferState {
    Started,
    Progressing,
    Verified,
}

#[machine]
pub struct OtaTransfer<S: TransferState> {
    plan: TransferPlan,
    processed: u64,
    next_mark: usize,
    digest: Digest<'static, u32>,
    crc: Option<u32>,
}

impl<S: TransferState> OtaTransfer<S> {
    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl OtaTransfer<Started> {
    /// Accepts a validated plan, returning the `started` event to emit.
    pub fn start(plan: TransferPlan) -> (Self, OtaEvent) {
        debug!(
            "OTA {} accepted: size={} chunk={} thresholds={:?}",
            plan.req_id, plan.size, plan.chunk_bytes, plan.thresholds
        );
        let event = OtaEvent::started(&plan);
        (Self::new(plan, 0, 0, CRC32.digest(), None), event)
    }

    pub fn begin(self) -> OtaTransfer<Progressing> {
        self.transition()
    }
}

impl OtaTransfer<Progressing> {
    pub fn is_complete(&self) -> bool {
        self.processed >= self.plan.size
    }

    /// Moves the next chunk through the checksum and returns the milestones it crossed.
    pub fn advance(&mut self) -> Vec<u8> {
        let remaining = self.plan.size - self.processed;
        let step = self.plan.chunk_bytes.min(remaining);
        let block: Vec<u8> = (self.processed..self.processed + step)
            .map(synthetic_byte)
            .collect();
        self.digest.update(&block);
        self.processed += step;

        let mut crossed = Vec::new();
        while self.next_mark < PROGRESS_MARKS.len()
            && self.processed >= self.plan.thresholds[self.next_mark]
        {
            crossed.push(PROGRESS_MARKS[self.next_mark]);
            self.next_mark += 1;
        }
        crossed
    }

    /// Finalizes the checksum once every byte went through; hands the transfer back otherwise.
    pub fn verify(mut self) -> Result<OtaTransfer<Verified>, Self> {
        if !self.is_complete() {
            return Err(self);
        }
        self.crc = Some(self.digest.clone().finalize());
        Ok(self.transition())
    }
}

impl OtaTransfer<Verified> {
    pub fn crc(&self) -> u32 {
        self.crc.unwrap_or_default()
    }

    /// Eight uppercase hex digits
    pub fn crc_hex(&self) -> String {
        format!("{:08X}", self.crc())
    }

    pub fn verified_event(&self) -> OtaEvent {
        OtaEvent::verified(&self.plan, &self.crc_hex())
    }
}
