//! Runs OTA transfers as cancellable background tasks.
//!
//! Each accepted request gets its own tokio task and a child of the shutdown
//! token. Events flow over an mpsc channel to whoever publishes them; the
//! handle never touches the transport itself.
//!
//! ```text
//! submit(payload) ──► [transfer task] ──OtaEvent──► mpsc ──► event/ota
//!        │                  ▲
//!        └── cancels previous transfer first
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::OtaEvent;
use super::request::{OtaRejection, OtaRequest, TransferPlan};
use super::transfer::OtaTransfer;
use crate::config::OtaSettings;
use crate::device::log_buffer::LogRingBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Rejected(OtaRejection),
    Verified { req_id: String, crc: String },
    Aborted { req_id: String },
}

/// Shared by every transfer task
#[derive(Debug)]
pub struct TransferContext {
    pub pacing: Duration,
    pub events: mpsc::Sender<OtaEvent>,
    pub log: Arc<LogRingBuffer>,
    pub shutdown: CancellationToken,
}

impl TransferContext {
    pub fn new(
        settings: &OtaSettings,
        events: mpsc::Sender<OtaEvent>,
        log: Arc<LogRingBuffer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pacing: Duration::from_millis(settings.pacing_ms),
            events,
            log,
            shutdown,
        }
    }

    async fn emit(&self, event: OtaEvent) {
        if let Err(e) = self.events.send(event).await {
            warn!("OTA event dropped, publisher gone: {:?}", e.0.status);
        }
    }

    /// Waits out the pacing delay; `false` when cancelled meanwhile.
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        if self.pacing.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.pacing) => true,
        }
    }

    fn abort_detail(&self) -> &'static str {
        if self.shutdown.is_cancelled() {
            "shutdown"
        } else {
            "superseded"
        }
    }
}

/// Validates and runs one transfer to completion, rejection or cancellation.
pub async fn run_transfer(
    payload: &[u8],
    context: &TransferContext,
    cancel: &CancellationToken,
) -> TransferOutcome {
    let request = match OtaRequest::parse(payload) {
        Ok(request) => request,
        Err(rejection) => {
            warn!("OTA request rejected: {}", rejection);
            context.emit(OtaEvent::rejected(&rejection)).await;
            let entry = if rejection.undecodable {
                format!("parse error: {}", rejection.detail)
            } else {
                format!("reject {}", rejection.detail)
            };
            context.log.warn("ota", &entry);
            return TransferOutcome::Rejected(rejection);
        }
    };

    let (started, event) = OtaTransfer::start(TransferPlan::from_request(request));
    let plan = started.plan().clone();
    info!(
        "OTA {} started: {} bytes in {} byte chunks",
        plan.req_id, plan.size, plan.chunk_bytes
    );
    context.emit(event).await;

    let mut transfer = started.begin();
    while !transfer.is_complete() {
        if cancel.is_cancelled() {
            return abort(context, &plan, transfer.processed()).await;
        }
        for mark in transfer.advance() {
            if !context.pace(cancel).await {
                return abort(context, &plan, transfer.processed()).await;
            }
            debug!("OTA {} reached {}%", plan.req_id, mark);
            context.emit(OtaEvent::progress(&plan, mark)).await;
        }
        tokio::task::yield_now().await;
    }

    if !context.pace(cancel).await {
        return abort(context, &plan, transfer.processed()).await;
    }
    let verified = match transfer.verify() {
        Ok(verified) => verified,
        Err(incomplete) => {
            error!(
                "OTA {} stopped at {} of {} bytes",
                plan.req_id,
                incomplete.processed(),
                plan.size
            );
            context.log.error(
                "ota",
                &format!("verify incomplete {}/{}", incomplete.processed(), plan.size),
            );
            return abort(context, &plan, incomplete.processed()).await;
        }
    };
    let crc = verified.crc_hex();
    context.emit(verified.verified_event()).await;
    context
        .log
        .info("ota", &format!("size={} crc={}", plan.size, crc));
    info!("OTA {} verified, crc={}", plan.req_id, crc);

    TransferOutcome::Verified {
        req_id: plan.req_id,
        crc,
    }
}

async fn abort(context: &TransferContext, plan: &TransferPlan, processed: u64) -> TransferOutcome {
    let detail = context.abort_detail();
    warn!(
        "OTA {} aborted ({}) after {} of {} bytes",
        plan.req_id, detail, processed, plan.size
    );
    context.emit(OtaEvent::aborted(plan, detail)).await;
    context
        .log
        .warn("ota", &format!("abort {} at {}/{}", detail, processed, plan.size));
    TransferOutcome::Aborted {
        req_id: plan.req_id.clone(),
    }
}

struct RunningTransfer {
    cancel: CancellationToken,
    task: JoinHandle<TransferOutcome>,
}

/// Owns at most one running transfer at a time
pub struct OtaHandle {
    context: Arc<TransferContext>,
    current: Option<RunningTransfer>,
}

impl OtaHandle {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context: Arc::new(context),
            current: None,
        }
    }

    /// Starts a transfer for `payload`, cancelling and awaiting any previous one first.
    pub async fn submit(&mut self, payload: Vec<u8>) {
        if let Some(previous) = self.current.take() {
            if !previous.task.is_finished() {
                info!("New OTA request supersedes the running transfer");
            }
            previous.cancel.cancel();
            Self::join(previous.task).await;
        }

        let cancel = self.context.shutdown.child_token();
        let token = cancel.clone();
        let context = self.context.clone();
        let task = tokio::spawn(async move { run_transfer(&payload, &context, &token).await });
        self.current = Some(RunningTransfer { cancel, task });
    }

    /// Waits for the current transfer, if any, and returns how it ended.
    pub async fn finish(&mut self) -> Option<TransferOutcome> {
        match self.current.take() {
            Some(running) => Self::join(running.task).await,
            None => None,
        }
    }

    async fn join(task: JoinHandle<TransferOutcome>) -> Option<TransferOutcome> {
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("OTA transfer task failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::event::OtaStatus;

    fn test_context(pacing_ms: u64) -> (TransferContext, mpsc::Receiver<OtaEvent>, Arc<LogRingBuffer>) {
        let (tx, rx) = mpsc::channel(64);
        let log = Arc::new(LogRingBuffer::new("dev1"));
        let context = TransferContext::new(
            &OtaSettings { pacing_ms },
            tx,
            log.clone(),
            CancellationToken::new(),
        );
        (context, rx, log)
    }

    fn drain(rx: &mut mpsc::Receiver<OtaEvent>) -> Vec<OtaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn valid_request_emits_full_lifecycle() {
        let (context, mut rx, log) = test_context(0);
        let outcome = run_transfer(
            br#"{"url":"mock.bin","size":4096}"#,
            &context,
            &CancellationToken::new(),
        )
        .await;

        let events = drain(&mut rx);
        let statuses: Vec<OtaStatus> = events.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                OtaStatus::Started,
                OtaStatus::Progress,
                OtaStatus::Progress,
                OtaStatus::Progress,
                OtaStatus::Verified
            ]
        );
        let progress: Vec<u8> = events.iter().filter_map(|e| e.progress).collect();
        assert_eq!(progress, vec![0, 25, 50, 75, 100]);
        assert_eq!(events[0].size, Some(4096));
        assert_eq!(events[0].url.as_deref(), Some("mock.bin"));
        assert_eq!(events[4].crc.as_deref(), Some("37C401CD"));

        let req_id = events[0].req_id.clone().unwrap();
        assert!(events.iter().all(|e| e.req_id.as_deref() == Some(req_id.as_str())));
        assert!(matches!(outcome, TransferOutcome::Verified { ref crc, .. } if crc == "37C401CD"));

        let dump = log.dump(false);
        assert_eq!(dump.count, 1);
        assert_eq!(dump.entries[0].msg, "size=4096 crc=37C401CD");
    }

    #[tokio::test]
    async fn identical_parameters_yield_identical_checksums() {
        let (context, mut rx, _) = test_context(0);
        let payload = br#"{"size":5000,"chunkBytes":100}"#;
        run_transfer(payload, &context, &CancellationToken::new()).await;
        run_transfer(payload, &context, &CancellationToken::new()).await;

        let crcs: Vec<String> = drain(&mut rx).into_iter().filter_map(|e| e.crc).collect();
        assert_eq!(crcs.len(), 2);
        assert_eq!(crcs[0], crcs[1]);
    }

    #[tokio::test]
    async fn single_byte_transfer_still_reports_every_milestone() {
        let (context, mut rx, _) = test_context(0);
        run_transfer(br#"{"size":1}"#, &context, &CancellationToken::new()).await;
        let progress: Vec<u8> = drain(&mut rx).iter().filter_map(|e| e.progress).collect();
        assert_eq!(progress, vec![0, 25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn invalid_requests_emit_exactly_one_error() {
        for payload in [
            r#"{"url":"x"}"#,
            r#"{"size":0}"#,
            r#"{"size":-1}"#,
            r#"{"size":"abc"}"#,
            r#"{"size":10,"chunkBytes":"abc"}"#,
            r#"not json"#,
        ] {
            let (context, mut rx, log) = test_context(0);
            let outcome = run_transfer(payload.as_bytes(), &context, &CancellationToken::new()).await;
            assert!(matches!(outcome, TransferOutcome::Rejected(_)), "{payload}");

            let events = drain(&mut rx);
            assert_eq!(events.len(), 1, "{payload}");
            assert_eq!(events[0].status, OtaStatus::Error);
            assert_eq!(events[0].reason.as_deref(), Some("invalid payload"));
            assert!(events[0].detail.is_some());
            assert_eq!(log.len(), 1);
        }
    }

    #[tokio::test]
    async fn rejection_keeps_the_callers_request_id() {
        let (context, mut rx, _) = test_context(0);
        run_transfer(br#"{"reqId":"abc","size":-3}"#, &context, &CancellationToken::new()).await;
        assert_eq!(drain(&mut rx)[0].req_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn cancelled_transfer_ends_with_an_abort_event() {
        let (context, mut rx, _) = test_context(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_transfer(br#"{"reqId":"c1","size":4096}"#, &context, &cancel).await;
        assert_eq!(
            outcome,
            TransferOutcome::Aborted {
                req_id: "c1".to_string()
            }
        );

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().status, OtaStatus::Started);
        let last = events.last().unwrap();
        assert_eq!(last.status, OtaStatus::Error);
        assert_eq!(last.reason.as_deref(), Some("aborted"));
        assert_eq!(last.detail.as_deref(), Some("superseded"));
    }

    #[tokio::test]
    async fn new_request_supersedes_running_transfer() {
        let (context, mut rx, _) = test_context(200);
        let mut handle = OtaHandle::new(context);

        handle
            .submit(br#"{"reqId":"first","size":4096}"#.to_vec())
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle
            .submit(br#"{"reqId":"second","size":64}"#.to_vec())
            .await;
        let outcome = handle.finish().await;
        assert!(matches!(outcome, Some(TransferOutcome::Verified { ref req_id, .. }) if req_id == "second"));

        let events = drain(&mut rx);
        let first: Vec<&OtaEvent> = events
            .iter()
            .filter(|e| e.req_id.as_deref() == Some("first"))
            .collect();
        assert_eq!(first.last().unwrap().reason.as_deref(), Some("aborted"));
        assert!(first.iter().all(|e| e.status != OtaStatus::Verified));
        assert_eq!(events.last().unwrap().status, OtaStatus::Verified);
        assert_eq!(events.last().unwrap().req_id.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_transfer() {
        let (context, mut rx, _) = test_context(200);
        let shutdown = context.shutdown.clone();
        let mut handle = OtaHandle::new(context);

        handle.submit(br#"{"reqId":"s1","size":4096}"#.to_vec()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let outcome = handle.finish().await;
        assert!(matches!(outcome, Some(TransferOutcome::Aborted { .. })));
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.detail.as_deref(), Some("shutdown"));
    }
}
