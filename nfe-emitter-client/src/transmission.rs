//! Submission of a signed document and the receipt polling that follows.
//!
//! ```text
//! submit ──104──> protocol classified ─────────────> Authorized | Denied | Rejected
//!    │
//!    └────103──> receipt ──wait──> consReciNFe ──105──> wait ... (max_attempts)
//!                                       └──other──> Authorized | Denied | Rejected
//! ```
//!
//! Every wait and every HTTP call races the caller's cancellation token and
//! deadline. Nothing is retried: a failed call ends the transmission and the
//! outcome says whether a receipt was obtained first.

use http::Uri;
use nfe_emitter::{
    infrastructure::logging::{record_field, truncate_for_log},
    requests::{self, BatchId},
    response::{self, ReceiptReply, ResponseError, SubmissionReply},
    signature::SignedInvoice,
    soap::{self, Service},
    types::{Environment, ReceiptNumber, TransmissionOutcome},
};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::EndpointSet,
    transport::{SoapRequest, SoapTransport, TransportError},
    NfeEmitterClientError, Result,
};

/// How receipts are polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct PollingPolicy {
    /// Minimum wait before the first poll. The authority's `tMed` raises it.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    /// Zero returns `Pending` as soon as a receipt is obtained.
    pub max_attempts: u32,
    /// Bound on every single HTTP call.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_attempts: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PollingPolicy {
    pub const MAX_MULTIPLIER: f64 = 10.0;

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(NfeEmitterClientError::InvalidPolling(reason.to_string()));
        if !(1.0..=Self::MAX_MULTIPLIER).contains(&self.backoff_multiplier) {
            return invalid("backoff_multiplier must be between 1.0 and 10.0");
        }
        if self.initial_delay > self.max_interval {
            return invalid("initial_delay exceeds max_interval");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive");
        }
        Ok(())
    }

    pub(crate) fn backoff(&self, average_wait: Option<Duration>) -> Backoff {
        let first = average_wait
            .map_or(self.initial_delay, |wait| wait.max(self.initial_delay))
            .min(self.max_interval);
        Backoff {
            next: first,
            max_interval: self.max_interval,
            multiplier: self.backoff_multiplier,
            remaining: self.max_attempts,
        }
    }
}

/// Waits before each poll. Yields at most `max_attempts` values.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max_interval: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        // Saturates at the cap when the product does not fit a `Duration`.
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max_interval, |grown| grown.min(self.max_interval));
        Some(current)
    }
}

/// Caller's limits for one emission.
#[derive(Debug, Clone, Default)]
pub struct EmissionControl {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl EmissionControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `future` unless the caller cancels or the deadline passes first.
    /// Cancellation wins ties.
    async fn race<F: Future>(&self, future: F) -> std::result::Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupt::Cancelled),
            _ = until(self.deadline) => Err(Interrupt::DeadlineReached),
            output = future => Ok(output),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    DeadlineReached,
}

/// One document's trip through the authorization service.
pub(crate) struct Transmission<'a> {
    transport: &'a dyn SoapTransport,
    authorization: Uri,
    receipt: Uri,
    policy: &'a PollingPolicy,
    synchronous: bool,
}

impl<'a> Transmission<'a> {
    pub(crate) fn new(
        transport: &'a dyn SoapTransport,
        endpoints: &EndpointSet,
        environment: Environment,
        policy: &'a PollingPolicy,
        synchronous: bool,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            authorization: endpoints.uri(Service::Authorization, environment)?.clone(),
            receipt: endpoints.uri(Service::ReceiptQuery, environment)?.clone(),
            policy,
            synchronous,
        })
    }

    #[instrument(skip_all, fields(access_key = %signed.access_key(), batch_id = %batch_id, receipt))]
    pub(crate) async fn transmit(
        &self,
        signed: &SignedInvoice,
        batch_id: BatchId,
        control: &EmissionControl,
    ) -> TransmissionOutcome {
        if control.token.is_cancelled() {
            return TransmissionOutcome::Cancelled { receipt: None };
        }

        let message = requests::authorization_request(signed, batch_id, self.synchronous);
        let request = SoapRequest {
            service: Service::Authorization,
            endpoint: self.authorization.clone(),
            envelope: soap::envelope(Service::Authorization, &message),
        };

        info!("Submitting document");
        let body = match self.call(&request, control).await {
            Ok(body) => body,
            // Without a receipt only a protocol query can tell whether the
            // document arrived, so a deadline here is not a polling timeout.
            Err(failure) => return failure.into_outcome(None),
        };

        match response::interpret_submission(&body, signed.access_key()) {
            Ok(SubmissionReply::Processed(protocol)) => protocol.into_outcome(signed),
            Ok(SubmissionReply::Received {
                receipt,
                average_wait,
            }) => {
                record_field("receipt", &receipt);
                info!("Batch received, polling receipt");
                self.poll(signed, receipt, average_wait, control).await
            }
            Ok(SubmissionReply::BatchRejected { code, reason }) => {
                TransmissionOutcome::Rejected { code, reason }
            }
            Ok(SubmissionReply::Unknown { code, reason, raw }) => {
                TransmissionOutcome::UnknownStatus { code, reason, raw }
            }
            Err(e) => unreadable_reply(e, &body, None),
        }
    }

    /// Follow `receipt` until the batch is processed or the limits run out.
    /// `average_wait` is the authority's `tMed` hint, if any.
    #[instrument(skip_all, fields(access_key = %signed.access_key(), receipt = %receipt))]
    pub(crate) async fn poll(
        &self,
        signed: &SignedInvoice,
        receipt: ReceiptNumber,
        average_wait: Option<Duration>,
        control: &EmissionControl,
    ) -> TransmissionOutcome {
        if self.policy.max_attempts == 0 {
            return TransmissionOutcome::Pending { receipt };
        }

        let request = SoapRequest {
            service: Service::ReceiptQuery,
            endpoint: self.receipt.clone(),
            envelope: soap::envelope(
                Service::ReceiptQuery,
                &requests::receipt_query(signed.environment(), &receipt),
            ),
        };

        let mut attempts = 0;
        for wait in self.policy.backoff(average_wait) {
            debug!(?wait, attempt = attempts + 1, "Waiting before polling");
            match control.race(tokio::time::sleep(wait)).await {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => {
                    return TransmissionOutcome::Cancelled {
                        receipt: Some(receipt),
                    }
                }
                Err(Interrupt::DeadlineReached) => {
                    return TransmissionOutcome::Timeout { receipt, attempts }
                }
            }

            attempts += 1;
            let body = match self.call(&request, control).await {
                Ok(body) => body,
                Err(CallFailure::Interrupted(Interrupt::DeadlineReached)) => {
                    return TransmissionOutcome::Timeout { receipt, attempts }
                }
                Err(failure) => return failure.into_outcome(Some(receipt)),
            };

            match response::interpret_receipt(&body, signed.access_key()) {
                Ok(ReceiptReply::Processing { average_wait }) => {
                    debug!(?average_wait, "Batch still processing");
                }
                Ok(ReceiptReply::Processed(protocol)) => return protocol.into_outcome(signed),
                Ok(ReceiptReply::BatchRejected { code, reason }) => {
                    return TransmissionOutcome::Rejected { code, reason }
                }
                Ok(ReceiptReply::Unknown { code, reason, raw }) => {
                    return TransmissionOutcome::UnknownStatus { code, reason, raw }
                }
                Err(e) => return unreadable_reply(e, &body, Some(receipt)),
            }
        }

        warn!(attempts, "Batch still processing after the last poll");
        TransmissionOutcome::Timeout { receipt, attempts }
    }

    /// Send `request` within the caller's limits.
    async fn call(
        &self,
        request: &SoapRequest,
        control: &EmissionControl,
    ) -> std::result::Result<String, CallFailure> {
        match control.race(self.transport.call(request)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                warn!(service = %request.service, "Call failed: {e}");
                Err(CallFailure::Transport(e))
            }
            Err(interrupt) => {
                info!(service = %request.service, ?interrupt, "Stopped waiting for the authority");
                Err(CallFailure::Interrupted(interrupt))
            }
        }
    }
}

#[derive(Debug)]
enum CallFailure {
    Transport(TransportError),
    Interrupted(Interrupt),
}

impl CallFailure {
    fn into_outcome(self, receipt: Option<ReceiptNumber>) -> TransmissionOutcome {
        match self {
            CallFailure::Transport(e) => TransmissionOutcome::TransportError {
                detail: e.to_string(),
                receipt,
            },
            CallFailure::Interrupted(Interrupt::Cancelled) => {
                TransmissionOutcome::Cancelled { receipt }
            }
            CallFailure::Interrupted(Interrupt::DeadlineReached) => {
                TransmissionOutcome::TransportError {
                    detail: "deadline reached before the authority replied".to_string(),
                    receipt,
                }
            }
        }
    }
}

/// A SOAP fault means the request was not processed; any other unreadable
/// reply leaves the document's fate unknown.
fn unreadable_reply(
    error: ResponseError,
    body: &str,
    receipt: Option<ReceiptNumber>,
) -> TransmissionOutcome {
    warn!("Unreadable reply: {error}");
    match error {
        ResponseError::Fault { .. } => TransmissionOutcome::TransportError {
            detail: error.to_string(),
            receipt,
        },
        _ => TransmissionOutcome::UnknownStatus {
            code: None,
            reason: Some(error.to_string()),
            raw: truncate_for_log(body, 4096),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> PollingPolicy {
        PollingPolicy {
            initial_delay: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_attempts,
            request_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_grows_to_the_cap() {
        let waits: Vec<_> = policy(5).backoff(None).map(|wait| wait.as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn average_wait_raises_first_delay() {
        let mut backoff = policy(3).backoff(Some(Duration::from_secs(3)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(3)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(5)));

        // but never past the cap
        let mut backoff = policy(3).backoff(Some(Duration::from_secs(60)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(5)));

        // and a shorter hint does not lower it
        let mut backoff = policy(3).backoff(Some(Duration::ZERO));
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn backoff_saturates_at_the_cap() {
        let mut huge = policy(4);
        huge.max_interval = Duration::MAX;
        huge.backoff_multiplier = 1e300;
        let waits: Vec<_> = huge.backoff(None).collect();
        assert_eq!(
            waits,
            vec![Duration::from_secs(1), Duration::MAX, Duration::MAX, Duration::MAX]
        );

        let mut steep = policy(3);
        steep.backoff_multiplier = PollingPolicy::MAX_MULTIPLIER;
        let waits: Vec<_> = steep.backoff(None).map(|wait| wait.as_secs()).collect();
        assert_eq!(waits, vec![1, 5, 5]);
    }

    #[test]
    fn no_attempts_means_no_waits() {
        assert_eq!(policy(0).backoff(None).count(), 0);
    }

    #[test]
    fn invalid_policies_are_refused() {
        assert!(policy(1).validate().is_ok());

        let mut shrinking = policy(1);
        shrinking.backoff_multiplier = 0.5;
        assert!(shrinking.validate().is_err());

        for multiplier in [10.5, 1e300, f64::INFINITY, f64::NAN] {
            let mut runaway = policy(1);
            runaway.backoff_multiplier = multiplier;
            assert!(runaway.validate().is_err(), "{multiplier} accepted");
        }

        let mut inverted = policy(1);
        inverted.initial_delay = Duration::from_secs(30);
        assert!(inverted.validate().is_err());

        let mut no_timeout = policy(1);
        no_timeout.request_timeout = Duration::ZERO;
        assert!(no_timeout.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn race_prefers_cancellation() {
        let control = EmissionControl::default().with_timeout(Duration::from_secs(1));
        control.token().cancel();
        assert_eq!(
            control.race(std::future::ready(())).await,
            Err(Interrupt::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn race_stops_at_deadline() {
        let control = EmissionControl::default().with_timeout(Duration::from_secs(2));
        let result = control.race(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(Interrupt::DeadlineReached));

        let control = EmissionControl::default().with_timeout(Duration::from_secs(2));
        let result = control.race(tokio::time::sleep(Duration::from_secs(1))).await;
        assert_eq!(result, Ok(()));
    }
}
