//! Multipart upload state machine.
//!
//! ```text
//! Idle -> SessionOpen -> PartInFlight* -> Completing -> Completed
//!   \__________\______________\______________\_______-> Aborted
//! ```
//!
//! The session is opened when the first part arrives. Up to `max_in_flight`
//! workers then pull parts from the chunker and upload them, each retrying
//! its own part on transient errors. Acknowledged tags are recorded in a
//! ledger keyed by sequence number, so completion always lists `1..=N` in
//! order no matter which upload finished first.

use crate::backup::chunker::{ChunkerOutput, Part};
use crate::backup::pipeline::cancel::{Cancellation, Stage};
use crate::backup::progress::ProgressCounters;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::retry::{with_retry, RetryConfig, RetryError};
use crate::backup::upload::{CompletedPart, MultipartSession, ObjectStore, StoreError};
use bon::Builder;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    SessionOpen,
    PartInFlight,
    Completing,
    Completed,
    Aborted,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug)]
struct PartRecord {
    status: PartStatus,
    len: u64,
    tag: Option<String>,
}

/// Result of a completed upload
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct UploadReport {
    #[getset(get = "pub")]
    session: MultipartSession,
    #[getset(get_copy = "pub")]
    parts: u32,
    #[getset(get_copy = "pub")]
    bytes: u64,
}

/// Parts still to be handed to workers
struct Feed {
    first: Option<Part>,
    rx: Receiver<ChunkerOutput>,
    end: Option<(u32, u64)>,
    closed: bool,
}

impl Feed {
    fn next_part(&mut self, cancel: &Cancellation) -> Option<Part> {
        if let Some(part) = self.first.take() {
            return Some(part);
        }
        if self.end.is_some() || self.closed || cancel.is_cancelled() {
            return None;
        }
        match self.rx.recv() {
            Ok(ChunkerOutput::Part(part)) => Some(part),
            Ok(ChunkerOutput::End { parts, bytes }) => {
                self.end = Some((parts, bytes));
                None
            }
            Err(_) => {
                self.closed = true;
                None
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Builder)]
pub struct UploadCoordinator {
    store: Arc<dyn ObjectStore>,
    #[builder(into)]
    bucket: String,
    #[builder(into)]
    key: String,
    max_in_flight: usize,
    retry: RetryConfig,
    cancel: Cancellation,
    counters: Arc<ProgressCounters>,
}

impl UploadCoordinator {
    fn transition(&self, state: &mut UploadState, next: UploadState) {
        tracing::debug!("Upload of {}/{}: {} -> {}", self.bucket, self.key, state, next);
        *state = next;
    }

    /// Consumes parts until the chunker signals the end, then completes the
    /// upload. Any failure or cancellation after the session was opened
    /// aborts it once, best effort.
    pub fn run(&self, rx: Receiver<ChunkerOutput>) -> Result<UploadReport> {
        let mut state = UploadState::Idle;

        let first = match rx.recv() {
            Ok(ChunkerOutput::Part(part)) => part,
            Ok(ChunkerOutput::End { .. }) => {
                return Err(Error::Encryption(
                    "ciphertext stream ended without producing any data".into(),
                ))
            }
            Err(_) => {
                return Err(Error::Cancelled(
                    "part stream closed before the first part".into(),
                ))
            }
        };
        self.cancel.check()?;

        let session = self.open_session()?;
        self.transition(&mut state, UploadState::SessionOpen);
        tracing::info!(
            "Opened multipart upload {} for {}/{}",
            session.session_id(),
            self.bucket,
            self.key
        );

        let outcome = self.upload_parts(&session, first, rx, &mut state);
        match outcome {
            Ok(report) => {
                self.transition(&mut state, UploadState::Completed);
                tracing::info!(
                    "Completed multipart upload {}: {} part(s), {} bytes",
                    session.session_id(),
                    report.parts,
                    report.bytes
                );
                Ok(report)
            }
            Err(e) => {
                self.abort(&session, &mut state);
                Err(e)
            }
        }
    }

    fn open_session(&self) -> Result<MultipartSession> {
        let opened = with_retry(&self.retry, &self.cancel, "Opening multipart upload", || {
            self.store.open_multipart_upload(&self.bucket, &self.key)
        });
        match opened {
            Ok(session) => Ok(session),
            Err(RetryError::Failed { error, .. }) => Err(Error::SessionOpen {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                source: error,
            }),
            Err(RetryError::Cancelled) => {
                Err(Error::Cancelled("cancelled while opening upload".into()))
            }
        }
    }

    fn upload_parts(
        &self,
        session: &MultipartSession,
        first: Part,
        rx: Receiver<ChunkerOutput>,
        state: &mut UploadState,
    ) -> Result<UploadReport> {
        let feed = Mutex::new(Feed {
            first: Some(first),
            rx,
            end: None,
            closed: false,
        });
        let ledger: Mutex<BTreeMap<u32, PartRecord>> = Mutex::new(BTreeMap::new());

        self.transition(state, UploadState::PartInFlight);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_in_flight)
            .thread_name(|i| format!("upload-{i}"))
            .build()?;
        pool.scope(|s| {
            for _ in 0..self.max_in_flight {
                s.spawn(|_| self.upload_worker(session, &feed, &ledger));
            }
        });

        let feed = feed.into_inner().unwrap_or_else(PoisonError::into_inner);
        self.cancel.check()?;
        let (parts, bytes) = feed.end.ok_or_else(|| {
            Error::Cancelled("part stream closed before its end".into())
        })?;
        drop(feed);

        let completed = self.verified_parts(session, ledger, parts, bytes)?;
        self.transition(state, UploadState::Completing);
        self.cancel.check()?;
        let result = with_retry(&self.retry, &self.cancel, "Completing multipart upload", || {
            self.store.complete_multipart_upload(session, &completed)
        });
        match result {
            Ok(()) => Ok(UploadReport {
                session: session.clone(),
                parts,
                bytes,
            }),
            Err(RetryError::Failed { error, .. }) => Err(Error::Completion {
                session_id: session.session_id().clone(),
                reason: error.to_string(),
            }),
            Err(RetryError::Cancelled) => {
                Err(Error::Cancelled("cancelled while completing upload".into()))
            }
        }
    }

    fn upload_worker(
        &self,
        session: &MultipartSession,
        feed: &Mutex<Feed>,
        ledger: &Mutex<BTreeMap<u32, PartRecord>>,
    ) {
        loop {
            let Some(part) = lock(feed).next_part(&self.cancel) else {
                return;
            };
            let sequence = part.sequence();
            let len = part.len() as u64;
            lock(ledger).insert(
                sequence,
                PartRecord {
                    status: PartStatus::Pending,
                    len,
                    tag: None,
                },
            );

            let result = if hex::encode(Sha256::digest(part.data().as_slice())) != *part.digest() {
                Err(RetryError::Failed {
                    attempts: 0,
                    error: StoreError::permanent("part changed after it was sealed"),
                })
            } else {
                set_status(ledger, sequence, PartStatus::Uploading);
                tracing::debug!("Uploading part {} ({} bytes)", sequence, len);
                with_retry(
                    &self.retry,
                    &self.cancel,
                    &format!("Uploading part {sequence}"),
                    || self.store.upload_part(session, sequence, part.data().as_slice()),
                )
            };

            match result {
                Ok(tag) => {
                    if let Some(record) = lock(ledger).get_mut(&sequence) {
                        record.status = PartStatus::Uploaded;
                        record.tag = Some(tag);
                    }
                    self.counters.add_uploaded(len);
                    tracing::debug!("Uploaded part {}", sequence);
                }
                Err(RetryError::Failed { attempts, error }) => {
                    set_status(ledger, sequence, PartStatus::Failed);
                    tracing::error!("Part {} failed after {} attempt(s): {}", sequence, attempts, error);
                    self.cancel.fail(
                        Stage::Upload,
                        Error::PartUpload {
                            sequence,
                            attempts,
                            source: error,
                        },
                    );
                    return;
                }
                Err(RetryError::Cancelled) => {
                    set_status(ledger, sequence, PartStatus::Failed);
                    return;
                }
            }
        }
    }

    /// Checks that exactly `1..=parts` were acknowledged and that they add up
    /// to the bytes the chunker produced.
    fn verified_parts(
        &self,
        session: &MultipartSession,
        ledger: Mutex<BTreeMap<u32, PartRecord>>,
        parts: u32,
        bytes: u64,
    ) -> Result<Vec<CompletedPart>> {
        let ledger = ledger.into_inner().unwrap_or_else(PoisonError::into_inner);
        let incomplete = |reason: String| Error::Completion {
            session_id: session.session_id().clone(),
            reason,
        };

        let sequences: Vec<u32> = ledger.keys().copied().collect();
        if sequences != (1..=parts).collect::<Vec<_>>() {
            return Err(incomplete(format!(
                "expected parts 1..={parts}, have {sequences:?}"
            )));
        }
        let uploaded: u64 = ledger.values().map(|r| r.len).sum();
        if uploaded != bytes {
            return Err(incomplete(format!(
                "parts hold {uploaded} bytes, ciphertext is {bytes} bytes"
            )));
        }

        ledger
            .into_iter()
            .map(|(sequence, record)| match (record.status, record.tag) {
                (PartStatus::Uploaded, Some(tag)) => Ok(CompletedPart::new(sequence, tag)),
                (status, _) => Err(incomplete(format!("part {sequence} is {status}"))),
            })
            .collect()
    }

    fn abort(&self, session: &MultipartSession, state: &mut UploadState) {
        self.transition(state, UploadState::Aborted);
        match self.store.abort_multipart_upload(session) {
            Ok(()) => tracing::info!("Aborted multipart upload {}", session.session_id()),
            Err(e) => tracing::warn!(
                "Failed to abort multipart upload {}: {}",
                session.session_id(),
                e
            ),
        }
    }
}

fn set_status(ledger: &Mutex<BTreeMap<u32, PartRecord>>, sequence: u32, status: PartStatus) {
    if let Some(record) = lock(ledger).get_mut(&sequence) {
        record.status = status;
    }
}
