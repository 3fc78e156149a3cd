//! In-memory object store with fault injection, for tests.

use crate::backup::upload::{
    CompletedPart, MultipartSession, ObjectInfo, ObjectStore, StoreError, StoreResult,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    UploadPart(u32),
    Complete(Vec<u32>),
    Abort,
}

#[derive(Default)]
struct State {
    next_session: u64,
    sessions: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    objects: BTreeMap<(String, String), (Vec<u8>, DateTime<Utc>)>,
    calls: Vec<Call>,
    fail_open: Option<StoreError>,
    fail_part: HashMap<u32, (StoreError, u32)>,
    fail_complete: Option<StoreError>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    part_delay: Option<Duration>,
    min_part_size: u64,
}

impl MemoryStore {
    pub fn with_part_delay(delay: Duration) -> Self {
        Self {
            part_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_min_part_size(min_part_size: u64) -> Self {
        Self {
            min_part_size,
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Fails the next `times` uploads of part `sequence` with `error`.
    pub fn fail_part(&self, sequence: u32, error: StoreError, times: u32) {
        self.lock().fail_part.insert(sequence, (error, times));
    }

    pub fn fail_open(&self, error: StoreError) {
        self.lock().fail_open = Some(error);
    }

    pub fn fail_complete(&self, error: StoreError) {
        self.lock().fail_complete = Some(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn part_uploads(&self, sequence: u32) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| **c == Call::UploadPart(sequence))
            .count()
    }

    pub fn count(&self, call: fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| call(c)).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, _)| data.clone())
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: &[u8], modified: DateTime<Utc>) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), (data.to_vec(), modified));
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl ObjectStore for MemoryStore {
    fn open_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<MultipartSession> {
        let mut state = self.lock();
        state.calls.push(Call::Open);
        if let Some(error) = state.fail_open.clone() {
            return Err(error);
        }
        state.next_session += 1;
        let session_id = format!("session-{}", state.next_session);
        state.sessions.insert(session_id.clone(), BTreeMap::new());
        Ok(MultipartSession::new(bucket, key, session_id))
    }

    fn upload_part(
        &self,
        session: &MultipartSession,
        sequence: u32,
        data: &[u8],
    ) -> StoreResult<String> {
        {
            let mut state = self.lock();
            state.calls.push(Call::UploadPart(sequence));
            if let Some((error, remaining)) = state.fail_part.get_mut(&sequence) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = self.part_delay {
            std::thread::sleep(delay);
        }
        let mut state = self.lock();
        state.in_flight -= 1;
        let parts = state
            .sessions
            .get_mut(session.session_id())
            .ok_or_else(|| StoreError::permanent("no such upload"))?;
        parts.insert(sequence, data.to_vec());
        Ok(hex::encode(Sha256::digest(data)))
    }

    fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::Complete(parts.iter().map(|p| p.sequence()).collect()));
        if let Some(error) = state.fail_complete.clone() {
            return Err(error);
        }
        let staged = state
            .sessions
            .remove(session.session_id())
            .ok_or_else(|| StoreError::permanent("no such upload"))?;
        let mut object = Vec::new();
        for part in parts {
            let data = staged
                .get(&part.sequence())
                .ok_or_else(|| StoreError::permanent("missing part"))?;
            if hex::encode(Sha256::digest(data)) != *part.tag() {
                return Err(StoreError::permanent("tag mismatch"));
            }
            object.extend_from_slice(data);
        }
        state.objects.insert(
            (session.bucket().clone(), session.key().clone()),
            (object, Utc::now()),
        );
        Ok(())
    }

    fn abort_multipart_upload(&self, session: &MultipartSession) -> StoreResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Abort);
        state.sessions.remove(session.session_id());
        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), (data, modified))| ObjectInfo::new(k.clone(), *modified, data.len() as u64))
            .collect())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.lock()
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::permanent("no such object"))
    }
}
