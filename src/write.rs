// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Streaming writes of producer bytes to a destination key
//!
//! A [`StoreWriter`] buffers produced bytes and decides lazily between a
//! single `PutObject` and a multipart upload: the moment buffered bytes
//! exceed the single-part threshold a multipart upload is opened, and
//! from then on full parts are handed to the scheduler as they fill. The
//! part size starts at the policy minimum and grows geometrically with
//! the number of parts already emitted, so the part-count ceiling is not
//! hit on large uploads while short uploads still finish promptly.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::client::{
    Body, ClientErrorKind, ClientResult, ObjectClient, PutObjectRequest, UploadPartRequest,
    BINARY_CONTENT_TYPE,
};
use crate::copy::check_object_after_upload;
use crate::metrics::{Event, MetricsRecorder};
use crate::multipart::{MultipartSession, PartScheduler};
use crate::payload::{PartBuffer, PartPayload};
use crate::{Error, Result, TransferOptions};

/// Parts beyond this count draw a warning; the protocol ceiling is left
/// for the server to enforce, since custom stores may accept more
const PART_COUNT_WARN_THRESHOLD: usize = 10_000;

/// Outcome slot of a single `PutObject` posted to the executor
#[derive(Default)]
struct PutTask {
    finished: bool,
    result: Option<ClientResult<()>>,
}

struct PutState {
    task: Mutex<PutTask>,
    done: Condvar,
}

/// A streaming writer depositing produced bytes at `bucket`/`key`
///
/// One instance serves one producer; it is not shareable. The producer
/// calls [`write`](Self::write) any number of times and must call
/// [`finalize`](Self::finalize) exactly once; dropping an unfinalized
/// writer is a programming error, detected loudly.
pub struct StoreWriter {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    options: TransferOptions,
    recorder: MetricsRecorder,

    buffer: PartBuffer,
    total_written: u64,
    upload_part_size: u64,
    part_number: u64,

    session: Option<(MultipartSession, PartScheduler<UploadPartRequest>)>,
    put_task: Option<Arc<PutState>>,

    is_prefinalized: bool,
    finalized: bool,
    failed: bool,
}

impl StoreWriter {
    /// Create a writer for `bucket`/`key`
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        options: TransferOptions,
    ) -> Self {
        let recorder = options.recorder();
        let upload_part_size = options.settings.min_upload_part_size;
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
            options,
            recorder,
            buffer: PartBuffer::default(),
            total_written: 0,
            upload_part_size,
            part_number: 0,
            session: None,
            put_task: None,
            is_prefinalized: false,
            finalized: false,
            failed: false,
        }
    }

    /// Append producer bytes
    ///
    /// Appending is cheap; a remote round-trip only happens inline when
    /// no executor was supplied and a part boundary is crossed.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.is_prefinalized {
            return Err(Error::logic("write called after pre_finalize"));
        }
        if self.failed {
            return Err(Error::logic("write called after a failed write"));
        }
        match self.write_impl(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    fn write_impl(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.buffer.extend_from_slice(data);
        self.total_written += data.len() as u64;
        self.recorder.count(Event::WriteBytes, data.len() as u64);
        if let Some(throttler) = &self.options.throttler {
            throttler.add(
                data.len() as u64,
                Event::ThrottlerBytes,
                Event::ThrottlerSleepMicroseconds,
            );
        }

        if self.session.is_none()
            && self.buffer.len() > self.options.settings.max_single_part_upload_size
        {
            self.open_multipart()?;
        }

        // emit full parts, leaving the remainder buffered; the part size
        // may grow between iterations
        while self.session.is_some() && self.buffer.len() > self.upload_part_size {
            let payload = self.buffer.split_to(self.upload_part_size);
            self.write_part(payload)?;
        }

        if let Some((session, _)) = &self.session {
            session.drain_ready()?;
        }
        Ok(())
    }

    /// Flush the remaining buffered bytes as the final part or as a
    /// single `PutObject`
    ///
    /// Implicit in [`finalize`](Self::finalize); no further writes are
    /// accepted afterwards.
    pub fn pre_finalize(&mut self) -> Result<()> {
        if self.is_prefinalized {
            return Ok(());
        }
        self.is_prefinalized = true;

        let flushed = if self.session.is_none() {
            self.single_part_upload()
        } else {
            let payload = self.buffer.freeze();
            self.write_part(payload)
        };
        if let Err(e) = flushed {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Wait out background parts, complete the upload, and optionally
    /// verify the destination exists
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.failed {
            return Err(Error::logic("finalize called after a failed write"));
        }
        match self.finalize_impl() {
            Ok(()) => Ok(()),
            Err(e) => {
                // terminal either way; the drop guard must not retry
                self.finalized = true;
                Err(e)
            }
        }
    }

    /// Terminal failure: no further remote calls except a best-effort
    /// abort of an open upload
    fn fail(&mut self) {
        if self.failed {
            return;
        }
        self.failed = true;
        if let Some((session, _)) = &self.session {
            session.abort();
        }
    }

    fn finalize_impl(&mut self) -> Result<()> {
        self.pre_finalize()?;

        if let Some((session, _)) = &self.session {
            session.wait_all()?;
            session.complete()?;
        }
        self.wait_single_part_upload()?;

        if self.options.settings.check_objects_after_upload {
            check_object_after_upload(self.client.as_ref(), &self.recorder, &self.bucket, &self.key)?;
        }

        self.finalized = true;
        Ok(())
    }

    /// Total bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.total_written
    }

    fn open_multipart(&mut self) -> Result<()> {
        let session = MultipartSession::create(
            Arc::clone(&self.client),
            &self.bucket,
            &self.key,
            self.options.settings.clone(),
            self.options.metadata.clone(),
            self.recorder.clone(),
        )?;

        let scheduler = {
            let recorder = self.recorder.clone();
            session.scheduler(
                self.options.executor.clone(),
                move |client: &dyn ObjectClient, request: UploadPartRequest| {
                    recorder.hit(Event::UploadPart);
                    client.upload_part(request)
                },
            )
        };

        self.session = Some((session, scheduler));
        Ok(())
    }

    fn write_part(&mut self, payload: PartPayload) -> Result<()> {
        let size = payload.content_length();
        if size == 0 {
            debug!("skipping empty part");
            return Ok(());
        }

        let (session, scheduler) = self.session.as_ref().expect("multipart upload open");

        if session.collected_parts() == PART_COUNT_WARN_THRESHOLD {
            warn!(
                bucket = %self.bucket,
                key = %self.key,
                "upload reached the part count most stores allow, the server may reject it",
            );
        }

        self.part_number += 1;
        let settings = &self.options.settings;
        if self.part_number > settings.max_part_number {
            return Err(Error::invalid_config(format!(
                "part number exceeded {} while writing {} bytes: check min_upload_part_size = {}, \
                 max_upload_part_size = {}, upload_part_size_multiply_factor = {}, \
                 upload_part_size_multiply_parts_count_threshold = {}, \
                 max_single_part_upload_size = {}",
                settings.max_part_number,
                self.total_written,
                settings.min_upload_part_size,
                settings.max_upload_part_size,
                settings.upload_part_size_multiply_factor,
                settings.upload_part_size_multiply_parts_count_threshold,
                settings.max_single_part_upload_size,
            )));
        }

        debug!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %session.upload_id(),
            part_number = self.part_number,
            size,
            "writing part",
        );

        let request = UploadPartRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: session.upload_id(),
            part_number: self.part_number,
            content_length: size,
            body: Body::Payload(payload),
            content_type: BINARY_CONTENT_TYPE,
        };

        let threshold = settings.upload_part_size_multiply_parts_count_threshold;
        if threshold > 0 && self.part_number % threshold == 0 {
            self.upload_part_size = self
                .upload_part_size
                .saturating_mul(settings.upload_part_size_multiply_factor)
                .min(settings.max_upload_part_size);
        }

        scheduler.schedule(request)
    }

    fn single_part_upload(&mut self) -> Result<()> {
        let payload = self.buffer.freeze();
        let size = payload.content_length();
        debug!(
            bucket = %self.bucket,
            key = %self.key,
            size,
            background = self.options.executor.is_some(),
            "making single part upload",
        );

        let Some(executor) = self.options.executor.clone() else {
            return self.process_put(payload);
        };

        let state = Arc::new(PutState {
            task: Mutex::new(PutTask::default()),
            done: Condvar::new(),
        });
        self.put_task = Some(Arc::clone(&state));

        let client = Arc::clone(&self.client);
        let recorder = self.recorder.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let metadata = self.options.metadata.clone();
        let settings = self.options.settings.clone();
        executor.submit(Box::new(move || {
            let result = process_put_request(
                client.as_ref(),
                &recorder,
                &bucket,
                &key,
                payload,
                metadata,
                settings.storage_class.clone(),
                settings.unexpected_error_retries(),
            );
            let mut task = state.task.lock();
            task.result = Some(result);
            task.finished = true;
            // Notify while holding the lock: the owner blocked in
            // finalize must not resume and destruct the condvar first
            state.done.notify_all();
        }));
        Ok(())
    }

    fn process_put(&self, payload: PartPayload) -> Result<()> {
        process_put_request(
            self.client.as_ref(),
            &self.recorder,
            &self.bucket,
            &self.key,
            payload,
            self.options.metadata.clone(),
            self.options.settings.storage_class.clone(),
            self.options.settings.unexpected_error_retries(),
        )
        .map_err(|e| Error::remote("put object", &self.bucket, &self.key, e))
    }

    fn wait_single_part_upload(&mut self) -> Result<()> {
        let Some(state) = self.put_task.take() else {
            return Ok(());
        };
        let mut task = state.task.lock();
        while !task.finished {
            state.done.wait(&mut task);
        }
        match task.result.take().expect("finished task has a result") {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::remote("put object", &self.bucket, &self.key, e)),
        }
    }
}

/// Issue the `PutObject`, retrying the spurious `NoSuchKey` answer some
/// stores give to freshly created keys
#[allow(clippy::too_many_arguments)]
fn process_put_request(
    client: &dyn ObjectClient,
    recorder: &MetricsRecorder,
    bucket: &str,
    key: &str,
    payload: PartPayload,
    metadata: Option<crate::client::ObjectMetadata>,
    storage_class: Option<String>,
    max_retries: usize,
) -> ClientResult<()> {
    let mut attempt = 1;
    loop {
        let request = PutObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_length: payload.content_length(),
            body: Body::Payload(payload.clone()),
            metadata: metadata.clone(),
            storage_class: storage_class.clone(),
            content_type: BINARY_CONTENT_TYPE,
        };

        recorder.hit(Event::PutObject);
        match client.put_object(request) {
            Ok(()) => {
                debug!(bucket, key, size = payload.content_length(), "single part upload completed");
                return Ok(());
            }
            Err(error) if error.kind == ClientErrorKind::NoSuchKey && attempt < max_retries => {
                info!(bucket, key, attempt, "single part upload answered NoSuchKey, will retry");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

impl std::io::Write for StoreWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        StoreWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("total_written", &self.total_written)
            .field("part_number", &self.part_number)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if self.finalized || self.failed {
            return;
        }
        if cfg!(debug_assertions) && !std::thread::panicking() {
            panic!(
                "StoreWriter for {}/{} dropped without finalize, this is a bug",
                self.bucket, self.key
            );
        }
        error!(
            bucket = %self.bucket,
            key = %self.key,
            "StoreWriter dropped without finalize, attempting best-effort finalization",
        );
        if let Err(e) = self.finalize_impl() {
            error!(
                bucket = %self.bucket,
                key = %self.key,
                error = %e,
                "best-effort finalization failed",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClient;
    use crate::UploadSettings;
    use rand::prelude::StdRng;
    use rand::{Rng, SeedableRng};

    fn options(single_put: u64, min_part: u64) -> TransferOptions {
        TransferOptions {
            settings: UploadSettings {
                min_upload_part_size: min_part,
                max_single_part_upload_size: single_put,
                check_objects_after_upload: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn writer(client: &Arc<InMemoryClient>, options: TransferOptions) -> StoreWriter {
        let client: Arc<dyn ObjectClient> = Arc::<InMemoryClient>::clone(client);
        StoreWriter::new(client, "b", "k", options)
    }

    #[test]
    fn empty_write_creates_empty_object() {
        let client = Arc::new(InMemoryClient::default());
        let mut writer = writer(&client, options(100, 10));
        writer.finalize().unwrap();
        assert_eq!(client.object("b", "k").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn random_writes_roundtrip() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            let client = Arc::new(InMemoryClient::default());
            let mut writer = writer(&client, options(64, 16));
            let mut expected = Vec::new();
            for _ in 0..50 {
                let len = rng.random_range(0..40);
                let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                expected.extend_from_slice(&chunk);
                writer.write(&chunk).unwrap();
            }
            writer.finalize().unwrap();
            assert_eq!(client.object("b", "k").unwrap(), expected);
            assert_eq!(client.open_uploads(), 0);
        }
    }

    #[test]
    fn large_single_write_is_split_into_parts() {
        let client = Arc::new(InMemoryClient::default());
        let mut writer = writer(&client, options(64, 16));
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        writer.write(&data).unwrap();
        writer.finalize().unwrap();
        assert_eq!(client.object("b", "k").unwrap(), data);
    }

    #[test]
    fn write_after_pre_finalize_is_rejected() {
        let client = Arc::new(InMemoryClient::default());
        let mut writer = writer(&client, options(100, 10));
        writer.write(b"data").unwrap();
        writer.pre_finalize().unwrap();
        let err = writer.write(b"more").unwrap_err();
        assert!(matches!(err, Error::Logic { .. }), "{err}");
        writer.finalize().unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped without finalize")]
    fn dropping_unfinalized_writer_panics() {
        let client = Arc::new(InMemoryClient::default());
        let mut w = writer(&client, options(100, 10));
        w.write(b"data").unwrap();
        drop(w);
    }
}
