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

//! Multipart upload sessions and the part scheduler shared by the
//! streaming writer and the copy drivers
//!
//! A [`MultipartSession`] owns one server-side multipart upload: its
//! upload id, the part tags collected so far, and the aborted flag. A
//! [`PartScheduler`] dispatches part operations either inline or onto a
//! caller-supplied [`Executor`], and harvests tags in part-number order
//! regardless of completion order. The first failed part aborts the
//! session; later parts observe the aborted flag and short-circuit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::client::{
    AbortMultipartRequest, ClientError, ClientErrorKind, ClientResult, CompleteMultipartRequest,
    CompletedPart, CreateMultipartRequest, ObjectClient, ObjectMetadata, BINARY_CONTENT_TYPE,
};
use crate::config::UploadSettings;
use crate::executor::Executor;
use crate::metrics::{Event, MetricsRecorder};
use crate::{Error, Result};

/// Pick the size of every non-final part for `total_size` bytes
///
/// Starts from the policy minimum and grows the part size only as far as
/// needed to stay within the part-count ceiling, clamped to the policy
/// maximum. The final part may be smaller than the returned size.
pub(crate) fn plan_part_size(total_size: u64, settings: &UploadSettings) -> Result<u64> {
    if total_size == 0 {
        return Err(Error::logic(
            "multipart upload chosen for an empty source, this must not happen",
        ));
    }

    if settings.max_part_number == 0 {
        return Err(Error::invalid_config("max_part_number must not be 0"));
    }
    if settings.min_upload_part_size == 0 {
        return Err(Error::invalid_config("min_upload_part_size must not be 0"));
    }
    if settings.max_upload_part_size < settings.min_upload_part_size {
        return Err(Error::invalid_config(
            "max_upload_part_size must not be less than min_upload_part_size",
        ));
    }

    let mut part_size = settings.min_upload_part_size;
    let mut num_parts = total_size.div_ceil(part_size);

    if num_parts > settings.max_part_number {
        part_size = total_size.div_ceil(settings.max_part_number);
        num_parts = total_size.div_ceil(part_size);
    }

    if part_size > settings.max_upload_part_size {
        part_size = settings.max_upload_part_size;
        num_parts = total_size.div_ceil(part_size);
    }

    if num_parts < 1
        || num_parts > settings.max_part_number
        || part_size < settings.min_upload_part_size
        || part_size > settings.max_upload_part_size
    {
        let violation = if num_parts < 1 {
            "number of parts is zero".to_string()
        } else if num_parts > settings.max_part_number {
            format!(
                "number of parts {} exceeds the limit {}",
                num_parts, settings.max_part_number
            )
        } else if part_size < settings.min_upload_part_size {
            format!(
                "size of a part {} is less than the minimum {}",
                part_size, settings.min_upload_part_size
            )
        } else {
            format!(
                "size of a part {} exceeds the maximum {}",
                part_size, settings.max_upload_part_size
            )
        };
        return Err(Error::invalid_config(format!(
            "{} while writing {} bytes: check max_part_number = {}, min_upload_part_size = {}, \
             max_upload_part_size = {}, max_single_part_upload_size = {}",
            violation,
            total_size,
            settings.max_part_number,
            settings.min_upload_part_size,
            settings.max_upload_part_size,
            settings.max_single_part_upload_size,
        )));
    }

    Ok(part_size)
}

/// Bookkeeping for one scheduled part operation
///
/// Results are published here by whichever thread ran the part; the tag
/// moves to the session's ordered tag list when the record reaches the
/// head of the queue.
#[derive(Debug, Default)]
struct PartTask {
    finished: bool,
    tag: Option<String>,
    error: Option<ClientError>,
}

#[derive(Debug, Default)]
struct TaskState {
    tasks: VecDeque<PartTask>,
    /// Records removed from the head of `tasks` so far; a task appended
    /// as the n-th addition lives at index `n - popped`
    popped: u64,
    added: u64,
    finished: u64,
    /// Part tags in part-number order
    tags: Vec<String>,
}

pub(crate) struct SessionInner {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    settings: UploadSettings,
    recorder: MetricsRecorder,
    upload_id: String,
    aborted: AtomicBool,
    state: Mutex<TaskState>,
    task_done: Condvar,
}

impl SessionInner {
    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Best-effort abort; tolerated repeatedly, so parts racing with a
    /// first abort can free their orphans with another one
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);

        info!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %self.upload_id,
            "aborting multipart upload",
        );
        self.recorder.hit(Event::AbortMultipartUpload);
        let request = AbortMultipartRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
        };
        if let Err(error) = self.client.abort_multipart_upload(request) {
            warn!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                %error,
                "failed to abort multipart upload",
            );
        }
    }
}

/// One server-side multipart upload, from create to complete or abort
pub(crate) struct MultipartSession {
    inner: Arc<SessionInner>,
}

impl MultipartSession {
    /// Acquire an upload id from the store
    pub(crate) fn create(
        client: Arc<dyn ObjectClient>,
        bucket: &str,
        key: &str,
        settings: UploadSettings,
        metadata: Option<ObjectMetadata>,
        recorder: MetricsRecorder,
    ) -> Result<Self> {
        let request = CreateMultipartRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: BINARY_CONTENT_TYPE,
            metadata,
            storage_class: settings.storage_class.clone(),
        };

        recorder.hit(Event::CreateMultipartUpload);
        let upload_id = client
            .create_multipart_upload(request)
            .map_err(|e| Error::remote("create multipart upload", bucket, key, e))?;

        debug!(bucket, key, upload_id = %upload_id, "multipart upload created");

        Ok(Self {
            inner: Arc::new(SessionInner {
                client,
                bucket: bucket.to_string(),
                key: key.to_string(),
                settings,
                recorder,
                upload_id,
                aborted: AtomicBool::new(false),
                state: Mutex::default(),
                task_done: Condvar::new(),
            }),
        })
    }

    pub(crate) fn upload_id(&self) -> String {
        self.inner.upload_id.clone()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted()
    }

    /// Number of part tags collected so far
    pub(crate) fn collected_parts(&self) -> usize {
        self.inner.state.lock().tags.len()
    }

    /// A scheduler dispatching part operations of one request shape
    /// through `submit`
    pub(crate) fn scheduler<R>(
        &self,
        executor: Option<Arc<dyn Executor>>,
        submit: impl Fn(&dyn ObjectClient, R) -> ClientResult<String> + Send + Sync + 'static,
    ) -> PartScheduler<R> {
        PartScheduler {
            inner: Arc::clone(&self.inner),
            executor,
            submit: Arc::new(submit),
        }
    }

    /// Block until every scheduled part finished, harvesting tags in
    /// part-number order
    ///
    /// The first failed part aborts the session and surfaces; records
    /// after it are discarded.
    pub(crate) fn wait_all(&self) -> Result<()> {
        let inner = &self.inner;
        let mut failure = None;
        {
            let mut state = inner.state.lock();
            while state.added != state.finished {
                inner.task_done.wait(&mut state);
            }
            while let Some(task) = state.tasks.pop_front() {
                state.popped += 1;
                if let Some(error) = task.error {
                    failure = Some(error);
                    state.popped += state.tasks.len() as u64;
                    state.tasks.clear();
                    break;
                }
                if let Some(tag) = task.tag {
                    state.tags.push(tag);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(error) => {
                inner.abort();
                Err(Error::remote("upload part", &inner.bucket, &inner.key, error))
            }
        }
    }

    /// Harvest tags of parts that already finished, without blocking
    ///
    /// Lets a producer pipeline new parts against finished ones while
    /// keeping the task queue short. A harvested failure waits out the
    /// remaining parts, aborts, and surfaces.
    pub(crate) fn drain_ready(&self) -> Result<()> {
        let inner = &self.inner;
        let mut failure = None;
        {
            let mut state = inner.state.lock();
            while state.tasks.front().is_some_and(|task| task.finished) {
                let task = state.tasks.pop_front().expect("non-empty queue");
                state.popped += 1;
                if let Some(error) = task.error {
                    while state.added != state.finished {
                        inner.task_done.wait(&mut state);
                    }
                    failure = Some(error);
                    state.popped += state.tasks.len() as u64;
                    state.tasks.clear();
                    break;
                }
                if let Some(tag) = task.tag {
                    state.tags.push(tag);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(error) => {
                inner.abort();
                Err(Error::remote("upload part", &inner.bucket, &inner.key, error))
            }
        }
    }

    /// Stitch the collected parts into the destination object
    ///
    /// The spurious `NoSuchKey` answer some stores give to freshly
    /// created keys is retried up to the configured budget; exhausting
    /// the budget surfaces the last error.
    pub(crate) fn complete(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.aborted() {
            return Ok(());
        }

        let tags = inner.state.lock().tags.clone();

        debug!(
            bucket = %inner.bucket,
            key = %inner.key,
            upload_id = %inner.upload_id,
            parts = tags.len(),
            "completing multipart upload",
        );

        if tags.is_empty() {
            return Err(Error::remote(
                "complete multipart upload",
                &inner.bucket,
                &inner.key,
                ClientError::new(
                    ClientErrorKind::Other,
                    "failed to complete multipart upload: no parts have been uploaded",
                ),
            ));
        }

        let parts: Vec<CompletedPart> = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| CompletedPart {
                e_tag: tag.clone(),
                part_number: i as u64 + 1,
            })
            .collect();

        let max_retries = inner.settings.unexpected_error_retries();
        let mut attempt = 1;
        loop {
            inner.recorder.hit(Event::CompleteMultipartUpload);
            let request = CompleteMultipartRequest {
                bucket: inner.bucket.clone(),
                key: inner.key.clone(),
                upload_id: inner.upload_id.clone(),
                parts: parts.clone(),
            };

            match inner.client.complete_multipart_upload(request) {
                Ok(()) => {
                    info!(
                        bucket = %inner.bucket,
                        key = %inner.key,
                        upload_id = %inner.upload_id,
                        parts = tags.len(),
                        "multipart upload completed",
                    );
                    return Ok(());
                }
                Err(error)
                    if error.kind == ClientErrorKind::NoSuchKey && attempt < max_retries =>
                {
                    info!(
                        bucket = %inner.bucket,
                        key = %inner.key,
                        upload_id = %inner.upload_id,
                        attempt,
                        "complete multipart upload answered NoSuchKey, will retry",
                    );
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Error::remote(
                        "complete multipart upload",
                        &inner.bucket,
                        &inner.key,
                        ClientError::new(
                            error.kind,
                            format!(
                                "{}, tags: {}",
                                error.message,
                                tags.iter().join(" ")
                            ),
                        ),
                    ));
                }
            }
        }
    }

    /// Best-effort abort, see [`SessionInner::abort`]
    pub(crate) fn abort(&self) {
        self.inner.abort()
    }
}

impl std::fmt::Debug for MultipartSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartSession")
            .field("bucket", &self.inner.bucket)
            .field("key", &self.inner.key)
            .field("upload_id", &self.inner.upload_id)
            .field("aborted", &self.inner.aborted())
            .finish()
    }
}

type SubmitFn<R> = dyn Fn(&dyn ObjectClient, R) -> ClientResult<String> + Send + Sync;

/// Dispatches part operations inline or onto the executor
///
/// Part requests are built by the caller on its own thread; only the
/// submission runs in the background. The scheduler imposes no
/// concurrency limit of its own, the executor's parallelism bounds it.
pub(crate) struct PartScheduler<R> {
    inner: Arc<SessionInner>,
    executor: Option<Arc<dyn Executor>>,
    submit: Arc<SubmitFn<R>>,
}

impl<R: Send + 'static> PartScheduler<R> {
    /// Run one part operation, inline when no executor was supplied
    pub(crate) fn schedule(&self, request: R) -> Result<()> {
        let inner = &self.inner;

        let Some(executor) = &self.executor else {
            if inner.aborted() {
                return Ok(());
            }
            return match (self.submit)(inner.client.as_ref(), request) {
                Ok(tag) => {
                    inner.state.lock().tags.push(tag);
                    Ok(())
                }
                Err(error) => {
                    inner.abort();
                    Err(Error::remote("upload part", &inner.bucket, &inner.key, error))
                }
            };
        };

        let seq = {
            let mut state = inner.state.lock();
            let seq = state.added;
            state.added += 1;
            state.tasks.push_back(PartTask::default());
            seq
        };

        let session = Arc::clone(inner);
        let submit = Arc::clone(&self.submit);
        executor.submit(Box::new(move || {
            let outcome = if session.aborted() {
                Ok(None)
            } else {
                match submit(session.client.as_ref(), request) {
                    Ok(tag) => Ok(Some(tag)),
                    Err(error) => {
                        session.abort();
                        Err(error)
                    }
                }
            };

            let mut state = session.state.lock();
            let index = (seq - state.popped) as usize;
            let task = &mut state.tasks[index];
            match outcome {
                Ok(tag) => task.tag = tag,
                Err(error) => task.error = Some(error),
            }
            task.finished = true;
            state.finished += 1;
            // Notify while holding the lock: the owner blocked in
            // wait_all must not resume and destruct the condvar first
            session.task_done.notify_all();
        }));

        Ok(())
    }
}

impl<R> std::fmt::Debug for PartScheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartScheduler")
            .field("background", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClient;
    use crate::metrics::NoopMetrics;
    use std::time::Duration;

    fn settings(min: u64, max: u64, max_parts: u64) -> UploadSettings {
        UploadSettings {
            min_upload_part_size: min,
            max_upload_part_size: max,
            max_part_number: max_parts,
            ..Default::default()
        }
    }

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Arc::new(NoopMetrics), false)
    }

    #[test]
    fn plan_small_upload_uses_minimum() {
        let settings = settings(5, 100, 10);
        assert_eq!(plan_part_size(1, &settings).unwrap(), 5);
        assert_eq!(plan_part_size(50, &settings).unwrap(), 5);
    }

    #[test]
    fn plan_grows_part_size_to_fit_ceiling() {
        let settings = settings(5, 100, 10);
        // 501 bytes in at most 10 parts needs parts of ceil(501/10) = 51
        let part_size = plan_part_size(501, &settings).unwrap();
        assert_eq!(part_size, 51);
        assert!(501u64.div_ceil(part_size) <= 10);
    }

    #[test]
    fn plan_rejects_unsatisfiable_policy() {
        let settings = settings(5, 100, 10);
        // 10 parts of 100 max 1000 bytes
        let err = plan_part_size(1001, &settings).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }), "{err}");
        let message = err.to_string();
        assert!(message.contains("exceeds"), "{message}");
        assert!(message.contains("max_part_number = 10"), "{message}");
    }

    #[test]
    fn plan_rejects_empty_source() {
        let err = plan_part_size(0, &settings(5, 100, 10)).unwrap_err();
        assert!(matches!(err, Error::Logic { .. }), "{err}");
    }

    #[test]
    fn plan_rejects_zero_limits() {
        assert!(plan_part_size(10, &settings(0, 100, 10)).is_err());
        assert!(plan_part_size(10, &settings(5, 100, 0)).is_err());
        assert!(plan_part_size(10, &settings(5, 4, 10)).is_err());
    }

    #[test]
    fn plan_bounds_hold_across_sizes() {
        let settings = settings(5 * 1024 * 1024, 5 * 1024 * 1024 * 1024, 10_000);
        for total in [
            1,
            5 * 1024 * 1024,
            5 * 1024 * 1024 + 1,
            123_456_789_012,
            50_000 * 5 * 1024 * 1024,
        ] {
            let part_size = plan_part_size(total, &settings).unwrap();
            assert!(part_size >= settings.min_upload_part_size);
            assert!(part_size <= settings.max_upload_part_size);
            let num_parts = total.div_ceil(part_size);
            assert!(num_parts >= 1 && num_parts <= settings.max_part_number);
            let final_part = total - (num_parts - 1) * part_size;
            assert!(final_part > 0 && final_part <= part_size, "{total}");
        }
    }

    fn session(client: &Arc<InMemoryClient>) -> MultipartSession {
        let client: Arc<dyn ObjectClient> = Arc::<InMemoryClient>::clone(client);
        MultipartSession::create(
            client,
            "bucket",
            "key",
            UploadSettings::default(),
            None,
            recorder(),
        )
        .unwrap()
    }

    /// Runs each task on its own thread after a delay, so completion
    /// order differs from schedule order
    fn staggered_executor() -> Arc<dyn Executor> {
        let counter = std::sync::atomic::AtomicU64::new(0);
        Arc::new(move |task: crate::executor::Task| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis((7 - (n % 8)) * 3);
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                task();
            });
        })
    }

    #[test]
    fn tags_collected_in_schedule_order() {
        let client = Arc::new(InMemoryClient::default());
        let session = session(&client);
        let upload_id = session.upload_id();

        let scheduler = session.scheduler(
            Some(staggered_executor()),
            move |client: &dyn ObjectClient, part_number: u64| {
                client.upload_part(crate::client::UploadPartRequest {
                    bucket: "bucket".into(),
                    key: "key".into(),
                    upload_id: upload_id.clone(),
                    part_number,
                    content_length: 1,
                    body: crate::client::Body::Payload(vec![part_number as u8].into()),
                    content_type: BINARY_CONTENT_TYPE,
                })
            },
        );

        for part_number in 1..=16u64 {
            scheduler.schedule(part_number).unwrap();
        }
        session.wait_all().unwrap();
        session.complete().unwrap();

        let stored = client.object("bucket", "key").unwrap();
        let expected: Vec<u8> = (1..=16).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn failed_part_aborts_session() {
        let client = Arc::new(InMemoryClient::default());
        let session = session(&client);

        let scheduler = session.scheduler(
            Some(staggered_executor()),
            |_: &dyn ObjectClient, part_number: u64| {
                if part_number == 3 {
                    Err(ClientError::new(ClientErrorKind::Other, "boom"))
                } else {
                    Ok(format!("tag-{part_number}"))
                }
            },
        );

        for part_number in 1..=5u64 {
            scheduler.schedule(part_number).unwrap();
        }
        let err = session.wait_all().unwrap_err();
        assert!(matches!(err, Error::Remote { .. }), "{err}");
        assert!(session.is_aborted());
    }

    #[test]
    fn complete_without_parts_is_an_error() {
        let client = Arc::new(InMemoryClient::default());
        let session = session(&client);
        let err = session.complete().unwrap_err();
        assert!(err.to_string().contains("no parts"), "{err}");
    }
}
