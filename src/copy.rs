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

//! Deposit the contents of a seekable reader, or a byte range of an
//! existing remote object, at a destination key
//!
//! Small payloads go through a single `PutObject` or `CopyObject`; larger
//! ones through a multipart upload with a uniform planned part size. A
//! single-shot operation the server rejects as too large falls back to
//! the multipart path mid-operation, re-reading the source if needed.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{
    format_source_range, Body, ClientErrorKind, CopyObjectRequest, HeadObjectRequest,
    ObjectClient, PutObjectRequest, UploadPartCopyRequest, UploadPartRequest,
    BINARY_CONTENT_TYPE,
};
use crate::metrics::{Event, MetricsRecorder};
use crate::multipart::{plan_part_size, MultipartSession, PartScheduler};
use crate::{Error, Result, TransferOptions};

/// A source of bytes that can be re-read from any position
pub trait SeekableSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekableSource for T {}

/// Produces fresh readers positioned at the start of the source
///
/// Invoked once per attempt and once per uploaded part, so retries and
/// concurrent part uploads each get their own reader.
pub type SourceFactory<'a> = dyn Fn() -> std::io::Result<Box<dyn SeekableSource>> + 'a;

/// Upload `size` bytes starting at `offset` of the factory's source to
/// `dest_bucket`/`dest_key`
pub fn copy_data_to_store(
    client: Arc<dyn ObjectClient>,
    create_source: &SourceFactory<'_>,
    offset: u64,
    size: u64,
    dest_bucket: &str,
    dest_key: &str,
    options: &TransferOptions,
) -> Result<()> {
    let recorder = options.recorder();
    let upload = DataUpload {
        client,
        create_source,
        offset,
        size,
        bucket: dest_bucket,
        key: dest_key,
        options,
        recorder,
    };

    if size <= options.settings.max_single_part_upload_size {
        upload.single_put()?;
    } else {
        upload.multipart()?;
    }

    if options.settings.check_objects_after_upload {
        check_object_after_upload(upload.client.as_ref(), &upload.recorder, dest_bucket, dest_key)?;
    }
    Ok(())
}

/// Server-side copy `src_size` bytes starting at `src_offset` of
/// `src_bucket`/`src_key` to `dest_bucket`/`dest_key`
///
/// A range starting at the first byte and within the single-operation
/// limit is copied with one `CopyObject`, which transfers the object in
/// its entirety; `src_size` is therefore expected to be the object's
/// full size in that case. Any other range goes through multipart
/// `UploadPartCopy`, which honors the range exactly.
#[allow(clippy::too_many_arguments)]
pub fn copy_store_object(
    client: Arc<dyn ObjectClient>,
    src_bucket: &str,
    src_key: &str,
    src_offset: u64,
    src_size: u64,
    dest_bucket: &str,
    dest_key: &str,
    options: &TransferOptions,
) -> Result<()> {
    let recorder = options.recorder();
    let copy = ObjectCopy {
        client,
        src_bucket,
        src_key,
        offset: src_offset,
        size: src_size,
        bucket: dest_bucket,
        key: dest_key,
        options,
        recorder,
    };

    // CopyObject cannot copy a sub-range, so offset ranges always take
    // the multipart path
    if src_offset == 0 && src_size <= options.settings.max_single_operation_copy_size {
        copy.single_copy()?;
    } else {
        copy.multipart()?;
    }

    if options.settings.check_objects_after_upload {
        check_object_after_upload(copy.client.as_ref(), &copy.recorder, dest_bucket, dest_key)?;
    }
    Ok(())
}

/// HEAD the destination, surfacing absence as a remote failure
pub(crate) fn check_object_after_upload(
    client: &dyn ObjectClient,
    recorder: &MetricsRecorder,
    bucket: &str,
    key: &str,
) -> Result<()> {
    debug!(bucket, key, "checking object exists after upload");
    recorder.hit(Event::HeadObject);
    client
        .head_object(HeadObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .map(|_| ())
        .map_err(|e| Error::remote("head object after upload", bucket, key, e))
}

struct DataUpload<'a> {
    client: Arc<dyn ObjectClient>,
    create_source: &'a SourceFactory<'a>,
    offset: u64,
    size: u64,
    bucket: &'a str,
    key: &'a str,
    options: &'a TransferOptions,
    recorder: MetricsRecorder,
}

impl DataUpload<'_> {
    /// A reader over `[offset, offset + size)` of a fresh source
    fn range_reader(&self, offset: u64, size: u64) -> Result<Box<dyn Read + Send>> {
        let mut source = (self.create_source)().map_err(Error::source)?;
        source.seek(SeekFrom::Start(offset)).map_err(Error::source)?;
        Ok(Box::new(source.take(size)))
    }

    fn single_put(&self) -> Result<()> {
        let max_retries = self.options.settings.unexpected_error_retries();
        let mut attempt = 1;
        loop {
            let request = PutObjectRequest {
                bucket: self.bucket.to_string(),
                key: self.key.to_string(),
                content_length: self.size,
                body: Body::Reader(self.range_reader(self.offset, self.size)?),
                metadata: self.options.metadata.clone(),
                storage_class: self.options.settings.storage_class.clone(),
                content_type: BINARY_CONTENT_TYPE,
            };

            self.recorder.hit(Event::PutObject);
            match self.client.put_object(request) {
                Ok(()) => {
                    debug!(
                        bucket = %self.bucket,
                        key = %self.key,
                        size = self.size,
                        "single part upload completed",
                    );
                    return Ok(());
                }
                Err(error) if error.requires_multipart() => {
                    info!(
                        bucket = %self.bucket,
                        key = %self.key,
                        size = self.size,
                        %error,
                        "single part upload rejected, retrying with multipart upload",
                    );
                    return self.multipart();
                }
                Err(error)
                    if error.kind == ClientErrorKind::NoSuchKey && attempt < max_retries =>
                {
                    info!(
                        bucket = %self.bucket,
                        key = %self.key,
                        attempt,
                        "single part upload answered NoSuchKey, will retry",
                    );
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Error::remote("put object", self.bucket, self.key, error))
                }
            }
        }
    }

    fn multipart(&self) -> Result<()> {
        let part_size = plan_part_size(self.size, &self.options.settings)?;
        let session = MultipartSession::create(
            Arc::clone(&self.client),
            self.bucket,
            self.key,
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

        if let Err(error) = self.schedule_parts(&session, &scheduler, part_size) {
            session.abort();
            return Err(error);
        }

        session.wait_all()?;
        session.complete()
    }

    fn schedule_parts(
        &self,
        session: &MultipartSession,
        scheduler: &PartScheduler<UploadPartRequest>,
        part_size: u64,
    ) -> Result<()> {
        let upload_id = session.upload_id();
        let end = self.offset + self.size;
        let mut position = self.offset;
        let mut part_number = 0u64;

        while position < end {
            if session.is_aborted() {
                break;
            }
            part_number += 1;
            let next = (position + part_size).min(end);
            let len = next - position;

            debug!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %upload_id,
                part_number,
                size = len,
                "writing part",
            );
            let request = UploadPartRequest {
                bucket: self.bucket.to_string(),
                key: self.key.to_string(),
                upload_id: upload_id.clone(),
                part_number,
                content_length: len,
                body: Body::Reader(self.range_reader(position, len)?),
                content_type: BINARY_CONTENT_TYPE,
            };
            scheduler.schedule(request)?;
            position = next;
        }
        Ok(())
    }
}

struct ObjectCopy<'a> {
    client: Arc<dyn ObjectClient>,
    src_bucket: &'a str,
    src_key: &'a str,
    offset: u64,
    size: u64,
    bucket: &'a str,
    key: &'a str,
    options: &'a TransferOptions,
    recorder: MetricsRecorder,
}

impl ObjectCopy<'_> {
    fn single_copy(&self) -> Result<()> {
        let max_retries = self.options.settings.unexpected_error_retries();
        let mut attempt = 1;
        loop {
            let request = CopyObjectRequest {
                src_bucket: self.src_bucket.to_string(),
                src_key: self.src_key.to_string(),
                bucket: self.bucket.to_string(),
                key: self.key.to_string(),
                metadata: self.options.metadata.clone(),
                storage_class: self.options.settings.storage_class.clone(),
                content_type: BINARY_CONTENT_TYPE,
            };

            self.recorder.hit(Event::CopyObject);
            match self.client.copy_object(request) {
                Ok(()) => {
                    debug!(
                        bucket = %self.bucket,
                        key = %self.key,
                        size = self.size,
                        "single operation copy completed",
                    );
                    return Ok(());
                }
                Err(error) if error.requires_multipart() => {
                    info!(
                        bucket = %self.bucket,
                        key = %self.key,
                        size = self.size,
                        %error,
                        "single operation copy rejected, retrying with multipart upload copy",
                    );
                    return self.multipart();
                }
                Err(error)
                    if error.kind == ClientErrorKind::NoSuchKey && attempt < max_retries =>
                {
                    info!(
                        bucket = %self.bucket,
                        key = %self.key,
                        attempt,
                        "single operation copy answered NoSuchKey, will retry",
                    );
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Error::remote("copy object", self.bucket, self.key, error))
                }
            }
        }
    }

    fn multipart(&self) -> Result<()> {
        let part_size = plan_part_size(self.size, &self.options.settings)?;
        let session = MultipartSession::create(
            Arc::clone(&self.client),
            self.bucket,
            self.key,
            self.options.settings.clone(),
            self.options.metadata.clone(),
            self.recorder.clone(),
        )?;

        let scheduler = {
            let recorder = self.recorder.clone();
            session.scheduler(
                self.options.executor.clone(),
                move |client: &dyn ObjectClient, request: UploadPartCopyRequest| {
                    recorder.hit(Event::UploadPartCopy);
                    client.upload_part_copy(request)
                },
            )
        };

        let upload_id = session.upload_id();
        let end = self.offset + self.size;
        let mut position = self.offset;
        let mut part_number = 0u64;

        while position < end {
            if session.is_aborted() {
                break;
            }
            part_number += 1;
            let next = (position + part_size).min(end);
            let len = next - position;

            debug!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %upload_id,
                part_number,
                size = len,
                "copying part",
            );
            let request = UploadPartCopyRequest {
                bucket: self.bucket.to_string(),
                key: self.key.to_string(),
                upload_id: upload_id.clone(),
                part_number,
                src_bucket: self.src_bucket.to_string(),
                src_key: self.src_key.to_string(),
                source_range: format_source_range(position, len),
            };
            scheduler.schedule(request)?;
            position = next;
        }

        session.wait_all()?;
        session.complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClient;
    use crate::UploadSettings;
    use std::io::Cursor;

    fn options(single_put: u64, single_copy: u64, min_part: u64) -> TransferOptions {
        TransferOptions {
            settings: UploadSettings {
                min_upload_part_size: min_part,
                max_single_part_upload_size: single_put,
                max_single_operation_copy_size: single_copy,
                check_objects_after_upload: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn upload(client: &Arc<InMemoryClient>, data: Vec<u8>, offset: u64, size: u64, opts: &TransferOptions) {
        let client: Arc<dyn ObjectClient> = Arc::<InMemoryClient>::clone(client);
        let factory = move || -> std::io::Result<Box<dyn SeekableSource>> {
            Ok(Box::new(Cursor::new(data.clone())))
        };
        copy_data_to_store(client, &factory, offset, size, "b", "dst", opts).unwrap();
    }

    #[test]
    fn small_data_single_put() {
        let client = Arc::new(InMemoryClient::default());
        let data: Vec<u8> = (0..100u8).collect();
        upload(&client, data.clone(), 0, 100, &options(1024, 1024, 8));
        assert_eq!(client.object("b", "dst").unwrap(), data);
    }

    #[test]
    fn large_data_multipart_with_offset() {
        let client = Arc::new(InMemoryClient::default());
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        // 900 bytes from offset 50, parts of 64
        upload(&client, data.clone(), 50, 900, &options(256, 256, 64));
        assert_eq!(client.object("b", "dst").unwrap(), data[50..950].to_vec());
        assert_eq!(client.open_uploads(), 0);
    }

    #[test]
    fn copy_selects_strategy_by_size_and_offset() {
        let client = Arc::new(InMemoryClient::default());
        let data: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        client.insert("b", "src", data.clone());
        let small: Vec<u8> = data[..200].to_vec();
        client.insert("b", "small_src", small.clone());
        let client_dyn: Arc<dyn ObjectClient> = Arc::<InMemoryClient>::clone(&client);

        let opts = options(256, 256, 64);
        // over the single-operation limit, parts of 64
        copy_store_object(Arc::clone(&client_dyn), "b", "src", 0, 700, "b", "big", &opts).unwrap();
        assert_eq!(client.object("b", "big").unwrap(), data);

        // whole small object in one CopyObject
        copy_store_object(Arc::clone(&client_dyn), "b", "small_src", 0, 200, "b", "whole", &opts)
            .unwrap();
        assert_eq!(client.object("b", "whole").unwrap(), small);

        // a sub-range is small but offset, so it must honor the range
        copy_store_object(client_dyn, "b", "src", 100, 200, "b", "sliced", &opts).unwrap();
        assert_eq!(client.object("b", "sliced").unwrap(), data[100..300].to_vec());
    }
}
