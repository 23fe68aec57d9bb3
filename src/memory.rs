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

//! An in-memory [`ObjectClient`] for tests and for opting out of a real
//! object store

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::client::{
    AbortMultipartRequest, ClientError, ClientErrorKind, ClientResult, CompleteMultipartRequest,
    CopyObjectRequest, CreateMultipartRequest, HeadObjectRequest, ObjectClient, ObjectMeta,
    ObjectMetadata, PutObjectRequest, UploadPartCopyRequest, UploadPartRequest,
};

/// A stored object: its bytes plus what the request asked to attach
#[derive(Debug, Default, Clone)]
struct Entry {
    data: Vec<u8>,
    metadata: ObjectMetadata,
    storage_class: Option<String>,
}

#[derive(Debug, Default)]
struct Upload {
    bucket: String,
    key: String,
    metadata: ObjectMetadata,
    storage_class: Option<String>,
    /// part number → (tag, bytes)
    parts: BTreeMap<u64, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Storage {
    objects: HashMap<(String, String), Entry>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    next_etag: u64,
}

impl Storage {
    fn object(&self, bucket: &str, key: &str) -> ClientResult<&Entry> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| {
                ClientError::new(
                    ClientErrorKind::NoSuchKey,
                    format!("no such key: {bucket}/{key}"),
                )
            })
    }

    fn upload(&mut self, upload_id: &str) -> ClientResult<&mut Upload> {
        self.uploads.get_mut(upload_id).ok_or_else(|| {
            ClientError::new(
                ClientErrorKind::InvalidRequest,
                format!("no such upload: {upload_id}"),
            )
        })
    }

    fn etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"e{}\"", self.next_etag)
    }
}

/// An object store held entirely in memory
///
/// Implements the full multipart bookkeeping the engines rely on:
/// uploads are invisible until completed, completing stitches parts in
/// part-number order, aborting discards them.
#[derive(Debug, Default)]
pub struct InMemoryClient {
    storage: Mutex<Storage>,
}

impl InMemoryClient {
    /// The bytes stored at `bucket`/`key`, if any
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.storage
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.data.clone())
    }

    /// The metadata stored with `bucket`/`key`, if the object exists
    pub fn metadata(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        self.storage
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.metadata.clone())
    }

    /// The storage class requested for `bucket`/`key`, if any was set
    pub fn storage_class(&self, bucket: &str, key: &str) -> Option<String> {
        self.storage
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|entry| entry.storage_class.clone())
    }

    /// Store an object, creating test fixtures
    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.storage.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            Entry {
                data,
                ..Default::default()
            },
        );
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.storage.lock().uploads.len()
    }
}

fn parse_range(range: &str) -> ClientResult<(u64, u64)> {
    let invalid =
        || ClientError::new(ClientErrorKind::InvalidRequest, format!("bad range: {range}"));
    let (start, end) = range
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .ok_or_else(invalid)?;
    let start: u64 = start.parse().map_err(|_| invalid())?;
    let end: u64 = end.parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end))
}

impl ObjectClient for InMemoryClient {
    fn create_multipart_upload(&self, request: CreateMultipartRequest) -> ClientResult<String> {
        let mut storage = self.storage.lock();
        storage.next_upload += 1;
        let upload_id = format!("upload-{}", storage.next_upload);
        storage.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: request.bucket,
                key: request.key,
                metadata: request.metadata.unwrap_or_default(),
                storage_class: request.storage_class,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(&self, request: UploadPartRequest) -> ClientResult<String> {
        if request.part_number == 0 {
            return Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                "part numbers start at 1",
            ));
        }
        let data = request
            .body
            .into_bytes()
            .map_err(|e| ClientError::new(ClientErrorKind::Other, e.to_string()))?;
        if data.len() as u64 != request.content_length {
            return Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                format!(
                    "content length {} does not match body of {} bytes",
                    request.content_length,
                    data.len()
                ),
            ));
        }
        let mut storage = self.storage.lock();
        let tag = storage.etag();
        let upload = storage.upload(&request.upload_id)?;
        upload.parts.insert(request.part_number, (tag.clone(), data));
        Ok(tag)
    }

    fn upload_part_copy(&self, request: UploadPartCopyRequest) -> ClientResult<String> {
        let (start, end) = parse_range(&request.source_range)?;
        let mut storage = self.storage.lock();
        let source = storage.object(&request.src_bucket, &request.src_key)?;
        if end >= source.data.len() as u64 {
            return Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                format!(
                    "range {} outside of {} byte object",
                    request.source_range,
                    source.data.len()
                ),
            ));
        }
        let data = source.data[start as usize..=end as usize].to_vec();
        let tag = storage.etag();
        let upload = storage.upload(&request.upload_id)?;
        upload.parts.insert(request.part_number, (tag.clone(), data));
        Ok(tag)
    }

    fn complete_multipart_upload(&self, request: CompleteMultipartRequest) -> ClientResult<()> {
        let mut storage = self.storage.lock();
        let upload = storage.upload(&request.upload_id)?;

        if request.parts.is_empty() {
            return Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                "completed upload must list at least one part",
            ));
        }
        let mut assembled = Vec::new();
        for (i, part) in request.parts.iter().enumerate() {
            if part.part_number != i as u64 + 1 {
                return Err(ClientError::new(
                    ClientErrorKind::InvalidRequest,
                    format!("part numbers must be contiguous from 1, got {}", part.part_number),
                ));
            }
            let (tag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                ClientError::new(
                    ClientErrorKind::InvalidRequest,
                    format!("part {} was never uploaded", part.part_number),
                )
            })?;
            if tag != &part.e_tag {
                return Err(ClientError::new(
                    ClientErrorKind::InvalidRequest,
                    format!("tag mismatch for part {}", part.part_number),
                ));
            }
            assembled.extend_from_slice(data);
        }

        let upload = storage.uploads.remove(&request.upload_id).expect("checked");
        storage.objects.insert(
            (upload.bucket, upload.key),
            Entry {
                data: assembled,
                metadata: upload.metadata,
                storage_class: upload.storage_class,
            },
        );
        Ok(())
    }

    fn abort_multipart_upload(&self, request: AbortMultipartRequest) -> ClientResult<()> {
        // tolerated for unknown ids, like a second abort after complete
        self.storage.lock().uploads.remove(&request.upload_id);
        Ok(())
    }

    fn put_object(&self, request: PutObjectRequest) -> ClientResult<()> {
        let data = request
            .body
            .into_bytes()
            .map_err(|e| ClientError::new(ClientErrorKind::Other, e.to_string()))?;
        if data.len() as u64 != request.content_length {
            return Err(ClientError::new(
                ClientErrorKind::InvalidRequest,
                format!(
                    "content length {} does not match body of {} bytes",
                    request.content_length,
                    data.len()
                ),
            ));
        }
        self.storage.lock().objects.insert(
            (request.bucket, request.key),
            Entry {
                data,
                metadata: request.metadata.unwrap_or_default(),
                storage_class: request.storage_class,
            },
        );
        Ok(())
    }

    fn copy_object(&self, request: CopyObjectRequest) -> ClientResult<()> {
        let mut storage = self.storage.lock();
        let source = storage
            .object(&request.src_bucket, &request.src_key)?
            .clone();
        // supplied metadata replaces the source's, none copies it over
        let metadata = match request.metadata {
            Some(metadata) => metadata,
            None => source.metadata,
        };
        storage.objects.insert(
            (request.bucket, request.key),
            Entry {
                data: source.data,
                metadata,
                storage_class: request.storage_class,
            },
        );
        Ok(())
    }

    fn head_object(&self, request: HeadObjectRequest) -> ClientResult<ObjectMeta> {
        let storage = self.storage.lock();
        let entry = storage.object(&request.bucket, &request.key)?;
        Ok(ObjectMeta {
            size: entry.data.len() as u64,
            e_tag: None,
        })
    }
}
