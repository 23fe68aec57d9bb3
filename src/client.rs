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

//! The object-store client capability consumed by the upload and copy
//! engines
//!
//! Authentication, request signing and per-request retries live below
//! this trait, inside whichever HTTP client implements it.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use snafu::Snafu;

use crate::payload::PartPayload;

/// Content type set on every create/put/copy request
///
/// Left unset, at least one SDK defaults to `application/xml`, which some
/// servers reject for binary payloads.
pub const BINARY_CONTENT_TYPE: &str = "binary/octet-stream";

/// User-supplied object metadata forwarded on create/put/copy
pub type ObjectMetadata = HashMap<String, String>;

/// A classification of client failures the engines react to
///
/// Everything the engines do not special-case is [`Other`](ClientErrorKind::Other).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The server reported the key as missing
    ///
    /// Also returned, spuriously, by some stores for requests that create
    /// the key; that case is retried internally
    NoSuchKey,
    /// The payload exceeds what the server accepts in one operation
    EntityTooLarge,
    /// The server rejected the request as malformed or oversized
    InvalidRequest,
    /// Any other failure
    Other,
}

/// An error returned by an [`ObjectClient`] operation
#[derive(Debug, Snafu)]
#[snafu(display("{kind:?}: {message}"))]
pub struct ClientError {
    /// Failure class
    pub kind: ClientErrorKind,
    /// Server or transport supplied detail
    pub message: String,
}

impl ClientError {
    /// Create an error of the given `kind`
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the single-shot engines should fall back to multipart on
    /// this error
    pub(crate) fn requires_multipart(&self) -> bool {
        matches!(
            self.kind,
            ClientErrorKind::EntityTooLarge | ClientErrorKind::InvalidRequest
        )
    }
}

/// A specialized `Result` for [`ObjectClient`] operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// The bytes of a put or part upload
///
/// Streaming writes hand over an owned buffer; reader-backed uploads hand
/// over a reader positioned at the first byte of the part, to be consumed
/// while the request is sent.
pub enum Body {
    /// An owned, cheaply cloneable buffer
    Payload(PartPayload),
    /// A reader yielding exactly the request's `content_length` bytes
    Reader(Box<dyn Read + Send>),
}

impl Body {
    /// Read the body to completion
    ///
    /// Intended for in-memory and instrumented clients; an HTTP client
    /// would instead stream the body into the request.
    pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Payload(payload) => {
                let mut buf = Vec::with_capacity(payload.content_length() as usize);
                for chunk in payload.iter() {
                    buf.extend_from_slice(chunk);
                }
                Ok(buf)
            }
            Self::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload(p) => f.debug_tuple("Payload").field(&p.content_length()).finish(),
            Self::Reader(_) => f.debug_tuple("Reader").finish(),
        }
    }
}

/// Starts a multipart upload at `bucket`/`key`
#[derive(Debug)]
#[allow(missing_docs)]
pub struct CreateMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: &'static str,
    pub metadata: Option<ObjectMetadata>,
    pub storage_class: Option<String>,
}

/// Uploads one part of a multipart upload
#[derive(Debug)]
#[allow(missing_docs)]
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u64,
    pub content_length: u64,
    pub body: Body,
    pub content_type: &'static str,
}

/// Server-side copies a byte range of another key as one part
#[derive(Debug)]
#[allow(missing_docs)]
pub struct UploadPartCopyRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u64,
    pub src_bucket: String,
    pub src_key: String,
    /// Literal range header value, `bytes=<start>-<end_inclusive>`
    pub source_range: String,
}

/// A `(tag, part_number)` pair of a finished part
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CompletedPart {
    pub e_tag: String,
    pub part_number: u64,
}

/// Stitches uploaded parts into the final object
#[derive(Debug)]
#[allow(missing_docs)]
pub struct CompleteMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Parts numbered `1..=N`, in order
    pub parts: Vec<CompletedPart>,
}

/// Drops a multipart upload and the parts uploaded so far
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct AbortMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Uploads an object in a single operation
#[derive(Debug)]
#[allow(missing_docs)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub content_length: u64,
    pub body: Body,
    pub metadata: Option<ObjectMetadata>,
    pub storage_class: Option<String>,
    pub content_type: &'static str,
}

/// Server-side copies a whole object in a single operation
#[derive(Debug)]
#[allow(missing_docs)]
pub struct CopyObjectRequest {
    pub src_bucket: String,
    pub src_key: String,
    pub bucket: String,
    pub key: String,
    /// `Some` replaces the destination metadata, `None` copies the
    /// source's
    pub metadata: Option<ObjectMetadata>,
    pub storage_class: Option<String>,
    pub content_type: &'static str,
}

/// Fetches object metadata without its data
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct HeadObjectRequest {
    pub bucket: String,
    pub key: String,
}

/// Metadata of an existing object
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object size in bytes
    pub size: u64,
    /// Server-assigned entity tag, if any
    pub e_tag: Option<String>,
}

/// The synchronous object-store operations the engines are built on
///
/// Every call blocks until the server answers. Implementations are shared
/// across the caller's thread and any executor threads, and must therefore
/// be safe to invoke concurrently.
pub trait ObjectClient: Send + Sync {
    /// Start a multipart upload, returning the server-assigned upload id
    fn create_multipart_upload(&self, request: CreateMultipartRequest) -> ClientResult<String>;

    /// Upload one part, returning its tag
    fn upload_part(&self, request: UploadPartRequest) -> ClientResult<String>;

    /// Copy a source range as one part, returning its tag
    fn upload_part_copy(&self, request: UploadPartCopyRequest) -> ClientResult<String>;

    /// Complete a multipart upload from its ordered part tags
    fn complete_multipart_upload(&self, request: CompleteMultipartRequest) -> ClientResult<()>;

    /// Abort a multipart upload, discarding uploaded parts
    fn abort_multipart_upload(&self, request: AbortMultipartRequest) -> ClientResult<()>;

    /// Upload an object in one request
    fn put_object(&self, request: PutObjectRequest) -> ClientResult<()>;

    /// Server-side copy an object in one request
    fn copy_object(&self, request: CopyObjectRequest) -> ClientResult<()>;

    /// Fetch object metadata
    fn head_object(&self, request: HeadObjectRequest) -> ClientResult<ObjectMeta>;
}

/// Format an `UploadPartCopy` source range
///
/// The wire format is inclusive on both ends: `bytes=<start>-<end>`.
pub fn format_source_range(offset: u64, size: u64) -> String {
    format!("bytes={}-{}", offset, offset + size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_range_is_inclusive() {
        assert_eq!(format_source_range(0, 1), "bytes=0-0");
        assert_eq!(format_source_range(100, 50), "bytes=100-149");
    }

    #[test]
    fn fallback_classification() {
        let too_large = ClientError::new(ClientErrorKind::EntityTooLarge, "too big");
        let invalid = ClientError::new(ClientErrorKind::InvalidRequest, "bad");
        let missing = ClientError::new(ClientErrorKind::NoSuchKey, "gone");
        assert!(too_large.requires_multipart());
        assert!(invalid.requires_multipart());
        assert!(!missing.requires_multipart());
    }
}
