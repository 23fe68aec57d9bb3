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

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # s3-transfer
//!
//! Streaming writes and server-side copies to S3-compatible object
//! stores, built around a multipart upload engine with adaptive part
//! sizing and optional background part uploads.
//!
//! The crate does not speak HTTP itself: callers inject an
//! [`ObjectClient`] implementing the handful of store operations the
//! engines need, an optional [`Executor`] to run part uploads in the
//! background, and optional [`Throttler`] / [`Metrics`] capabilities.
//! [`InMemoryClient`](memory::InMemoryClient) implements the client
//! trait entirely in memory for tests and local runs.
//!
//! # Streaming writes
//!
//! ```
//! use std::sync::Arc;
//! use s3_transfer::{memory::InMemoryClient, StoreWriter, TransferOptions};
//!
//! let client = Arc::new(InMemoryClient::default());
//! let mut writer = StoreWriter::new(
//!     Arc::clone(&client) as _,
//!     "bucket",
//!     "data/part-0001.bin",
//!     TransferOptions::default(),
//! );
//! writer.write(b"produced bytes").unwrap();
//! writer.finalize().unwrap();
//!
//! assert_eq!(
//!     client.object("bucket", "data/part-0001.bin").unwrap(),
//!     b"produced bytes",
//! );
//! ```
//!
//! A writer buffers bytes until they cross the single-part threshold,
//! then switches to a multipart upload whose part size starts at the
//! policy minimum and grows geometrically, keeping the part count within
//! the protocol ceiling for arbitrarily large uploads.
//!
//! # Copies
//!
//! [`copy_data_to_store`] uploads a byte range of a seekable reader;
//! [`copy_store_object`] copies a byte range of an existing object
//! server-side. Both pick between a single-shot operation and a
//! multipart upload by size, and fall back to multipart mid-operation
//! when the server rejects a single-shot request as too large.

use std::sync::Arc;

use snafu::Snafu;

pub mod client;
pub mod config;
pub mod copy;
pub mod executor;
pub mod memory;
pub mod metrics;
mod multipart;
pub mod payload;
pub mod throttle;
pub mod write;

pub use client::{ClientError, ClientErrorKind, ObjectClient, ObjectMetadata};
pub use config::UploadSettings;
pub use copy::{copy_data_to_store, copy_store_object, SeekableSource, SourceFactory};
pub use executor::Executor;
pub use metrics::{Event, Metrics, NoopMetrics};
pub use payload::{PartBuffer, PartPayload};
pub use throttle::Throttler;
pub use write::StoreWriter;

/// A specialized `Result` for upload and copy operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by the upload and copy engines
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The request policy cannot be satisfied for this input
    #[snafu(display("Invalid upload configuration: {message}"))]
    InvalidConfig {
        /// What was violated, with the offending values
        message: String,
    },

    /// The caller violated an API contract
    #[snafu(display("Logical error: {message}"))]
    Logic {
        /// The violated contract
        message: String,
    },

    /// The object store rejected or failed an operation
    #[snafu(display("{operation} failed for {bucket}/{key}: {source}"))]
    Remote {
        /// The remote operation that failed
        operation: &'static str,
        /// Destination bucket
        bucket: String,
        /// Destination key
        key: String,
        /// The client's failure
        source: ClientError,
    },

    /// The source reader could not be created or positioned
    #[snafu(display("Failed to read source data: {source}"))]
    Source {
        /// The underlying I/O failure
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    pub(crate) fn remote(
        operation: &'static str,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: ClientError,
    ) -> Self {
        Self::Remote {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            source,
        }
    }

    pub(crate) fn source(source: std::io::Error) -> Self {
        Self::Source { source }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match &err {
            Error::InvalidConfig { .. } | Error::Logic { .. } => {
                Self::new(ErrorKind::InvalidInput, err)
            }
            Error::Remote { source, .. } if source.kind == ClientErrorKind::NoSuchKey => {
                Self::new(ErrorKind::NotFound, err)
            }
            Error::Remote { .. } => Self::new(ErrorKind::Other, err),
            Error::Source { .. } => Self::new(ErrorKind::Other, err),
        }
    }
}

/// Per-job configuration: the request policy plus the injected
/// capabilities
///
/// The default carries the default [`UploadSettings`], no metadata, no
/// executor (part uploads run inline on the caller's thread), no
/// throttler, and a metrics sink that discards everything.
#[derive(Clone)]
pub struct TransferOptions {
    /// Policy limits for part sizing and strategy selection
    pub settings: UploadSettings,
    /// Metadata to attach to the destination object
    pub metadata: Option<ObjectMetadata>,
    /// Runs part uploads in the background when supplied
    pub executor: Option<Arc<dyn Executor>>,
    /// Rate-limits produced bytes; consulted by streaming writes only
    pub throttler: Option<Arc<dyn Throttler>>,
    /// Counter sink for remote-operation events
    pub metrics: Arc<dyn Metrics>,
    /// Whether the destination backs a disk-like store, selecting the
    /// `Disk*` twin of each counted event as well
    pub for_disk_store: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            settings: UploadSettings::default(),
            metadata: None,
            executor: None,
            throttler: None,
            metrics: Arc::new(NoopMetrics),
            for_disk_store: false,
        }
    }
}

impl TransferOptions {
    pub(crate) fn recorder(&self) -> metrics::MetricsRecorder {
        metrics::MetricsRecorder::new(Arc::clone(&self.metrics), self.for_disk_store)
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("settings", &self.settings)
            .field("metadata", &self.metadata)
            .field("background", &self.executor.is_some())
            .field("throttled", &self.throttler.is_some())
            .field("for_disk_store", &self.for_disk_store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_convert_to_io() {
        let err = Error::invalid_config("min_upload_part_size must not be 0");
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidInput);

        let err = Error::remote(
            "head object after upload",
            "b",
            "k",
            ClientError::new(ClientErrorKind::NoSuchKey, "missing"),
        );
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
