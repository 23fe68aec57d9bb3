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

//! Request policy controlling how uploads and copies are split into parts

/// Policy limits for uploads and server-side copies
///
/// The defaults match the common limits of S3-compatible stores: parts
/// between 16 MiB and 5 GiB, at most 10 000 parts per upload, single-shot
/// operations up to 32 MiB (writes) or 5 GiB (copies).
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Lower bound on the size of a normal part
    pub min_upload_part_size: u64,

    /// Upper bound on the size of a normal part
    pub max_upload_part_size: u64,

    /// Hard ceiling on parts per multipart upload
    ///
    /// The S3 protocol ceiling is 10 000; custom implementations may
    /// accept more
    pub max_part_number: u64,

    /// Streaming writes larger than this switch from a single `PutObject`
    /// to a multipart upload
    pub max_single_part_upload_size: u64,

    /// Copies larger than this switch from a single `CopyObject` to
    /// multipart `UploadPartCopy`
    pub max_single_operation_copy_size: u64,

    /// Geometric growth factor applied to the streaming part size
    pub upload_part_size_multiply_factor: u64,

    /// Multiply the streaming part size by the factor every this many
    /// parts, capped at [`max_upload_part_size`](Self::max_upload_part_size)
    pub upload_part_size_multiply_parts_count_threshold: u64,

    /// Storage class to request on create/put/copy, if any
    pub storage_class: Option<String>,

    /// Issue a `HeadObject` against the destination after a successful
    /// upload or copy
    pub check_objects_after_upload: bool,

    /// Retry budget for writes the server spuriously reports as
    /// `NoSuchKey`; treated as at least 1
    pub max_unexpected_write_error_retries: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            min_upload_part_size: 16 * 1024 * 1024,
            max_upload_part_size: 5 * 1024 * 1024 * 1024,
            max_part_number: 10_000,
            max_single_part_upload_size: 32 * 1024 * 1024,
            max_single_operation_copy_size: 5 * 1024 * 1024 * 1024,
            upload_part_size_multiply_factor: 2,
            upload_part_size_multiply_parts_count_threshold: 500,
            storage_class: None,
            check_objects_after_upload: false,
            max_unexpected_write_error_retries: 4,
        }
    }
}

impl UploadSettings {
    /// Retry budget for the phantom `NoSuchKey` class, never zero
    pub(crate) fn unexpected_error_retries(&self) -> usize {
        self.max_unexpected_write_error_retries.max(1)
    }
}
