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

//! Named event counters bumped on each remote operation
//!
//! The engines count against a [`Metrics`] sink supplied per job; the
//! default sink discards everything. Jobs writing objects that back a
//! disk-like store additionally bump the `Disk*` twin of each event.

use std::sync::Arc;

/// Counted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Event {
    WriteBytes,
    HeadObject,
    CreateMultipartUpload,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    UploadPart,
    UploadPartCopy,
    PutObject,
    CopyObject,
    ThrottlerBytes,
    ThrottlerSleepMicroseconds,

    DiskHeadObject,
    DiskCreateMultipartUpload,
    DiskCompleteMultipartUpload,
    DiskAbortMultipartUpload,
    DiskUploadPart,
    DiskUploadPartCopy,
    DiskPutObject,
    DiskCopyObject,
}

impl Event {
    /// The `Disk*` twin of this event, if it has one
    fn disk_twin(self) -> Option<Event> {
        match self {
            Event::HeadObject => Some(Event::DiskHeadObject),
            Event::CreateMultipartUpload => Some(Event::DiskCreateMultipartUpload),
            Event::CompleteMultipartUpload => Some(Event::DiskCompleteMultipartUpload),
            Event::AbortMultipartUpload => Some(Event::DiskAbortMultipartUpload),
            Event::UploadPart => Some(Event::DiskUploadPart),
            Event::UploadPartCopy => Some(Event::DiskUploadPartCopy),
            Event::PutObject => Some(Event::DiskPutObject),
            Event::CopyObject => Some(Event::DiskCopyObject),
            _ => None,
        }
    }
}

/// An increment-by-name counter facility
pub trait Metrics: Send + Sync {
    /// Add `count` to the counter for `event`
    fn increment(&self, event: Event, count: u64);
}

/// A [`Metrics`] sink that discards all increments
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _event: Event, _count: u64) {}
}

/// A [`Metrics`] handle plus the disk-object flag of the current job
#[derive(Clone)]
pub(crate) struct MetricsRecorder {
    sink: Arc<dyn Metrics>,
    for_disk_store: bool,
}

impl MetricsRecorder {
    pub(crate) fn new(sink: Arc<dyn Metrics>, for_disk_store: bool) -> Self {
        Self {
            sink,
            for_disk_store,
        }
    }

    /// Bump `event` by one, and its `Disk*` twin when the job writes a
    /// disk-backed object
    pub(crate) fn hit(&self, event: Event) {
        self.count(event, 1)
    }

    pub(crate) fn count(&self, event: Event, count: u64) {
        self.sink.increment(event, count);
        if self.for_disk_store {
            if let Some(twin) = event.disk_twin() {
                self.sink.increment(twin, count);
            }
        }
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("for_disk_store", &self.for_disk_store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Counters(Mutex<HashMap<Event, u64>>);

    impl Metrics for Counters {
        fn increment(&self, event: Event, count: u64) {
            *self.0.lock().entry(event).or_default() += count;
        }
    }

    #[test]
    fn disk_twin_selected_by_flag() {
        let sink = Arc::new(Counters::default());
        let plain = MetricsRecorder::new(Arc::<Counters>::clone(&sink), false);
        let disk = MetricsRecorder::new(Arc::<Counters>::clone(&sink), true);

        plain.hit(Event::PutObject);
        disk.hit(Event::PutObject);
        disk.count(Event::WriteBytes, 42);

        let counts = sink.0.lock();
        assert_eq!(counts[&Event::PutObject], 2);
        assert_eq!(counts[&Event::DiskPutObject], 1);
        // WriteBytes has no disk twin
        assert_eq!(counts[&Event::WriteBytes], 42);
        assert_eq!(counts.len(), 3);
    }
}
