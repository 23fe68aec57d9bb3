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

//! Remote-bandwidth throttling capability

use crate::metrics::Event;

/// Rate-limits bytes sent to the remote store
///
/// [`add`](Self::add) blocks the producing thread for however long the
/// configured rate requires, counting the accepted bytes against
/// `bytes_event` and any time slept against `sleep_event` on the
/// implementation's own metrics sink.
pub trait Throttler: Send + Sync {
    /// Account for `bytes` about to be sent, sleeping if the rate demands
    fn add(&self, bytes: u64, bytes_event: Event, sleep_event: Event);
}
