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

//! Background execution capability for part uploads

/// A task posted to an [`Executor`]
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs closures sometime, possibly on another thread
///
/// The contract is fire-and-forget: there is no result channel and no
/// completion signal. The engines do their own completion bookkeeping, so
/// any parallelism is acceptable, from a single background thread to a
/// full pool. When no executor is supplied, the engines run everything
/// inline on the caller's thread.
pub trait Executor: Send + Sync {
    /// Schedule `task` to run
    fn submit(&self, task: Task);
}

impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync,
{
    fn submit(&self, task: Task) {
        self(task)
    }
}
