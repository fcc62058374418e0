/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! Client-side load balancing for [gRPC] channels.
//!
//! This crate provides the LB policy framework a channel drives on its work
//! serializer and the `pick_first` policy, which maintains a single active
//! connection to the first reachable address from each resolver update.
//!
//! All APIs are unstable.  Proceed at your own risk.
//!
//! [gRPC]: https://grpc.io

pub mod client;
pub mod service;

pub mod attributes;
pub mod byte_str;
