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

//! Types produced by name resolution and consumed by LB policies.
//!
//! Name resolution is the process by which a channel's target is converted
//! into network addresses (typically IP addresses) used by the channel to
//! connect to a service.  The resolvers themselves live with the channel;
//! this module defines the shape of what they hand to the load balancer.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::hash::Hash;

use crate::attributes::Attributes;
use crate::byte_str::ByteStr;

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: ByteStr,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the subchannel.
    pub attributes: Attributes,
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// ResolverUpdate contains the current Resolver state relevant to the LB
/// policy.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// Attributes contains arbitrary data about the resolver intended for
    /// consumption by the load balancing policy, including the channel
    /// arguments applied to subchannels created for this update.
    pub attributes: Attributes,

    /// An ordered list of addresses for the service indicated by the target
    /// URI, or the error that prevented resolving them.
    pub addresses: Result<Vec<Address>, String>,

    /// An optional human-readable note describing context about the
    /// resolution, to be passed along to the LB policy for inclusion in RPC
    /// failure status messages in cases where addresses has a non-empty OK
    /// status.  For example, a resolver that returns an empty address list
    /// may set this to something like "no DNS entries found for <name>".
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            attributes: Default::default(),
            addresses: Ok(Default::default()),
            resolution_note: Default::default(),
        }
    }
}
