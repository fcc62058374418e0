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

//! The framework LB policies plug into.
//!
//! Every method defined here runs on the channel's work serializer: a single
//! cooperative executor on which resolver updates, subchannel connectivity
//! notifications and policy entry points are executed to completion, one at a
//! time.  Policies therefore need no internal locking, but must never block.

pub mod pick_first;

mod registry;
pub(crate) use registry::GLOBAL_LB_REGISTRY;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{any::Any, error::Error, fmt::Display, sync::Arc};

use tonic::{metadata::MetadataMap, Status};

use crate::attributes::Attributes;
use crate::client::{
    name_resolution::{Address, ResolverUpdate},
    ConnectivityState,
};
use crate::service::Request;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when a subchannel watched by the LB policy
    /// changes state.  The token identifies the watch the notification was
    /// delivered through; tokens for watches the policy has since cancelled
    /// must be ignored.
    fn subchannel_update(
        &mut self,
        watch: WatchToken,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when it leaves its idle state and connections
    /// should be re-established.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel to ask all of the policy's subchannels to
    /// discard any pending reconnect backoff and retry immediately.
    fn reset_backoff(&mut self);

    /// Called by the channel exactly once to tear the policy down.  The
    /// policy releases its subchannels and must not produce further state
    /// updates afterward.
    fn shutdown(&mut self);
}

/// Controls channel behaviors.  Handed to LB policies on every entry point so
/// the effects of a single serializer callback are applied synchronously.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in IDLE state for the given address, applying
    /// the provided channel arguments.  Returns None if the channel cannot
    /// produce a subchannel for the address, e.g. because no transport is
    /// registered for its network type.
    fn new_subchannel(&mut self, address: &Address, args: &Attributes)
        -> Option<Arc<dyn Subchannel>>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when request_connection() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer
///   has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// Subchannels are shared through a pool, so the same instance may be handed
/// to multiple channels, and may already be connected when a policy receives
/// it.  Dropping every reference disconnects the subchannel.
pub trait Subchannel: Display + Send + Sync {
    /// Returns the address this subchannel connects to.
    fn address(&self) -> Address;

    /// Returns the subchannel's state at the time of the call.  Watches
    /// report only subsequent transitions, so callers that need the current
    /// state must read it before registering the watch.
    fn current_state(&self) -> ConnectivityState;

    /// Begins connecting asynchronously.  A no-op unless the subchannel is
    /// IDLE.
    fn request_connection(&self);

    /// Registers the single connectivity watcher for this handle.  Each
    /// later state transition is posted to the channel's work serializer and
    /// delivered to the owning policy's subchannel_update along with the
    /// token.  Handles for the same pooled subchannel watch independently.
    fn start_watch(&self, watch: WatchToken);

    /// Detaches the watcher registered by start_watch, if any.  The reason is
    /// used for channel tracing only.  Notifications already queued on the
    /// serializer may still be delivered; receivers identify them as stale by
    /// their token.
    fn cancel_watch(&self, reason: &str);

    /// Releases this policy's interest in the subchannel's connection.  The
    /// underlying connection is closed once no other holder needs it.
    fn shutdown(&self);

    /// Discards any pending reconnect backoff so the next connection attempt
    /// may begin immediately.
    fn reset_backoff(&self);
}

/// Identifies a single connectivity watch.
///
/// A policy that tracks subchannels in ordered lists cannot discriminate
/// notifications by subchannel identity alone: pooled subchannels may appear
/// in more than one of its lists at a time.  The token carries the identity
/// of the list that registered the watch plus the entry's index within it,
/// and is handed back with every notification so stale callbacks can be
/// dropped without side effects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WatchToken {
    /// Policy-assigned identifier of the subchannel list that registered the
    /// watch.
    pub list: u64,
    /// Index of the watched subchannel within that list.
    pub index: usize,
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Default)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({})", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

/// A JSON LB policy configuration as delivered in the service config, before
/// conversion into a policy's own representation.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    /// Creates a ParsedJsonLbConfig from a JSON string, failing if it is not
    /// valid JSON.
    pub fn new(json: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        match serde_json::from_str(json) {
            Ok(value) => Ok(Self { value }),
            Err(err) => Err(format!("failed to parse LB config JSON: {err}").into()),
        }
    }

    /// Creates a ParsedJsonLbConfig directly from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Converts the wrapped JSON into the configuration type used by the
    /// LbPolicy.
    pub fn convert_to<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, Box<dyn Error + Send + Sync>> {
        match serde_json::from_value(self.value.clone()) {
            Ok(config) => Ok(config),
            Err(err) => Err(format!("failed to convert LB config: {err}").into()),
        }
    }
}

/// A convenience wrapper for an LB policy's parsed configuration object.
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new<T: Send + Sync + 'static>(config: T) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Converts the wrapped configuration into the type used by the LbPolicy.
    pub fn convert_to<T: Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<T>, Box<dyn Error + Send + Sync>> {
        match self.config.clone().downcast::<T>() {
            Ok(config) => Ok(config),
            Err(_) => Err("unexpected LB config type".into()),
        }
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happen when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  The channel will
    /// convert the status code to INTERNAL if it is not a valid code for the
    /// gRPC library to produce, per [gRFC A54].
    ///
    /// [gRFC A54]:
    ///     https://github.com/grpc/proposal/blob/master/A54-restrict-control-plane-status-codes.md
    Drop(Status),
}

impl PartialEq for PickResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Subchannels are compared by identity: two handles are the same
            // pick if they point at the same pooled subchannel.
            (PickResult::Pick(left), PickResult::Pick(right)) => {
                Arc::ptr_eq(&left.subchannel, &right.subchannel)
            }
            (PickResult::Queue, PickResult::Queue) => true,
            (PickResult::Fail(left), PickResult::Fail(right))
            | (PickResult::Drop(left), PickResult::Drop(right)) => {
                left.code() == right.code() && left.message() == right.message()
            }
            _ => false,
        }
    }
}

impl Display for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickResult::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::Fail(status) => write!(f, "Fail({status})"),
            PickResult::Drop(status) => write!(f, "Drop({status})"),
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that fails every pick with UNAVAILABLE and the error it holds.
pub struct FailingPicker {
    pub error: String,
}

impl Picker for FailingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}
