/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use crate::attributes::Attributes;
use crate::client::load_balancing::{
    ChannelController, LbState, Subchannel, WatchToken, WorkScheduler,
};
use crate::client::name_resolution::Address;
use crate::client::ConnectivityState;
use crate::service::{Message, Request};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
pub(crate) struct EmptyMessage {}
impl Message for EmptyMessage {}
pub(crate) fn new_request() -> Request {
    Request::new(Box::pin(tokio_stream::once(
        Box::new(EmptyMessage {}) as Box<dyn Message>
    )))
}

/// A test subchannel that records every operation the LB policy performs on
/// it as a TestEvent.
///
/// Like real subchannels, each handle is distinct (a new one is produced per
/// new_subchannel call) and carries its own single watch slot, while the
/// connectivity state is shared by every handle for the same address, the
/// way a pooled connection's state would be.  The state reported through
/// current_state() is set directly by tests, and the token of the active
/// watch (if any) is exposed so tests can deliver state transitions the way
/// the channel's work serializer would.
pub(crate) struct TestSubchannel {
    address: Address,
    state: Arc<Mutex<ConnectivityState>>,
    watch: Mutex<Option<WatchToken>>,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    fn new(
        address: Address,
        state: Arc<Mutex<ConnectivityState>>,
        tx_events: mpsc::UnboundedSender<TestEvent>,
    ) -> Self {
        Self {
            address,
            state,
            watch: Mutex::new(None),
            tx_events,
        }
    }

    /// Overrides the state reported by current_state(), for this handle and
    /// every other handle to the same address.
    pub(crate) fn set_state(&self, state: ConnectivityState) {
        *self.state.lock().unwrap() = state;
    }

    /// Returns the token of the currently registered watch, if any.
    pub(crate) fn watch_token(&self) -> Option<WatchToken> {
        *self.watch.lock().unwrap()
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn current_state(&self) -> ConnectivityState {
        *self.state.lock().unwrap()
    }

    fn request_connection(&self) {
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn start_watch(&self, watch: WatchToken) {
        *self.watch.lock().unwrap() = Some(watch);
        self.tx_events
            .send(TestEvent::StartWatch(self.address.clone()))
            .unwrap();
    }

    fn cancel_watch(&self, reason: &str) {
        if self.watch.lock().unwrap().take().is_some() {
            self.tx_events
                .send(TestEvent::CancelWatch(
                    self.address.clone(),
                    reason.to_string(),
                ))
                .unwrap();
        }
    }

    fn shutdown(&self) {
        self.tx_events
            .send(TestEvent::ShutdownSubchannel(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {
        self.tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()))
            .unwrap();
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<TestSubchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    StartWatch(Address),
    CancelWatch(Address, String),
    ShutdownSubchannel(Address),
    ResetBackoff(Address),
    ScheduleWork,
}

impl Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::StartWatch(addr) => write!(f, "StartWatch({addr})"),
            Self::CancelWatch(addr, reason) => write!(f, "CancelWatch({addr}, {reason})"),
            Self::ShutdownSubchannel(addr) => write!(f, "ShutdownSubchannel({addr})"),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
///
/// Connectivity state is pooled by address, mirroring the shared pool of a
/// real channel: a handle created for an address another handle already
/// drove to READY reports READY from the start.  Addresses can also be
/// marked as rejected, making creation fail for them.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
    pool: Mutex<HashMap<Address, Arc<Mutex<ConnectivityState>>>>,
    rejects: Mutex<HashSet<Address>>,
    last_args: Mutex<Option<Attributes>>,
}

impl TestChannelController {
    pub(crate) fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            pool: Mutex::new(HashMap::new()),
            rejects: Mutex::new(HashSet::new()),
            last_args: Mutex::new(None),
        }
    }

    /// Makes new_subchannel fail for the given address.
    pub(crate) fn reject_address(&self, address: Address) {
        self.rejects.lock().unwrap().insert(address);
    }

    /// Returns the channel arguments passed to the most recent
    /// new_subchannel call.
    pub(crate) fn last_subchannel_args(&self) -> Option<Attributes> {
        self.last_args.lock().unwrap().clone()
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(
        &mut self,
        address: &Address,
        args: &Attributes,
    ) -> Option<Arc<dyn Subchannel>> {
        *self.last_args.lock().unwrap() = Some(args.clone());
        if self.rejects.lock().unwrap().contains(address) {
            return None;
        }
        let state = self
            .pool
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConnectivityState::Idle)))
            .clone();
        let subchannel = Arc::new(TestSubchannel::new(
            address.clone(),
            state,
            self.tx_events.clone(),
        ));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        Some(subchannel)
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        self.tx_events.send(TestEvent::ScheduleWork).unwrap();
    }
}
