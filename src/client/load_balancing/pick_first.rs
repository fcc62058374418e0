use std::{
    error::Error,
    sync::{Arc, Once},
};

use serde::{Deserialize, Serialize};
use tonic::metadata::MetadataMap;
use tracing::{debug, warn};

use crate::{
    attributes::Attributes,
    client::{
        load_balancing::{
            ChannelController, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder,
            LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker, Subchannel,
            SubchannelState, WatchToken, WorkScheduler, GLOBAL_LB_REGISTRY,
        },
        name_resolution::{Address, ResolverUpdate},
        ConnectivityState,
    },
    service::Request,
};

pub static POLICY_NAME: &str = "pick_first";

/// Channel argument set on every subchannel created by this policy.  A policy
/// that funnels all RPCs through one connection gets its health signal from
/// that connection's own state, so per-subchannel health checking is
/// inhibited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InhibitHealthChecking(pub bool);

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            latest_update: None,
            current_list: None,
            pending_list: None,
            selected: None,
            idle: false,
            shutdown: false,
            next_list_id: 0,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        // pick_first has no tunable options.  Parsing only validates that the
        // config is an object; unknown fields are tolerated.
        let config: PickFirstConfig = match config.convert_to() {
            Ok(config) => config,
            Err(err) => {
                return Err(format!("failed to parse JSON config: {err}").into());
            }
        };
        Ok(Some(LbConfig::new(config)))
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub(super) struct PickFirstConfig {}

pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.register(Builder {});
    });
}

/// Which of the policy's two list slots a subchannel list occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ListSlot {
    Current,
    Pending,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>, // Helps to schedule work.
    latest_update: Option<ResolverUpdate>, // Most recent update from the name resolver, with health checking inhibited.
    current_list: Option<SubchannelList>, // The list being connected through, or holding the selected subchannel.
    pending_list: Option<SubchannelList>, // A newer list still proving itself; exists only while a subchannel is selected.
    selected: Option<usize>,              // Index of the READY subchannel in current_list.
    idle: bool,                           // Waiting for exit_idle before connecting again.
    shutdown: bool,                       // Terminal; nothing is published after this is set.
    next_list_id: u64,                    // Identity source for subchannel lists.
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        mut update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.shutdown {
            return Ok(());
        }

        let address_error = update.addresses.as_ref().err().cloned();
        match address_error {
            None => {
                debug!(
                    "pick_first: received update with {} addresses",
                    update.addresses.as_ref().unwrap().len()
                );
            }
            Some(error) => {
                debug!("pick_first: received update with address error: {error}");
                // Keep using the previous good address list if one exists.
                // The error is retained only as the resolution note.
                if let Some(prior) = self
                    .latest_update
                    .as_ref()
                    .and_then(|update| update.addresses.as_ref().ok())
                {
                    let prior = prior.clone();
                    update.addresses = Ok(prior);
                    update.resolution_note = Some(error);
                }
            }
        }

        // Health checking is inhibited on every subchannel created for this
        // update; see InhibitHealthChecking.
        update.attributes = update.attributes.add(InhibitHealthChecking(true));
        self.latest_update = Some(update);

        // In IDLE, connection attempts resume from exit_idle().
        if self.idle {
            return Ok(());
        }
        self.attempt_to_connect_using_latest_update(channel_controller)
    }

    fn subchannel_update(
        &mut self,
        watch: WatchToken,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.shutdown {
            return;
        }

        // Resolve the token against the two live lists.  A notification for
        // a list that has been orphaned, or for a watch that has since been
        // cancelled, is stale and must have no effect.
        let slot = if self.list_id(ListSlot::Current) == Some(watch.list) {
            ListSlot::Current
        } else if self.list_id(ListSlot::Pending) == Some(watch.list) {
            ListSlot::Pending
        } else {
            debug!(
                "pick_first: ignoring update for orphaned subchannel list {}",
                watch.list
            );
            return;
        };
        {
            let list = self.list(slot);
            let Some(data) = list.subchannels.get(watch.index) else {
                debug_assert!(
                    false,
                    "watch index {} out of range for subchannel list {}",
                    watch.index, watch.list
                );
                return;
            };
            if !data.watched {
                debug!(
                    "pick_first: ignoring update for cancelled watch on {}",
                    data.address
                );
                return;
            }
            debug!("pick_first: subchannel {} reported {}", data.address, state);
        }

        // Handle updates for the currently selected subchannel.
        if slot == ListSlot::Current && self.selected == Some(watch.index) {
            // A state change may slip in between probing a subchannel's
            // state and registering its watch.  If the missed notification
            // is READY, ignore it; any other state means the connection we
            // selected is gone.
            if state.connectivity_state == ConnectivityState::Ready {
                return;
            }
            self.selected = None;
            if self.pending_list.is_some() {
                self.list_mut(ListSlot::Current).cancel_connectivity_watch(
                    watch.index,
                    "selected subchannel failed; switching to pending update",
                );
                debug!("pick_first: promoting pending subchannel list after losing the selected subchannel");
                self.current_list = self.pending_list.take();
                // Take on the state the pending list has already earned.
                if self.list(ListSlot::Current).exhausted {
                    channel_controller.update_picker(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(FailingPicker {
                            error: "selected subchannel failed; switching to pending update"
                                .to_string(),
                        }),
                    });
                } else {
                    channel_controller.update_picker(LbState::initial());
                }
                return;
            }
            // No newer list to fall back on: ask for fresh addresses and go
            // idle until the channel sees activity again.
            self.list_mut(ListSlot::Current)
                .cancel_connectivity_watch(watch.index, "selected subchannel failed");
            channel_controller.request_resolution();
            self.idle = true;
            self.current_list = None;
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Idle,
                picker: Arc::new(IdlePicker {
                    work_scheduler: self.work_scheduler.clone(),
                }),
            });
            return;
        }

        // The update is for a subchannel being attempted, either in the
        // current list (no selection yet) or in the pending list (looking
        // for a replacement for the current selection).
        match state.connectivity_state {
            ConnectivityState::Ready => {
                self.list_mut(slot).exhausted = false;
                self.process_unselected_ready(slot, watch.index, channel_controller);
            }
            ConnectivityState::TransientFailure | ConnectivityState::Idle => {
                let num_subchannels = {
                    let list = self.list_mut(slot);
                    list.cancel_connectivity_watch(watch.index, "connection attempt failed");
                    list.num_subchannels()
                };
                let next = (watch.index + 1) % num_subchannels;
                let mut slot = slot;
                // Wrapping around to index 0 means every subchannel in the
                // list has now been tried without success.
                if next == 0 {
                    self.list_mut(slot).exhausted = true;
                    debug!(
                        "pick_first: subchannel list {} failed to connect to all subchannels",
                        watch.list
                    );
                    if slot == ListSlot::Pending {
                        // Swap to the new list.  This means reporting
                        // TRANSIENT_FAILURE and dropping the existing
                        // working connection, but what the control plane
                        // told us cannot be ignored.
                        self.selected = None;
                        self.current_list = self.pending_list.take();
                        slot = ListSlot::Current;
                    }
                    if slot == ListSlot::Current {
                        channel_controller.request_resolution();
                        channel_controller.update_picker(LbState {
                            connectivity_state: ConnectivityState::TransientFailure,
                            picker: Arc::new(FailingPicker {
                                error: "failed to connect to all addresses".to_string(),
                            }),
                        });
                    }
                }
                self.check_connectivity_state_and_start_watching(slot, next, channel_controller);
            }
            ConnectivityState::Connecting => {
                // Only affects the channel state while the current list
                // still has untried subchannels.
                if slot == ListSlot::Current && !self.list(ListSlot::Current).exhausted {
                    channel_controller.update_picker(LbState::initial());
                }
            }
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Scheduled by the IdlePicker when a queued RPC arrives; behaves the
        // same as an explicit exit_idle from the channel.
        self.exit_idle(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.shutdown || !self.idle {
            return;
        }
        debug!("pick_first: exiting idle");
        self.idle = false;
        if let Err(err) = self.attempt_to_connect_using_latest_update(channel_controller) {
            debug!("pick_first: connection attempt after exiting idle failed: {err}");
        }
    }

    fn reset_backoff(&mut self) {
        if let Some(list) = &self.current_list {
            list.reset_backoff();
        }
        if let Some(list) = &self.pending_list {
            list.reset_backoff();
        }
    }

    fn shutdown(&mut self) {
        debug!("pick_first: shutting down");
        self.shutdown = true;
        self.selected = None;
        // Dropping the lists cancels their outstanding watches.
        self.current_list = None;
        self.pending_list = None;
    }
}

impl PickFirstPolicy {
    fn alloc_list_id(&mut self) -> u64 {
        let id = self.next_list_id;
        self.next_list_id += 1;
        id
    }

    fn list(&self, slot: ListSlot) -> &SubchannelList {
        match slot {
            ListSlot::Current => self.current_list.as_ref().unwrap(),
            ListSlot::Pending => self.pending_list.as_ref().unwrap(),
        }
    }

    fn list_mut(&mut self, slot: ListSlot) -> &mut SubchannelList {
        match slot {
            ListSlot::Current => self.current_list.as_mut().unwrap(),
            ListSlot::Pending => self.pending_list.as_mut().unwrap(),
        }
    }

    fn list_id(&self, slot: ListSlot) -> Option<u64> {
        match slot {
            ListSlot::Current => self.current_list.as_ref().map(|list| list.id),
            ListSlot::Pending => self.pending_list.as_ref().map(|list| list.id),
        }
    }

    // Builds a subchannel list from the most recent resolver update and plans
    // connection attempts against it, replacing the current or pending list
    // as the selection state dictates.
    fn attempt_to_connect_using_latest_update(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(update) = &self.latest_update else {
            return Ok(());
        };
        let addresses = update.addresses.clone().unwrap_or_default();
        let resolver_error = update.addresses.as_ref().err().cloned();
        let resolution_note = update.resolution_note.clone();
        let attributes = update.attributes.clone();

        let list = SubchannelList::new(
            self.alloc_list_id(),
            &addresses,
            &attributes,
            channel_controller,
        );
        debug!(
            "pick_first: created subchannel list {} with {} subchannels",
            list.id,
            list.num_subchannels()
        );

        // Empty update, or no address a subchannel could be created for.
        if list.num_subchannels() == 0 {
            // Unsubscribe from all current subchannels and put the channel
            // in TRANSIENT_FAILURE.
            self.current_list = Some(list);
            self.selected = None;
            let error = match resolver_error {
                Some(error) => error,
                None => format!(
                    "empty address list: {}",
                    resolution_note.unwrap_or_default()
                ),
            };
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker {
                    error: error.clone(),
                }),
            });
            // Drop any previously pending list so it cannot override what
            // was just published.
            self.pending_list = None;
            return Err(error.into());
        }

        // If one of the subchannels in the new list is already READY, select
        // it immediately.  This can happen when the currently selected
        // subchannel is also present in the update, and when a subchannel in
        // the update is held open by another channel sharing the pool.
        for index in 0..list.num_subchannels() {
            if list.subchannels[index].subchannel.current_state() == ConnectivityState::Ready {
                self.selected = None;
                self.current_list = Some(list);
                self.current_list
                    .as_mut()
                    .unwrap()
                    .start_connectivity_watch(index);
                self.process_unselected_ready(ListSlot::Current, index, channel_controller);
                self.pending_list = None;
                return Ok(());
            }
        }

        if self.selected.is_none() {
            // No subchannel is selected, so replace the current list
            // immediately and start connecting from the first address.
            self.current_list = Some(list);
            let list = self.current_list.as_mut().unwrap();
            list.start_connectivity_watch(0);
            list.subchannels[0].subchannel.request_connection();
        } else {
            // Keep the selected subchannel until one of the subchannels in
            // the new list reports READY.  A previous pending list that
            // never got there is replaced silently.
            if self.pending_list.is_some() {
                debug!("pick_first: replacing pending subchannel list with a newer update");
            }
            self.pending_list = Some(list);
            let list = self.pending_list.as_mut().unwrap();
            list.start_connectivity_watch(0);
            list.subchannels[0].subchannel.request_connection();
        }
        Ok(())
    }

    // Selects the subchannel at `index`, promoting the pending list first if
    // that is where it lives.
    fn process_unselected_ready(
        &mut self,
        slot: ListSlot,
        index: usize,
        channel_controller: &mut dyn ChannelController,
    ) {
        // A pending list with a READY subchannel always wins over whatever
        // the current list holds.
        if slot == ListSlot::Pending {
            debug!("pick_first: promoting pending subchannel list to replace the current list");
            self.selected = None;
            self.current_list = self.pending_list.take();
        }
        self.selected = Some(index);
        let list = self.current_list.as_mut().unwrap();
        let subchannel = list.subchannels[index].subchannel.clone();
        debug!("pick_first: selected subchannel {subchannel}");
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc: subchannel }),
        });
        // Release the connections that were not selected.  The selected
        // subchannel's watch stays registered to detect a future loss.
        list.shutdown_all_except(index);
    }

    // Reads the subchannel's state, then starts its watch.  The watch only
    // reports transitions, so a subchannel that became READY before the
    // watch attached would otherwise never be noticed; anything other than
    // READY gets a connection attempt.
    fn check_connectivity_state_and_start_watching(
        &mut self,
        slot: ListSlot,
        index: usize,
        channel_controller: &mut dyn ChannelController,
    ) {
        let list = self.list_mut(slot);
        let subchannel = list.subchannels[index].subchannel.clone();
        let current_state = subchannel.current_state();
        list.start_connectivity_watch(index);
        if current_state == ConnectivityState::Ready {
            if slot != ListSlot::Current || self.selected != Some(index) {
                self.process_unselected_ready(slot, index, channel_controller);
            }
        } else {
            subchannel.request_connection();
        }
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.sc.clone(),
            metadata: MetadataMap::new(),
        })
    }
}

// A picker that queues picks and schedules work.  This triggers the LB policy
// to leave IDLE and start connecting from the first address again.
pub struct IdlePicker {
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _request: &Request) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}

// Data tracked for each subchannel in a subchannel list.
struct SubchannelData {
    address: Address,
    subchannel: Arc<dyn Subchannel>,
    watched: bool, // A connectivity watch is registered through this list.
}

// An ordered list of subchannels created from one resolver update.
//
// The list owns the connectivity watches of its members: a watch started
// through the list is cancelled when the list is dropped, so replacing a
// list on the policy orphans its callbacks in the same serializer step.
struct SubchannelList {
    id: u64,
    subchannels: Vec<SubchannelData>,
    exhausted: bool, // Every member failed in the current attempt sweep.
}

impl SubchannelList {
    fn new(
        id: u64,
        addresses: &[Address],
        args: &Attributes,
        channel_controller: &mut dyn ChannelController,
    ) -> Self {
        let mut subchannels = Vec::with_capacity(addresses.len());
        for address in addresses {
            // Addresses the channel cannot produce a subchannel for are
            // dropped from the list.
            match channel_controller.new_subchannel(address, args) {
                Some(subchannel) => subchannels.push(SubchannelData {
                    address: address.clone(),
                    subchannel,
                    watched: false,
                }),
                None => warn!("pick_first: failed to create subchannel for {address}"),
            }
        }
        Self {
            id,
            subchannels,
            exhausted: false,
        }
    }

    fn num_subchannels(&self) -> usize {
        self.subchannels.len()
    }

    fn start_connectivity_watch(&mut self, index: usize) {
        let data = &mut self.subchannels[index];
        debug_assert!(!data.watched, "watch already started for {}", data.address);
        data.watched = true;
        data.subchannel.start_watch(WatchToken {
            list: self.id,
            index,
        });
    }

    fn cancel_connectivity_watch(&mut self, index: usize, reason: &str) {
        let data = &mut self.subchannels[index];
        if data.watched {
            data.watched = false;
            data.subchannel.cancel_watch(reason);
        }
    }

    fn reset_backoff(&self) {
        for data in &self.subchannels {
            data.subchannel.reset_backoff();
        }
    }

    fn shutdown_all_except(&mut self, keep: usize) {
        for index in 0..self.subchannels.len() {
            if index == keep {
                continue;
            }
            self.cancel_connectivity_watch(index, "selected a different subchannel");
            self.subchannels[index].subchannel.shutdown();
        }
    }
}

impl Drop for SubchannelList {
    fn drop(&mut self) {
        for index in 0..self.subchannels.len() {
            self.cancel_connectivity_watch(index, "subchannel list orphaned");
        }
    }
}
