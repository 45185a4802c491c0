//! AVRCP connection handler.
//!
//! [`ConnectionHandler`] owns the handle→device table and the per-address
//! feature table. All state lives in a single reactor task; the public API,
//! the transport, the SDP collaborator and every [`Device`] talk to it by
//! posting commands to its queue. Collaborators only ever hold a
//! [`HandlerInbox`], so nothing they keep alive can outlive the reactor's
//! state.

use std::{collections::HashMap, sync::Arc};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::{
   avrcp::{
      message::AvrcMessage,
      packet::Packet,
      parser::{self, ParseError},
      protocol::{AVCT_HDR_LEN_SINGLE, Opcode},
   },
   bluetooth::{
      address::Address,
      device::Device,
      policy::VolumePolicy,
      sdp::{
         self, DiscoveryDb, Features, LookupId, SdpInterface, SdpLookup, SdpQuery, SdpStatus,
         service_class,
      },
      transport::{AvrcpTransport, ChannelCallbacks, ConnRole, ControlEvent},
   },
   config::Config,
   error::{AvrcpError, Result},
   event::{AvrcpEvent, EventSender},
};

// === Commands ===

#[derive(Debug)]
pub(crate) enum HandlerCommand {
   // Transport events
   Control {
      role: ConnRole,
      handle: u8,
      event: ControlEvent,
      address: Address,
   },
   Message {
      handle: u8,
      label: u8,
      message: AvrcMessage,
   },

   // SDP
   SdpComplete {
      id: LookupId,
      status: SdpStatus,
      db: Option<DiscoveryDb>,
   },

   // Device requests
   Send {
      handle: u8,
      label: u8,
      browse: bool,
      packet: Packet,
   },

   // User commands
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(Address, oneshot::Sender<Result<bool>>),
   GetDevice(Address, oneshot::Sender<Option<Device>>),
   GetDevices(oneshot::Sender<Vec<Device>>),
   GetFeatures(Address, oneshot::Sender<Option<Features>>),
   CleanUp(oneshot::Sender<()>),
}

/// Weak handle to the connection handler's command queue.
///
/// Posting after the handler has stopped is a no-op.
#[derive(Debug, Clone)]
pub struct HandlerInbox(mpsc::WeakUnboundedSender<HandlerCommand>);

impl HandlerInbox {
   pub(crate) const fn new(tx: mpsc::WeakUnboundedSender<HandlerCommand>) -> Self {
      Self(tx)
   }

   pub(crate) fn post(&self, cmd: HandlerCommand) -> bool {
      self.0.upgrade().is_some_and(|tx| tx.send(cmd).is_ok())
   }

   /// Whether the handler behind this inbox has stopped.
   pub fn is_closed(&self) -> bool {
      self.0.upgrade().is_none_or(|tx| tx.is_closed())
   }
}

// === Main Handler ===

/// AVRCP connection handler.
///
/// Created with [`ConnectionHandler::initialize`]; stopped with
/// [`ConnectionHandler::clean_up`] or by dropping it.
pub struct ConnectionHandler {
   inbox: mpsc::UnboundedSender<HandlerCommand>,
}

impl ConnectionHandler {
   /// Arms one acceptor and starts the reactor on the current runtime.
   pub fn initialize(
      events: EventSender,
      transport: Arc<dyn AvrcpTransport>,
      sdp: Arc<dyn SdpInterface>,
      policy: Arc<dyn VolumePolicy>,
      config: &Config,
   ) -> Result<Self> {
      let (tx, rx) = mpsc::unbounded_channel();
      let mut actor = HandlerActor {
         events,
         transport,
         sdp,
         policy,
         inbox: HandlerInbox::new(tx.downgrade()),
         sdp_db_size: config.sdp_db_size,
         devices: HashMap::new(),
         features: HashMap::new(),
         pending: HashMap::new(),
         next_lookup: 0,
         acceptor: None,
      };

      if let Err(e) = actor.arm_acceptor() {
         error!("Failed to arm the acceptor: {e}");
         return Err(AvrcpError::AcceptorUnavailable);
      }

      tokio::spawn(actor.run(rx));
      Ok(Self { inbox: tx })
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> HandlerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .map_err(|_| AvrcpError::HandlerShutdown)?;
      rx.await.map_err(|_| AvrcpError::HandlerShutdown)
   }

   /// Starts service discovery on `address`, then opens a control channel.
   ///
   /// Returns once the lookup has been started.
   pub async fn connect_device(&self, address: Address) -> Result<()> {
      self
         .request(|tx| HandlerCommand::Connect(address, tx))
         .await?
   }

   /// Closes the control channel of the device at `address`.
   ///
   /// Returns `false` if no such device is connected.
   pub async fn disconnect_device(&self, address: Address) -> Result<bool> {
      self
         .request(|tx| HandlerCommand::Disconnect(address, tx))
         .await?
   }

   pub async fn device(&self, address: Address) -> Result<Device> {
      self
         .request(|tx| HandlerCommand::GetDevice(address, tx))
         .await?
         .ok_or(AvrcpError::DeviceNotFound(address))
   }

   /// Snapshot of the connected devices, ordered by handle.
   pub async fn devices(&self) -> Vec<Device> {
      self
         .request(HandlerCommand::GetDevices)
         .await
         .unwrap_or_default()
   }

   /// Feature bits learned from SDP for `address`.
   pub async fn features(&self, address: Address) -> Option<Features> {
      self
         .request(|tx| HandlerCommand::GetFeatures(address, tx))
         .await
         .ok()
         .flatten()
   }

   /// Closes every device and stops the reactor.
   pub async fn clean_up(self) {
      if self.request(HandlerCommand::CleanUp).await.is_err() {
         debug!("Connection handler already stopped");
      }
   }

   /// Weak handle for collaborators that report back to the handler.
   pub fn inbox(&self) -> HandlerInbox {
      HandlerInbox::new(self.inbox.downgrade())
   }
}

// === Handler Actor ===

#[derive(Debug, Clone, Copy)]
enum SdpNext {
   /// Open an initiator channel once features are known.
   Connect,
   /// Apply features to the device accepted on `handle`.
   AcceptorFeatures { handle: u8 },
}

#[derive(Debug)]
struct PendingLookup {
   address: Address,
   next: SdpNext,
}

struct HandlerActor {
   events: EventSender,
   transport: Arc<dyn AvrcpTransport>,
   sdp: Arc<dyn SdpInterface>,
   policy: Arc<dyn VolumePolicy>,
   inbox: HandlerInbox,
   sdp_db_size: usize,

   // State
   devices: HashMap<u8, Device>,
   features: HashMap<Address, Features>,
   pending: HashMap<LookupId, PendingLookup>,
   next_lookup: u64,
   acceptor: Option<u8>,
}

impl HandlerActor {
   async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HandlerCommand>) {
      info!("AVRCP connection handler starting up");

      while let Some(cmd) = rx.recv().await {
         if !self.handle_command(cmd) {
            break;
         }
      }

      // Cleanup
      self.cleanup();
      info!("AVRCP connection handler stopped");
   }

   fn handle_command(&mut self, cmd: HandlerCommand) -> bool {
      match cmd {
         HandlerCommand::Control {
            role,
            handle,
            event,
            address,
         } => {
            self.handle_control(role, handle, event, address);
         },
         HandlerCommand::Message {
            handle,
            label,
            message,
         } => {
            self.handle_message(handle, label, &message);
         },
         HandlerCommand::SdpComplete { id, status, db } => {
            self.handle_sdp_complete(id, status, db);
         },
         HandlerCommand::Send {
            handle,
            label,
            browse,
            packet,
         } => {
            self.handle_send(handle, label, browse, &packet);
         },
         HandlerCommand::Connect(address, reply) => {
            let result = self.connect_device(address);
            let _ = reply.send(result);
         },
         HandlerCommand::Disconnect(address, reply) => {
            let result = self.disconnect_device(address);
            let _ = reply.send(result);
         },
         HandlerCommand::GetDevice(address, reply) => {
            let device = self.find_device(address).cloned();
            let _ = reply.send(device);
         },
         HandlerCommand::GetDevices(reply) => {
            let mut devices: Vec<_> = self.devices.values().cloned().collect();
            devices.sort_unstable_by_key(Device::handle);
            let _ = reply.send(devices);
         },
         HandlerCommand::GetFeatures(address, reply) => {
            let _ = reply.send(self.features.get(&address).copied());
         },
         HandlerCommand::CleanUp(reply) => {
            self.cleanup();
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn find_device(&self, address: Address) -> Option<&Device> {
      self.devices.values().find(|d| d.address() == address)
   }

   fn callbacks(&self, role: ConnRole) -> ChannelCallbacks {
      ChannelCallbacks::new(role, self.inbox.clone())
   }

   fn arm_acceptor(&mut self) -> Result<u8> {
      let handle = self.transport.open(
         ConnRole::Acceptor,
         Address::ANY,
         self.callbacks(ConnRole::Acceptor),
      )?;
      debug!("Acceptor armed on handle {handle}");
      self.acceptor = Some(handle);
      Ok(handle)
   }

   // === SDP ===

   fn start_lookup(&mut self, address: Address, next: SdpNext) -> Result<LookupId> {
      let id = LookupId(self.next_lookup);
      self.next_lookup += 1;

      let query = SdpQuery::avrcp(self.sdp_db_size);
      let lookup = SdpLookup::new(
         id,
         address,
         DiscoveryDb::with_capacity(self.sdp_db_size),
         self.inbox.clone(),
      );
      self.pending.insert(id, PendingLookup { address, next });

      let uuid = sdp::service_class_uuid(service_class::AV_REMOTE_CONTROL);
      if let Err(e) = self.sdp.find_service(uuid, &query, lookup) {
         warn!("Failed to start SDP lookup {id} for {address}: {e}");
         self.pending.remove(&id);
         return Err(AvrcpError::SdpUnavailable(address));
      }
      debug!("SDP lookup {id} started for {address} ({next:?})");
      Ok(id)
   }

   fn handle_sdp_complete(&mut self, id: LookupId, status: SdpStatus, db: Option<DiscoveryDb>) {
      let Some(PendingLookup { address, next }) = self.pending.remove(&id) else {
         debug!("Discarding completion of unknown SDP lookup {id}");
         return;
      };

      let features = match (status, db) {
         (SdpStatus::Success, Some(db)) => {
            let (version, features) = sdp::decode_features(&db, &address, &*self.policy);
            info!("{address}: AVRCP version 0x{version:04x}, features {features}");
            Some(features)
         },
         (status, _) => {
            warn!("SDP lookup {id} for {address} finished with {status}");
            None
         },
      };

      match next {
         SdpNext::Connect => self.finish_connect(address, features),
         SdpNext::AcceptorFeatures { handle } => {
            self.finish_acceptor(handle, address, features.unwrap_or_default());
         },
      }
   }

   fn finish_connect(&mut self, address: Address, features: Option<Features>) {
      let Some(features) = features else {
         warn!("Abandoning connection to {address}: service discovery failed");
         return;
      };
      self.features.insert(address, features);

      match self
         .transport
         .open(ConnRole::Initiator, address, self.callbacks(ConnRole::Initiator))
      {
         Ok(handle) => debug!("Opening control channel to {address} on handle {handle}"),
         Err(e) => {
            error!("Failed to open control channel to {address}: {e}");
            self.features.remove(&address);
         },
      }
   }

   fn finish_acceptor(&mut self, handle: u8, address: Address, features: Features) {
      let Some(device) = self.devices.get(&handle).cloned() else {
         debug!("Discarding features for {address}: handle {handle} is gone");
         return;
      };
      if device.address() != address {
         debug!(
            "Discarding features for {address}: handle {handle} now belongs to {}",
            device.address()
         );
         return;
      }

      self.features.insert(address, features);
      device.set_features(features);
      device.set_browsable(features.contains(Features::BROWSE));
      self.apply_volume_policy(&device, features);
   }

   fn apply_volume_policy(&self, device: &Device, features: Features) {
      if features.contains(Features::ADV_CTRL) {
         if let Err(e) = device.register_volume_changed() {
            warn!("{}: failed to register for volume changes: {e}", device.address_str());
         }
      } else {
         self.policy.device_connected(device.address());
      }
   }

   // === Transport events ===

   fn handle_control(&mut self, role: ConnRole, handle: u8, event: ControlEvent, address: Address) {
      debug!("Control event {event} ({role}) on handle {handle} from {address}");
      match (event, role) {
         (ControlEvent::Open, ConnRole::Initiator) => self.handle_open_initiator(handle, address),
         (ControlEvent::Open, ConnRole::Acceptor) => self.handle_open_acceptor(handle, address),
         (ControlEvent::Close, _) => self.handle_close(handle),
         (ControlEvent::BrowseOpen, _) => {
            if let Some(device) = self.devices.get(&handle) {
               let mtu = self
                  .transport
                  .browse_mtu(handle)
                  .saturating_sub(AVCT_HDR_LEN_SINGLE);
               device.set_browse_mtu(mtu);
               debug!("{}: browse channel open, MTU {mtu}", device.address_str());
            } else {
               warn!("Browse open on unknown handle {handle}");
            }
         },
         (ControlEvent::BrowseClose, _) => {
            debug!("Browse channel closed on handle {handle}");
         },
         (ControlEvent::Congested | ControlEvent::Uncongested, _) => {
            debug!("Handle {handle}: {event}");
         },
      }
   }

   fn new_device(&self, handle: u8, address: Address, browsable: bool) -> Device {
      let ctrl_mtu = self
         .transport
         .peer_mtu(handle)
         .saturating_sub(AVCT_HDR_LEN_SINGLE);
      let browse_mtu = self
         .transport
         .browse_mtu(handle)
         .saturating_sub(AVCT_HDR_LEN_SINGLE);
      Device::new(address, handle, ctrl_mtu, browse_mtu, browsable, self.inbox.clone())
   }

   fn handle_open_initiator(&mut self, handle: u8, address: Address) {
      let Some(features) = self.features.get(&address).copied() else {
         error!("Connected to {address} on handle {handle} without SDP features, abandoning");
         return;
      };

      let browsable = features.contains(Features::BROWSE)
         && match self.transport.open_browse(handle, ConnRole::Initiator) {
            Ok(()) => true,
            Err(e) => {
               warn!("{address}: failed to open browse channel: {e}");
               false
            },
         };

      let device = self.new_device(handle, address, browsable);
      device.set_features(features);
      self.devices.insert(handle, device.clone());
      info!(
         "{address}: connected on handle {handle} (mtu {}, browse mtu {})",
         device.ctrl_mtu(),
         device.browse_mtu()
      );
      self.events.emit(&device, AvrcpEvent::DeviceConnected);
      self.apply_volume_policy(&device, features);
   }

   fn handle_open_acceptor(&mut self, handle: u8, address: Address) {
      let device = self.new_device(handle, address, false);
      self.devices.insert(handle, device.clone());
      info!("{address}: accepted on handle {handle}");
      self.events.emit(&device, AvrcpEvent::DeviceConnected);

      if self.acceptor == Some(handle) {
         self.acceptor = None;
      }
      if let Err(e) = self.arm_acceptor() {
         error!("Failed to re-arm the acceptor: {e}");
      }

      if self
         .start_lookup(address, SdpNext::AcceptorFeatures { handle })
         .is_err()
      {
         self.finish_acceptor(handle, address, Features::empty());
      }
   }

   fn handle_close(&mut self, handle: u8) {
      let Some(device) = self.devices.remove(&handle) else {
         warn!("Close on unknown handle {handle}");
         return;
      };

      let address = device.address();
      if let Err(e) = self.transport.close(handle) {
         warn!("{address}: failed to close handle {handle}: {e}");
      }
      self.features.remove(&address);
      device.disconnected();
      self.policy.device_disconnected(address);
      self.events.emit(&device, AvrcpEvent::DeviceDisconnected);
   }

   fn handle_message(&self, handle: u8, label: u8, message: &AvrcMessage) {
      let Some(device) = self.devices.get(&handle) else {
         error!("Message on unknown handle {handle}, label {label}");
         return;
      };

      let result = match Opcode::from_repr(message.opcode()) {
         Some(opcode @ (Opcode::Vendor | Opcode::PassThrough | Opcode::Browse)) => {
            parser::parse_packet(opcode, &message.to_packet())
         },
         _ => Err(ParseError::UnsupportedOpcode(message.opcode())),
      };

      let event = match result {
         Ok(response) => AvrcpEvent::Response { label, response },
         Err(e) => {
            debug!("{}: label {label} failed to parse: {e}", device.address_str());
            AvrcpEvent::ParseFailed {
               label,
               status: e.status(),
            }
         },
      };
      self.events.emit(device, event);
   }

   fn handle_send(&self, handle: u8, label: u8, browse: bool, packet: &Packet) {
      if !self.devices.contains_key(&handle) {
         warn!("Dropping message for unknown handle {handle}, label {label}");
         return;
      }
      if let Err(e) = self.transport.msg_req(handle, label, browse, packet) {
         warn!("Failed to send label {label} on handle {handle}: {e}");
      }
   }

   // === User commands ===

   fn connect_device(&mut self, address: Address) -> Result<()> {
      if let Some(device) = self.find_device(address) {
         debug!("{address}: already connected on handle {}", device.handle());
         return Ok(());
      }
      self.start_lookup(address, SdpNext::Connect).map(|_| ())
   }

   fn disconnect_device(&self, address: Address) -> Result<bool> {
      let Some(device) = self.find_device(address) else {
         return Ok(false);
      };
      self.transport.close(device.handle())?;
      Ok(true)
   }

   fn cleanup(&mut self) {
      if self.devices.is_empty() && self.acceptor.is_none() && self.pending.is_empty() {
         return;
      }
      info!("Cleaning up connection handler");

      let mut devices: Vec<_> = self.devices.drain().collect();
      devices.sort_unstable_by_key(|(handle, _)| *handle);
      for (handle, device) in devices {
         if let Err(e) = self.transport.close(handle) {
            warn!("{}: failed to close handle {handle}: {e}", device.address_str());
         }
         device.disconnected();
         self.policy.device_disconnected(device.address());
         self.events.emit(&device, AvrcpEvent::DeviceDisconnected);
      }

      if let Some(handle) = self.acceptor.take()
         && let Err(e) = self.transport.close(handle)
      {
         warn!("Failed to close acceptor handle {handle}: {e}");
      }
      self.features.clear();
      self.pending.clear();
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

   use parking_lot::Mutex;

   use super::*;
   use crate::{
      avrcp::{
         message::{AvcHeader, VendorMessage},
         protocol::{COMPANY_ID_BT_SIG, CType, EventId, PduId, Status},
         response::{Notification, ParsedResponse, Response, VendorResponse},
      },
      bluetooth::{
         policy::StaticPolicy,
         sdp::{AVRC_REV_1_3, AVRC_REV_1_4, CATEGORY_2, CATEGORY_BROWSE, SdpRecord},
      },
      event::EventQueue,
   };

   const PEER: Address = Address([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
   const OTHER: Address = Address([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x14]);

   #[derive(Default)]
   struct FakeTransport {
      next_handle: AtomicU8,
      fail_open: AtomicBool,
      fail_browse: AtomicBool,
      fail_close: AtomicBool,
      opens: Mutex<Vec<(ConnRole, Address, u8)>>,
      callbacks: Mutex<HashMap<u8, ChannelCallbacks>>,
      browse_opens: Mutex<Vec<u8>>,
      closes: Mutex<Vec<u8>>,
      sent: Mutex<Vec<(u8, u8, bool, Vec<u8>)>>,
   }

   impl FakeTransport {
      fn callbacks(&self, handle: u8) -> ChannelCallbacks {
         self.callbacks.lock()[&handle].clone()
      }

      fn opened(&self, role: ConnRole) -> Vec<(Address, u8)> {
         self
            .opens
            .lock()
            .iter()
            .filter(|(r, ..)| *r == role)
            .map(|&(_, address, handle)| (address, handle))
            .collect()
      }
   }

   impl AvrcpTransport for FakeTransport {
      fn open(&self, role: ConnRole, address: Address, callbacks: ChannelCallbacks) -> Result<u8> {
         if self.fail_open.load(Ordering::Relaxed) {
            return Err(AvrcpError::OpenFailed(address));
         }
         let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
         self.opens.lock().push((role, address, handle));
         self.callbacks.lock().insert(handle, callbacks);
         Ok(handle)
      }

      fn open_browse(&self, handle: u8, _role: ConnRole) -> Result<()> {
         if self.fail_browse.load(Ordering::Relaxed) {
            return Err(AvrcpError::BrowseOpenFailed(handle));
         }
         self.browse_opens.lock().push(handle);
         Ok(())
      }

      fn close(&self, handle: u8) -> Result<()> {
         if self.fail_close.load(Ordering::Relaxed) {
            return Err(AvrcpError::CloseFailed(handle));
         }
         self.closes.lock().push(handle);
         Ok(())
      }

      fn msg_req(&self, handle: u8, label: u8, browse: bool, packet: &Packet) -> Result<()> {
         self
            .sent
            .lock()
            .push((handle, label, browse, packet.data().to_vec()));
         Ok(())
      }

      fn peer_mtu(&self, _handle: u8) -> u16 {
         672
      }

      fn browse_mtu(&self, _handle: u8) -> u16 {
         1024
      }
   }

   #[derive(Default)]
   struct FakeSdp {
      refuse: AtomicBool,
      lookups: Mutex<Vec<SdpLookup>>,
   }

   impl FakeSdp {
      fn pending(&self) -> usize {
         self.lookups.lock().len()
      }

      fn complete(&self, records: Vec<SdpRecord>, status: SdpStatus) -> Address {
         let mut lookup = self.lookups.lock().remove(0);
         let address = lookup.address();
         if let Some(db) = lookup.db_mut() {
            for record in records {
               db.push_record(record);
            }
         }
         lookup.complete(status);
         address
      }
   }

   impl SdpInterface for FakeSdp {
      fn find_service(&self, uuid: uuid::Uuid, query: &SdpQuery, lookup: SdpLookup) -> Result<()> {
         assert_eq!(sdp::short_uuid(&uuid), Some(service_class::AV_REMOTE_CONTROL));
         assert_eq!(query.db_len, Config::default().sdp_db_size);
         if self.refuse.load(Ordering::Relaxed) {
            return Err(AvrcpError::SdpUnavailable(lookup.address()));
         }
         self.lookups.lock().push(lookup);
         Ok(())
      }
   }

   struct Harness {
      handler: ConnectionHandler,
      transport: Arc<FakeTransport>,
      sdp: Arc<FakeSdp>,
      policy: Arc<StaticPolicy>,
      events: Arc<EventQueue>,
   }

   impl Harness {
      fn new(policy: StaticPolicy) -> Self {
         let _ = env_logger::builder().is_test(true).try_init();
         let transport = Arc::new(FakeTransport::default());
         let sdp = Arc::new(FakeSdp::default());
         let policy = Arc::new(policy);
         let events = EventQueue::new();
         let handler = ConnectionHandler::initialize(
            events.clone(),
            transport.clone(),
            sdp.clone(),
            policy.clone(),
            &Config::default(),
         )
         .unwrap();
         Self {
            handler,
            transport,
            sdp,
            policy,
            events,
         }
      }

      /// Waits until everything queued so far, and what it queued, is handled.
      async fn settle(&self) {
         self.handler.devices().await;
         self.handler.devices().await;
      }

      fn drain_events(&self) -> Vec<(Device, AvrcpEvent)> {
         drain(&self.events)
      }

      fn acceptor(&self) -> u8 {
         self.transport.opened(ConnRole::Acceptor).last().unwrap().1
      }

      /// Accepts an incoming connection from `address` on the armed acceptor.
      async fn accept(&self, address: Address) -> u8 {
         let handle = self.acceptor();
         assert!(
            self
               .transport
               .callbacks(handle)
               .on_control(handle, ControlEvent::Open, address)
         );
         self.settle().await;
         handle
      }

      /// Connects to `address` as initiator, answering SDP with `record`.
      async fn connect(&self, address: Address, record: SdpRecord) -> u8 {
         self.handler.connect_device(address).await.unwrap();
         self.sdp.complete(vec![record], SdpStatus::Success);
         self.settle().await;

         let (_, handle) = *self.transport.opened(ConnRole::Initiator).last().unwrap();
         assert!(
            self
               .transport
               .callbacks(handle)
               .on_control(handle, ControlEvent::Open, address)
         );
         self.settle().await;
         handle
      }
   }

   fn drain(events: &EventQueue) -> Vec<(Device, AvrcpEvent)> {
      std::iter::from_fn(|| events.try_recv()).collect()
   }

   fn controller(version: u16, categories: u16) -> SdpRecord {
      SdpRecord::new(&[service_class::AV_REMOTE_CONTROL, service_class::AV_REM_CTRL_CONTROL])
         .with_profile(service_class::AV_REMOTE_CONTROL, version)
         .with_supported_features(categories)
   }

   #[tokio::test]
   async fn test_initialize_arms_exactly_one_acceptor() {
      let h = Harness::new(StaticPolicy::new(true));
      assert_eq!(h.transport.opened(ConnRole::Acceptor), vec![(Address::ANY, 1)]);
      assert_eq!(h.transport.callbacks(1).role(), ConnRole::Acceptor);
      assert!(h.handler.devices().await.is_empty());
   }

   #[tokio::test]
   async fn test_initialize_fails_without_acceptor() {
      let transport = Arc::new(FakeTransport::default());
      transport.fail_open.store(true, Ordering::Relaxed);
      let result = ConnectionHandler::initialize(
         EventQueue::new(),
         transport.clone(),
         Arc::new(FakeSdp::default()),
         Arc::new(StaticPolicy::new(true)),
         &Config::default(),
      );
      assert!(matches!(result, Err(AvrcpError::AcceptorUnavailable)));
      assert!(transport.callbacks.lock().is_empty());
   }

   #[tokio::test]
   async fn test_connect_with_browse_category_opens_browse_channel() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h
         .connect(PEER, controller(AVRC_REV_1_4, CATEGORY_2 | CATEGORY_BROWSE))
         .await;

      assert_eq!(*h.transport.browse_opens.lock(), vec![handle]);
      let features = h.handler.features(PEER).await.unwrap();
      assert!(features.contains(Features::BROWSE | Features::ADV_CTRL | Features::RC_CONTROLLER));

      let devices = h.handler.devices().await;
      assert_eq!(devices.len(), 1);
      let device = &devices[0];
      assert!(device.is_browsable());
      assert_eq!(device.ctrl_mtu(), 669);
      assert_eq!(device.browse_mtu(), 1021);
      assert_eq!(device.features(), Some(features));
      assert_eq!(h.handler.device(PEER).await.unwrap(), *device);

      let events = h.drain_events();
      assert_eq!(events.len(), 1);
      assert!(matches!(events[0].1, AvrcpEvent::DeviceConnected));

      // Absolute volume: interest registered, policy not involved
      assert!(device.volume_registered());
      let sent = h.transport.sent.lock().clone();
      assert_eq!(sent.len(), 1);
      let (sent_handle, _, browse, ref bytes) = sent[0];
      assert_eq!((sent_handle, browse), (handle, false));
      assert_eq!(bytes[6], PduId::RegisterNotification as u8);
      assert_eq!(bytes[10], EventId::VolumeChanged as u8);
      assert!(h.policy.connected_devices().is_empty());
   }

   #[tokio::test]
   async fn test_connect_without_absolute_volume_notifies_policy() {
      let h = Harness::new(StaticPolicy::new(true));
      h.policy.block(PEER);
      h.connect(PEER, controller(AVRC_REV_1_4, CATEGORY_2)).await;

      let features = h.handler.features(PEER).await.unwrap();
      assert!(!features.contains(Features::ADV_CTRL));
      assert!(!features.contains(Features::BROWSE));
      assert!(h.transport.browse_opens.lock().is_empty());
      assert!(h.transport.sent.lock().is_empty());
      assert_eq!(h.policy.connected_devices(), vec![PEER]);
   }

   #[tokio::test]
   async fn test_connect_when_sdp_refuses() {
      let h = Harness::new(StaticPolicy::new(true));
      h.sdp.refuse.store(true, Ordering::Relaxed);
      assert!(matches!(
         h.handler.connect_device(PEER).await,
         Err(AvrcpError::SdpUnavailable(addr)) if addr == PEER
      ));
      h.settle().await;
      assert!(h.transport.opened(ConnRole::Initiator).is_empty());
      assert_eq!(h.handler.features(PEER).await, None);
   }

   #[tokio::test]
   async fn test_connect_abandoned_when_sdp_fails() {
      let h = Harness::new(StaticPolicy::new(true));
      h.handler.connect_device(PEER).await.unwrap();
      assert_eq!(h.sdp.pending(), 1);
      h.sdp.complete(vec![], SdpStatus::Failed);
      h.settle().await;

      assert!(h.transport.opened(ConnRole::Initiator).is_empty());
      assert_eq!(h.handler.features(PEER).await, None);
   }

   #[tokio::test]
   async fn test_dropped_lookup_counts_as_failure() {
      let h = Harness::new(StaticPolicy::new(true));
      h.handler.connect_device(PEER).await.unwrap();
      drop(h.sdp.lookups.lock().pop());
      h.settle().await;

      assert!(h.transport.opened(ConnRole::Initiator).is_empty());
      assert_eq!(h.handler.features(PEER).await, None);
   }

   #[tokio::test]
   async fn test_failed_initiator_open_forgets_features() {
      let h = Harness::new(StaticPolicy::new(true));
      h.transport.fail_open.store(true, Ordering::Relaxed);
      h.handler.connect_device(PEER).await.unwrap();
      h.sdp
         .complete(vec![controller(AVRC_REV_1_4, CATEGORY_BROWSE)], SdpStatus::Success);
      h.settle().await;

      assert!(h.transport.opened(ConnRole::Initiator).is_empty());
      assert_eq!(h.handler.features(PEER).await, None);
      assert!(h.handler.devices().await.is_empty());
   }

   #[tokio::test]
   async fn test_browse_open_failure_leaves_device_unbrowsable() {
      let h = Harness::new(StaticPolicy::new(false));
      h.transport.fail_browse.store(true, Ordering::Relaxed);
      h.connect(PEER, controller(AVRC_REV_1_4, CATEGORY_BROWSE)).await;

      let device = h.handler.device(PEER).await.unwrap();
      assert!(h.transport.browse_opens.lock().is_empty());
      assert!(!device.is_browsable());
      assert!(device.features().unwrap().contains(Features::BROWSE));
      assert!(matches!(h.drain_events()[..], [(_, AvrcpEvent::DeviceConnected)]));
   }

   #[tokio::test]
   async fn test_initiator_open_without_features_is_abandoned() {
      let h = Harness::new(StaticPolicy::new(true));
      let callbacks = ChannelCallbacks::new(ConnRole::Initiator, h.handler.inbox());
      assert!(callbacks.on_control(7, ControlEvent::Open, PEER));
      h.settle().await;

      assert!(h.handler.devices().await.is_empty());
      assert!(h.drain_events().is_empty());
   }

   #[tokio::test]
   async fn test_acceptor_open_rearms_and_applies_features() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h.accept(PEER).await;

      let acceptors = h.transport.opened(ConnRole::Acceptor);
      assert_eq!(acceptors.len(), 2);
      assert_ne!(acceptors[1].1, handle);

      let device = h.handler.device(PEER).await.unwrap();
      assert!(!device.is_browsable());
      assert_eq!(device.features(), None);
      assert!(matches!(h.drain_events()[..], [(_, AvrcpEvent::DeviceConnected)]));

      assert_eq!(h.sdp.pending(), 1);
      h.sdp
         .complete(vec![controller(AVRC_REV_1_4, CATEGORY_BROWSE)], SdpStatus::Success);
      h.settle().await;

      assert!(device.is_browsable());
      assert!(device.features().unwrap().contains(Features::BROWSE));
      assert!(h.handler.features(PEER).await.is_some());
      assert_eq!(h.policy.connected_devices(), vec![PEER]);
      // Browse channels toward acceptors are opened by the peer
      assert!(h.transport.browse_opens.lock().is_empty());
   }

   #[tokio::test]
   async fn test_acceptor_sdp_failure_still_applies_policy() {
      let h = Harness::new(StaticPolicy::new(true));
      h.accept(PEER).await;
      h.sdp.complete(vec![], SdpStatus::Failed);
      h.settle().await;

      let device = h.handler.device(PEER).await.unwrap();
      assert_eq!(device.features(), Some(Features::empty()));
      assert_eq!(h.policy.connected_devices(), vec![PEER]);
   }

   #[tokio::test]
   async fn test_stale_acceptor_completion_is_discarded() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h.accept(PEER).await;
      assert!(
         h.transport
            .callbacks(handle)
            .on_control(handle, ControlEvent::Close, PEER)
      );
      h.settle().await;

      h.sdp
         .complete(vec![controller(AVRC_REV_1_4, CATEGORY_2)], SdpStatus::Success);
      h.settle().await;

      assert_eq!(h.handler.features(PEER).await, None);
      assert!(h.policy.connected_devices().is_empty());
      assert!(h.transport.sent.lock().is_empty());
   }

   #[tokio::test]
   async fn test_close_removes_only_the_matching_device() {
      let h = Harness::new(StaticPolicy::new(true));
      let first = h.accept(PEER).await;
      let second = h.accept(OTHER).await;
      h.sdp
         .complete(vec![controller(AVRC_REV_1_3, 0)], SdpStatus::Success);
      h.sdp
         .complete(vec![controller(AVRC_REV_1_3, 0)], SdpStatus::Success);
      h.settle().await;
      h.drain_events();

      // Unknown handle: nothing changes
      let callbacks = h.transport.callbacks(first);
      assert!(callbacks.on_control(99, ControlEvent::Close, PEER));
      h.settle().await;
      assert_eq!(h.handler.devices().await.len(), 2);
      assert!(h.transport.closes.lock().is_empty());
      assert!(h.drain_events().is_empty());

      let device = h.handler.device(PEER).await.unwrap();
      assert!(callbacks.on_control(first, ControlEvent::Close, PEER));
      h.settle().await;

      assert_eq!(*h.transport.closes.lock(), vec![first]);
      let remaining = h.handler.devices().await;
      assert_eq!(remaining.len(), 1);
      assert_eq!(remaining[0].handle(), second);
      assert_eq!(h.handler.features(PEER).await, None);
      assert!(h.handler.features(OTHER).await.is_some());
      assert_eq!(h.policy.connected_devices(), vec![OTHER]);

      let events = h.drain_events();
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].0, device);
      assert!(matches!(events[0].1, AvrcpEvent::DeviceDisconnected));

      assert!(!device.is_connected());
      assert!(matches!(
         device.register_volume_changed(),
         Err(AvrcpError::DeviceNotConnected)
      ));
   }

   #[tokio::test]
   async fn test_browse_open_updates_mtu() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h.accept(PEER).await;
      let device = h.handler.device(PEER).await.unwrap();
      device.set_browse_mtu(0);

      let callbacks = h.transport.callbacks(handle);
      assert!(callbacks.on_control(handle, ControlEvent::BrowseOpen, PEER));
      assert!(callbacks.on_control(handle, ControlEvent::Congested, PEER));
      assert!(callbacks.on_control(handle, ControlEvent::BrowseClose, PEER));
      h.settle().await;

      assert_eq!(device.browse_mtu(), 1021);
      assert!(device.is_connected());
   }

   fn vendor_response(ctype: CType, data: Vec<u8>) -> AvrcMessage {
      AvrcMessage::Vendor(VendorMessage {
         header: AvcHeader::new(ctype),
         company_id: COMPANY_ID_BT_SIG,
         data,
      })
   }

   #[tokio::test]
   async fn test_inbound_messages_are_parsed_and_published() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h.accept(PEER).await;
      h.drain_events();
      let callbacks = h.transport.callbacks(handle);

      let volume = vendor_response(CType::Changed, vec![0x31, 0x00, 0x00, 0x02, 0x0D, 0x40]);
      assert!(callbacks.on_message(handle, 5, volume.clone()));
      let truncated = vendor_response(CType::Interim, vec![0x31, 0x00, 0x00, 0x05, 0x05]);
      assert!(callbacks.on_message(handle, 6, truncated));
      let rejected = vendor_response(CType::Rejected, vec![0x31, 0x00, 0x00, 0x01, 0x01]);
      assert!(callbacks.on_message(handle, 7, rejected));
      let unit_info = AvrcMessage::Other {
         header: AvcHeader::new(CType::Stable),
         opcode: Opcode::UnitInfo as u8,
      };
      assert!(callbacks.on_message(handle, 8, unit_info));
      // Unknown handle: logged and dropped
      assert!(callbacks.on_message(42, 9, volume));
      h.settle().await;

      let events: Vec<_> = h.drain_events().into_iter().map(|(_, e)| e).collect();
      assert_eq!(events.len(), 4);
      let AvrcpEvent::Response {
         label: 5,
         response:
            Response::Vendor(VendorResponse {
               pdu: Some(PduId::RegisterNotification),
               params: ParsedResponse::RegisterNotification(notification),
               ..
            }),
      } = &events[0]
      else {
         panic!("unexpected event {:?}", events[0]);
      };
      assert_eq!(*notification, Notification::Volume(0x40));

      assert!(matches!(
         events[1],
         AvrcpEvent::ParseFailed { label: 6, status } if status == Status::INTERNAL_ERROR
      ));
      assert!(matches!(
         events[2],
         AvrcpEvent::ParseFailed { label: 7, status } if status == Status::BAD_PARAM
      ));
      assert!(matches!(
         events[3],
         AvrcpEvent::ParseFailed { label: 8, status } if status == Status::BAD_CMD
      ));
   }

   #[tokio::test]
   async fn test_send_for_unknown_handle_is_dropped() {
      let h = Harness::new(StaticPolicy::new(true));
      let inbox = h.handler.inbox();
      assert!(inbox.post(HandlerCommand::Send {
         handle: 42,
         label: 1,
         browse: false,
         packet: Packet::from_slice(&[0x01, 0x48, 0x00]),
      }));
      h.settle().await;
      assert!(h.transport.sent.lock().is_empty());
   }

   #[tokio::test]
   async fn test_disconnect_device() {
      let h = Harness::new(StaticPolicy::new(true));
      assert!(!h.handler.disconnect_device(PEER).await.unwrap());

      let handle = h.accept(PEER).await;
      h.transport.fail_close.store(true, Ordering::Relaxed);
      assert!(matches!(
         h.handler.disconnect_device(PEER).await,
         Err(AvrcpError::CloseFailed(failed)) if failed == handle
      ));
      assert!(h.handler.device(PEER).await.is_ok());

      h.transport.fail_close.store(false, Ordering::Relaxed);
      assert!(h.handler.disconnect_device(PEER).await.unwrap());
      assert_eq!(*h.transport.closes.lock(), vec![handle]);
      assert!(matches!(
         h.handler.device(OTHER).await,
         Err(AvrcpError::DeviceNotFound(addr)) if addr == OTHER
      ));
   }

   #[tokio::test]
   async fn test_clean_up_closes_everything_and_disables_inbox() {
      let h = Harness::new(StaticPolicy::new(true));
      let handle = h.accept(PEER).await;
      let acceptor = h.acceptor();
      let device = h.handler.device(PEER).await.unwrap();
      let inbox = h.handler.inbox();
      let callbacks = h.transport.callbacks(handle);
      h.drain_events();

      h.handler.clean_up().await;

      assert_eq!(*h.transport.closes.lock(), vec![handle, acceptor]);
      assert!(!device.is_connected());
      assert!(matches!(drain(&h.events)[..], [(_, AvrcpEvent::DeviceDisconnected)]));

      assert!(inbox.is_closed());
      assert!(!callbacks.on_control(handle, ControlEvent::Close, PEER));
      assert!(!inbox.post(HandlerCommand::Send {
         handle,
         label: 0,
         browse: false,
         packet: Packet::from_slice(&[0x03]),
      }));
      // The pending lookup reports back into the void
      assert!(!h.sdp.lookups.lock().pop().unwrap().complete(SdpStatus::Success));
   }
}
