//! Routes, their packed keys, and the static/dynamic route tables.
//!
//! Address matching is not done here; a route is an opaque keyed record
//! whose key compares field by field and then over the packed endpoint
//! bytes.

use crate::action::CallerArg;
use crate::config::EventConfigInternal;
use crate::constants::*;
use crate::context::{Context, Tables};
use crate::dispatch::dispatch;
use crate::entity::{EntHeader, EntRef, IndexedEnt, RefDrop, TableEnt};
use crate::errors::{Error, Result};
use crate::event::Event;
use crate::helpers::{atomic_update, bits_to_bytes};
use crate::table::{ByIdIndex, Table};
use crate::types::{ActionRes, EntId, Label, ObjectType, RouteFlags, Time};
use ipnet::IpNet;
use log::{debug, info, trace};
use metrics::counter;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::fmt;
use std::net::IpAddr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RouteTableKind {
    Static = 0,
    Dynamic = 1,
}

impl RouteTableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteTableKind::Static => "static_routes",
            RouteTableKind::Dynamic => "dynamic_routes",
        }
    }
}

/// Caller-facing description of one endpoint of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSpec {
    pub port: u16,
    /// Address bytes, at least `bits_to_bytes(addr_len)` long.
    pub addr: Vec<u8>,
    /// Significant address length in bits.
    pub addr_len: u16,
    pub interface: u8,
    pub extra_ports: Vec<u16>,
}

impl EndpointSpec {
    pub fn from_net(net: &IpNet, port: u16) -> Self {
        let addr = match net.network() {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        };
        Self {
            port,
            addr,
            addr_len: net.prefix_len() as u16,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.addr_len > MAX_ADDR_BITS {
            return Err(Error::InvalidArg("address longer than the maximum"));
        }
        if self.addr.len() < bits_to_bytes(self.addr_len) {
            return Err(Error::InvalidArg("address bytes shorter than address length"));
        }
        if self.extra_ports.len() > MAX_EXTRA_PORTS {
            return Err(Error::InvalidArg("too many extra ports"));
        }
        Ok(())
    }

    /// Significant address bytes with the bits past `addr_len` cleared.
    fn masked_addr(&self) -> Vec<u8> {
        let n = bits_to_bytes(self.addr_len);
        let mut out = self.addr[..n].to_vec();
        let spare = (n * 8) as u16 - self.addr_len;
        if let Some(last) = out.last_mut() {
            *last &= 0xffu8 << spare;
        }
        out
    }

    fn desc(&self) -> EndpointDesc {
        EndpointDesc {
            port: self.port,
            addr_len: self.addr_len,
            extra_port_count: self.extra_ports.len() as u8,
            interface: self.interface,
        }
    }
}

/// Caller-facing route description, used both to insert a route and as a
/// lookup template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSpec {
    pub family: u16,
    pub protocol: u16,
    pub remote: EndpointSpec,
    pub local: EndpointSpec,
    pub flags: RouteFlags,
}

impl RouteSpec {
    /// Route between two networks of the same address family.
    pub fn from_nets(remote: IpNet, local: IpNet, protocol: u16) -> Result<Self> {
        let family = match (remote, local) {
            (IpNet::V4(_), IpNet::V4(_)) => FAMILY_INET,
            (IpNet::V6(_), IpNet::V6(_)) => FAMILY_INET6,
            _ => return Err(Error::InvalidArg("mixed address families")),
        };
        Ok(Self {
            family,
            protocol,
            remote: EndpointSpec::from_net(&remote, 0),
            local: EndpointSpec::from_net(&local, 0),
            flags: RouteFlags::empty(),
        })
    }

    pub fn with_ports(mut self, remote: u16, local: u16) -> Self {
        self.remote.port = remote;
        self.local.port = local;
        self
    }

    pub fn with_flags(mut self, flags: RouteFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn to_key(&self) -> Result<RouteKey> {
        self.remote.validate()?;
        self.local.validate()?;
        let remote_addr = self.remote.masked_addr();
        let local_addr = self.local.masked_addr();
        let mut data = Vec::new();
        let addr_bytes = remote_addr.len() + local_addr.len();
        let ports = self.remote.extra_ports.len() + self.local.extra_ports.len();
        data.try_reserve_exact(addr_bytes + 1 + ports * 2)
            .map_err(|_| Error::SysResourceFailed)?;
        data.extend_from_slice(&remote_addr);
        data.extend_from_slice(&local_addr);
        // Ports start on an even offset.
        if addr_bytes % 2 == 1 {
            data.push(0);
        }
        for p in self.remote.extra_ports.iter().chain(&self.local.extra_ports) {
            data.extend_from_slice(&p.to_ne_bytes());
        }
        Ok(RouteKey {
            family: self.family,
            protocol: self.protocol,
            remote: self.remote.desc(),
            local: self.local.desc(),
            flags: self.flags & RouteFlags::KEY_MASK,
            data: data.into_boxed_slice(),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointDesc {
    pub port: u16,
    pub addr_len: u16,
    pub extra_port_count: u8,
    pub interface: u8,
}

/// Route identity. Field order is comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    family: u16,
    protocol: u16,
    remote: EndpointDesc,
    local: EndpointDesc,
    flags: RouteFlags,
    // remote addr | local addr | pad to even | remote extra ports | local extra ports
    data: Box<[u8]>,
}

impl RouteKey {
    pub fn family(&self) -> u16 {
        self.family
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn remote(&self) -> &EndpointDesc {
        &self.remote
    }

    pub fn local(&self) -> &EndpointDesc {
        &self.local
    }

    pub fn remote_addr(&self) -> &[u8] {
        &self.data[..bits_to_bytes(self.remote.addr_len)]
    }

    pub fn local_addr(&self) -> &[u8] {
        let start = bits_to_bytes(self.remote.addr_len);
        &self.data[start..start + bits_to_bytes(self.local.addr_len)]
    }

    fn ports_offset(&self) -> usize {
        let n = bits_to_bytes(self.remote.addr_len) + bits_to_bytes(self.local.addr_len);
        n + (n & 1)
    }

    fn ports_at(&self, start: usize, count: u8) -> Vec<u16> {
        self.data[start..start + count as usize * 2]
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    pub fn remote_extra_ports(&self) -> Vec<u16> {
        self.ports_at(self.ports_offset(), self.remote.extra_port_count)
    }

    pub fn local_extra_ports(&self) -> Vec<u16> {
        let start = self.ports_offset() + self.remote.extra_port_count as usize * 2;
        self.ports_at(start, self.local.extra_port_count)
    }

    /// Length of the packed endpoint buffer.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Timestamps and counters kept per route.
#[derive(Debug)]
pub struct RouteMeta {
    insert_time: Time,
    last_hit_time: AtomicI64,
    connection_count: AtomicU32,
    derogatory_count: AtomicU32,
    commendable_count: AtomicU32,
}

impl RouteMeta {
    fn new(now: Time) -> Self {
        Self {
            insert_time: now,
            last_hit_time: AtomicI64::new(now),
            connection_count: AtomicU32::new(0),
            derogatory_count: AtomicU32::new(0),
            commendable_count: AtomicU32::new(0),
        }
    }

    pub fn insert_time(&self) -> Time {
        self.insert_time
    }

    /// Time of the last counted hit, or the insert time if never hit.
    pub fn last_hit_time(&self) -> Time {
        self.last_hit_time.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn derogatory_count(&self) -> u32 {
        self.derogatory_count.load(Ordering::Relaxed)
    }

    pub fn commendable_count(&self) -> u32 {
        self.commendable_count.load(Ordering::Relaxed)
    }

    /// Counts a new connection unless `max` is already reached.
    pub fn add_connection(&self, max: u32) -> Result<u32> {
        self.connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| if v < max { Some(v + 1) } else { None })
            .map(|v| v + 1)
            .map_err(|_| Error::Busy)
    }

    pub fn remove_connection(&self) -> u32 {
        match self
            .connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| if v > 0 { Some(v - 1) } else { None })
        {
            Ok(v) => v - 1,
            Err(_) => 0,
        }
    }
}

/// Zeroed caller-private area allocated at the event config's alignment.
struct PrivateData {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the area is uniquely owned; access is serialized by the route's mutex.
unsafe impl Send for PrivateData {}
unsafe impl Sync for PrivateData {}

impl PrivateData {
    fn new(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, align.max(1))
            .map_err(|_| Error::InvalidArg("bad route private data layout"))?;
        let ptr = if size == 0 {
            // Aligned dangling pointer; never read through or freed.
            NonNull::new(layout.align() as *mut u8).ok_or(Error::SysResourceFailed)?
        } else {
            // SAFETY: `layout` has a non-zero size.
            NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(Error::SysResourceFailed)?
        };
        Ok(Self { ptr, layout })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` covers `layout.size()` initialized bytes owned by `self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for PrivateData {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            // SAFETY: allocated in `new` with this same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

pub struct Route {
    header: EntHeader,
    key: RouteKey,
    flags: AtomicU32,
    parent_event: EntId,
    config: EventConfigInternal,
    meta: RouteMeta,
    private_data: Mutex<PrivateData>,
}

impl Route {
    pub(crate) fn new(
        id: EntId,
        key: RouteKey,
        flags: RouteFlags,
        parent_event: EntId,
        config: EventConfigInternal,
        now: Time,
    ) -> Result<Self> {
        let private = PrivateData::new(
            config.config.route_private_data_size,
            config.config.route_private_data_alignment,
        )?;
        Ok(Self {
            header: EntHeader::new(id),
            key,
            flags: AtomicU32::new(flags.bits()),
            parent_event,
            config,
            meta: RouteMeta::new(now),
            private_data: Mutex::new(private),
        })
    }

    pub fn route_key(&self) -> &RouteKey {
        &self.key
    }

    pub fn flags(&self) -> RouteFlags {
        RouteFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Sets and clears state flags in one CAS loop, returning the flags
    /// before and after. Key flags are fixed at insert.
    pub fn update_flags(&self, set: RouteFlags, clear: RouteFlags) -> Result<(RouteFlags, RouteFlags)> {
        if (set | clear).intersects(RouteFlags::KEY_MASK | RouteFlags::IN_TABLE) {
            return Err(Error::InvalidArg("route key flags cannot change"));
        }
        Ok(self.update_flags_unchecked(set, clear))
    }

    fn update_flags_unchecked(&self, set: RouteFlags, clear: RouteFlags) -> (RouteFlags, RouteFlags) {
        let (pre, post) = atomic_update(&self.flags, set.bits(), clear.bits());
        (RouteFlags::from_bits_retain(pre), RouteFlags::from_bits_retain(post))
    }

    /// Id of the event this route was inserted under.
    pub fn parent_event_id(&self) -> Option<EntId> {
        (self.parent_event != ENT_ID_NONE).then_some(self.parent_event)
    }

    /// Effective config: the parent event's override at insert time, else
    /// the context default.
    pub fn config(&self) -> &EventConfigInternal {
        &self.config
    }

    pub fn meta(&self) -> &RouteMeta {
        &self.meta
    }

    pub fn private_data_len(&self) -> usize {
        self.private_data.lock().layout.size()
    }

    /// Runs `f` on the private area, which starts at the configured alignment.
    pub fn with_private_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(self.private_data.lock().as_mut_slice())
    }

    fn count_hit(&self, now: Time) {
        self.header.count_hit();
        self.meta.last_hit_time.store(now, Ordering::Relaxed);
    }
}

impl TableEnt for Route {
    type Key = RouteKey;
    const KIND: ObjectType = ObjectType::Route;

    fn header(&self) -> &EntHeader {
        &self.header
    }

    fn key(&self) -> &RouteKey {
        &self.key
    }

    fn index_ptr(ent: &Arc<Self>) -> IndexedEnt {
        IndexedEnt::Route(Arc::clone(ent))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("key", &self.key)
            .field("flags", &self.flags())
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

pub struct RouteTable {
    kind: RouteTableKind,
    table: Table<Route>,
    default_event: Option<EntRef<Event>>,
    purge_age: Time,
    default_policy: ActionRes,
}

impl RouteTable {
    pub(crate) fn new(kind: RouteTableKind, purge_age: Time, default_policy: ActionRes) -> Self {
        Self {
            kind,
            table: Table::new(kind.as_str(), RouteKey::cmp),
            default_event: None,
            purge_age,
            default_policy,
        }
    }

    pub fn kind(&self) -> RouteTableKind {
        self.kind
    }

    pub fn table(&self) -> &Table<Route> {
        &self.table
    }

    pub fn len(&self) -> u64 {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn default_event(&self) -> Option<&EntRef<Event>> {
        self.default_event.as_ref()
    }

    pub fn purge_age(&self) -> Time {
        self.purge_age
    }

    pub fn default_policy(&self) -> ActionRes {
        self.default_policy
    }

    pub(crate) fn clear(&mut self, by_id: &ByIdIndex) -> usize {
        self.default_event = None;
        self.table.free_ents(by_id)
    }
}

impl Tables {
    pub fn route_table(&self, kind: RouteTableKind) -> &RouteTable {
        match kind {
            RouteTableKind::Static => &self.static_routes,
            RouteTableKind::Dynamic => &self.dynamic_routes,
        }
    }

    fn route_table_mut(&mut self, kind: RouteTableKind) -> (&mut RouteTable, &ByIdIndex) {
        let table = match kind {
            RouteTableKind::Static => &mut self.static_routes,
            RouteTableKind::Dynamic => &mut self.dynamic_routes,
        };
        (table, &self.by_id)
    }

    /// Unlinks exactly `route` from whichever route table holds it.
    pub(crate) fn unlink_route(&mut self, route: &Route) -> Result<EntRef<Route>> {
        let removed = match self.static_routes.table.delete_ent(route, &self.by_id) {
            Err(Error::ItemNotFound) => self.dynamic_routes.table.delete_ent(route, &self.by_id)?,
            other => other?,
        };
        removed.update_flags_unchecked(RouteFlags::empty(), RouteFlags::IN_TABLE);
        Ok(removed)
    }
}

impl Context {
    /// Inserts a route into the `kind` table under the optional parent event.
    pub fn route_insert(
        &self,
        kind: RouteTableKind,
        spec: &RouteSpec,
        parent_event: Option<&str>,
    ) -> Result<EntId> {
        let key = spec.to_key()?;
        let parent_label = parent_event.map(Label::new).transpose()?;
        let mut tables = self.tables.write();
        let (parent_id, config) = match &parent_label {
            Some(label) => {
                let parent = tables.events.get(label)?;
                (parent.id(), parent.config().copied().unwrap_or(self.config))
            }
            None => (ENT_ID_NONE, self.config),
        };
        let id = self.ids.make_id(ObjectType::Route)?;
        let route = EntRef::adopt(Route::new(id, key, spec.flags, parent_id, config, self.clock.now())?);
        let ptr = Arc::clone(route.arc());
        let (table, by_id) = tables.route_table_mut(kind);
        table.table.insert(route, true, by_id)?;
        ptr.update_flags_unchecked(RouteFlags::IN_TABLE, RouteFlags::empty());
        info!("[ROUTE_INSERT] table={} id={} parent={}", kind.as_str(), id, parent_id);
        counter!("sentinel_routes_inserted_total").increment(1);
        Ok(id)
    }

    pub fn route_delete(&self, kind: RouteTableKind, spec: &RouteSpec) -> Result<RefDrop> {
        let key = spec.to_key()?;
        let route = {
            let mut tables = self.tables.write();
            let (table, by_id) = tables.route_table_mut(kind);
            table.table.delete(&key, by_id)?
        };
        route.update_flags_unchecked(RouteFlags::empty(), RouteFlags::IN_TABLE);
        let id = route.id();
        let outcome = route.drop_reference();
        info!("[ROUTE_DELETE] table={} id={} released={}", kind.as_str(), id, outcome.released());
        Ok(outcome)
    }

    pub fn route_get_reference(&self, kind: RouteTableKind, spec: &RouteSpec) -> Result<EntRef<Route>> {
        let key = spec.to_key()?;
        self.tables.read().route_table(kind).table.get_reference(&key)
    }

    pub fn route_drop_reference(&self, route: EntRef<Route>) -> RefDrop {
        route.drop_reference()
    }

    pub fn route_count(&self, kind: RouteTableKind) -> u64 {
        self.tables.read().route_table(kind).len()
    }

    pub fn route_table_default_event_set(&self, kind: RouteTableKind, label: impl AsRef<[u8]>) -> Result<()> {
        let label = Label::new(label)?;
        let mut tables = self.tables.write();
        let event = tables.events.get_reference(&label)?;
        let (table, _) = tables.route_table_mut(kind);
        // Any previous default is dropped here.
        table.default_event = Some(event);
        debug!("[ROUTE_TABLE] {} default event {}", kind.as_str(), label);
        Ok(())
    }

    pub fn route_table_default_event_clear(&self, kind: RouteTableKind) -> Result<()> {
        let mut tables = self.tables.write();
        let (table, _) = tables.route_table_mut(kind);
        table.default_event.take().ok_or(Error::ItemNotFound)?;
        Ok(())
    }

    pub fn route_table_set_purge_age(&self, kind: RouteTableKind, purge_age: Time) -> Result<()> {
        if purge_age < 0 {
            return Err(Error::InvalidArg("negative purge age"));
        }
        self.tables.write().route_table_mut(kind).0.purge_age = purge_age;
        Ok(())
    }

    pub fn route_table_set_default_policy(&self, kind: RouteTableKind, policy: ActionRes) {
        self.tables.write().route_table_mut(kind).0.default_policy = policy;
    }

    /// Drops every route whose last hit is at least the table's purge age
    /// old. A purge age of 0 disables purging. Returns the number purged.
    pub fn route_purge(&self, kind: RouteTableKind, now: Time) -> Result<usize> {
        let mut tables = self.tables.write();
        let (table, by_id) = tables.route_table_mut(kind);
        let age = table.purge_age;
        if age == 0 {
            return Ok(0);
        }
        let clock = &self.clock;
        let purged = table.table.filter(
            by_id,
            |r| Ok(clock.diff(now, r.meta.last_hit_time()) >= age),
            |r| {
                r.update_flags_unchecked(RouteFlags::empty(), RouteFlags::IN_TABLE);
                trace!("[ROUTE_PURGE] id={}", r.id());
                Ok(())
            },
        )?;
        if purged > 0 {
            info!("[ROUTE_PURGE] table={} purged={}", kind.as_str(), purged);
            counter!("sentinel_routes_purged_total").increment(purged as u64);
        }
        Ok(purged)
    }

    /// Dispatches a matched route.
    ///
    /// Resolves the trigger event when given, else the route's parent event,
    /// else the table's default event, then counts the route hit (unless
    /// `DONT_COUNT_HITS`). An unknown trigger fails before anything is
    /// counted. If no event resolves, the table's default policy is merged
    /// into `results`.
    pub fn route_dispatch(
        &self,
        kind: RouteTableKind,
        route: &Route,
        trigger_event: Option<&str>,
        caller_arg: Option<CallerArg<'_>>,
        results: &mut ActionRes,
    ) -> Result<()> {
        if results.contains(ActionRes::STOP) {
            return Err(Error::AlreadyStopped);
        }
        let trigger = trigger_event.map(Label::new).transpose()?;
        let tables = self.tables.read();
        let table = tables.route_table(kind);
        let event: Option<Arc<Event>> = match &trigger {
            Some(label) => Some(Arc::clone(tables.events.get(label)?.arc())),
            None => route
                .parent_event_id()
                .and_then(|id| tables.event_by_id(id))
                .or_else(|| table.default_event.as_ref().map(|e| Arc::clone(e.arc()))),
        };
        if !route.flags().contains(RouteFlags::DONT_COUNT_HITS) {
            route.count_hit(self.clock.now());
        }
        let Some(event) = event else {
            debug!("[ROUTE_DISPATCH] id={} no event, default policy {:?}", route.header.id(), table.default_policy);
            *results |= table.default_policy;
            return Ok(());
        };
        let list = event.action_list().read();
        let outcome = dispatch(&tables, &list, caller_arg, Some(&*event), Some(table), Some(route), results);
        if results.contains(ActionRes::DEROGATORY) {
            route.meta.derogatory_count.fetch_add(1, Ordering::Relaxed);
        }
        if results.contains(ActionRes::COMMENDABLE) {
            route.meta.commendable_count.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }
}
