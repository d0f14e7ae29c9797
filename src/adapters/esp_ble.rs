//! BLE central adapter.
//!
//! Implements [`BleCentral`].  Radio callbacks never call into the
//! domain: they post [`TransportEvent`]s and [`Notification`]s to the
//! channels in [`crate::runtime::channels`].
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: Bluedroid GATT client via `esp_idf_svc::sys`.
//! - **all targets**: [`SimCentral`], an in-memory fleet of peripherals
//!   for host-side simulation and tests.

use heapless::Vec;
use log::{debug, info, warn};

use crate::app::events::{Advertisement, MAX_ADV_UUIDS, Notification, NotifySource, TransportEvent};
use crate::app::ports::{BleCentral, MAX_ATTR_LEN};
use crate::config::{BleUuid, GattProfile};
use crate::error::TransportError;
use crate::registry::{DeviceId, LinkHandle};
use crate::runtime::channels::{post_event, post_notification};

#[cfg(target_os = "espidf")]
pub use bluedroid::BluedroidCentral;

// ───────────────────────────────────────────────────────────────
// Advertising data
// ───────────────────────────────────────────────────────────────

const AD_UUID16_INCOMPLETE: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID128_INCOMPLETE: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;

/// Collect the service UUIDs from raw advertising + scan response data.
/// Malformed structures end the walk; what was parsed so far is kept.
pub fn parse_adv_uuids(data: &[u8]) -> Vec<BleUuid, MAX_ADV_UUIDS> {
    let mut out = Vec::new();
    let mut rest = data;
    while let [len, tail @ ..] = rest {
        let len = usize::from(*len);
        if len == 0 || len > tail.len() {
            break;
        }
        let (ad_type, body) = (tail[0], &tail[1..len]);
        match ad_type {
            AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => {
                for chunk in body.chunks_exact(2) {
                    let _ = out.push(BleUuid::U16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => {
                for chunk in body.chunks_exact(16) {
                    let mut be = [0u8; 16];
                    be.copy_from_slice(chunk);
                    be.reverse();
                    let _ = out.push(BleUuid::U128(be));
                }
            }
            _ => {}
        }
        rest = &tail[len..];
    }
    out
}

// ───────────────────────────────────────────────────────────────
// Simulation
// ───────────────────────────────────────────────────────────────

/// One simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub addr: [u8; 6],
    pub advertised: Vec<BleUuid, MAX_ADV_UUIDS>,
    pub services: Vec<BleUuid, 4>,
    pub config_word: u32,
    pub version_word: u32,
    pub battery: u8,
    pub accepts_auth: bool,
    /// Every value written to the config characteristic.
    pub writes: std::vec::Vec<[u8; 4]>,
}

impl SimPeripheral {
    /// A collector-profile peripheral advertising its service.
    pub fn collector(addr: [u8; 6], profile: &GattProfile) -> Self {
        let mut advertised = Vec::new();
        let _ = advertised.push(profile.service);
        let mut services = Vec::new();
        let _ = services.push(profile.service);
        Self {
            addr,
            advertised,
            services,
            config_word: 0,
            version_word: 0,
            battery: 100,
            accepts_auth: true,
            writes: std::vec::Vec::new(),
        }
    }
}

/// In-memory central.  Events are posted to the runtime channels just
/// as the radio callbacks would post them.
pub struct SimCentral {
    profile: GattProfile,
    peripherals: std::vec::Vec<SimPeripheral>,
    links: std::vec::Vec<(LinkHandle, usize)>,
    subscriptions: std::vec::Vec<(LinkHandle, NotifySource)>,
    next_handle: u16,
    scanning: bool,
    notify_depth: usize,
}

impl SimCentral {
    pub fn new(profile: GattProfile, notify_depth: usize) -> Self {
        Self {
            profile,
            peripherals: std::vec::Vec::new(),
            links: std::vec::Vec::new(),
            subscriptions: std::vec::Vec::new(),
            next_handle: 1,
            scanning: false,
            notify_depth,
        }
    }

    pub fn add(&mut self, peripheral: SimPeripheral) {
        self.peripherals.push(peripheral);
    }

    pub fn peripheral(&self, addr: [u8; 6]) -> Option<&SimPeripheral> {
        self.peripherals.iter().find(|p| p.addr == addr)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn linked(&mut self, handle: LinkHandle) -> Result<&mut SimPeripheral, TransportError> {
        let (_, index) = self
            .links
            .iter()
            .find(|(h, _)| *h == handle)
            .copied()
            .ok_or(TransportError::Disconnected)?;
        self.peripherals
            .get_mut(index)
            .ok_or(TransportError::Disconnected)
    }

    /// Push a value from `addr` as if the peripheral had notified it.
    pub fn notify(&mut self, addr: [u8; 6], source: NotifySource, bytes: &[u8]) -> bool {
        let Some(index) = self.peripherals.iter().position(|p| p.addr == addr) else {
            return false;
        };
        let Some(&(handle, _)) = self.links.iter().find(|(_, i)| *i == index) else {
            return false;
        };
        if !self.subscriptions.contains(&(handle, source)) {
            debug!("sim: {handle:?} not subscribed to {source:?}");
            return false;
        }
        let Ok(bytes) = Vec::from_slice(bytes) else {
            return false;
        };
        post_notification(Notification { handle, source, bytes }, self.notify_depth)
    }

    /// Drop a link from the peripheral side.
    pub fn drop_link(&mut self, addr: [u8; 6]) {
        let Some(index) = self.peripherals.iter().position(|p| p.addr == addr) else {
            return;
        };
        if let Some(pos) = self.links.iter().position(|(_, i)| *i == index) {
            let (handle, _) = self.links.remove(pos);
            self.subscriptions.retain(|(h, _)| *h != handle);
            post_event(TransportEvent::Disconnected { handle });
        }
    }
}

impl BleCentral for SimCentral {
    fn scan_start(&mut self) -> Result<(), TransportError> {
        if self.scanning {
            return Err(TransportError::ScanFailed);
        }
        self.scanning = true;
        info!("BLE(sim): scanning, {} peripherals in range", self.peripherals.len());
        for p in &self.peripherals {
            post_event(TransportEvent::Advertised(Advertisement {
                addr: p.addr,
                uuids: p.advertised.clone(),
            }));
        }
        Ok(())
    }

    fn scan_stop(&mut self) {
        if self.scanning {
            self.scanning = false;
            post_event(TransportEvent::ScanComplete);
        }
    }

    fn connect(&mut self, id: &DeviceId) -> Result<LinkHandle, TransportError> {
        let addr = id.to_addr();
        let index = self
            .peripherals
            .iter()
            .position(|p| p.addr == addr)
            .ok_or(TransportError::ConnectFailed)?;
        let handle = LinkHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.links.push((handle, index));
        post_event(TransportEvent::Authenticated {
            handle,
            ok: self.peripherals[index].accepts_auth,
        });
        Ok(handle)
    }

    fn has_service(&mut self, handle: LinkHandle, service: BleUuid) -> bool {
        self.linked(handle).is_ok_and(|p| p.services.contains(&service))
    }

    fn read(
        &mut self,
        handle: LinkHandle,
        _service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<Vec<u8, MAX_ATTR_LEN>, TransportError> {
        let profile = self.profile;
        let p = self.linked(handle)?;
        let value = if characteristic == profile.config {
            Vec::from_slice(&p.config_word.to_le_bytes())
        } else if characteristic == profile.version {
            Vec::from_slice(&p.version_word.to_le_bytes())
        } else if characteristic == BleUuid::BATTERY_LEVEL {
            Vec::from_slice(&[p.battery])
        } else {
            return Err(TransportError::MissingCharacteristic);
        };
        value.map_err(|_| TransportError::ReadFailed)
    }

    fn write(
        &mut self,
        handle: LinkHandle,
        _service: BleUuid,
        characteristic: BleUuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let profile = self.profile;
        let p = self.linked(handle)?;
        if characteristic != profile.config {
            return Err(TransportError::MissingCharacteristic);
        }
        let word: [u8; 4] = data.try_into().map_err(|_| TransportError::WriteFailed)?;
        p.writes.push(word);
        if word[..2] != [0xff, 0xff] {
            p.config_word = u32::from_le_bytes(word);
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        handle: LinkHandle,
        _service: BleUuid,
        _characteristic: BleUuid,
        source: NotifySource,
    ) -> Result<(), TransportError> {
        self.linked(handle)?;
        if !self.subscriptions.contains(&(handle, source)) {
            self.subscriptions.push((handle, source));
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: LinkHandle) -> Result<(), TransportError> {
        let pos = self
            .links
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(TransportError::Disconnected)?;
        self.links.remove(pos);
        self.subscriptions.retain(|(h, _)| *h != handle);
        post_event(TransportEvent::Disconnected { handle });
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Bluedroid GATT client (target)
// ───────────────────────────────────────────────────────────────
//
// Bluedroid callbacks are C function pointers that cannot capture Rust
// closures.  Statics bridge the callback context to the adapter: one
// request/response slot guarded by a Mutex + Condvar for the blocking
// GATT operations, and a peer table for routing notifications.

#[cfg(target_os = "espidf")]
mod bluedroid {
    use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use esp_idf_svc::sys::*;
    use log::error;

    use super::*;
    use crate::registry::MAX_DEVICES;

    const OP_TIMEOUT: Duration = Duration::from_secs(5);
    const SCAN_WINDOW_SECS: u32 = 5;
    const CCCD: u16 = 0x2902;

    static GATTC_IF: AtomicU8 = AtomicU8::new(ESP_GATT_IF_NONE as u8);
    static NOTIFY_DEPTH: AtomicUsize = AtomicUsize::new(1);

    #[derive(Clone)]
    struct Pending {
        done: bool,
        status: u32,
        conn_id: u16,
        range: Option<(u16, u16)>,
        data: Vec<u8, MAX_ATTR_LEN>,
    }

    impl Pending {
        const EMPTY: Self = Self {
            done: false,
            status: 0,
            conn_id: 0,
            range: None,
            data: Vec::new(),
        };
    }

    struct Peer {
        conn_id: u16,
        addr: [u8; 6],
        notify: Vec<(u16, NotifySource), 2>,
    }

    static PENDING: Mutex<Pending> = Mutex::new(Pending::EMPTY);
    static PENDING_CV: Condvar = Condvar::new();
    static PEERS: Mutex<Vec<Peer, MAX_DEVICES>> = Mutex::new(Vec::new());

    fn pending() -> MutexGuard<'static, Pending> {
        PENDING.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers() -> MutexGuard<'static, Vec<Peer, MAX_DEVICES>> {
        PEERS.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_op() {
        *pending() = Pending::EMPTY;
    }

    fn complete(f: impl FnOnce(&mut Pending)) {
        let mut p = pending();
        f(&mut p);
        p.done = true;
        PENDING_CV.notify_all();
    }

    fn wait_op() -> Result<Pending, TransportError> {
        let (guard, timeout) = PENDING_CV
            .wait_timeout_while(pending(), OP_TIMEOUT, |p| !p.done)
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() {
            return Err(TransportError::Timeout);
        }
        Ok(guard.clone())
    }

    fn gattc_if() -> esp_gatt_if_t {
        GATTC_IF.load(Ordering::Relaxed) as esp_gatt_if_t
    }

    fn to_esp_uuid(uuid: BleUuid) -> esp_bt_uuid_t {
        let mut t: esp_bt_uuid_t = unsafe { core::mem::zeroed() };
        match uuid {
            BleUuid::None => {}
            BleUuid::U16(v) => {
                t.len = 2;
                t.uuid.uuid16 = v;
            }
            BleUuid::U128(be) => {
                let mut le = be;
                le.reverse();
                t.len = 16;
                t.uuid.uuid128 = le;
            }
        }
        t
    }

    // ── Callbacks ────────────────────────────────────────────

    unsafe extern "C" fn gap_event_handler(event: esp_gap_ble_cb_event_t, param: *mut esp_ble_gap_cb_param_t) {
        match event {
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RESULT_EVT => {
                let r = unsafe { &(*param).scan_rst };
                if r.search_evt == esp_gap_search_evt_t_ESP_GAP_SEARCH_INQ_RES_EVT {
                    let len = usize::from(r.adv_data_len) + usize::from(r.scan_rsp_len);
                    let raw = &r.ble_adv[..len.min(r.ble_adv.len())];
                    post_event(TransportEvent::Advertised(Advertisement {
                        addr: r.bda,
                        uuids: parse_adv_uuids(raw),
                    }));
                } else if r.search_evt == esp_gap_search_evt_t_ESP_GAP_SEARCH_INQ_CMPL_EVT {
                    post_event(TransportEvent::ScanComplete);
                }
            }
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_SEC_REQ_EVT => unsafe {
                esp_ble_gap_security_rsp((*param).ble_security.ble_req.bd_addr.as_mut_ptr(), true);
            },
            esp_gap_ble_cb_event_t_ESP_GAP_BLE_AUTH_CMPL_EVT => {
                let p = unsafe { &(*param).ble_security.auth_cmpl };
                let conn = peers().iter().find(|peer| peer.addr == p.bd_addr).map(|peer| peer.conn_id);
                match conn {
                    Some(conn_id) => {
                        post_event(TransportEvent::Authenticated {
                            handle: LinkHandle(conn_id),
                            ok: p.success,
                        });
                    }
                    None => warn!("BLE GAP: auth result for unknown peer"),
                }
            }
            _ => {}
        }
    }

    unsafe extern "C" fn gattc_event_handler(
        event: esp_gattc_cb_event_t,
        gattc_if: esp_gatt_if_t,
        param: *mut esp_ble_gattc_cb_param_t,
    ) {
        match event {
            esp_gattc_cb_event_t_ESP_GATTC_REG_EVT => {
                GATTC_IF.store(gattc_if as u8, Ordering::Relaxed);
                info!("BLE GATTC: app registered (if={gattc_if})");
            }
            esp_gattc_cb_event_t_ESP_GATTC_OPEN_EVT => {
                let p = unsafe { &(*param).open };
                if p.status == esp_gatt_status_t_ESP_GATT_OK {
                    let _ = peers().push(Peer {
                        conn_id: p.conn_id,
                        addr: p.remote_bda,
                        notify: Vec::new(),
                    });
                    let mut bda = p.remote_bda;
                    unsafe {
                        esp_ble_set_encryption(bda.as_mut_ptr(), esp_ble_sec_act_t_ESP_BLE_SEC_ENCRYPT);
                    }
                }
                complete(|op| {
                    op.status = p.status;
                    op.conn_id = p.conn_id;
                });
            }
            esp_gattc_cb_event_t_ESP_GATTC_DISCONNECT_EVT => {
                let p = unsafe { &(*param).disconnect };
                peers().retain(|peer| peer.conn_id != p.conn_id);
                post_event(TransportEvent::Disconnected {
                    handle: LinkHandle(p.conn_id),
                });
            }
            esp_gattc_cb_event_t_ESP_GATTC_SEARCH_RES_EVT => {
                let p = unsafe { &(*param).search_res };
                pending().range = Some((p.start_handle, p.end_handle));
            }
            esp_gattc_cb_event_t_ESP_GATTC_SEARCH_CMPL_EVT => {
                let p = unsafe { &(*param).search_cmpl };
                complete(|op| op.status = p.status);
            }
            esp_gattc_cb_event_t_ESP_GATTC_READ_CHAR_EVT => {
                let p = unsafe { &(*param).read };
                let value = if p.value.is_null() {
                    &[][..]
                } else {
                    unsafe { core::slice::from_raw_parts(p.value, usize::from(p.value_len)) }
                };
                complete(|op| {
                    op.status = p.status;
                    let _ = op.data.extend_from_slice(&value[..value.len().min(MAX_ATTR_LEN)]);
                });
            }
            esp_gattc_cb_event_t_ESP_GATTC_WRITE_CHAR_EVT | esp_gattc_cb_event_t_ESP_GATTC_WRITE_DESCR_EVT => {
                let p = unsafe { &(*param).write };
                complete(|op| op.status = p.status);
            }
            esp_gattc_cb_event_t_ESP_GATTC_REG_FOR_NOTIFY_EVT => {
                let p = unsafe { &(*param).reg_for_notify };
                complete(|op| op.status = p.status);
            }
            esp_gattc_cb_event_t_ESP_GATTC_NOTIFY_EVT => {
                let p = unsafe { &(*param).notify };
                let source = peers()
                    .iter()
                    .find(|peer| peer.conn_id == p.conn_id)
                    .and_then(|peer| peer.notify.iter().find(|(h, _)| *h == p.handle).map(|(_, s)| *s));
                let Some(source) = source else {
                    return;
                };
                let value = unsafe { core::slice::from_raw_parts(p.value, usize::from(p.value_len)) };
                if let Ok(bytes) = Vec::from_slice(value) {
                    post_notification(
                        Notification {
                            handle: LinkHandle(p.conn_id),
                            source,
                            bytes,
                        },
                        NOTIFY_DEPTH.load(Ordering::Relaxed),
                    );
                } else {
                    warn!("BLE GATTC: oversized notification ({} bytes)", value.len());
                }
            }
            _ => {}
        }
    }

    // ── Adapter ──────────────────────────────────────────────

    pub struct BluedroidCentral {
        services: Vec<(LinkHandle, BleUuid, (u16, u16)), 16>,
    }

    fn check(ret: esp_err_t, what: &str, err: TransportError) -> Result<(), TransportError> {
        if ret == ESP_OK as esp_err_t {
            Ok(())
        } else {
            error!("BLE: {what} failed ({ret})");
            Err(err)
        }
    }

    fn check_status(op: &Pending, err: TransportError) -> Result<(), TransportError> {
        if op.status == esp_gatt_status_t_ESP_GATT_OK {
            Ok(())
        } else {
            Err(err)
        }
    }

    impl BluedroidCentral {
        /// Bring up the controller in BLE-only mode and register the
        /// GATT client.
        pub fn new(notify_depth: usize) -> Result<Self, TransportError> {
            NOTIFY_DEPTH.store(notify_depth, Ordering::Relaxed);
            let init = TransportError::ScanFailed;
            unsafe {
                esp_bt_controller_mem_release(esp_bt_mode_t_ESP_BT_MODE_CLASSIC_BT);
                let mut bt_cfg = esp_bt_controller_config_t::default();
                check(esp_bt_controller_init(&mut bt_cfg), "bt_controller_init", init)?;
                check(esp_bt_controller_enable(esp_bt_mode_t_ESP_BT_MODE_BLE), "bt_controller_enable", init)?;
                check(esp_bluedroid_init(), "bluedroid_init", init)?;
                check(esp_bluedroid_enable(), "bluedroid_enable", init)?;
                check(esp_ble_gap_register_callback(Some(gap_event_handler)), "gap_register", init)?;
                check(esp_ble_gattc_register_callback(Some(gattc_event_handler)), "gattc_register", init)?;
                check(esp_ble_gattc_app_register(0), "gattc_app_register", init)?;

                let auth_req = esp_ble_auth_req_t_ESP_LE_AUTH_REQ_SC_BOND;
                let iocap = esp_ble_io_cap_t_ESP_IO_CAP_NONE;
                esp_ble_gap_set_security_param(
                    esp_ble_sm_param_t_ESP_BLE_SM_AUTHEN_REQ_MODE,
                    &auth_req as *const _ as *mut _,
                    core::mem::size_of_val(&auth_req) as u32,
                );
                esp_ble_gap_set_security_param(
                    esp_ble_sm_param_t_ESP_BLE_SM_IOCAP_MODE,
                    &iocap as *const _ as *mut _,
                    core::mem::size_of_val(&iocap) as u32,
                );

                let mut scan_params = esp_ble_scan_params_t {
                    scan_type: esp_ble_scan_type_t_BLE_SCAN_TYPE_ACTIVE,
                    own_addr_type: esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
                    scan_filter_policy: esp_ble_scan_filter_t_BLE_SCAN_FILTER_ALLOW_ALL,
                    scan_interval: 0x50,
                    scan_window: 0x30,
                    scan_duplicate: esp_ble_scan_duplicate_t_BLE_SCAN_DUPLICATE_DISABLE,
                };
                check(esp_ble_gap_set_scan_params(&mut scan_params), "set_scan_params", init)?;
            }
            info!("BLE(espidf): GATT client ready");
            Ok(Self { services: Vec::new() })
        }

        fn service_range(&mut self, handle: LinkHandle, service: BleUuid) -> Result<(u16, u16), TransportError> {
            if let Some((_, _, range)) = self.services.iter().find(|(h, s, _)| *h == handle && *s == service) {
                return Ok(*range);
            }
            begin_op();
            let mut uuid = to_esp_uuid(service);
            check(
                unsafe { esp_ble_gattc_search_service(gattc_if(), handle.0, &mut uuid) },
                "search_service",
                TransportError::MissingService,
            )?;
            let op = wait_op()?;
            let range = op.range.ok_or(TransportError::MissingService)?;
            let _ = self.services.push((handle, service, range));
            Ok(range)
        }

        fn char_handle(&mut self, handle: LinkHandle, service: BleUuid, characteristic: BleUuid) -> Result<u16, TransportError> {
            let (start, end) = self.service_range(handle, service)?;
            let mut result: esp_gattc_char_elem_t = unsafe { core::mem::zeroed() };
            let mut count: u16 = 1;
            let ret = unsafe {
                esp_ble_gattc_get_char_by_uuid(
                    gattc_if(),
                    handle.0,
                    start,
                    end,
                    to_esp_uuid(characteristic),
                    &mut result,
                    &mut count,
                )
            };
            if ret != esp_gatt_status_t_ESP_GATT_OK || count == 0 {
                return Err(TransportError::MissingCharacteristic);
            }
            Ok(result.char_handle)
        }

        fn peer_addr(handle: LinkHandle) -> Option<[u8; 6]> {
            peers().iter().find(|p| p.conn_id == handle.0).map(|p| p.addr)
        }
    }

    impl BleCentral for BluedroidCentral {
        fn scan_start(&mut self) -> Result<(), TransportError> {
            check(
                unsafe { esp_ble_gap_start_scanning(SCAN_WINDOW_SECS) },
                "start_scanning",
                TransportError::ScanFailed,
            )
        }

        fn scan_stop(&mut self) {
            unsafe {
                esp_ble_gap_stop_scanning();
            }
            post_event(TransportEvent::ScanComplete);
        }

        fn connect(&mut self, id: &DeviceId) -> Result<LinkHandle, TransportError> {
            let mut addr = id.to_addr();
            begin_op();
            check(
                unsafe {
                    esp_ble_gattc_open(
                        gattc_if(),
                        addr.as_mut_ptr(),
                        esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
                        true,
                    )
                },
                "gattc_open",
                TransportError::ConnectFailed,
            )?;
            let op = wait_op()?;
            check_status(&op, TransportError::ConnectFailed)?;
            Ok(LinkHandle(op.conn_id))
        }

        fn has_service(&mut self, handle: LinkHandle, service: BleUuid) -> bool {
            !service.is_none() && self.service_range(handle, service).is_ok()
        }

        fn read(
            &mut self,
            handle: LinkHandle,
            service: BleUuid,
            characteristic: BleUuid,
        ) -> Result<Vec<u8, MAX_ATTR_LEN>, TransportError> {
            let chr = self.char_handle(handle, service, characteristic)?;
            begin_op();
            check(
                unsafe { esp_ble_gattc_read_char(gattc_if(), handle.0, chr, esp_gatt_auth_req_t_ESP_GATT_AUTH_REQ_NONE) },
                "read_char",
                TransportError::ReadFailed,
            )?;
            let op = wait_op()?;
            check_status(&op, TransportError::ReadFailed)?;
            Ok(op.data)
        }

        fn write(
            &mut self,
            handle: LinkHandle,
            service: BleUuid,
            characteristic: BleUuid,
            data: &[u8],
        ) -> Result<(), TransportError> {
            let chr = self.char_handle(handle, service, characteristic)?;
            let mut buf: Vec<u8, MAX_ATTR_LEN> = Vec::from_slice(data).map_err(|_| TransportError::WriteFailed)?;
            begin_op();
            check(
                unsafe {
                    esp_ble_gattc_write_char(
                        gattc_if(),
                        handle.0,
                        chr,
                        buf.len() as u16,
                        buf.as_mut_ptr(),
                        esp_gatt_write_type_t_ESP_GATT_WRITE_TYPE_RSP,
                        esp_gatt_auth_req_t_ESP_GATT_AUTH_REQ_NONE,
                    )
                },
                "write_char",
                TransportError::WriteFailed,
            )?;
            let op = wait_op()?;
            check_status(&op, TransportError::WriteFailed)
        }

        fn subscribe(
            &mut self,
            handle: LinkHandle,
            service: BleUuid,
            characteristic: BleUuid,
            source: NotifySource,
        ) -> Result<(), TransportError> {
            let chr = self.char_handle(handle, service, characteristic)?;
            let mut addr = Self::peer_addr(handle).ok_or(TransportError::Disconnected)?;

            begin_op();
            check(
                unsafe { esp_ble_gattc_register_for_notify(gattc_if(), addr.as_mut_ptr(), chr) },
                "register_for_notify",
                TransportError::NotifyUnsupported,
            )?;
            check_status(&wait_op()?, TransportError::NotifyUnsupported)?;

            let mut descr: esp_gattc_descr_elem_t = unsafe { core::mem::zeroed() };
            let mut count: u16 = 1;
            let ret = unsafe {
                esp_ble_gattc_get_descr_by_char_handle(
                    gattc_if(),
                    handle.0,
                    chr,
                    to_esp_uuid(BleUuid::U16(CCCD)),
                    &mut descr,
                    &mut count,
                )
            };
            if ret != esp_gatt_status_t_ESP_GATT_OK || count == 0 {
                return Err(TransportError::NotifyUnsupported);
            }
            let mut enable = [0x01u8, 0x00];
            begin_op();
            check(
                unsafe {
                    esp_ble_gattc_write_char_descr(
                        gattc_if(),
                        handle.0,
                        descr.handle,
                        enable.len() as u16,
                        enable.as_mut_ptr(),
                        esp_gatt_write_type_t_ESP_GATT_WRITE_TYPE_RSP,
                        esp_gatt_auth_req_t_ESP_GATT_AUTH_REQ_NONE,
                    )
                },
                "write_cccd",
                TransportError::NotifyUnsupported,
            )?;
            check_status(&wait_op()?, TransportError::NotifyUnsupported)?;

            if let Some(peer) = peers().iter_mut().find(|p| p.conn_id == handle.0) {
                let _ = peer.notify.push((chr, source));
            }
            debug!("BLE GATTC: {handle:?} subscribed ({source:?})");
            Ok(())
        }

        fn disconnect(&mut self, handle: LinkHandle) -> Result<(), TransportError> {
            self.services.retain(|(h, _, _)| *h != handle);
            check(
                unsafe { esp_ble_gattc_close(gattc_if(), handle.0) },
                "gattc_close",
                TransportError::Disconnected,
            )
        }
    }
}
