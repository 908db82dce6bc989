//! Session lifecycle: connect, supervise, reconnect.
//!
//! A [`Session`] owns one logical link to a controller plus every
//! [`ValueHandle`] created through it. Runtime failures surface on the
//! session's event stream rather than as `Result`s from accessors; the
//! accessors return the `Empty`/zeroed sentinel instead so polling UIs and
//! data recorders never have to unwind.
//!
//! All mutable session state sits behind a single async mutex. The transport
//! reader never takes that mutex; pushed notifications arrive through the
//! registry on a dedicated dispatcher task, so a foreground request can await
//! its response while holding the lock without deadlocking the stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::envelope::{
    NotificationSample, IDXGRP_DEVICE_DATA, IDXOFFS_DEVDATA_ADSSTATE, TRANSMODE_SERVERONCHA,
};
use crate::error::AdsError;
use crate::model::symbol::{AdsState, AmsAddr};
use crate::model::value::PlcValue;
use crate::registry;
use crate::transport::{Connect, NotifyAttributes, Router, TcpConnect};
use crate::value::{NotifyMode, ValueHandle, ValueOptions, ValueShared};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle and error events published by a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The link came up (`true`) or went down (`false`).
    ConnectionChanged(bool),
    /// A runtime error, already rendered for display/logging.
    Error(String),
}

/// Configures and builds a [`Session`]. Building performs no I/O; call
/// [`Session::open`] to dial.
pub struct SessionBuilder {
    address: String,
    timeout: Duration,
    reconnect_interval: Duration,
    route: Option<SocketAddr>,
    source: Option<AmsAddr>,
    connector: Option<Box<dyn Connect>>,
}

impl SessionBuilder {
    /// Starts a builder for the controller at `address`, given in the
    /// `"b0.b1.b2.b3.b4.b5:port"` AMS form.
    pub fn new(address: impl Into<String>) -> Self {
        SessionBuilder {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            route: None,
            source: None,
            connector: None,
        }
    }

    /// Per-request timeout (default 5 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause between automatic reconnection attempts (default 5 s).
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Overrides the TCP route; by default the host is derived from the
    /// first four NetId bytes and the standard ADS router port.
    pub fn route(mut self, route: SocketAddr) -> Self {
        self.route = Some(route);
        self
    }

    /// Overrides the source AMS address announced to the controller.
    pub fn source(mut self, source: AmsAddr) -> Self {
        self.source = Some(source);
        self
    }

    #[cfg(test)]
    fn connector(mut self, connector: Box<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the session and registers it for notification routing.
    pub fn build(self) -> Session {
        let connector = self.connector.unwrap_or_else(|| {
            Box::new(TcpConnect {
                timeout: self.timeout,
                route: self.route,
                source: self.source,
            })
        });

        let (events, _) = broadcast::channel(64);
        let id = registry::allocate_id();
        let shared = Arc::new(SessionShared {
            id,
            address: self.address,
            reconnect_interval: self.reconnect_interval,
            connector,
            events,
            connected: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                target: None,
                router: None,
                epoch: 0,
                state_handle: 0,
                reconnect_armed: false,
                values: HashMap::new(),
            }),
        });
        registry::register(id, Arc::downgrade(&shared));
        Session { shared }
    }
}

/// Async client session for one controller.
///
/// Clones are cheap and share the link, the value handles and the event
/// stream. Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Shorthand for [`SessionBuilder::new`].
    pub fn builder(address: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(address)
    }

    /// The configured controller address string.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Whether the link is currently up and the controller in `Run`.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Subscribes to lifecycle and error events. Only events published after
    /// the call are observed.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Validates the configured address and dials the controller. A
    /// malformed address is reported as a single configuration error and no
    /// reconnection is scheduled; any dial failure arms the reconnect timer.
    pub async fn open(&self) {
        match self.shared.address.parse::<AmsAddr>() {
            Ok(target) => {
                {
                    let mut state = self.shared.state.lock().await;
                    state.target = Some(target);
                }
                self.shared.connect_now().await;
            }
            Err(err) => self.shared.report(err),
        }
    }

    /// Dials the controller if not already connected and reports whether the
    /// link is up afterwards. Idempotent while connected; failures additionally
    /// surface as events and arm the reconnect timer.
    pub async fn connect(&self) -> bool {
        self.shared.connect_now().await;
        self.is_connected()
    }

    /// Closes the link and discards every owned value handle, releasing the
    /// server-side resources; cancels any pending reconnection. Outstanding
    /// [`ValueHandle`]s go `Empty` for good; ask for new ones after the next
    /// connect. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.shared.shutdown().await;
    }

    /// Returns the handle for symbol `name` with default options, creating
    /// it on first use. Repeated calls for the same name share one handle.
    pub async fn value(&self, name: &str) -> ValueHandle {
        self.value_with(name, ValueOptions::default()).await
    }

    /// As [`value`](Session::value), with explicit per-symbol options.
    /// Options only take effect when the handle is first created.
    pub async fn value_with(&self, name: &str, options: ValueOptions) -> ValueHandle {
        let shared = {
            let mut state = self.shared.state.lock().await;
            if let Some(existing) = state.values.get(name) {
                existing.clone()
            } else {
                let value = ValueShared::new(name, options);
                state.values.insert(name.to_string(), value.clone());
                if let Some(router) = state.router.as_deref() {
                    if let Err(err) = value.attach(router).await {
                        self.shared.report(err);
                    }
                }
                value
            }
        };
        ValueHandle {
            shared,
            session: Arc::downgrade(&self.shared),
        }
    }
}

struct SessionState {
    target: Option<AmsAddr>,
    router: Option<Box<dyn Router>>,
    /// Bumped on every connect and teardown; a transport-lost signal carrying
    /// an older epoch belongs to a router we already replaced.
    epoch: u64,
    state_handle: u32,
    reconnect_armed: bool,
    values: HashMap<String, Arc<ValueShared>>,
}

pub(crate) struct SessionShared {
    id: u64,
    address: String,
    reconnect_interval: Duration,
    connector: Box<dyn Connect>,
    events: broadcast::Sender<SessionEvent>,
    connected: AtomicBool,
    state: Mutex<SessionState>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn report(&self, err: AdsError) {
        warn!(session = %self.address, %err, "session error");
        self.emit(SessionEvent::Error(err.to_string()));
    }

    async fn connect_now(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if let Err(err) = self.connect_locked(&mut state).await {
            // a bad address is a configuration error, not a retryable one
            let retryable = !matches!(err, AdsError::BadNetId { .. });
            self.report(err);
            if retryable {
                self.arm_reconnect_locked(&mut state);
            }
        }
    }

    async fn connect_locked(
        self: &Arc<Self>,
        state: &mut SessionState,
    ) -> Result<(), AdsError> {
        if self.connected.load(Ordering::Acquire) && state.router.is_some() {
            return Ok(());
        }

        let target = match state.target {
            Some(target) => target,
            None => {
                let target = self.address.parse::<AmsAddr>()?;
                state.target = Some(target);
                target
            }
        };

        if let Some(old) = state.router.take() {
            old.close();
        }
        state.state_handle = 0;
        state.epoch += 1;

        let router = self.connector.connect(&target, self.id, state.epoch).await?;

        // a reachable router with a stopped PLC is still a dead session
        let setup = async {
            let plc_state = router.read_state().await?;
            if !plc_state.is_run() {
                return Err(AdsError::NotRunning { state: plc_state });
            }
            let attrib = NotifyAttributes {
                size: 2,
                trans_mode: TRANSMODE_SERVERONCHA,
                cycle_ms: 1000,
                max_delay_ms: 1000,
            };
            router
                .add_notification(IDXGRP_DEVICE_DATA, IDXOFFS_DEVDATA_ADSSTATE, &attrib)
                .await
        };
        let state_handle = match setup.await {
            Ok(handle) => handle,
            Err(err) => {
                router.close();
                return Err(err);
            }
        };

        state.state_handle = state_handle;
        state.router = Some(router);
        if let Some(router) = state.router.as_deref() {
            for value in state.values.values() {
                if let Err(err) = value.attach(router).await {
                    self.report(err);
                }
            }
        }

        state.reconnect_armed = false;
        self.connected.store(true, Ordering::Release);
        info!(session = %self.address, "connected");
        self.emit(SessionEvent::ConnectionChanged(true));
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.reconnect_armed = false;
        let was_connected = self.connected.swap(false, Ordering::AcqRel);

        if let Some(router) = state.router.take() {
            for value in state.values.values() {
                value.release(&*router).await;
            }
            if state.state_handle != 0 {
                let _ = router.del_notification(state.state_handle).await;
            }
            router.close();
        }
        state.state_handle = 0;
        state.epoch += 1;
        for value in state.values.values() {
            value.invalidate();
        }
        state.values.clear();

        if was_connected {
            info!(session = %self.address, "disconnected");
            self.emit(SessionEvent::ConnectionChanged(false));
        }
    }

    /// Tears the link down after an unplanned loss and schedules reconnects.
    async fn handle_link_down_locked(self: &Arc<Self>, state: &mut SessionState) {
        if let Some(router) = state.router.take() {
            router.close();
        }
        state.state_handle = 0;
        state.epoch += 1;
        for value in state.values.values() {
            value.invalidate();
        }

        if self.connected.swap(false, Ordering::AcqRel) {
            self.emit(SessionEvent::ConnectionChanged(false));
        }
        self.arm_reconnect_locked(state);
    }

    fn arm_reconnect_locked(self: &Arc<Self>, state: &mut SessionState) {
        if state.reconnect_armed {
            return;
        }
        state.reconnect_armed = true;

        // the timer task holds no strong reference, so an abandoned session
        // can still drop and close its link
        let weak = Arc::downgrade(self);
        let interval = self.reconnect_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let mut state = session.state.lock().await;
                if !state.reconnect_armed {
                    break;
                }
                match session.connect_locked(&mut state).await {
                    Ok(()) => break,
                    Err(err) => session.report(err),
                }
            }
        });
    }

    /// Routes one pushed sample: the device-state subscription supervises the
    /// link, everything else belongs to a value.
    pub(crate) async fn on_notification(self: &Arc<Self>, sample: NotificationSample) {
        let mut state = self.state.lock().await;

        if state.state_handle != 0 && sample.handle == state.state_handle {
            if sample.data.len() >= 2 {
                let plc_state =
                    AdsState::from_raw(u16::from_le_bytes([sample.data[0], sample.data[1]]));
                if !plc_state.is_run() && self.connected.load(Ordering::Acquire) {
                    self.report(AdsError::NotRunning { state: plc_state });
                    self.handle_link_down_locked(&mut state).await;
                }
            }
            return;
        }

        let target = state
            .values
            .values()
            .find(|value| value.notify_handle() == sample.handle)
            .cloned();
        drop(state);

        if let Some(value) = target {
            if let Err(err) = value.deliver(&sample.data) {
                self.report(err);
            }
        }
    }

    /// Handles a transport-level loss reported by the router's reader task.
    /// Stale reports from an already-replaced router are ignored.
    pub(crate) async fn on_transport_lost(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        self.report(AdsError::TransportClosed);
        self.handle_link_down_locked(&mut state).await;
    }

    fn not_connected(&self, value: &Arc<ValueShared>) -> AdsError {
        AdsError::NotConnected {
            name: value.name().to_string(),
        }
    }

    pub(crate) async fn read_value(&self, value: &Arc<ValueShared>) -> Result<PlcValue, AdsError> {
        let state = self.state.lock().await;
        let Some(router) = state.router.as_deref() else {
            return Err(self.not_connected(value));
        };
        value.read_via(router).await
    }

    pub(crate) async fn write_value(
        &self,
        value: &Arc<ValueShared>,
        new_value: PlcValue,
    ) -> Result<(), AdsError> {
        let state = self.state.lock().await;
        let Some(router) = state.router.as_deref() else {
            return Err(self.not_connected(value));
        };
        value.write_via(router, new_value).await
    }

    pub(crate) async fn read_raw(
        &self,
        value: &Arc<ValueShared>,
        len: u32,
    ) -> Result<Vec<u8>, AdsError> {
        let state = self.state.lock().await;
        let Some(router) = state.router.as_deref() else {
            return Err(self.not_connected(value));
        };
        value.read_raw_via(router, len).await
    }

    pub(crate) async fn write_raw(
        &self,
        value: &Arc<ValueShared>,
        data: &[u8],
    ) -> Result<(), AdsError> {
        let state = self.state.lock().await;
        let Some(router) = state.router.as_deref() else {
            return Err(self.not_connected(value));
        };
        value.write_raw_via(router, data).await
    }

    pub(crate) async fn reconfigure_notify(
        &self,
        value: &Arc<ValueShared>,
        mode: NotifyMode,
        cycle_ms: u32,
        max_delay_ms: u32,
    ) -> Result<(), AdsError> {
        let state = self.state.lock().await;
        match state.router.as_deref() {
            Some(router) => value.apply_notify(router, mode, cycle_ms, max_delay_ms).await,
            None => {
                // applied on the next attach
                value.set_notify_config(mode, cycle_ms, max_delay_ms);
                Ok(())
            }
        }
    }

    pub(crate) async fn remove_value(&self, name: &str) {
        let mut state = self.state.lock().await;
        let Some(value) = state.values.remove(name) else {
            return;
        };
        if let Some(router) = state.router.as_deref() {
            value.release(router).await;
        }
        value.invalidate();
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        registry::unregister(self.id);
        let state = self.state.get_mut();
        if let Some(router) = state.router.take() {
            router.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::{Session, SessionEvent};
    use crate::envelope::NotificationSample;
    use crate::error::AdsError;
    use crate::model::symbol::{AdsState, AmsAddr, PlcKind, SymbolInfo};
    use crate::model::value::PlcValue;
    use crate::transport::{Connect, NotifyAttributes, Router};
    use crate::value::{NotifyMode, ValueOptions};

    fn on_change() -> ValueOptions {
        ValueOptions {
            notify: NotifyMode::OnChange,
            ..ValueOptions::default()
        }
    }

    struct MockSymbol {
        info: SymbolInfo,
        bytes: Vec<u8>,
    }

    #[derive(Default)]
    struct MockPlc {
        state: u16,
        symbols: HashMap<String, MockSymbol>,
        next_handle: u32,
        handles: HashMap<u32, String>,
        next_notify: u32,
        connects: u32,
        fail_connects: u32,
        log: Vec<String>,
    }

    fn plc_with(symbols: &[(&str, &str, &[u8])]) -> Arc<StdMutex<MockPlc>> {
        let mut plc = MockPlc {
            state: 5,
            next_handle: 1,
            next_notify: 100,
            ..MockPlc::default()
        };
        for (name, symbol_type, bytes) in symbols {
            plc.symbols.insert(
                name.to_string(),
                MockSymbol {
                    info: SymbolInfo {
                        group: 0x4040,
                        offset: 0,
                        size: bytes.len() as u32,
                        name: name.to_string(),
                        symbol_type: symbol_type.to_string(),
                        comment: String::new(),
                    },
                    bytes: bytes.to_vec(),
                },
            );
        }
        Arc::new(StdMutex::new(plc))
    }

    struct MockRouter {
        plc: Arc<StdMutex<MockPlc>>,
    }

    #[async_trait]
    impl Router for MockRouter {
        async fn read_state(&self) -> Result<AdsState, AdsError> {
            Ok(AdsState::from_raw(self.plc.lock().unwrap().state))
        }

        async fn resolve_handle(&self, name: &str) -> Result<u32, AdsError> {
            let mut plc = self.plc.lock().unwrap();
            if !plc.symbols.contains_key(name) {
                return Err(AdsError::device(0x710));
            }
            let handle = plc.next_handle;
            plc.next_handle += 1;
            plc.handles.insert(handle, name.to_string());
            Ok(handle)
        }

        async fn release_handle(&self, handle: u32) -> Result<(), AdsError> {
            let mut plc = self.plc.lock().unwrap();
            plc.handles.remove(&handle);
            plc.log.push(format!("release {handle}"));
            Ok(())
        }

        async fn symbol_info(&self, name: &str) -> Result<SymbolInfo, AdsError> {
            self.plc
                .lock()
                .unwrap()
                .symbols
                .get(name)
                .map(|symbol| symbol.info.clone())
                .ok_or_else(|| AdsError::device(0x710))
        }

        async fn read(&self, handle: u32, len: u32) -> Result<Vec<u8>, AdsError> {
            let plc = self.plc.lock().unwrap();
            let name = plc.handles.get(&handle).ok_or_else(|| AdsError::device(0x714))?;
            let bytes = &plc.symbols[name].bytes;
            Ok(bytes[..bytes.len().min(len as usize)].to_vec())
        }

        async fn write(&self, handle: u32, data: &[u8]) -> Result<(), AdsError> {
            let mut plc = self.plc.lock().unwrap();
            let name = plc
                .handles
                .get(&handle)
                .cloned()
                .ok_or_else(|| AdsError::device(0x714))?;
            plc.log.push(format!("write {name}"));
            if let Some(symbol) = plc.symbols.get_mut(&name) {
                symbol.bytes = data.to_vec();
            }
            Ok(())
        }

        async fn add_notification(
            &self,
            group: u32,
            offset: u32,
            _attrib: &NotifyAttributes,
        ) -> Result<u32, AdsError> {
            let mut plc = self.plc.lock().unwrap();
            let handle = plc.next_notify;
            plc.next_notify += 1;
            plc.log.push(format!("add_notify {group:#x}:{offset}"));
            Ok(handle)
        }

        async fn del_notification(&self, handle: u32) -> Result<(), AdsError> {
            let mut plc = self.plc.lock().unwrap();
            plc.log.push(format!("del_notify {handle}"));
            Ok(())
        }

        fn close(&self) {}
    }

    struct MockConnect {
        plc: Arc<StdMutex<MockPlc>>,
    }

    #[async_trait]
    impl Connect for MockConnect {
        async fn connect(
            &self,
            target: &AmsAddr,
            _session_id: u64,
            _epoch: u64,
        ) -> Result<Box<dyn Router>, AdsError> {
            let mut plc = self.plc.lock().unwrap();
            plc.connects += 1;
            if plc.fail_connects > 0 {
                plc.fail_connects -= 1;
                return Err(AdsError::Connection {
                    target: target.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(MockRouter {
                plc: self.plc.clone(),
            }))
        }
    }

    fn mock_session(plc: &Arc<StdMutex<MockPlc>>) -> Session {
        Session::builder("10.0.0.1.1.1:851")
            .reconnect_interval(Duration::from_secs(5))
            .connector(Box::new(MockConnect { plc: plc.clone() }))
            .build()
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count_log(plc: &Arc<StdMutex<MockPlc>>, prefix: &str) -> usize {
        plc.lock()
            .unwrap()
            .log
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    fn connects(plc: &Arc<StdMutex<MockPlc>>) -> u32 {
        plc.lock().unwrap().connects
    }

    #[tokio::test]
    async fn malformed_address_is_one_error_and_no_dial() {
        let plc = plc_with(&[]);
        let session = Session::builder("not-an-address")
            .connector(Box::new(MockConnect { plc: plc.clone() }))
            .build();
        let mut events = session.events();

        session.open().await;

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], SessionEvent::Error(msg) if msg.contains("not-an-address")),
            "got {events:?}"
        );
        assert!(!session.is_connected());
        assert_eq!(connects(&plc), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_address_via_connect_does_not_retry() {
        let plc = plc_with(&[]);
        let session = Session::builder("not-an-address")
            .connector(Box::new(MockConnect { plc: plc.clone() }))
            .build();
        let mut events = session.events();

        assert!(!session.connect().await);
        tokio::time::sleep(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;

        // one configuration error, no reconnect timer ticking behind it
        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1, "got {seen:?}");
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("not-an-address")),
            "got {seen:?}"
        );
        assert_eq!(connects(&plc), 0);
    }

    #[tokio::test]
    async fn same_name_yields_same_underlying_value() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;

        let first = session.value("MAIN.x").await;
        let second = session.value("MAIN.x").await;
        assert!(Arc::ptr_eq(&first.shared, &second.shared));
    }

    #[tokio::test]
    async fn int_symbol_set_then_get_round_trips() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;
        assert!(session.is_connected());

        let value = session.value("MAIN.x").await;
        assert_eq!(value.kind(), PlcKind::Int16);
        assert_eq!(value.symbol_info().symbol_type, "INT");

        let mut watch = value.subscribe();
        watch.borrow_and_update();

        // a successful write updates the cache without a round trip
        value.set(5i16).await;
        assert_eq!(value.cached(), PlcValue::Int16(5));
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), PlcValue::Int16(5));

        assert_eq!(value.get().await, PlcValue::Int16(5));
    }

    #[tokio::test]
    async fn string_symbols_round_trip_and_truncate_pushed_samples() {
        let mut narrow = vec![0u8; 81];
        narrow[..5].copy_from_slice(b"hello");
        let mut wide = vec![0u8; 82];
        for (i, unit) in "hi".encode_utf16().enumerate() {
            wide[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        let plc = plc_with(&[
            ("MAIN.sText", "STRING(80)", narrow.as_slice()),
            ("MAIN.wsText", "WSTRING(40)", wide.as_slice()),
        ]);
        let session = mock_session(&plc);
        session.open().await;

        let narrow_value = session.value_with("MAIN.sText", on_change()).await;
        assert_eq!(narrow_value.kind(), PlcKind::String);
        assert_eq!(narrow_value.cached(), PlcValue::String("hello".into()));

        narrow_value.set("world").await;
        assert_eq!(narrow_value.cached(), PlcValue::String("world".into()));
        assert_eq!(narrow_value.get().await, PlcValue::String("world".into()));

        let wide_value = session.value("MAIN.wsText").await;
        assert_eq!(wide_value.kind(), PlcKind::WString);
        assert_eq!(wide_value.get().await, PlcValue::String("hi".into()));
        wide_value.set("yo").await;
        assert_eq!(wide_value.get().await, PlcValue::String("yo".into()));

        // a pushed sample longer than the declared size decodes only the
        // declared bytes
        let handle = narrow_value.shared.notify_handle();
        assert_ne!(handle, 0);
        session
            .shared
            .on_notification(NotificationSample {
                handle,
                timestamp: 0,
                data: vec![b'A'; 100],
            })
            .await;
        assert_eq!(narrow_value.cached(), PlcValue::String("A".repeat(81)));
    }

    #[tokio::test]
    async fn unresolved_symbol_reads_report_distinct_error() {
        let plc = plc_with(&[]);
        let session = mock_session(&plc);
        session.open().await;
        let mut events = session.events();

        let value = session.value("MAIN.missing").await;
        let seen = drain(&mut events);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("symbol not found")),
            "got {seen:?}"
        );

        // the session is still connected, so the failure is a resolution
        // error, not a connection one
        assert!(session.is_connected());
        assert_eq!(value.get().await, PlcValue::Empty);
        let seen = drain(&mut events);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("unresolved")),
            "got {seen:?}"
        );
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let plc = plc_with(&[]);
        let session = mock_session(&plc);
        session.open().await;
        assert_eq!(connects(&plc), 1);

        assert!(session.connect().await);
        assert_eq!(connects(&plc), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_invalidates_values_and_reconnects() {
        let plc = plc_with(&[("MAIN.x", "INT", &[7, 0])]);
        let session = mock_session(&plc);
        session.open().await;

        let value = session.value("MAIN.x").await;
        assert_eq!(value.cached(), PlcValue::Int16(7));
        let mut events = session.events();

        let epoch = session.shared.state.lock().await.epoch;
        session.shared.on_transport_lost(epoch).await;

        assert!(!session.is_connected());
        assert_eq!(value.cached(), PlcValue::Empty);
        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::ConnectionChanged(false)), "got {seen:?}");

        tokio::time::sleep(Duration::from_millis(5100)).await;
        tokio::task::yield_now().await;

        assert!(session.is_connected());
        assert_eq!(connects(&plc), 2);
        assert_eq!(value.get().await, PlcValue::Int16(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_transport_loss_reports_are_ignored() {
        let plc = plc_with(&[]);
        let session = mock_session(&plc);
        session.open().await;

        session.shared.on_transport_lost(0).await;
        assert!(session.is_connected());
        assert_eq!(connects(&plc), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_are_paced_by_the_interval() {
        let plc = plc_with(&[]);
        plc.lock().unwrap().fail_connects = 10;
        let session = mock_session(&plc);
        session.open().await;
        assert_eq!(connects(&plc), 1);
        assert!(!session.is_connected());

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(connects(&plc), 2);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(connects(&plc), 2);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(connects(&plc), 3);
    }

    #[tokio::test]
    async fn unchanged_samples_are_suppressed() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;

        let value = session.value_with("MAIN.x", on_change()).await;
        let mut watch = value.subscribe();
        watch.borrow_and_update();

        let notify_handle = value.shared.notify_handle();
        assert_ne!(notify_handle, 0);

        session
            .shared
            .on_notification(NotificationSample {
                handle: notify_handle,
                timestamp: 0,
                data: vec![5, 0],
            })
            .await;
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), PlcValue::Int16(5));

        session
            .shared
            .on_notification(NotificationSample {
                handle: notify_handle,
                timestamp: 0,
                data: vec![5, 0],
            })
            .await;
        assert!(!watch.has_changed().unwrap());
    }

    #[tokio::test]
    async fn notify_reconfigure_replaces_subscriptions() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;

        // created without a subscription by default
        let value = session.value("MAIN.x").await;
        assert_eq!(value.shared.notify_handle(), 0);
        let mut events = session.events();

        // unregistering with nothing active is a silent no-op
        value.enable_notify(NotifyMode::None, 300, 1000).await;
        assert!(drain(&mut events).is_empty());
        assert_eq!(count_log(&plc, "del_notify"), 0);

        value.enable_notify(NotifyMode::OnChange, 300, 1000).await;
        assert_ne!(value.shared.notify_handle(), 0);
        let adds = count_log(&plc, "add_notify");

        value.enable_notify(NotifyMode::OnChange, 300, 1000).await;
        assert_eq!(count_log(&plc, "add_notify"), adds);

        // timing change replaces the subscription even in the same mode
        value.enable_notify(NotifyMode::OnChange, 100, 1000).await;
        assert_eq!(count_log(&plc, "add_notify"), adds + 1);
        assert_eq!(count_log(&plc, "del_notify"), 1);

        value.enable_notify(NotifyMode::None, 100, 1000).await;
        assert_eq!(count_log(&plc, "del_notify"), 2);
        assert_eq!(value.shared.notify_handle(), 0);
    }

    #[tokio::test]
    async fn typed_read_size_mismatch_reports_and_zeroes() {
        let plc = plc_with(&[("MAIN.x", "INT", &[5, 0])]);
        let session = mock_session(&plc);
        session.open().await;
        let value = session.value("MAIN.x").await;

        let ok: u16 = value.read_as().await;
        assert_eq!(ok, 5);

        let mut events = session.events();
        let bad: u32 = value.read_as().await;
        assert_eq!(bad, 0);

        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("size")),
            "got {seen:?}"
        );
    }

    #[tokio::test]
    async fn get_while_disconnected_is_empty_with_event() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        let value = session.value("MAIN.x").await;
        let mut events = session.events();

        assert_eq!(value.get().await, PlcValue::Empty);

        let seen = drain(&mut events);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("not connected")),
            "got {seen:?}"
        );
    }

    #[tokio::test]
    async fn struct_symbols_use_the_typed_accessors() {
        let plc = plc_with(&[(
            "MAIN.stData",
            "ST_Data",
            &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0],
        )]);
        let session = mock_session(&plc);
        session.open().await;

        let value = session.value_with("MAIN.stData", on_change()).await;
        assert_eq!(value.kind(), PlcKind::Opaque(12));
        // blob symbols never get a change subscription
        assert_eq!(value.shared.notify_handle(), 0);

        let mut events = session.events();
        assert_eq!(value.get().await, PlcValue::Empty);
        let seen = drain(&mut events);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("read_as")),
            "got {seen:?}"
        );

        let raw: [u8; 12] = value.read_as().await;
        assert_eq!(raw, [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[tokio::test]
    async fn unconvertible_set_emits_error_and_writes_nothing() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;
        let value = session.value("MAIN.x").await;
        let mut events = session.events();

        value.set("not a number").await;

        let seen = drain(&mut events);
        assert!(
            matches!(&seen[0], SessionEvent::Error(msg) if msg.contains("cannot convert")),
            "got {seen:?}"
        );
        assert_eq!(count_log(&plc, "write"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_to_stop_transition_drops_the_link() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;
        let value = session.value("MAIN.x").await;
        let mut events = session.events();

        let state_handle = session.shared.state.lock().await.state_handle;
        session
            .shared
            .on_notification(NotificationSample {
                handle: state_handle,
                timestamp: 0,
                data: vec![6, 0],
            })
            .await;

        assert!(!session.is_connected());
        assert_eq!(value.cached(), PlcValue::Empty);
        let seen = drain(&mut events);
        assert!(
            seen.iter()
                .any(|event| matches!(event, SessionEvent::Error(msg) if msg.contains("not Run"))),
            "got {seen:?}"
        );
        assert!(seen.contains(&SessionEvent::ConnectionChanged(false)));
    }

    #[tokio::test]
    async fn dispose_releases_the_symbol() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;

        let first = session.value_with("MAIN.x", on_change()).await;
        let clone = session.value("MAIN.x").await;
        first.dispose().await;

        assert_eq!(clone.cached(), PlcValue::Empty);
        assert!(count_log(&plc, "release") >= 1);
        assert!(count_log(&plc, "del_notify") >= 1);

        let fresh = session.value("MAIN.x").await;
        assert!(!Arc::ptr_eq(&clone.shared, &fresh.shared));
    }

    #[tokio::test]
    async fn disconnect_releases_handles_and_emits() {
        let plc = plc_with(&[("MAIN.x", "INT", &[0, 0])]);
        let session = mock_session(&plc);
        session.open().await;
        let value = session.value("MAIN.x").await;
        let mut events = session.events();

        session.disconnect().await;

        assert!(!session.is_connected());
        assert_eq!(value.cached(), PlcValue::Empty);
        assert!(count_log(&plc, "release") >= 1);
        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::ConnectionChanged(false)));

        // disconnect discards owned handles; the old one stays dead after
        // reconnect and a fresh lookup gets a new resolution
        assert!(session.connect().await);
        assert_eq!(value.get().await, PlcValue::Empty);
        let fresh = session.value("MAIN.x").await;
        assert!(!Arc::ptr_eq(&fresh.shared, &value.shared));
        assert_eq!(fresh.get().await, PlcValue::Int16(0));
    }
}
