//! Live symbol handles: resolution, caching, change notification and the
//! typed accessors.

use std::mem;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytemuck::Pod;
use tokio::sync::watch;
use tracing::debug;

use crate::envelope::{IDXGRP_SYM_VALBYHND, TRANSMODE_SERVERCYCLE, TRANSMODE_SERVERONCHA};
use crate::error::AdsError;
use crate::model::symbol::{array_span, kind_for, ArraySpan, PlcKind, SymbolInfo};
use crate::model::value::PlcValue;
use crate::session::SessionShared;
use crate::transport::{NotifyAttributes, Router};

/// How the controller pushes updates for a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyMode {
    /// No server-side notification; reads always go to the wire.
    None,
    /// One sample per server cycle interval.
    Cyclic,
    /// A sample whenever the value changes (checked at the cycle interval).
    OnChange,
}

impl NotifyMode {
    fn trans_mode(self) -> u32 {
        match self {
            NotifyMode::Cyclic => TRANSMODE_SERVERCYCLE,
            NotifyMode::OnChange | NotifyMode::None => TRANSMODE_SERVERONCHA,
        }
    }
}

/// Per-symbol tuning applied when the handle is created.
#[derive(Clone, Copy, Debug)]
pub struct ValueOptions {
    /// `None` infers a scalar/string kind from controller metadata. An
    /// explicit size marks the symbol as an opaque fixed-size blob for the
    /// typed accessors (struct types) and skips inference.
    pub declared_size: Option<u32>,
    /// Notification mode installed at attach time. Opaque blob symbols never
    /// get a subscription; pushed samples decode only for scalar and string
    /// kinds.
    pub notify: NotifyMode,
    /// Server check interval for notifications, in milliseconds.
    pub cycle_ms: u32,
    /// Maximum server-side batching delay, in milliseconds.
    pub max_delay_ms: u32,
}

impl Default for ValueOptions {
    fn default() -> Self {
        ValueOptions {
            declared_size: None,
            notify: NotifyMode::None,
            cycle_ms: 300,
            max_delay_ms: 1000,
        }
    }
}

struct ValueState {
    handle: u32,
    notify_handle: u32,
    info: SymbolInfo,
    kind: PlcKind,
    span: ArraySpan,
    declared_size: Option<u32>,
    notify: NotifyMode,
    cycle_ms: u32,
    max_delay_ms: u32,
    cached: PlcValue,
}

/// Session-owned state behind every [`ValueHandle`] clone for one symbol
/// name. The state mutex is never held across an await; router calls snapshot
/// what they need first and store results afterwards.
pub(crate) struct ValueShared {
    name: String,
    state: StdMutex<ValueState>,
    watch_tx: watch::Sender<PlcValue>,
}

impl ValueShared {
    pub(crate) fn new(name: &str, options: ValueOptions) -> Arc<Self> {
        let (watch_tx, _) = watch::channel(PlcValue::Empty);
        Arc::new(ValueShared {
            name: name.to_string(),
            state: StdMutex::new(ValueState {
                handle: 0,
                notify_handle: 0,
                info: SymbolInfo::default(),
                kind: PlcKind::Invalid,
                span: ArraySpan::default(),
                declared_size: options.declared_size,
                notify: options.notify,
                cycle_ms: options.cycle_ms,
                max_delay_ms: options.max_delay_ms,
                cached: PlcValue::Empty,
            }),
            watch_tx,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn notify_handle(&self) -> u32 {
        self.lock().notify_handle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ValueState> {
        // the state is plain data; a poisoned guard is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves the symbol on a fresh connection: handle, metadata, kind,
    /// notification subscription, and a seeding read so subscribers observe
    /// the current value before the first push arrives.
    pub(crate) async fn attach(&self, router: &dyn Router) -> Result<(), AdsError> {
        let handle = router.resolve_handle(&self.name).await?;
        let info = match router.symbol_info(&self.name).await {
            Ok(info) => info,
            Err(err) => {
                let _ = router.release_handle(handle).await;
                return Err(err);
            }
        };

        let (declared, notify, cycle_ms, max_delay_ms) = {
            let state = self.lock();
            (
                state.declared_size,
                state.notify,
                state.cycle_ms,
                state.max_delay_ms,
            )
        };

        let span = array_span(&info.symbol_type);
        let kind = match declared {
            // an explicit size marks a struct blob; inference is skipped
            Some(_) => PlcKind::Opaque(info.size),
            None => {
                let inferred = kind_for(&info.symbol_type, info.size);
                if inferred == PlcKind::Invalid && info.size > 0 {
                    PlcKind::Opaque(info.size)
                } else {
                    inferred
                }
            }
        };

        let notify_handle = if notify != NotifyMode::None && !matches!(kind, PlcKind::Opaque(_)) {
            let attrib = NotifyAttributes {
                size: info.size,
                trans_mode: notify.trans_mode(),
                cycle_ms,
                max_delay_ms,
            };
            match router
                .add_notification(IDXGRP_SYM_VALBYHND, handle, &attrib)
                .await
            {
                Ok(notify_handle) => notify_handle,
                Err(err) => {
                    let _ = router.release_handle(handle).await;
                    return Err(err);
                }
            }
        } else {
            0
        };

        let seeded = if matches!(kind, PlcKind::Opaque(_) | PlcKind::Invalid) {
            None
        } else {
            router.read(handle, info.size).await.ok()
        };

        debug!(symbol = %self.name, ty = %info.symbol_type, size = info.size, "symbol attached");

        {
            let mut state = self.lock();
            state.handle = handle;
            state.notify_handle = notify_handle;
            state.info = info;
            state.kind = kind;
            state.span = span;
        }

        if let Some(bytes) = seeded {
            let _ = self.deliver(&bytes);
        }
        Ok(())
    }

    /// Decodes one pushed or freshly-read payload, updates the cache and
    /// publishes the value if it actually changed.
    pub(crate) fn deliver(&self, data: &[u8]) -> Result<PlcValue, AdsError> {
        let (kind, limit) = {
            let state = self.lock();
            (state.kind, state.info.size as usize)
        };

        if matches!(kind, PlcKind::Invalid | PlcKind::Opaque(_)) {
            return Ok(PlcValue::Empty);
        }

        // the server may pad a sample past the declared symbol size
        let take = if limit > 0 {
            data.len().min(limit)
        } else {
            data.len()
        };
        let value = PlcValue::decode(kind, &data[..take])?;

        let changed = {
            let mut state = self.lock();
            if state.cached == value {
                false
            } else {
                state.cached = value.clone();
                true
            }
        };
        if changed {
            self.watch_tx.send_replace(value.clone());
        }
        Ok(value)
    }

    /// Drops all connection-derived state and publishes the `Empty` sentinel,
    /// at most once per link loss.
    pub(crate) fn invalidate(&self) {
        let already_invalid = {
            let mut state = self.lock();
            let already = state.handle == 0 && state.cached.is_empty();
            state.handle = 0;
            state.notify_handle = 0;
            state.cached = PlcValue::Empty;
            already
        };
        if !already_invalid {
            self.watch_tx.send_replace(PlcValue::Empty);
        }
    }

    /// Best-effort release of server-side resources before a graceful
    /// disconnect. Errors are ignored; the link is going away regardless.
    pub(crate) async fn release(&self, router: &dyn Router) {
        let (handle, notify_handle) = {
            let state = self.lock();
            (state.handle, state.notify_handle)
        };
        if notify_handle != 0 {
            let _ = router.del_notification(notify_handle).await;
        }
        if handle != 0 {
            let _ = router.release_handle(handle).await;
        }
    }

    /// Replaces the notification subscription: the old one is unregistered
    /// and, unless `mode` is `None`, a new one installed with the given
    /// timing. A no-op when nothing changed.
    pub(crate) async fn apply_notify(
        &self,
        router: &dyn Router,
        mode: NotifyMode,
        cycle_ms: u32,
        max_delay_ms: u32,
    ) -> Result<(), AdsError> {
        let (unchanged, notify_handle, handle, kind, size) = {
            let state = self.lock();
            (
                state.notify == mode
                    && state.cycle_ms == cycle_ms
                    && state.max_delay_ms == max_delay_ms,
                state.notify_handle,
                state.handle,
                state.kind,
                state.info.size,
            )
        };
        if unchanged {
            return Ok(());
        }

        if notify_handle != 0 {
            router.del_notification(notify_handle).await?;
            self.lock().notify_handle = 0;
        }
        self.set_notify_config(mode, cycle_ms, max_delay_ms);

        if mode != NotifyMode::None && handle != 0 && !matches!(kind, PlcKind::Opaque(_)) {
            let attrib = NotifyAttributes {
                size,
                trans_mode: mode.trans_mode(),
                cycle_ms,
                max_delay_ms,
            };
            let new_handle = router
                .add_notification(IDXGRP_SYM_VALBYHND, handle, &attrib)
                .await?;
            self.lock().notify_handle = new_handle;
        }
        Ok(())
    }

    /// Records the configuration for the next attach when there is no live
    /// router.
    pub(crate) fn set_notify_config(&self, mode: NotifyMode, cycle_ms: u32, max_delay_ms: u32) {
        let mut state = self.lock();
        state.notify = mode;
        state.cycle_ms = cycle_ms;
        state.max_delay_ms = max_delay_ms;
    }

    fn scalar_access(&self) -> Result<(u32, PlcKind, u32), AdsError> {
        let state = self.lock();
        // a live router with no handle means name resolution failed
        if state.handle == 0 {
            return Err(AdsError::Unresolved {
                name: self.name.clone(),
            });
        }
        match state.kind {
            PlcKind::Invalid => {
                return Err(AdsError::Unresolved {
                    name: self.name.clone(),
                })
            }
            PlcKind::Opaque(_) => {
                return Err(AdsError::OpaqueSymbol {
                    name: self.name.clone(),
                })
            }
            kind if state.span.count > 1 && !kind.is_string() => {
                return Err(AdsError::ArrayUnsupported {
                    name: self.name.clone(),
                })
            }
            _ => {}
        }
        Ok((state.handle, state.kind, state.info.size))
    }

    pub(crate) async fn read_via(&self, router: &dyn Router) -> Result<PlcValue, AdsError> {
        let (handle, _, size) = self.scalar_access()?;
        let bytes = router.read(handle, size).await?;
        self.deliver(&bytes)
    }

    pub(crate) async fn write_via(
        &self,
        router: &dyn Router,
        value: PlcValue,
    ) -> Result<(), AdsError> {
        let (handle, kind, size) = self.scalar_access()?;
        let converted = value.convert_to(kind)?;
        let bytes = converted.encode(kind, size)?;
        router.write(handle, &bytes).await?;
        // the controller now holds these bytes; cache and subscribers follow
        self.deliver(&bytes)?;
        Ok(())
    }

    pub(crate) async fn read_raw_via(
        &self,
        router: &dyn Router,
        len: u32,
    ) -> Result<Vec<u8>, AdsError> {
        let (handle, size) = self.raw_access(len)?;
        debug_assert_eq!(len, size);
        router.read(handle, len).await
    }

    pub(crate) async fn write_raw_via(
        &self,
        router: &dyn Router,
        data: &[u8],
    ) -> Result<(), AdsError> {
        let (handle, _) = self.raw_access(data.len() as u32)?;
        router.write(handle, data).await
    }

    fn raw_access(&self, len: u32) -> Result<(u32, u32), AdsError> {
        let state = self.lock();
        if state.handle == 0 {
            return Err(AdsError::Unresolved {
                name: self.name.clone(),
            });
        }
        if len != state.info.size {
            return Err(AdsError::SizeMismatch {
                name: self.name.clone(),
                symbol: state.info.size,
                value: len,
            });
        }
        Ok((state.handle, state.info.size))
    }

    pub(crate) fn kind(&self) -> PlcKind {
        self.lock().kind
    }

    pub(crate) fn cached(&self) -> PlcValue {
        self.lock().cached.clone()
    }

    pub(crate) fn symbol_info(&self) -> SymbolInfo {
        self.lock().info.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PlcValue> {
        self.watch_tx.subscribe()
    }
}

/// Handle to one named controller symbol, obtained from
/// [`Session::value`](crate::Session::value).
///
/// Clones share one underlying symbol: the same handle, cache and
/// notification subscription. Accessors follow the session's event-surface
/// error contract: a failing [`get`](ValueHandle::get) returns
/// [`PlcValue::Empty`], a failing [`read_as`](ValueHandle::read_as) returns
/// zeroed bytes, and the cause is published on the session's event stream.
#[derive(Clone)]
pub struct ValueHandle {
    pub(crate) shared: Arc<ValueShared>,
    pub(crate) session: Weak<SessionShared>,
}

impl ValueHandle {
    /// The symbol name this handle was created with.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Decoded kind of the symbol; `Invalid` while unresolved.
    pub fn kind(&self) -> PlcKind {
        self.shared.kind()
    }

    /// Last value observed via read or notification, `Empty` while the
    /// symbol is unresolved.
    pub fn cached(&self) -> PlcValue {
        self.shared.cached()
    }

    /// Symbol metadata from the controller's symbol table, default while
    /// unresolved.
    pub fn symbol_info(&self) -> SymbolInfo {
        self.shared.symbol_info()
    }

    /// Watches the cached value. The receiver yields the current value
    /// immediately and then once per observed change; `Empty` marks a lost
    /// link or disposed handle.
    pub fn subscribe(&self) -> watch::Receiver<PlcValue> {
        self.shared.subscribe()
    }

    /// Reads the symbol from the controller.
    pub async fn get(&self) -> PlcValue {
        let Some(session) = self.session.upgrade() else {
            return PlcValue::Empty;
        };
        match session.read_value(&self.shared).await {
            Ok(value) => value,
            Err(err) => {
                session.report(err);
                PlcValue::Empty
            }
        }
    }

    /// Writes the symbol, converting `value` to the symbol's kind first.
    pub async fn set(&self, value: impl Into<PlcValue>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Err(err) = session.write_value(&self.shared, value.into()).await {
            session.report(err);
        }
    }

    /// Reads the symbol as a plain-old-data struct. The size of `T` must
    /// match the symbol's declared size exactly; on any failure the zeroed
    /// value is returned and the cause published as a session event.
    pub async fn read_as<T: Pod>(&self) -> T {
        let Some(session) = self.session.upgrade() else {
            return T::zeroed();
        };
        let len = mem::size_of::<T>() as u32;
        match session.read_raw(&self.shared, len).await {
            Ok(bytes) => match bytemuck::try_pod_read_unaligned(&bytes) {
                Ok(value) => value,
                Err(_) => {
                    session.report(AdsError::SizeMismatch {
                        name: self.shared.name().to_string(),
                        symbol: bytes.len() as u32,
                        value: len,
                    });
                    T::zeroed()
                }
            },
            Err(err) => {
                session.report(err);
                T::zeroed()
            }
        }
    }

    /// Writes the symbol from a plain-old-data struct; size rules as in
    /// [`read_as`](ValueHandle::read_as).
    pub async fn write_as<T: Pod>(&self, value: &T) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Err(err) = session.write_raw(&self.shared, bytemuck::bytes_of(value)).await {
            session.report(err);
        }
    }

    /// Replaces the notification subscription for this symbol. Passing
    /// `NotifyMode::None` unregisters it; doing so when nothing is active is
    /// a silent no-op.
    pub async fn enable_notify(&self, mode: NotifyMode, cycle_ms: u32, max_delay_ms: u32) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Err(err) = session
            .reconfigure_notify(&self.shared, mode, cycle_ms, max_delay_ms)
            .await
        {
            session.report(err);
        }
    }

    /// Releases the symbol: server-side handles are freed and the name can
    /// be re-created fresh. Other clones of this handle go `Empty`.
    pub async fn dispose(self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.remove_value(self.shared.name()).await;
    }
}
