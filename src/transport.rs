//! Connection layer: the router seam the session talks through, and the
//! AMS/TCP implementation of it.
//!
//! A connected router owns one TCP stream to the controller's ADS router.
//! Requests are invoke-id matched against responses by a reader task; pushed
//! device notifications are handed to a dispatcher task which looks the
//! owning session up by id (see [`crate::registry`]) so delivery never
//! touches a raw pointer.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{
    self, AmsHeader, NotificationSample, ADS_TCP_PORT, CMD_ADD_NOTIFICATION, CMD_DEL_NOTIFICATION,
    CMD_NOTIFICATION, CMD_READ, CMD_READ_STATE, CMD_READ_WRITE, CMD_WRITE, IDXGRP_SYM_HNDBYNAME,
    IDXGRP_SYM_INFOBYNAMEEX, IDXGRP_SYM_RELEASEHND, IDXGRP_SYM_VALBYHND, STATE_ADS_REQUEST,
    SYMBOL_INFO_MAX,
};
use crate::error::AdsError;
use crate::model::symbol::{AdsState, AmsAddr, SymbolInfo};
use crate::registry;

/// Subscription attributes for a device notification.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NotifyAttributes {
    pub size: u32,
    pub trans_mode: u32,
    pub cycle_ms: u32,
    pub max_delay_ms: u32,
}

/// Protocol primitives a session needs from a live connection.
#[async_trait]
pub(crate) trait Router: Send + Sync {
    async fn read_state(&self) -> Result<AdsState, AdsError>;
    async fn resolve_handle(&self, name: &str) -> Result<u32, AdsError>;
    async fn release_handle(&self, handle: u32) -> Result<(), AdsError>;
    async fn symbol_info(&self, name: &str) -> Result<SymbolInfo, AdsError>;
    async fn read(&self, handle: u32, len: u32) -> Result<Vec<u8>, AdsError>;
    async fn write(&self, handle: u32, data: &[u8]) -> Result<(), AdsError>;
    async fn add_notification(
        &self,
        group: u32,
        offset: u32,
        attrib: &NotifyAttributes,
    ) -> Result<u32, AdsError>;
    async fn del_notification(&self, handle: u32) -> Result<(), AdsError>;

    /// Tears the connection down without reporting a transport loss.
    fn close(&self);
}

/// Opens a fresh connection for a session. The seam exists so tests can
/// drive the session with a scripted router.
#[async_trait]
pub(crate) trait Connect: Send + Sync {
    async fn connect(
        &self,
        target: &AmsAddr,
        session_id: u64,
        epoch: u64,
    ) -> Result<Box<dyn Router>, AdsError>;
}

/// Default connector: AMS over TCP to the controller's ADS router port.
///
/// The route host defaults to the first four NetId bytes, which matches the
/// common NetId-is-IP-plus-".1.1" convention; sites with asymmetric routes
/// can override it.
#[derive(Debug)]
pub(crate) struct TcpConnect {
    pub timeout: Duration,
    pub route: Option<SocketAddr>,
    pub source: Option<AmsAddr>,
}

static NEXT_AMS_PORT: AtomicU16 = AtomicU16::new(33000);

#[async_trait]
impl Connect for TcpConnect {
    async fn connect(
        &self,
        target: &AmsAddr,
        session_id: u64,
        epoch: u64,
    ) -> Result<Box<dyn Router>, AdsError> {
        let route = self.route.unwrap_or_else(|| {
            let [b0, b1, b2, b3, ..] = target.net_id;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(b0, b1, b2, b3)), ADS_TCP_PORT)
        });

        let connect_err = |reason: String| AdsError::Connection {
            target: target.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(route))
            .await
            .map_err(|_| connect_err(format!("no answer from {route} within {:?}", self.timeout)))?
            .map_err(|err| connect_err(err.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|err| connect_err(err.to_string()))?;

        let source = self.source.unwrap_or_else(|| local_ams_addr(&stream));
        debug!(%target, %source, %route, "ADS transport connected");

        Ok(Box::new(AmsRouter::start(
            stream,
            *target,
            source,
            self.timeout,
            session_id,
            epoch,
        )))
    }
}

fn local_ams_addr(stream: &TcpStream) -> AmsAddr {
    let net_id = match stream.local_addr().map(|addr| addr.ip()) {
        Ok(IpAddr::V4(ip)) => {
            let [b0, b1, b2, b3] = ip.octets();
            [b0, b1, b2, b3, 1, 1]
        }
        _ => [127, 0, 0, 1, 1, 1],
    };

    AmsAddr {
        net_id,
        port: NEXT_AMS_PORT.fetch_add(1, Ordering::Relaxed),
    }
}

enum RouterEvent {
    Samples(Vec<NotificationSample>),
    Lost,
}

type Pending = Arc<StdMutex<HashMap<u32, oneshot::Sender<(u32, Vec<u8>)>>>>;

/// One live AMS/TCP connection.
struct AmsRouter {
    target: AmsAddr,
    source: AmsAddr,
    timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    invoke: AtomicU32,
    closed: AtomicBool,
    reader_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl AmsRouter {
    fn start(
        stream: TcpStream,
        target: AmsAddr,
        source: AmsAddr,
        timeout: Duration,
        session_id: u64,
        epoch: u64,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(reader_loop(read_half, pending.clone(), event_tx));
        let dispatch_task = tokio::spawn(dispatch_loop(event_rx, session_id, epoch));

        AmsRouter {
            target,
            source,
            timeout,
            writer: Mutex::new(write_half),
            pending,
            invoke: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            reader_task,
            dispatch_task,
        }
    }

    async fn request(&self, command: u16, payload: Vec<u8>) -> Result<Vec<u8>, AdsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdsError::TransportClosed);
        }

        let invoke_id = self.invoke.fetch_add(1, Ordering::Relaxed);
        let header = AmsHeader {
            target: self.target,
            source: self.source,
            command,
            state_flags: STATE_ADS_REQUEST,
            error_code: 0,
            invoke_id,
        };
        let frame = envelope::frame(&header, &payload);

        let (response_tx, response_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(invoke_id, response_tx);
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await
        };
        if let Err(err) = sent {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&invoke_id);
            }
            return Err(AdsError::TransportSend {
                reason: err.to_string(),
            });
        }

        let response = tokio::time::timeout(self.timeout, response_rx).await;
        match response {
            Ok(Ok((error_code, data))) => {
                if error_code != 0 {
                    return Err(AdsError::device(error_code));
                }
                Ok(data)
            }
            Ok(Err(_)) => Err(AdsError::TransportClosed),
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&invoke_id);
                }
                Err(AdsError::Timeout {
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl Router for AmsRouter {
    async fn read_state(&self) -> Result<AdsState, AdsError> {
        let data = self.request(CMD_READ_STATE, Vec::new()).await?;
        let (ads_state, _device_state) = envelope::parse_state_response(&data)?;
        Ok(AdsState::from_raw(ads_state))
    }

    async fn resolve_handle(&self, name: &str) -> Result<u32, AdsError> {
        let payload = envelope::read_write_request(IDXGRP_SYM_HNDBYNAME, 0, 4, name.as_bytes());
        let data = self.request(CMD_READ_WRITE, payload).await?;
        let raw = envelope::parse_read_response(&data)?;
        if raw.len() < 4 {
            return Err(AdsError::frame("handle response shorter than 4 bytes"));
        }
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    async fn release_handle(&self, handle: u32) -> Result<(), AdsError> {
        let payload = envelope::write_request(IDXGRP_SYM_RELEASEHND, 0, &handle.to_le_bytes());
        let data = self.request(CMD_WRITE, payload).await?;
        envelope::parse_write_response(&data)
    }

    async fn symbol_info(&self, name: &str) -> Result<SymbolInfo, AdsError> {
        let payload = envelope::read_write_request(
            IDXGRP_SYM_INFOBYNAMEEX,
            0,
            SYMBOL_INFO_MAX,
            name.as_bytes(),
        );
        let data = self.request(CMD_READ_WRITE, payload).await?;
        let raw = envelope::parse_read_response(&data)?;
        envelope::parse_symbol_entry(&raw)
    }

    async fn read(&self, handle: u32, len: u32) -> Result<Vec<u8>, AdsError> {
        let payload = envelope::read_request(IDXGRP_SYM_VALBYHND, handle, len);
        let data = self.request(CMD_READ, payload).await?;
        envelope::parse_read_response(&data)
    }

    async fn write(&self, handle: u32, data: &[u8]) -> Result<(), AdsError> {
        let payload = envelope::write_request(IDXGRP_SYM_VALBYHND, handle, data);
        let response = self.request(CMD_WRITE, payload).await?;
        envelope::parse_write_response(&response)
    }

    async fn add_notification(
        &self,
        group: u32,
        offset: u32,
        attrib: &NotifyAttributes,
    ) -> Result<u32, AdsError> {
        let payload = envelope::add_notification_request(
            group,
            offset,
            attrib.size,
            attrib.trans_mode,
            attrib.max_delay_ms,
            attrib.cycle_ms,
        );
        let data = self.request(CMD_ADD_NOTIFICATION, payload).await?;
        envelope::parse_add_notification_response(&data)
    }

    async fn del_notification(&self, handle: u32) -> Result<(), AdsError> {
        let payload = envelope::del_notification_request(handle);
        let data = self.request(CMD_DEL_NOTIFICATION, payload).await?;
        envelope::parse_write_response(&data)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader_task.abort();
        self.dispatch_task.abort();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for AmsRouter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    pending: Pending,
    event_tx: mpsc::UnboundedSender<RouterEvent>,
) {
    loop {
        let mut tcp_header = [0u8; 6];
        if read_half.read_exact(&mut tcp_header).await.is_err() {
            break;
        }

        let len = u32::from_le_bytes([tcp_header[2], tcp_header[3], tcp_header[4], tcp_header[5]])
            as usize;
        if len < 32 {
            warn!(len, "short AMS packet, dropping connection");
            break;
        }

        let mut packet = vec![0u8; len];
        if read_half.read_exact(&mut packet).await.is_err() {
            break;
        }

        let (header, payload) = match envelope::parse_packet(&packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "unparseable AMS packet, dropping connection");
                break;
            }
        };

        if header.command == CMD_NOTIFICATION {
            match envelope::parse_notification_stream(payload) {
                Ok(samples) => {
                    let _ = event_tx.send(RouterEvent::Samples(samples));
                }
                Err(err) => warn!(%err, "unparseable notification stream"),
            }
            continue;
        }

        let waiter = pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&header.invoke_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send((header.error_code, payload.to_vec()));
            }
            None => debug!(invoke_id = header.invoke_id, "response with no waiter"),
        }
    }

    // Wake every in-flight request, then let the session know.
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    let _ = event_tx.send(RouterEvent::Lost);
}

async fn dispatch_loop(
    mut event_rx: mpsc::UnboundedReceiver<RouterEvent>,
    session_id: u64,
    epoch: u64,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            RouterEvent::Samples(samples) => {
                let Some(session) = registry::lookup(session_id) else {
                    continue;
                };
                for sample in samples {
                    session.on_notification(sample).await;
                }
            }
            RouterEvent::Lost => {
                if let Some(session) = registry::lookup(session_id) {
                    session.on_transport_lost(epoch).await;
                }
                break;
            }
        }
    }
}
