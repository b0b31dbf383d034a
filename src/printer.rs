//! Print job delivery over BLE.
//!
//! A [`Session`] walks `Idle -> Discovering -> Connected -> Sending ->
//! AwaitingCompletion -> Closed`, or drops into `Failed` from any of them.
//! The radio itself sits behind [`BleDriver`] so the state machine can be
//! driven by a fake device in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::error::{PrintError, Result};
use crate::job::PrintJob;
use crate::protocol::parse_frame;

/// Write characteristic for the command stream.
pub const TX_CHARACTERISTIC: Uuid = uuid_from_u16(0xAE01);
/// Notify characteristic the printer reports on.
pub const RX_CHARACTERISTIC: Uuid = uuid_from_u16(0xAE02);
/// The printer service. Some hosts report it as 0xAE30, others as 0xAF30.
pub const SERVICE_UUIDS: [Uuid; 2] = [uuid_from_u16(0xAE30), uuid_from_u16(0xAF30)];
/// Notification sent once the print head has finished.
pub const PRINTER_READY: [u8; 9] = [0x51, 0x78, 0xAE, 0x01, 0x01, 0x00, 0x00, 0x00, 0xFF];

/// ATT header bytes taken out of every write.
const ATT_OVERHEAD: usize = 3;

pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// What a scan saw for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

/// Selects devices during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Advertised name must match exactly.
    Name(String),
    /// Any of these service UUIDs must be advertised.
    Services(Vec<Uuid>),
}

impl DeviceFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        match self {
            DeviceFilter::Name(name) => adv.name.as_deref() == Some(name.as_str()),
            DeviceFilter::Services(wanted) => adv.services.iter().any(|s| wanted.contains(s)),
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::Name(name) => write!(f, "a device named {name}"),
            DeviceFilter::Services(_) => f.write_str("a device advertising the printer service"),
        }
    }
}

/// Which printer to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    /// MAC address (Linux, Windows) or UUID (macOS); used without scanning.
    Address(String),
    /// Advertised name such as `GT01` or `GB02`.
    Name(String),
    /// First device advertising the printer service.
    Auto,
}

impl DeviceTarget {
    pub fn parse(device: Option<&str>) -> Self {
        match device.map(str::trim) {
            None | Some("") => DeviceTarget::Auto,
            Some(s) if is_mac_address(s) || is_uuid(s) => DeviceTarget::Address(s.to_string()),
            Some(s) => DeviceTarget::Name(s.to_string()),
        }
    }
}

/// `XX:XX:XX:XX:XX:XX`
pub fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Hyphenated UUID, as macOS reports peripheral ids.
pub fn is_uuid(s: &str) -> bool {
    s.len() == 36 && Uuid::try_parse(s).is_ok()
}

/// Radio primitives a [`Session`] needs.
#[async_trait]
pub trait BleDriver: Send {
    /// Scans until an advertisement matches. The caller bounds the wait.
    async fn scan(&mut self, filter: &DeviceFilter) -> Result<Advertisement>;
    async fn connect(&mut self, address: &str) -> Result<()>;
    /// Negotiated ATT MTU of the current connection.
    async fn mtu(&mut self) -> Result<u16>;
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<NotificationStream>;
    async fn write(&mut self, characteristic: Uuid, chunk: &[u8]) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pause after every chunk so the printer's receive buffer keeps up.
    pub chunk_delay: Duration,
    pub completion_timeout: Duration,
    pub tx_characteristic: Uuid,
    pub rx_characteristic: Uuid,
    pub service_uuids: Vec<Uuid>,
    pub ready_notification: Vec<u8>,
    /// Sub-protocol byte put in front of every chunk, if the device wants one.
    pub chunk_prefix: Option<u8>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            chunk_delay: Duration::from_millis(20),
            completion_timeout: Duration::from_secs(30),
            tx_characteristic: TX_CHARACTERISTIC,
            rx_characteristic: RX_CHARACTERISTIC,
            service_uuids: SERVICE_UUIDS.to_vec(),
            ready_notification: PRINTER_READY.to_vec(),
            chunk_prefix: None,
        }
    }
}

impl TransportConfig {
    /// Job bytes per write for a given MTU, `None` if nothing fits.
    pub fn chunk_size(&self, mtu: u16) -> Option<usize> {
        let overhead = ATT_OVERHEAD + self.chunk_prefix.map_or(0, |_| 1);
        (mtu as usize).checked_sub(overhead).filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Connected,
    Sending,
    AwaitingCompletion,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a delivered job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The printer reported it finished.
    Confirmed,
    /// Every byte was sent but the printer never confirmed.
    Unconfirmed { waited: Duration },
}

impl Completion {
    /// Treats a missing confirmation as [`PrintError::CompletionTimeout`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Completion::Confirmed => Ok(()),
            Completion::Unconfirmed { waited } => Err(PrintError::CompletionTimeout(waited)),
        }
    }
}

/// Fires once the ready notification shows up.
struct ReadySignal {
    rx: oneshot::Receiver<()>,
    task: JoinHandle<()>,
}

impl ReadySignal {
    fn watch(mut notifications: NotificationStream, ready: Vec<u8>) -> Self {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            while let Some(value) = notifications.next().await {
                match parse_frame(&value) {
                    Ok(frame) => debug!(
                        target: "transport",
                        "notification {:#04x}: {:02x?}", frame.command_id, frame.payload
                    ),
                    Err(_) => debug!(target: "transport", "notification {:02x?}", value),
                }
                if value == ready {
                    let _ = tx.send(());
                    return;
                }
            }
        });
        Self { rx, task }
    }
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One print job's trip to the printer. Not reusable.
pub struct Session<D: BleDriver> {
    driver: D,
    config: TransportConfig,
    state: SessionState,
    address: Option<String>,
    connected: bool,
}

impl<D: BleDriver> Session<D> {
    pub fn new(driver: D, config: TransportConfig) -> Self {
        Self {
            driver,
            config,
            state: SessionState::Idle,
            address: None,
            connected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn transition(&mut self, next: SessionState) {
        debug!(target: "transport", "{} -> {}", self.state, next);
        self.state = next;
    }

    /// Discovers and delivers in one go.
    pub async fn run(mut self, target: &DeviceTarget, job: &PrintJob) -> Result<Completion> {
        self.discover(target).await?;
        self.deliver(job).await
    }

    /// Resolves `target` to an address. Dropping this future cancels the job
    /// without touching the printer.
    pub async fn discover(&mut self, target: &DeviceTarget) -> Result<String> {
        if self.state != SessionState::Idle {
            return Err(PrintError::ConnectionFailed(format!(
                "session is {}, not idle",
                self.state
            )));
        }
        self.transition(SessionState::Discovering);
        match self.resolve(target).await {
            Ok(address) => {
                self.address = Some(address.clone());
                Ok(address)
            }
            Err(e) => {
                error!(target: "transport", "{}", e);
                self.release().await;
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn resolve(&mut self, target: &DeviceTarget) -> Result<String> {
        let filter = match target {
            DeviceTarget::Address(address) => {
                info!(target: "transport", "using address {}", address);
                return Ok(address.clone());
            }
            DeviceTarget::Name(name) => DeviceFilter::Name(name.clone()),
            DeviceTarget::Auto => DeviceFilter::Services(self.config.service_uuids.clone()),
        };

        info!(target: "transport", "looking for {}...", filter);
        match time::timeout(self.config.scan_timeout, self.driver.scan(&filter)).await {
            Ok(Ok(adv)) => {
                info!(target: "transport", "got it, address {} ({:?})", adv.address, adv.name);
                Ok(adv.address)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PrintError::DeviceNotFound),
        }
    }

    /// Connects, sends the whole job and waits for the printer to finish.
    ///
    /// The connection is released on every path out of here. A failed write
    /// is not retried, since the printer cannot resume a half-sent job.
    pub async fn deliver(&mut self, job: &PrintJob) -> Result<Completion> {
        let address = match (&self.address, self.state) {
            (Some(address), SessionState::Discovering) => address.clone(),
            _ => {
                return Err(PrintError::ConnectionFailed(format!(
                    "session is {}, nothing to deliver to",
                    self.state
                )))
            }
        };

        let result = self.connect_and_send(&address, job).await;
        self.release().await;
        match result {
            Ok(completion) => {
                self.transition(SessionState::Closed);
                Ok(completion)
            }
            Err(e) => {
                error!(target: "transport", "{}", e);
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn connect_and_send(&mut self, address: &str, job: &PrintJob) -> Result<Completion> {
        info!(target: "transport", "connecting to {}...", address);
        self.connected = true;
        match time::timeout(self.config.connect_timeout, self.driver.connect(address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(connection_failed(e)),
            Err(_) => {
                return Err(PrintError::ConnectionFailed(format!(
                    "no answer from {} after {:?}",
                    address, self.config.connect_timeout
                )))
            }
        }
        self.transition(SessionState::Connected);

        let mtu = self.driver.mtu().await?;
        let chunk_size = self
            .config
            .chunk_size(mtu)
            .ok_or_else(|| PrintError::ConnectionFailed(format!("MTU {} is too small", mtu)))?;
        info!(target: "transport", "connected, MTU {}", mtu);

        // must be listening before the first byte goes out
        let notifications = self.driver.subscribe(self.config.rx_characteristic).await?;
        let mut ready = ReadySignal::watch(notifications, self.config.ready_notification.clone());

        self.transition(SessionState::Sending);
        self.send_chunks(job.as_bytes(), chunk_size).await?;

        self.transition(SessionState::AwaitingCompletion);
        Ok(self.await_completion(&mut ready).await)
    }

    async fn send_chunks(&mut self, data: &[u8], chunk_size: usize) -> Result<()> {
        let total = data.len().div_ceil(chunk_size);
        info!(
            target: "transport",
            "sending {} bytes of data in {} chunks of {} bytes...", data.len(), total, chunk_size
        );
        let tx = self.config.tx_characteristic;
        let mut framed = Vec::with_capacity(chunk_size + 1);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let payload = match self.config.chunk_prefix {
                Some(prefix) => {
                    framed.clear();
                    framed.push(prefix);
                    framed.extend_from_slice(chunk);
                    framed.as_slice()
                }
                None => chunk,
            };
            if let Err(e) = self.driver.write(tx, payload).await {
                error!(target: "transport", "write of chunk {}/{} failed", i + 1, total);
                return Err(e);
            }
            time::sleep(self.config.chunk_delay).await;
        }
        info!(target: "transport", "all data sent");
        Ok(())
    }

    async fn await_completion(&mut self, ready: &mut ReadySignal) -> Completion {
        let started = Instant::now();
        match time::timeout(self.config.completion_timeout, &mut ready.rx).await {
            Ok(Ok(())) => {
                info!(target: "transport", "printer reported it is done");
                Completion::Confirmed
            }
            Ok(Err(_)) => {
                warn!(target: "transport", "notifications ended before the printer reported done");
                Completion::Unconfirmed {
                    waited: started.elapsed(),
                }
            }
            Err(_) => {
                warn!(
                    target: "transport",
                    "timed out after {:?} waiting for the printer to finish",
                    self.config.completion_timeout
                );
                Completion::Unconfirmed {
                    waited: self.config.completion_timeout,
                }
            }
        }
    }

    async fn release(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        match self.driver.disconnect().await {
            Ok(()) => debug!(target: "transport", "disconnected"),
            Err(e) => warn!(target: "transport", "disconnect failed: {}", e),
        }
    }
}

fn connection_failed(e: PrintError) -> PrintError {
    match e {
        PrintError::ConnectionFailed(_) => e,
        other => PrintError::ConnectionFailed(other.to_string()),
    }
}
