//! [`BleDriver`] on top of btleplug.

use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PrintError, Result};
use crate::printer::{Advertisement, BleDriver, DeviceFilter, NotificationStream};

/// Runs the scan's stop future when finished, or from a spawned task if
/// the scan is dropped halfway (a timed out `connect`, Ctrl-C).
struct ScanGuard {
    stop: Option<BoxFuture<'static, ()>>,
}

impl ScanGuard {
    fn new(stop: BoxFuture<'static, ()>) -> Self {
        Self { stop: Some(stop) }
    }

    async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.await;
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(stop);
            }
            Err(_) => warn!(target: "ble", "scan abandoned outside a runtime, adapter may keep scanning"),
        }
    }
}

/// btleplug does not expose the negotiated MTU, so the driver reports this
/// one. 183 leaves 180 byte chunks, which every printer seen so far accepts.
pub const DEFAULT_MTU: u16 = 183;

pub struct BtleplugDriver {
    adapter: Adapter,
    /// Everything seen while scanning, by address.
    seen: HashMap<String, Peripheral>,
    peripheral: Option<Peripheral>,
    characteristics: Vec<Characteristic>,
    mtu: u16,
    write_type: WriteType,
}

impl BtleplugDriver {
    /// Opens the `adapter_index`th bluetooth adapter.
    pub async fn new(adapter_index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| PrintError::ConnectionFailed("no BLE adapters present".into()))?;
        debug!(target: "ble", "using adapter {}", adapter_index);
        Ok(Self {
            adapter,
            seen: HashMap::new(),
            peripheral: None,
            characteristics: Vec::new(),
            mtu: DEFAULT_MTU,
            write_type: WriteType::WithoutResponse,
        })
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    async fn advertisement(peripheral: &Peripheral) -> Result<Option<Advertisement>> {
        let Some(props) = peripheral.properties().await? else {
            return Ok(None);
        };
        // macOS hides the MAC, the peripheral id is a UUID there
        let address = if props.address == BDAddr::default() {
            peripheral.id().to_string()
        } else {
            props.address.to_string()
        };
        Ok(Some(Advertisement {
            address,
            name: props.local_name,
            services: props.services,
        }))
    }

    async fn inspect(
        &mut self,
        peripheral: Peripheral,
        accept: &(dyn Fn(&Advertisement) -> bool + Send + Sync),
    ) -> Result<Option<(Advertisement, Peripheral)>> {
        let Some(adv) = Self::advertisement(&peripheral).await? else {
            return Ok(None);
        };
        debug!(target: "ble", "saw {} {:?} {:?}", adv.address, adv.name, adv.services);
        self.seen.insert(adv.address.clone(), peripheral.clone());
        Ok(accept(&adv).then_some((adv, peripheral)))
    }

    /// Scans until a peripheral satisfies `accept`.
    async fn find(
        &mut self,
        accept: &(dyn Fn(&Advertisement) -> bool + Send + Sync),
    ) -> Result<(Advertisement, Peripheral)> {
        let mut events: BoxStream<'static, CentralEvent> = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        let adapter = self.adapter.clone();
        let scan = ScanGuard::new(
            async move {
                if let Err(e) = adapter.stop_scan().await {
                    warn!(target: "ble", "failed to stop scan: {}", e);
                }
            }
            .boxed(),
        );

        let result: Result<(Advertisement, Peripheral)> = async {
            for peripheral in self.adapter.peripherals().await? {
                if let Some(found) = self.inspect(peripheral, accept).await? {
                    return Ok(found);
                }
            }
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let peripheral = self.adapter.peripheral(&id).await?;
                if let Some(found) = self.inspect(peripheral, accept).await? {
                    return Ok(found);
                }
            }
            Err(PrintError::DeviceNotFound)
        }
        .await;

        scan.finish().await;
        result
    }

    fn connected(&self) -> Result<&Peripheral> {
        self.peripheral
            .as_ref()
            .ok_or_else(|| PrintError::ConnectionFailed("not connected".into()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| PrintError::ConnectionFailed(format!("characteristic {} not found", uuid)))
    }
}

#[async_trait]
impl BleDriver for BtleplugDriver {
    async fn scan(&mut self, filter: &DeviceFilter) -> Result<Advertisement> {
        let (adv, _) = self.find(&|adv: &Advertisement| filter.matches(adv)).await?;
        Ok(adv)
    }

    async fn connect(&mut self, address: &str) -> Result<()> {
        let peripheral = match self.seen.get(address) {
            Some(peripheral) => peripheral.clone(),
            None => {
                // literal address nobody scanned for yet
                let wanted = address.to_string();
                let (_, peripheral) = self
                    .find(&move |adv: &Advertisement| adv.address.eq_ignore_ascii_case(&wanted))
                    .await?;
                peripheral
            }
        };

        peripheral.connect().await?;
        // from here on disconnect() has a link to tear down, even if
        // discovery fails or the caller gives up
        self.peripheral = Some(peripheral.clone());
        peripheral.discover_services().await?;
        self.characteristics = peripheral.characteristics().into_iter().collect();
        debug!(target: "ble", "{} characteristics", self.characteristics.len());
        info!(target: "ble", "connected to {}", address);
        Ok(())
    }

    async fn mtu(&mut self) -> Result<u16> {
        self.connected()?;
        Ok(self.mtu)
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<NotificationStream> {
        let peripheral = self.connected()?;
        let target = self.characteristic(characteristic)?;
        // the stream must exist before the subscription goes live
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(target).await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn write(&mut self, characteristic: Uuid, chunk: &[u8]) -> Result<()> {
        let peripheral = self.connected()?;
        let target = self.characteristic(characteristic)?;
        peripheral.write(target, chunk, self.write_type).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.characteristics.clear();
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}
