use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Manager, Peripheral},
};
use bytes::{Buf, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::{io, pin::Pin, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::Result,
    transport::{ChannelError, Connector, Link},
};

/// Nordic UART service carrying the serial stream
pub const SERIAL_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic the host writes to
pub const SERIAL_RX_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic the device notifies on
pub const SERIAL_TX_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

/// The serial service exposes a single logical channel
pub const BLE_CHANNEL: u8 = 1;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn ble_error(err: btleplug::Error) -> ChannelError {
    ChannelError::Os(io::Error::other(err))
}

fn parse_uuid(value: &str) -> std::result::Result<Uuid, ChannelError> {
    Uuid::parse_str(value).map_err(|e| {
        ChannelError::Os(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid UUID {value}: {e}"),
        ))
    })
}

/// Connector for monitors streaming over a serial-over-GATT service
pub struct BleConnector {
    manager: Manager,
    scan_timeout: Duration,
}

impl BleConnector {
    /// Create a connector using the system Bluetooth adapters
    ///
    /// # Errors
    ///
    /// Returns [`crate::HrError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(scan_timeout_ms: u64) -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            scan_timeout: Duration::from_millis(scan_timeout_ms),
        })
    }

    async fn find_peripheral(
        &self,
        address: BDAddr,
        service: Uuid,
    ) -> btleplug::Result<Option<Peripheral>> {
        for central in self.manager.adapters().await? {
            central
                .start_scan(ScanFilter {
                    services: vec![service],
                })
                .await?;
            tokio::time::sleep(self.scan_timeout).await;
            central.stop_scan().await?;

            for peripheral in central.peripherals().await? {
                if peripheral.address() == address {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn open(
        &self,
        address: &str,
        channel: u8,
    ) -> std::result::Result<Box<dyn Link>, ChannelError> {
        if channel != BLE_CHANNEL {
            return Err(ChannelError::Unavailable(format!(
                "serial service has no channel {channel}"
            )));
        }

        let address: BDAddr = address.parse().map_err(|e| {
            ChannelError::Os(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid Bluetooth address {address}: {e}"),
            ))
        })?;
        let service = parse_uuid(SERIAL_SERVICE_UUID)?;
        let rx_uuid = parse_uuid(SERIAL_RX_CHAR_UUID)?;
        let tx_uuid = parse_uuid(SERIAL_TX_CHAR_UUID)?;

        let peripheral = self
            .find_peripheral(address, service)
            .await
            .map_err(ble_error)?
            .ok_or(ChannelError::Refused)?;

        peripheral
            .connect()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        peripheral.discover_services().await.map_err(ble_error)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| -> std::result::Result<Characteristic, ChannelError> {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| ChannelError::Unavailable(format!("characteristic {uuid} missing")))
        };
        let rx_char = find(rx_uuid)?;
        let tx_char = find(tx_uuid)?;

        peripheral.subscribe(&tx_char).await.map_err(ble_error)?;
        let notifications = peripheral.notifications().await.map_err(ble_error)?;

        info!("Subscribed to serial notifications from {}", address);

        Ok(Box::new(BleLink {
            peripheral,
            rx_char,
            tx_uuid,
            notifications,
            pending: BytesMut::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "ble"
    }
}

/// Serial stream carried by GATT notifications
pub struct BleLink {
    peripheral: Peripheral,
    rx_char: Characteristic,
    tx_uuid: Uuid,
    notifications: NotificationStream,
    pending: BytesMut,
}

#[async_trait]
impl Link for BleLink {
    async fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.notifications.next().await {
                Some(notification) if notification.uuid == self.tx_uuid => {
                    self.pending.extend_from_slice(&notification.value);
                }
                Some(_) => {}
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        debug!("Sending {:02X?}", data);
        self.peripheral
            .write(&self.rx_char, data, WriteType::WithoutResponse)
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.peripheral.disconnect().await.map_err(io::Error::other)
    }
}
