//! Standard BLE device-information characteristics.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::ConnectionMessageType;
use crate::reader::{self, ByteReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnpSource {
    Bluetooth,
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnpId {
    pub source: PnpSource,
    /// Only meaningful for Bluetooth SIG vendor ids; 0 otherwise.
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_version: u16,
}

impl PnpId {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload, "pnpId");
        let source = if r.u8()? == 1 {
            PnpSource::Bluetooth
        } else {
            PnpSource::Usb
        };
        let vendor = r.u16_le()?;
        let product_id = r.u16_le()?;
        let product_version = r.u16_le()?;
        Ok(Self {
            source,
            vendor_id: if source == PnpSource::Bluetooth { vendor } else { 0 },
            product_id,
            product_version,
        })
    }
}

/// Complete device-information record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInformation {
    pub manufacturer_name: String,
    pub model_number: String,
    pub software_revision: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub pnp_id: PnpId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// Accumulates characteristics until the record is complete.
#[derive(Debug, Default, Clone)]
pub struct DeviceInformationBuilder {
    manufacturer_name: Option<String>,
    model_number: Option<String>,
    software_revision: Option<String>,
    hardware_revision: Option<String>,
    firmware_revision: Option<String>,
    pnp_id: Option<PnpId>,
    serial_number: Option<String>,
}

impl DeviceInformationBuilder {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record one characteristic. Returns `Ok(false)` for message types that
    /// are not device information.
    pub fn update(&mut self, kind: ConnectionMessageType, payload: &[u8]) -> Result<bool, Error> {
        let text = || reader::utf8(payload, "device information");
        match kind {
            ConnectionMessageType::ManufacturerName => self.manufacturer_name = Some(text()?),
            ConnectionMessageType::ModelNumber => self.model_number = Some(text()?),
            ConnectionMessageType::SoftwareRevision => self.software_revision = Some(text()?),
            ConnectionMessageType::HardwareRevision => self.hardware_revision = Some(text()?),
            ConnectionMessageType::FirmwareRevision => self.firmware_revision = Some(text()?),
            ConnectionMessageType::PnpId => self.pnp_id = Some(PnpId::parse(payload)?),
            ConnectionMessageType::SerialNumber => self.serial_number = Some(text()?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// The full record, once every required characteristic has arrived.
    pub fn complete(&self) -> Option<DeviceInformation> {
        Some(DeviceInformation {
            manufacturer_name: self.manufacturer_name.clone()?,
            model_number: self.model_number.clone()?,
            software_revision: self.software_revision.clone()?,
            hardware_revision: self.hardware_revision.clone()?,
            firmware_revision: self.firmware_revision.clone()?,
            pnp_id: self.pnp_id?,
            serial_number: self.serial_number.clone(),
        })
    }
}

pub fn parse_battery_level(payload: &[u8]) -> Result<u8, Error> {
    ByteReader::new(payload, "batteryLevel").u8()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pnp_id_vendor_only_for_bluetooth() {
        let raw = [1, 0x59, 0x00, 0x34, 0x12, 0x01, 0x00];
        let pnp = PnpId::parse(&raw).unwrap();
        assert_eq!(pnp.source, PnpSource::Bluetooth);
        assert_eq!(pnp.vendor_id, 0x59);
        assert_eq!(pnp.product_id, 0x1234);
        assert_eq!(pnp.product_version, 1);

        let raw = [2, 0x59, 0x00, 0x34, 0x12, 0x01, 0x00];
        assert_eq!(PnpId::parse(&raw).unwrap().vendor_id, 0);
    }

    #[test]
    fn completes_without_serial_number() {
        let mut b = DeviceInformationBuilder::default();
        for kind in [
            ConnectionMessageType::ManufacturerName,
            ConnectionMessageType::ModelNumber,
            ConnectionMessageType::SoftwareRevision,
            ConnectionMessageType::HardwareRevision,
        ] {
            assert!(b.update(kind, b"x").unwrap());
        }
        assert!(b.complete().is_none());
        b.update(ConnectionMessageType::FirmwareRevision, b"1.2.3").unwrap();
        b.update(ConnectionMessageType::PnpId, &[1, 0, 0, 0, 0, 0, 0]).unwrap();
        let info = b.complete().unwrap();
        assert_eq!(info.firmware_revision, "1.2.3");
        assert!(info.serial_number.is_none());
        assert!(!b.update(ConnectionMessageType::Rx, &[]).unwrap());
    }
}
