//! Firmware images: mcuboot header validation and SMP image-state parsing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::Display;

use crate::cbor::CborValue;
use crate::error::Error;

const IMAGE_MAGIC: [u8; 4] = [0x3D, 0xB8, 0xF3, 0x96];
const MIN_IMAGE_LEN: usize = 32;

/// Summary of a validated mcuboot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub header_size: u16,
    pub image_size: u32,
    pub version: String,
    /// SHA-256 over the header and image body (`image_size + 32` bytes).
    pub hash: [u8; 32],
}

impl ImageInfo {
    pub fn parse(image: &[u8]) -> Result<Self, Error> {
        if image.len() < MIN_IMAGE_LEN {
            return Err(Error::InvalidImage("too short file"));
        }
        if image[0..4] != IMAGE_MAGIC {
            return Err(Error::InvalidImage("wrong magic bytes"));
        }
        if image[4..8] != [0; 4] {
            return Err(Error::InvalidImage("wrong load address"));
        }

        let header_size = u16::from_le_bytes([image[8], image[9]]);

        if image[10..12] != [0; 2] {
            return Err(Error::InvalidImage("wrong protected TLV area size"));
        }

        let image_size = u32::from_le_bytes([image[12], image[13], image[14], image[15]]);
        let body_len = usize::try_from(image_size).map_err(|_| Error::InvalidImage("wrong image size"))?;
        if image.len() < body_len + usize::from(header_size) {
            return Err(Error::InvalidImage("wrong image size"));
        }

        if image[16..20] != [0; 4] {
            return Err(Error::InvalidImage("wrong flags"));
        }

        let revision = u16::from_le_bytes([image[22], image[23]]);
        let version = format!("{}.{}.{revision}", image[20], image[21]);

        let hashed = image.len().min(body_len + MIN_IMAGE_LEN);
        let hash: [u8; 32] = Sha256::digest(&image[..hashed]).into();

        Ok(Self {
            header_size,
            image_size,
            version,
            hash,
        })
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// SHA-256 of a whole upload, sent with the first `IMAGE/UPLOAD` chunk.
pub fn upload_sha256(image: &[u8]) -> [u8; 32] {
    Sha256::digest(image).into()
}

// ── Image slots ─────────────────────────────────────────────────────

/// One image slot as reported by `IMAGE/STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub slot: u8,
    pub active: bool,
    pub confirmed: bool,
    pub pending: bool,
    pub permanent: bool,
    pub bootable: bool,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub hash: Option<Vec<u8>>,
    #[serde(default)]
    pub empty: bool,
}

impl FirmwareImage {
    /// Stand-in for slot 1 when the device only reports one image.
    pub fn empty_slot() -> Self {
        Self {
            slot: 1,
            active: false,
            confirmed: false,
            pending: false,
            permanent: false,
            bootable: false,
            version: "Empty".to_owned(),
            hash: None,
            empty: true,
        }
    }

    fn from_cbor(value: &CborValue) -> Result<Self, Error> {
        let flag = |key: &str| value.get(key).and_then(CborValue::as_bool).unwrap_or(false);
        let slot = value
            .get("slot")
            .and_then(CborValue::as_u64)
            .and_then(|s| u8::try_from(s).ok())
            .ok_or_else(|| Error::Smp("image entry without slot".into()))?;
        let version = value
            .get("version")
            .and_then(CborValue::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(Self {
            slot,
            active: flag("active"),
            confirmed: flag("confirmed"),
            pending: flag("pending"),
            permanent: flag("permanent"),
            bootable: flag("bootable"),
            version,
            hash: value.get("hash").and_then(CborValue::as_bytes).map(<[u8]>::to_vec),
            empty: false,
        })
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Coarse firmware-update state derived from the image slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FirmwareStatus {
    #[default]
    Idle,
    Uploading,
    Uploaded,
    Pending,
    Testing,
    Erasing,
}

/// Parse the `images` array of an `IMAGE/STATE` response.
///
/// Returns `None` when the response carries no image list.
pub fn parse_image_state(body: &CborValue) -> Result<Option<Vec<FirmwareImage>>, Error> {
    let Some(entries) = body.get("images") else {
        return Ok(None);
    };
    let entries = entries
        .as_array()
        .ok_or_else(|| Error::Smp("images is not an array".into()))?;
    entries
        .iter()
        .map(FirmwareImage::from_cbor)
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Derive the status from a freshly read slot list, padding a single slot
/// with the empty placeholder.
pub fn reconcile_images(images: &mut Vec<FirmwareImage>) -> FirmwareStatus {
    let mut status = FirmwareStatus::Idle;

    if let [slot0, slot1] = images.as_slice() {
        if !slot1.bootable {
            tracing::warn!("slot 1 holds an invalid image; erase it or upload a different one");
        } else if !slot0.confirmed {
            status = FirmwareStatus::Testing;
        } else if slot1.pending {
            status = FirmwareStatus::Pending;
        } else {
            status = FirmwareStatus::Uploaded;
        }
    }

    if images.len() == 1 {
        images.push(FirmwareImage::empty_slot());
    }

    status
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_image(body_len: u32) -> Vec<u8> {
        let header_size: u16 = 32;
        let mut image = vec![0u8; 32];
        image[0..4].copy_from_slice(&IMAGE_MAGIC);
        image[8..10].copy_from_slice(&header_size.to_le_bytes());
        image[12..16].copy_from_slice(&body_len.to_le_bytes());
        image[20] = 1;
        image[21] = 4;
        image[22..24].copy_from_slice(&300u16.to_le_bytes());
        image.extend((0..body_len).map(|i| u8::try_from(i % 256).unwrap()));
        image
    }

    #[test]
    fn parses_valid_header() {
        let image = sample_image(100);
        let info = ImageInfo::parse(&image).unwrap();
        assert_eq!(info.version, "1.4.300");
        assert_eq!(info.image_size, 100);
        assert_eq!(info.header_size, 32);
        let expected: [u8; 32] = Sha256::digest(&image[..132]).into();
        assert_eq!(info.hash, expected);
        assert_eq!(info.hash_hex().len(), 64);
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(
            ImageInfo::parse(&[0u8; 31]),
            Err(Error::InvalidImage("too short file"))
        ));

        let mut image = sample_image(10);
        image[0] = 0;
        assert!(matches!(ImageInfo::parse(&image), Err(Error::InvalidImage("wrong magic bytes"))));

        let mut image = sample_image(10);
        image[5] = 1;
        assert!(matches!(ImageInfo::parse(&image), Err(Error::InvalidImage("wrong load address"))));

        let mut image = sample_image(10);
        image[16] = 1;
        assert!(matches!(ImageInfo::parse(&image), Err(Error::InvalidImage("wrong flags"))));

        let mut image = sample_image(10);
        image.truncate(40);
        assert!(matches!(ImageInfo::parse(&image), Err(Error::InvalidImage("wrong image size"))));
    }

    fn slot(slot: u8, confirmed: bool, pending: bool, bootable: bool) -> CborValue {
        CborValue::map([
            ("slot", CborValue::Unsigned(u64::from(slot))),
            ("version", CborValue::Text("1.0.0".into())),
            ("hash", CborValue::Bytes(vec![slot; 32])),
            ("bootable", CborValue::Bool(bootable)),
            ("pending", CborValue::Bool(pending)),
            ("confirmed", CborValue::Bool(confirmed)),
            ("active", CborValue::Bool(slot == 0)),
            ("permanent", CborValue::Bool(false)),
        ])
    }

    fn state(slots: Vec<CborValue>) -> Vec<FirmwareImage> {
        let body = CborValue::map([("images", CborValue::Array(slots))]);
        parse_image_state(&body).unwrap().unwrap()
    }

    #[test]
    fn derives_status_from_two_slots() {
        let mut images = state(vec![slot(0, true, false, true), slot(1, false, false, false)]);
        assert_eq!(reconcile_images(&mut images), FirmwareStatus::Idle);

        let mut images = state(vec![slot(0, false, false, true), slot(1, false, false, true)]);
        assert_eq!(reconcile_images(&mut images), FirmwareStatus::Testing);

        let mut images = state(vec![slot(0, true, false, true), slot(1, false, true, true)]);
        assert_eq!(reconcile_images(&mut images), FirmwareStatus::Pending);

        let mut images = state(vec![slot(0, true, false, true), slot(1, false, false, true)]);
        assert_eq!(reconcile_images(&mut images), FirmwareStatus::Uploaded);
    }

    #[test]
    fn single_slot_gets_placeholder() {
        let mut images = state(vec![slot(0, true, false, true)]);
        assert_eq!(reconcile_images(&mut images), FirmwareStatus::Idle);
        assert_eq!(images.len(), 2);
        assert!(images[1].empty);
        assert_eq!(images[1].version, "Empty");
    }

    #[test]
    fn missing_images_key_is_none() {
        assert!(parse_image_state(&CborValue::Map(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn image_serializes_hash_as_hex() {
        let images = state(vec![slot(0, true, false, true)]);
        let json = serde_json::to_value(&images[0]).unwrap();
        assert_eq!(json["hash"], "00".repeat(32));
    }
}
