//! Deterministic snapshot encoding for emulated chipset devices.
//!
//! The snapshot format is a small tag-length-value (TLV) encoding chosen for:
//! - deterministic byte output (fields are emitted in ascending tag order)
//! - forward compatibility (unknown tags are skipped on load)
//! - explicit versioning (major/minor) at the device level
//!
//! Field ordering matters for cross-version compatibility: a device must keep
//! the meaning of an existing tag stable forever and only add new tags within
//! the same major version.

#![forbid(unsafe_code)]

use thiserror::Error;

const SNAPSHOT_MAGIC: [u8; 4] = *b"PCXS";

/// Device snapshot version, encoded into every blob header.
///
/// A loader accepts any blob whose major version matches its own; minor
/// version bumps are additive-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot blob truncated")]
    Truncated,
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    WrongDevice { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported snapshot major version {found} (loader is {supported})")]
    UnsupportedMajor { supported: u16, found: u16 },
    #[error("missing required snapshot field {0:#06x}")]
    MissingField(u16),
    #[error("snapshot field {tag:#06x} has length {found}, expected {expected}")]
    WrongFieldSize { tag: u16, expected: usize, found: usize },
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshotting contract for emulated devices.
///
/// Implementations must keep `DEVICE_ID` stable forever. `save_state` must be
/// a pure function of device state so identical states produce identical
/// bytes.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

/// TLV writer. Tags must be emitted in strictly ascending order; this is
/// asserted in debug builds to keep snapshots canonical.
pub struct SnapshotWriter {
    buf: Vec<u8>,
    last_tag: Option<u16>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self {
            buf,
            last_tag: None,
        }
    }

    fn field(&mut self, tag: u16, payload: &[u8]) {
        if let Some(last) = self.last_tag {
            debug_assert!(tag > last, "snapshot tags must be ascending");
        }
        self.last_tag = Some(tag);
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn put_u8(&mut self, tag: u16, value: u8) {
        self.field(tag, &[value]);
    }

    pub fn put_bool(&mut self, tag: u16, value: bool) {
        self.put_u8(tag, value as u8);
    }

    pub fn put_u16(&mut self, tag: u16, value: u16) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, tag: u16, value: u32) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, tag: u16, value: u64) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn put_i64(&mut self, tag: u16, value: i64) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, tag: u16, value: &[u8]) {
        self.field(tag, value);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// TLV reader over a snapshot blob produced by [`SnapshotWriter`].
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    fields: Vec<(u16, &'a [u8])>,
    pub version: SnapshotVersion,
}

impl<'a> SnapshotReader<'a> {
    /// Parses the header and field table, validating device identity and
    /// major version.
    pub fn parse(
        bytes: &'a [u8],
        device_id: [u8; 4],
        supported: SnapshotVersion,
    ) -> SnapshotResult<Self> {
        if bytes.len() < 12 {
            return Err(SnapshotError::Truncated);
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let found_id: [u8; 4] = bytes[4..8].try_into().unwrap_or_default();
        if found_id != device_id {
            return Err(SnapshotError::WrongDevice {
                expected: device_id,
                found: found_id,
            });
        }
        let major = u16::from_le_bytes([bytes[8], bytes[9]]);
        let minor = u16::from_le_bytes([bytes[10], bytes[11]]);
        if major != supported.major {
            return Err(SnapshotError::UnsupportedMajor {
                supported: supported.major,
                found: major,
            });
        }

        let mut fields = Vec::new();
        let mut rest = &bytes[12..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            fields.push((tag, &rest[..len]));
            rest = &rest[len..];
        }

        Ok(Self {
            fields,
            version: SnapshotVersion::new(major, minor),
        })
    }

    fn raw(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, payload)| *payload)
    }

    fn fixed<const N: usize>(&self, tag: u16) -> SnapshotResult<[u8; N]> {
        let payload = self.raw(tag).ok_or(SnapshotError::MissingField(tag))?;
        payload
            .try_into()
            .map_err(|_| SnapshotError::WrongFieldSize {
                tag,
                expected: N,
                found: payload.len(),
            })
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<u8> {
        Ok(self.fixed::<1>(tag)?[0])
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<bool> {
        Ok(self.u8(tag)? != 0)
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<u16> {
        Ok(u16::from_le_bytes(self.fixed::<2>(tag)?))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<u32> {
        Ok(u32::from_le_bytes(self.fixed::<4>(tag)?))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<u64> {
        Ok(u64::from_le_bytes(self.fixed::<8>(tag)?))
    }

    pub fn i64(&self, tag: u16) -> SnapshotResult<i64> {
        Ok(i64::from_le_bytes(self.fixed::<8>(tag)?))
    }

    /// Fixed-size byte array field (register files, count byte pairs).
    pub fn bytes<const N: usize>(&self, tag: u16) -> SnapshotResult<[u8; N]> {
        self.fixed::<N>(tag)
    }

    /// Optional accessor for fields added in later minor versions.
    pub fn u8_or(&self, tag: u16, default: u8) -> u8 {
        self.u8(tag).unwrap_or(default)
    }

    pub fn u64_or(&self, tag: u16, default: u64) -> u64 {
        self.u64(tag).unwrap_or(default)
    }

    pub fn bool_or(&self, tag: u16, default: bool) -> bool {
        self.bool(tag).unwrap_or(default)
    }
}
