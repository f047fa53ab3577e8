//! Hardware identity collection and fingerprinting.
//!
//! A fingerprint is the SHA-256 of the machine's stable identifiers, sorted by
//! source name so that collection order never matters. Collection degrades
//! gracefully: any source that cannot be read is skipped, and only a machine
//! with no identifier at all is reported as unavailable.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::KeyError;
use crate::persist;

/// One stable identifier of the current machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareIdentifier {
    pub source: String,
    pub value: String,
}

impl HardwareIdentifier {
    pub fn new(source: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            value: value.into(),
        }
    }
}

/// Source of the identifiers that make up a machine fingerprint.
pub trait HardwareIdentity: Send + Sync {
    /// Every identifier currently available. May be empty.
    fn identifiers(&self) -> Vec<HardwareIdentifier>;
}

/// Hex-encoded SHA-256 hardware fingerprint.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell machines apart in logs.
        write!(f, "Fingerprint({}…)", &self.0[..self.0.len().min(12)])
    }
}

/// Hash the identifiers reported by `identity` into a [`Fingerprint`].
///
/// # Errors
///
/// Returns [`KeyError::HardwareUnavailable`] if no identifier source produced
/// a value.
pub fn fingerprint(identity: &dyn HardwareIdentity) -> Result<Fingerprint, KeyError> {
    let mut ids = identity.identifiers();
    ids.retain(|id| !id.value.trim().is_empty());
    if ids.is_empty() {
        return Err(KeyError::HardwareUnavailable(
            "no hardware identifier source available".into(),
        ));
    }
    ids.sort_by(|a, b| a.source.cmp(&b.source));

    let mut hasher = Sha256::new();
    for id in &ids {
        hasher.update(id.source.as_bytes());
        hasher.update(b"=");
        hasher.update(id.value.trim().as_bytes());
        hasher.update(b"\n");
    }
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    Ok(Fingerprint(hex))
}

// ---------------------------------------------------------------------------
// System identity
// ---------------------------------------------------------------------------

/// Identifiers of the machine this process runs on.
///
/// Combines the OS machine id, the processor identifier, and a persisted
/// installation marker created on first use. Every identifier must stay
/// stable across renames and relaunches; the key-encryption key is salted
/// with the fingerprint.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    marker_path: PathBuf,
}

impl SystemIdentity {
    /// `marker_path` holds the installation marker (created if absent).
    pub fn new(marker_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_path: marker_path.into(),
        }
    }

    fn machine_id() -> Option<String> {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|path| read_trimmed(path))
    }

    fn processor_id() -> Option<String> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
        ["Serial", "model name", "vendor_id", "CPU implementer"]
            .iter()
            .find_map(|field| {
                cpuinfo.lines().find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    (name.trim() == *field).then(|| value.trim().to_owned())
                })
            })
    }

    fn installation_marker(&self) -> Option<String> {
        if let Some(existing) = self.marker_path.to_str().and_then(read_trimmed) {
            return Some(existing);
        }
        let marker = Uuid::new_v4().to_string();
        match persist::atomic_write_blocking(&self.marker_path, marker.as_bytes()) {
            Ok(()) => Some(marker),
            Err(e) => {
                debug!(path = %self.marker_path.display(), error = %e, "cannot persist installation marker");
                None
            }
        }
    }
}

impl HardwareIdentity for SystemIdentity {
    fn identifiers(&self) -> Vec<HardwareIdentifier> {
        let sources = [
            ("machine_id", Self::machine_id()),
            ("processor", Self::processor_id()),
            ("installation", self.installation_marker()),
        ];
        sources
            .into_iter()
            .filter_map(|(source, value)| match value {
                Some(value) => Some(HardwareIdentifier::new(source, value)),
                None => {
                    debug!(source, "hardware identifier source unavailable");
                    None
                }
            })
            .collect()
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// Fixed identifier set, for simulated machines.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    ids: Vec<HardwareIdentifier>,
}

impl StaticIdentity {
    pub fn new<I, S, V>(ids: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<String>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(|(s, v)| HardwareIdentifier::new(s, v))
                .collect(),
        }
    }
}

impl HardwareIdentity for StaticIdentity {
    fn identifiers(&self) -> Vec<HardwareIdentifier> {
        self.ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_source_order() {
        let a = StaticIdentity::new([("machine_id", "abc"), ("processor", "xyz")]);
        let b = StaticIdentity::new([("processor", "xyz"), ("machine_id", "abc")]);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn different_machines_differ() {
        let a = StaticIdentity::new([("machine_id", "machine-a")]);
        let b = StaticIdentity::new([("machine_id", "machine-b")]);
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&StaticIdentity::new([("machine_id", "m")])).unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_identity_is_unavailable() {
        let err = fingerprint(&StaticIdentity::default()).unwrap_err();
        assert!(matches!(err, KeyError::HardwareUnavailable(_)));
        let blank = StaticIdentity::new([("machine_id", "  ")]);
        assert!(fingerprint(&blank).is_err());
    }

    #[test]
    fn system_identity_degrades_to_installation_marker() {
        let dir = tempfile::tempdir().unwrap();
        let identity = SystemIdentity::new(dir.path().join("install.id"));
        let ids = identity.identifiers();
        assert!(ids.iter().any(|id| id.source == "installation"));

        // The marker is persisted, so the fingerprint is stable across calls.
        let first = fingerprint(&identity).unwrap();
        let second = fingerprint(&identity).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn system_identity_ignores_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let identity = SystemIdentity::new(dir.path().join("install.id"));
        assert!(identity.identifiers().iter().all(|id| id.source != "hostname"));
    }

    #[cfg(unix)]
    #[test]
    fn installation_marker_is_private_and_complete() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("install.id");
        let identity = SystemIdentity::new(&path);
        let ids = identity.identifiers();
        let marker = ids.iter().find(|id| id.source == "installation").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), marker.value);
        assert!(Uuid::parse_str(&marker.value).is_ok());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        assert!(!std::path::Path::new(&tmp).exists());
    }
}
