use tracing::instrument;

use crate::ble::{CharacteristicInfo, ServiceInfo, ServiceInventory, WriteMode};

const BLUETOOTH_BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

pub(crate) const SPP_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";
pub(crate) const FFE0_SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";
pub(crate) const FFE1_CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";
pub(crate) const E781_SERVICE_UUID: &str = "e7810a71-73ae-499d-8c15-faa9aef0c3f2";
pub(crate) const BE78_CHARACTERISTIC_UUID: &str = "be781a71-73ae-499d-8c15-faa9aef0c3f2";

/// One candidate GATT profile an ELM327 adapter may speak.
///
/// The catalog is an ordered sequence; the first candidate whose service and
/// characteristics are present on the peripheral wins.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProfileCandidate {
    label: String,
    service_uuid: String,
    write_characteristic_uuid: String,
    notify_characteristic_uuid: String,
    preferred_write_mode: Option<WriteMode>,
}

impl ProfileCandidate {
    /// Creates a catalog candidate. UUIDs are normalised at construction so
    /// 16-bit and 32-bit short forms may be passed directly.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        service_uuid: &str,
        write_characteristic_uuid: &str,
        notify_characteristic_uuid: &str,
        preferred_write_mode: Option<WriteMode>,
    ) -> Self {
        Self {
            label: label.into(),
            service_uuid: normalize_uuid(service_uuid),
            write_characteristic_uuid: normalize_uuid(write_characteristic_uuid),
            notify_characteristic_uuid: normalize_uuid(notify_characteristic_uuid),
            preferred_write_mode,
        }
    }

    /// Returns the diagnostic label for this candidate.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the normalised service UUID.
    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    /// Returns the normalised write characteristic UUID.
    #[must_use]
    pub fn write_characteristic_uuid(&self) -> &str {
        &self.write_characteristic_uuid
    }

    /// Returns the normalised notify characteristic UUID.
    #[must_use]
    pub fn notify_characteristic_uuid(&self) -> &str {
        &self.notify_characteristic_uuid
    }

    /// Returns the write mode preferred when the adapter reports both write
    /// capabilities.
    #[must_use]
    pub fn preferred_write_mode(&self) -> Option<WriteMode> {
        self.preferred_write_mode
    }
}

/// Returns the built-in ordered profile catalog.
///
/// Extension is a build-time concern; callers wanting different candidates
/// pass a catalog override through
/// [`SessionConfig`](crate::SessionConfig).
#[must_use]
pub fn default_catalog() -> Vec<ProfileCandidate> {
    vec![
        ProfileCandidate::new(
            "1101_ffe1",
            SPP_SERVICE_UUID,
            FFE1_CHARACTERISTIC_UUID,
            FFE1_CHARACTERISTIC_UUID,
            Some(WriteMode::WithoutResponse),
        ),
        ProfileCandidate::new(
            "ffe0_ffe1",
            FFE0_SERVICE_UUID,
            FFE1_CHARACTERISTIC_UUID,
            FFE1_CHARACTERISTIC_UUID,
            Some(WriteMode::WithoutResponse),
        ),
        ProfileCandidate::new(
            "e781_be78",
            E781_SERVICE_UUID,
            BE78_CHARACTERISTIC_UUID,
            BE78_CHARACTERISTIC_UUID,
            Some(WriteMode::WithResponse),
        ),
    ]
}

/// Normalises a UUID string for comparison: lowercases it and expands 16-bit
/// and 32-bit short forms onto the Bluetooth base UUID.
#[must_use]
pub(crate) fn normalize_uuid(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let is_hex = lower.bytes().all(|byte| byte.is_ascii_hexdigit());
    match lower.len() {
        4 if is_hex => format!("0000{lower}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        8 if is_hex => format!("{lower}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        _ => lower,
    }
}

/// A catalog candidate that satisfied the matching predicate, with its
/// resolved write mode.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MatchedProfile {
    candidate: ProfileCandidate,
    write_mode: WriteMode,
}

impl MatchedProfile {
    /// Returns the matched catalog candidate.
    #[must_use]
    pub fn candidate(&self) -> &ProfileCandidate {
        &self.candidate
    }

    /// Returns the resolved write mode.
    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }
}

/// Returns the candidates satisfied by a retrieved service inventory, in
/// catalog order.
///
/// A candidate matches when its service is present, both its characteristics
/// exist under that service, and the write characteristic advertises a write
/// capability. When both write capabilities are advertised the candidate's
/// preferred mode wins, falling back to write-without-response.
#[instrument(skip(catalog, inventory), level = "debug", fields(candidate_count = catalog.len()))]
pub(crate) fn matching_candidates(
    catalog: &[ProfileCandidate],
    inventory: &ServiceInventory,
) -> Vec<MatchedProfile> {
    catalog
        .iter()
        .filter_map(|candidate| {
            let service = find_service(inventory, candidate.service_uuid())?;
            let write_characteristic =
                find_characteristic(service, candidate.write_characteristic_uuid())?;
            find_characteristic(service, candidate.notify_characteristic_uuid())?;
            let write_mode = resolve_write_mode(write_characteristic, candidate)?;
            Some(MatchedProfile {
                candidate: candidate.clone(),
                write_mode,
            })
        })
        .collect()
}

fn find_service<'a>(inventory: &'a ServiceInventory, uuid: &str) -> Option<&'a ServiceInfo> {
    inventory
        .services()
        .iter()
        .find(|service| normalize_uuid(service.uuid()) == uuid)
}

fn find_characteristic<'a>(service: &'a ServiceInfo, uuid: &str) -> Option<&'a CharacteristicInfo> {
    service
        .characteristics()
        .iter()
        .find(|characteristic| normalize_uuid(characteristic.uuid()) == uuid)
}

fn resolve_write_mode(
    characteristic: &CharacteristicInfo,
    candidate: &ProfileCandidate,
) -> Option<WriteMode> {
    let with_response = characteristic.has_property("write");
    let without_response = characteristic.has_property("write_without_response");
    match (with_response, without_response) {
        (true, true) => Some(
            candidate
                .preferred_write_mode()
                .unwrap_or(WriteMode::WithoutResponse),
        ),
        (true, false) => Some(WriteMode::WithResponse),
        (false, true) => Some(WriteMode::WithoutResponse),
        (false, false) => None,
    }
}
