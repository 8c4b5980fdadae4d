//! Provider ID encoding
//!
//! A provider ID is the BIOS UUID of the VM behind the `vsphere://` scheme. Both
//! directions are total: an empty string is the failure signal, so callers
//! never deal with a parse error type for what is really a presence check.

use uuid::Uuid;

use crate::PROVIDER_ID_PREFIX;

/// Length of a UUID in its hyphenated 8-4-4-4-12 form
const UUID_LEN: usize = 36;

fn is_uuid(s: &str) -> bool {
    // at this length try_parse only accepts the hyphenated form
    s.len() == UUID_LEN && Uuid::try_parse(s).is_ok()
}

/// Convert a BIOS UUID into a provider ID
///
/// Returns an empty string if `bios_uuid` is not a hyphenated UUID.
pub fn encode_provider_id(bios_uuid: &str) -> String {
    if !is_uuid(bios_uuid) {
        return String::new();
    }
    format!("{PROVIDER_ID_PREFIX}{bios_uuid}")
}

/// Extract the BIOS UUID from a provider ID
///
/// The scheme is matched case-insensitively and the UUID is returned as
/// written. Returns an empty string for anything else.
pub fn decode_provider_id(provider_id: &str) -> String {
    let prefix_len = PROVIDER_ID_PREFIX.len();
    let Some(scheme) = provider_id.get(..prefix_len) else {
        return String::new();
    };
    if !scheme.eq_ignore_ascii_case(PROVIDER_ID_PREFIX) {
        return String::new();
    }
    let uuid = &provider_id[prefix_len..];
    if !is_uuid(uuid) {
        return String::new();
    }
    uuid.to_string()
}
