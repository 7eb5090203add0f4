//! Fleet-scoped unique names for replicated objects
//!
//! A unique name has the form `{cluster}-{namespace}-{name}-{suffix}`, where the suffix is the
//! first five characters of a random UUID. Each segment is truncated so the whole name fits
//! the length limit of the requested format. Uniqueness is not reserved anywhere; callers
//! detect collisions when creating the named object and generate a new name on conflict.

use rand::Rng;
use uuid::Uuid;

use crate::{FleetError, Result};

const SUFFIX_LENGTH: usize = 5;
const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const DNS1123_LABEL_MAX_LENGTH: usize = 63;
const DNS1035_LABEL_MAX_LENGTH: usize = 63;

/// Length of the random name used when a formatted name cannot be produced.
pub const FALLBACK_NAME_LENGTH: usize = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameFormat {
    /// RFC 1123 DNS subdomain
    Dns1123Subdomain,
    /// RFC 1123 DNS label
    Dns1123Label,
    /// RFC 1035 DNS label
    Dns1035Label,
}

impl NameFormat {
    fn max_length(self) -> usize {
        match self {
            Self::Dns1123Subdomain => DNS1123_SUBDOMAIN_MAX_LENGTH,
            Self::Dns1123Label => DNS1123_LABEL_MAX_LENGTH,
            Self::Dns1035Label => DNS1035_LABEL_MAX_LENGTH,
        }
    }

    pub fn is_valid(self, name: &str) -> bool {
        match self {
            Self::Dns1123Subdomain => is_dns1123_subdomain(name),
            Self::Dns1123Label => is_dns1123_label(name),
            Self::Dns1035Label => is_dns1035_label(name),
        }
    }
}

/// Formats a unique name for an object `namespace/name` exported from `cluster_id`.
pub fn fleet_scoped_unique_name(
    format: NameFormat,
    cluster_id: &str,
    namespace: &str,
    name: &str,
) -> Result<String> {
    // three dashes plus the suffix
    let reserved = 3 + SUFFIX_LENGTH;
    let per_segment = (format.max_length() - reserved) / 3;

    let (cluster_id, name) = match format {
        NameFormat::Dns1123Subdomain => (cluster_id.to_string(), name.to_string()),
        NameFormat::Dns1123Label | NameFormat::Dns1035Label => {
            (cluster_id.replace('.', ""), name.replace('.', ""))
        }
    };

    let unique_name = format!(
        "{}-{}-{}-{}",
        truncate(&cluster_id, per_segment),
        truncate(namespace, per_segment),
        truncate(&name, per_segment),
        random_suffix(),
    );

    if !format.is_valid(&unique_name) {
        return Err(FleetError::Internal(format!(
            "failed to format a unique {format:?} name with cluster ID {cluster_id}, namespace {namespace}, name {name}"
        )));
    }
    Ok(unique_name)
}

/// A random string of lowercase letters; valid under every name format.
pub fn random_lowercase_name(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

fn random_suffix() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SUFFIX_LENGTH)
        .collect()
}

fn truncate(segment: &str, max: usize) -> String {
    segment.chars().take(max).collect()
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
}

fn is_label_body(label: &str) -> bool {
    !label.is_empty()
        && label.chars().all(is_label_char)
        && !label.starts_with('-')
        && !label.ends_with('-')
}

pub fn is_dns1123_label(name: &str) -> bool {
    name.len() <= DNS1123_LABEL_MAX_LENGTH
        && is_label_body(name)
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
}

pub fn is_dns1123_subdomain(name: &str) -> bool {
    name.len() <= DNS1123_SUBDOMAIN_MAX_LENGTH && name.split('.').all(is_label_body)
}

pub fn is_dns1035_label(name: &str) -> bool {
    name.len() <= DNS1035_LABEL_MAX_LENGTH
        && is_label_body(name)
        && name.starts_with(|c: char| c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_shape() {
        let name =
            fleet_scoped_unique_name(NameFormat::Dns1123Subdomain, "bravelion", "work", "app-x7k2p")
                .unwrap();
        assert!(name.starts_with("bravelion-work-app-x7k2p-"));
        assert_eq!(name.len(), "bravelion-work-app-x7k2p-".len() + SUFFIX_LENGTH);
        assert!(is_dns1123_subdomain(&name));
    }

    #[test]
    fn test_unique_names_differ() {
        let a = fleet_scoped_unique_name(NameFormat::Dns1123Subdomain, "c", "ns", "n").unwrap();
        let b = fleet_scoped_unique_name(NameFormat::Dns1123Subdomain, "c", "ns", "n").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_label_format_truncates_and_strips_dots() {
        let long = "a".repeat(100);
        let name =
            fleet_scoped_unique_name(NameFormat::Dns1123Label, "member.one", &long, "svc.v1").unwrap();
        assert!(name.len() <= DNS1123_LABEL_MAX_LENGTH);
        assert!(name.starts_with("memberone-"));
        assert!(name.contains("-svcv1-"));
        assert!(is_dns1123_label(&name));
    }

    #[test]
    fn test_dns1035_rejects_leading_digit() {
        assert!(
            fleet_scoped_unique_name(NameFormat::Dns1035Label, "1cluster", "ns", "name").is_err()
        );
        assert!(fleet_scoped_unique_name(NameFormat::Dns1035Label, "cluster", "ns", "name").is_ok());
    }

    #[test]
    fn test_validators() {
        assert!(is_dns1123_subdomain("a.b-c.d"));
        assert!(!is_dns1123_subdomain("A.b"));
        assert!(!is_dns1123_subdomain("a..b"));
        assert!(!is_dns1123_subdomain("-a"));
        assert!(!is_dns1123_subdomain(""));
        assert!(!is_dns1123_subdomain(&"a".repeat(254)));
        assert!(is_dns1123_label("1abc"));
        assert!(!is_dns1123_label("a.b"));
        assert!(!is_dns1035_label("1abc"));
        assert!(is_dns1035_label("abc-1"));
    }

    #[test]
    fn test_random_lowercase_name() {
        let name = random_lowercase_name(FALLBACK_NAME_LENGTH);
        assert_eq!(name.len(), FALLBACK_NAME_LENGTH);
        assert!(name.chars().all(|c| c.is_ascii_lowercase()));
        assert!(NameFormat::Dns1035Label.is_valid(&name));
    }
}
