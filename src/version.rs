//! Kibana versions as semantic versions, and the window of versions this operator can run.

use semver::Version;

/// Lowest Kibana version the operator knows how to configure.
pub const MIN_SUPPORTED: Version = Version::new(6, 8, 0);
/// Highest Kibana version the operator knows how to configure.
pub const MAX_SUPPORTED: Version = Version::new(9, 99, 99);

/// First version where `xpack.encryptedSavedObjects.encryptionKey` is accepted.
pub const ENCRYPTED_SAVED_OBJECTS_SINCE: Version = Version::new(7, 6, 0);
/// First version where the license management UI can be toggled.
pub const LICENSE_MANAGEMENT_UI_SINCE: Version = Version::new(7, 6, 0);
/// First version running with the hardened security context, logs and temp volumes.
pub const HARDENED_SECURITY_CONTEXT_SINCE: Version = Version::new(7, 10, 0);
/// First version supporting stack monitoring through sidecars.
pub const STACK_MONITORING_SINCE: Version = Version::new(7, 14, 0);
/// First version where the monitoring UI setting lost its `xpack.` prefix.
pub const MONITORING_UI_WITHOUT_XPACK_SINCE: Version = Version::new(7, 16, 0);

/// Parses a version string the way users write them in `spec.version`.
///
/// Build metadata is ignored; pre-release identifiers are kept so that
/// `8.0.0-SNAPSHOT` sorts below `8.0.0`.
pub fn parse(raw: &str) -> Result<Version, String> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next().unwrap_or_default();
    let elements: Vec<&str> = core.split('.').collect();
    if elements.len() != 3 || elements.iter().any(|e| e.parse::<u64>().is_err()) {
        return Err("No Major.Minor.Patch elements found".into());
    }
    let mut version = Version::parse(trimmed).map_err(|e| e.to_string())?;
    version.build = semver::BuildMetadata::EMPTY;
    Ok(version)
}

/// Checks that `version` lies within the supported window, both ends inclusive.
pub fn supported(version: &Version) -> Result<(), String> {
    if compare_release(version, &MIN_SUPPORTED).is_lt() {
        return Err(format!(
            "Unsupported version: version {version} is lower than the lowest supported version of {MIN_SUPPORTED}"
        ));
    }
    if compare_release(version, &MAX_SUPPORTED).is_gt() {
        return Err(format!(
            "Unsupported version: version {version} is higher than the highest supported version of {MAX_SUPPORTED}"
        ));
    }
    Ok(())
}

/// `version >= min`, ignoring pre-release identifiers so that snapshots of a
/// release get the features of that release.
pub fn at_least(version: &Version, min: &Version) -> bool {
    compare_release(version, min).is_ge()
}

fn compare_release(a: &Version, b: &Version) -> std::cmp::Ordering {
    (a.major, a.minor, a.patch).cmp(&(b.major, b.minor, b.patch))
}

/// Same major and minor, patch and pre-release ignored.
pub fn same_minor(a: &Version, b: &Version) -> bool {
    a.major == b.major && a.minor == b.minor
}
