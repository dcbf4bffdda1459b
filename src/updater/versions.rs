use tracing::debug;

use super::manifest::{FileEntry, UpdateCandidate};
use super::{UpdateError, MSI_ARCH_PREFIX, MSI_SUFFIX};
use crate::version;

/// Dot-decimal comparison over unsigned 16-bit components; missing components
/// count as zero. Empty or non-numeric components are errors, never "equal".
pub(crate) fn version_newer(candidate: &str, ours: &str) -> Result<bool, UpdateError> {
    let candidate_parts: Vec<&str> = candidate.split('.').collect();
    let our_parts: Vec<&str> = ours.split('.').collect();
    if candidate.is_empty() || ours.is_empty() {
        return Err(UpdateError::Version("Empty version"));
    }

    let len = candidate_parts.len().max(our_parts.len());
    for i in 0..len {
        let c = parse_part(candidate_parts.get(i))?;
        let o = parse_part(our_parts.get(i))?;
        if c == o {
            continue;
        }
        return Ok(c > o);
    }
    Ok(false)
}

fn parse_part(part: Option<&&str>) -> Result<u16, UpdateError> {
    match part {
        None => Ok(0),
        Some(part) if part.is_empty() => Err(UpdateError::Version("Empty version part")),
        Some(part) => part
            .parse::<u16>()
            .map_err(|_| UpdateError::Version("Invalid version integer part")),
    }
}

/// First manifest entry, in document order, named
/// `pangolin-<arch>-<ver>.msi` with `<ver>` newer than the running version.
pub(crate) fn find_candidate(
    entries: &[FileEntry],
) -> Result<Option<UpdateCandidate>, UpdateError> {
    find_candidate_for(entries, version::arch(), version::NUMBER)
}

pub(crate) fn find_candidate_for(
    entries: &[FileEntry],
    arch: &str,
    running: &str,
) -> Result<Option<UpdateCandidate>, UpdateError> {
    let prefix = format!("{MSI_ARCH_PREFIX}{arch}-");
    for entry in entries {
        let Some(rest) = entry.name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(candidate_version) = rest.strip_suffix(MSI_SUFFIX) else {
            continue;
        };
        if candidate_version.len() > 128 {
            return Err(UpdateError::VersionTooLong);
        }
        debug!("comparing candidate version {candidate_version} with {running}");
        if version_newer(candidate_version, running)? {
            return Ok(Some(UpdateCandidate {
                name: entry.name.clone(),
                hash: entry.hash,
                download_location: entry.download_location.clone(),
            }));
        }
    }
    Ok(None)
}
