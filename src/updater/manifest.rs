use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::{debug, error};

use super::{UpdateError, RELEASE_PUBLIC_KEY_BASE64};

const KEYID_LEN: usize = 10;
pub(crate) const HASH_LEN: usize = 32;

/// One line of the manifest body: `hash  filename  download_location`, with
/// two-space separators and the location optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub hash: [u8; HASH_LEN],
    /// Absolute URL, a path relative to the update server, or empty.
    pub download_location: String,
}

#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub name: String,
    pub hash: [u8; HASH_LEN],
    pub download_location: String,
}

/// Parse and verify the three-line signify-style manifest against the
/// embedded release key: untrusted comment, base64 signature whose first ten
/// bytes must match the key's keyid, and the Ed25519-signed body. Document
/// order of the body lines is preserved.
pub(crate) fn read_file_list(input: &[u8]) -> Result<Vec<FileEntry>, UpdateError> {
    let public_key_bytes = BASE64
        .decode(RELEASE_PUBLIC_KEY_BASE64)
        .map_err(|_| UpdateError::InvalidPublicKey)?;
    read_file_list_with_key(input, &public_key_bytes)
}

pub(crate) fn read_file_list_with_key(
    input: &[u8],
    public_key_bytes: &[u8],
) -> Result<Vec<FileEntry>, UpdateError> {
    if public_key_bytes.len() != ed25519_dalek::PUBLIC_KEY_LENGTH + KEYID_LEN
        || public_key_bytes[0] != b'E'
        || public_key_bytes[1] != b'd'
    {
        return Err(UpdateError::InvalidPublicKey);
    }

    let mut lines = input.splitn(3, |&b| b == b'\n');
    let comment = lines.next().unwrap_or_default();
    let signature_line = lines
        .next()
        .ok_or(UpdateError::ManifestFormat("Signature input has too few lines"))?;
    let body = lines
        .next()
        .ok_or(UpdateError::ManifestFormat("Signature input has too few lines"))?;

    if !comment.starts_with(b"untrusted comment: ") {
        return Err(UpdateError::ManifestFormat(
            "Signature input is missing untrusted comment",
        ));
    }

    let signature_bytes = BASE64
        .decode(signature_line)
        .map_err(|_| UpdateError::ManifestFormat("Signature input is not valid base64"))?;
    if signature_bytes.len() != ed25519_dalek::SIGNATURE_LENGTH + KEYID_LEN
        || signature_bytes[..KEYID_LEN] != public_key_bytes[..KEYID_LEN]
    {
        return Err(UpdateError::ManifestFormat(
            "Signature input bytes are incorrect length, type, or keyid",
        ));
    }

    let verifying_key = VerifyingKey::from_bytes(
        public_key_bytes[KEYID_LEN..]
            .try_into()
            .map_err(|_| UpdateError::InvalidPublicKey)?,
    )
    .map_err(|_| UpdateError::InvalidPublicKey)?;
    let signature = Signature::from_slice(&signature_bytes[KEYID_LEN..])
        .map_err(|_| UpdateError::BadSignature)?;
    if verifying_key.verify(body, &signature).is_err() {
        error!("manifest signature verification failed");
        return Err(UpdateError::BadSignature);
    }

    parse_body(body)
}

fn parse_body(body: &[u8]) -> Result<Vec<FileEntry>, UpdateError> {
    let body = std::str::from_utf8(body)
        .map_err(|_| UpdateError::ManifestFormat("File list is not valid UTF-8"))?;

    let mut entries = Vec::new();
    let line_count = body.split('\n').count();
    for (index, line) in body.split('\n').enumerate() {
        if line.is_empty() && index == line_count - 1 {
            break;
        }
        let mut parts = line.splitn(3, "  ");
        let hash_str = parts.next().unwrap_or_default();
        let name = parts
            .next()
            .ok_or(UpdateError::ManifestFormat("File hash line has too few components"))?;
        let download_location = parts.next().unwrap_or_default();

        let raw_hash = hex::decode(hash_str)
            .map_err(|_| UpdateError::ManifestFormat("File hash is invalid hex"))?;
        let hash: [u8; HASH_LEN] = raw_hash.try_into().map_err(|_| {
            UpdateError::ManifestFormat("File hash is an incorrect number of bytes")
        })?;

        debug!("manifest entry {name} (location: {download_location:?})");
        entries.push(FileEntry {
            name: name.to_string(),
            hash,
            download_location: download_location.to_string(),
        });
    }

    if entries.is_empty() {
        return Err(UpdateError::ManifestFormat("No file hashes found in signed input"));
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Manifest construction against a throwaway release key. The embedded
    //! production key cannot sign in tests, so verification goes through
    //! `read_file_list_with_key`.

    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub fn signed_manifest(signing_key: &SigningKey, body: &str) -> (String, Vec<u8>) {
        let mut keyed_public = Vec::new();
        keyed_public.extend_from_slice(b"Ed");
        keyed_public.extend_from_slice(&[0u8; 8]);
        keyed_public.extend_from_slice(signing_key.verifying_key().as_bytes());

        let signature = signing_key.sign(body.as_bytes());
        let mut keyed_signature = Vec::new();
        keyed_signature.extend_from_slice(b"Ed");
        keyed_signature.extend_from_slice(&[0u8; 8]);
        keyed_signature.extend_from_slice(&signature.to_bytes());

        let manifest = format!(
            "untrusted comment: signed release list\n{}\n{body}",
            BASE64.encode(&keyed_signature)
        );
        (manifest, keyed_public)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use ed25519_dalek::SigningKey;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn valid_manifest_parses_in_document_order() {
        let body = format!(
            "{}  pangolin-amd64-1.0.31.msi  https://cdn/x.msi\n{}  pangolin-arm64-1.0.31.msi\n",
            "11".repeat(32),
            "22".repeat(32),
        );
        let key = test_key();
        let (manifest, public) = signed_manifest(&key, &body);
        let entries = read_file_list_with_key(manifest.as_bytes(), &public).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "pangolin-amd64-1.0.31.msi");
        assert_eq!(entries[0].download_location, "https://cdn/x.msi");
        assert_eq!(entries[1].download_location, "");
        assert_eq!(entries[0].hash, [0x11; 32]);
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = format!("{}  pangolin-amd64-1.0.31.msi\n", "11".repeat(32));
        let key = test_key();
        let (manifest, public) = signed_manifest(&key, &body);
        let tampered = manifest.replace("1.0.31", "9.9.99");
        let err = read_file_list_with_key(tampered.as_bytes(), &public).unwrap_err();
        assert!(matches!(err, UpdateError::BadSignature));
    }

    #[test]
    fn keyid_mismatch_is_rejected() {
        let body = format!("{}  pangolin-amd64-1.0.31.msi\n", "11".repeat(32));
        let key = test_key();
        let (manifest, mut public) = signed_manifest(&key, &body);
        public[5] ^= 0xff; // corrupt the keyid
        let err = read_file_list_with_key(manifest.as_bytes(), &public).unwrap_err();
        assert!(matches!(err, UpdateError::ManifestFormat(_)));
    }

    #[test]
    fn missing_comment_is_rejected() {
        let body = format!("{}  pangolin-amd64-1.0.31.msi\n", "11".repeat(32));
        let key = test_key();
        let (manifest, public) = signed_manifest(&key, &body);
        let stripped = manifest.replace("untrusted comment: ", "comment: ");
        assert!(read_file_list_with_key(stripped.as_bytes(), &public).is_err());
    }

    #[test]
    fn bad_hash_length_is_rejected() {
        let body = "1234  pangolin-amd64-1.0.31.msi\n".to_string();
        let key = test_key();
        let (manifest, public) = signed_manifest(&key, &body);
        assert!(read_file_list_with_key(manifest.as_bytes(), &public).is_err());
    }

    #[test]
    fn embedded_key_has_signify_framing() {
        let decoded = BASE64.decode(RELEASE_PUBLIC_KEY_BASE64).unwrap();
        assert_eq!(decoded.len(), ed25519_dalek::PUBLIC_KEY_LENGTH + 10);
        assert_eq!(&decoded[..2], b"Ed");
    }
}
