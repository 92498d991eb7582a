//! OCI image layouts on disk.
//!
//! Each repository gets its own layout directory below the store root
//! (`<root>/<repository path>/{oci-layout,index.json,blobs/sha256/..}`),
//! which is also how the bundled registry lays out its storage. Tags live in
//! `index.json` as `org.opencontainers.image.ref.name` annotations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::{verify_digest, ArtifactStore, ImageIndex, ManifestBlob, ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_MANIFEST};
use crate::core::artifact::ArtifactRef;
use crate::util::fs::{join_relative, write_if_changed, write_string};
use crate::util::hash::sha256_file;

const OCI_LAYOUT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";

/// Filesystem-backed store.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LayoutStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout directory of one repository.
    pub fn repository_dir(&self, reference: &ArtifactRef) -> Result<PathBuf> {
        join_relative(&self.root, Path::new(&reference.path()))
    }

    fn blob_path(&self, reference: &ArtifactRef, digest: &str) -> Result<PathBuf> {
        let (algorithm, hex) = digest
            .split_once(':')
            .with_context(|| format!("malformed digest `{}`", digest))?;
        let valid = !algorithm.is_empty()
            && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
            && !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            bail!("malformed digest `{}`", digest);
        }
        Ok(self
            .repository_dir(reference)?
            .join("blobs")
            .join(algorithm)
            .join(hex))
    }

    fn read_index(&self, reference: &ArtifactRef) -> Result<ImageIndex> {
        let path = self.repository_dir(reference)?.join("index.json");
        if !path.exists() {
            return Ok(ImageIndex::default());
        }
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_index(&self, reference: &ArtifactRef, index: &ImageIndex) -> Result<()> {
        let dir = self.repository_dir(reference)?;
        let mut json = serde_json::to_string_pretty(index).context("failed to serialize image index")?;
        json.push('\n');
        write_string(&dir.join("index.json"), &json)?;
        Ok(())
    }

    fn ensure_layout(&self, reference: &ArtifactRef) -> Result<()> {
        let dir = self.repository_dir(reference)?;
        write_string(&dir.join("oci-layout"), OCI_LAYOUT)?;
        Ok(())
    }
}

/// Media type recorded inside a manifest document.
fn embedded_media_type(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| MEDIA_TYPE_IMAGE_MANIFEST.to_string())
}

impl ArtifactStore for LayoutStore {
    fn describe(&self) -> String {
        format!("layout {}", self.root.display())
    }

    fn resolve(&self, reference: &ArtifactRef) -> Result<Option<ManifestBlob>> {
        let index = self.read_index(reference)?;
        let Some(desc) = index
            .manifests
            .iter()
            .find(|d| d.annotations.get(ANNOTATION_REF_NAME) == Some(&reference.tag))
        else {
            return Ok(None);
        };

        let bytes = self.read_blob(reference, &desc.digest)?;
        verify_digest(&desc.digest, &bytes)
            .with_context(|| format!("manifest of {} is corrupt", reference))?;
        Ok(Some(ManifestBlob {
            media_type: desc.media_type.clone(),
            digest: desc.digest.clone(),
            bytes,
        }))
    }

    fn manifest(&self, reference: &ArtifactRef, digest: &str) -> Result<ManifestBlob> {
        let bytes = self.read_blob(reference, digest)?;
        verify_digest(digest, &bytes)?;
        Ok(ManifestBlob {
            media_type: embedded_media_type(&bytes),
            digest: digest.to_string(),
            bytes,
        })
    }

    /// Present and intact; a sha256 blob whose content no longer matches its
    /// name counts as missing so the next sync rewrites it.
    fn has_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<bool> {
        let path = self.blob_path(reference, digest)?;
        if !path.is_file() {
            return Ok(false);
        }
        match digest.split_once(':') {
            Some(("sha256", hex)) => {
                let actual = sha256_file(&path)?;
                if actual != hex.to_ascii_lowercase() {
                    tracing::warn!("blob {} of {} is corrupt (content sha256:{})", digest, reference, actual);
                    return Ok(false);
                }
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    fn read_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(reference, digest)?;
        fs::read(&path).with_context(|| format!("blob {} of {} not found in {}", digest, reference, self.describe()))
    }

    fn write_blob(&mut self, reference: &ArtifactRef, digest: &str, data: &[u8]) -> Result<()> {
        verify_digest(digest, data)?;
        self.ensure_layout(reference)?;
        write_if_changed(&self.blob_path(reference, digest)?, data)?;
        Ok(())
    }

    fn put_manifest(&mut self, reference: &ArtifactRef, manifest: &ManifestBlob, tag: bool) -> Result<()> {
        self.write_blob(reference, &manifest.digest, &manifest.bytes)?;
        if !tag {
            return Ok(());
        }

        let mut index = self.read_index(reference)?;
        index
            .manifests
            .retain(|d| d.annotations.get(ANNOTATION_REF_NAME) != Some(&reference.tag));
        let mut desc = manifest.descriptor();
        desc.annotations
            .insert(ANNOTATION_REF_NAME.to_string(), reference.tag.clone());
        index.manifests.push(desc);
        index
            .manifests
            .sort_by(|a, b| a.annotations.get(ANNOTATION_REF_NAME).cmp(&b.annotations.get(ANNOTATION_REF_NAME)));
        self.write_index(reference, &index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hash::oci_digest;
    use tempfile::TempDir;

    #[test]
    fn test_layout_files() {
        let tmp = TempDir::new().unwrap();
        let mut store = LayoutStore::new(tmp.path());
        let r = ArtifactRef::new("172.30.0.1:31000/airgap", "zot", "v1");

        let blob = ManifestBlob::new(MEDIA_TYPE_IMAGE_MANIFEST, b"{\"schemaVersion\":2}".to_vec());
        store.put_manifest(&r, &blob, true).unwrap();

        let dir = tmp.path().join("airgap/zot");
        assert!(dir.join("oci-layout").is_file());
        assert!(dir.join("index.json").is_file());
        let hex = blob.digest.trim_start_matches("sha256:");
        assert!(dir.join("blobs/sha256").join(hex).is_file());

        assert_eq!(store.resolve(&r).unwrap(), Some(blob.clone()));
        assert_eq!(store.resolve(&ArtifactRef::new("x", "zot", "v2")).unwrap(), None);
    }

    #[test]
    fn test_retag_replaces_entry() {
        let tmp = TempDir::new().unwrap();
        let mut store = LayoutStore::new(tmp.path());
        let r = ArtifactRef::new("reg", "app", "latest");

        let one = ManifestBlob::new(MEDIA_TYPE_IMAGE_MANIFEST, b"{\"a\":1}".to_vec());
        let two = ManifestBlob::new(MEDIA_TYPE_IMAGE_MANIFEST, b"{\"a\":2}".to_vec());
        store.put_manifest(&r, &one, true).unwrap();
        store.put_manifest(&r, &two, true).unwrap();

        assert_eq!(store.read_index(&r).unwrap().manifests.len(), 1);
        assert_eq!(store.resolve(&r).unwrap().unwrap().digest, two.digest);
    }

    #[test]
    fn test_rejects_bad_digest() {
        let tmp = TempDir::new().unwrap();
        let mut store = LayoutStore::new(tmp.path());
        let r = ArtifactRef::new("reg", "app", "v1");

        assert!(store.write_blob(&r, "sha256:../../etc", b"x").is_err());
        assert!(store.write_blob(&r, &oci_digest(b"y"), b"x").is_err());
        assert!(!store.has_blob(&r, &oci_digest(b"x")).unwrap());
    }

    #[test]
    fn test_corrupt_blob_is_missing() {
        let tmp = TempDir::new().unwrap();
        let mut store = LayoutStore::new(tmp.path());
        let r = ArtifactRef::new("reg", "app", "v1");
        let digest = oci_digest(b"layer");

        store.write_blob(&r, &digest, b"layer").unwrap();
        assert!(store.has_blob(&r, &digest).unwrap());

        fs::write(store.blob_path(&r, &digest).unwrap(), b"truncated").unwrap();
        assert!(!store.has_blob(&r, &digest).unwrap());

        store.write_blob(&r, &digest, b"layer").unwrap();
        assert!(store.has_blob(&r, &digest).unwrap());
    }
}
