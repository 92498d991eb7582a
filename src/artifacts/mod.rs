//! OCI artifact stores.
//!
//! Images, charts, and binary bundles are all addressed as OCI manifests.
//! An [`ArtifactStore`] is either an on-disk image layout ([`LayoutStore`])
//! or a distribution registry ([`RemoteRegistry`]); [`sync`] and [`fetch`]
//! work against either.

pub mod layout;
pub mod remote;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::artifact::ArtifactRef;
use crate::ops::op::{FetchFile, Unpack};
use crate::util::fs::{ensure_dir, join_relative, set_mode, write_if_changed, WriteOutcome};
use crate::util::hash::oci_digest;

pub use layout::LayoutStore;
pub use remote::RemoteRegistry;

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation naming the file a layer holds.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
/// Annotation carrying the tag of an index entry in an image layout.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Media types accepted when reading manifests.
pub const ACCEPTED_MANIFESTS: [&str; 4] = [
    MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_LIST,
];

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn title(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_TITLE).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image index (multi-platform list, or the top-level layout index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }
}

/// Raw manifest bytes as stored; the digest is over exactly these bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestBlob {
    pub media_type: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

/// Parsed manifest content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl ManifestBlob {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        ManifestBlob {
            media_type: media_type.into(),
            digest: oci_digest(&bytes),
            bytes,
        }
    }

    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_IMAGE_INDEX || self.media_type == MEDIA_TYPE_DOCKER_LIST
    }

    pub fn parse(&self) -> Result<Manifest> {
        if self.is_index() {
            let index = serde_json::from_slice(&self.bytes)
                .with_context(|| format!("invalid image index {}", self.digest))?;
            Ok(Manifest::Index(index))
        } else {
            let manifest = serde_json::from_slice(&self.bytes)
                .with_context(|| format!("invalid image manifest {}", self.digest))?;
            Ok(Manifest::Image(manifest))
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.bytes.len() as u64,
            annotations: BTreeMap::new(),
            platform: None,
        }
    }
}

/// Check content against its expected digest.
pub fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    let actual = oci_digest(data);
    if actual != expected {
        bail!("digest mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}

/// Storage for OCI content, addressed per repository.
pub trait ArtifactStore {
    /// Human-readable location for messages.
    fn describe(&self) -> String;

    /// Manifest tagged `reference.tag`, if present.
    fn resolve(&self, reference: &ArtifactRef) -> Result<Option<ManifestBlob>>;

    /// Manifest by digest.
    fn manifest(&self, reference: &ArtifactRef, digest: &str) -> Result<ManifestBlob>;

    fn has_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<bool>;

    fn read_blob(&self, reference: &ArtifactRef, digest: &str) -> Result<Vec<u8>>;

    fn write_blob(&mut self, reference: &ArtifactRef, digest: &str, data: &[u8]) -> Result<()>;

    /// Store a manifest; when `tag` is set it becomes `reference.tag`.
    fn put_manifest(&mut self, reference: &ArtifactRef, manifest: &ManifestBlob, tag: bool) -> Result<()>;
}

/// What [`sync`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The target already had the same manifest under the tag.
    UpToDate,
    Copied { blobs: usize, bytes: u64 },
}

fn copy_blob(
    source: &dyn ArtifactStore,
    source_ref: &ArtifactRef,
    target: &mut dyn ArtifactStore,
    target_ref: &ArtifactRef,
    desc: &Descriptor,
    copied: &mut (usize, u64),
) -> Result<()> {
    if target.has_blob(target_ref, &desc.digest)? {
        tracing::debug!("blob {} already present", desc.digest);
        return Ok(());
    }
    let data = source.read_blob(source_ref, &desc.digest)?;
    verify_digest(&desc.digest, &data)
        .with_context(|| format!("blob of {} is corrupt", source_ref))?;
    target.write_blob(target_ref, &desc.digest, &data)?;
    copied.0 += 1;
    copied.1 += data.len() as u64;
    Ok(())
}

fn copy_manifest(
    source: &dyn ArtifactStore,
    source_ref: &ArtifactRef,
    target: &mut dyn ArtifactStore,
    target_ref: &ArtifactRef,
    manifest: &ManifestBlob,
    tag: bool,
    copied: &mut (usize, u64),
) -> Result<()> {
    match manifest.parse()? {
        Manifest::Index(index) => {
            for child in &index.manifests {
                let child_manifest = source.manifest(source_ref, &child.digest)?;
                copy_manifest(source, source_ref, target, target_ref, &child_manifest, false, copied)?;
            }
        }
        Manifest::Image(image) => {
            copy_blob(source, source_ref, target, target_ref, &image.config, copied)?;
            for layer in &image.layers {
                copy_blob(source, source_ref, target, target_ref, layer, copied)?;
            }
        }
    }
    target.put_manifest(target_ref, manifest, tag)
}

/// Copy `source_ref` from `source` to `target_ref` in `target`.
///
/// Nothing is transferred when the target already carries the same
/// manifest digest under the target tag, and blobs the target already has
/// are never re-sent.
pub fn sync(
    source: &dyn ArtifactStore,
    source_ref: &ArtifactRef,
    target: &mut dyn ArtifactStore,
    target_ref: &ArtifactRef,
) -> Result<SyncOutcome> {
    source_ref.require_complete()?;
    target_ref.require_complete()?;

    let manifest = source
        .resolve(source_ref)?
        .with_context(|| format!("{} not found in {}", source_ref, source.describe()))?;

    if let Some(existing) = target.resolve(target_ref)? {
        if existing.digest == manifest.digest {
            tracing::debug!("{} is up to date ({})", target_ref, manifest.digest);
            return Ok(SyncOutcome::UpToDate);
        }
    }

    let mut copied = (0, 0);
    copy_manifest(source, source_ref, target, target_ref, &manifest, true, &mut copied)?;
    tracing::info!(
        "synced {} -> {} ({} blobs, {} bytes)",
        source_ref,
        target_ref,
        copied.0,
        copied.1
    );
    Ok(SyncOutcome::Copied {
        blobs: copied.0,
        bytes: copied.1,
    })
}

/// Select the image manifest to read files from; for an index, prefer the
/// entry matching the host platform, then the first entry.
pub fn image_manifest(store: &dyn ArtifactStore, reference: &ArtifactRef) -> Result<ImageManifest> {
    let blob = store
        .resolve(reference)?
        .with_context(|| format!("{} not found in {}", reference, store.describe()))?;

    match blob.parse()? {
        Manifest::Image(image) => Ok(image),
        Manifest::Index(index) => {
            let arch = host_architecture();
            let chosen = index
                .manifests
                .iter()
                .find(|d| {
                    d.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == arch)
                })
                .or_else(|| index.manifests.first())
                .with_context(|| format!("image index for {} is empty", reference))?;
            match store.manifest(reference, &chosen.digest)?.parse()? {
                Manifest::Image(image) => Ok(image),
                Manifest::Index(_) => bail!("nested image index in {}", reference),
            }
        }
    }
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path, origin: &str) -> Result<Vec<WriteOutcome>> {
    let mut archive = tar::Archive::new(reader);
    let mut outcomes = Vec::new();

    for entry in archive
        .entries()
        .with_context(|| format!("failed to read archive {}", origin))?
    {
        let mut entry = entry.with_context(|| format!("failed to read archive {}", origin))?;
        let path = entry
            .path()
            .with_context(|| format!("invalid path in archive {}", origin))?
            .into_owned();
        let out = join_relative(dest, &path)?;

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            ensure_dir(&out)?;
        } else if kind.is_file() {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read {} from {}", path.display(), origin))?;
            outcomes.push(write_if_changed(&out, &data)?);
            if let Ok(mode) = entry.header().mode() {
                set_mode(&out, mode & 0o7777)?;
            }
        } else {
            tracing::debug!("skipping {} in {} ({:?})", path.display(), origin, kind);
        }
    }

    Ok(outcomes)
}

/// Extract titled layers of `reference` into `dest_dir`.
pub fn fetch(
    store: &dyn ArtifactStore,
    reference: &ArtifactRef,
    files: &[FetchFile],
    dest_dir: &Path,
) -> Result<Vec<WriteOutcome>> {
    reference.require_complete()?;
    let manifest = image_manifest(store, reference)?;
    let mut outcomes = Vec::new();

    for file in files {
        let layer = manifest
            .layers
            .iter()
            .find(|l| l.title() == Some(file.name.as_str()))
            .with_context(|| format!("{} has no file named `{}`", reference, file.name))?;
        let data = store.read_blob(reference, &layer.digest)?;
        verify_digest(&layer.digest, &data)
            .with_context(|| format!("file `{}` of {} is corrupt", file.name, reference))?;

        let out = join_relative(dest_dir, &file.to)?;
        let origin = format!("{}:{}", reference, file.name);
        match file.unpack {
            Unpack::None => {
                outcomes.push(write_if_changed(&out, &data)?);
            }
            Unpack::Gunzip => {
                let mut plain = Vec::new();
                flate2::read::GzDecoder::new(data.as_slice())
                    .read_to_end(&mut plain)
                    .with_context(|| format!("failed to decompress {}", origin))?;
                outcomes.push(write_if_changed(&out, &plain)?);
            }
            Unpack::Untar => outcomes.extend(unpack_tar(data.as_slice(), &out, &origin)?),
            Unpack::UntarGz => outcomes.extend(unpack_tar(
                flate2::read::GzDecoder::new(data.as_slice()),
                &out,
                &origin,
            )?),
        }
        if let (Some(mode), Unpack::None | Unpack::Gunzip) = (file.mode, file.unpack) {
            set_mode(&out, mode)?;
        }
    }

    Ok(outcomes)
}
