//! ImageStore - Manages image storage on disk.
//!
//! Handles registry pulls, OCI archive imports and layer extraction.

use super::puller::pull_oci_image;
use super::{LayerCompression, PulledImageData, PulledLayer, layer_compression};
use crate::error::ImageError;
use crate::runtime::Image;
use flate2::read::GzDecoder;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use tokio::fs;
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";

/// Metadata stored alongside image files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageMetadata {
    image_ref: String,
    digest: String,
    layers: Vec<StoredLayer>,
    unpacked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLayer {
    media_type: String,
    file: String,
}

#[derive(Deserialize)]
struct LayoutIndex {
    manifests: Vec<LayoutDescriptor>,
}

#[derive(Deserialize)]
struct LayoutManifest {
    config: LayoutDescriptor,
    layers: Vec<LayoutDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutDescriptor {
    media_type: String,
    digest: String,
}

/// Images of one namespace, one directory per image.
pub struct ImageStore {
    base_dir: PathBuf,
}

impl ImageStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Find a stored image by reference, preferring an unpacked copy.
    pub async fn find(&self, image_ref: &str) -> Result<Option<Image>, ImageError> {
        let mut found = None;
        for (dir, metadata) in self.scan().await? {
            if metadata.image_ref != image_ref {
                continue;
            }
            let image = to_image(&dir, &metadata);
            if image.is_unpacked() {
                return Ok(Some(image));
            }
            found.get_or_insert(image);
        }
        Ok(found)
    }

    /// Pull `image_ref` from its registry, store and unpack it.
    pub async fn pull(&self, image_ref: &str) -> Result<Image, ImageError> {
        let image_data = pull_oci_image(image_ref).await?;
        let dir = self.store(image_ref, image_data).await?;
        self.unpack_dir(&dir).await
    }

    /// Import every manifest of an OCI image-layout tar archive as `image_ref`.
    pub async fn import(&self, image_ref: &str, archive: &Path) -> Result<Vec<Image>, ImageError> {
        info!(
            "ImageStore: Importing {} from {}",
            image_ref,
            archive.display()
        );

        let archive = archive.to_path_buf();
        let blobs = tokio::task::spawn_blocking(move || read_layout(&archive))
            .await
            .map_err(|e| ImageError::InvalidBundle(e.to_string()))??;

        let index: LayoutIndex = parse_blob(&blobs, "index.json")?;
        let mut images = Vec::with_capacity(index.manifests.len());
        for entry in index.manifests {
            let manifest: LayoutManifest = parse_blob(&blobs, &blob_path(&entry.digest)?)?;
            let config = blob(&blobs, &manifest.config.digest)?.to_vec();

            let mut layers = Vec::new();
            for layer in manifest.layers {
                if layer_compression(&layer.media_type).is_none() {
                    warn!(
                        "ImageStore: Skipping layer with unsupported media type: {}",
                        layer.media_type
                    );
                    continue;
                }
                let data = blob(&blobs, &layer.digest)?.to_vec();
                layers.push(PulledLayer {
                    media_type: layer.media_type,
                    data,
                });
            }

            let image_data = PulledImageData {
                digest: entry.digest,
                config,
                layers,
            };
            let dir = self.store(image_ref, image_data).await?;
            let metadata = read_metadata(&dir).await?;
            images.push(to_image(&dir, &metadata));
        }

        Ok(images)
    }

    /// Extract the layers of a stored image into its rootfs.
    pub async fn unpack(&self, image: &Image) -> Result<Image, ImageError> {
        if image.is_unpacked() {
            return Ok(image.clone());
        }
        for (dir, metadata) in self.scan().await? {
            if metadata.image_ref == image.name && metadata.digest == image.digest {
                return self.unpack_dir(&dir).await;
            }
        }
        Err(ImageError::Storage(format!(
            "image {} ({}) is not stored",
            image.name, image.digest
        )))
    }

    async fn store(
        &self,
        image_ref: &str,
        image_data: PulledImageData,
    ) -> Result<PathBuf, ImageError> {
        let dir = self.base_dir.join(Uuid::new_v4().to_string());
        let layers_dir = dir.join("layers");
        fs::create_dir_all(&layers_dir).await?;

        let mut layers = Vec::with_capacity(image_data.layers.len());
        for (i, layer) in image_data.layers.into_iter().enumerate() {
            let file = format!("{i}.tar");
            fs::write(layers_dir.join(&file), layer.data).await?;
            layers.push(StoredLayer {
                media_type: layer.media_type,
                file,
            });
        }

        fs::write(dir.join("config.json"), image_data.config).await?;
        let metadata = ImageMetadata {
            image_ref: image_ref.to_string(),
            digest: image_data.digest,
            layers,
            unpacked: false,
        };
        write_metadata(&dir, &metadata).await?;

        info!(
            "ImageStore: Stored {} ({}) at {}",
            metadata.image_ref,
            metadata.digest,
            dir.display()
        );
        Ok(dir)
    }

    async fn unpack_dir(&self, dir: &Path) -> Result<Image, ImageError> {
        let mut metadata = read_metadata(dir).await?;
        if metadata.unpacked {
            return Ok(to_image(dir, &metadata));
        }

        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs).await?;

        for layer in &metadata.layers {
            let Some(compression) = layer_compression(&layer.media_type) else {
                warn!(
                    "ImageStore: Skipping layer with unsupported media type: {}",
                    layer.media_type
                );
                continue;
            };
            let path = dir.join("layers").join(&layer.file);
            let rootfs = rootfs.clone();

            // Extract layer in blocking task
            tokio::task::spawn_blocking(move || extract_layer(&path, compression, &rootfs))
                .await
                .map_err(|e| ImageError::LayerExtraction(e.to_string()))?
                .map_err(|e| ImageError::LayerExtraction(e.to_string()))?;
        }

        metadata.unpacked = true;
        write_metadata(dir, &metadata).await?;
        info!(
            "ImageStore: Unpacked {} into {}",
            metadata.image_ref,
            rootfs.display()
        );
        Ok(to_image(dir, &metadata))
    }

    async fn scan(&self) -> Result<Vec<(PathBuf, ImageMetadata)>, ImageError> {
        let mut images = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_metadata(&path).await {
                Ok(metadata) => images.push((path, metadata)),
                Err(e) => warn!("ImageStore: Skipping {}: {}", path.display(), e),
            }
        }
        Ok(images)
    }
}

fn to_image(dir: &Path, metadata: &ImageMetadata) -> Image {
    Image {
        name: metadata.image_ref.clone(),
        digest: metadata.digest.clone(),
        rootfs: metadata.unpacked.then(|| dir.join("rootfs")),
    }
}

async fn read_metadata(dir: &Path) -> Result<ImageMetadata, ImageError> {
    let content = fs::read(dir.join(METADATA_FILE)).await?;
    serde_json::from_slice(&content).map_err(|e| ImageError::Storage(e.to_string()))
}

async fn write_metadata(dir: &Path, metadata: &ImageMetadata) -> Result<(), ImageError> {
    let json =
        serde_json::to_vec_pretty(metadata).map_err(|e| ImageError::Storage(e.to_string()))?;
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, dir.join(METADATA_FILE)).await?;
    Ok(())
}

fn extract_layer(path: &Path, compression: LayerCompression, rootfs: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    match compression {
        LayerCompression::Gzip => Archive::new(GzDecoder::new(file)).unpack(rootfs),
        LayerCompression::None => Archive::new(file).unpack(rootfs),
    }
}

/// Read every regular file of an OCI image-layout archive into memory.
fn read_layout(archive: &Path) -> Result<HashMap<String, Vec<u8>>, ImageError> {
    let file = File::open(archive)
        .map_err(|e| ImageError::InvalidBundle(format!("{}: {e}", archive.display())))?;
    let mut archive = Archive::new(file);

    let mut blobs = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        blobs.insert(path, data);
    }
    Ok(blobs)
}

fn blob_path(digest: &str) -> Result<String, ImageError> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => {
            Ok(format!("blobs/{algorithm}/{hex}"))
        }
        _ => Err(ImageError::InvalidBundle(format!("invalid digest '{digest}'"))),
    }
}

fn blob<'a>(blobs: &'a HashMap<String, Vec<u8>>, digest: &str) -> Result<&'a [u8], ImageError> {
    let path = blob_path(digest)?;
    blobs
        .get(&path)
        .map(Vec::as_slice)
        .ok_or_else(|| ImageError::InvalidBundle(format!("missing blob {path}")))
}

fn parse_blob<T: DeserializeOwned>(
    blobs: &HashMap<String, Vec<u8>>,
    path: &str,
) -> Result<T, ImageError> {
    let data = blobs
        .get(path)
        .ok_or_else(|| ImageError::InvalidBundle(format!("missing {path}")))?;
    serde_json::from_slice(data).map_err(|e| ImageError::InvalidBundle(format!("{path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn layer() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "hello.txt", b"hello from layer");
        builder.into_inner().unwrap()
    }

    /// OCI image-layout archive holding `manifests` copies of a one-layer image.
    fn layout(dir: &Path, manifests: usize) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#);
        append(&mut builder, "blobs/sha256/layer", &layer());
        append(&mut builder, "blobs/sha256/config", br#"{"architecture":"amd64"}"#);

        let mut entries = Vec::new();
        for i in 0..manifests {
            let manifest = format!(
                r#"{{"schemaVersion":2,
                    "config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:config","size":1}},
                    "layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"sha256:layer","size":1}}]}}"#
            );
            append(
                &mut builder,
                &format!("blobs/sha256/manifest{i}"),
                manifest.as_bytes(),
            );
            entries.push(format!(
                r#"{{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:manifest{i}","size":1}}"#
            ));
        }
        let index = format!(
            r#"{{"schemaVersion":2,"manifests":[{}]}}"#,
            entries.join(",")
        );
        append(&mut builder, "index.json", index.as_bytes());

        let path = dir.join("image.tar");
        std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn import_then_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("images"));
        let archive = layout(dir.path(), 1);

        let images = store.import("app:1", &archive).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "app:1");
        assert_eq!(images[0].digest, "sha256:manifest0");
        assert!(!images[0].is_unpacked());

        let image = store.unpack(&images[0]).await.unwrap();
        let rootfs = image.rootfs.clone().unwrap();
        assert_eq!(
            std::fs::read_to_string(rootfs.join("hello.txt")).unwrap(),
            "hello from layer"
        );

        assert_eq!(store.find("app:1").await.unwrap(), Some(image));
        assert_eq!(store.find("other:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn import_reports_every_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("images"));
        let archive = layout(dir.path(), 2);

        let images = store.import("app:1", &archive).await.unwrap();
        assert_eq!(images.len(), 2);
    }

    #[tokio::test]
    async fn import_rejects_archive_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("images"));
        let path = dir.path().join("broken.tar");
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "oci-layout", b"{}");
        std::fs::write(&path, builder.into_inner().unwrap()).unwrap();

        let err = store.import("app:1", &path).await.unwrap_err();
        assert!(matches!(err, ImageError::InvalidBundle(_)));
    }

    #[test]
    fn blob_paths() {
        assert_eq!(blob_path("sha256:abc").unwrap(), "blobs/sha256/abc");
        assert!(blob_path("abc").is_err());
        assert!(blob_path("sha256:").is_err());
    }
}
