//! Image Store - local OCI images backing container snapshots.
//!
//! Images come from a registry pull or from an OCI image-layout archive on
//! disk. Each image lives in its own directory with its layers, its config
//! and, once unpacked, a `rootfs` the container is run from.

mod puller;
mod store;

pub use store::ImageStore;

use oci_distribution::manifest;

/// Data from a pulled or imported image.
#[derive(Debug)]
pub struct PulledImageData {
    pub digest: String,
    pub config: Vec<u8>,
    pub layers: Vec<PulledLayer>,
}

/// A single layer of an image.
#[derive(Debug)]
pub struct PulledLayer {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Compression of a layer blob, `None` for media types we cannot unpack.
pub(crate) fn layer_compression(media_type: &str) -> Option<LayerCompression> {
    match media_type {
        manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE | manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE => {
            Some(LayerCompression::Gzip)
        }
        manifest::IMAGE_LAYER_MEDIA_TYPE | manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE => {
            Some(LayerCompression::None)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LayerCompression {
    None,
    Gzip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_media_types() {
        assert_eq!(
            layer_compression("application/vnd.oci.image.layer.v1.tar+gzip"),
            Some(LayerCompression::Gzip)
        );
        assert_eq!(
            layer_compression("application/vnd.oci.image.layer.v1.tar"),
            Some(LayerCompression::None)
        );
        assert_eq!(
            layer_compression("application/vnd.oci.image.layer.v1.tar+zstd"),
            None
        );
    }
}
