//! OCI Registry Client - Pulls images from container registries.

use super::{PulledImageData, PulledLayer, layer_compression};
use crate::error::ImageError;
use log::{debug, info, warn};
use oci_distribution::{Client, Reference, client::ClientConfig, secrets::RegistryAuth};

/// Pull an OCI image from a registry.
pub async fn pull_oci_image(image_ref: &str) -> Result<PulledImageData, ImageError> {
    info!("ImagePuller: Fetching image: {}", image_ref);

    let reference = Reference::try_from(image_ref.to_string())
        .map_err(|e| ImageError::InvalidReference(e.to_string()))?;

    let client = Client::new(ClientConfig::default());
    let auth = &RegistryAuth::Anonymous;

    let (manifest, digest, config) = client
        .pull_manifest_and_config(&reference, auth)
        .await
        .map_err(|e| ImageError::Registry(e.to_string()))?;
    debug!(
        "ImagePuller: Pulled manifest {} with {} layers",
        digest,
        manifest.layers.len()
    );

    let mut layers = Vec::new();
    for layer in manifest.layers {
        if layer_compression(&layer.media_type).is_none() {
            warn!(
                "ImagePuller: Skipping layer with unsupported media type: {}",
                layer.media_type
            );
            continue;
        }

        let mut layer_data = Vec::new();
        client
            .pull_blob(&reference, &layer, &mut layer_data)
            .await
            .map_err(|e| ImageError::Registry(e.to_string()))?;
        debug!(
            "ImagePuller: Pulled layer {} ({} bytes)",
            layer.digest,
            layer_data.len()
        );

        layers.push(PulledLayer {
            media_type: layer.media_type.clone(),
            data: layer_data,
        });
    }

    if layers.is_empty() {
        return Err(ImageError::LayerExtraction(
            "No compatible layers found".to_string(),
        ));
    }

    Ok(PulledImageData {
        digest,
        config: config.into_bytes(),
        layers,
    })
}
