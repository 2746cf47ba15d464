//! Image resolution for instance creation.

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::cloud::{CloudError, InstanceSpec};

use super::ScalewayCloud;

impl ScalewayCloud {
    /// Resolves the image label to the newest available image for the
    /// requested architecture, preferring project images over public ones.
    pub(super) async fn resolve_image_id(&self, spec: &InstanceSpec) -> Result<String, CloudError> {
        let project_images =
            ScalewayListInstanceImagesBuilder::new(self.api.clone(), &spec.zone)
                .public(true)
                .project(&self.project_id)
                .name(&spec.image)
                .arch(&spec.architecture)
                .run_async()
                .await
                .map_err(|err| CloudError::provider("list project images", &err))?;

        let candidates = filter_images(project_images, &spec.architecture);
        if !candidates.is_empty() {
            return select_latest(candidates, spec);
        }

        let public_images = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &spec.zone)
            .public(true)
            .name(&spec.image)
            .arch(&spec.architecture)
            .run_async()
            .await
            .map_err(|err| CloudError::provider("list public images", &err))?;
        select_latest(filter_images(public_images, &spec.architecture), spec)
    }
}

pub(super) fn filter_images(images: Vec<ScalewayImage>, architecture: &str) -> Vec<ScalewayImage> {
    images
        .into_iter()
        .filter(|image| image.arch == architecture)
        .filter(|image| image.state == "available")
        .collect()
}

pub(super) fn select_latest(
    candidates: Vec<ScalewayImage>,
    spec: &InstanceSpec,
) -> Result<String, CloudError> {
    candidates
        .into_iter()
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
        .ok_or_else(|| CloudError::NotFound {
            kind: "image",
            name: format!("{} ({}) in {}", spec.image, spec.architecture, spec.zone),
        })
}
