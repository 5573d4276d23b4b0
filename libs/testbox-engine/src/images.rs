/// Image Lifecycle Manager
///
/// Builds and removes named custom images on top of the base interpreter
/// image. The image store is the only registry: provenance lives in image
/// labels, so nothing is cached here beyond per-name locks and the count of
/// runs currently using each image.
///
/// A build goes to a unique staging tag and is re-tagged to the requested
/// name only after it succeeded, so a failed build never leaves a
/// half-visible image under that name.
use crate::config::LanguageConfig;
use crate::error::{Result, SandboxError};
use crate::install::{parse_libraries, InstallPlan};
use crate::runtime::{
    ContainerRuntime, ImageRemoval, BASE_IMAGE_LABEL, LIBRARIES_LABEL, MANAGED_LABEL,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use testbox_common::types::{
    ImageBuildResponse, ImageBuildStatus, ImageRemoveResponse, ImageRemoveStatus, ImageState,
    ImageStatusResponse,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

lazy_static! {
    static ref IMAGE_NAME: Regex = Regex::new(
        r"^[a-z0-9][a-z0-9._-]{0,63}(?:/[a-z0-9][a-z0-9._-]{0,63}){0,2}(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?$"
    )
    .unwrap();
}

const STAGING_PREFIX: &str = "testbox-staging";

/// A custom image reference: `repo[/path][:tag]`, lowercase, no registry port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName(String);

impl ImageName {
    pub fn parse(raw: &str) -> Result<Self> {
        if !IMAGE_NAME.is_match(raw) {
            return Err(SandboxError::Validation(format!(
                "'{}' is not a valid image name",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `repo:tag`, with `latest` filled in
    pub fn canonical(&self) -> String {
        canonical_reference(&self.0)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_reference(reference: &str) -> String {
    match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => reference.to_string(),
        _ => format!("{}:latest", reference),
    }
}

fn is_managed(labels: &HashMap<String, String>) -> bool {
    labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
}

/// A managed image as recorded in its labels
#[derive(Debug, Clone, PartialEq)]
pub struct CustomImage {
    pub name: String,
    pub base_image: Option<String>,
    /// Normalized names of the baked-in libraries
    pub libraries: BTreeSet<String>,
}

impl CustomImage {
    fn from_labels(name: String, labels: &HashMap<String, String>) -> Self {
        let libraries = labels
            .get(LIBRARIES_LABEL)
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|lib| !lib.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name,
            base_image: labels.get(BASE_IMAGE_LABEL).cloned(),
            libraries,
        }
    }
}

/// One async mutex per image name; entries disappear when nobody holds or waits.
#[derive(Default)]
struct NameLocks {
    slots: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    slot: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl NameLocks {
    async fn lock(&self, name: &str) -> NameGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(name.to_string()).or_default().clone()
        };
        let held = slot.clone().lock_owned().await;
        NameGuard {
            locks: self,
            name: name.to_string(),
            slot,
            held: Some(held),
        }
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut slots = self.locks.slots.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this guard are the only owners left
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.name);
        }
    }
}

type Counts = Arc<StdMutex<HashMap<String, usize>>>;

/// Marks an image as used by a run until dropped
#[derive(Debug)]
pub struct ImageLease {
    counts: Counts,
    image: String,
}

impl Drop for ImageLease {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&self.image) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.image);
            }
        }
    }
}

struct BuildingMark {
    building: Arc<StdMutex<HashSet<String>>>,
    image: String,
}

impl Drop for BuildingMark {
    fn drop(&mut self) {
        self.building
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.image);
    }
}

pub struct ImageManager {
    runtime: Arc<dyn ContainerRuntime>,
    base: LanguageConfig,
    locks: NameLocks,
    leases: Counts,
    building: Arc<StdMutex<HashSet<String>>>,
}

impl ImageManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, base: LanguageConfig) -> Self {
        Self {
            runtime,
            base,
            locks: NameLocks::default(),
            leases: Arc::default(),
            building: Arc::default(),
        }
    }

    fn lease_count(&self, image: &str) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(image)
            .copied()
            .unwrap_or(0)
    }

    fn mark_building(&self, image: &str) -> BuildingMark {
        self.building
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(image.to_string());
        BuildingMark {
            building: self.building.clone(),
            image: image.to_string(),
        }
    }

    /// Build `image_name` from the base image with `libraries` baked in.
    ///
    /// Rebuilding an existing name replaces it: the last build wins.
    #[tracing::instrument(skip(self, libraries))]
    pub async fn build(&self, image_name: &str, libraries: &[String]) -> Result<ImageBuildResponse> {
        let name = ImageName::parse(image_name)?;
        let libraries = parse_libraries(libraries)?;
        let target = name.canonical();

        if target == canonical_reference(&self.base.image) {
            return Err(SandboxError::Validation(format!(
                "'{}' would replace the base image",
                image_name
            )));
        }

        let _lock = self.locks.lock(&target).await;
        let _building = self.mark_building(&target);

        let previous = match self.runtime.image_labels(&target).await? {
            Some(labels) if is_managed(&labels) => self.runtime.image_id(&target).await?,
            _ => None,
        };

        let plan = InstallPlan::for_libraries(&libraries);
        let dockerfile = dockerfile(&self.base, &plan);
        let context = build_context(&dockerfile)?;

        let baked: Vec<String> = libraries.iter().map(|lib| lib.normalized()).collect();
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (BASE_IMAGE_LABEL.to_string(), self.base.image.clone()),
            (LIBRARIES_LABEL.to_string(), baked.join(",")),
        ]);

        let staging = format!("{}-{}:build", STAGING_PREFIX, uuid::Uuid::new_v4().simple());
        info!(image = %target, staging = %staging, libraries = ?baked, "Building custom image");

        let outcome = self.runtime.build_image(&staging, context, labels).await?;
        if !outcome.success {
            self.discard_staging(&staging).await;
            warn!(image = %target, error = ?outcome.error, "Custom image build failed");
            return Ok(ImageBuildResponse {
                image_name: target,
                status: ImageBuildStatus::Error,
                log: outcome.log,
                error: outcome.error.or_else(|| Some("image build failed".to_string())),
            });
        }

        if let Err(e) = self.runtime.tag_image(&staging, &target).await {
            self.discard_staging(&staging).await;
            warn!(image = %target, error = %e, "Failed to tag built image");
            return Ok(ImageBuildResponse {
                image_name: target,
                status: ImageBuildStatus::Error,
                log: outcome.log,
                error: Some(format!("tagging failed: {}", e)),
            });
        }
        self.discard_staging(&staging).await;
        if let Some(previous) = previous {
            self.discard_replaced(&target, &previous).await;
        }

        info!(image = %target, "✓ Custom image ready");
        Ok(ImageBuildResponse {
            image_name: target,
            status: ImageBuildStatus::Success,
            log: outcome.log,
            error: None,
        })
    }

    async fn discard_staging(&self, staging: &str) {
        match self.runtime.remove_image(staging).await {
            Ok(ImageRemoval::Removed) | Ok(ImageRemoval::NotFound) => {}
            Ok(ImageRemoval::Conflict(msg)) => {
                warn!(staging = %staging, reason = %msg, "Staging tag left behind")
            }
            Err(e) => warn!(staging = %staging, error = %e, "Failed to remove staging tag"),
        }
    }

    /// Drop the image a rebuild moved `target` away from. A build served
    /// entirely from cache yields the same id, which is kept.
    async fn discard_replaced(&self, target: &str, previous: &str) {
        match self.runtime.image_id(target).await {
            Ok(Some(current)) if current == previous => return,
            Ok(_) => {}
            Err(e) => {
                warn!(image = %target, error = %e, "Could not resolve rebuilt image");
                return;
            }
        }
        match self.runtime.remove_image(previous).await {
            Ok(ImageRemoval::Removed) => {
                debug!(image = %target, previous = %previous, "Replaced image removed")
            }
            Ok(ImageRemoval::NotFound) => {}
            Ok(ImageRemoval::Conflict(msg)) => {
                warn!(previous = %previous, reason = %msg, "Replaced image left behind")
            }
            Err(e) => warn!(previous = %previous, error = %e, "Failed to remove replaced image"),
        }
    }

    /// Remove a managed image. Unknown names report `not_found`; an image
    /// used by a running execution is refused.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, image_name: &str) -> Result<ImageRemoveResponse> {
        let name = ImageName::parse(image_name)?;
        let target = name.canonical();
        let _lock = self.locks.lock(&target).await;

        if self.lease_count(&target) > 0 {
            return Err(SandboxError::ImageInUse(format!(
                "{} is used by a running execution",
                target
            )));
        }

        let managed = self
            .runtime
            .image_labels(&target)
            .await?
            .map(|labels| is_managed(&labels))
            .unwrap_or(false);
        if !managed {
            return Ok(ImageRemoveResponse {
                status: ImageRemoveStatus::NotFound,
                message: format!("Image {} not found", target),
            });
        }

        let response = match self.runtime.remove_image(&target).await? {
            ImageRemoval::Removed => {
                info!(image = %target, "Custom image removed");
                ImageRemoveResponse {
                    status: ImageRemoveStatus::Success,
                    message: format!("Image {} removed", target),
                }
            }
            ImageRemoval::NotFound => ImageRemoveResponse {
                status: ImageRemoveStatus::NotFound,
                message: format!("Image {} not found", target),
            },
            ImageRemoval::Conflict(reason) => ImageRemoveResponse {
                status: ImageRemoveStatus::Conflict,
                message: format!("Image {} could not be removed: {}", target, reason),
            },
        };
        Ok(response)
    }

    /// Resolve a custom image for a run and hold it until the lease drops
    pub async fn lease_for_run(&self, name: &ImageName) -> Result<(ImageLease, CustomImage)> {
        let target = name.canonical();
        let _lock = self.locks.lock(&target).await;

        let labels = self
            .runtime
            .image_labels(&target)
            .await?
            .filter(is_managed)
            .ok_or_else(|| SandboxError::ImageNotFound(target.clone()))?;

        *self
            .leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(target.clone())
            .or_insert(0) += 1;

        let lease = ImageLease {
            counts: self.leases.clone(),
            image: target.clone(),
        };
        Ok((lease, CustomImage::from_labels(target, &labels)))
    }

    pub async fn status(&self, image_name: &str) -> Result<ImageStatusResponse> {
        let name = ImageName::parse(image_name)?;
        let target = name.canonical();

        let building = self
            .building
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target);
        if building {
            return Ok(ImageStatusResponse {
                image_name: target,
                state: ImageState::Building,
                base_image: None,
                libraries: vec![],
            });
        }

        let response = match self.runtime.image_labels(&target).await? {
            Some(labels) if is_managed(&labels) => {
                let image = CustomImage::from_labels(target, &labels);
                ImageStatusResponse {
                    image_name: image.name,
                    state: ImageState::Ready,
                    base_image: image.base_image,
                    libraries: image.libraries.into_iter().collect(),
                }
            }
            _ => ImageStatusResponse {
                image_name: target,
                state: ImageState::Removed,
                base_image: None,
                libraries: vec![],
            },
        };
        Ok(response)
    }
}

fn dockerfile(base: &LanguageConfig, plan: &InstallPlan) -> String {
    let mut dockerfile = format!("FROM {}\n", base.image);
    if let Some(run) = plan.dockerfile_run(&base.interpreter) {
        dockerfile.push_str(&run);
        dockerfile.push('\n');
    }
    dockerfile
}

/// Single-file tar build context
fn build_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, dockerfile.as_bytes())?;
    Ok(builder.into_inner()?)
}
