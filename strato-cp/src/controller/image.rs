//! Image controller.
//!
//! The actual byte movement (download, OVA unpack, format conversion) is
//! the ingest pipeline's job; the controller tracks it. URL-sourced images
//! are fetched lazily by node daemons at volume-create time, so they are
//! READY as soon as the record is valid. OVA images wait for their upload
//! job to complete.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{ImageData, ImageFormat, ImagePhase, OvaUploadState, VolumeSource};
use crate::store::Result;

pub struct ImageController {
    ctx: Ctx,
}

impl ImageController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    async fn set_phase(&self, image: &ImageData, phase: ImagePhase, message: Option<String>) -> Result<()> {
        self.ctx
            .images()
            .patch_status(&image.meta.project_id, &image.meta.id, |i| {
                i.status.phase = phase;
                i.status.error_message = message.clone();
                i.status.observed_generation = i.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reconcile_ova(&self, image: ImageData) -> Result<Outcome> {
        let jobs = self.ctx.regs.ova_jobs.list(None, None).await?;
        let job = jobs.iter().find(|j| j.spec.image_id == image.meta.id);

        let Some(job) = job else {
            // Upload not started yet.
            if image.status.phase != ImagePhase::Pending {
                self.set_phase(&image, ImagePhase::Pending, None).await?;
            }
            return Ok(Outcome::RequeueAfter(Duration::from_secs(2)));
        };

        match job.status.state {
            OvaUploadState::Pending | OvaUploadState::Uploading => {
                if image.status.phase != ImagePhase::Downloading {
                    self.set_phase(&image, ImagePhase::Downloading, None).await?;
                }
                Ok(Outcome::RequeueAfter(Duration::from_secs(2)))
            }
            OvaUploadState::Converting => {
                if image.status.phase != ImagePhase::Converting {
                    self.set_phase(&image, ImagePhase::Converting, None).await?;
                }
                Ok(Outcome::RequeueAfter(Duration::from_secs(2)))
            }
            OvaUploadState::Completed => {
                if image.status.phase != ImagePhase::Ready {
                    self.set_phase(&image, ImagePhase::Ready, None).await?;
                    info!(image = %image.meta.id, "image ready (ova ingest complete)");
                }
                Ok(Outcome::Done)
            }
            OvaUploadState::Failed => {
                self.set_phase(
                    &image,
                    ImagePhase::Error,
                    Some(
                        job.status
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "ova ingest failed".to_string()),
                    ),
                )
                .await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn finalize(&self, image: ImageData) -> Result<Outcome> {
        // Volumes cloned from the image keep it pinned.
        let volumes = self.ctx.regs.volumes.list(None, None).await?;
        let pinned = volumes.iter().any(|v| {
            matches!(&v.spec.source, Some(VolumeSource::Image { image_id }) if image_id == &image.meta.id)
        });
        if pinned {
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        // Drop the side-table job, if any.
        let jobs = self.ctx.regs.ova_jobs.list(None, None).await?;
        for job in jobs {
            if job.spec.image_id == image.meta.id {
                self.ctx
                    .regs
                    .ova_jobs
                    .remove(&job.meta.project_id, &job.meta.id)
                    .await?;
            }
        }

        self.ctx
            .images()
            .remove(&image.meta.project_id, &image.meta.id)
            .await?;
        info!(image = %image.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for ImageController {
    fn kind(&self) -> &'static str {
        "image"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(image) = self.ctx.regs.images.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if image.meta.deleting() {
            return self.finalize(image).await;
        }

        match image.spec.format {
            ImageFormat::Ova => self.reconcile_ova(image).await,
            ImageFormat::Qcow2 | ImageFormat::Raw => {
                if image.status.phase != ImagePhase::Ready {
                    self.set_phase(&image, ImagePhase::Ready, None).await?;
                }
                Ok(Outcome::Done)
            }
        }
    }
}
