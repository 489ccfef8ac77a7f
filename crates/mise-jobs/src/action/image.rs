use async_trait::async_trait;

use mise_core::Result;

use super::{
    not_tracked, require_non_empty, totals_pending, tracked_note, unexpected_payload, Action,
    ActionContext, ActionDeps, ActionName,
};
use crate::payload::JobPayload;

/// Uploads one image through the configured [`mise_core::ImageStore`].
pub struct UploadImageAction;

#[async_trait]
impl Action for UploadImageAction {
    fn name(&self) -> ActionName {
        ActionName::UploadImage
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::Image(job) => {
                require_non_empty(&job.note_id, "noteId")?;
                require_non_empty(&job.image_path, "imagePath")
            }
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let mut job = match data {
            JobPayload::Image(job) => job,
            other => return Err(unexpected_payload(self.name(), &other)),
        };

        // A retry after a successful upload only needs the tracking step.
        if job.image.is_none() {
            let stored = deps.images.upload_image(&job.note_id, &job.image_path).await?;
            job.image = Some(stored);
        }
        Ok(JobPayload::Image(job))
    }
}

/// Counts the uploaded image towards the note's image total.
///
/// Waits (by failing retryably) until the note's image total is registered.
pub struct TrackImageCompletionAction;

#[async_trait]
impl Action for TrackImageCompletionAction {
    fn name(&self) -> ActionName {
        ActionName::TrackImageCompletion
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::Image(job) => {
                require_non_empty(&job.note_id, "noteId")?;
                if job.image.is_none() {
                    return Err(mise_core::Error::Validation(
                        "image must be uploaded before tracking".into(),
                    ));
                }
                Ok(())
            }
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let note_id = data.note_id();
        if !tracked_note(deps, note_id)?.image_total_set {
            return Err(totals_pending(note_id));
        }
        deps.completion
            .mark_image_job_completed(note_id)
            .await
            .ok_or_else(|| not_tracked(note_id))?;
        Ok(data)
    }
}
