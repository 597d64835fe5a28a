use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::bulk_segmentation::FinalizeCandidate;
use crate::services::bulk_uploads::{BulkPageInput, NewBulkUpload};

#[derive(Debug, Deserialize, Serialize, Validate)]
pub(crate) struct BulkPageRequest {
    #[validate(range(min = 1, message = "page_number must be positive"))]
    pub(crate) page_number: i32,
    #[validate(length(min = 1, message = "image_key must not be empty"))]
    pub(crate) image_key: String,
    #[serde(default)]
    #[validate(range(min = 0, message = "width must be non-negative"))]
    pub(crate) width: i32,
    #[serde(default)]
    #[validate(range(min = 0, message = "height must be non-negative"))]
    pub(crate) height: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct BulkUploadRequest {
    #[validate(length(min = 1, message = "original_filename must not be empty"))]
    pub(crate) original_filename: String,
    #[serde(default)]
    pub(crate) stored_path: String,
    #[validate(length(min = 1, message = "pages must not be empty"), nested)]
    pub(crate) pages: Vec<BulkPageRequest>,
    #[serde(default)]
    pub(crate) roster: Option<String>,
    #[serde(default = "default_min_pages_per_student")]
    #[validate(range(min = 1, message = "min_pages_per_student must be at least 1"))]
    pub(crate) min_pages_per_student: usize,
}

fn default_min_pages_per_student() -> usize {
    1
}

impl From<BulkUploadRequest> for NewBulkUpload {
    fn from(request: BulkUploadRequest) -> Self {
        Self {
            original_filename: request.original_filename,
            stored_path: request.stored_path,
            pages: request
                .pages
                .into_iter()
                .map(|page| BulkPageInput {
                    page_number: page.page_number,
                    image_key: page.image_key,
                    width: page.width,
                    height: page.height,
                })
                .collect(),
            roster: request.roster,
            min_pages_per_student: request.min_pages_per_student,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkFinalizeRequest {
    pub(crate) candidates: Vec<FinalizeCandidate>,
}
