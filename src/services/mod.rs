pub(crate) mod answer_key_schema;
pub(crate) mod bulk_segmentation;
pub(crate) mod bulk_uploads;
pub(crate) mod inference;
pub(crate) mod key_parse;
pub(crate) mod key_review;
pub(crate) mod openai_vision;
pub(crate) mod parse_payload;
pub(crate) mod storage;
pub(crate) mod usage;
