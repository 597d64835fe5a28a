pub(crate) mod bulk_uploads;
pub(crate) mod exams;
pub(crate) mod health;
pub(crate) mod key_pages;
pub(crate) mod parse_runs;
pub(crate) mod questions;
pub(crate) mod submissions;
