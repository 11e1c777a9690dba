// Test modules

pub mod common;

mod finding_service_test;
mod ingest_service_test;
mod meta_analyzer_test;
mod scoring_service_test;
mod template_service_test;
mod window_service_test;
