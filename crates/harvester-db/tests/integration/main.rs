mod common;
mod job_store_tests;
mod queue_tests;
mod record_store_tests;
mod pipeline_tests;
mod queue_manager_tests;
