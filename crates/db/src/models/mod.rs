pub mod business;
pub mod review;
pub mod sync_job;
