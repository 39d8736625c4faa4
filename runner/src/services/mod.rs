pub mod job_manager;

pub use job_manager::JobManager;
