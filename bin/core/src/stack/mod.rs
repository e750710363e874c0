pub mod git_sync;

pub use git_sync::run_git_sync_job;
