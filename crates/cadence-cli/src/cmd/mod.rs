pub mod check;
pub mod jobs;
pub mod serve;
pub mod show;
