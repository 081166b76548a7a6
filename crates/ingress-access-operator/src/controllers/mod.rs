//! Kubernetes controllers for watched resources

pub mod retry;
pub mod service;
pub mod visitorgroup;
