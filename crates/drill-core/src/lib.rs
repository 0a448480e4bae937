//! # drill-core
//!
//! Core functionality for Drill, a disaster recovery test tool for a hub
//! and two managed Kubernetes clusters.
//!
//! This crate provides:
//! - Configuration loading and the sample configuration
//! - Concurrent test flows driving the DR lifecycle of each test
//! - The shared test report and its persistence
//! - The validation engine, with a cluster backend and a mock
//! - Parallel diagnostics gathering from clusters and S3 stores

pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod console;
pub mod flow;
pub mod gather;
pub mod ops;
pub mod report;
pub mod resources;
pub mod s3;
pub mod sample;
pub mod validate;
pub mod validation;

#[cfg(test)]
mod testing;

pub use cluster::{Cluster, Env};
pub use command::{Command, CommandError};
pub use config::{Config, ConfigError, Deployer, TestConfig, Workload};
pub use connection::ConnectionError;
pub use flow::{DrError, DrOperations, Flow, TestRun};
pub use gather::{GatherError, GatherOptions, GatherResult};
pub use ops::KubeOperations;
pub use report::{Report, SharedReport, Status, Step, StepName, Summary, Test};
pub use s3::{Profile, S3Error, S3Result};
pub use sample::{Sample, SampleError, create_sample};
pub use validate::{ValidationReport, ValidationState, ValidationSummary};
pub use validation::{Backend, Mock, Validation, ValidationError};
