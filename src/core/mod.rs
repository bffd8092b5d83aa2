//! Core of keystone: artifact model, linking, deployment, the hub client,
//! verification and the orchestrator that drives them.

pub mod address;
pub mod artifact;
pub mod backend;
pub mod codec;
pub mod config;
pub mod deployer;
pub mod error;
pub mod journal;
pub mod linker;
pub mod namereg;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod sim;
pub mod time;
pub mod verify;
