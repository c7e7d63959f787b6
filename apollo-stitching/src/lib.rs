//! Delegation, type merging and result stitching for composed GraphQL schemas.
//!
//! A [`StitchedSchema`] answers a composed schema by delegating each root field to
//! the subschema owning it. Objects of a merged type are completed with the
//! fields other subschemas provide, fetched stage by stage, batched per tick and
//! merged back with their errors located where they belong.

#![warn(unreachable_pub)]

#[macro_use]
pub mod json_ext;

mod batch_delegate;
mod batching;
pub mod configuration;
mod context;
pub mod delegate;
pub mod error;
pub mod executor;
mod expectant_store;
mod gateway;
pub mod graphql;
mod local;
pub mod merge;
mod planner;
mod receiver;
mod resolve_info;
mod selection;
mod stitching_info;
pub mod subschema;
pub mod transform;

pub use batch_delegate::BatchDelegateOptions;
pub use batch_delegate::batch_delegate_to_schema;
pub use configuration::Configuration;
pub use context::Context;
pub use delegate::DelegationOptions;
pub use delegate::delegate_to_schema;
pub use expectant_store::ExpectantStore;
pub use gateway::StitchedSchema;
pub use local::FieldResolver;
pub use local::LocalSchema;
pub use receiver::ReceiverHandle;
pub use resolve_info::OperationInfo;
pub use resolve_info::ResolveInfo;
pub use selection::parse_selection_set;
pub use stitching_info::MergedTypeInfo;
pub use stitching_info::StitchingInfo;
pub use subschema::MergedTypeConfig;
pub use subschema::Subschema;
pub use subschema::SubschemaConfig;
