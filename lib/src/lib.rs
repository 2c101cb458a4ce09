//! Isthmus implementation details.
//!
//! Isthmus lets request-processing logic written as an extension run inside the request pipeline
//! of a native proxy. The proxy is reached only through the [`Host`] trait; the extension
//! implements [`Plugin`] and [`StreamFilter`]; and a [`Bridge`] sits between the two.

// When building the project in release mode:
//   (1): Promote warnings into errors.
//   (2): Deny broken documentation links.
//   (3): Deny invalid codeblock attributes in documentation.
//   (4): Promote warnings in examples into errors, except for unused variables.
#![cfg_attr(not(debug_assertions), deny(warnings))]
#![cfg_attr(not(debug_assertions), deny(clippy::all))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::invalid_codeblock_attributes))]
#![cfg_attr(not(debug_assertions), doc(test(attr(deny(warnings)))))]
#![cfg_attr(not(debug_assertions), doc(test(attr(allow(dead_code)))))]
#![cfg_attr(not(debug_assertions), doc(test(attr(allow(unused_variables)))))]

pub mod config;
pub mod error;
pub mod execute;
pub mod fault;
pub mod filter;
pub mod handles;
pub mod headers;
pub mod host;
pub mod local;
pub mod logging;
pub mod marshal;
pub mod registry;
pub mod session;
pub mod status;

pub use {
    config::BridgeConfig,
    error::{Abort, Error},
    execute::Bridge,
    fault::FAULT_MARKER,
    filter::{DataChunk, FilterStatus, Phase, Plugin, StreamFilter},
    headers::HeaderMap,
    host::Host,
    local::LocalHost,
    session::Request,
    status::Status,
};
