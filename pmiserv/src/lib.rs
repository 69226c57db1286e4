//! pmiserv: process-group rendezvous service for a distributed job launcher.
//!
//! Worker processes connect over the v1 or v2 text protocol to publish and
//! look up endpoint data in a per-job KVS and to meet at barriers and fences.

mod version;

pub mod dispatch;
pub mod error;
pub mod group;
pub mod kvs;
pub mod nameserv;
pub mod server;
pub mod service;
pub mod token;
pub mod wire;

pub use dispatch::{Handler, HandlerFn, HandlerTable};
pub use error::{FrameError, KvsError, NameError, ParseError, PmiError};
pub use group::{Epoch, Pgid, Pid, ProcessGroup};
pub use kvs::Kvs;
pub use nameserv::NameService;
pub use server::{ServerConfig, serve};
pub use service::{
    Binding, ConnId, DEFAULT_PGID, Outbound, PmiService, ServiceConfig, ServiceSnapshot,
};
pub use token::{Token, Tokens};
pub use version::{PMISERV_VERSION, VersionInfo};
