/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator.
//!
//! [`Configuration`] is split up into smaller, subsystem-specific config structs before
//! being passed to components.

use std::path::PathBuf;

use crate::types::data_types::NodeId;

/// Default hard cap on the serialized size of a P2P request payload, in bytes.
pub const DEFAULT_MAX_P2P_REQUEST_PAYLOAD_SIZE: usize = 10 * 1024;

/// Configuration as specified by the operator. This is split up into smaller, subsystem
/// specific config structs before being passed to components.
#[derive(Clone)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub persistence: PersistenceConfig,
    pub rpc: RpcConfig,
}

#[derive(Clone)]
pub struct IdentityConfig {
    pub local_node_id: NodeId,
}

#[derive(Clone)]
pub struct PersistenceConfig {
    /// Whether every persisted version is covered by a chained signature. When true,
    /// `private_key_file` must be set; constructing a replicated handle fails otherwise.
    pub signed_persistent_log: bool,

    /// Path to a raw 32-byte Ed25519 seed file.
    pub private_key_file: Option<PathBuf>,

    /// Directory under which persistent fields write their per-subgroup log files. When
    /// `None`, field logs stay in memory.
    pub storage_root: Option<PathBuf>,
}

#[derive(Clone)]
pub struct RpcConfig {
    /// Hard cap on the serialized size of P2P request arguments.
    pub max_p2p_request_payload_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            max_p2p_request_payload_size: DEFAULT_MAX_P2P_REQUEST_PAYLOAD_SIZE,
        }
    }
}

impl Configuration {
    /// A configuration with signing disabled, in-memory persistence, and default RPC
    /// limits. The starting point used by most tests.
    pub fn unsigned(local_node_id: NodeId) -> Configuration {
        Configuration {
            identity: IdentityConfig { local_node_id },
            persistence: PersistenceConfig {
                signed_persistent_log: false,
                private_key_file: None,
                storage_root: None,
            },
            rpc: RpcConfig::default(),
        }
    }
}
