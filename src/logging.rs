/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out significant occurrences in the runtime.
//!
//! Shardcast logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two
//! values are always:
//! 1. The name of the occurrence in PascalCase (defined in this module as constants).
//! 2. The time the line was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of occurrence. For example, the
//! following snippet is how an ordered send is printed:
//!
//! ```text
//! OrderedSend, 1701329264, 2, 7, 153
//! ```
//!
//! In the snippet, the third value is the subgroup id, the fourth is the method tag, and
//! the fifth is the serialized payload size in bytes.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::types::data_types::{MethodTag, NodeId, SubgroupId, Version, ViewId};

// Names of each occurrence in PascalCase for printing:
pub const ORDERED_SEND: &str = "OrderedSend";
pub const P2P_SEND: &str = "P2pSend";
pub const DELIVER: &str = "Deliver";

pub const MAKE_VERSION: &str = "MakeVersion";
pub const PERSIST: &str = "Persist";
pub const SIGN: &str = "Sign";
pub const TRIM: &str = "Trim";
pub const TRUNCATE: &str = "Truncate";

pub const INSTALL_VIEW: &str = "InstallView";

pub const SEND_OBJECT: &str = "SendObject";
pub const RECEIVE_OBJECT: &str = "ReceiveObject";

pub(crate) fn log_ordered_send(subgroup_id: SubgroupId, tag: MethodTag, payload_size: usize) {
    log::info!(
        "{}, {}, {}, {}, {}",
        ORDERED_SEND,
        secs_since_unix_epoch(SystemTime::now()),
        subgroup_id,
        tag,
        payload_size
    )
}

pub(crate) fn log_p2p_send(subgroup_id: SubgroupId, dest: NodeId, tag: MethodTag) {
    log::info!(
        "{}, {}, {}, {}, {}",
        P2P_SEND,
        secs_since_unix_epoch(SystemTime::now()),
        subgroup_id,
        dest,
        tag
    )
}

pub(crate) fn log_deliver(subgroup_id: SubgroupId, version: Version, tag: MethodTag) {
    log::debug!(
        "{}, {}, {}, {}, {}",
        DELIVER,
        secs_since_unix_epoch(SystemTime::now()),
        subgroup_id,
        version,
        tag
    )
}

pub(crate) fn log_make_version(subgroup_prefix: &str, version: Version) {
    log::debug!(
        "{}, {}, {}, {}",
        MAKE_VERSION,
        secs_since_unix_epoch(SystemTime::now()),
        short_prefix(subgroup_prefix),
        version
    )
}

pub(crate) fn log_persist(subgroup_prefix: &str, version: Version) {
    log::info!(
        "{}, {}, {}, {}",
        PERSIST,
        secs_since_unix_epoch(SystemTime::now()),
        short_prefix(subgroup_prefix),
        version
    )
}

pub(crate) fn log_sign(subgroup_prefix: &str, version: Version, signature: &[u8]) {
    log::info!(
        "{}, {}, {}, {}, {}",
        SIGN,
        secs_since_unix_epoch(SystemTime::now()),
        short_prefix(subgroup_prefix),
        version,
        first_seven_base64_chars(signature)
    )
}

pub(crate) fn log_trim(subgroup_prefix: &str, earliest_version: Version) {
    log::info!(
        "{}, {}, {}, {}",
        TRIM,
        secs_since_unix_epoch(SystemTime::now()),
        short_prefix(subgroup_prefix),
        earliest_version
    )
}

pub(crate) fn log_truncate(subgroup_prefix: &str, latest_version: Version) {
    log::info!(
        "{}, {}, {}, {}",
        TRUNCATE,
        secs_since_unix_epoch(SystemTime::now()),
        short_prefix(subgroup_prefix),
        latest_version
    )
}

pub(crate) fn log_install_view(view_id: ViewId, num_members: usize) {
    log::info!(
        "{}, {}, {}, {}",
        INSTALL_VIEW,
        secs_since_unix_epoch(SystemTime::now()),
        view_id,
        num_members
    )
}

pub(crate) fn log_send_object(subgroup_id: SubgroupId, object_size: usize) {
    log::info!(
        "{}, {}, {}, {}",
        SEND_OBJECT,
        secs_since_unix_epoch(SystemTime::now()),
        subgroup_id,
        object_size
    )
}

pub(crate) fn log_receive_object(subgroup_id: SubgroupId, bytes_consumed: usize) {
    log::info!(
        "{}, {}, {}, {}",
        RECEIVE_OBJECT,
        secs_since_unix_epoch(SystemTime::now()),
        subgroup_id,
        bytes_consumed
    )
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system time is before the unix epoch")
        .as_secs()
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let base64 = STANDARD_NO_PAD.encode(bytes);
    base64.chars().take(7).collect()
}

fn short_prefix(subgroup_prefix: &str) -> &str {
    &subgroup_prefix[..subgroup_prefix.len().min(7)]
}
