/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Shared fixtures for the integration test suite: a windowed mock multicast transport,
//! two small replicated objects (a key-value store and a persistently logged counter),
//! and constructors for the runtime plumbing around them. The mocks use in-process
//! buffers to simulate the transport and thus never leave any artifacts.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;

use log::LevelFilter;
use shardcast::config::Configuration;
use shardcast::object::{DeserializationContext, ReplicatedObject};
use shardcast::persistence::Persistent;
use shardcast::rpc::{ArgList, MethodTable, RpcError, RpcManager};
use shardcast::types::data_types::{MethodTag, NodeId, SubgroupId, ViewId};
use shardcast::view::{MulticastGroup, View, ViewManager};

pub const PUT: MethodTag = MethodTag::new(0);
pub const GET: MethodTag = MethodTag::new(1);
pub const ADD: MethodTag = MethodTag::new(0);
pub const PING: MethodTag = MethodTag::new(2);

static LOGGER_INIT: Once = Once::new();

pub fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

/// A mock multicast transport that accepts sends into an in-process buffer whenever its
/// window is open.
pub struct WindowedMulticast {
    window_open: AtomicBool,
    accepted: Mutex<Vec<(SubgroupId, Vec<u8>)>>,
}

impl WindowedMulticast {
    pub fn new(window_open: bool) -> Arc<WindowedMulticast> {
        Arc::new(WindowedMulticast {
            window_open: AtomicBool::new(window_open),
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn open_window(&self) {
        self.window_open.store(true, Ordering::SeqCst);
    }

    pub fn num_accepted(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }

    pub fn take_accepted(&self) -> Vec<(SubgroupId, Vec<u8>)> {
        self.accepted.lock().unwrap().drain(..).collect()
    }
}

impl MulticastGroup for WindowedMulticast {
    fn send(
        &self,
        subgroup_id: SubgroupId,
        size: usize,
        fill: &mut dyn FnMut(&mut [u8]),
        _cooked: bool,
    ) -> bool {
        if !self.window_open.load(Ordering::SeqCst) {
            return false;
        }
        let mut buffer = vec![0u8; size];
        fill(&mut buffer);
        self.accepted.lock().unwrap().push((subgroup_id, buffer));
        true
    }
}

/// Runtime plumbing for one mock node.
pub struct TestNode {
    pub config: Configuration,
    pub rpc_manager: Arc<RpcManager>,
    pub view_manager: Arc<ViewManager>,
    pub transport: Arc<WindowedMulticast>,
}

pub fn test_node(
    local_node_id: NodeId,
    members: Vec<NodeId>,
    subgroup_id: SubgroupId,
    window_open: bool,
) -> TestNode {
    let config = Configuration::unsigned(local_node_id);
    let transport = WindowedMulticast::new(window_open);
    let view = View::new(
        ViewId::new(0),
        members,
        Arc::clone(&transport) as Arc<dyn MulticastGroup>,
    );
    let max_payload_sizes = HashMap::from([(subgroup_id, 4096usize)]);
    TestNode {
        config,
        rpc_manager: Arc::new(RpcManager::new(local_node_id)),
        view_manager: Arc::new(ViewManager::new(view, max_payload_sizes)),
        transport,
    }
}

/// A replicated key-value store with no persistent fields. `PUT` returns the previous
/// value of the key, `GET` the current one; `PING` echoes a unit.
pub struct KvStore {
    entries: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }
}

impl ReplicatedObject for KvStore {
    fn type_name() -> &'static str {
        "tests::KvStore"
    }

    fn register_methods() -> MethodTable<Self> {
        MethodTable::new()
            .method(PUT, |store: &mut KvStore, mut args| {
                let key: String = args.next()?;
                let value: String = args.next()?;
                let previous = store.entries.insert(key, value);
                previous.try_to_vec().map_err(RpcError::Encode)
            })
            .method(GET, |store: &mut KvStore, mut args| {
                let key: String = args.next()?;
                let value = store.entries.get(&key).cloned();
                value.try_to_vec().map_err(RpcError::Encode)
            })
            .method(PING, |_store: &mut KvStore, _args| {
                ().try_to_vec().map_err(RpcError::Encode)
            })
    }

    fn to_bytes(&self) -> Result<Vec<u8>, io::Error> {
        self.entries.try_to_vec()
    }

    fn from_bytes(
        _ctx: &mut DeserializationContext,
        bytes: &[u8],
    ) -> Result<(Self, usize), io::Error> {
        let mut slice = bytes;
        let entries = BTreeMap::deserialize(&mut slice)?;
        Ok((KvStore { entries }, bytes.len() - slice.len()))
    }
}

/// A replicated counter whose running total lives in a persistent field. `ADD` bumps the
/// total and returns the new value.
pub struct LoggedCounter {
    pub total: Persistent<u64>,
}

impl ReplicatedObject for LoggedCounter {
    fn type_name() -> &'static str {
        "tests::LoggedCounter"
    }

    fn register_methods() -> MethodTable<Self> {
        MethodTable::new().method(ADD, |counter: &mut LoggedCounter, mut args| {
            let amount: u64 = args.next()?;
            counter.total.update(|total| *total += amount);
            counter.total.get().try_to_vec().map_err(RpcError::Encode)
        })
    }

    fn to_bytes(&self) -> Result<Vec<u8>, io::Error> {
        self.total.to_bytes()
    }

    fn from_bytes(
        ctx: &mut DeserializationContext,
        bytes: &[u8],
    ) -> Result<(Self, usize), io::Error> {
        let (total, consumed) = Persistent::from_bytes(ctx, bytes)?;
        Ok((LoggedCounter { total }, consumed))
    }
}

/// Build the argument list for a `PUT`.
pub fn put_args(key: &str, value: &str) -> ArgList {
    ArgList::new()
        .arg(&key.to_string())
        .unwrap()
        .arg(&value.to_string())
        .unwrap()
}

/// Build the argument list for a `GET`.
pub fn get_args(key: &str) -> ArgList {
    ArgList::new().arg(&key.to_string()).unwrap()
}
