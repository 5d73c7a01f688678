/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Remote invocation machinery: the invocable wrapper bound to every replicated object,
//! the per-invocation result futures, and the shared RPC manager that owns buffers and
//! routes replies.

pub mod manager;

pub mod results;

pub mod wrapper;

pub use manager::{Dispatcher, OutgoingP2p, P2pSendBuffer, RequestType, RpcManager};
pub use results::{PendingResults, QueryResults, ResultsError};
pub use wrapper::{ArgList, ArgReader, InvocableWrapper, MethodHandler, MethodTable, RpcError};
