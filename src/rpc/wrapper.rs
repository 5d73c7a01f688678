/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The invocable wrapper: binding of a user object to its table of tagged methods, and
//! the wire format of invocations and replies.
//!
//! ## Wire format
//!
//! An invocation message is a fixed-width header — the method tag and the sender-local
//! invocation id, both little-endian `u64`s — followed by a framed sequence of argument
//! payloads: a `u32` argument count, then one `u64` byte-size + byte-stream frame per
//! argument. A reply message is the echoed invocation id followed by the method's
//! serialized return value.
//!
//! The wrapper exposes a side-effect-free size predicate
//! ([`size_for_ordered_send`](InvocableWrapper::size_for_ordered_send)) so the ordered
//! send path can reserve a transport slot of exactly the right size before any byte is
//! written. Serialization then happens inside the transport's fill callback; the buffer
//! the transport hands over must hold exactly the predicted size, and overflowing it is
//! a hard failure.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::data_types::{InvocationId, MethodTag, NodeId, SubgroupTypeId};

use super::results::{results_pair, PendingResults, QueryResults};

const HEADER_SIZE: usize = 8 + 8;

/// The serialized arguments of one invocation: an ordered list of borsh-encoded frames.
#[derive(Clone, Default)]
pub struct ArgList {
    frames: Vec<Vec<u8>>,
}

impl ArgList {
    pub fn new() -> ArgList {
        ArgList { frames: Vec::new() }
    }

    /// Append one argument, borsh-encoding it into its own frame.
    pub fn arg<A: BorshSerialize>(mut self, arg: &A) -> Result<ArgList, RpcError> {
        self.frames.push(arg.try_to_vec().map_err(RpcError::Encode)?);
        Ok(self)
    }

    pub fn num_args(&self) -> usize {
        self.frames.len()
    }
}

/// Reader over the framed arguments of a received invocation. Method handlers pop
/// arguments in registration order.
pub struct ArgReader {
    frames: std::vec::IntoIter<Vec<u8>>,
}

impl ArgReader {
    /// Decode the next argument frame.
    pub fn next<A: BorshDeserialize>(&mut self) -> Result<A, RpcError> {
        let frame = self.frames.next().ok_or(RpcError::MissingArgument)?;
        A::try_from_slice(&frame).map_err(RpcError::Decode)
    }
}

/// Handler for one tagged method of a replicated object.
pub type MethodHandler<T> =
    Box<dyn Fn(&mut T, ArgReader) -> Result<Vec<u8>, RpcError> + Send + Sync>;

/// Table of `(tag -> method)` registrations for one replicated object type.
pub struct MethodTable<T> {
    methods: BTreeMap<MethodTag, MethodHandler<T>>,
}

impl<T> MethodTable<T> {
    pub fn new() -> MethodTable<T> {
        MethodTable {
            methods: BTreeMap::new(),
        }
    }

    /// Register `handler` under `tag`. The handler decodes its arguments from the
    /// [`ArgReader`] and borsh-encodes its return value.
    pub fn method(
        mut self,
        tag: MethodTag,
        handler: impl Fn(&mut T, ArgReader) -> Result<Vec<u8>, RpcError> + Send + Sync + 'static,
    ) -> MethodTable<T> {
        self.methods.insert(tag, Box::new(handler));
        self
    }

    fn get(&self, tag: MethodTag) -> Option<&MethodHandler<T>> {
        self.methods.get(&tag)
    }
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        MethodTable::new()
    }
}

/// The serialized size of an invocation of `args`, at design-level precision: the header
/// plus every argument frame. Side-effect free.
pub(crate) fn invocation_size(args: &ArgList) -> usize {
    HEADER_SIZE + 4 + args.frames.iter().map(|frame| 8 + frame.len()).sum::<usize>()
}

/// Write the invocation `(tag, invocation_id, args)` into `buf`, which must hold exactly
/// [`invocation_size`] bytes.
pub(crate) fn write_invocation(
    buf: &mut [u8],
    tag: MethodTag,
    invocation_id: InvocationId,
    args: &ArgList,
) -> Result<(), RpcError> {
    let required = invocation_size(args);
    if buf.len() < required {
        return Err(RpcError::BufferOverflow {
            required,
            available: buf.len(),
        });
    }
    let mut offset = 0;
    buf[offset..offset + 8].copy_from_slice(&tag.int().to_le_bytes());
    offset += 8;
    buf[offset..offset + 8].copy_from_slice(&invocation_id.int().to_le_bytes());
    offset += 8;
    buf[offset..offset + 4].copy_from_slice(&(args.frames.len() as u32).to_le_bytes());
    offset += 4;
    for frame in &args.frames {
        buf[offset..offset + 8].copy_from_slice(&(frame.len() as u64).to_le_bytes());
        offset += 8;
        buf[offset..offset + frame.len()].copy_from_slice(frame);
        offset += frame.len();
    }
    Ok(())
}

/// Parse an invocation message back into its header and argument frames.
pub(crate) fn parse_invocation(
    payload: &[u8],
) -> Result<(MethodTag, InvocationId, ArgReader), RpcError> {
    if payload.len() < HEADER_SIZE + 4 {
        return Err(RpcError::Malformed);
    }
    let tag = MethodTag::new(u64::from_le_bytes(payload[0..8].try_into().unwrap()));
    let invocation_id =
        InvocationId::new(u64::from_le_bytes(payload[8..16].try_into().unwrap()));
    let num_args = u32::from_le_bytes(payload[16..20].try_into().unwrap()) as usize;

    let mut frames = Vec::with_capacity(num_args);
    let mut offset = HEADER_SIZE + 4;
    for _ in 0..num_args {
        if payload.len() < offset + 8 {
            return Err(RpcError::Malformed);
        }
        let frame_len =
            u64::from_le_bytes(payload[offset..offset + 8].try_into().unwrap()) as usize;
        offset += 8;
        if payload.len() < offset + frame_len {
            return Err(RpcError::Malformed);
        }
        frames.push(payload[offset..offset + frame_len].to_vec());
        offset += frame_len;
    }
    Ok((
        tag,
        invocation_id,
        ArgReader {
            frames: frames.into_iter(),
        },
    ))
}

/// Build the reply message for `invocation_id` around the method's serialized return
/// value.
pub(crate) fn write_reply(invocation_id: InvocationId, result_bytes: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(8 + result_bytes.len());
    reply.extend_from_slice(&invocation_id.int().to_le_bytes());
    reply.extend_from_slice(result_bytes);
    reply
}

/// Parse a reply message into the invocation it answers and the return-value bytes.
pub(crate) fn parse_reply(reply: &[u8]) -> Result<(InvocationId, Vec<u8>), RpcError> {
    if reply.len() < 8 {
        return Err(RpcError::Malformed);
    }
    let invocation_id = InvocationId::new(u64::from_le_bytes(reply[0..8].try_into().unwrap()));
    Ok((invocation_id, reply[8..].to_vec()))
}

/// Binds a user object to its method table, marshals outgoing invocations, and
/// dispatches delivered ones.
///
/// The wrapper shares ownership of the user-object slot with the
/// [replicated handle](crate::replicated::Replicated) that created it: the handle
/// replaces the slot's contents during state transfer, and the wrapper locks it to
/// dispatch.
pub struct InvocableWrapper<T> {
    type_id: SubgroupTypeId,
    object: Arc<Mutex<Option<T>>>,
    table: MethodTable<T>,
    next_invocation: AtomicU64,
}

impl<T: Send + 'static> InvocableWrapper<T> {
    pub(crate) fn new(
        type_id: SubgroupTypeId,
        object: Arc<Mutex<Option<T>>>,
        table: MethodTable<T>,
    ) -> InvocableWrapper<T> {
        InvocableWrapper {
            type_id,
            object,
            table,
            next_invocation: AtomicU64::new(0),
        }
    }

    pub(crate) fn type_id(&self) -> SubgroupTypeId {
        self.type_id
    }

    /// The serialized size of an ordered send of `(tag, args)`. Side-effect free.
    pub(crate) fn size_for_ordered_send(&self, args: &ArgList) -> usize {
        invocation_size(args)
    }

    /// Serialize `(tag, args)` into `buf` under a fresh invocation id and return the
    /// results/pending pair for it. `buf` is transport-owned; the caller must not retain
    /// it past this call.
    pub(crate) fn marshal_into<R>(
        &self,
        buf: &mut [u8],
        tag: MethodTag,
        args: &ArgList,
    ) -> Result<(QueryResults<R>, PendingResults), RpcError> {
        let invocation_id =
            InvocationId::new(self.next_invocation.fetch_add(1, Ordering::Relaxed));
        write_invocation(buf, tag, invocation_id, args)?;
        Ok(results_pair(invocation_id))
    }

    /// Dispatch a delivered invocation to the bound object, returning the serialized
    /// reply message.
    pub(crate) fn dispatch(&self, _from: NodeId, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        let (tag, invocation_id, args) = parse_invocation(payload)?;
        let handler = self.table.get(tag).ok_or(RpcError::UnknownMethod(tag))?;
        let mut object = self.object.lock().unwrap();
        let object = object.as_mut().ok_or(RpcError::EmptyObject)?;
        let result_bytes = handler(object, args)?;
        Ok(write_reply(invocation_id, &result_bytes))
    }
}

impl<T: Send + 'static> super::manager::Dispatcher for InvocableWrapper<T> {
    fn type_id(&self) -> SubgroupTypeId {
        self.type_id
    }

    fn dispatch(&self, from: NodeId, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        InvocableWrapper::dispatch(self, from, payload)
    }
}

/// Error in the marshalling or dispatch of an invocation.
#[derive(Debug)]
pub enum RpcError {
    /// The serialized invocation does not fit the buffer the transport handed over.
    BufferOverflow { required: usize, available: usize },
    /// A received message does not parse as an invocation or reply.
    Malformed,
    /// The invocation names a tag with no registered method.
    UnknownMethod(MethodTag),
    /// A method handler asked for more arguments than the invocation carries.
    MissingArgument,
    /// The dispatch target holds no user object.
    EmptyObject,
    Encode(std::io::Error),
    Decode(std::io::Error),
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::BufferOverflow {
                required,
                available,
            } => write!(
                f,
                "serialized invocation needs {} bytes but the buffer holds {}",
                required, available
            ),
            RpcError::Malformed => write!(f, "message does not parse as an invocation"),
            RpcError::UnknownMethod(tag) => write!(f, "no method registered under tag {}", tag),
            RpcError::MissingArgument => {
                write!(f, "invocation carries fewer arguments than the method expects")
            }
            RpcError::EmptyObject => write!(f, "dispatch target holds no user object"),
            RpcError::Encode(source) => write!(f, "cannot encode argument: {}", source),
            RpcError::Decode(source) => write!(f, "cannot decode argument: {}", source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_predicate_matches_bytes_written() {
        let args = ArgList::new()
            .arg(&42u64)
            .unwrap()
            .arg(&"hello".to_string())
            .unwrap();
        let size = invocation_size(&args);
        let mut buf = vec![0u8; size];
        write_invocation(&mut buf, MethodTag::new(7), InvocationId::new(0), &args).unwrap();

        let (tag, invocation_id, mut reader) = parse_invocation(&buf).unwrap();
        assert_eq!(tag, MethodTag::new(7));
        assert_eq!(invocation_id, InvocationId::new(0));
        assert_eq!(reader.next::<u64>().unwrap(), 42);
        assert_eq!(reader.next::<String>().unwrap(), "hello");
    }

    #[test]
    fn overflowing_the_buffer_is_rejected() {
        let args = ArgList::new().arg(&1u8).unwrap();
        let mut buf = vec![0u8; invocation_size(&args) - 1];
        let result = write_invocation(&mut buf, MethodTag::new(0), InvocationId::new(0), &args);
        assert!(matches!(result, Err(RpcError::BufferOverflow { .. })));
    }
}
