//! Shipping object closures between nodes.
//!
//! The sender copies everything reachable from one object into a scratch buffer with the
//! Cheney copier, leaving its own heap untouched, and sends a [ControlPacket] followed by
//! the buffer. References inside the buffer are absolute addresses in the sender's
//! buffer. The receiver copies the bytes into its nursery and rebases every reference by
//! the difference between the two base addresses.
use std::mem::size_of;

use hashbrown::HashSet;

use crate::{
    cheney::{Cheney, SideTable},
    error::{InterconnectError, TransferError},
    filler::fill_gap,
    gate::{ensure_invariants, EnsureRequest},
    globals::WORD_SIZE,
    mutator::Mutator,
    object::{advance_to_object_data, for_each_object_in_range, for_each_ref_slot, object_size},
    util::{align_up, CommaSeparated},
    Pointer,
};

/// Announces a closure: its size in bytes and the address it was serialized at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlPacket {
    pub closure_size: usize,
    pub remote_base: usize,
}

impl ControlPacket {
    pub const SIZE: usize = 2 * size_of::<u64>();

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[..8].copy_from_slice(&(self.closure_size as u64).to_le_bytes());
        bytes[8..].copy_from_slice(&(self.remote_base as u64).to_le_bytes());
        bytes
    }

    /// Offset of the sender address `target` inside the announced closure.
    pub fn offset_of(&self, target: usize) -> Option<usize> {
        target
            .checked_sub(self.remote_base)
            .filter(|&offset| offset < self.closure_size)
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut word = [0; 8];
        word.copy_from_slice(&bytes[..8]);
        let closure_size = u64::from_le_bytes(word) as usize;
        word.copy_from_slice(&bytes[8..]);
        Self {
            closure_size,
            remote_base: u64::from_le_bytes(word) as usize,
        }
    }
}

/// Blocking point-to-point message passing between numbered nodes.
///
/// Every call transfers exactly one message of exactly `buf.len()` bytes.
pub trait Interconnect {
    fn node(&self) -> usize;
    fn send(&self, buf: &[u8], dest: usize) -> Result<(), InterconnectError>;
    fn recv(&self, buf: &mut [u8], src: usize) -> Result<(), InterconnectError>;
}

/// In-process interconnect: one unbounded channel per ordered pair of nodes.
pub struct LoopbackInterconnect {
    node: usize,
    outgoing: Vec<flume::Sender<Vec<u8>>>,
    incoming: Vec<flume::Receiver<Vec<u8>>>,
}

impl LoopbackInterconnect {
    /// Endpoints of a fully connected network of `nodes` nodes, indexed by node number.
    pub fn network(nodes: usize) -> Vec<Self> {
        let channels: Vec<Vec<_>> = (0..nodes)
            .map(|_| (0..nodes).map(|_| flume::unbounded()).collect())
            .collect();
        (0..nodes)
            .map(|node| Self {
                node,
                outgoing: (0..nodes).map(|dest| channels[node][dest].0.clone()).collect(),
                incoming: (0..nodes).map(|src| channels[src][node].1.clone()).collect(),
            })
            .collect()
    }
}

impl Interconnect for LoopbackInterconnect {
    fn node(&self) -> usize {
        self.node
    }

    fn send(&self, buf: &[u8], dest: usize) -> Result<(), InterconnectError> {
        self.outgoing
            .get(dest)
            .ok_or(InterconnectError::UnknownNode(dest))?
            .send(buf.to_vec())
            .map_err(|_| InterconnectError::Disconnected(dest))
    }

    fn recv(&self, buf: &mut [u8], src: usize) -> Result<(), InterconnectError> {
        let message = self
            .incoming
            .get(src)
            .ok_or(InterconnectError::UnknownNode(src))?
            .recv()
            .map_err(|_| InterconnectError::Disconnected(src))?;
        if message.len() != buf.len() {
            return Err(InterconnectError::SizeMismatch {
                node: src,
                expected: buf.len(),
                actual: message.len(),
            });
        }
        buf.copy_from_slice(&message);
        Ok(())
    }
}

/// Bytes occupied by every object reachable from `obj`, `obj` included.
pub unsafe fn closure_size(obj: Pointer) -> usize {
    if obj.is_null() {
        return 0;
    }
    let mut visited = HashSet::new();
    let mut stack = vec![obj];
    let mut size = 0;
    visited.insert(obj as usize);
    while let Some(obj) = stack.pop() {
        size += object_size(obj);
        for_each_ref_slot(obj, |slot| {
            let target = *slot;
            if !target.is_null() && visited.insert(target as usize) {
                stack.push(target);
            }
        });
    }
    size
}

impl Mutator {
    /// Sends the closure of `obj` to node `dest`.
    ///
    /// Collections may run while the call blocks, so `obj` must be reloaded from a root
    /// afterwards.
    pub fn send(
        &self,
        interconnect: &impl Interconnect,
        obj: Pointer,
        dest: usize,
    ) -> Result<(), TransferError> {
        if dest == interconnect.node() {
            return Err(TransferError::SelfSend(dest));
        }
        let mut buffer;
        let packet;
        unsafe {
            let size = closure_size(obj);
            buffer = vec![0u64; align_up(size, WORD_SIZE) / WORD_SIZE];
            let base = buffer.as_mut_ptr().cast::<u8>();
            let mut cheney = Cheney::everything(base, base.add(size), SideTable::default());
            let mut root = obj;
            cheney.copy_slot(&mut root);
            cheney.scan();
            gc_assert!(cheney.bytes_copied() == size);
            packet = ControlPacket {
                closure_size: size,
                remote_base: base as usize,
            };
        }
        log::debug!(
            "[GC: Sending closure of {} bytes at {:p} to node {}. [{}]]",
            CommaSeparated(packet.closure_size),
            obj,
            dest,
            self.proc
        );
        let bytes = unsafe {
            std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), packet.closure_size)
        };
        self.gc.rendezvous.blocking(|| {
            interconnect.send(&packet.encode(), dest)?;
            interconnect.send(bytes, dest)
        })?;
        Ok(())
    }

    /// Receives a closure from node `src` into this processor's nursery and returns its
    /// root.
    pub fn recv(
        &self,
        interconnect: &impl Interconnect,
        src: usize,
    ) -> Result<Pointer, TransferError> {
        let mut header = [0; ControlPacket::SIZE];
        let mut buffer = Vec::new();
        let packet = self.gc.rendezvous.blocking(|| -> Result<_, TransferError> {
            interconnect.recv(&mut header, src)?;
            let packet = ControlPacket::decode(&header);
            if packet.closure_size % WORD_SIZE != 0 {
                return Err(TransferError::MalformedPacket(packet.closure_size));
            }
            buffer = vec![0u8; packet.closure_size];
            interconnect.recv(&mut buffer, src)?;
            Ok(packet)
        })?;
        log::debug!(
            "[GC: Received closure of {} bytes from node {}. [{}]]",
            CommaSeparated(packet.closure_size),
            src,
            self.proc
        );
        if packet.closure_size == 0 {
            return Ok(crate::object::null());
        }

        unsafe {
            let gc = &*self.gc;
            ensure_invariants(
                gc,
                self.proc,
                EnsureRequest {
                    nursery_bytes: packet.closure_size,
                    ..EnsureRequest::default()
                },
            );
            let to = gc.proc_mut(self.proc).cursor.bump(packet.closure_size);
            std::ptr::copy_nonoverlapping(buffer.as_ptr(), to, packet.closure_size);
            let end = to.add(packet.closure_size);
            let mut dangling = None;
            for_each_object_in_range(to, end, |obj| {
                for_each_ref_slot(obj, |slot| {
                    let target = *slot as usize;
                    if target == 0 || dangling.is_some() {
                        return;
                    }
                    match packet.offset_of(target) {
                        Some(offset) => *slot = to.add(offset),
                        None => dangling = Some(target),
                    }
                });
            });
            if let Some(target) = dangling {
                // The copy must not be traced with references into someone else's memory.
                fill_gap(to, end);
                return Err(TransferError::DanglingReference {
                    target,
                    remote_base: packet.remote_base,
                    closure_size: packet.closure_size,
                });
            }
            Ok(advance_to_object_data(to))
        }
    }
}
