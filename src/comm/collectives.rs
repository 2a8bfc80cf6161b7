//! Collective operations built from the non-blocking point-to-point layer.
//!
//! Every collective is rooted in sub-ranks of the communicator it runs on and
//! uses a caller-supplied tag; sequential collectives on one communicator may
//! reuse a tag (per-channel FIFO), concurrently live communicators must own
//! disjoint tag windows.
//!
//! Payloads travel as two messages per peer: a u64-LE element count followed
//! by the raw bytes. Receivers validate lengths and surface
//! [`CombiError::BufferSizeMismatch`] instead of truncating silently.

use bytemuck::Pod;

use crate::combi_error::CombiError;
use crate::comm::communicator::{CommTag, Communicator, Wait};

/// Post the two messages of one length-prefixed block; the caller owns the
/// returned handles. Prefer [`send_block`] unless overlap is needed.
pub fn isend_block<C: Communicator, T: Pod>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    data: &[T],
) -> (C::SendHandle, C::SendHandle) {
    let len = (data.len() as u64).to_le_bytes();
    let h_len = comm.isend(peer, tag.base(), &len);
    let h_data = comm.isend(peer, tag.offset(1).base(), bytemuck::cast_slice(data));
    (h_len, h_data)
}

/// Send one length-prefixed block and wait for completion.
pub fn send_block<C: Communicator, T: Pod>(comm: &C, peer: usize, tag: CommTag, data: &[T]) {
    let (a, b) = isend_block(comm, peer, tag, data);
    let _ = a.wait();
    let _ = b.wait();
}

/// Receive one length-prefixed block from `peer`.
pub fn recv_block<C: Communicator, T: Pod>(
    comm: &C,
    peer: usize,
    tag: CommTag,
) -> Result<Vec<T>, CombiError> {
    let mut len_buf = [0u8; 8];
    let raw = comm
        .irecv(peer, tag.base(), &mut len_buf)
        .wait()
        .ok_or_else(|| CombiError::comm(peer, "length receive returned nothing"))?;
    if raw.len() != 8 {
        return Err(CombiError::BufferSizeMismatch {
            peer,
            expected: 8,
            got: raw.len(),
        });
    }
    len_buf.copy_from_slice(&raw);
    let n = u64::from_le_bytes(len_buf) as usize;

    let nbytes = n * std::mem::size_of::<T>();
    let mut buf = vec![0u8; nbytes];
    let raw = comm
        .irecv(peer, tag.offset(1).base(), &mut buf)
        .wait()
        .ok_or_else(|| CombiError::comm(peer, "payload receive returned nothing"))?;
    if raw.len() != nbytes {
        return Err(CombiError::BufferSizeMismatch {
            peer,
            expected: nbytes,
            got: raw.len(),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(&raw))
}

/// Broadcast `data` from `root` to every rank; non-roots overwrite `data`.
pub fn broadcast<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    tag: CommTag,
    data: &mut Vec<T>,
) -> Result<(), CombiError> {
    if comm.size() == 1 {
        return Ok(());
    }
    if comm.rank() == root {
        let mut pending = Vec::with_capacity(2 * (comm.size() - 1));
        for peer in 0..comm.size() {
            if peer == root {
                continue;
            }
            let (a, b) = isend_block(comm, peer, tag, data.as_slice());
            pending.push(a);
            pending.push(b);
        }
        for h in pending {
            let _ = h.wait();
        }
    } else {
        *data = recv_block(comm, root, tag)?;
    }
    Ok(())
}

/// Element-wise all-reduce: every rank ends with `fold` applied across all
/// ranks' equally sized buffers. Gather-to-zero then broadcast.
pub fn allreduce<C, T, F>(
    comm: &C,
    tag: CommTag,
    data: &mut [T],
    fold: F,
) -> Result<(), CombiError>
where
    C: Communicator,
    T: Pod,
    F: Fn(&mut T, T),
{
    if comm.size() == 1 {
        return Ok(());
    }
    if comm.rank() == 0 {
        for peer in 1..comm.size() {
            let incoming: Vec<T> = recv_block(comm, peer, tag)?;
            if incoming.len() != data.len() {
                return Err(CombiError::BufferSizeMismatch {
                    peer,
                    expected: data.len() * std::mem::size_of::<T>(),
                    got: incoming.len() * std::mem::size_of::<T>(),
                });
            }
            for (d, x) in data.iter_mut().zip(incoming) {
                fold(d, x);
            }
        }
        let mut pending = Vec::with_capacity(2 * (comm.size() - 1));
        for peer in 1..comm.size() {
            let (a, b) = isend_block(comm, peer, tag.offset(2), &*data);
            pending.push(a);
            pending.push(b);
        }
        for h in pending {
            let _ = h.wait();
        }
    } else {
        let (a, b) = isend_block(comm, 0, tag, &*data);
        let reduced: Vec<T> = recv_block(comm, 0, tag.offset(2))?;
        if reduced.len() != data.len() {
            return Err(CombiError::BufferSizeMismatch {
                peer: 0,
                expected: data.len() * std::mem::size_of::<T>(),
                got: reduced.len() * std::mem::size_of::<T>(),
            });
        }
        data.copy_from_slice(&reduced);
        let _ = a.wait();
        let _ = b.wait();
    }
    Ok(())
}

/// All-reduce that posts every receive before waiting on any of them; the
/// overlap-friendly counterpart of [`allreduce`], selected by
/// `use_nonblocking_collectives` for the sparse grid reduction. Buffer
/// lengths are fixed by the all-reduce contract, so payloads travel
/// without a length prefix.
pub fn allreduce_posted<C, T, F>(
    comm: &C,
    tag: CommTag,
    data: &mut [T],
    fold: F,
) -> Result<(), CombiError>
where
    C: Communicator,
    T: Pod,
    F: Fn(&mut T, T),
{
    if comm.size() == 1 {
        return Ok(());
    }
    let nbytes = std::mem::size_of_val(data);
    if comm.rank() == 0 {
        let mut pending = Vec::with_capacity(comm.size() - 1);
        for peer in 1..comm.size() {
            let mut buf = vec![0u8; nbytes];
            pending.push((peer, comm.irecv(peer, tag.base(), &mut buf)));
        }
        for (peer, handle) in pending {
            let raw = handle
                .wait()
                .ok_or_else(|| CombiError::comm(peer, "reduce payload missing"))?;
            if raw.len() != nbytes {
                return Err(CombiError::BufferSizeMismatch {
                    peer,
                    expected: nbytes,
                    got: raw.len(),
                });
            }
            let incoming: Vec<T> = bytemuck::pod_collect_to_vec(&raw);
            for (d, x) in data.iter_mut().zip(incoming) {
                fold(d, x);
            }
        }
        let mut sends = Vec::with_capacity(comm.size() - 1);
        for peer in 1..comm.size() {
            sends.push(comm.isend(peer, tag.offset(2).base(), bytemuck::cast_slice(data)));
        }
        for s in sends {
            let _ = s.wait();
        }
    } else {
        let send = comm.isend(0, tag.base(), bytemuck::cast_slice(data));
        let mut buf = vec![0u8; nbytes];
        let raw = comm
            .irecv(0, tag.offset(2).base(), &mut buf)
            .wait()
            .ok_or_else(|| CombiError::comm(0, "reduced result missing"))?;
        if raw.len() != nbytes {
            return Err(CombiError::BufferSizeMismatch {
                peer: 0,
                expected: nbytes,
                got: raw.len(),
            });
        }
        data.copy_from_slice(&bytemuck::pod_collect_to_vec::<_, T>(&raw));
        let _ = send.wait();
    }
    Ok(())
}

/// Reduce all ranks' equally sized buffers into `data` on `root` only.
pub fn reduce_to_root<C, T, F>(
    comm: &C,
    root: usize,
    tag: CommTag,
    data: &mut [T],
    fold: F,
) -> Result<(), CombiError>
where
    C: Communicator,
    T: Pod,
    F: Fn(&mut T, T),
{
    if comm.size() == 1 {
        return Ok(());
    }
    if comm.rank() == root {
        for peer in 0..comm.size() {
            if peer == root {
                continue;
            }
            let incoming: Vec<T> = recv_block(comm, peer, tag)?;
            if incoming.len() != data.len() {
                return Err(CombiError::BufferSizeMismatch {
                    peer,
                    expected: data.len() * std::mem::size_of::<T>(),
                    got: incoming.len() * std::mem::size_of::<T>(),
                });
            }
            for (d, x) in data.iter_mut().zip(incoming) {
                fold(d, x);
            }
        }
    } else {
        let (a, b) = isend_block(comm, root, tag, &*data);
        let _ = a.wait();
        let _ = b.wait();
    }
    Ok(())
}

/// Gather variable-length buffers to `root`. The root receives the flat
/// concatenation in sub-rank order plus per-rank element counts; other ranks
/// receive `None`.
#[allow(clippy::type_complexity)]
pub fn gatherv<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    tag: CommTag,
    local: &[T],
) -> Result<Option<(Vec<T>, Vec<usize>)>, CombiError> {
    if comm.rank() == root {
        let mut flat = Vec::new();
        let mut counts = vec![0usize; comm.size()];
        for peer in 0..comm.size() {
            if peer == root {
                counts[peer] = local.len();
                flat.extend_from_slice(local);
            } else {
                let part: Vec<T> = recv_block(comm, peer, tag)?;
                counts[peer] = part.len();
                flat.extend_from_slice(&part);
            }
        }
        Ok(Some((flat, counts)))
    } else {
        let (a, b) = isend_block(comm, root, tag, local);
        let _ = a.wait();
        let _ = b.wait();
        Ok(None)
    }
}

/// Scatter per-rank buffers from `root`; every rank returns its own part.
pub fn scatterv<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    tag: CommTag,
    parts: Option<Vec<Vec<T>>>,
) -> Result<Vec<T>, CombiError> {
    if comm.rank() == root {
        let parts = parts.expect("root must supply scatter parts");
        debug_assert_eq!(parts.len(), comm.size());
        let mut pending = Vec::with_capacity(2 * (comm.size() - 1));
        let mut mine = Vec::new();
        for (peer, part) in parts.into_iter().enumerate() {
            if peer == root {
                mine = part;
            } else {
                let (a, b) = isend_block(comm, peer, tag, &part);
                pending.push(a);
                pending.push(b);
            }
        }
        for h in pending {
            let _ = h.wait();
        }
        Ok(mine)
    } else {
        recv_block(comm, root, tag)
    }
}

/// All-to-all gather of variable-length buffers; returns one buffer per
/// sub-rank (own data cloned into place). Used by the pole exchange during
/// distributed hierarchisation.
pub fn allgatherv<C: Communicator, T: Pod>(
    comm: &C,
    tag: CommTag,
    local: &[T],
) -> Result<Vec<Vec<T>>, CombiError> {
    let me = comm.rank();
    let mut pending = Vec::with_capacity(2 * (comm.size() - 1));
    for peer in 0..comm.size() {
        if peer != me {
            let (a, b) = isend_block(comm, peer, tag, local);
            pending.push(a);
            pending.push(b);
        }
    }
    let mut out = Vec::with_capacity(comm.size());
    for peer in 0..comm.size() {
        if peer == me {
            out.push(local.to_vec());
        } else {
            out.push(recv_block(comm, peer, tag)?);
        }
    }
    for h in pending {
        let _ = h.wait();
    }
    Ok(out)
}

/// Synchronisation barrier: gather empty pings to sub-rank 0, then release.
pub fn barrier<C: Communicator>(comm: &C, tag: CommTag) -> Result<(), CombiError> {
    if comm.size() == 1 {
        return Ok(());
    }
    if comm.rank() == 0 {
        for peer in 1..comm.size() {
            let mut buf = [0u8; 1];
            comm.irecv(peer, tag.base(), &mut buf)
                .wait()
                .ok_or_else(|| CombiError::comm(peer, "barrier ping missing"))?;
        }
        let mut pending = Vec::with_capacity(comm.size() - 1);
        for peer in 1..comm.size() {
            pending.push(comm.isend(peer, tag.offset(1).base(), &[1u8]));
        }
        for h in pending {
            let _ = h.wait();
        }
    } else {
        let h = comm.isend(0, tag.base(), &[1u8]);
        let mut buf = [0u8; 1];
        comm.irecv(0, tag.offset(1).base(), &mut buf)
            .wait()
            .ok_or_else(|| CombiError::comm(0, "barrier release missing"))?;
        let _ = h.wait();
    }
    Ok(())
}
