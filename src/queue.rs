//! Inbound packet queue.
//!
//! One [`Packet`] per `+IPD` frame, owned by the session, delivered in
//! arrival order per link id. Total allocation is bounded by the configured
//! ceiling: once the queue holds at least that many bytes, new frames are
//! dropped (the session still drains their payload from the wire to keep
//! the parser aligned).

use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// One inbound frame as delivered by one `+IPD`.
#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) link_id: usize,
    /// Allocated payload length, counted against the ceiling until the
    /// packet is removed, independent of how much has been consumed.
    alloc_len: usize,
    data: Vec<u8>,
    /// Read cursor for partial TCP consumption.
    offset: usize,
}

impl Packet {
    /// Allocates a packet buffer, surfacing out-of-memory instead of
    /// aborting.
    pub(crate) fn alloc(link_id: usize, len: usize) -> Result<Self, ()> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| ())?;
        data.resize(len, 0);

        Ok(Self {
            link_id,
            alloc_len: len,
            data,
            offset: 0,
        })
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// FIFO of inbound packets across all link ids.
#[derive(Debug, Default)]
pub(crate) struct PacketQueue {
    packets: VecDeque<Packet>,
    bytes_queued: usize,
}

impl PacketQueue {
    /// True if a new frame may be enqueued. The check admits the frame as
    /// long as the queue is currently below the ceiling, so usage can
    /// overshoot by at most one packet.
    pub(crate) fn admits(&self, ceiling: usize) -> bool {
        self.bytes_queued < ceiling
    }

    pub(crate) fn bytes_queued(&self) -> usize {
        self.bytes_queued
    }

    pub(crate) fn push(&mut self, packet: Packet) {
        self.bytes_queued += packet.alloc_len;
        self.packets.push_back(packet);
    }

    /// True if at least one packet for `link_id` is queued.
    pub(crate) fn has_data(&self, link_id: usize) -> bool {
        self.packets.iter().any(|p| p.link_id == link_id)
    }

    /// Stream read: copies from the oldest packet for `link_id`, leaving
    /// unread bytes at the head for the next call.
    pub(crate) fn read_tcp(&mut self, link_id: usize, buf: &mut [u8]) -> Option<usize> {
        let index = self.packets.iter().position(|p| p.link_id == link_id)?;

        let packet = &mut self.packets[index];
        let n = packet.remaining().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[packet.offset..packet.offset + n]);
        packet.offset += n;

        if packet.remaining() == 0 {
            self.remove(index);
        }

        Some(n)
    }

    /// Datagram read: removes the oldest packet for `link_id` whole,
    /// truncating to the caller's buffer.
    pub(crate) fn read_udp(&mut self, link_id: usize, buf: &mut [u8]) -> Option<usize> {
        let index = self.packets.iter().position(|p| p.link_id == link_id)?;

        let packet = &self.packets[index];
        let n = packet.remaining().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[packet.offset..packet.offset + n]);
        self.remove(index);

        Some(n)
    }

    /// Drops every queued packet for `link_id`.
    pub(crate) fn clear_socket(&mut self, link_id: usize) {
        while let Some(index) = self.packets.iter().position(|p| p.link_id == link_id) {
            self.remove(index);
        }
    }

    fn remove(&mut self, index: usize) {
        if let Some(packet) = self.packets.remove(index) {
            self.bytes_queued -= packet.alloc_len;
        }
    }
}
