//! Record types and the assembled capture.
//!
//! A capture consists of flat arrays of fixed-width records, one per
//! protocol layer, cross-referenced by integer indices. All records are
//! little-endian and byte-packed so the arrays can be mapped straight
//! out of their backing files.
//!
//! Beware that most multi-byte fields are unaligned because of the
//! packed layout; copy them into a local before borrowing them.

use bytemuck_derive::{Pod, Zeroable};

use crate::stream::Array;
use crate::usb::{PacketFields, PID};

/// One packet as seen on the wire.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Packet {
    /// Monotonic nanosecond timestamp assigned at ingestion, measured
    /// from the creation of the framing reader.
    pub timestamp_ns: u64,
    /// For data packets, offset of this packet's payload in the data
    /// array. Zero and meaningless otherwise.
    pub data_offset: u64,
    /// On-wire length, including the PID and any trailing CRC.
    pub length: u16,
    /// Raw PID byte, preserved even when it matches no defined PID.
    pub pid: u8,
    /// PID-specific bytes following the PID: token or SOF fields for
    /// token packets, the trailing CRC16 for data packets.
    pub fields: [u8; 2],
}

impl Packet {
    /// The packet's PID, or `PID::Malformed` if the byte is undefined.
    pub fn pid(&self) -> PID {
        PID::from(self.pid)
    }

    /// Typed view of the PID-specific field bytes.
    pub fn fields(&self) -> PacketFields {
        PacketFields::from_raw(self.pid, self.fields)
    }

    /// Payload length contributed to the data array, for data packets.
    pub fn payload_length(&self) -> u64 {
        let length = self.length;
        length.saturating_sub(3) as u64
    }
}

/// A group of up to three consecutive packets forming one bus exchange.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Transaction {
    /// Index of this transaction's first packet in the packet array.
    pub first_packet_index: u64,
    /// Number of packets grouped into this transaction.
    pub num_packets: u8,
    /// Nonzero if the transaction reached a terminal state rather than
    /// being aborted by a protocol-invalid successor or end of input.
    pub complete: u8,
}

impl Transaction {
    pub fn is_complete(&self) -> bool {
        self.complete != 0
    }
}

/// A device address and endpoint number pair. Its position in the
/// endpoint array is its endpoint id.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Endpoint {
    /// Device address (0-127).
    pub address: u8,
    /// Endpoint number (0-15).
    pub endpoint_num: u8,
}

/// A sequence of transactions on one endpoint.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Transfer {
    /// Offset of this transfer's transactions within its endpoint's
    /// transaction id array.
    pub ep_tran_offset: u64,
    /// Number of transactions in this transfer.
    pub num_transactions: u64,
    /// Nonzero if the transfer was terminated by its protocol's closing
    /// exchange rather than by an invalid transaction or end of input.
    pub complete: u8,
}

impl Transfer {
    pub fn is_complete(&self) -> bool {
        self.complete != 0
    }
}

/// An entry in the global transfer index, ordering transfers by the
/// close of their first transaction across all endpoints.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct TransferIndexEntry {
    /// Index into the endpoint array.
    pub endpoint_id: u16,
    /// Index into the transfers of that endpoint.
    pub transfer_id: u64,
}

/// Traffic recorded on a single endpoint.
pub struct EndpointTraffic {
    /// Transfers on this endpoint.
    pub transfers: Array<Transfer>,
    /// Global transaction indices, grouped by transfer: the ids of a
    /// transfer lie at `ep_tran_offset .. ep_tran_offset +
    /// num_transactions`.
    pub transaction_ids: Array<u64>,
}

impl EndpointTraffic {
    /// The global transaction indices belonging to one transfer.
    pub fn transfer_transaction_ids(&self, transfer: &Transfer) -> &[u64] {
        let start = transfer.ep_tran_offset as usize;
        let count = transfer.num_transactions as usize;
        &self.transaction_ids.as_slice()[start..start + count]
    }
}

/// The assembled result of decoding a raw capture stream.
///
/// All arrays are read-only mappings of the streams written during
/// decoding and stay valid until the capture is dropped, which releases
/// every mapping.
pub struct Capture {
    /// Endpoints in order of discovery.
    pub endpoints: Array<Endpoint>,
    /// Per-endpoint traffic, parallel to `endpoints`.
    pub endpoint_traffic: Vec<EndpointTraffic>,
    /// All transfers, in the order their first transaction closed.
    pub transfer_index: Array<TransferIndexEntry>,
    /// All transactions, in input order.
    pub transactions: Array<Transaction>,
    /// All packets, in input order.
    pub packets: Array<Packet>,
    /// Concatenated payloads of all data packets.
    pub data: Array<u8>,
}

impl Capture {
    pub fn num_endpoints(&self) -> u64 {
        self.endpoints.len()
    }

    pub fn num_transfers(&self) -> u64 {
        self.transfer_index.len()
    }

    pub fn num_transactions(&self) -> u64 {
        self.transactions.len()
    }

    pub fn num_packets(&self) -> u64 {
        self.packets.len()
    }

    pub fn data_size(&self) -> u64 {
        self.data.len()
    }

    /// Payload bytes of a data packet. Empty for non-data packets.
    pub fn packet_payload(&self, packet: &Packet) -> &[u8] {
        let start = packet.data_offset as usize;
        let length = packet.payload_length() as usize;
        if crate::usb::byte_is_data(packet.pid) {
            &self.data.as_slice()[start..start + length]
        } else {
            &[]
        }
    }

    /// The packets grouped into one transaction.
    pub fn transaction_packets(&self, transaction: &Transaction) -> &[Packet] {
        let start = transaction.first_packet_index as usize;
        let count = transaction.num_packets as usize;
        &self.packets.as_slice()[start..start + count]
    }
}
