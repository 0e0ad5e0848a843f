//! The two-level streaming protocol decoder.
//!
//! Packets are grouped into transactions by a single state machine fed
//! one PID at a time, and transactions are grouped into transfers by
//! one state machine per endpoint. Both machines absorb arbitrary
//! malformed input: no packet sequence produces an error, only records
//! marked incomplete. The decoder writes every output stream as it
//! goes; [`Decoder::finish`] maps the streams into the final
//! [`Capture`].

use std::io::Read;

use log::debug;

use crate::capture::{
    Capture, Endpoint, EndpointTraffic, Packet, Transaction, Transfer, TransferIndexEntry,
};
use crate::reader::{FrameReader, MAX_FRAME_SIZE};
use crate::stream::Stream;
use crate::usb::{byte_is_data, PacketFields, PID};
use crate::CaptureError;

/// [`Decoder`] configuration.
#[derive(Debug, Clone, Default)]
pub struct DecoderOptions {
    /// Merge runs of consecutive SOF packets into one transaction
    /// record instead of one record per SOF, up to the 255-packet
    /// record limit. Off by default: each SOF then opens a transaction
    /// that its successor closes as incomplete.
    pub coalesce_sofs: bool,
}

/// Outcome of classifying the next packet or transaction against the
/// group currently being built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DecodeStatus {
    New,
    Continue,
    Done,
    Invalid,
}

/// State of the transaction being assembled, reset after every close.
#[derive(Copy, Clone)]
struct TransactionState {
    /// PID that opened the transaction; `Malformed` when idle.
    first: PID,
    /// PID of the most recent packet in the transaction.
    last: PID,
    /// Address fields of the opening token, if there was one.
    address: u8,
    endpoint_num: u8,
    first_packet_index: u64,
    num_packets: u8,
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState {
            first: PID::Malformed,
            last: PID::Malformed,
            address: 0,
            endpoint_num: 0,
            first_packet_index: 0,
            num_packets: 0,
        }
    }
}

/// Classify the next PID against the open transaction.
fn transaction_status(
    options: &DecoderOptions,
    state: &TransactionState,
    next: PID,
) -> DecodeStatus {
    use DecodeStatus::*;
    use PID::*;

    if options.coalesce_sofs && state.last == SOF && next == SOF && state.num_packets < u8::MAX {
        return Continue;
    }

    match (state.first, state.last, next) {
        // A token always opens a new transaction.
        (_, _, SETUP | IN | OUT | SOF) => New,

        // SETUP must be followed by DATA0, then wait for the handshake.
        (_, SETUP, DATA0) => Continue,
        // ACK completes the setup stage.
        (SETUP, DATA0, ACK) => Done,

        // IN may be answered directly by NAK or STALL, which completes
        // the transaction without a data stage.
        (_, IN, NAK | STALL) => Done,
        // IN or OUT may be followed by data, then wait for the handshake.
        (_, IN | OUT, DATA0 | DATA1) => Continue,
        // The handshake completes the transaction; only OUT data may be
        // refused with NAK or STALL.
        (IN, DATA0 | DATA1, ACK) => Done,
        (OUT, DATA0 | DATA1, ACK | NAK | STALL) => Done,

        // Any other case is not a valid part of a transaction.
        _ => Invalid,
    }
}

/// Classify the next transaction type against an endpoint's transfer.
///
/// `last` is the type of the endpoint's last successful transaction,
/// or `Malformed` when there has been none.
fn transfer_status(control: bool, last: PID, next: PID) -> DecodeStatus {
    use DecodeStatus::*;
    use PID::*;

    // SETUP unconditionally restarts a control transfer.
    if control && next == SETUP {
        return New;
    }

    match (last, next) {
        // A bulk or interrupt transfer opens with IN or OUT.
        (Malformed, IN | OUT) if !control => New,
        // The data stage of a control transfer runs in one direction...
        (SETUP, IN | OUT) => Continue,
        (IN, IN) | (OUT, OUT) => Continue,
        // ...and the opposite direction is the status stage, which
        // finishes the transfer.
        (IN, OUT) | (OUT, IN) if control => Done,
        _ => Invalid,
    }
}

/// Transfer being assembled on one endpoint.
struct ActiveTransfer {
    /// Transaction type that opened the transfer.
    first: PID,
    /// Offset of the transfer's first transaction id within the
    /// endpoint's transaction id stream.
    ep_tran_offset: u64,
    num_transactions: u64,
}

/// Decoder state and output streams for one discovered endpoint.
struct EndpointState {
    id: u16,
    transfers: Stream<Transfer>,
    transaction_ids: Stream<u64>,
    /// Type of the last successful transaction; `Malformed` when none
    /// has succeeded on the current transfer.
    last_type: PID,
    active: Option<ActiveTransfer>,
}

impl EndpointState {
    fn append_transaction(&mut self, transaction_id: u64) -> Result<(), CaptureError> {
        self.transaction_ids.push(&transaction_id)?;
        if let Some(active) = &mut self.active {
            active.num_transactions += 1;
        }
        Ok(())
    }

    fn close_transfer(&mut self, complete: bool) -> Result<(), CaptureError> {
        if let Some(active) = self.active.take() {
            if active.num_transactions > 0 {
                self.transfers.push(&Transfer {
                    ep_tran_offset: active.ep_tran_offset,
                    num_transactions: active.num_transactions,
                    complete: complete as u8,
                })?;
            }
        }
        self.last_type = PID::Malformed;
        Ok(())
    }
}

/// USB 2.0 protocol decoder and capture assembler.
///
/// Feed packets with [`handle_raw_packet`](Decoder::handle_raw_packet)
/// and obtain the finished capture with [`finish`](Decoder::finish),
/// or use [`read_capture`] to drive the whole pipeline from a byte
/// source.
pub struct Decoder {
    options: DecoderOptions,
    packets: Stream<Packet>,
    transactions: Stream<Transaction>,
    transfer_index: Stream<TransferIndexEntry>,
    endpoints: Stream<Endpoint>,
    data: Stream<u8>,
    /// Dense `(address, endpoint_num)` table for O(1) endpoint lookup.
    endpoint_lookup: Vec<Option<u16>>,
    endpoint_state: Vec<EndpointState>,
    transaction: TransactionState,
}

impl Decoder {
    pub fn new(options: DecoderOptions) -> Result<Decoder, CaptureError> {
        Ok(Decoder {
            options,
            packets: Stream::new("packets")?,
            transactions: Stream::new("transactions")?,
            transfer_index: Stream::new("transfer_index")?,
            endpoints: Stream::new("endpoints")?,
            data: Stream::new("data")?,
            endpoint_lookup: vec![None; 128 * 16],
            endpoint_state: Vec::new(),
            transaction: TransactionState::default(),
        })
    }

    /// Record one raw packet and step the protocol state machines.
    ///
    /// `bytes` is the on-wire packet content, at most
    /// [`MAX_FRAME_SIZE`] long. Exactly one packet record is appended
    /// per call, whatever the content.
    pub fn handle_raw_packet(
        &mut self,
        timestamp_ns: u64,
        bytes: &[u8],
    ) -> Result<(), CaptureError> {
        debug_assert!(bytes.len() <= MAX_FRAME_SIZE);
        let pid = bytes.first().copied().unwrap_or(0);
        let mut record = Packet {
            timestamp_ns,
            data_offset: 0,
            length: bytes.len() as u16,
            pid,
            fields: [0; 2],
        };
        if byte_is_data(pid) && bytes.len() >= 3 {
            let payload = &bytes[1..bytes.len() - 2];
            record.data_offset = self.data.append(payload)?;
            record.fields.copy_from_slice(&bytes[bytes.len() - 2..]);
        } else {
            // The remaining wire bytes overlay the token and SOF field
            // layout; a well-formed token carries exactly two.
            for (dst, src) in record.fields.iter_mut().zip(bytes.iter().skip(1)) {
                *dst = *src;
            }
        }
        let packet_id = self.packets.push(&record)?;
        self.transaction_update(packet_id, PID::from(pid), &record)
    }

    /// Close any open transaction and transfer, then map every stream
    /// into the finished capture.
    pub fn finish(mut self) -> Result<Capture, CaptureError> {
        self.flush()?;
        let mut endpoint_traffic = Vec::with_capacity(self.endpoint_state.len());
        for state in self.endpoint_state {
            endpoint_traffic.push(EndpointTraffic {
                transfers: state.transfers.finalize()?,
                transaction_ids: state.transaction_ids.finalize()?,
            });
        }
        Ok(Capture {
            endpoints: self.endpoints.finalize()?,
            endpoint_traffic,
            transfer_index: self.transfer_index.finalize()?,
            transactions: self.transactions.finalize()?,
            packets: self.packets.finalize()?,
            data: self.data.finalize()?,
        })
    }

    /// End-of-input flush: any open transaction and any open transfer
    /// on each endpoint close as incomplete. Invoking this twice leaves
    /// all counts unchanged.
    fn flush(&mut self) -> Result<(), CaptureError> {
        self.transaction_end(false)?;
        for index in 0..self.endpoint_state.len() {
            self.endpoint_state[index].close_transfer(false)?;
        }
        Ok(())
    }

    fn transaction_update(
        &mut self,
        packet_id: u64,
        pid: PID,
        record: &Packet,
    ) -> Result<(), CaptureError> {
        use DecodeStatus::*;
        match transaction_status(&self.options, &self.transaction, pid) {
            New => {
                self.transaction_end(false)?;
                self.transaction_begin(packet_id, pid, record);
            }
            Continue => {
                self.transaction.num_packets += 1;
                self.transaction.last = pid;
            }
            Done => {
                self.transaction.num_packets += 1;
                self.transaction.last = pid;
                self.transaction_end(true)?;
            }
            Invalid => {
                // The offending packet opens no transaction, but it
                // still takes a slot in the derived structure: a
                // single-packet group closed at once as incomplete.
                self.transaction_end(false)?;
                self.transaction_begin(packet_id, pid, record);
                self.transaction_end(false)?;
            }
        }
        Ok(())
    }

    fn transaction_begin(&mut self, packet_id: u64, pid: PID, record: &Packet) {
        let mut state = TransactionState {
            first: pid,
            last: pid,
            address: 0,
            endpoint_num: 0,
            first_packet_index: packet_id,
            num_packets: 1,
        };
        if matches!(pid, PID::SETUP | PID::IN | PID::OUT) {
            if let PacketFields::Token(token) = record.fields() {
                state.address = token.device_address();
                state.endpoint_num = token.endpoint_number();
            }
        }
        self.transaction = state;
    }

    /// Close the open transaction, if any. The transaction reaches the
    /// transfer layer before its record is stored, so the transfer
    /// layer sees the index the record is about to occupy.
    fn transaction_end(&mut self, complete: bool) -> Result<(), CaptureError> {
        let state = self.transaction;
        if state.num_packets == 0 {
            return Ok(());
        }
        if matches!(state.first, PID::SETUP | PID::IN | PID::OUT) {
            self.transfer_update(&state, complete)?;
        }
        self.transactions.push(&Transaction {
            first_packet_index: state.first_packet_index,
            num_packets: state.num_packets,
            complete: complete as u8,
        })?;
        self.transaction = TransactionState::default();
        Ok(())
    }

    fn transfer_update(
        &mut self,
        transaction: &TransactionState,
        complete: bool,
    ) -> Result<(), CaptureError> {
        use DecodeStatus::*;
        let transaction_id = self.transactions.len();
        let index = self.endpoint_index(transaction.address, transaction.endpoint_num)?;
        // A successful transaction is the full three-phase exchange:
        // token, data, ACK.
        let successful =
            transaction.num_packets == 3 && complete && transaction.last == PID::ACK;
        let next = transaction.first;
        let control = transaction.endpoint_num == 0;
        let ep = &mut self.endpoint_state[index as usize];
        // Classify against the last successful type, or against the
        // type that opened the current transfer while nothing on it has
        // succeeded yet.
        let last = match (ep.last_type, &ep.active) {
            (PID::Malformed, Some(active)) => active.first,
            (last, _) => last,
        };
        let status = transfer_status(control, last, next);

        // A failed or truncated attempt stays with the open transfer,
        // keeping NAKed retries attached, without advancing the
        // expected sequence.
        if ep.active.is_some() && status != Invalid && !successful {
            return ep.append_transaction(transaction_id);
        }

        match status {
            New => {
                ep.close_transfer(false)?;
                ep.active = Some(ActiveTransfer {
                    first: next,
                    ep_tran_offset: ep.transaction_ids.len(),
                    num_transactions: 0,
                });
                let entry = TransferIndexEntry {
                    endpoint_id: ep.id,
                    transfer_id: ep.transfers.len(),
                };
                ep.append_transaction(transaction_id)?;
                if successful {
                    ep.last_type = next;
                }
                self.transfer_index.push(&entry)?;
            }
            Continue => {
                ep.append_transaction(transaction_id)?;
                if successful {
                    ep.last_type = next;
                }
            }
            Done => {
                ep.append_transaction(transaction_id)?;
                ep.close_transfer(true)?;
            }
            Invalid => {
                // The transaction belongs to no transfer.
                ep.close_transfer(false)?;
            }
        }
        Ok(())
    }

    /// Look up an endpoint, creating its record, state and streams the
    /// first time a token addresses it.
    fn endpoint_index(&mut self, address: u8, endpoint_num: u8) -> Result<u16, CaptureError> {
        let key = address as usize * 16 + endpoint_num as usize;
        if let Some(id) = self.endpoint_lookup[key] {
            return Ok(id);
        }
        let id = self.endpoints.push(&Endpoint {
            address,
            endpoint_num,
        })? as u16;
        debug!("new endpoint {address}.{endpoint_num} assigned id {id}");
        self.endpoint_state.push(EndpointState {
            id,
            transfers: Stream::new(format!("transfers_{id}"))?,
            transaction_ids: Stream::new(format!("transaction_ids_{id}"))?,
            last_type: PID::Malformed,
            active: None,
        });
        self.endpoint_lookup[key] = Some(id);
        Ok(id)
    }
}

/// Decode an entire raw capture stream into a [`Capture`].
///
/// Reads length-prefixed packets from `source` until it is exhausted;
/// truncated input terminates the stream without error.
pub fn read_capture<R: Read>(source: R, options: DecoderOptions) -> Result<Capture, CaptureError> {
    let mut reader = FrameReader::new(source);
    let mut decoder = Decoder::new(options)?;
    while let Some((timestamp_ns, bytes)) = reader.next_frame()? {
        decoder.handle_raw_packet(timestamp_ns, bytes)?;
    }
    decoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bytes(pid: PID, address: u8, endpoint_num: u8) -> Vec<u8> {
        let value: u16 = (address as u16 & 0x7F) | ((endpoint_num as u16 & 0xF) << 7);
        vec![pid.into(), value as u8, (value >> 8) as u8]
    }

    fn state(first: PID, last: PID, num_packets: u8) -> TransactionState {
        TransactionState {
            first,
            last,
            num_packets,
            ..TransactionState::default()
        }
    }

    fn status(first: PID, last: PID, next: PID) -> DecodeStatus {
        transaction_status(&DecoderOptions::default(), &state(first, last, 1), next)
    }

    #[test]
    fn tokens_always_open_transactions() {
        use DecodeStatus::*;
        use PID::*;
        for next in [SETUP, IN, OUT, SOF] {
            assert_eq!(status(Malformed, Malformed, next), New);
            assert_eq!(status(IN, DATA0, next), New);
            assert_eq!(status(SETUP, DATA0, next), New);
            assert_eq!(status(SOF, SOF, next), New);
        }
    }

    #[test]
    fn setup_transactions_require_data0_then_ack() {
        use DecodeStatus::*;
        use PID::*;
        assert_eq!(status(SETUP, SETUP, DATA0), Continue);
        assert_eq!(status(SETUP, SETUP, DATA1), Invalid);
        assert_eq!(status(SETUP, DATA0, ACK), Done);
        assert_eq!(status(SETUP, DATA0, NAK), Invalid);
        assert_eq!(status(SETUP, DATA0, STALL), Invalid);
    }

    #[test]
    fn in_transactions_may_complete_without_data() {
        use DecodeStatus::*;
        use PID::*;
        assert_eq!(status(IN, IN, NAK), Done);
        assert_eq!(status(IN, IN, STALL), Done);
        assert_eq!(status(IN, IN, ACK), Invalid);
        assert_eq!(status(IN, IN, DATA0), Continue);
        assert_eq!(status(IN, IN, DATA1), Continue);
        assert_eq!(status(IN, DATA0, ACK), Done);
        assert_eq!(status(IN, DATA1, ACK), Done);
        assert_eq!(status(IN, DATA0, NAK), Invalid);
    }

    #[test]
    fn out_transactions_accept_refused_data() {
        use DecodeStatus::*;
        use PID::*;
        assert_eq!(status(OUT, OUT, NAK), Invalid);
        assert_eq!(status(OUT, OUT, DATA1), Continue);
        assert_eq!(status(OUT, DATA0, ACK), Done);
        assert_eq!(status(OUT, DATA1, NAK), Done);
        assert_eq!(status(OUT, DATA1, STALL), Done);
    }

    #[test]
    fn handshakes_cannot_open_transactions() {
        use DecodeStatus::*;
        use PID::*;
        for next in [ACK, NAK, STALL, DATA0, DATA1, NYET, PING, SPLIT, Malformed] {
            assert_eq!(status(Malformed, Malformed, next), Invalid);
        }
    }

    #[test]
    fn sof_coalescing_is_opt_in() {
        use DecodeStatus::*;
        use PID::*;
        let options = DecoderOptions { coalesce_sofs: true };
        assert_eq!(
            transaction_status(&options, &state(SOF, SOF, 1), SOF),
            Continue
        );
        // The record's packet counter saturates at its limit.
        assert_eq!(
            transaction_status(&options, &state(SOF, SOF, u8::MAX), SOF),
            New
        );
        assert_eq!(
            transaction_status(&DecoderOptions::default(), &state(SOF, SOF, 1), SOF),
            New
        );
    }

    #[test]
    fn transfer_status_control_endpoint() {
        use DecodeStatus::*;
        use PID::*;
        // SETUP restarts a control transfer in any state.
        assert_eq!(transfer_status(true, Malformed, SETUP), New);
        assert_eq!(transfer_status(true, IN, SETUP), New);
        // Data stage in either direction follows setup.
        assert_eq!(transfer_status(true, SETUP, IN), Continue);
        assert_eq!(transfer_status(true, SETUP, OUT), Continue);
        assert_eq!(transfer_status(true, IN, IN), Continue);
        // The opposite direction is the status stage.
        assert_eq!(transfer_status(true, IN, OUT), Done);
        assert_eq!(transfer_status(true, OUT, IN), Done);
        // IN/OUT cannot open a control transfer.
        assert_eq!(transfer_status(true, Malformed, IN), Invalid);
        assert_eq!(transfer_status(true, Malformed, OUT), Invalid);
    }

    #[test]
    fn transfer_status_bulk_endpoint() {
        use DecodeStatus::*;
        use PID::*;
        assert_eq!(transfer_status(false, Malformed, IN), New);
        assert_eq!(transfer_status(false, Malformed, OUT), New);
        assert_eq!(transfer_status(false, IN, IN), Continue);
        assert_eq!(transfer_status(false, OUT, OUT), Continue);
        // Direction changes never happen within a bulk transfer.
        assert_eq!(transfer_status(false, IN, OUT), Invalid);
        assert_eq!(transfer_status(false, OUT, IN), Invalid);
        // SETUP is only meaningful on the control endpoint.
        assert_eq!(transfer_status(false, Malformed, SETUP), Invalid);
        assert_eq!(transfer_status(false, IN, SETUP), Invalid);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut decoder = Decoder::new(DecoderOptions::default()).unwrap();
        // Leave both a transaction and a transfer open.
        decoder
            .handle_raw_packet(0, &token_bytes(PID::OUT, 1, 2))
            .unwrap();
        decoder.handle_raw_packet(1, &[0xC3, 0xAA, 0xBB]).unwrap();

        decoder.flush().unwrap();
        let counts = (
            decoder.packets.len(),
            decoder.transactions.len(),
            decoder.transfer_index.len(),
            decoder.endpoints.len(),
            decoder.data.len(),
        );
        decoder.flush().unwrap();
        assert_eq!(
            counts,
            (
                decoder.packets.len(),
                decoder.transactions.len(),
                decoder.transfer_index.len(),
                decoder.endpoints.len(),
                decoder.data.len(),
            )
        );
    }

    #[test]
    fn endpoints_are_discovered_once() {
        let mut decoder = Decoder::new(DecoderOptions::default()).unwrap();
        assert_eq!(decoder.endpoint_index(5, 1).unwrap(), 0);
        assert_eq!(decoder.endpoint_index(5, 2).unwrap(), 1);
        assert_eq!(decoder.endpoint_index(5, 1).unwrap(), 0);
        assert_eq!(decoder.endpoints.len(), 2);
        assert_eq!(decoder.endpoint_state.len(), 2);
    }
}
