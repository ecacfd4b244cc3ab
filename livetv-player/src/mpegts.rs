//! MPEG transport stream framing (ITU-T H.222.0).
//!
//! Only what the raw-TS adapter needs to decide "this really is a transport
//! stream": packet alignment, header parsing and the program association table.
//! Elementary streams are passed through to the sink untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const PAT_PID: u16 = 0x0000;
pub const NULL_PID: u16 = 0x1FFF;

const PAT_TABLE_ID: u8 = 0x00;
/// transport_stream_id .. last_section_number
const PAT_SECTION_HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum TsError {
    #[error("no sync byte pattern in the first {0} bytes")]
    NoSync(usize),

    #[error("sync lost and not regained within {0} bytes")]
    SyncLost(usize),

    #[error("no program association table in the first {0} bytes")]
    NoPat(usize),

    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("invalid PAT section: {0}")]
    InvalidPat(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    pub adaptation_field_control: u8, //2bits
    pub continuity_counter: u8,       //4bits
}

impl PacketHeader {
    pub fn parse(packet: &[u8]) -> Result<Self, TsError> {
        if packet.len() < 4 {
            return Err(TsError::InvalidPacket("shorter than a header"));
        }
        if packet[0] != SYNC_BYTE {
            return Err(TsError::InvalidPacket("missing sync byte"));
        }

        Ok(Self {
            transport_error: packet[1] & 0x80 != 0,
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]),
            adaptation_field_control: (packet[3] >> 4) & 0x03,
            continuity_counter: packet[3] & 0x0F,
        })
    }

    /// Payload bytes of `packet`, skipping the adaptation field if present.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> Result<Option<&'a [u8]>, TsError> {
        if self.adaptation_field_control & 0x01 == 0 {
            return Ok(None);
        }

        let mut offset = 4;
        if self.adaptation_field_control & 0x02 != 0 {
            let adaptation_len = *packet
                .get(4)
                .ok_or(TsError::InvalidPacket("truncated adaptation field"))?;
            offset += 1 + usize::from(adaptation_len);
        }

        if offset > packet.len() {
            return Err(TsError::InvalidPacket("adaptation field overruns packet"));
        }
        Ok(Some(&packet[offset..]))
    }
}

/// One entry of the program association table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Program {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Offset of the first run of `packets` sync bytes at 188-byte stride.
pub fn find_sync(buf: &[u8], packets: usize) -> Option<usize> {
    let span = packets.saturating_sub(1) * TS_PACKET_SIZE;
    if buf.len() <= span {
        return None;
    }
    (0..buf.len() - span)
        .find(|&offset| (0..packets.max(1)).all(|i| buf[offset + i * TS_PACKET_SIZE] == SYNC_BYTE))
}

/// Parse a PAT section from the payload of a packet with `payload_unit_start` set.
pub fn parse_pat(payload: &[u8]) -> Result<Vec<Program>, TsError> {
    let pointer = usize::from(*payload.first().ok_or(TsError::InvalidPat("empty payload"))?);
    let section = payload
        .get(1 + pointer..)
        .ok_or(TsError::InvalidPat("pointer field overruns payload"))?;

    if section.len() < 3 {
        return Err(TsError::InvalidPat("truncated section header"));
    }
    if section[0] != PAT_TABLE_ID {
        return Err(TsError::InvalidPat("unexpected table id"));
    }
    if section[1] & 0x80 == 0 {
        return Err(TsError::InvalidPat("section syntax indicator not set"));
    }

    let section_length = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
    if section_length < PAT_SECTION_HEADER_LEN + CRC_LEN {
        return Err(TsError::InvalidPat("section too short"));
    }
    let section = section
        .get(..3 + section_length)
        .ok_or(TsError::InvalidPat("section spans multiple packets"))?;

    if crc32_mpeg2(section) != 0 {
        return Err(TsError::InvalidPat("CRC mismatch"));
    }

    let entries = &section[3 + PAT_SECTION_HEADER_LEN..section.len() - CRC_LEN];
    Ok(entries
        .chunks_exact(4)
        .map(|entry| Program {
            program_number: u16::from_be_bytes([entry[0], entry[1]]),
            pmt_pid: (u16::from(entry[2] & 0x1F) << 8) | u16::from(entry[3]),
        })
        // program_number 0 points at the network information table
        .filter(|program| program.program_number != 0)
        .collect())
}

/// CRC-32/MPEG-2. Running it over a section including its CRC yields 0.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Build one transport packet, padding the payload with 0xFF stuffing.
pub fn write_packet(pid: u16, payload_unit_start: bool, continuity_counter: u8, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
    packet.put_u8(SYNC_BYTE);
    packet.put_u16(
        (if payload_unit_start { 0x4000 } else { 0 }) | (pid & 0x1FFF),
    );
    /*payload only*/
    packet.put_u8(0x10 | (continuity_counter & 0x0F));

    let len = payload.len().min(TS_PACKET_SIZE - 4);
    packet.put_slice(&payload[..len]);
    packet.resize(TS_PACKET_SIZE, 0xFF);
    packet.freeze()
}

/// Build a single-packet PAT announcing `programs`.
pub fn write_pat_packet(programs: &[Program], continuity_counter: u8) -> Bytes {
    let mut section = BytesMut::new();
    /*table id*/
    section.put_u8(PAT_TABLE_ID);
    /*section length*/
    let length = programs.len() * 4 + PAT_SECTION_HEADER_LEN + CRC_LEN;
    section.put_u16(0xB000 | (length as u16 & 0x0FFF));
    /*transport_stream_id*/
    section.put_u16(1);
    /*version_number, current_next_indicator*/
    section.put_u8(0xC1);
    /*section_number, last_section_number*/
    section.put_u16(0x0000);
    for program in programs {
        section.put_u16(program.program_number);
        section.put_u16(0xE000 | program.pmt_pid);
    }
    let crc = crc32_mpeg2(&section);
    section.put_u32(crc);

    let mut payload = BytesMut::with_capacity(section.len() + 1);
    /*pointer field*/
    payload.put_u8(0);
    payload.put_slice(&section);
    write_packet(PAT_PID, true, continuity_counter, &payload)
}

/// Incremental demuxer front end.
///
/// Accepts arbitrary network chunks, locks onto packet boundaries and hands
/// back whole aligned packets. Gives up if it cannot lock, or cannot find a PAT,
/// within `probe_bytes`.
pub struct TsDemuxer {
    sync_packets: usize,
    probe_bytes: usize,
    buffer: BytesMut,
    synced: bool,
    /// bytes discarded since sync was last held
    unsynced_bytes: usize,
    total_bytes: usize,
    packets: u64,
    resyncs: u64,
    programs: Option<Vec<Program>>,
}

impl TsDemuxer {
    #[must_use]
    pub fn new(sync_packets: usize, probe_bytes: usize) -> Self {
        Self {
            sync_packets: sync_packets.max(1),
            probe_bytes,
            buffer: BytesMut::new(),
            synced: false,
            unsynced_bytes: 0,
            total_bytes: 0,
            packets: 0,
            resyncs: 0,
            programs: None,
        }
    }

    /// Programs from the first valid PAT, once one has been seen.
    pub fn programs(&self) -> Option<&[Program]> {
        self.programs.as_deref()
    }

    pub const fn packets(&self) -> u64 {
        self.packets
    }

    pub const fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Feed a chunk; returns the aligned packets it completed (possibly empty).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes, TsError> {
        self.buffer.extend_from_slice(chunk);
        self.total_bytes += chunk.len();

        let mut out = BytesMut::new();
        loop {
            if !self.synced {
                if let Some(offset) = find_sync(&self.buffer, self.sync_packets) {
                    self.buffer.advance(offset);
                    self.unsynced_bytes += offset;
                    self.synced = true;
                } else {
                    // keep only bytes that could still start a sync run
                    let window = (self.sync_packets - 1) * TS_PACKET_SIZE;
                    let discard = self.buffer.len().saturating_sub(window);
                    self.buffer.advance(discard);
                    self.unsynced_bytes += discard;
                    break;
                }
            }

            if self.buffer.len() < TS_PACKET_SIZE {
                break;
            }
            if self.buffer[0] != SYNC_BYTE {
                debug!(packets = self.packets, "Transport stream sync lost, rescanning");
                self.synced = false;
                self.resyncs += 1;
                self.unsynced_bytes = 0;
                continue;
            }

            self.unsynced_bytes = 0;
            let packet = self.buffer.split_to(TS_PACKET_SIZE);
            self.packets += 1;
            self.inspect(&packet);
            out.extend_from_slice(&packet);
        }

        if self.unsynced_bytes > self.probe_bytes {
            return Err(if self.packets == 0 {
                TsError::NoSync(self.unsynced_bytes)
            } else {
                TsError::SyncLost(self.unsynced_bytes)
            });
        }
        if self.programs.is_none() && self.total_bytes > self.probe_bytes {
            return Err(TsError::NoPat(self.probe_bytes));
        }

        Ok(out.freeze())
    }

    fn inspect(&mut self, packet: &[u8]) {
        if self.programs.is_some() {
            return;
        }
        let header = match PacketHeader::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("Skipping malformed packet: {e}");
                return;
            }
        };
        if header.transport_error || header.pid != PAT_PID || !header.payload_unit_start {
            return;
        }

        match header.payload(packet).and_then(|payload| match payload {
            Some(payload) => parse_pat(payload),
            None => Err(TsError::InvalidPat("PAT packet without payload")),
        }) {
            Ok(programs) => {
                debug!(programs = programs.len(), "Program association table parsed");
                self.programs = Some(programs);
            }
            Err(e) => debug!("Ignoring PAT packet: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs() -> Vec<Program> {
        vec![
            Program {
                program_number: 1,
                pmt_pid: 0x1000,
            },
            Program {
                program_number: 2,
                pmt_pid: 0x1001,
            },
        ]
    }

    fn stream(packets: usize) -> BytesMut {
        let mut data = BytesMut::new();
        data.extend_from_slice(&write_pat_packet(&programs(), 0));
        for i in 1..packets {
            data.extend_from_slice(&write_packet(0x0100, i == 1, i as u8, b"video"));
        }
        data
    }

    #[test]
    fn test_header_parse() {
        let packet = write_packet(0x0100, true, 7, b"payload");
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.pid, 0x0100);
        assert!(header.payload_unit_start);
        assert!(!header.transport_error);
        assert_eq!(header.continuity_counter, 7);
        assert_eq!(&header.payload(&packet).unwrap().unwrap()[..7], b"payload");

        assert!(PacketHeader::parse(b"\x00\x00\x00\x00").is_err());
        assert!(PacketHeader::parse(b"\x47").is_err());
    }

    #[test]
    fn test_pat_roundtrip_checks_crc() {
        let packet = write_pat_packet(&programs(), 0);
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.pid, PAT_PID);
        let payload = header.payload(&packet).unwrap().unwrap();
        assert_eq!(parse_pat(payload).unwrap(), programs());

        let mut corrupted = packet.to_vec();
        corrupted[10] ^= 0xFF;
        let payload = PacketHeader::parse(&corrupted).unwrap().payload(&corrupted).unwrap().unwrap();
        assert!(matches!(parse_pat(payload), Err(TsError::InvalidPat("CRC mismatch"))));
    }

    #[test]
    fn test_find_sync_requires_consecutive_packets() {
        let mut data = vec![0x47, 0x00, 0x12];
        data.extend_from_slice(&stream(4));
        assert_eq!(find_sync(&data, 3), Some(3));

        // a lone 0x47 in text is not a transport stream
        assert_eq!(find_sync(b"<html>G</html>", 3), None);
    }

    #[test]
    fn test_demuxer_locks_on_and_finds_pat() {
        let mut data = BytesMut::from(&b"junk"[..]);
        data.extend_from_slice(&stream(5));

        let mut demuxer = TsDemuxer::new(3, 64 * 1024);
        let mut delivered = BytesMut::new();
        // feed in awkward chunk sizes
        for chunk in data.chunks(100) {
            delivered.extend_from_slice(&demuxer.push(chunk).unwrap());
        }

        assert_eq!(demuxer.programs().unwrap(), programs().as_slice());
        assert_eq!(demuxer.packets(), 5);
        assert_eq!(delivered.len(), 5 * TS_PACKET_SIZE);
        assert_eq!(delivered[0], SYNC_BYTE);
    }

    #[test]
    fn test_demuxer_rejects_non_ts() {
        let mut demuxer = TsDemuxer::new(3, 4096);
        let html = b"<!DOCTYPE html><html><body>not a stream</body></html>".repeat(100);
        let err = demuxer.push(&html).unwrap_err();
        assert!(matches!(err, TsError::NoSync(_)));
    }

    #[test]
    fn test_demuxer_requires_pat_within_probe_window() {
        let mut demuxer = TsDemuxer::new(3, 188 * 10);
        let mut data = BytesMut::new();
        for i in 0..20u8 {
            data.extend_from_slice(&write_packet(0x0100, false, i, b"no pat here"));
        }
        assert!(matches!(demuxer.push(&data), Err(TsError::NoPat(_))));
    }

    #[test]
    fn test_demuxer_resyncs_after_corruption() {
        let mut demuxer = TsDemuxer::new(3, 64 * 1024);
        demuxer.push(&stream(3)).unwrap();

        let mut data = BytesMut::from(&b"\x00\x01\x02"[..]);
        data.extend_from_slice(&stream(4));
        let out = demuxer.push(&data).unwrap();

        assert_eq!(demuxer.resyncs(), 1);
        assert_eq!(demuxer.packets(), 7);
        assert_eq!(out.len(), 4 * TS_PACKET_SIZE);
    }
}
