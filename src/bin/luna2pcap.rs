use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lunacap::FrameReader;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;

/// LINKTYPE_USB_2_0: raw USB 2.0 packets, starting at the PID.
const LINKTYPE_USB_2_0: u32 = 288;

fn main() -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    let header = PcapHeader {
        snaplen: u16::MAX as u32,
        datalink: DataLink::from(LINKTYPE_USB_2_0),
        ..Default::default()
    };
    let mut writer =
        PcapWriter::with_header(stdout.lock(), header).context("failed to write pcap header")?;

    let mut reader = FrameReader::new(stdin.lock());
    while let Some((_, bytes)) = reader
        .next_frame()
        .context("failed to read capture stream")?
    {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the Unix epoch")?;
        writer
            .write_packet(&PcapPacket::new(timestamp, bytes.len() as u32, bytes))
            .context("failed to write packet")?;
    }

    Ok(())
}
