use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_lite::future::block_on;
use log::{debug, info};
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer, TransferError};
use nusb::Interface;
use structopt::StructOpt;

const VID: u16 = 0x1d50;
const PID: u16 = 0x615b;
const ENDPOINT: u8 = 0x81;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Streams raw capture data from an attached LUNA USB analyzer to standard output until interrupted."
)]
struct Opt {
    #[structopt(
        long = "--transfers",
        default_value = "4",
        help = "Number of bulk transfers kept in flight."
    )]
    transfers: usize,

    #[structopt(
        long = "--transfer-size",
        default_value = "262144",
        help = "Size of each bulk transfer in bytes."
    )]
    transfer_size: usize,
}

fn check(status: &Result<(), TransferError>, what: &str) -> Result<()> {
    match status {
        Ok(()) => Ok(()),
        Err(err) => bail!("{what}: {err}"),
    }
}

fn set_capture_state(interface: &Interface, enabled: bool) -> Result<()> {
    let control = Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request: 1, // set state
        value: enabled as u16,
        index: 0,
    };
    interface
        .control_out_blocking(control, &[], Duration::from_secs(1))
        .with_context(|| {
            format!(
                "failed to {} capture",
                if enabled { "enable" } else { "disable" }
            )
        })?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let device_info = nusb::list_devices()
        .context("failed to list USB devices")?
        .find(|dev| dev.vendor_id() == VID && dev.product_id() == PID)
        .context("no LUNA analyzer found")?;
    let device = device_info.open().context("failed to open device")?;
    let interface = device
        .claim_interface(0)
        .context("failed to claim interface 0")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true, Ordering::Relaxed))
            .context("failed to set interrupt handler")?;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    // The device may still hold data from an earlier run: make sure
    // capture is stopped, then read until every transfer in flight
    // comes back empty. Drained data is discarded.
    set_capture_state(&interface, false)?;
    let mut queue = interface.bulk_in_queue(ENDPOINT);
    for _ in 0..opt.transfers {
        queue.submit(RequestBuffer::new(opt.transfer_size));
    }
    let mut empty = 0;
    while empty < opt.transfers {
        let completion = block_on(queue.next_complete());
        check(&completion.status, "drain transfer failed")?;
        if completion.data.is_empty() {
            empty += 1;
        } else {
            empty = 0;
        }
        queue.submit(RequestBuffer::reuse(completion.data, opt.transfer_size));
    }

    set_capture_state(&interface, true)?;
    info!("capture enabled");

    while !interrupted.load(Ordering::Relaxed) {
        let completion = block_on(queue.next_complete());
        check(&completion.status, "capture transfer failed")?;
        out.write_all(&completion.data)
            .context("failed to write to standard output")?;
        debug!("received {} bytes", completion.data.len());
        queue.submit(RequestBuffer::reuse(completion.data, opt.transfer_size));
    }

    set_capture_state(&interface, false)?;
    info!("capture disabled, draining transfers");

    // Let the transfers already submitted run to completion, keeping
    // whatever data they carry.
    while queue.pending() > 0 {
        let completion = block_on(queue.next_complete());
        if completion.status.is_ok() {
            out.write_all(&completion.data)
                .context("failed to write to standard output")?;
        }
    }
    out.flush().context("failed to flush standard output")?;

    Ok(())
}
