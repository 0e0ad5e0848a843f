use std::fs::File;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use lunacap::{read_capture, Capture, DecoderOptions};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decodes a raw LUNA capture stream into packets, transactions and transfers, and prints a summary of the result."
)]
struct Opt {
    #[structopt(
        long = "--coalesce-sofs",
        help = "Merge runs of consecutive SOF packets into single transactions."
    )]
    coalesce_sofs: bool,

    #[structopt(
        name = "FILE",
        parse(from_os_str),
        help = "Raw capture input file; standard input if omitted."
    )]
    file: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let options = DecoderOptions {
        coalesce_sofs: opt.coalesce_sofs,
    };

    let capture = match &opt.file {
        Some(path) => {
            let file = File::open(path).context("failed to open file")?;
            read_capture(file, options)
        }
        None => read_capture(io::stdin().lock(), options),
    }
    .context("failed to decode capture")?;

    let name = match &opt.file {
        Some(path) => path.display().to_string(),
        None => "<stdin>".to_string(),
    };
    print_summary(&name, &capture);

    Ok(())
}

fn print_summary(name: &str, capture: &Capture) {
    println!(
        "{}: {} packets, {} transactions, {} endpoints, {} transfers, {} data bytes",
        name,
        capture.num_packets(),
        capture.num_transactions(),
        capture.num_endpoints(),
        capture.num_transfers(),
        capture.data_size(),
    );
    for (endpoint, traffic) in capture.endpoints.iter().zip(&capture.endpoint_traffic) {
        println!(
            "{}.{}: {} transfers, {} transactions",
            endpoint.address,
            endpoint.endpoint_num,
            traffic.transfers.len(),
            traffic.transaction_ids.len(),
        );
    }
}
