//! `hostnvme-identify` — the out-of-scope CLI collaborator this crate's
//! core assumes: accepts a single PCI BDF, brings a controller up, and
//! prints its capabilities and `IDENTIFY` response.
//!
//! Flow grounded in
//! `examples/original_source/example/upcie_nvme_driver.c`: open PCI
//! function → disable → wait-not-ready → admin queue → enable →
//! wait-ready → `IDENTIFY` → print serial/model. Argument handling follows
//! `nvm/src/bin/nvmctl.rs`'s manual parsing with no CLI framework.

use std::process::ExitCode;

use hostnvme::{DmaHeap, HostMemConfig, NvmeController};

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <BDF>");
    eprintln!();
    eprintln!("  BDF   PCI address in dddd:bb:dd.f form, e.g. 0000:05:00.0");
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("hostnvme-identify");

    if args.len() != 2 {
        print_usage(program);
        return ExitCode::from(1);
    }
    let bdf = &args[1];

    match run(bdf) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(bdf: &str) -> hostnvme::Result<()> {
    let config = HostMemConfig::from_env().unwrap_or_else(|e| {
        eprintln!("warning: {e}; falling back to built-in defaults");
        HostMemConfig::default_once().clone()
    });

    let mut heap = DmaHeap::new(128 * 1024 * 1024, &config)?;

    let mut ctrlr = NvmeController::open(bdf, &mut heap)?;
    println!("# opened {bdf}");
    println!(
        "CAP: mqes={} dstrd={} to_ms={} css={:#x}",
        ctrlr.cap().mqes(),
        ctrlr.cap().dstrd(),
        ctrlr.timeout_ms(),
        ctrlr.cap().css()
    );
    println!("CSTS: rdy={}", ctrlr.csts().rdy());

    let id = ctrlr.identify_controller()?;
    println!("SN('{}')", id.serial_number());
    println!("MN('{}')", id.model_number());

    ctrlr.close();
    Ok(())
}
